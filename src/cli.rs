use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "devhost", version, about = "Supervise local dev-server processes")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Use a specific project store file
    #[arg(long = "store", global = true, env = "DEVHOST_STORE")]
    pub store: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Register a project with the store
    Add {
        /// Project name (sanitized to a directory-safe slug)
        name: String,
        /// Project directory (defaults to ./<name>)
        #[arg(long)]
        path: Option<PathBuf>,
        /// Create the project directory instead of requiring it to exist
        #[arg(long)]
        create: bool,
        /// Project type label shown in listings
        #[arg(long = "type", value_name = "TYPE", default_value = "node")]
        kind: String,
        /// Preferred dev-server port (validated; a taken port is an error)
        #[arg(long)]
        port: Option<u16>,
        /// Dev-server command line
        #[arg(long, default_value = "npm run dev")]
        script: String,
        /// Environment variables for the dev server
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
    },
    /// Start dev servers and stream their logs until Ctrl+C
    Start {
        /// Projects to start by name or id (all registered if empty)
        projects: Vec<String>,
    },
    /// Install a project's dependencies
    Install {
        /// Project name or id
        project: String,
    },
    /// List registered projects
    Ps,
    /// Show one project's status
    Status {
        /// Project name or id
        project: String,
    },
    /// Print the tail of a project's log file
    Logs {
        /// Project name or id
        project: String,
        /// Number of trailing lines to print
        #[arg(long, default_value_t = 100)]
        tail: usize,
    },
    /// Remove a project from the store
    Remove {
        /// Project name or id
        project: String,
        /// Also delete the project directory
        #[arg(long)]
        files: bool,
        /// Remove even when the persisted status says running
        #[arg(long)]
        force: bool,
    },
}
