use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use tracing::{error, info};

use devhost::cli::{Cli, Commands};
use devhost::commands::{self, add::AddOptions};
use devhost::events;
use devhost::store::{Project, ProjectStore};
use devhost::supervisor::resolve::Toolchain;
use devhost::supervisor::ProcessSupervisor;
use devhost::ui::logs::EventPrinter;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with env-filter support.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let store_path = cli.global.store.unwrap_or_else(ProjectStore::default_path);

    let result = match cli.command {
        Commands::Add {
            name,
            path,
            create,
            kind,
            port,
            script,
            env,
        } => commands::add::run(
            store_path,
            AddOptions {
                name,
                kind,
                path,
                create,
                port,
                script,
                env,
            },
        ),
        Commands::Start { projects } => run_start(store_path, projects).await,
        Commands::Install { project } => run_install(store_path, &project).await,
        Commands::Ps => commands::ps::run(store_path),
        Commands::Status { project } => commands::ps::run_status(store_path, &project),
        Commands::Logs { project, tail } => commands::logs::run(store_path, &project, tail),
        Commands::Remove {
            project,
            files,
            force,
        } => commands::remove::run(store_path, &project, files, force),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Foreground session: start the selected projects, stream their output
/// until Ctrl+C, then stop everything through the supervisor's shutdown
/// path.
async fn run_start(store_path: PathBuf, selectors: Vec<String>) -> anyhow::Result<()> {
    let store = Arc::new(ProjectStore::open(store_path).context("opening project store")?);

    let projects: Vec<Project> = if selectors.is_empty() {
        store.list()
    } else {
        selectors
            .iter()
            .map(|s| {
                store
                    .find(s)
                    .ok_or_else(|| anyhow!("unknown project '{}'", s))
            })
            .collect::<anyhow::Result<_>>()?
    };
    if projects.is_empty() {
        bail!("no projects to start; register one with `devhost add`");
    }

    let (events_tx, events_rx) = events::channel();
    let names: BTreeMap<String, String> = store
        .list()
        .into_iter()
        .map(|p| (p.id, p.name))
        .collect();
    let printer = tokio::spawn(EventPrinter::new(events_rx, names).run());

    let supervisor = ProcessSupervisor::new(store, Toolchain::from_env(), events_tx.clone());

    let mut started = 0usize;
    for project in &projects {
        match supervisor.start(&project.id, None).await {
            Ok(handle) => {
                started += 1;
                info!(
                    project = %handle.name,
                    port = handle.port,
                    log = %handle.log_file.display(),
                    "dev server started",
                );
            }
            Err(e) => {
                error!(project = %project.name, error = %e, "start failed");
            }
        }
    }
    if started == 0 {
        bail!("no project could be started");
    }

    tokio::signal::ctrl_c().await.ok();
    eprintln!("\nShutting down...");
    supervisor.shutdown().await;

    // Close the event channel so the printer drains and exits.
    drop(supervisor);
    drop(events_tx);
    let _ = printer.await;
    Ok(())
}

async fn run_install(store_path: PathBuf, selector: &str) -> anyhow::Result<()> {
    let store = Arc::new(ProjectStore::open(store_path).context("opening project store")?);
    let project = store
        .find(selector)
        .ok_or_else(|| anyhow!("unknown project '{}'", selector))?;

    let (events_tx, events_rx) = events::channel();
    let names = BTreeMap::from([(project.id.clone(), project.name.clone())]);
    let printer = tokio::spawn(EventPrinter::new(events_rx, names).run());

    let supervisor = ProcessSupervisor::new(store, Toolchain::from_env(), events_tx.clone());
    let outcome = supervisor.install_dependencies(&project.id).await;

    drop(supervisor);
    drop(events_tx);
    let _ = printer.await;

    let outcome = outcome.with_context(|| format!("installing dependencies for '{}'", project.name))?;
    if !outcome.success() {
        bail!(
            "install exited with code {:?} for '{}'",
            outcome.code,
            project.name
        );
    }
    println!("Dependencies installed for '{}'", project.name);
    Ok(())
}
