use std::path::{Component, Path, PathBuf};

use crate::errors::{Error, Result};

/// Runtime and package-manager binaries the runner may execute directly.
pub const ALLOWED_COMMANDS: &[&str] = &["node", "npm", "npx", "yarn", "pnpm", "bun", "bunx"];

/// Locations of the JavaScript toolchain binaries.
///
/// A packaged desktop build ships its own runtime; `DEVHOST_TOOLCHAIN_DIR`
/// points at its bin directory. Without it the bare names are left to
/// `$PATH` resolution.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub node: PathBuf,
    pub npm: PathBuf,
    pub npx: PathBuf,
}

impl Toolchain {
    pub fn from_env() -> Self {
        match std::env::var_os("DEVHOST_TOOLCHAIN_DIR") {
            Some(dir) => Self::bundled(Path::new(&dir)),
            None => Self::system(),
        }
    }

    pub fn system() -> Self {
        Self {
            node: "node".into(),
            npm: "npm".into(),
            npx: "npx".into(),
        }
    }

    pub fn bundled(bin_dir: &Path) -> Self {
        let ext = if cfg!(windows) { ".exe" } else { "" };
        Self {
            node: bin_dir.join(format!("node{ext}")),
            npm: bin_dir.join(format!("npm{ext}")),
            npx: bin_dir.join(format!("npx{ext}")),
        }
    }

    /// Map a recognized runtime/package-manager name to its binary.
    fn locate(&self, name: &str) -> Option<PathBuf> {
        match name {
            "node" => Some(self.node.clone()),
            "npm" => Some(self.npm.clone()),
            "npx" => Some(self.npx.clone()),
            "yarn" | "pnpm" | "bun" | "bunx" => Some(PathBuf::from(name)),
            _ => None,
        }
    }
}

/// A start script resolved to an executable and argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Split a start script on whitespace and resolve the leading token.
///
/// Recognized runtime names map to located binaries; any other token is
/// treated as a package.json script and wrapped as `npm run <token>`.
/// Splitting is plain whitespace: arguments with embedded spaces are not
/// supported and quoting is not interpreted.
pub fn resolve_start_script(script: &str, toolchain: &Toolchain) -> Result<ResolvedCommand> {
    let mut tokens = script.split_whitespace();
    let head = tokens
        .next()
        .ok_or_else(|| Error::Validation("start script is empty".into()))?;
    let rest: Vec<String> = tokens.map(str::to_string).collect();

    match toolchain.locate(head) {
        Some(program) => Ok(ResolvedCommand {
            program,
            args: rest,
        }),
        None => {
            let mut args = vec!["run".to_string(), head.to_string()];
            args.extend(rest);
            Ok(ResolvedCommand {
                program: toolchain.npm.clone(),
                args,
            })
        }
    }
}

/// Allow-list gate checked before anything is spawned: the base name
/// (extension stripped) must be a known runtime/package-manager binary, or
/// the path must point into dependency tooling (`node_modules`).
pub fn command_allowed(program: &Path) -> bool {
    let base = program
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    ALLOWED_COMMANDS.contains(&base)
        || program
            .components()
            .any(|c| matches!(c, Component::Normal(n) if n == "node_modules"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundled() -> Toolchain {
        Toolchain::bundled(Path::new("/opt/devhost/bin"))
    }

    #[test]
    fn node_script_maps_to_bundled_node() {
        let cmd = resolve_start_script("node server.js --inspect", &bundled()).unwrap();
        assert_eq!(cmd.program, bundled().node);
        assert_eq!(cmd.args, vec!["server.js", "--inspect"]);
    }

    #[test]
    fn npm_script_keeps_args() {
        let cmd = resolve_start_script("npm run dev", &bundled()).unwrap();
        assert_eq!(cmd.program, bundled().npm);
        assert_eq!(cmd.args, vec!["run", "dev"]);
    }

    #[test]
    fn unknown_token_wraps_as_npm_run() {
        let cmd = resolve_start_script("next dev --turbo", &bundled()).unwrap();
        assert_eq!(cmd.program, bundled().npm);
        assert_eq!(cmd.args, vec!["run", "next", "dev", "--turbo"]);
    }

    #[test]
    fn other_package_managers_resolve_by_name() {
        let cmd = resolve_start_script("pnpm dev", &bundled()).unwrap();
        assert_eq!(cmd.program, PathBuf::from("pnpm"));
        assert_eq!(cmd.args, vec!["dev"]);
    }

    #[test]
    fn empty_script_is_a_validation_error() {
        let err = resolve_start_script("   ", &bundled()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn allow_list_accepts_known_runtimes() {
        assert!(command_allowed(Path::new("node")));
        assert!(command_allowed(Path::new("/opt/devhost/bin/npm")));
        assert!(command_allowed(Path::new("node.exe")));
    }

    #[test]
    fn allow_list_accepts_dependency_tooling() {
        assert!(command_allowed(Path::new(
            "/srv/web/node_modules/.bin/next"
        )));
    }

    #[test]
    fn allow_list_rejects_arbitrary_binaries() {
        assert!(!command_allowed(Path::new("/bin/sh")));
        assert!(!command_allowed(Path::new("rm")));
        assert!(!command_allowed(Path::new("/usr/bin/python3")));
    }
}
