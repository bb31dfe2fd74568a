use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use uuid::Uuid;

use crate::errors::Conflict;
use crate::store::{Project, ProjectStore, Status};
use crate::supervisor::ports;

/// Port tried when the caller does not ask for one.
const DEFAULT_PORT: u16 = 3000;

pub struct AddOptions {
    pub name: String,
    pub kind: String,
    pub path: Option<PathBuf>,
    pub create: bool,
    pub port: Option<u16>,
    pub script: String,
    pub env: Vec<String>,
}

pub fn run(store_path: PathBuf, opts: AddOptions) -> Result<()> {
    let store = ProjectStore::open(store_path).context("opening project store")?;

    let name = sanitize_name(&opts.name);
    if name.is_empty() {
        bail!("invalid project name: {:?}", opts.name);
    }
    if store.find(&name).is_some() {
        bail!("a project named '{}' is already registered", name);
    }

    let path = opts.path.unwrap_or_else(|| PathBuf::from(&name));
    let path = if opts.create {
        if path.exists() {
            return Err(Conflict::DestinationExists(path).into());
        }
        std::fs::create_dir_all(&path)
            .with_context(|| format!("creating {}", path.display()))?;
        path.canonicalize()?
    } else {
        if !path.is_dir() {
            bail!(
                "project directory not found: {} (pass --create to make it)",
                path.display()
            );
        }
        path.canonicalize()?
    };

    // Allocate the initial port. An explicitly requested port that turns
    // out taken is an error carrying the suggestion; otherwise the
    // allocator's pick is accepted.
    let requested = opts.port.unwrap_or(DEFAULT_PORT);
    let port = ports::allocate(requested);
    if opts.port.is_some() && port != requested {
        return Err(Conflict::PortUnavailable {
            requested,
            suggested: port,
        }
        .into());
    }

    let env = parse_env_pairs(&opts.env)?;
    let now = Utc::now();
    let project = Project {
        id: Uuid::new_v4().to_string(),
        name: name.clone(),
        kind: opts.kind,
        path,
        port,
        status: Status::Stopped,
        start_script: opts.script,
        env,
        meta: BTreeMap::new(),
        created_at: now,
        updated_at: now,
    };
    let id = project.id.clone();
    store.insert(project).context("saving project record")?;

    println!("Registered '{}' on port {} (id {})", name, port, id);
    Ok(())
}

/// Reduce a user-supplied name to a directory-safe slug: lowercase ascii
/// alphanumerics, dashes and underscores, at most 50 chars.
fn sanitize_name(name: &str) -> String {
    let mut slug: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    slug.truncate(50);
    slug.trim_matches('-').to_string()
}

fn parse_env_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid --env '{}': expected KEY=VALUE", pair);
        };
        if key.is_empty() {
            bail!("invalid --env '{}': empty key", pair);
        }
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}
