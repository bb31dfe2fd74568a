use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::store::{ProjectStore, Status};

pub fn run(store_path: PathBuf, selector: &str, files: bool, force: bool) -> Result<()> {
    let store = ProjectStore::open(store_path).context("opening project store")?;
    let Some(project) = store.find(selector) else {
        bail!("unknown project '{}'", selector);
    };

    if project.status == Status::Running && !force {
        bail!(
            "'{}' is marked running; stop it first or pass --force",
            project.name
        );
    }

    if files && project.path.exists() {
        std::fs::remove_dir_all(&project.path)
            .with_context(|| format!("deleting {}", project.path.display()))?;
    }

    store.delete(&project.id).context("updating project store")?;
    println!("Removed '{}'", project.name);
    Ok(())
}
