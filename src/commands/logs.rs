use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::store::ProjectStore;

pub fn run(store_path: PathBuf, selector: &str, tail: usize) -> Result<()> {
    let store = ProjectStore::open(store_path).context("opening project store")?;
    let Some(project) = store.find(selector) else {
        bail!("unknown project '{}'", selector);
    };

    let log_file = project.log_file();
    let content = std::fs::read_to_string(&log_file)
        .with_context(|| format!("no log file at {}", log_file.display()))?;

    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(tail);
    for line in &lines[start..] {
        println!("{}", line);
    }
    Ok(())
}
