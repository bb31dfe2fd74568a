use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::store::ProjectStore;

pub fn run(store_path: PathBuf) -> Result<()> {
    let store = ProjectStore::open(store_path).context("opening project store")?;
    let projects = store.list();

    if projects.is_empty() {
        println!("No projects registered.");
        println!("Run `devhost add` to register one.");
        return Ok(());
    }

    println!(
        "  {:<20} {:<10} {:<6} {:<8} UPDATED",
        "NAME", "TYPE", "PORT", "STATUS"
    );
    println!("  {}", "-".repeat(66));

    for project in &projects {
        println!(
            "  {:<20} {:<10} {:<6} {:<8} {}",
            project.name,
            project.kind,
            project.port,
            project.status.as_str(),
            project.updated_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    println!();
    Ok(())
}

pub fn run_status(store_path: PathBuf, selector: &str) -> Result<()> {
    let store = ProjectStore::open(store_path).context("opening project store")?;
    let Some(project) = store.find(selector) else {
        bail!("unknown project '{}'", selector);
    };

    println!("  id:      {}", project.id);
    println!("  name:    {}", project.name);
    println!("  type:    {}", project.kind);
    println!("  path:    {}", project.path.display());
    println!("  port:    {}", project.port);
    println!("  status:  {}", project.status);
    println!("  log:     {}", project.log_file().display());
    Ok(())
}
