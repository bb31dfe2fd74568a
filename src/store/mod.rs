pub mod model;

pub use model::{Project, ProjectPatch, ProjectStatus, Status};

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("encoding project records: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Durable record of project metadata and last-known status, backed by a
/// single JSON file. Writes are atomic (tmp + rename) under an exclusive
/// lock file, so a concurrent reader never observes a torn file.
///
/// The supervisor is the only writer of the `status` field; registration
/// and deletion flows own the rest.
pub struct ProjectStore {
    path: PathBuf,
    projects: Mutex<BTreeMap<String, Project>>,
}

impl ProjectStore {
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("devhost")
            .join("projects.json")
    }

    /// Open the store, loading existing records. A missing file is an empty
    /// store; any other failure is fatal to the session, since no operation
    /// can proceed without persisted project state.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let projects = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map_err(|source| StoreError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.clone(),
                    source,
                })
            }
        };
        debug!(path = %path.display(), "project store opened");
        Ok(Self {
            path,
            projects: Mutex::new(projects),
        })
    }

    pub fn get(&self, id: &str) -> Option<Project> {
        self.projects.lock().unwrap().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Project> {
        self.projects.lock().unwrap().values().cloned().collect()
    }

    /// Look a project up by exact id, exact name, or unambiguous id prefix.
    pub fn find(&self, selector: &str) -> Option<Project> {
        let projects = self.projects.lock().unwrap();
        if let Some(p) = projects.get(selector) {
            return Some(p.clone());
        }
        if let Some(p) = projects.values().find(|p| p.name == selector) {
            return Some(p.clone());
        }
        let mut matches = projects.values().filter(|p| p.id.starts_with(selector));
        match (matches.next(), matches.next()) {
            (Some(p), None) => Some(p.clone()),
            _ => None,
        }
    }

    pub fn insert(&self, project: Project) -> Result<(), StoreError> {
        let mut projects = self.projects.lock().unwrap();
        projects.insert(project.id.clone(), project);
        self.persist(&projects)
    }

    /// Apply a partial update and bump `updated_at`. Returns the updated
    /// record, or `None` when the id is unknown.
    pub fn update(&self, id: &str, patch: ProjectPatch) -> Result<Option<Project>, StoreError> {
        let mut projects = self.projects.lock().unwrap();
        let Some(project) = projects.get_mut(id) else {
            return Ok(None);
        };
        if let Some(name) = patch.name {
            project.name = name;
        }
        if let Some(status) = patch.status {
            project.status = status;
        }
        if let Some(script) = patch.start_script {
            project.start_script = script;
        }
        if let Some(env) = patch.env {
            project.env = env;
        }
        if let Some(meta) = patch.meta {
            project.meta = meta;
        }
        project.updated_at = Utc::now();
        let updated = project.clone();
        self.persist(&projects)?;
        Ok(Some(updated))
    }

    /// Remove a record. Returns whether anything was deleted.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut projects = self.projects.lock().unwrap();
        let removed = projects.remove(id).is_some();
        if removed {
            self.persist(&projects)?;
        }
        Ok(removed)
    }

    fn persist(&self, projects: &BTreeMap<String, Project>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let _lock = self.lock_file();

        let content = serde_json::to_string_pretty(projects).map_err(StoreError::Encode)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, &content).map_err(|source| StoreError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Exclusive flock on a sibling lock file; released on drop. Guards the
    /// read-modify-write against other devhost processes on the same store.
    fn lock_file(&self) -> Option<fs::File> {
        let lock_path = self.path.with_extension("json.lock");
        let file = fs::File::create(&lock_path).ok()?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: fd is valid for the lifetime of `file`
            unsafe {
                libc::flock(file.as_raw_fd(), libc::LOCK_EX);
            }
        }

        Some(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;
    use tempfile::tempdir;

    fn sample(id: &str, name: &str) -> Project {
        let now = Utc::now();
        Project {
            id: id.into(),
            name: name.into(),
            kind: "express".into(),
            path: PathBuf::from("/srv").join(name),
            port: 3000,
            status: Status::Stopped,
            start_script: "npm run dev".into(),
            env: Map::new(),
            meta: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn open_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = ProjectStore::open(dir.path().join("projects.json")).unwrap();
        assert!(store.list().is_empty());
    }

    #[test]
    fn insert_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("projects.json");

        let store = ProjectStore::open(path.clone()).unwrap();
        store.insert(sample("p1", "api")).unwrap();

        let reopened = ProjectStore::open(path).unwrap();
        let loaded = reopened.get("p1").unwrap();
        assert_eq!(loaded.name, "api");
        assert_eq!(loaded.status, Status::Stopped);
    }

    #[test]
    fn update_bumps_updated_at() {
        let dir = tempdir().unwrap();
        let store = ProjectStore::open(dir.path().join("projects.json")).unwrap();
        store.insert(sample("p1", "api")).unwrap();

        let before = store.get("p1").unwrap().updated_at;
        std::thread::sleep(std::time::Duration::from_millis(5));

        let updated = store
            .update(
                "p1",
                ProjectPatch {
                    status: Some(Status::Running),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, Status::Running);
        assert!(updated.updated_at > before);
    }

    #[test]
    fn update_unknown_id_is_none() {
        let dir = tempdir().unwrap();
        let store = ProjectStore::open(dir.path().join("projects.json")).unwrap();
        let result = store.update("nope", ProjectPatch::default()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn delete_removes_record() {
        let dir = tempdir().unwrap();
        let store = ProjectStore::open(dir.path().join("projects.json")).unwrap();
        store.insert(sample("p1", "api")).unwrap();

        assert!(store.delete("p1").unwrap());
        assert!(store.get("p1").is_none());
        assert!(!store.delete("p1").unwrap());
    }

    #[test]
    fn find_by_name_and_prefix() {
        let dir = tempdir().unwrap();
        let store = ProjectStore::open(dir.path().join("projects.json")).unwrap();
        store.insert(sample("abc123", "api")).unwrap();
        store.insert(sample("abd456", "web")).unwrap();

        assert_eq!(store.find("api").unwrap().id, "abc123");
        assert_eq!(store.find("abd").unwrap().id, "abd456");
        // Ambiguous prefix matches nothing.
        assert!(store.find("ab").is_none());
    }
}
