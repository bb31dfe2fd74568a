use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last-known lifecycle state, persisted per project. `running` in the
/// store implies a live run-state entry in the supervisor, modulo the
/// spawn-initiation and crash-without-cleanup windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Stopped,
    Running,
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Stopped => "stopped",
            Status::Running => "running",
            Status::Error => "error",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A provisioned local workspace with an associated dev-server command,
/// port, and status. `port` is assigned at registration and immutable
/// thereafter; starts re-validate it instead of reallocating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub path: PathBuf,
    pub port: u16,
    pub status: Status,
    pub start_script: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn log_dir(&self) -> PathBuf {
        self.path.join(".devhost").join("logs")
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir().join(format!("{}.log", self.id))
    }
}

/// Fields that [`super::ProjectStore::update`] may change; `None` leaves a
/// field untouched. Every applied patch bumps `updated_at`.
#[derive(Debug, Clone, Default)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub status: Option<Status>,
    pub start_script: Option<String>,
    pub env: Option<BTreeMap<String, String>>,
    pub meta: Option<BTreeMap<String, serde_json::Value>>,
}

/// Snapshot returned by `ProcessSupervisor::status`. `uptime` is present
/// exactly when a live run-state entry exists.
#[derive(Debug, Clone)]
pub struct ProjectStatus {
    pub id: String,
    pub status: Status,
    pub port: u16,
    pub uptime: Option<Duration>,
}
