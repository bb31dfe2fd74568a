use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::store::Status;

/// Which output pipe a log line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    /// Tag used in the per-project log file.
    pub fn tag(self) -> &'static str {
        match self {
            Stream::Stdout => "STDOUT",
            Stream::Stderr => "STDERR",
        }
    }
}

/// Outward-facing supervisor events. The supervisor takes the sending half
/// at construction time; subscribers (terminal writer, IPC bridge) attach
/// via `subscribe()` and can never rebind the supervisor's internals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    LogLine {
        project_id: String,
        timestamp: DateTime<Utc>,
        stream: Stream,
        line: String,
    },
    StatusChanged {
        project_id: String,
        status: Status,
    },
}

pub type EventSender = broadcast::Sender<Event>;
pub type EventReceiver = broadcast::Receiver<Event>;

pub fn channel() -> (EventSender, EventReceiver) {
    broadcast::channel(4096)
}
