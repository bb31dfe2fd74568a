#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use devhost::events::{self, Event, EventReceiver, EventSender};
use devhost::store::{Project, ProjectStore, Status};
use devhost::supervisor::resolve::Toolchain;
use devhost::supervisor::ProcessSupervisor;

/// A supervisor wired to a temp store and a fake toolchain directory.
/// Tests install shell scripts as `node`/`npm` stand-ins per scenario.
pub struct Rig {
    pub dir: TempDir,
    pub store: Arc<ProjectStore>,
    pub supervisor: ProcessSupervisor,
    pub events_tx: EventSender,
}

impl Rig {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ProjectStore::open(dir.path().join("projects.json")).unwrap());
        let (events_tx, _) = events::channel();
        let toolchain = Toolchain::bundled(&dir.path().join("toolchain"));
        let supervisor = ProcessSupervisor::new(store.clone(), toolchain, events_tx.clone());
        Self {
            dir,
            store,
            supervisor,
            events_tx,
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events_tx.subscribe()
    }

    /// Install a fake toolchain binary backed by a shell script.
    #[cfg(unix)]
    pub fn install_tool(&self, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let bin_dir = self.dir.path().join("toolchain");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let path = bin_dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// Register a project whose working directory lives under the rig.
    pub fn register(&self, id: &str, script: &str, port: u16) -> Project {
        let path = self.dir.path().join(id);
        std::fs::create_dir_all(&path).unwrap();
        let now = Utc::now();
        let project = Project {
            id: id.into(),
            name: id.into(),
            kind: "node".into(),
            path,
            port,
            status: Status::Stopped,
            start_script: script.into(),
            env: BTreeMap::new(),
            meta: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        };
        self.store.insert(project.clone()).unwrap();
        project
    }
}

pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Block (with a generous timeout) until a status-changed event for `id`
/// carrying `status` arrives.
pub async fn wait_for_status(rx: &mut EventReceiver, id: &str, status: Status) {
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            match rx.recv().await {
                Ok(Event::StatusChanged {
                    project_id,
                    status: got,
                }) if project_id == id && got == status => break,
                Ok(_) => continue,
                Err(e) => panic!("event channel closed while waiting for {status:?}: {e}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for status {status:?}"))
}

/// Block until a log line containing `needle` arrives.
pub async fn wait_for_line(rx: &mut EventReceiver, needle: &str) {
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            match rx.recv().await {
                Ok(Event::LogLine { line, .. }) if line.contains(needle) => break,
                Ok(_) => continue,
                Err(e) => panic!("event channel closed while waiting for {needle:?}: {e}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for log line {needle:?}"))
}

/// Drain whatever is immediately available on the receiver.
pub fn drain(rx: &mut EventReceiver) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
