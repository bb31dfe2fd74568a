pub mod ports;
pub mod resolve;
pub mod runner;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{Conflict, Error, ExecutionError, Result};
use crate::events::{Event, EventSender};
use crate::store::{Project, ProjectPatch, ProjectStatus, ProjectStore, Status};

use resolve::Toolchain;
use runner::{CommandRunner, RunOutcome, RunnerOptions};

/// Default budget for one-shot dependency installs.
pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// In-memory bookkeeping for one live supervised process. At most one entry
/// exists per project id at any instant.
struct RunState {
    cancel: CancellationToken,
    started_at: Instant,
    /// Set by an explicit stop before cancellation so teardown records
    /// `stopped` rather than `error`.
    stopping: Arc<AtomicBool>,
    /// Flips to true once the monitor task has finished teardown.
    done: watch::Receiver<bool>,
}

/// Handle info returned by a successful start.
#[derive(Debug, Clone)]
pub struct StartedProject {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub log_file: PathBuf,
    pub started_at: DateTime<Utc>,
}

struct Inner {
    store: Arc<ProjectStore>,
    toolchain: Toolchain,
    events: EventSender,
    states: Mutex<HashMap<String, RunState>>,
    /// Per-project-id operation locks: start/stop/restart/install on the
    /// same id are serialized; different ids proceed independently.
    op_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    install_timeout: Duration,
}

/// Orchestrates one supervised dev-server process per project id: starts,
/// stops, restarts, reports status, runs dependency installs, and is the
/// single writer of the persisted `status` field.
///
/// The run-state map is owned exclusively by the supervisor; external
/// layers observe it only through [`status`](Self::status). Event
/// consumers attach to the broadcast channel supplied at construction.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(store: Arc<ProjectStore>, toolchain: Toolchain, events: EventSender) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                toolchain,
                events,
                states: Mutex::new(HashMap::new()),
                op_locks: Mutex::new(HashMap::new()),
                install_timeout: INSTALL_TIMEOUT,
            }),
        }
    }

    /// Start the project's dev server.
    ///
    /// Returns once the spawn is issued, not when the process exits.
    /// Spawn-level OS errors surface asynchronously through the same
    /// teardown as a crash. The persisted port is re-validated first; a
    /// mismatch is a conflict carrying the suggested alternative — an
    /// existing project is never silently rebound to a different port.
    pub async fn start(
        &self,
        project_id: &str,
        env_overrides: Option<BTreeMap<String, String>>,
    ) -> Result<StartedProject> {
        let _guard = self.lock_project(project_id).await;
        self.start_locked(project_id, env_overrides).await
    }

    /// Stop the project's dev server: request termination (graceful signal,
    /// bounded grace, forced kill), then wait for teardown to settle before
    /// returning. Not silently idempotent — stopping a project with no live
    /// handle is a conflict.
    pub async fn stop(&self, project_id: &str) -> Result<()> {
        let _guard = self.lock_project(project_id).await;
        self.stop_locked(project_id).await
    }

    /// Stop, wait for teardown, start again with the same id and port. If
    /// the stop fails the project is left in its prior state.
    pub async fn restart(&self, project_id: &str) -> Result<StartedProject> {
        let _guard = self.lock_project(project_id).await;
        self.stop_locked(project_id).await?;
        self.start_locked(project_id, None).await
    }

    /// Pure read of the project's current state. `running` + uptime while a
    /// live handle exists, the persisted status otherwise.
    pub fn status(&self, project_id: &str) -> Result<ProjectStatus> {
        let project = self.get_project(project_id)?;
        let states = self.inner.states.lock().unwrap();
        let (status, uptime) = match states.get(project_id) {
            Some(state) => (Status::Running, Some(state.started_at.elapsed())),
            None => (project.status, None),
        };
        Ok(ProjectStatus {
            id: project.id,
            status,
            port: project.port,
            uptime,
        })
    }

    /// Run the package manager's install in the project directory: a
    /// one-shot bounded invocation streaming output like a supervised run,
    /// but with no run-state entry.
    pub async fn install_dependencies(&self, project_id: &str) -> Result<RunOutcome> {
        let timeout = self.inner.install_timeout;
        self.install_dependencies_with(project_id, timeout).await
    }

    /// [`install_dependencies`](Self::install_dependencies) with an
    /// explicit budget.
    pub async fn install_dependencies_with(
        &self,
        project_id: &str,
        timeout: Duration,
    ) -> Result<RunOutcome> {
        let _guard = self.lock_project(project_id).await;
        let project = self.get_project(project_id)?;

        let log_dir = project.log_dir();
        tokio::fs::create_dir_all(&log_dir)
            .await
            .map_err(|source| ExecutionError::Logs {
                path: log_dir,
                source,
            })?;

        let runner = CommandRunner::new(
            project.id.clone(),
            RunnerOptions {
                cwd: Some(project.path.clone()),
                env: project.env.clone(),
                log_file: Some(project.log_file()),
                timeout: Some(timeout),
            },
            self.inner.events.clone(),
            CancellationToken::new(),
        );

        info!(project = %project.name, id = %project.id, "installing dependencies");
        runner
            .run(&self.inner.toolchain.npm, &["install".to_string()])
            .await
    }

    /// Stop every project with a live handle through the regular stop
    /// path, best-effort and in parallel. Called on host shutdown.
    pub async fn shutdown(&self) {
        let ids = self.running_ids();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "stopping all supervised projects");
        let stops = ids.iter().map(|id| async move {
            if let Err(e) = self.stop(id).await {
                warn!(project = %id, error = %e, "shutdown stop failed");
            }
        });
        futures_util::future::join_all(stops).await;
    }

    pub fn is_running(&self, project_id: &str) -> bool {
        self.inner.states.lock().unwrap().contains_key(project_id)
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.inner.states.lock().unwrap().keys().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn start_locked(
        &self,
        project_id: &str,
        env_overrides: Option<BTreeMap<String, String>>,
    ) -> Result<StartedProject> {
        let project = self.get_project(project_id)?;

        if self.is_running(project_id) {
            return Err(Conflict::AlreadyRunning.into());
        }

        let suggested = ports::allocate(project.port);
        if suggested != project.port {
            return Err(Conflict::PortUnavailable {
                requested: project.port,
                suggested,
            }
            .into());
        }

        // Child env precedence, lowest to highest: ambient (inherited at
        // spawn) < persisted project env < PORT < caller overrides.
        let mut env = project.env.clone();
        env.insert("PORT".to_string(), project.port.to_string());
        if let Some(overrides) = env_overrides {
            env.extend(overrides);
        }

        let command = resolve::resolve_start_script(&project.start_script, &self.inner.toolchain)?;

        let log_dir = project.log_dir();
        tokio::fs::create_dir_all(&log_dir)
            .await
            .map_err(|source| ExecutionError::Logs {
                path: log_dir,
                source,
            })?;
        let log_file = project.log_file();

        let cancel = CancellationToken::new();
        let runner = CommandRunner::new(
            project.id.clone(),
            RunnerOptions {
                cwd: Some(project.path.clone()),
                env,
                log_file: Some(log_file.clone()),
                timeout: None,
            },
            self.inner.events.clone(),
            cancel.clone(),
        );

        let stopping = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = watch::channel(false);
        let started_wall = Utc::now();

        {
            let mut states = self.inner.states.lock().unwrap();
            states.insert(
                project_id.to_string(),
                RunState {
                    cancel,
                    started_at: Instant::now(),
                    stopping: stopping.clone(),
                    done: done_rx,
                },
            );
        }

        // Persist the transition before the spawn is issued; on store
        // failure the operation aborts with no run state recorded and
        // nothing spawned.
        if let Err(e) = self.persist_status(project_id, Status::Running) {
            self.inner.states.lock().unwrap().remove(project_id);
            return Err(e);
        }

        // Launch asynchronously: start() returns at spawn initiation, the
        // monitor task owns everything that happens after.
        let monitor = self.clone();
        let monitor_id = project.id.clone();
        tokio::spawn(async move {
            let outcome = runner.run(&command.program, &command.args).await;
            monitor.finish(&monitor_id, stopping, outcome, done_tx).await;
        });

        self.emit_status(project_id, Status::Running);
        info!(project = %project.name, id = %project.id, port = project.port, "project started");

        Ok(StartedProject {
            id: project.id,
            name: project.name,
            port: project.port,
            log_file,
            started_at: started_wall,
        })
    }

    async fn stop_locked(&self, project_id: &str) -> Result<()> {
        // Existence check first so unknown ids read as NotFound rather
        // than NotRunning.
        let project = self.get_project(project_id)?;

        let (cancel, mut done) = {
            let states = self.inner.states.lock().unwrap();
            match states.get(project_id) {
                Some(state) => {
                    state.stopping.store(true, Ordering::SeqCst);
                    (state.cancel.clone(), state.done.clone())
                }
                None => return Err(Conflict::NotRunning.into()),
            }
        };

        // Request termination, then wait for the monitor's teardown to
        // settle; only then is the stop complete.
        cancel.cancel();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }

        info!(project = %project.name, id = %project_id, "project stopped");
        Ok(())
    }

    /// Unified teardown for every termination path: explicit stop, crash,
    /// spawn failure, host shutdown. Removing the map entry is the
    /// idempotence guard — status is persisted and the event emitted
    /// exactly once per run, regardless of which path got here.
    async fn finish(
        &self,
        project_id: &str,
        stopping: Arc<AtomicBool>,
        outcome: Result<RunOutcome>,
        done_tx: watch::Sender<bool>,
    ) {
        let had_state = self
            .inner
            .states
            .lock()
            .unwrap()
            .remove(project_id)
            .is_some();
        if !had_state {
            // Entry already cleared; nothing to record.
            let _ = done_tx.send(true);
            return;
        }

        let status = match &outcome {
            Ok(outcome) if stopping.load(Ordering::SeqCst) || outcome.success() => Status::Stopped,
            Ok(outcome) => {
                warn!(
                    project = %project_id,
                    code = ?outcome.code,
                    signal = ?outcome.signal,
                    "process exited abnormally",
                );
                Status::Error
            }
            Err(e) => {
                warn!(project = %project_id, error = %e, "supervised run failed");
                Status::Error
            }
        };

        if let Err(e) = self.persist_status(project_id, status) {
            warn!(project = %project_id, error = %e, "failed to persist final status");
        }
        self.emit_status(project_id, status);
        let _ = done_tx.send(true);
    }

    async fn lock_project(&self, project_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.op_locks.lock().unwrap();
            locks
                .entry(project_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    fn get_project(&self, project_id: &str) -> Result<Project> {
        self.inner
            .store
            .get(project_id)
            .ok_or_else(|| Error::NotFound(project_id.to_string()))
    }

    fn persist_status(&self, project_id: &str, status: Status) -> Result<()> {
        let updated = self.inner.store.update(
            project_id,
            ProjectPatch {
                status: Some(status),
                ..Default::default()
            },
        )?;
        if updated.is_none() {
            debug!(project = %project_id, "status persist skipped, record deleted");
        }
        Ok(())
    }

    fn emit_status(&self, project_id: &str, status: Status) {
        let _ = self.inner.events.send(Event::StatusChanged {
            project_id: project_id.to_string(),
            status,
        });
    }
}
