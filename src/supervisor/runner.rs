use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{Error, ExecutionError, Result};
use crate::events::{Event, EventSender, Stream};
use crate::platform;
use crate::supervisor::resolve;

/// Structured result of a finished run: exit code and signal as the OS
/// reported them, plus the full captured output of both streams.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Construction-time options for a [`CommandRunner`].
#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    pub cwd: Option<PathBuf>,
    /// Layered over the ambient process environment at spawn.
    pub env: BTreeMap<String, String>,
    pub log_file: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

/// Spawns and monitors exactly one OS process invocation.
///
/// Output handling is a line-oriented pipeline: one reader task per pipe
/// splits chunks into complete lines and feeds a single channel; the one
/// consumer appends the tagged log file, accumulates captured output, and
/// forwards log-line events. Arrival order is preserved per stream.
pub struct CommandRunner {
    project_id: String,
    opts: RunnerOptions,
    events: EventSender,
    cancel: CancellationToken,
}

/// Append-only handle on the per-project log file. Closed (flushed and
/// dropped) when the run resolves; nothing writes after that.
struct LogSink {
    path: PathBuf,
    file: tokio::fs::File,
}

impl LogSink {
    async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|source| ExecutionError::Logs {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// One `[<TAG>] <ISO-8601> <content>` line, flushed immediately.
    async fn append(&mut self, tag: &str, content: &str) {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let line = format!("[{tag}] {stamp} {content}\n");
        if let Err(e) = self.file.write_all(line.as_bytes()).await {
            warn!(path = %self.path.display(), error = %e, "log write failed");
            return;
        }
        let _ = self.file.flush().await;
    }
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled(Option<std::process::ExitStatus>),
    TimedOut,
}

impl CommandRunner {
    pub fn new(
        project_id: impl Into<String>,
        opts: RunnerOptions,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            opts,
            events,
            cancel,
        }
    }

    /// Run `program args` to completion.
    ///
    /// Disallowed commands fail before anything is spawned. Spawn-level OS
    /// errors are logged with an `[ERROR]` tag and returned — no exit
    /// record follows, callers must treat them as terminal. A configured
    /// timeout terminates the child and short-circuits to `Error::Timeout`.
    /// Cancellation terminates the child gracefully and resolves with the
    /// observed exit status.
    pub async fn run(&self, program: &Path, args: &[String]) -> Result<RunOutcome> {
        if !resolve::command_allowed(program) {
            return Err(ExecutionError::CommandNotAllowed(program.display().to_string()).into());
        }

        let mut sink = match &self.opts.log_file {
            Some(path) => Some(LogSink::open(path).await?),
            None => None,
        };

        let command_label = program.display().to_string();

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.opts.cwd {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.opts.env);
        platform::configure_process_group(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                if let Some(sink) = sink.as_mut() {
                    sink.append("ERROR", &format!("failed to spawn {command_label}: {source}"))
                        .await;
                }
                return Err(ExecutionError::Spawn {
                    command: command_label,
                    source,
                }
                .into());
            }
        };

        let child_pid = child.id();
        let group = platform::post_spawn_setup(child_pid);
        debug!(project = %self.project_id, pid = ?child_pid, command = %command_label, "child spawned");

        let (line_tx, line_rx) = mpsc::channel::<(Stream, String)>(256);
        let stdout_task = spawn_reader(child.stdout.take(), Stream::Stdout, line_tx.clone());
        let stderr_task = spawn_reader(child.stderr.take(), Stream::Stderr, line_tx);
        let consumer = self.spawn_consumer(line_rx, sink);

        let timeout = self.opts.timeout;
        let timeout_fut = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timeout_fut);

        let waited = tokio::select! {
            res = child.wait() => Waited::Exited(res),
            _ = self.cancel.cancelled() => {
                debug!(project = %self.project_id, "cancellation requested, terminating child");
                Waited::Cancelled(
                    platform::terminate_child(&mut child, child_pid, group.as_ref()).await,
                )
            }
            _ = &mut timeout_fut => {
                warn!(project = %self.project_id, "execution timeout expired, terminating child");
                let _ = platform::terminate_child(&mut child, child_pid, group.as_ref()).await;
                Waited::TimedOut
            }
        };

        // The pipes close on exit; let the readers drain fully so every
        // line (including a trailing unterminated one) lands in the log
        // before the terminal record.
        let _ = stdout_task.await;
        let _ = stderr_task.await;
        let (stdout, stderr, mut sink) = consumer.await.unwrap_or_default();

        let status = match waited {
            Waited::Exited(Ok(status)) => Some(status),
            Waited::Exited(Err(source)) => {
                if let Some(sink) = sink.as_mut() {
                    sink.append("ERROR", &format!("waiting on {command_label}: {source}"))
                        .await;
                }
                return Err(ExecutionError::Wait {
                    command: command_label,
                    source,
                }
                .into());
            }
            Waited::Cancelled(status) => status,
            Waited::TimedOut => {
                let budget = timeout.unwrap_or_default();
                if let Some(sink) = sink.as_mut() {
                    sink.append(
                        "ERROR",
                        &format!("timed out after {}", humantime::format_duration(budget)),
                    )
                    .await;
                }
                return Err(Error::Timeout(budget));
            }
        };

        let code = status.and_then(|s| s.code());
        let signal = exit_signal(status);

        if let Some(sink) = sink.as_mut() {
            sink.append(
                "EXIT",
                &format!(
                    "code={} signal={}",
                    code.map_or_else(|| "null".to_string(), |c| c.to_string()),
                    signal.map_or_else(|| "null".to_string(), |s| s.to_string()),
                ),
            )
            .await;
        }

        debug!(project = %self.project_id, code = ?code, signal = ?signal, "process exited");

        Ok(RunOutcome {
            code,
            signal,
            stdout: stdout.trim_end().to_string(),
            stderr: stderr.trim_end().to_string(),
        })
    }

    /// Single consumer of the line channel: log file, captured buffers,
    /// event fan-out. Returns the buffers and the sink when the channel
    /// closes.
    fn spawn_consumer(
        &self,
        mut rx: mpsc::Receiver<(Stream, String)>,
        mut sink: Option<LogSink>,
    ) -> JoinHandle<(String, String, Option<LogSink>)> {
        let events = self.events.clone();
        let project_id = self.project_id.clone();
        tokio::spawn(async move {
            let mut stdout = String::new();
            let mut stderr = String::new();
            while let Some((stream, text)) = rx.recv().await {
                let buf = match stream {
                    Stream::Stdout => &mut stdout,
                    Stream::Stderr => &mut stderr,
                };
                buf.push_str(&text);
                buf.push('\n');

                if let Some(sink) = sink.as_mut() {
                    sink.append(stream.tag(), &text).await;
                }
                let _ = events.send(Event::LogLine {
                    project_id: project_id.clone(),
                    timestamp: Utc::now(),
                    stream,
                    line: text,
                });
            }
            (stdout, stderr, sink)
        })
    }
}

/// Reader task for one pipe: splits arriving chunks into complete lines
/// (cross-platform endings) and feeds the consumer channel. A chunk with no
/// terminator yet parks in the buffer until the next chunk completes it; at
/// EOF the remainder comes through as a final line.
fn spawn_reader<R>(
    pipe: Option<R>,
    stream: Stream,
    tx: mpsc::Sender<(Stream, String)>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(pipe) = pipe else { return };
        let mut reader = BufReader::new(pipe);
        let mut buf = String::new();
        loop {
            buf.clear();
            match reader.read_line(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = buf.trim_end_matches(['\r', '\n']);
                    if text.trim().is_empty() {
                        continue;
                    }
                    if tx.send((stream, text.to_string())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(stream = stream.tag(), error = %e, "pipe read error");
                    break;
                }
            }
        }
    })
}

#[cfg(unix)]
fn exit_signal(status: Option<std::process::ExitStatus>) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.and_then(|s| s.signal())
}

#[cfg(not(unix))]
fn exit_signal(_status: Option<std::process::ExitStatus>) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::events;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Write an executable shell script under a `node_modules` directory so
    /// the allow-list admits it by location.
    fn write_tool(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let bin_dir = dir.path().join("node_modules").join(".bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let path = bin_dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn runner_for(opts: RunnerOptions) -> (CommandRunner, events::EventReceiver) {
        let (tx, rx) = events::channel();
        let runner = CommandRunner::new("test-project", opts, tx, CancellationToken::new());
        (runner, rx)
    }

    fn drain(rx: &mut events::EventReceiver) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn captures_lines_in_order() {
        let dir = TempDir::new().unwrap();
        let tool = write_tool(&dir, "emitter", "for i in 1 2 3 4 5; do echo line-$i; done");
        let (runner, mut rx) = runner_for(RunnerOptions::default());

        let outcome = runner.run(&tool, &[]).await.unwrap();
        assert!(outcome.success());
        assert_eq!(
            outcome.stdout,
            "line-1\nline-2\nline-3\nline-4\nline-5"
        );

        let lines: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                Event::LogLine { line, stream: Stream::Stdout, .. } => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec!["line-1", "line-2", "line-3", "line-4", "line-5"]);
    }

    #[tokio::test]
    async fn stderr_is_captured_separately() {
        let dir = TempDir::new().unwrap();
        let tool = write_tool(&dir, "noisy", "echo out; echo err >&2");
        let (runner, mut rx) = runner_for(RunnerOptions::default());

        let outcome = runner.run(&tool, &[]).await.unwrap();
        assert_eq!(outcome.stdout, "out");
        assert_eq!(outcome.stderr, "err");

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::LogLine { stream: Stream::Stderr, line, .. } if line == "err"
        )));
    }

    #[tokio::test]
    async fn trailing_partial_line_flushes_at_exit() {
        let dir = TempDir::new().unwrap();
        let tool = write_tool(&dir, "partial", "printf 'no-terminator'");
        let (runner, _rx) = runner_for(RunnerOptions::default());

        let outcome = runner.run(&tool, &[]).await.unwrap();
        assert_eq!(outcome.stdout, "no-terminator");
    }

    #[tokio::test]
    async fn log_file_gets_tagged_lines_and_exit_record() {
        let dir = TempDir::new().unwrap();
        let tool = write_tool(&dir, "logged", "echo hello; echo oops >&2; exit 3");
        let log_file = dir.path().join("run.log");
        let (runner, _rx) = runner_for(
            RunnerOptions {
                log_file: Some(log_file.clone()),
                ..Default::default()
            },
        );

        let outcome = runner.run(&tool, &[]).await.unwrap();
        assert_eq!(outcome.code, Some(3));

        let content = std::fs::read_to_string(&log_file).unwrap();
        assert!(content.contains("[STDOUT]"), "got: {content}");
        assert!(content.contains("hello"), "got: {content}");
        assert!(content.contains("[STDERR]"), "got: {content}");
        let last = content.lines().last().unwrap();
        assert!(last.starts_with("[EXIT]"), "got: {last}");
        assert!(last.ends_with("code=3 signal=null"), "got: {last}");
    }

    #[tokio::test]
    async fn disallowed_command_fails_without_spawning() {
        let dir = TempDir::new().unwrap();
        let (runner, mut rx) = runner_for(RunnerOptions::default());

        let err = runner.run(Path::new("/bin/sh"), &[]).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Execution(ExecutionError::CommandNotAllowed(_))
        ));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_is_terminal_and_logged() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("node_modules").join(".bin").join("ghost");
        std::fs::create_dir_all(missing.parent().unwrap()).unwrap();
        let log_file = dir.path().join("run.log");
        let (runner, _rx) = runner_for(
            RunnerOptions {
                log_file: Some(log_file.clone()),
                ..Default::default()
            },
        );

        let err = runner.run(&missing, &[]).await.unwrap_err();
        assert!(matches!(err, Error::Execution(ExecutionError::Spawn { .. })));

        let content = std::fs::read_to_string(&log_file).unwrap();
        assert!(content.contains("[ERROR]"), "got: {content}");
        assert!(!content.contains("[EXIT]"), "got: {content}");
    }

    #[tokio::test]
    async fn timeout_terminates_the_child() {
        let dir = TempDir::new().unwrap();
        let tool = write_tool(&dir, "sleeper", "sleep 60");
        let (runner, _rx) = runner_for(
            RunnerOptions {
                timeout: Some(Duration::from_millis(100)),
                ..Default::default()
            },
        );

        let started = std::time::Instant::now();
        let err = runner.run(&tool, &[]).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        // Well under the 60s the child wanted; covers signal + grace path.
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_resolves_with_signal_status() {
        let dir = TempDir::new().unwrap();
        let tool = write_tool(&dir, "waiter", "echo ready; exec sleep 60");
        let (tx, mut rx) = events::channel();
        let cancel = CancellationToken::new();
        let runner = CommandRunner::new(
            "test-project",
            RunnerOptions::default(),
            tx,
            cancel.clone(),
        );

        let run = tokio::spawn(async move { runner.run(&tool, &[]).await });

        // Wait until the child announced itself, then cancel.
        loop {
            match rx.recv().await {
                Ok(Event::LogLine { line, .. }) if line == "ready" => break,
                Ok(_) => continue,
                Err(_) => panic!("event channel closed before child was ready"),
            }
        }
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(15), run)
            .await
            .expect("run should resolve after cancel")
            .unwrap()
            .unwrap();
        assert_eq!(outcome.code, None);
        assert!(outcome.signal.is_some());
    }
}
