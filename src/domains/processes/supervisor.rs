use super::log_sink::{ExecutionLogWriter, LogRecord, LogRing, LogStream};
use super::operation::CommandSpec;
use anyhow::{Context, Result};
use dashmap::DashMap;
use log::{debug, info, warn};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, watch};

/// Terminal result of a supervised process. `code` is `None` when the
/// process died on a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub cancelled: bool,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0) && !self.cancelled
    }
}

/// What the supervised process receives on stdin.
#[derive(Debug, Clone)]
pub enum StdinPolicy {
    Null,
    Data(String),
}

const LOG_BROADCAST_CAPACITY: usize = 4096;

/// Live view of one supervised execution: the ordered log stream, a
/// cancellation trigger, and the terminal future.
#[derive(Clone)]
pub struct ExecutionHandle {
    execution_id: String,
    pid: Option<u32>,
    cancel_tx: Arc<watch::Sender<bool>>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
    logs_tx: broadcast::Sender<LogRecord>,
    ring: Arc<Mutex<LogRing>>,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogRecord> {
        self.logs_tx.subscribe()
    }

    /// The interleaved, ordered log stream from the moment of
    /// subscription. Lagged subscribers skip ahead instead of erroring.
    pub fn log_stream(&self) -> impl futures::Stream<Item = LogRecord> + use<> {
        futures::stream::unfold(self.logs_tx.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(record) => return Some((record, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    /// Bounded in-memory tail, newest last.
    pub fn log_tail(&self) -> Vec<LogRecord> {
        self.ring.lock().expect("log ring poisoned").snapshot()
    }

    /// Idempotent graceful-cancellation trigger.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn try_outcome(&self) -> Option<ExitOutcome> {
        *self.exit_rx.borrow()
    }

    /// Resolves once, when the process reached its terminal state and the
    /// log file was fsynced. Every caller observes the same outcome.
    pub async fn wait(&self) -> ExitOutcome {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(outcome) = *rx.borrow_and_update() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return ExitOutcome {
                    code: None,
                    cancelled: false,
                };
            }
        }
    }
}

/// Spawns typed operations and supervises them to terminal exit: ordered
/// log capture into ring + jsonl file, graceful cancellation, exactly-once
/// exit reporting.
pub struct ProcessSupervisor {
    logs_dir: PathBuf,
    grace: Duration,
    ring_capacity: usize,
    active: DashMap<String, ExecutionHandle>,
}

impl ProcessSupervisor {
    pub fn new(logs_dir: PathBuf, grace: Duration, ring_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            logs_dir,
            grace,
            ring_capacity,
            active: DashMap::new(),
        })
    }

    pub fn logs_dir(&self) -> &PathBuf {
        &self.logs_dir
    }

    pub fn active_handle(&self, execution_id: &str) -> Option<ExecutionHandle> {
        self.active.get(execution_id).map(|entry| entry.clone())
    }

    /// Requests graceful cancellation of a supervised execution. Returns
    /// `false` when nothing is running under that id.
    pub fn cancel(&self, execution_id: &str) -> bool {
        match self.active.get(execution_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Last-resort kill of everything still supervised, for shutdown paths.
    pub fn force_kill_all(&self) {
        for entry in self.active.iter() {
            entry.value().cancel();
            if let Some(pid) = entry.value().pid() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }
    }

    /// Spawns the command and wires up supervision. The returned handle is
    /// also registered under `execution_id` until terminal exit.
    pub fn run(
        self: &Arc<Self>,
        execution_id: &str,
        spec: CommandSpec,
        stdin: StdinPolicy,
    ) -> Result<ExecutionHandle> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().cloned())
            .current_dir(&spec.cwd)
            .stdin(match stdin {
                StdinPolicy::Null => Stdio::null(),
                StdinPolicy::Data(_) => Stdio::piped(),
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", spec.program))?;
        let pid = child.id();
        info!(
            "Spawned {} (pid {:?}) for execution {execution_id}",
            spec.program, pid
        );

        if let StdinPolicy::Data(data) = stdin
            && let Some(mut child_stdin) = child.stdin.take()
        {
            tokio::spawn(async move {
                let _ = child_stdin.write_all(data.as_bytes()).await;
                let _ = child_stdin.shutdown().await;
            });
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<(LogStream, String)>();
        let (logs_tx, _logs_rx) = broadcast::channel(LOG_BROADCAST_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = watch::channel(None);
        let ring = Arc::new(Mutex::new(LogRing::new(self.ring_capacity)));

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_reader = spawn_line_reader(stdout, LogStream::Stdout, raw_tx.clone());
        let stderr_reader = spawn_line_reader(stderr, LogStream::Stderr, raw_tx.clone());

        let writer = ExecutionLogWriter::create(&self.logs_dir, execution_id)?;
        let sink = spawn_log_sink(
            execution_id.to_string(),
            raw_rx,
            writer,
            ring.clone(),
            logs_tx.clone(),
            format!("spawn {} {}", spec.program, spec.args.join(" ")),
        );

        let handle = ExecutionHandle {
            execution_id: execution_id.to_string(),
            pid,
            cancel_tx: Arc::new(cancel_tx),
            exit_rx,
            logs_tx,
            ring,
        };
        self.active.insert(execution_id.to_string(), handle.clone());

        let supervisor = Arc::clone(self);
        let execution_id = execution_id.to_string();
        let grace = self.grace;
        tokio::spawn(async move {
            let outcome = supervise(&mut child, pid, cancel_rx, grace).await;

            // Readers drain to EOF on their own; wait so every produced
            // line lands before the terminal system record.
            let _ = stdout_reader.await;
            let _ = stderr_reader.await;
            let _ = raw_tx.send((
                LogStream::System,
                match outcome.code {
                    Some(code) => format!("process exited with code {code}"),
                    None => "process terminated by signal".to_string(),
                },
            ));
            drop(raw_tx);
            if let Err(e) = sink.await {
                warn!("Log sink for execution {execution_id} panicked: {e}");
            }

            supervisor.active.remove(&execution_id);
            // First and only terminal report; the watch keeps the value
            // for every later waiter.
            let _ = exit_tx.send(Some(outcome));
            debug!("Execution {execution_id} terminal: {outcome:?}");
        });

        Ok(handle)
    }
}

async fn supervise(
    child: &mut tokio::process::Child,
    pid: Option<u32>,
    mut cancel_rx: watch::Receiver<bool>,
    grace: Duration,
) -> ExitOutcome {
    tokio::select! {
        status = child.wait() => ExitOutcome {
            code: status.ok().and_then(|s| s.code()),
            cancelled: false,
        },
        changed = cancel_rx.changed() => {
            if changed.is_err() {
                // Cancellation channel gone; fall back to plain waiting.
                let status = child.wait().await;
                return ExitOutcome { code: status.ok().and_then(|s| s.code()), cancelled: false };
            }
            if let Some(pid) = pid {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => ExitOutcome {
                    code: status.ok().and_then(|s| s.code()),
                    cancelled: true,
                },
                Err(_) => {
                    warn!("Grace period elapsed, force-killing pid {pid:?}");
                    let _ = child.start_kill();
                    let status = child.wait().await;
                    ExitOutcome {
                        code: status.ok().and_then(|s| s.code()),
                        cancelled: true,
                    }
                }
            }
        }
    }
}

fn spawn_line_reader<R>(
    source: Option<R>,
    stream: LogStream,
    tx: mpsc::UnboundedSender<(LogStream, String)>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(source) = source else { return };
        let mut lines = BufReader::new(source).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((stream, line)).is_err() {
                break;
            }
        }
    })
}

fn spawn_log_sink(
    execution_id: String,
    mut raw_rx: mpsc::UnboundedReceiver<(LogStream, String)>,
    mut writer: ExecutionLogWriter,
    ring: Arc<Mutex<LogRing>>,
    logs_tx: broadcast::Sender<LogRecord>,
    banner: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut seq = 0u64;
        let mut emit = |stream: LogStream, data: String, writer: &mut ExecutionLogWriter| {
            let record = LogRecord {
                execution_id: execution_id.clone(),
                seq,
                stream,
                ts: crate::infrastructure::database::now_ms(),
                data,
            };
            seq += 1;
            if let Err(e) = writer.append(&record) {
                warn!("Failed to persist log record: {e}");
            }
            ring.lock().expect("log ring poisoned").push(record.clone());
            let _ = logs_tx.send(record);
        };

        emit(LogStream::System, banner, &mut writer);
        while let Some((stream, data)) = raw_rx.recv().await {
            emit(stream, data, &mut writer);
        }
        if let Err(e) = writer.finalize() {
            warn!("Failed to finalize log file: {e}");
        }
    })
}

/// Probe whether a pid is still alive, for startup recovery.
pub fn is_pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Process-wide supervisor slot so the shutdown guard can reach it from a
/// plain `Drop`.
pub static SUPERVISOR: OnceCell<Arc<ProcessSupervisor>> = OnceCell::new();

/// Kills everything still supervised when the runner exits or panics.
pub struct ShutdownGuard;

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        if let Some(supervisor) = SUPERVISOR.get() {
            info!("Shutdown: force-killing supervised processes");
            supervisor.force_kill_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::processes::log_sink::read_log_file;
    use tempfile::TempDir;

    fn sh(cwd: &std::path::Path, script: &str) -> CommandSpec {
        CommandSpec {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            env: vec![("VK_WORKSPACE_ID".into(), "w-1".into())],
            cwd: cwd.to_path_buf(),
        }
    }

    fn supervisor(tmp: &TempDir) -> Arc<ProcessSupervisor> {
        ProcessSupervisor::new(tmp.path().join(".logs"), Duration::from_millis(300), 64 * 1024)
    }

    #[tokio::test]
    async fn successful_exit_reports_code_zero() {
        let tmp = TempDir::new().unwrap();
        let supervisor = supervisor(&tmp);
        let handle = supervisor
            .run("e-1", sh(tmp.path(), "echo hello"), StdinPolicy::Null)
            .unwrap();

        let outcome = handle.wait().await;
        assert_eq!(outcome.code, Some(0));
        assert!(outcome.success());
        assert!(supervisor.active_handle("e-1").is_none());
    }

    #[tokio::test]
    async fn failure_exit_code_is_propagated() {
        let tmp = TempDir::new().unwrap();
        let handle = supervisor(&tmp)
            .run("e-1", sh(tmp.path(), "exit 3"), StdinPolicy::Null)
            .unwrap();
        let outcome = handle.wait().await;
        assert_eq!(outcome.code, Some(3));
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn log_file_preserves_order_and_streams() {
        let tmp = TempDir::new().unwrap();
        let supervisor = supervisor(&tmp);
        let handle = supervisor
            .run(
                "e-1",
                sh(tmp.path(), "echo one; echo two; echo oops 1>&2"),
                StdinPolicy::Null,
            )
            .unwrap();
        handle.wait().await;

        let records =
            read_log_file(&tmp.path().join(".logs").join("e-1.jsonl")).unwrap();
        assert!(records.len() >= 5, "banner + 3 lines + exit record");
        assert_eq!(records[0].stream, LogStream::System);
        assert_eq!(records.last().unwrap().stream, LogStream::System);
        assert!(records.last().unwrap().data.contains("code 0"));

        let stdout: Vec<&str> = records
            .iter()
            .filter(|r| r.stream == LogStream::Stdout)
            .map(|r| r.data.as_str())
            .collect();
        assert_eq!(stdout, vec!["one", "two"]);
        assert!(records.iter().any(|r| r.stream == LogStream::Stderr && r.data == "oops"));
    }

    #[tokio::test]
    async fn stdin_data_reaches_the_process() {
        let tmp = TempDir::new().unwrap();
        let handle = supervisor(&tmp)
            .run(
                "e-1",
                sh(tmp.path(), "cat"),
                StdinPolicy::Data("piped prompt\n".into()),
            )
            .unwrap();
        let outcome = handle.wait().await;
        assert!(outcome.success());
        assert!(
            handle
                .log_tail()
                .iter()
                .any(|r| r.data == "piped prompt")
        );
    }

    #[tokio::test]
    async fn cancellation_terminates_gracefully() {
        let tmp = TempDir::new().unwrap();
        let supervisor = supervisor(&tmp);
        let handle = supervisor
            .run("e-1", sh(tmp.path(), "sleep 30"), StdinPolicy::Null)
            .unwrap();

        assert!(supervisor.cancel("e-1"));
        let outcome = handle.wait().await;
        assert!(outcome.cancelled);
        assert_ne!(outcome.code, Some(0));
        // A second cancel after exit is a no-op.
        assert!(!supervisor.cancel("e-1"));
    }

    #[tokio::test]
    async fn sigterm_resistant_process_is_force_killed() {
        let tmp = TempDir::new().unwrap();
        let supervisor = supervisor(&tmp);
        let handle = supervisor
            .run(
                "e-1",
                sh(tmp.path(), "trap '' TERM; sleep 30"),
                StdinPolicy::Null,
            )
            .unwrap();
        // Let the shell install its trap before we cancel.
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle.cancel();
        let outcome = handle.wait().await;
        assert!(outcome.cancelled);
        assert_eq!(outcome.code, None, "SIGKILL leaves no exit code");
    }

    #[tokio::test]
    async fn log_stream_delivers_in_order_until_exit() {
        use futures::StreamExt;

        let tmp = TempDir::new().unwrap();
        let handle = supervisor(&tmp)
            .run(
                "e-1",
                sh(tmp.path(), "sleep 0.2; echo first; echo second"),
                StdinPolicy::Null,
            )
            .unwrap();

        let stream = handle.log_stream();
        futures::pin_mut!(stream);

        let mut seen = Vec::new();
        while let Some(record) = stream.next().await {
            let done = record.stream == LogStream::System && record.data.contains("exited");
            seen.push(record);
            if done {
                break;
            }
        }

        assert!(seen.windows(2).all(|w| w[1].seq > w[0].seq));
        let stdout: Vec<&str> = seen
            .iter()
            .filter(|r| r.stream == LogStream::Stdout)
            .map(|r| r.data.as_str())
            .collect();
        assert_eq!(stdout, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn every_waiter_sees_the_same_outcome() {
        let tmp = TempDir::new().unwrap();
        let handle = supervisor(&tmp)
            .run("e-1", sh(tmp.path(), "exit 7"), StdinPolicy::Null)
            .unwrap();

        let (a, b) = tokio::join!(handle.wait(), handle.wait());
        assert_eq!(a, b);
        assert_eq!(handle.try_outcome(), Some(a));
    }

    #[tokio::test]
    async fn pid_probe_tracks_liveness() {
        let tmp = TempDir::new().unwrap();
        let handle = supervisor(&tmp)
            .run("e-1", sh(tmp.path(), "sleep 5"), StdinPolicy::Null)
            .unwrap();
        let pid = handle.pid().unwrap() as i32;
        assert!(is_pid_alive(pid));

        handle.cancel();
        handle.wait().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!is_pid_alive(pid));
    }
}
