//! Backend subprocess ownership.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::distributor::{log_stderr, read_stdout, MessageDistributor};
use crate::error::{Error, Result};
use crate::protocol::JsonRpcMessage;

/// Diagnostic output kept from a process that died during startup.
const MAX_DIAGNOSTIC_CHARS: usize = 2000;

/// Wait for reader tasks to drain after the process is gone.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// One stdio backend process.
///
/// The OS process is owned exclusively through `child`; restarting replaces
/// it and starts a new reader generation on the shared distributor.
pub struct BackendProcess {
    name: String,
    config: BackendConfig,
    distributor: Arc<MessageDistributor>,
    start_grace: Duration,
    stop_timeout: Duration,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    reader: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
    started_at: Option<DateTime<Utc>>,
    start_count: u32,
    generation: u64,
    last_used: Instant,
    last_used_at: DateTime<Utc>,
}

impl BackendProcess {
    /// Create a stopped process handle.
    pub fn new(
        name: impl Into<String>,
        config: BackendConfig,
        distributor: Arc<MessageDistributor>,
        start_grace: Duration,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            distributor,
            start_grace,
            stop_timeout,
            child: None,
            stdin: None,
            reader: None,
            stderr_task: None,
            started_at: None,
            start_count: 0,
            generation: 0,
            last_used: Instant::now(),
            last_used_at: Utc::now(),
        }
    }

    /// Spawn the process unless it is already running.
    ///
    /// Fails if the process exits within the grace window; its captured
    /// stdout and stderr are included in the error.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_alive() {
            return Ok(());
        }
        if self.child.is_some() {
            self.stop().await;
        }
        self.config
            .validate()
            .map_err(|e| self.start_error(e.to_string()))?;

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| self.start_error(format!("spawn '{}': {e}", self.config.command)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.start_error("stdin not captured"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.start_error("stdout not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| self.start_error("stderr not captured"))?;

        if let Ok(status) = tokio::time::timeout(self.start_grace, child.wait()).await {
            let status = match status {
                Ok(status) => status.to_string(),
                Err(e) => e.to_string(),
            };
            let stderr_text = capture_output(&mut stderr).await;
            let stdout_text = capture_output(&mut stdout).await;
            let mut reason = format!("exited during startup ({status})");
            if !stderr_text.is_empty() {
                reason.push_str(&format!(" | stderr: {stderr_text}"));
            }
            if !stdout_text.is_empty() {
                reason.push_str(&format!(" | stdout: {stdout_text}"));
            }
            return Err(self.start_error(reason));
        }

        let pid = child.id();
        let generation = self.distributor.begin_generation();
        self.reader = Some(tokio::spawn(read_stdout(
            Arc::clone(&self.distributor),
            stdout,
            generation,
        )));
        self.stderr_task = Some(tokio::spawn(log_stderr(self.name.clone(), stderr)));
        self.child = Some(child);
        self.stdin = Some(stdin);
        self.started_at = Some(Utc::now());
        self.start_count += 1;
        self.generation = generation;
        self.touch();

        info!(
            backend = %self.name,
            pid = ?pid,
            generation,
            command = %self.config.command_line(),
            "backend started"
        );
        Ok(())
    }

    /// Write one message, starting the process first if it is not alive.
    pub async fn send(&mut self, message: &JsonRpcMessage, timeout: Duration) -> Result<()> {
        if !self.is_alive() {
            self.start().await?;
        }
        self.write(message, timeout).await
    }

    /// Write one newline-terminated frame and flush within `timeout`.
    ///
    /// A failed or late write may leave a partial frame on the pipe, so
    /// stdin is closed and the process is unusable until restarted.
    pub async fn write(&mut self, message: &JsonRpcMessage, timeout: Duration) -> Result<()> {
        let line = message.to_line()?;
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(Error::Send {
                name: self.name.clone(),
                reason: "process is not running".into(),
            });
        };

        let written = tokio::time::timeout(timeout, async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        })
        .await;

        let failure = match written {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "stdin not accepting input within {}ms",
                timeout.as_millis()
            )),
        };
        if let Some(reason) = failure {
            self.stdin = None;
            return Err(Error::Send {
                name: self.name.clone(),
                reason,
            });
        }
        if let JsonRpcMessage::Request { id, .. } = message {
            self.distributor.mark_sent(id, self.generation);
        }
        debug!(backend = %self.name, method = ?message.method(), id = ?message.id(), "sent");
        self.touch();
        Ok(())
    }

    /// Terminate gracefully, killing after the stop timeout.
    pub async fn stop(&mut self) {
        // Closing stdin is the polite shutdown request for stdio servers.
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            if let Some(pid) = child.id() {
                if let Err(e) = terminate_pid(pid) {
                    debug!(backend = %self.name, pid, error = %e, "SIGTERM failed");
                }
            }
            if tokio::time::timeout(self.stop_timeout, child.wait()).await.is_err() {
                warn!(backend = %self.name, "backend ignored SIGTERM, killing");
                if let Err(e) = child.kill().await {
                    warn!(backend = %self.name, error = %e, "kill failed");
                }
            }
            info!(backend = %self.name, "backend stopped");
        }
        self.drain_readers().await;
    }

    /// Kill immediately.
    pub async fn kill(&mut self) {
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!(backend = %self.name, error = %e, "kill failed");
            }
        }
        self.drain_readers().await;
    }

    async fn drain_readers(&mut self) {
        for mut task in [self.reader.take(), self.stderr_task.take()].into_iter().flatten() {
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }
    }

    /// Live OS status, not merely "was started".
    pub fn is_alive(&mut self) -> bool {
        self.child
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }

    /// Whether a process handle is held, alive or not.
    pub fn is_tracked(&self) -> bool {
        self.child.is_some()
    }

    /// OS pid of the running process.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Record activity.
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
        self.last_used_at = Utc::now();
    }

    /// Time since last activity.
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Wall-clock time of last activity.
    pub fn last_used(&self) -> DateTime<Utc> {
        self.last_used_at
    }

    /// When the current process was spawned.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Successful starts so far.
    pub fn start_count(&self) -> u32 {
        self.start_count
    }

    /// Starts after the first.
    pub fn restart_count(&self) -> u32 {
        self.start_count.saturating_sub(1)
    }

    /// Launch configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Replace the launch configuration; takes effect on the next start.
    pub fn set_config(&mut self, config: BackendConfig) {
        self.config = config;
    }

    fn start_error(&self, reason: impl Into<String>) -> Error {
        Error::ProcessStart {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }
}

async fn capture_output<R: AsyncRead + Unpin>(stream: &mut R) -> String {
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(Duration::from_millis(500), stream.read_to_end(&mut buf)).await;
    let text = String::from_utf8_lossy(&buf);
    let text = text.trim();
    if text.chars().count() > MAX_DIAGNOSTIC_CHARS {
        let mut cut: String = text.chars().take(MAX_DIAGNOSTIC_CHARS).collect();
        cut.push_str("...(truncated)");
        cut
    } else {
        text.to_string()
    }
}

/// Ask a process to exit.
#[cfg(unix)]
pub(crate) fn terminate_pid(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(std::io::Error::from)
}

/// Force a process to exit.
#[cfg(unix)]
pub(crate) fn kill_pid(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
pub(crate) fn terminate_pid(pid: u32) -> std::io::Result<()> {
    kill_pid(pid)
}

#[cfg(not(unix))]
pub(crate) fn kill_pid(pid: u32) -> std::io::Result<()> {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    match system.process(pid) {
        Some(process) if process.kill() => Ok(()),
        Some(_) => Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "kill refused",
        )),
        None => Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such process",
        )),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::DeliveryMode;
    use crate::protocol::RequestId;
    use crate::testing::{fake_backend, missing_backend};
    use serde_json::json;

    const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

    fn process(config: BackendConfig) -> (BackendProcess, Arc<MessageDistributor>) {
        let dist = MessageDistributor::new("fake", DeliveryMode::Broadcast);
        let proc = BackendProcess::new(
            "fake",
            config,
            Arc::clone(&dist),
            Duration::from_millis(50),
            Duration::from_secs(2),
        );
        (proc, dist)
    }

    #[tokio::test]
    async fn test_start_send_and_stop() {
        let (mut proc, dist) = process(fake_backend());
        proc.start().await.unwrap();
        assert!(proc.is_alive());
        assert!(proc.pid().is_some());

        let pending = dist.register_pending(RequestId::Number(1)).unwrap();
        proc.send(&JsonRpcMessage::request(1, "ping", None), WRITE_TIMEOUT)
            .await
            .unwrap();
        let reply = pending.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply, JsonRpcMessage::response(RequestId::Number(1), json!({})));

        proc.stop().await;
        assert!(!proc.is_alive());
        assert!(proc.pid().is_none());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (mut proc, _dist) = process(fake_backend());
        proc.start().await.unwrap();
        let pid = proc.pid();
        proc.start().await.unwrap();
        assert_eq!(proc.pid(), pid);
        assert_eq!(proc.start_count(), 1);
        proc.stop().await;
    }

    #[tokio::test]
    async fn test_early_exit_fails_start_with_diagnostics() {
        let config = BackendConfig::new("sh").with_args(["-c", "echo boom >&2; exit 3"]);
        let dist = MessageDistributor::new("fake", DeliveryMode::Broadcast);
        let mut proc = BackendProcess::new(
            "fake",
            config,
            dist,
            Duration::from_secs(2),
            Duration::from_secs(2),
        );
        let err = proc.start().await.unwrap_err();
        match err {
            Error::ProcessStart { name, reason } => {
                assert_eq!(name, "fake");
                assert!(reason.contains("boom"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!proc.is_alive());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (mut proc, _dist) = process(missing_backend());
        assert!(matches!(proc.start().await, Err(Error::ProcessStart { .. })));
        assert_eq!(proc.start_count(), 0);
    }

    #[tokio::test]
    async fn test_send_restarts_dead_process_once() {
        let (mut proc, dist) = process(fake_backend());
        proc.start().await.unwrap();
        proc.kill().await;
        assert!(!proc.is_alive());

        let pending = dist.register_pending(RequestId::Number(2)).unwrap();
        proc.send(&JsonRpcMessage::request(2, "ping", None), WRITE_TIMEOUT)
            .await
            .unwrap();
        assert!(pending.wait(Duration::from_secs(5)).await.is_ok());
        assert_eq!(proc.start_count(), 2);
        assert_eq!(proc.restart_count(), 1);
        proc.stop().await;
    }

    #[tokio::test]
    async fn test_environment_is_merged() {
        let config = BackendConfig::new("sh")
            .with_args([
                "-c",
                r#"printf '{"jsonrpc":"2.0","method":"env","params":{"v":"%s","path":%s}}\n' "$GW_TEST" "$([ -n "$PATH" ] && echo true || echo false)"; cat >/dev/null"#,
            ])
            .with_env("GW_TEST", "hello");
        let (mut proc, dist) = process(config);
        let mut rx = dist.subscribe("s", 4);
        proc.start().await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.params(), Some(&json!({"v": "hello", "path": true})));
        proc.stop().await;
    }

    #[tokio::test]
    async fn test_write_without_process_is_send_failure() {
        let (mut proc, _dist) = process(fake_backend());
        let err = proc
            .write(&JsonRpcMessage::notification("ping", None), WRITE_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "send_failure");
    }

    #[tokio::test]
    async fn test_write_to_stalled_reader_times_out() {
        let config = BackendConfig::new("sh").with_args(["-c", "exec sleep 1000"]);
        let (mut proc, _dist) = process(config);
        proc.start().await.unwrap();

        // Far larger than a pipe buffer, and nothing ever reads it.
        let blob = "x".repeat(1 << 20);
        let request = JsonRpcMessage::request(1, "echo", Some(json!({"blob": blob})));
        let started = Instant::now();
        let err = proc
            .write(&request, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "send_failure");
        assert!(started.elapsed() < Duration::from_secs(2));

        // The half-written pipe is not reused.
        let err = proc
            .write(&JsonRpcMessage::notification("ping", None), WRITE_TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not running"), "{err}");
        proc.kill().await;
    }
}
