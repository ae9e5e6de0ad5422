//! Supervision of the managed server process.
//!
//! The supervisor owns the lifecycle state machine
//! (`Stopped -> Starting -> Running -> Stopping -> Stopped`, with `Crashed`
//! on abnormal exit) and is the only component that touches the child
//! process. Two background tasks run per process:
//!
//! - an output pump that drains stdout and stderr into the console buffer
//! - an exit watcher that owns the `Child`, reaps it and publishes the exit
//!
//! At most one lifecycle operation runs at a time. Concurrent calls fail
//! with [`SupervisorError::OperationInProgress`] instead of queuing.
//! Each operation runs on its own task that holds the lifecycle slot, so a
//! caller that goes away mid-operation never leaves a transitional state
//! behind.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{Mutex, OwnedMutexGuard, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::command::CommandChannel;
use crate::config::InstanceConfig;
use crate::console::ConsoleLogBuffer;
use crate::process::{ExitInfo, ProcessStatus, ServerState};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Server is already running.")]
    AlreadyRunning,

    #[error("Server is not running.")]
    NotRunning,

    #[error("Another start, stop or restart is already in progress.")]
    OperationInProgress,

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Failed to start server: {0}")]
    StartFailed(String),

    #[error("Server did not exit after being killed.")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Launch and shutdown settings for one supervised process.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Launch target, resolved against the workspace root.
    pub executable: String,
    pub args: Vec<String>,
    pub java_binary: String,
    pub memory_mb: u32,
    pub stop_command: String,
    pub stop_timeout: Duration,
    pub kill_grace: Duration,
    pub startup_grace: Duration,
}

impl SupervisorConfig {
    pub fn from_instance(config: &InstanceConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            args: config.args.clone(),
            java_binary: config.java_binary.clone(),
            memory_mb: config.memory_mb,
            stop_command: config.stop_command.clone(),
            stop_timeout: config.stop_timeout(),
            kill_grace: config.kill_grace(),
            startup_grace: config.startup_grace(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from_instance(&InstanceConfig::default())
    }
}

/// Handles to the tasks of the currently spawned process.
#[derive(Debug)]
struct RunningProcess {
    pid: u32,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

#[derive(Debug)]
pub struct ProcessSupervisor {
    inner: Arc<Supervised>,
}

/// State shared between the supervisor handle and its lifecycle tasks.
#[derive(Debug)]
struct Supervised {
    name: String,
    workspace_root: PathBuf,
    config: SupervisorConfig,
    status_tx: Arc<watch::Sender<ProcessStatus>>,
    console: Arc<ConsoleLogBuffer>,
    commands: Arc<CommandChannel>,
    lifecycle: Arc<Mutex<()>>,
    process: StdMutex<Option<RunningProcess>>,
}

impl ProcessSupervisor {
    pub fn new(
        name: impl Into<String>,
        workspace_root: impl Into<PathBuf>,
        config: SupervisorConfig,
        console: Arc<ConsoleLogBuffer>,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(ProcessStatus::default());
        Self {
            inner: Arc::new(Supervised {
                name: name.into(),
                workspace_root: workspace_root.into(),
                config,
                status_tx: Arc::new(status_tx),
                console,
                commands: Arc::new(CommandChannel::new(status_rx)),
                lifecycle: Arc::new(Mutex::new(())),
                process: StdMutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn commands(&self) -> &Arc<CommandChannel> {
        &self.inner.commands
    }

    /// Current state and last exit. Never blocks.
    pub fn status(&self) -> ProcessStatus {
        self.inner.status()
    }

    /// Receiver that observes every published status change.
    pub fn subscribe(&self) -> watch::Receiver<ProcessStatus> {
        self.inner.status_tx.subscribe()
    }

    pub async fn start(&self) -> Result<ProcessStatus, SupervisorError> {
        let guard = self.try_acquire()?;
        let inner = self.inner.clone();
        run_detached(async move {
            let _guard = guard;
            inner.start_locked().await
        })
        .await
    }

    pub async fn stop(&self, timeout: Duration) -> Result<ProcessStatus, SupervisorError> {
        let guard = self.try_acquire()?;
        let inner = self.inner.clone();
        run_detached(async move {
            let _guard = guard;
            inner.stop_locked(timeout).await
        })
        .await
    }

    /// Stop (if running) and start again under a single lifecycle slot.
    pub async fn restart(&self, timeout: Duration) -> Result<ProcessStatus, SupervisorError> {
        let guard = self.try_acquire()?;
        let inner = self.inner.clone();
        run_detached(async move {
            let _guard = guard;
            match inner.stop_locked(timeout).await {
                Ok(_) | Err(SupervisorError::NotRunning) => {}
                Err(e) => return Err(e),
            }
            inner.start_locked().await
        })
        .await
    }

    /// Stop the process for backend shutdown, waiting for any in-flight
    /// lifecycle operation first.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        let guard = self.inner.lifecycle.clone().lock_owned().await;
        let inner = self.inner.clone();
        run_detached(async move {
            let _guard = guard;
            match inner.stop_locked(inner.config.stop_timeout).await {
                Ok(_) | Err(SupervisorError::NotRunning) => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await
    }

    fn try_acquire(&self) -> Result<OwnedMutexGuard<()>, SupervisorError> {
        self.inner
            .lifecycle
            .clone()
            .try_lock_owned()
            .map_err(|_| SupervisorError::OperationInProgress)
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.inner.force_kill();
    }
}

/// Run a lifecycle operation on its own task. Dropping the returned future
/// does not cancel the operation.
async fn run_detached<T, F>(operation: F) -> Result<T, SupervisorError>
where
    F: Future<Output = Result<T, SupervisorError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(operation)
        .await
        .map_err(|e| SupervisorError::Io(std::io::Error::other(e.to_string())))?
}

impl Supervised {
    fn status(&self) -> ProcessStatus {
        self.status_tx.borrow().clone()
    }

    async fn start_locked(&self) -> Result<ProcessStatus, SupervisorError> {
        if !self.status_tx.borrow().state.can_start() {
            return Err(SupervisorError::AlreadyRunning);
        }

        let mut command = self.build_command()?;
        let mut child = command.spawn().map_err(|e| {
            error!("[{}] Failed to spawn server process: {}", self.name, e);
            SupervisorError::StartFailed(format!("failed to spawn process: {}", e))
        })?;
        let Some(pid) = child.id() else {
            return Err(SupervisorError::StartFailed(
                "process exited before it could be tracked".to_string(),
            ));
        };

        if let Some(stdin) = child.stdin.take() {
            self.commands.attach(stdin).await;
        }
        tokio::spawn(pump_output(
            self.name.clone(),
            child.stdout.take(),
            child.stderr.take(),
            self.console.clone(),
        ));

        self.status_tx.send_modify(|status| {
            status.state = ServerState::Starting;
            status.pid = Some(pid);
            status.started_at = Some(Utc::now());
        });
        info!("[{}] Server process started with PID {}", self.name, pid);

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, mut exit_rx) = watch::channel(None);
        tokio::spawn(watch_exit(ExitWatcher {
            name: self.name.clone(),
            child,
            kill_rx,
            exit_tx,
            status_tx: self.status_tx.clone(),
            commands: self.commands.clone(),
        }));
        *self.lock_process() = Some(RunningProcess {
            pid,
            kill_tx: Some(kill_tx),
            exit_rx: exit_rx.clone(),
        });

        let grace_deadline = Instant::now() + self.config.startup_grace;
        if let Some(exit) = wait_for_exit(&mut exit_rx, grace_deadline).await {
            self.lock_process().take();
            self.status_tx.send_modify(|status| {
                status.state = ServerState::Crashed;
                status.pid = None;
                status.last_exit = Some(exit.clone());
            });
            warn!("[{}] Server exited during startup: {}", self.name, exit);
            return Err(SupervisorError::StartFailed(format!(
                "server exited during startup ({})",
                exit
            )));
        }

        let mut promoted = false;
        self.status_tx.send_if_modified(|status| {
            if status.state == ServerState::Starting {
                status.state = ServerState::Running;
                promoted = true;
            }
            promoted
        });
        if !promoted {
            // The watcher saw the exit first and already published it.
            self.lock_process().take();
            let exit = self
                .status()
                .last_exit
                .map(|exit| exit.describe())
                .unwrap_or_else(|| "unknown exit".to_string());
            return Err(SupervisorError::StartFailed(format!(
                "server exited during startup ({})",
                exit
            )));
        }

        info!("[{}] Server is running", self.name);
        Ok(self.status())
    }

    async fn stop_locked(&self, timeout: Duration) -> Result<ProcessStatus, SupervisorError> {
        let mut accepted = false;
        self.status_tx.send_if_modified(|status| {
            if status.state.is_active() {
                status.state = ServerState::Stopping;
                accepted = true;
            }
            accepted
        });
        if !accepted {
            return Err(SupervisorError::NotRunning);
        }

        let handle = self
            .lock_process()
            .as_ref()
            .map(|p| (p.pid, p.exit_rx.clone()));
        let Some((pid, mut exit_rx)) = handle else {
            self.status_tx
                .send_modify(|status| status.state = ServerState::Stopped);
            return Err(SupervisorError::NotRunning);
        };

        info!("[{}] Stopping server (PID {})", self.name, pid);
        // Delivering the stop line and waiting for the exit share one budget.
        let deadline = Instant::now() + timeout;
        let delivered = tokio::time::timeout_at(
            deadline,
            self.commands.write_line(&self.config.stop_command),
        )
        .await;
        match delivered {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("[{}] Stop command not delivered ({}), sending SIGTERM", self.name, e);
                send_signal(pid, libc::SIGTERM);
            }
            Err(_) => {
                debug!("[{}] Stop command write timed out, sending SIGTERM", self.name);
                send_signal(pid, libc::SIGTERM);
            }
        }

        let exit = match wait_for_exit(&mut exit_rx, deadline).await {
            Some(exit) => exit,
            None => self.escalate(pid, &mut exit_rx).await?,
        };

        self.lock_process().take();
        self.status_tx.send_modify(|status| {
            status.state = ServerState::Stopped;
            status.pid = None;
            status.last_exit = Some(exit.clone());
        });
        info!("[{}] Server stopped: {}", self.name, exit);
        Ok(self.status())
    }

    /// SIGTERM, then SIGKILL, each bounded by `kill_grace`.
    async fn escalate(
        &self,
        pid: u32,
        exit_rx: &mut watch::Receiver<Option<ExitInfo>>,
    ) -> Result<ExitInfo, SupervisorError> {
        warn!(
            "[{}] Server did not stop within the timeout, sending SIGTERM",
            self.name
        );
        send_signal(pid, libc::SIGTERM);
        if let Some(exit) = wait_for_exit(exit_rx, Instant::now() + self.config.kill_grace).await {
            return Ok(exit);
        }

        warn!("[{}] Server ignored SIGTERM, killing", self.name);
        self.force_kill();
        if let Some(exit) = wait_for_exit(exit_rx, Instant::now() + self.config.kill_grace).await {
            return Ok(exit);
        }

        error!("[{}] Server did not exit after SIGKILL", self.name);
        self.status_tx
            .send_modify(|status| status.state = ServerState::Crashed);
        Err(SupervisorError::Timeout)
    }

    fn force_kill(&self) {
        let kill_tx = self.lock_process().as_mut().and_then(|p| p.kill_tx.take());
        if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.send(());
        }
    }

    fn build_command(&self) -> Result<Command, SupervisorError> {
        let target = self.workspace_root.join(&self.config.executable);
        if !target.is_file() {
            return Err(SupervisorError::StartFailed(format!(
                "server executable not found at {}",
                target.display()
            )));
        }

        let mut command = if is_jar(&target) {
            let mut command = Command::new(&self.config.java_binary);
            command
                .arg(format!("-Xmx{}M", self.config.memory_mb))
                .arg(format!("-Xms{}M", self.config.memory_mb))
                .arg("-jar")
                .arg(&target)
                .arg("nogui");
            command
        } else {
            Command::new(&target)
        };

        command
            .args(&self.config.args)
            .current_dir(&self.workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(command)
    }

    fn lock_process(&self) -> std::sync::MutexGuard<'_, Option<RunningProcess>> {
        self.process.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn is_jar(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jar"))
}

fn send_signal(pid: u32, signal: i32) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    unsafe {
        if libc::kill(pid, signal) != 0 {
            debug!(
                "Signal {} to PID {} failed: {}",
                signal,
                pid,
                std::io::Error::last_os_error()
            );
        }
    }
}

/// Wait until `deadline` for the exit watcher to publish an exit.
async fn wait_for_exit(
    exit_rx: &mut watch::Receiver<Option<ExitInfo>>,
    deadline: Instant,
) -> Option<ExitInfo> {
    match tokio::time::timeout_at(deadline, exit_rx.wait_for(Option::is_some)).await {
        Ok(Ok(exit)) => exit.clone(),
        Ok(Err(_)) | Err(_) => None,
    }
}

struct ExitWatcher {
    name: String,
    child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    status_tx: Arc<watch::Sender<ProcessStatus>>,
    commands: Arc<CommandChannel>,
}

/// Own the child until it exits, then publish how it ended.
///
/// A self-exit from `Starting`/`Running` becomes `Stopped` (code 0) or
/// `Crashed`. While `Stopping`, only the exit is recorded and the stopping
/// caller finishes the transition.
async fn watch_exit(watcher: ExitWatcher) {
    let ExitWatcher {
        name,
        mut child,
        kill_rx,
        exit_tx,
        status_tx,
        commands,
    } = watcher;

    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                warn!("[{}] Failed to kill server process: {}", name, e);
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => ExitInfo::from_status(status),
        Err(e) => {
            error!("[{}] Failed waiting for server process: {}", name, e);
            ExitInfo::unknown()
        }
    };

    commands.detach().await;

    status_tx.send_modify(|status| {
        status.last_exit = Some(exit.clone());
        if status.state.is_active() {
            status.pid = None;
            status.state = if exit.success() {
                ServerState::Stopped
            } else {
                ServerState::Crashed
            };
        }
    });
    if exit.success() {
        info!("[{}] Server process {}", name, exit);
    } else {
        warn!("[{}] Server process {}", name, exit);
    }

    let _ = exit_tx.send(Some(exit));
}

/// Drain stdout and stderr line by line into the console buffer.
async fn pump_output(
    name: String,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    console: Arc<ConsoleLogBuffer>,
) {
    let mut stdout = stdout.map(BufReader::new);
    let mut stderr = stderr.map(BufReader::new);
    // read_until keeps partial data in the buffer when cancelled by select!.
    let mut out_buf = Vec::new();
    let mut err_buf = Vec::new();

    loop {
        tokio::select! {
            read = next_line(&mut stdout, &mut out_buf), if stdout.is_some() => {
                if !matches!(read, Ok(n) if n > 0) {
                    stdout = None;
                }
                if !out_buf.is_empty() {
                    emit_line(&name, "stdout", &mut out_buf, &console);
                }
            }
            read = next_line(&mut stderr, &mut err_buf), if stderr.is_some() => {
                if !matches!(read, Ok(n) if n > 0) {
                    stderr = None;
                }
                if !err_buf.is_empty() {
                    emit_line(&name, "stderr", &mut err_buf, &console);
                }
            }
            else => break,
        }
    }
    debug!("[{}] Output streams closed", name);
}

async fn next_line<R>(reader: &mut Option<R>, buf: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    match reader {
        Some(reader) => reader.read_until(b'\n', buf).await,
        None => std::future::pending().await,
    }
}

fn emit_line(name: &str, stream: &str, buf: &mut Vec<u8>, console: &ConsoleLogBuffer) {
    let mut end = buf.len();
    if end > 0 && buf[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && buf[end - 1] == b'\r' {
        end -= 1;
    }
    let text = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.clear();

    debug!(instance = %name, stream, "{}", text);
    console.append(text);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placeholder::PLACEHOLDER_SCRIPT;
    use tempfile::TempDir;

    const STUBBORN_SCRIPT: &str = r#"trap '' TERM
echo "ignoring everything"
while true; do
  sleep 0.1
done
"#;

    const SLOW_STOP_SCRIPT: &str = r#"while read -r cmd; do
  if [ "$cmd" = "stop" ]; then
    echo "saving world"
    sleep 0.5
    exit 0
  fi
done
"#;

    fn bash() -> String {
        ["/bin/bash", "/usr/bin/bash"]
            .into_iter()
            .find(|p| Path::new(p).exists())
            .unwrap_or("/bin/bash")
            .to_string()
    }

    fn supervisor_for(script: &str) -> (TempDir, Arc<ConsoleLogBuffer>, ProcessSupervisor) {
        supervisor_with(script, |_| {})
    }

    fn supervisor_with(
        script: &str,
        tweak: impl FnOnce(&mut SupervisorConfig),
    ) -> (TempDir, Arc<ConsoleLogBuffer>, ProcessSupervisor) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("server.sh"), script).unwrap();
        let mut config = SupervisorConfig {
            executable: bash(),
            args: vec!["server.sh".to_string()],
            stop_timeout: Duration::from_secs(5),
            kill_grace: Duration::from_secs(2),
            startup_grace: Duration::from_millis(200),
            ..SupervisorConfig::default()
        };
        tweak(&mut config);
        let console = Arc::new(ConsoleLogBuffer::new(100));
        let supervisor = ProcessSupervisor::new("test", dir.path(), config, console.clone());
        (dir, console, supervisor)
    }

    async fn wait_for_console(console: &ConsoleLogBuffer, needle: &str) -> bool {
        for _ in 0..100 {
            if console.snapshot().iter().any(|l| l.contains(needle)) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    async fn wait_for_state(supervisor: &ProcessSupervisor, state: ServerState) -> bool {
        let mut rx = supervisor.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.state == state))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    #[tokio::test]
    async fn test_start_then_start_again_fails() {
        let (_dir, _console, supervisor) = supervisor_for(PLACEHOLDER_SCRIPT);
        assert_eq!(supervisor.status().state, ServerState::Stopped);

        let status = supervisor.start().await.unwrap();
        assert_eq!(status.state, ServerState::Running);
        assert!(status.pid.is_some());
        assert!(status.started_at.is_some());

        assert!(matches!(
            supervisor.start().await,
            Err(SupervisorError::AlreadyRunning)
        ));

        supervisor.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_graceful_stop_records_clean_exit() {
        let (_dir, console, supervisor) = supervisor_for(PLACEHOLDER_SCRIPT);
        supervisor.start().await.unwrap();

        let status = supervisor.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(status.state, ServerState::Stopped);
        assert_eq!(status.pid, None);
        assert_eq!(status.last_exit.as_ref().and_then(|e| e.code), Some(0));
        assert!(wait_for_console(&console, "Stop command received").await);

        assert!(matches!(
            supervisor.stop(Duration::from_secs(1)).await,
            Err(SupervisorError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_commands_reach_process_and_output_is_captured() {
        let (_dir, console, supervisor) = supervisor_for(PLACEHOLDER_SCRIPT);
        supervisor.start().await.unwrap();

        supervisor.commands().send("say hello").await.unwrap();
        assert!(wait_for_console(&console, "CMD_RECEIVED: say hello").await);

        supervisor.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_command_through_channel_stops_server() {
        let (_dir, _console, supervisor) = supervisor_for(PLACEHOLDER_SCRIPT);
        supervisor.start().await.unwrap();

        supervisor.commands().send("stop").await.unwrap();
        assert!(wait_for_state(&supervisor, ServerState::Stopped).await);

        let status = supervisor.status();
        assert!(status.last_exit.unwrap().success());
        assert!(matches!(
            supervisor.commands().send("list").await,
            Err(SupervisorError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_crash() {
        let (_dir, console, supervisor) =
            supervisor_for("echo booting\nread -r line\necho fatal >&2\nexit 3\n");
        supervisor.start().await.unwrap();

        supervisor.commands().send("go").await.unwrap();
        assert!(wait_for_state(&supervisor, ServerState::Crashed).await);
        assert_eq!(
            supervisor.status().describe(),
            "crashed (exited with code 3)"
        );
        assert!(wait_for_console(&console, "fatal").await);

        // Crashed accepts a new start.
        let status = supervisor.start().await.unwrap();
        assert_eq!(status.state, ServerState::Running);
        supervisor.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_during_startup_fails_start() {
        let (_dir, _console, supervisor) = supervisor_with("exit 0\n", |config| {
            config.startup_grace = Duration::from_secs(2);
        });
        assert!(matches!(
            supervisor.start().await,
            Err(SupervisorError::StartFailed(_))
        ));
        assert_eq!(supervisor.status().state, ServerState::Crashed);
    }

    #[tokio::test]
    async fn test_missing_executable_fails_start() {
        let dir = TempDir::new().unwrap();
        let console = Arc::new(ConsoleLogBuffer::new(10));
        let supervisor = ProcessSupervisor::new(
            "test",
            dir.path(),
            SupervisorConfig::default(),
            console,
        );

        match supervisor.start().await {
            Err(SupervisorError::StartFailed(msg)) => {
                assert!(msg.contains("server executable not found"))
            }
            other => panic!("expected StartFailed, got {:?}", other),
        }
        assert_eq!(supervisor.status().state, ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_stubborn_process_is_killed() {
        let (_dir, _console, supervisor) = supervisor_with(STUBBORN_SCRIPT, |config| {
            config.kill_grace = Duration::from_millis(300);
        });
        supervisor.start().await.unwrap();

        let status = supervisor.stop(Duration::from_millis(300)).await.unwrap();
        assert_eq!(status.state, ServerState::Stopped);
        let exit = status.last_exit.unwrap();
        assert_eq!(exit.signal, Some(libc::SIGKILL));
        assert_eq!(exit.describe(), "killed by SIGKILL (signal 9)");
    }

    #[tokio::test]
    async fn test_concurrent_lifecycle_calls_conflict() {
        let (_dir, _console, supervisor) = supervisor_for(PLACEHOLDER_SCRIPT);
        supervisor.start().await.unwrap();

        let (first, second) = tokio::join!(
            supervisor.restart(Duration::from_secs(5)),
            supervisor.stop(Duration::from_secs(5)),
        );
        assert!(first.is_ok());
        assert!(matches!(second, Err(SupervisorError::OperationInProgress)));

        supervisor.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_stop_still_completes() {
        let (_dir, _console, supervisor) = supervisor_for(SLOW_STOP_SCRIPT);
        supervisor.start().await.unwrap();

        // The caller gives up long before the server finishes shutting down.
        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), supervisor.stop(Duration::from_secs(5)))
                .await;
        assert!(abandoned.is_err());

        assert!(wait_for_state(&supervisor, ServerState::Stopped).await);
        let status = supervisor.status();
        assert_eq!(status.pid, None);
        assert!(status.last_exit.unwrap().success());

        // The slot frees up once the detached stop returns.
        let status = loop {
            match supervisor.start().await {
                Err(SupervisorError::OperationInProgress) => {
                    tokio::time::sleep(Duration::from_millis(20)).await
                }
                other => break other.unwrap(),
            }
        };
        assert_eq!(status.state, ServerState::Running);
        supervisor.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_from_stopped_starts() {
        let (_dir, _console, supervisor) = supervisor_for(PLACEHOLDER_SCRIPT);
        let status = supervisor.restart(Duration::from_secs(5)).await.unwrap();
        assert_eq!(status.state, ServerState::Running);
        let first_pid = status.pid;

        let status = supervisor.restart(Duration::from_secs(5)).await.unwrap();
        assert_eq!(status.state, ServerState::Running);
        assert_ne!(status.pid, first_pid);

        supervisor.shutdown().await.unwrap();
        assert_eq!(supervisor.status().state, ServerState::Stopped);
    }

    #[test]
    fn test_is_jar() {
        assert!(is_jar(Path::new("/srv/server.jar")));
        assert!(is_jar(Path::new("paper.JAR")));
        assert!(!is_jar(Path::new("dummy_server.sh")));
        assert!(!is_jar(Path::new("jar")));
    }

    #[test]
    fn test_emit_line_strips_line_endings_and_replaces_invalid_utf8() {
        let console = ConsoleLogBuffer::new(10);
        let mut buf = b"Done!\r\n".to_vec();
        emit_line("test", "stdout", &mut buf, &console);
        assert!(buf.is_empty());

        let mut buf = vec![b'o', b'k', 0xff, b'\n'];
        emit_line("test", "stderr", &mut buf, &console);

        assert_eq!(console.snapshot(), vec!["Done!", "ok\u{fffd}"]);
    }
}
