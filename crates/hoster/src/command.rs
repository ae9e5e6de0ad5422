//! Ordered delivery of console commands to the managed process.

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::{Mutex, watch};
use tracing::debug;

use crate::process::{ProcessStatus, ServerState};
use crate::supervisor::SupervisorError;

/// Writes newline-terminated commands to the process's stdin.
///
/// The stdin handle sits behind a fair async mutex, so concurrent senders
/// are written strictly in arrival order.
#[derive(Debug)]
pub struct CommandChannel {
    stdin: Mutex<Option<ChildStdin>>,
    status: watch::Receiver<ProcessStatus>,
}

impl CommandChannel {
    pub fn new(status: watch::Receiver<ProcessStatus>) -> Self {
        Self {
            stdin: Mutex::new(None),
            status,
        }
    }

    /// Send one command line. Only accepted while the server is running.
    pub async fn send(&self, text: &str) -> Result<(), SupervisorError> {
        if self.status.borrow().state != ServerState::Running {
            return Err(SupervisorError::NotRunning);
        }

        let command = text.trim();
        if command.is_empty() {
            return Err(SupervisorError::InvalidCommand(
                "command must not be empty".to_string(),
            ));
        }
        if command.contains(['\n', '\r']) {
            return Err(SupervisorError::InvalidCommand(
                "command must be a single line".to_string(),
            ));
        }

        self.write_line(command).await
    }

    /// Write a line regardless of lifecycle state. Used for the stop command.
    pub(crate) async fn write_line(&self, line: &str) -> Result<(), SupervisorError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(SupervisorError::NotRunning)?;

        let mut payload = String::with_capacity(line.len() + 1);
        payload.push_str(line);
        payload.push('\n');

        stdin.write_all(payload.as_bytes()).await?;
        stdin.flush().await?;
        debug!("Sent command: {}", line);
        Ok(())
    }

    pub(crate) async fn attach(&self, stdin: ChildStdin) {
        *self.stdin.lock().await = Some(stdin);
    }

    /// Drop the stdin handle, closing the pipe.
    pub(crate) async fn detach(&self) {
        self.stdin.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::process::Command;

    fn channel(state: ServerState) -> (watch::Sender<ProcessStatus>, CommandChannel) {
        let (tx, rx) = watch::channel(ProcessStatus {
            state,
            ..ProcessStatus::default()
        });
        (tx, CommandChannel::new(rx))
    }

    #[tokio::test]
    async fn test_send_requires_running_state() {
        for state in [
            ServerState::Stopped,
            ServerState::Starting,
            ServerState::Stopping,
            ServerState::Crashed,
        ] {
            let (_tx, commands) = channel(state);
            for text in ["say hi", "", "   ", "stop"] {
                assert!(matches!(
                    commands.send(text).await,
                    Err(SupervisorError::NotRunning)
                ));
            }
        }
    }

    #[tokio::test]
    async fn test_send_rejects_blank_and_multiline_commands() {
        let (_tx, commands) = channel(ServerState::Running);
        assert!(matches!(
            commands.send("   ").await,
            Err(SupervisorError::InvalidCommand(_))
        ));
        assert!(matches!(
            commands.send("say a\nstop").await,
            Err(SupervisorError::InvalidCommand(_))
        ));
    }

    #[tokio::test]
    async fn test_send_without_stdin_is_not_running() {
        let (_tx, commands) = channel(ServerState::Running);
        assert!(matches!(
            commands.send("list").await,
            Err(SupervisorError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_commands_delivered_in_order() {
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let (_tx, commands) = channel(ServerState::Running);
        commands.attach(child.stdin.take().unwrap()).await;

        commands.send("  say one  ").await.unwrap();
        commands.send("say two").await.unwrap();
        commands.send("say three").await.unwrap();
        commands.detach().await;

        let mut lines = BufReader::new(child.stdout.take().unwrap()).lines();
        let mut received = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            received.push(line);
        }
        assert_eq!(received, vec!["say one", "say two", "say three"]);

        let status = child.wait().await.unwrap();
        assert!(status.success());
    }
}
