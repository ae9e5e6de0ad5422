//! Lifecycle state of a managed server process.

use std::fmt;
use std::process::ExitStatus;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle state of the managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Crashed => "crashed",
        }
    }

    /// A new start is only accepted from these states.
    pub fn can_start(&self) -> bool {
        matches!(self, ServerState::Stopped | ServerState::Crashed)
    }

    /// States in which a stop request is accepted.
    pub fn is_active(&self) -> bool {
        matches!(self, ServerState::Starting | ServerState::Running)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub at: DateTime<Utc>,
}

impl ExitInfo {
    pub fn new(code: Option<i32>, signal: Option<i32>) -> Self {
        Self {
            code,
            signal,
            at: Utc::now(),
        }
    }

    /// On Unix, a process killed by a signal has no exit code.
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self::new(status.code(), signal)
    }

    pub fn unknown() -> Self {
        Self::new(None, None)
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Human-readable rendering, e.g. "killed by SIGKILL (signal 9)".
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with code {}", code),
            (None, Some(sig)) => match signal_name(sig) {
                Some(name) => format!("killed by {} (signal {})", name, sig),
                None => format!("killed by signal {}", sig),
            },
            (None, None) => "exited (unknown status)".to_string(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

fn signal_name(sig: i32) -> Option<&'static str> {
    match sig {
        1 => Some("SIGHUP"),
        2 => Some("SIGINT"),
        6 => Some("SIGABRT"),
        9 => Some("SIGKILL"),
        11 => Some("SIGSEGV"),
        15 => Some("SIGTERM"),
        _ => None,
    }
}

/// Snapshot published by the supervisor on every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    pub state: ServerState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_exit: Option<ExitInfo>,
}

impl Default for ProcessStatus {
    fn default() -> Self {
        Self {
            state: ServerState::Stopped,
            pid: None,
            started_at: None,
            last_exit: None,
        }
    }
}

impl ProcessStatus {
    /// Status line shown to polling clients, e.g. "stopped (exited with code 0)".
    pub fn describe(&self) -> String {
        match (self.state, &self.last_exit) {
            (ServerState::Stopped | ServerState::Crashed, Some(exit)) => {
                format!("{} ({})", self.state, exit.describe())
            }
            (state, _) => state.to_string(),
        }
    }
}
