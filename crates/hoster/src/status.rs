//! Read-only status projection for polling clients.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::process::{ExitInfo, ProcessStatus, ServerState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Human-readable status, e.g. "stopped (exited with code 0)".
    pub server_status: String,
    pub state: ServerState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_exit: Option<ExitInfo>,
}

impl From<&ProcessStatus> for StatusReport {
    fn from(status: &ProcessStatus) -> Self {
        Self {
            server_status: status.describe(),
            state: status.state,
            pid: status.pid,
            started_at: status.started_at,
            last_exit: status.last_exit.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusReporter {
    status: watch::Receiver<ProcessStatus>,
}

impl StatusReporter {
    pub fn new(status: watch::Receiver<ProcessStatus>) -> Self {
        Self { status }
    }

    pub fn report(&self) -> StatusReport {
        StatusReport::from(&*self.status.borrow())
    }

    /// Time since start while the process is up.
    pub fn uptime(&self) -> Option<Duration> {
        let status = self.status.borrow();
        match (status.state, status.started_at) {
            (ServerState::Running | ServerState::Starting, Some(started_at)) => {
                Some(Utc::now() - started_at)
            }
            _ => None,
        }
    }
}
