//! In-flight agent run bookkeeping.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Registered but the process is not yet up.
    Starting,
    /// Process is alive.
    Running,
    /// Exited with status zero.
    Completed,
    /// Exited non-zero, failed to launch, or was killed.
    Failed,
}

impl RunStatus {
    /// Whether the status is final.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Read-only view of one active or just-finished run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    /// Internal identifier, `issue-<ticket>-<unix seconds>`.
    pub run_id: String,
    /// Ticket the run works on.
    pub ticket: u64,
    /// Project the ticket belongs to.
    pub project_path: String,
    /// Current status.
    pub status: RunStatus,
    /// OS process id once spawned.
    pub pid: Option<u32>,
    /// Working directory of the agent.
    pub working_dir: PathBuf,
    /// Resumable session id captured from output, if any.
    pub session_id: Option<String>,
    /// When the run was registered.
    pub started_at: DateTime<Utc>,
    /// When the process exited.
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure description for [`RunStatus::Failed`].
    pub error: Option<String>,
}

/// Build the internal run identifier for a ticket.
#[must_use]
pub fn run_id_for(ticket: u64, started_at: DateTime<Utc>) -> String {
    format!("issue-{ticket}-{}", started_at.timestamp())
}
