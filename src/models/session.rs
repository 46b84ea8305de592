//! Durable session records used to resume an agent conversation.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Everything needed to relaunch the agent in the same environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentSnapshot {
    /// Agent executable.
    pub command: String,
    /// Flags passed before the prompt.
    pub flags: Vec<String>,
    /// Directory the agent ran in.
    pub working_dir: PathBuf,
    /// Full environment variable map at launch.
    pub env: BTreeMap<String, String>,
}

/// A completed run that may later be resumed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    /// Ticket sequence number; primary key.
    pub ticket: u64,
    /// Agent-side resumable session identifier.
    pub session_id: String,
    /// Tracker project path the ticket belongs to.
    pub project_path: String,
    /// When the run finished.
    pub completed_at: DateTime<Utc>,
    /// Newest comment already fed back to the agent.
    pub last_comment_at: Option<DateTime<Utc>>,
    /// Execution environment captured at completion.
    pub environment: EnvironmentSnapshot,
}

impl SessionRecord {
    /// Construct a record completed now.
    #[must_use]
    pub fn new(
        ticket: u64,
        session_id: String,
        project_path: String,
        environment: EnvironmentSnapshot,
    ) -> Self {
        Self {
            ticket,
            session_id,
            project_path,
            completed_at: Utc::now(),
            last_comment_at: None,
            environment,
        }
    }

    /// Comments strictly newer than this instant are unseen.
    #[must_use]
    pub fn comment_cutoff(&self) -> DateTime<Utc> {
        match self.last_comment_at {
            Some(seen) if seen > self.completed_at => seen,
            _ => self.completed_at,
        }
    }

    /// Whether the stored identifier may be used for a resume.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        is_valid_session_id(&self.session_id)
    }
}

/// Check that `candidate` is a canonical lowercase hyphenated UUID.
///
/// Legacy records stored internal run ids such as `issue-42-1699999999`;
/// those never pass.
#[must_use]
pub fn is_valid_session_id(candidate: &str) -> bool {
    candidate.len() == 36
        && Uuid::try_parse(candidate)
            .is_ok_and(|id| id.hyphenated().to_string() == candidate)
}
