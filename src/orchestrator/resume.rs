//! Resume path: relaunch the agent on a stored session with new comments.
//!
//! Resumes are fire-and-forget. The registry tracks one resume subprocess
//! per ticket so the review scan can skip tickets still being worked and
//! shutdown can signal them. The exit of a resume updates the session store.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::tasks::{send_terminate, spawn_detached};
use crate::agent::command::AgentCommand;
use crate::agent::line_reader;
use crate::persistence::session_repo::SessionRepo;
use crate::{AppError, Result};

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// A resume the scheduler has decided to launch.
#[derive(Debug, Clone)]
pub struct ResumeRequest {
    /// Invocation built from the stored environment snapshot.
    pub command: AgentCommand,
    /// Creation time of the newest note included in the prompt.
    pub newest_note_at: DateTime<Utc>,
}

/// How a resume subprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeExit {
    /// Exit status zero.
    Completed,
    /// Non-zero exit without a missing-session marker.
    Failed,
    /// The agent reported the session does not exist.
    TargetInvalid,
    /// Killed by daemon shutdown.
    Cancelled,
}

struct ResumeEntry {
    pid: Option<u32>,
    kill: CancellationToken,
}

/// Registry of in-flight resume subprocesses keyed by ticket.
#[derive(Clone, Default)]
pub struct ResumeRegistry {
    active: Arc<Mutex<HashMap<u64, ResumeEntry>>>,
}

impl ResumeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a resume for `ticket` is still running.
    pub async fn is_active(&self, ticket: u64) -> bool {
        self.active.lock().await.contains_key(&ticket)
    }

    /// Number of running resumes.
    pub async fn len(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Whether no resumes are running.
    pub async fn is_empty(&self) -> bool {
        self.active.lock().await.is_empty()
    }

    /// Spawn the resume subprocess and return its pid without waiting.
    ///
    /// A detached task waits for exit and then updates `repo`: the record is
    /// removed on [`ResumeExit::TargetInvalid`], left untouched on
    /// [`ResumeExit::Cancelled`], and otherwise its `last_comment_at` is
    /// advanced to `request.newest_note_at`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch` if a resume for the ticket is already
    /// running or the process fails to spawn.
    pub async fn launch(
        &self,
        request: ResumeRequest,
        repo: SessionRepo,
        shutdown: CancellationToken,
    ) -> Result<Option<u32>> {
        let ticket = request.command.ticket;
        let mut active = self.active.lock().await;
        if active.contains_key(&ticket) {
            return Err(AppError::Launch(format!(
                "a resume is already running for ticket {ticket}"
            )));
        }

        let mut child = request.command.spawn(Stdio::piped())?;
        let pid = child.id();
        let kill = CancellationToken::new();
        active.insert(
            ticket,
            ResumeEntry {
                pid,
                kill: kill.clone(),
            },
        );
        drop(active);

        info!(
            ticket,
            pid,
            session_id = request.command.resume.as_deref().unwrap_or_default(),
            working_dir = %request.command.working_dir.display(),
            "resume started"
        );

        let registry = self.clone();
        let newest = request.newest_note_at;
        let session_id = request.command.resume.clone().unwrap_or_default();
        let _detached = spawn_detached("resume_wait", ticket, async move {
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let watch = async {
                let (out_missing, err_missing) = tokio::join!(
                    scan_stream(ticket, Channel::Stdout, stdout),
                    scan_stream(ticket, Channel::Stderr, stderr)
                );
                let status = child.wait().await;
                (out_missing || err_missing, status)
            };

            let finished = tokio::select! {
                biased;
                () = kill.cancelled() => None,
                done = watch => Some(done),
            };

            let exit = match finished {
                None => {
                    if let Err(err) = child.kill().await {
                        warn!(ticket, %err, "force-kill of resume failed");
                    }
                    ResumeExit::Cancelled
                }
                Some(_) if shutdown.is_cancelled() => ResumeExit::Cancelled,
                Some((_, Ok(status))) if status.success() => ResumeExit::Completed,
                Some((true, _)) => ResumeExit::TargetInvalid,
                Some((false, status)) => {
                    warn!(ticket, ?status, "resume exited unsuccessfully");
                    ResumeExit::Failed
                }
            };

            settle(&repo, ticket, &session_id, exit, newest).await;
            registry.active.lock().await.remove(&ticket);
        });

        Ok(pid)
    }

    /// SIGTERM every resume, wait up to `grace`, then force-kill survivors.
    pub async fn terminate_all(&self, grace: Duration) {
        let targets: Vec<(u64, Option<u32>)> = {
            let active = self.active.lock().await;
            active.iter().map(|(t, e)| (*t, e.pid)).collect()
        };
        if targets.is_empty() {
            return;
        }

        info!(count = targets.len(), "terminating resume sessions");
        for (_, pid) in &targets {
            if let Some(pid) = pid {
                let _ = send_terminate(*pid);
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline && !self.is_empty().await {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let active = self.active.lock().await;
        for (ticket, entry) in active.iter() {
            warn!(ticket, "resume survived grace period, force-killing");
            entry.kill.cancel();
        }
    }
}

/// Apply the store update for a finished resume.
async fn settle(
    repo: &SessionRepo,
    ticket: u64,
    session_id: &str,
    exit: ResumeExit,
    newest: DateTime<Utc>,
) {
    match exit {
        ResumeExit::Cancelled => {
            info!(ticket, "resume cancelled by shutdown");
        }
        ResumeExit::TargetInvalid => {
            let err = AppError::ResumeTargetInvalid(format!(
                "agent has no conversation {session_id} for ticket {ticket}"
            ));
            warn!(ticket, %err, "removing stale session record");
            if let Err(err) = repo.remove(ticket).await {
                warn!(ticket, %err, "failed to remove stale session record");
            }
        }
        ResumeExit::Completed | ResumeExit::Failed => {
            if exit == ResumeExit::Completed {
                info!(ticket, "resume completed");
            }
            match repo.update_last_comment_time(ticket, newest).await {
                Ok(()) => debug!(ticket, %newest, "advanced last comment time"),
                Err(AppError::NotFound(_)) => {
                    debug!(ticket, "session record removed while resume ran");
                }
                Err(err) => warn!(ticket, %err, "failed to record last comment time"),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Stdout,
    Stderr,
}

impl Channel {
    fn name(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    /// Stderr is matched as free text; stdout only through structured
    /// error results, since it carries arbitrary tool output.
    fn reports_missing_session(self, line: &str) -> bool {
        match self {
            Self::Stderr => is_missing_session(line),
            Self::Stdout => error_text(line).is_some_and(|text| is_missing_session(&text)),
        }
    }
}

/// Drain one output stream into the log; report whether it said the
/// resume target is missing.
async fn scan_stream<R>(ticket: u64, channel: Channel, source: Option<R>) -> bool
where
    R: AsyncRead + Unpin,
{
    let Some(source) = source else {
        return false;
    };
    let stream = channel.name();
    let mut lines = line_reader(source);
    let mut missing = false;
    while let Some(item) = lines.next().await {
        match item {
            Ok(line) => {
                debug!(ticket, stream, line = %line, "resume output");
                if !missing && channel.reports_missing_session(&line) {
                    missing = true;
                }
            }
            Err(err) => {
                warn!(ticket, stream, %err, "resume output read failed");
                break;
            }
        }
    }
    missing
}

/// Message of a JSON error event or error result on the agent's stdout.
fn error_text(line: &str) -> Option<String> {
    let event: Value = serde_json::from_str(line.trim()).ok()?;
    let is_error = event.get("is_error").and_then(Value::as_bool).unwrap_or(false)
        || event.get("type").and_then(Value::as_str) == Some("error");
    if !is_error {
        return None;
    }
    ["result", "error", "message"]
        .iter()
        .find_map(|key| event.get(*key).and_then(Value::as_str))
        .map(str::to_owned)
}

/// Whether an error message says the resume target does not exist.
///
/// Matches the agent's "No conversation found" error, or a "not found"
/// that names a session or conversation. Plain "not found" from tools
/// (`command not found`, `file not found`) does not count.
#[must_use]
pub fn is_missing_session(text: &str) -> bool {
    if text.contains("No conversation found") {
        return true;
    }
    let lower = text.to_lowercase();
    lower.contains("not found") && (lower.contains("session") || lower.contains("conversation"))
}
