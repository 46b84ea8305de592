//! Process lifecycle manager for fresh agent runs.
//!
//! Each run is one agent subprocess working one ticket. The manager keeps a
//! table keyed by ticket number, so at most one run per ticket exists at any
//! time. A supervisor task per run reads stdout, captures the resumable
//! session id, waits for exit, and then invokes the run's completion
//! callback before dropping the run from the table.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::tasks::{panic_message, send_terminate};
use crate::agent::command::AgentCommand;
use crate::agent::line_reader;
use crate::agent::session_id::SessionIdScanner;
use crate::models::run::{run_id_for, RunStatus, RunSummary};
use crate::{AppError, Result};

/// Interval at which shutdown polls for runs that exited on their own.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Everything the scheduler knows when it asks for a run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Project the ticket belongs to.
    pub project_path: String,
    /// Fully prepared agent invocation; `command.ticket` keys the run.
    pub command: AgentCommand,
    /// Whether the workspace was cloned for this run.
    pub cloned: bool,
}

/// Final state handed to the completion callback.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Terminal summary: status, timings, captured session id.
    pub summary: RunSummary,
    /// The invocation the run was launched with.
    pub command: AgentCommand,
    /// Whether the workspace was cloned for this run.
    pub cloned: bool,
}

impl RunOutcome {
    /// Whether the agent exited with status zero.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.summary.status == RunStatus::Completed
    }
}

/// Synchronous completion hook. Long side effects must be dispatched onto
/// a detached task by the hook itself.
pub type CompletionCallback = Box<dyn FnOnce(RunOutcome) + Send + 'static>;

struct RunEntry {
    summary: RunSummary,
    kill: CancellationToken,
}

/// Concurrent-safe table of active runs.
#[derive(Clone)]
pub struct RunManager {
    runs: Arc<Mutex<HashMap<u64, RunEntry>>>,
    scanner: Arc<SessionIdScanner>,
}

impl RunManager {
    /// Create an empty manager.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the session-id patterns fail to compile.
    pub fn new() -> Result<Self> {
        Ok(Self {
            runs: Arc::new(Mutex::new(HashMap::new())),
            scanner: Arc::new(SessionIdScanner::new()?),
        })
    }

    /// Spawn the agent for `request` and supervise it in the background.
    ///
    /// Returns the summary with status [`RunStatus::Running`]. If the
    /// process cannot be started, `on_complete` is invoked with a failed
    /// outcome, nothing stays in the table, and the launch error is returned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch` if a run for the ticket is already active
    /// or the process fails to spawn.
    pub async fn start(
        &self,
        request: RunRequest,
        on_complete: CompletionCallback,
    ) -> Result<RunSummary> {
        let ticket = request.command.ticket;
        let started_at = Utc::now();
        let run_id = run_id_for(ticket, started_at);
        let kill = CancellationToken::new();

        let mut summary = RunSummary {
            run_id: run_id.clone(),
            ticket,
            project_path: request.project_path.clone(),
            status: RunStatus::Starting,
            pid: None,
            working_dir: request.command.working_dir.clone(),
            session_id: None,
            started_at,
            finished_at: None,
            error: None,
        };

        {
            let mut runs = self.runs.lock().await;
            if runs.contains_key(&ticket) {
                return Err(AppError::Launch(format!(
                    "a run is already active for ticket {ticket}"
                )));
            }
            runs.insert(
                ticket,
                RunEntry {
                    summary: summary.clone(),
                    kill: kill.clone(),
                },
            );
        }

        let child = match request.command.spawn(Stdio::inherit()) {
            Ok(child) => child,
            Err(err) => {
                warn!(ticket, run_id = %run_id, %err, "agent failed to start");
                summary.status = RunStatus::Failed;
                summary.finished_at = Some(Utc::now());
                summary.error = Some(err.to_string());
                invoke_callback(
                    on_complete,
                    RunOutcome {
                        summary,
                        command: request.command,
                        cloned: request.cloned,
                    },
                );
                self.runs.lock().await.remove(&ticket);
                return Err(err);
            }
        };

        summary.status = RunStatus::Running;
        summary.pid = child.id();
        if let Some(entry) = self.runs.lock().await.get_mut(&ticket) {
            entry.summary.status = RunStatus::Running;
            entry.summary.pid = summary.pid;
        }

        info!(
            ticket,
            run_id = %run_id,
            pid = summary.pid,
            working_dir = %summary.working_dir.display(),
            cloned = request.cloned,
            "agent run started"
        );

        let span = info_span!("agent_run", ticket, run_id = %run_id);
        let manager = self.clone();
        tokio::spawn(
            async move {
                manager.supervise(child, request, kill, on_complete).await;
            }
            .instrument(span),
        );

        Ok(summary)
    }

    async fn supervise(
        &self,
        mut child: Child,
        request: RunRequest,
        kill: CancellationToken,
        on_complete: CompletionCallback,
    ) {
        let ticket = request.command.ticket;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = line_reader(stdout);
            let mut captured = false;
            loop {
                tokio::select! {
                    biased;
                    () = kill.cancelled() => break,
                    item = lines.next() => match item {
                        None => break,
                        Some(Ok(line)) => {
                            debug!(ticket, line = %line, "agent output");
                            if !captured {
                                if let Some(id) = self.scanner.scan_line(&line) {
                                    captured = true;
                                    info!(ticket, session_id = %id, "captured agent session id");
                                    self.record_session_id(ticket, id).await;
                                }
                            }
                        }
                        Some(Err(err)) => {
                            warn!(ticket, %err, "agent stdout read failed");
                            break;
                        }
                    },
                }
            }
        }

        let exited = tokio::select! {
            biased;
            () = kill.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let (status, error) = match exited {
            Some(Ok(status)) if status.success() => (RunStatus::Completed, None),
            Some(Ok(status)) => (
                RunStatus::Failed,
                Some(AppError::Execution(format!("agent exited with {status}")).to_string()),
            ),
            Some(Err(err)) => (
                RunStatus::Failed,
                Some(AppError::Execution(format!("failed to wait for agent: {err}")).to_string()),
            ),
            None => {
                if let Err(err) = child.kill().await {
                    warn!(ticket, %err, "force-kill failed");
                }
                (RunStatus::Failed, Some("agent killed during shutdown".to_owned()))
            }
        };

        let summary = {
            let mut runs = self.runs.lock().await;
            match runs.get_mut(&ticket) {
                Some(entry) => {
                    entry.summary.status = status;
                    entry.summary.finished_at = Some(Utc::now());
                    entry.summary.error.clone_from(&error);
                    entry.summary.clone()
                }
                None => {
                    error!(ticket, "run vanished from table before completion");
                    return;
                }
            }
        };

        match &summary.error {
            None => info!(ticket, run_id = %summary.run_id, "agent run completed"),
            Some(err) => warn!(ticket, run_id = %summary.run_id, error = %err, "agent run failed"),
        }

        invoke_callback(
            on_complete,
            RunOutcome {
                summary,
                command: request.command,
                cloned: request.cloned,
            },
        );
        self.runs.lock().await.remove(&ticket);
    }

    async fn record_session_id(&self, ticket: u64, id: String) {
        if let Some(entry) = self.runs.lock().await.get_mut(&ticket) {
            entry.summary.session_id = Some(id);
        }
    }

    /// Snapshot of every tracked run.
    pub async fn list(&self) -> Vec<RunSummary> {
        let runs = self.runs.lock().await;
        let mut all: Vec<RunSummary> = runs.values().map(|e| e.summary.clone()).collect();
        all.sort_by_key(|s| s.started_at);
        all
    }

    /// Runs currently in `status`.
    pub async fn with_status(&self, status: RunStatus) -> Vec<RunSummary> {
        self.list()
            .await
            .into_iter()
            .filter(|s| s.status == status)
            .collect()
    }

    /// The run for `ticket`, if one is tracked.
    pub async fn get(&self, ticket: u64) -> Option<RunSummary> {
        self.runs.lock().await.get(&ticket).map(|e| e.summary.clone())
    }

    /// Whether a run for `ticket` is tracked.
    pub async fn is_active(&self, ticket: u64) -> bool {
        self.runs.lock().await.contains_key(&ticket)
    }

    /// Drop a run from the table without signalling it.
    pub async fn remove(&self, ticket: u64) -> Option<RunSummary> {
        self.runs.lock().await.remove(&ticket).map(|e| e.summary)
    }

    /// Number of tracked runs.
    pub async fn len(&self) -> usize {
        self.runs.lock().await.len()
    }

    /// Whether no runs are tracked.
    pub async fn is_empty(&self) -> bool {
        self.runs.lock().await.is_empty()
    }

    /// SIGTERM every run, wait up to `grace`, then force-kill survivors.
    pub async fn terminate_all(&self, grace: Duration) {
        let targets: Vec<(u64, Option<u32>)> = {
            let runs = self.runs.lock().await;
            runs.iter().map(|(t, e)| (*t, e.summary.pid)).collect()
        };
        if targets.is_empty() {
            return;
        }

        info!(count = targets.len(), "terminating agent runs");
        for (ticket, pid) in &targets {
            if let Some(pid) = pid {
                if send_terminate(*pid) {
                    debug!(ticket, pid, "sent SIGTERM");
                }
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline && !self.is_empty().await {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let survivors: Vec<(u64, CancellationToken)> = {
            let runs = self.runs.lock().await;
            runs.iter().map(|(t, e)| (*t, e.kill.clone())).collect()
        };
        for (ticket, kill) in survivors {
            warn!(ticket, "run survived grace period, force-killing");
            kill.cancel();
        }
    }
}

fn invoke_callback(on_complete: CompletionCallback, outcome: RunOutcome) {
    let ticket = outcome.summary.ticket;
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(move || on_complete(outcome))) {
        error!(
            ticket,
            panic = panic_message(panic.as_ref()),
            "completion callback panicked"
        );
    }
}
