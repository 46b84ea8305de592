//! Poll loop: discover labeled tickets, start fresh runs, resume sessions.
//!
//! Each tick runs the new-work scan and then the review scan. A per-tick
//! handled set keeps a ticket from being processed twice in one cycle; label
//! state carries deduplication across cycles. Every tracker call is raced
//! against the shared shutdown token and a per-call deadline.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::classifier::CommentClassifier;
use super::resume::{ResumeRegistry, ResumeRequest};
use super::run_manager::{CompletionCallback, RunManager, RunOutcome, RunRequest};
use super::status;
use super::tasks::spawn_detached;
use crate::agent::command::{prepare, prepare_resume};
use crate::agent::prompt::{resume_prompt, task_prompt, TaskContext};
use crate::agent::workspace::{ensure_workspace, git_status, go_module_name, Workspace};
use crate::config::GlobalConfig;
use crate::mode::ExecutionMode;
use crate::models::session::SessionRecord;
use crate::models::ticket::{Note, Ticket};
use crate::models::workflow::{WorkflowLabels, WorkflowState};
use crate::persistence::session_repo::SessionRepo;
use crate::tracker::{flatten_notes, with_deadline, Tracker};
use crate::Result;

/// Comment posted when a run finishes successfully.
pub const COMPLETION_COMMENT: &str = "✅ **Task completed successfully**\n\n\
The agent has finished processing this issue. The implementation is complete and ready for \
human review.";

/// Ticket state the tracker is queried with.
const OPEN_STATE: &str = "opened";

/// Counts from one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Fresh runs started.
    pub started: usize,
    /// Sessions resumed.
    pub resumed: usize,
}

/// The scheduling daemon.
#[derive(Clone)]
pub struct Daemon {
    inner: Arc<Inner>,
}

struct Inner {
    tracker: Arc<dyn Tracker>,
    config: GlobalConfig,
    store: SessionRepo,
    labels: WorkflowLabels,
    classifier: CommentClassifier,
    runs: RunManager,
    resumes: ResumeRegistry,
    /// Newest note the memory-less mode already reacted to, per ticket.
    last_reacted: Mutex<HashMap<u64, DateTime<Utc>>>,
    cancel: CancellationToken,
}

impl Daemon {
    /// Wire a daemon around a tracker, configuration and session store.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the run manager cannot be built.
    pub fn new(tracker: Arc<dyn Tracker>, config: GlobalConfig, store: SessionRepo) -> Result<Self> {
        let labels = WorkflowLabels::from(&config.daemon);
        let classifier = CommentClassifier::new(config.gitlab.username.clone());
        Ok(Self {
            inner: Arc::new(Inner {
                tracker,
                labels,
                classifier,
                runs: RunManager::new()?,
                resumes: ResumeRegistry::new(),
                last_reacted: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
                store,
                config,
            }),
        })
    }

    /// Root shutdown token; cancelling it stops the loop.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Active fresh runs.
    #[must_use]
    pub fn runs(&self) -> &RunManager {
        &self.inner.runs
    }

    /// Active resume subprocesses.
    #[must_use]
    pub fn resumes(&self) -> &ResumeRegistry {
        &self.inner.resumes
    }

    /// Run in the mode selected by `daemon.memory`.
    ///
    /// # Errors
    ///
    /// Currently infallible once constructed; the `Result` mirrors the
    /// binary's error path.
    pub async fn run(&self) -> Result<()> {
        if self.inner.config.daemon.memory {
            self.run_with_memory().await
        } else {
            self.run_without_memory().await
        }
    }

    /// Poll until shutdown, resuming stored sessions on new comments.
    ///
    /// # Errors
    ///
    /// See [`Self::run`].
    pub async fn run_with_memory(&self) -> Result<()> {
        self.run_loop(true).await
    }

    /// Poll until shutdown, starting fresh runs on new comments.
    ///
    /// # Errors
    ///
    /// See [`Self::run`].
    pub async fn run_without_memory(&self) -> Result<()> {
        self.run_loop(false).await
    }

    async fn run_loop(&self, memory: bool) -> Result<()> {
        let inner = &self.inner;
        info!(
            project = inner.tracker.project_path(),
            mode = inner.config.mode.tag(),
            memory,
            interval_seconds = inner.config.daemon.interval_seconds,
            trigger = %inner.labels.trigger,
            "daemon started"
        );

        let mut ticker = tokio::time::interval(inner.config.daemon.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = inner.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = tokio::select! {
                        () = inner.cancel.cancelled() => break,
                        report = self.tick(memory) => report,
                    };
                    if report == TickReport::default() {
                        debug!("no new activity");
                    } else {
                        info!(started = report.started, resumed = report.resumed, "poll cycle activity");
                    }
                }
            }
        }

        info!("shutdown requested");
        self.shutdown().await;
        info!("daemon stopped");
        Ok(())
    }

    /// Signal every tracked subprocess and escalate to force-kill after the
    /// configured grace period.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.cancel.cancel();
        let grace = inner.config.daemon.shutdown_grace();
        tokio::join!(
            inner.runs.terminate_all(grace),
            inner.resumes.terminate_all(grace)
        );
    }

    /// One poll cycle: new-work scan, then review scan.
    pub async fn tick(&self, memory: bool) -> TickReport {
        let mut handled = HashSet::new();
        let started = self
            .scan_new_work(&mut handled)
            .instrument(info_span!("new_work_scan"))
            .await;

        let review = async {
            if memory {
                self.scan_review_with_memory(&mut handled).await
            } else {
                self.scan_review_without_memory(&mut handled).await
            }
        };
        let (restarted, resumed) = review.instrument(info_span!("review_scan", memory)).await;

        TickReport {
            started: started + restarted,
            resumed,
        }
    }

    /// Text report of tracked runs and stored sessions.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store cannot be read.
    pub async fn status_report(&self) -> Result<String> {
        let runs = self.inner.runs.list().await;
        let records = self.inner.store.list_all().await?;
        Ok(status::render(&runs, &records, Utc::now()))
    }

    async fn list_labeled(&self, label: &str) -> Vec<Ticket> {
        let inner = &self.inner;
        let labels = [label.to_owned()];
        match inner
            .call(
                inner.config.daemon.list_timeout(),
                "list_tickets",
                inner.tracker.list_tickets(&labels, OPEN_STATE),
            )
            .await
        {
            Ok(tickets) => tickets,
            Err(err) if err.is_cancelled() => Vec::new(),
            Err(err) => {
                warn!(label, %err, "ticket listing failed; skipping scan this cycle");
                Vec::new()
            }
        }
    }

    async fn scan_new_work(&self, handled: &mut HashSet<u64>) -> usize {
        let inner = &self.inner;
        let tickets = self.list_labeled(&inner.labels.trigger).await;
        let mut started = 0;

        for ticket in tickets {
            if inner.cancel.is_cancelled() {
                break;
            }
            if !handled.insert(ticket.iid) {
                continue;
            }
            if inner.runs.is_active(ticket.iid).await {
                debug!(ticket = ticket.iid, "run already active; skipping");
                continue;
            }
            match self.claim_and_spawn(&ticket).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(err) if err.is_cancelled() => break,
                Err(err) => warn!(ticket = ticket.iid, %err, "failed to start run"),
            }
        }
        started
    }

    async fn scan_review_with_memory(&self, handled: &mut HashSet<u64>) -> (usize, usize) {
        let inner = &self.inner;
        let tickets = self.list_labeled(&inner.labels.review).await;
        let mut resumed = 0;

        for ticket in tickets {
            if inner.cancel.is_cancelled() {
                break;
            }
            if !self.reviewable(&ticket, handled).await {
                continue;
            }
            if inner.resumes.is_active(ticket.iid).await {
                debug!(ticket = ticket.iid, "resume still running; skipping");
                continue;
            }
            match self.review_with_memory(&ticket).await {
                Ok(true) => resumed += 1,
                Ok(false) => {}
                Err(err) if err.is_cancelled() => break,
                Err(err) => warn!(ticket = ticket.iid, %err, "review check failed"),
            }
        }
        (0, resumed)
    }

    async fn scan_review_without_memory(&self, handled: &mut HashSet<u64>) -> (usize, usize) {
        let inner = &self.inner;
        let tickets = self.list_labeled(&inner.labels.review).await;
        let mut started = 0;

        for ticket in tickets {
            if inner.cancel.is_cancelled() {
                break;
            }
            if !self.reviewable(&ticket, handled).await {
                continue;
            }
            match self.review_without_memory(&ticket).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(err) if err.is_cancelled() => break,
                Err(err) => warn!(ticket = ticket.iid, %err, "review check failed"),
            }
        }
        (started, 0)
    }

    /// Shared review-scan gate: first visit this tick, no active run, and
    /// the labels still say the ticket awaits review.
    async fn reviewable(&self, ticket: &Ticket, handled: &mut HashSet<u64>) -> bool {
        let inner = &self.inner;
        if !handled.insert(ticket.iid) {
            return false;
        }
        if inner.runs.is_active(ticket.iid).await {
            debug!(ticket = ticket.iid, "run already active; skipping review");
            return false;
        }
        let state = inner.labels.state_of(&ticket.labels);
        if state != WorkflowState::AwaitingReview {
            debug!(ticket = ticket.iid, ?state, "not awaiting review; skipping");
            return false;
        }
        true
    }

    async fn fetch_notes(&self, iid: u64) -> Result<Vec<Note>> {
        let inner = &self.inner;
        let threads = inner
            .call(
                inner.config.daemon.comment_timeout(),
                "list_discussions",
                inner.tracker.list_discussions(iid),
            )
            .await?;
        Ok(flatten_notes(threads))
    }

    async fn review_with_memory(&self, ticket: &Ticket) -> Result<bool> {
        let inner = &self.inner;
        let iid = ticket.iid;

        let Some(record) = inner.store.get(iid).await? else {
            debug!(ticket = iid, "no stored session; nothing to resume");
            return Ok(false);
        };
        if !record.is_resumable() {
            warn!(
                ticket = iid,
                session_id = %record.session_id,
                "stored session id is not resumable; purging record"
            );
            inner.store.remove(iid).await?;
            return Ok(false);
        }

        let notes = self.fetch_notes(iid).await?;
        let fresh: Vec<Note> = inner
            .classifier
            .new_human_notes(&notes, record.comment_cutoff())
            .into_iter()
            .cloned()
            .collect();
        let Some(newest_note_at) = fresh.iter().map(|note| note.created_at).max() else {
            return Ok(false);
        };

        info!(
            ticket = iid,
            comments = fresh.len(),
            session_id = %record.session_id,
            "new human comments since last run"
        );
        let prompt = resume_prompt(iid, &fresh);

        if inner.config.mode.is_simulated() {
            info!(
                ticket = iid,
                mode = inner.config.mode.tag(),
                session_id = %record.session_id,
                %prompt,
                "would resume session"
            );
            return Ok(false);
        }

        let command = prepare_resume(
            iid,
            &record.environment,
            &inner.config.agent,
            &record.session_id,
            prompt,
        );
        inner
            .resumes
            .launch(
                ResumeRequest {
                    command,
                    newest_note_at,
                },
                inner.store.clone(),
                inner.cancel.clone(),
            )
            .await?;
        Ok(true)
    }

    async fn review_without_memory(&self, ticket: &Ticket) -> Result<bool> {
        let inner = &self.inner;
        let iid = ticket.iid;
        let notes = self.fetch_notes(iid).await?;

        let reply_at = {
            let mut seen = inner.last_reacted.lock().await;
            let Some(reply) = inner
                .classifier
                .fresh_human_reply(&notes, seen.get(&iid).copied())
            else {
                return Ok(false);
            };
            info!(
                ticket = iid,
                author = %reply.author.username,
                "new human reply; starting fresh run"
            );
            seen.insert(iid, reply.created_at);
            reply.created_at
        };
        debug!(ticket = iid, %reply_at, "recorded reacted-to note");

        self.claim_and_spawn(ticket).await
    }

    /// Claim `ticket` (labels first) and start a fresh run on it.
    ///
    /// Returns `Ok(false)` when the execution mode suppresses the run.
    async fn claim_and_spawn(&self, ticket: &Ticket) -> Result<bool> {
        let inner = &self.inner;
        let iid = ticket.iid;
        let project = inner.tracker.project_path();
        let mode = inner.config.mode;
        let root = inner.config.workspace_root()?;

        if mode == ExecutionMode::DryRun {
            let workspace = inner.workspace(&root, project).await?;
            let prompt = self.task_prompt_for(iid, &workspace.path);
            info!(
                ticket = iid,
                mode = mode.tag(),
                title = %ticket.title,
                labels = ?inner.labels.claimed(&ticket.labels),
                working_dir = %workspace.path.display(),
                %prompt,
                "would claim ticket and start agent"
            );
            return Ok(false);
        }

        if mode == ExecutionMode::SemiDryRun {
            let workspace = inner.workspace(&root, project).await?;
            let status = git_status(&workspace.path).await?;
            info!(
                ticket = iid,
                mode = mode.tag(),
                working_dir = %workspace.path.display(),
                cloned = workspace.cloned,
                git_status = %status.trim_end(),
                "workspace ready; agent execution suppressed"
            );
            return Ok(false);
        }

        let next = inner.labels.claimed(&ticket.labels);
        if next == ticket.labels {
            debug!(ticket = iid, "labels already claimed");
        } else {
            inner
                .call(
                    inner.config.daemon.list_timeout(),
                    "set_labels",
                    inner.tracker.set_labels(iid, &next),
                )
                .await?;
            info!(ticket = iid, labels = ?next, "ticket claimed");
        }

        let prepared = async {
            let workspace =
                inner.workspace(&root, project).await?;
            let prompt = self.task_prompt_for(iid, &workspace.path);
            let command = prepare(
                iid,
                &workspace.path,
                &inner.config.agent.command,
                &inner.config.agent.flags,
                prompt,
            )?;
            Ok::<_, crate::AppError>((workspace, command))
        }
        .await;

        let (workspace, command) = match prepared {
            Ok(ready) => ready,
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                error!(ticket = iid, %err, "could not prepare agent launch");
                inner.relabel(iid, |labels, wl| wl.failed(labels)).await;
                return Err(err);
            }
        };

        inner
            .runs
            .start(
                RunRequest {
                    project_path: project.to_owned(),
                    command,
                    cloned: workspace.cloned,
                },
                self.completion_hook(),
            )
            .await?;
        Ok(true)
    }

    fn task_prompt_for(&self, iid: u64, working_dir: &std::path::Path) -> String {
        let inner = &self.inner;
        let go_module = go_module_name(working_dir);
        task_prompt(&TaskContext {
            ticket: iid,
            project_path: inner.tracker.project_path(),
            username: &inner.config.gitlab.username,
            working_dir,
            go_module: go_module.as_deref(),
        })
    }

    /// Completion hook: returns immediately, side effects run detached.
    fn completion_hook(&self) -> CompletionCallback {
        let inner = Arc::clone(&self.inner);
        Box::new(move |outcome: RunOutcome| {
            let ticket = outcome.summary.ticket;
            if inner.cancel.is_cancelled() {
                info!(ticket, "shutdown in progress; leaving ticket labels unchanged");
                return;
            }
            let _detached = spawn_detached("run_completion", ticket, async move {
                inner.finish_run(outcome).await;
            });
        })
    }
}

impl Inner {
    async fn call<T, F>(&self, limit: Duration, what: &str, call: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        with_deadline(&self.cancel, limit, what, call).await
    }

    /// Locate or clone the checkout, bounded by the clone deadline.
    async fn workspace(&self, root: &Path, project: &str) -> Result<Workspace> {
        let mode = self.config.mode;
        self.call(
            self.config.daemon.clone_timeout(),
            "git clone",
            ensure_workspace(root, project, &self.config.gitlab.url, mode),
        )
        .await
    }

    async fn finish_run(&self, outcome: RunOutcome) {
        let iid = outcome.summary.ticket;
        if !outcome.succeeded() {
            self.relabel(iid, |labels, wl| wl.failed(labels)).await;
            return;
        }

        match self
            .call(
                self.config.daemon.list_timeout(),
                "create_comment",
                self.tracker.create_comment(iid, COMPLETION_COMMENT),
            )
            .await
        {
            Ok(note) => {
                debug!(ticket = iid, at = %note.created_at, "posted completion comment");
                self.last_reacted.lock().await.insert(iid, note.created_at);
            }
            Err(err) => warn!(ticket = iid, %err, "failed to post completion comment"),
        }

        tokio::time::sleep(self.config.daemon.completion_settle()).await;
        self.relabel(iid, |labels, wl| wl.completed(labels)).await;

        let session_id = outcome.summary.session_id.clone().unwrap_or_else(|| {
            warn!(
                ticket = iid,
                run_id = %outcome.summary.run_id,
                "no session id captured; storing run id, which cannot be resumed"
            );
            outcome.summary.run_id.clone()
        });
        let mut record = SessionRecord::new(
            iid,
            session_id,
            outcome.summary.project_path.clone(),
            outcome.command.snapshot(),
        );
        if let Some(finished_at) = outcome.summary.finished_at {
            record.completed_at = finished_at;
        }
        match self.store.upsert(&record).await {
            Ok(()) => info!(ticket = iid, session_id = %record.session_id, "session stored"),
            Err(err) => error!(ticket = iid, %err, "failed to store session"),
        }
    }

    /// Re-read the ticket and rewrite its labels with `transform`.
    async fn relabel<F>(&self, iid: u64, transform: F)
    where
        F: FnOnce(&[String], &WorkflowLabels) -> Vec<String>,
    {
        let limit = self.config.daemon.list_timeout();
        let ticket = match self.call(limit, "get_ticket", self.tracker.get_ticket(iid)).await {
            Ok(ticket) => ticket,
            Err(err) => {
                warn!(ticket = iid, %err, "failed to re-read ticket for relabel");
                return;
            }
        };

        let next = transform(&ticket.labels, &self.labels);
        if next == ticket.labels {
            return;
        }
        match self
            .call(limit, "set_labels", self.tracker.set_labels(iid, &next))
            .await
        {
            Ok(()) => info!(ticket = iid, labels = ?next, "labels updated"),
            Err(err) => warn!(ticket = iid, %err, "failed to update labels"),
        }
    }
}
