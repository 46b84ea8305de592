//! Workflow phases derived from a ticket's label set.
//!
//! The phase is never stored; it is recomputed from labels on every scan.
//! Every transition removes the label being left in the same update that
//! adds the new one, so a ticket never carries two phase labels.

use crate::config::DaemonConfig;

/// Phase a ticket occupies in the plan → implement → review loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    /// No workflow label.
    Untouched,
    /// Trigger label applied; waiting to be claimed.
    Requested,
    /// A run is active.
    InProgress,
    /// Work done; waiting for human feedback.
    AwaitingReview,
    /// A human marked the ticket done.
    Resolved,
    /// The last run failed.
    Errored,
}

/// The configured label names for each phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowLabels {
    /// Applied by humans to request work.
    pub trigger: String,
    /// Present while a run is active.
    pub progress: String,
    /// Present while awaiting review.
    pub review: String,
    /// Applied when a run fails.
    pub error: String,
    /// Applied by humans when done.
    pub resolved: String,
}

impl From<&DaemonConfig> for WorkflowLabels {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            trigger: config.trigger_label.clone(),
            progress: config.progress_label.clone(),
            review: config.review_label.clone(),
            error: config.error_label.clone(),
            resolved: config.resolved_label.clone(),
        }
    }
}

impl WorkflowLabels {
    /// Derive the workflow phase of a label set.
    #[must_use]
    pub fn state_of(&self, labels: &[String]) -> WorkflowState {
        let has = |name: &str| labels.iter().any(|l| l == name);
        if has(&self.resolved) {
            WorkflowState::Resolved
        } else if has(&self.error) {
            WorkflowState::Errored
        } else if has(&self.progress) {
            WorkflowState::InProgress
        } else if has(&self.trigger) {
            WorkflowState::Requested
        } else if has(&self.review) {
            WorkflowState::AwaitingReview
        } else {
            WorkflowState::Untouched
        }
    }

    /// Labels after the scheduler claims a ticket.
    ///
    /// Drops the trigger and review labels and appends the progress label.
    /// Applying it to an already-claimed set returns the set unchanged.
    #[must_use]
    pub fn claimed(&self, labels: &[String]) -> Vec<String> {
        let mut next: Vec<String> = labels
            .iter()
            .filter(|l| **l != self.trigger && **l != self.review)
            .cloned()
            .collect();
        if !next.contains(&self.progress) {
            next.push(self.progress.clone());
        }
        next
    }

    /// Labels after a successful run: progress → review.
    #[must_use]
    pub fn completed(&self, labels: &[String]) -> Vec<String> {
        replace_label(labels, &self.progress, &self.review)
    }

    /// Labels after a failed run: progress → error.
    #[must_use]
    pub fn failed(&self, labels: &[String]) -> Vec<String> {
        replace_label(labels, &self.progress, &self.error)
    }
}

/// Remove `from` and append `to` unless it is already present.
fn replace_label(labels: &[String], from: &str, to: &str) -> Vec<String> {
    let mut next: Vec<String> = labels.iter().filter(|l| *l != from).cloned().collect();
    if !next.iter().any(|l| l == to) {
        next.push(to.to_owned());
    }
    next
}
