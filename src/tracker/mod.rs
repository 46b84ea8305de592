//! Issue-tracker abstraction.
//!
//! The [`Tracker`] trait is the only surface the scheduler uses to read
//! tickets and conversation notes or to mutate labels and post comments.
//! [`gitlab::GitlabTracker`] is the production implementation; tests
//! provide an in-memory fake.

pub mod gitlab;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::models::ticket::{DiscussionThread, Note, Ticket};
use crate::{AppError, Result};

/// Boxed future returned by [`Tracker`] methods.
pub type TrackerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Project-scoped issue-tracker operations.
pub trait Tracker: Send + Sync {
    /// Path of the project this tracker is bound to (`group/repo`).
    fn project_path(&self) -> &str;

    /// List tickets carrying all of `labels` in the given `state`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Tracker` or `AppError::Timeout` on transport
    /// failure or a non-2xx response.
    fn list_tickets<'a>(&'a self, labels: &'a [String], state: &'a str)
        -> TrackerFuture<'a, Vec<Ticket>>;

    /// Fetch one ticket by sequence number.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown ticket, or a transport error.
    fn get_ticket(&self, iid: u64) -> TrackerFuture<'_, Ticket>;

    /// Replace the ticket's label set.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Tracker` on failure.
    fn set_labels<'a>(&'a self, iid: u64, labels: &'a [String]) -> TrackerFuture<'a, ()>;

    /// Post a comment and return it with its server-assigned timestamp.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Tracker` on failure.
    fn create_comment<'a>(&'a self, iid: u64, body: &'a str) -> TrackerFuture<'a, Note>;

    /// All discussion threads of the ticket, following pagination.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Tracker` on failure.
    fn list_discussions(&self, iid: u64) -> TrackerFuture<'_, Vec<DiscussionThread>>;
}

/// Race `call` against the shutdown token and a per-call timeout.
///
/// # Errors
///
/// Returns `AppError::Cancelled` when `cancel` fires first,
/// `AppError::Timeout` when `limit` elapses, or the call's own error.
pub async fn with_deadline<T, F>(
    cancel: &CancellationToken,
    limit: Duration,
    what: &str,
    call: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        () = cancel.cancelled() => Err(AppError::Cancelled),
        outcome = tokio::time::timeout(limit, call) => match outcome {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(format!("{what} exceeded {}s", limit.as_secs_f32()))),
        },
    }
}

/// Flatten threads into non-system notes sorted by creation time.
#[must_use]
pub fn flatten_notes(threads: Vec<DiscussionThread>) -> Vec<Note> {
    let mut notes: Vec<Note> = threads
        .into_iter()
        .flat_map(|thread| thread.notes)
        .filter(|note| !note.system)
        .collect();
    notes.sort_by_key(|note| note.created_at);
    notes
}
