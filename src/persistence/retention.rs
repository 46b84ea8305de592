//! Retention service for stored session records.
//!
//! Invalid session ids and records older than the retention window are
//! purged once at startup and then hourly in a background task.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::session_repo::SessionRepo;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Counts from a single retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Records removed because their id was not resumable.
    pub invalid: usize,
    /// Records removed because they aged out.
    pub expired: u64,
}

/// Spawn the retention purge background task.
///
/// The first interval tick fires immediately, so a sweep runs at startup.
#[must_use]
pub fn spawn_retention_task(
    repo: SessionRepo,
    retention: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge(&repo, retention).await {
                        error!(?err, "retention purge failed");
                    }
                }
            }
        }
    })
}

/// Run one purge pass.
///
/// # Errors
///
/// Returns `AppError::Db` if either purge query fails.
pub async fn purge(repo: &SessionRepo, retention: Duration) -> Result<PurgeReport> {
    let invalid = repo.purge_invalid().await?;
    for ticket in &invalid {
        warn!(ticket, "purged session record with invalid session id");
    }

    let expired = repo.purge_older_than(retention).await?;

    let report = PurgeReport {
        invalid: invalid.len(),
        expired,
    };
    info!(invalid = report.invalid, expired = report.expired, "retention purge completed");
    Ok(report)
}
