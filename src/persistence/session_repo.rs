//! Session record repository for `SQLite` persistence.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::models::session::{is_valid_session_id, EnvironmentSnapshot, SessionRecord};
use crate::{AppError, Result};

use super::db::Database;

/// Repository for resumable session records, keyed by ticket.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    ticket: i64,
    session_id: String,
    project_path: String,
    completed_at: String,
    last_comment_at: Option<String>,
    working_dir: String,
    command: String,
    flags: String,
    env: String,
}

impl SessionRow {
    fn into_record(self) -> Result<SessionRecord> {
        let ticket = u64::try_from(self.ticket)
            .map_err(|_| AppError::Db(format!("invalid ticket: {}", self.ticket)))?;
        let flags: Vec<String> = serde_json::from_str(&self.flags)
            .map_err(|e| AppError::Db(format!("invalid flags: {e}")))?;
        let env: BTreeMap<String, String> = serde_json::from_str(&self.env)
            .map_err(|e| AppError::Db(format!("invalid env: {e}")))?;

        Ok(SessionRecord {
            ticket,
            session_id: self.session_id,
            project_path: self.project_path,
            completed_at: parse_ts(&self.completed_at, "completed_at")?,
            last_comment_at: self
                .last_comment_at
                .as_deref()
                .map(|ts| parse_ts(ts, "last_comment_at"))
                .transpose()?,
            environment: EnvironmentSnapshot {
                command: self.command,
                flags,
                working_dir: PathBuf::from(self.working_dir),
                env,
            },
        })
    }
}

fn parse_ts(raw: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

/// Fixed-width RFC 3339 so stored values compare lexically.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Instant `window` before now.
fn window_start(window: Duration) -> Result<DateTime<Utc>> {
    let span = chrono::Duration::from_std(window)
        .map_err(|e| AppError::Config(format!("window out of range: {e}")))?;
    Utc::now()
        .checked_sub_signed(span)
        .ok_or_else(|| AppError::Config("window reaches before the epoch".into()))
}

fn ticket_key(ticket: u64) -> Result<i64> {
    i64::try_from(ticket).map_err(|_| AppError::Db(format!("ticket {ticket} out of range")))
}

const SELECT_COLUMNS: &str = "SELECT ticket, session_id, project_path, completed_at, last_comment_at,
        working_dir, command, flags, env
 FROM session_record";

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or fully replace the record for `record.ticket`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if serialization or the write fails.
    pub async fn upsert(&self, record: &SessionRecord) -> Result<()> {
        let flags = serde_json::to_string(&record.environment.flags)
            .map_err(|e| AppError::Db(format!("failed to encode flags: {e}")))?;
        let env = serde_json::to_string(&record.environment.env)
            .map_err(|e| AppError::Db(format!("failed to encode env: {e}")))?;

        sqlx::query(
            "INSERT OR REPLACE INTO session_record
                (ticket, session_id, project_path, completed_at, last_comment_at,
                 working_dir, command, flags, env)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(ticket_key(record.ticket)?)
        .bind(&record.session_id)
        .bind(&record.project_path)
        .bind(format_ts(record.completed_at))
        .bind(record.last_comment_at.map(format_ts))
        .bind(record.environment.working_dir.to_string_lossy().into_owned())
        .bind(&record.environment.command)
        .bind(flags)
        .bind(env)
        .execute(self.db.as_ref())
        .await?;

        Ok(())
    }

    /// Record the newest comment already delivered to the agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no record exists for `ticket`,
    /// or `AppError::Db` on write failure.
    pub async fn update_last_comment_time(&self, ticket: u64, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE session_record SET last_comment_at = ?1 WHERE ticket = ?2")
            .bind(format_ts(at))
            .bind(ticket_key(ticket)?)
            .execute(self.db.as_ref())
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "session record for ticket {ticket} not found"
            )));
        }
        Ok(())
    }

    /// Fetch the record for `ticket`, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query or row decoding fails.
    pub async fn get(&self, ticket: u64) -> Result<Option<SessionRecord>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE ticket = ?1"))
            .bind(ticket_key(ticket)?)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(SessionRow::into_record).transpose()
    }

    /// All records, most recently completed first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query or row decoding fails.
    pub async fn list_all(&self) -> Result<Vec<SessionRecord>> {
        let rows: Vec<SessionRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY completed_at DESC"))
                .fetch_all(self.db.as_ref())
                .await?;

        rows.into_iter().map(SessionRow::into_record).collect()
    }

    /// Records completed within the trailing `window`, most recent first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query or row decoding fails, or
    /// `AppError::Config` if `window` is out of range.
    pub async fn list_completed_within(&self, window: Duration) -> Result<Vec<SessionRecord>> {
        let since = window_start(window)?;
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE completed_at >= ?1 ORDER BY completed_at DESC"
        ))
        .bind(format_ts(since))
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(SessionRow::into_record).collect()
    }

    /// Delete the record for `ticket`. Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn remove(&self, ticket: u64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM session_record WHERE ticket = ?1")
            .bind(ticket_key(ticket)?)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every record whose session id is not a canonical UUID.
    ///
    /// Returns the tickets that were purged.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the scan or any delete fails.
    pub async fn purge_invalid(&self) -> Result<Vec<u64>> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT ticket, session_id FROM session_record")
                .fetch_all(self.db.as_ref())
                .await?;

        let mut purged = Vec::new();
        for (ticket, session_id) in rows {
            if is_valid_session_id(&session_id) {
                continue;
            }
            sqlx::query("DELETE FROM session_record WHERE ticket = ?1")
                .bind(ticket)
                .execute(self.db.as_ref())
                .await?;
            if let Ok(ticket) = u64::try_from(ticket) {
                purged.push(ticket);
            }
        }
        Ok(purged)
    }

    /// Delete records completed more than `age` ago. Returns the row count.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails, or `AppError::Config` if
    /// `age` is out of range.
    pub async fn purge_older_than(&self, age: Duration) -> Result<u64> {
        let cutoff = window_start(age)?;
        let result = sqlx::query("DELETE FROM session_record WHERE completed_at < ?1")
            .bind(format_ts(cutoff))
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}
