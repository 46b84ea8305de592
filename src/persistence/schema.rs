//! `SQLite` schema bootstrap logic.
//!
//! Uses `CREATE TABLE IF NOT EXISTS`, so it is re-run on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply the session table and its index.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS session_record (
    ticket          INTEGER PRIMARY KEY NOT NULL,
    session_id      TEXT NOT NULL,
    project_path    TEXT NOT NULL,
    completed_at    TEXT NOT NULL,
    last_comment_at TEXT,
    working_dir     TEXT NOT NULL,
    command         TEXT NOT NULL,
    flags           TEXT NOT NULL,
    env             TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_session_record_completed ON session_record(completed_at);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
