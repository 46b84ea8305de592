//! Plain-text status report for `--status`.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::models::run::{RunStatus, RunSummary};
use crate::models::session::SessionRecord;

/// Render tracked runs grouped by status, followed by stored sessions.
#[must_use]
pub fn render(runs: &[RunSummary], records: &[SessionRecord], now: DateTime<Utc>) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Agent runs: {}", runs.len());
    for (heading, status) in [
        ("Starting", RunStatus::Starting),
        ("Running", RunStatus::Running),
        ("Completed", RunStatus::Completed),
        ("Failed", RunStatus::Failed),
    ] {
        let group: Vec<&RunSummary> = runs.iter().filter(|r| r.status == status).collect();
        if group.is_empty() {
            continue;
        }
        let _ = writeln!(out, "\n{heading} ({}):", group.len());
        for run in group {
            let end = run.finished_at.unwrap_or(now);
            let _ = write!(
                out,
                "  #{} {} pid={} elapsed={}",
                run.ticket,
                run.run_id,
                run.pid.map_or_else(|| "-".to_owned(), |p| p.to_string()),
                elapsed(run.started_at, end),
            );
            if let Some(err) = &run.error {
                let _ = write!(out, " error={err}");
            }
            out.push('\n');
        }
    }

    let _ = writeln!(out, "\nStored sessions: {}", records.len());
    for record in records {
        let last = record
            .last_comment_at
            .map_or_else(|| "never".to_owned(), |at| at.to_rfc3339());
        let _ = writeln!(
            out,
            "  #{} session={} completed={} ago last_comment={}{}",
            record.ticket,
            record.session_id,
            elapsed(record.completed_at, now),
            last,
            if record.is_resumable() { "" } else { " (not resumable)" },
        );
    }
    out
}

fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> String {
    let secs = (to - from).num_seconds().max(0);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}
