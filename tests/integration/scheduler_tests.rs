//! End-to-end scheduler behavior against a fake tracker and `sh` agents.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::time::{sleep, timeout, Duration};

use issue_autopilot::models::run::RunStatus;
use issue_autopilot::models::session::{EnvironmentSnapshot, SessionRecord};
use issue_autopilot::orchestrator::scheduler::{Daemon, TickReport, COMPLETION_COMMENT};
use issue_autopilot::tracker::Tracker;
use issue_autopilot::ExecutionMode;

use super::test_helpers::{
    announcing_agent, current_env, memory_store, silent_remote, test_config, workspace,
    FakeTracker, BOT_HANDLE, PROJECT, SESSION_ID, WAIT,
};

const TRIGGER: &str = "claude";
const PROGRESS: &str = "picked_up_by_claude";
const REVIEW: &str = "waiting_human_review";

fn daemon_for(
    tracker: &Arc<FakeTracker>,
    config: issue_autopilot::GlobalConfig,
    store: issue_autopilot::persistence::session_repo::SessionRepo,
) -> Daemon {
    let dyn_tracker: Arc<dyn Tracker> = tracker.clone();
    Daemon::new(dyn_tracker, config, store).expect("daemon")
}

#[tokio::test]
async fn trigger_ticket_is_claimed_and_run_starts() {
    let (root, _checkout) = workspace();
    let tracker = FakeTracker::new();
    tracker.add_ticket(11, &[TRIGGER]);
    let daemon = daemon_for(&tracker, test_config(root.path(), "exec sleep 30"), memory_store().await);

    let report = daemon.tick(true).await;

    assert_eq!(report.started, 1);
    assert_eq!(tracker.labels_of(11), vec![PROGRESS.to_owned()]);
    let running = daemon.runs().with_status(RunStatus::Running).await;
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].ticket, 11);

    let report = daemon.status_report().await.expect("status");
    assert!(report.contains("Running (1):"));
    assert!(report.contains("#11 issue-11-"));

    daemon.shutdown().await;
}

#[tokio::test]
async fn active_run_is_not_started_twice() {
    let (root, _checkout) = workspace();
    let tracker = FakeTracker::new();
    tracker.add_ticket(12, &[TRIGGER]);
    let daemon = daemon_for(&tracker, test_config(root.path(), "exec sleep 30"), memory_store().await);

    daemon.tick(true).await;
    tracker.add_ticket(12, &[PROGRESS, TRIGGER]);
    let second = daemon.tick(true).await;

    assert_eq!(second, TickReport::default());
    assert_eq!(daemon.runs().len().await, 1);
    assert_eq!(tracker.label_writes().len(), 1);

    daemon.shutdown().await;
}

#[tokio::test]
async fn successful_run_moves_to_review_and_stores_session() {
    let (root, checkout) = workspace();
    let tracker = FakeTracker::new();
    tracker.add_ticket(21, &[TRIGGER]);
    let store = memory_store().await;
    let daemon = daemon_for(&tracker, test_config(root.path(), &announcing_agent(0)), store.clone());

    assert_eq!(daemon.tick(true).await.started, 1);

    let record = timeout(WAIT, async {
        loop {
            if let Some(record) = store.get(21).await.expect("get") {
                break record;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("session stored after completion");

    assert_eq!(record.session_id, SESSION_ID);
    assert_eq!(record.project_path, PROJECT);
    assert_eq!(record.environment.command, "sh");
    assert_eq!(record.environment.working_dir, checkout);
    assert_eq!(tracker.labels_of(21), vec![REVIEW.to_owned()]);
    assert_eq!(tracker.comments(), vec![(21, COMPLETION_COMMENT.to_owned())]);
    timeout(WAIT, async {
        while !daemon.runs().is_empty().await {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("run dropped from table");
}

#[tokio::test]
async fn reply_during_completion_settle_is_after_cutoff() {
    let (root, _checkout) = workspace();
    let tracker = FakeTracker::new();
    tracker.add_ticket(22, &[TRIGGER]);
    let store = memory_store().await;
    let mut config = test_config(root.path(), &announcing_agent(0));
    config.daemon.completion_settle_millis = 1500;
    let daemon = daemon_for(&tracker, config, store.clone());

    daemon.tick(true).await;
    timeout(WAIT, async {
        while tracker.comments().is_empty() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("completion comment posted");
    let reply_at = Utc::now();
    tracker.add_note(22, "Alice", "alice", reply_at);

    let record = timeout(WAIT, async {
        loop {
            if let Some(record) = store.get(22).await.expect("get") {
                break record;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("session stored");

    assert!(record.completed_at < reply_at);
    assert!(record.comment_cutoff() < reply_at);
}

#[tokio::test]
async fn failed_run_gets_error_label() {
    let (root, _checkout) = workspace();
    let tracker = FakeTracker::new();
    tracker.add_ticket(31, &[TRIGGER]);
    let store = memory_store().await;
    let daemon = daemon_for(&tracker, test_config(root.path(), "exit 3"), store.clone());

    daemon.tick(true).await;

    timeout(WAIT, async {
        while !tracker.labels_of(31).contains(&"error".to_owned()) {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("error label applied");

    assert!(!tracker.labels_of(31).contains(&PROGRESS.to_owned()));
    assert!(store.get(31).await.expect("get").is_none());
    assert!(tracker.comments().is_empty());
}

#[tokio::test]
async fn human_comment_resumes_stored_session_without_relabeling() {
    let (root, checkout) = workspace();
    let args_file = root.path().join("resume-args");
    let tracker = FakeTracker::new();
    tracker.add_ticket(41, &[REVIEW]);

    let store = memory_store().await;
    let mut record = SessionRecord::new(
        41,
        SESSION_ID.into(),
        PROJECT.into(),
        EnvironmentSnapshot {
            command: "sh".into(),
            flags: vec![
                "-c".into(),
                format!(r#"printf "%s\n" "$PWD" "$@" > {}"#, args_file.display()),
                "agent".into(),
            ],
            working_dir: checkout.clone(),
            env: current_env(),
        },
    );
    record.completed_at = Utc::now() - ChronoDuration::hours(1);
    store.upsert(&record).await.expect("seed record");

    let comment_at = Utc::now() - ChronoDuration::minutes(10);
    tracker.add_note(41, "Alice", "alice", comment_at);

    let daemon = daemon_for(&tracker, test_config(root.path(), "exit 0"), store.clone());
    let report = daemon.tick(true).await;
    assert_eq!(report, TickReport { started: 0, resumed: 1 });

    let updated = timeout(WAIT, async {
        loop {
            let current = store.get(41).await.expect("get").expect("record kept");
            if current.last_comment_at.is_some() {
                break current;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("last comment time recorded");
    assert_eq!(updated.last_comment_at, Some(comment_at));

    let written = std::fs::read_to_string(&args_file).expect("agent wrote its args");
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(
        std::path::Path::new(lines[0]).canonicalize().expect("agent cwd"),
        checkout.canonicalize().expect("checkout")
    );
    assert_eq!(&lines[1..4], &["-r", SESSION_ID, "-p"]);
    assert!(written.contains("# New Comments on Issue #41"));

    assert!(tracker.label_writes().is_empty());
    assert!(daemon.runs().is_empty().await);

    let again = daemon.tick(true).await;
    assert_eq!(again, TickReport::default(), "same comment is not replayed");
}

#[tokio::test]
async fn bot_only_comment_triggers_nothing() {
    let (root, checkout) = workspace();
    let tracker = FakeTracker::new();
    tracker.add_ticket(51, &[REVIEW]);

    let store = memory_store().await;
    let mut record = SessionRecord::new(
        51,
        SESSION_ID.into(),
        PROJECT.into(),
        EnvironmentSnapshot {
            command: "sh".into(),
            flags: vec!["-c".into(), "exit 0".into(), "agent".into()],
            working_dir: checkout,
            env: current_env(),
        },
    );
    record.completed_at = Utc::now() - ChronoDuration::hours(1);
    store.upsert(&record).await.expect("seed record");
    tracker.add_note(51, "Claude Bot", BOT_HANDLE, Utc::now());

    let daemon = daemon_for(&tracker, test_config(root.path(), "exit 0"), store);

    assert_eq!(daemon.tick(true).await, TickReport::default());
    assert_eq!(daemon.tick(false).await, TickReport::default());
    assert!(daemon.resumes().is_empty().await);
    assert!(daemon.runs().is_empty().await);
    assert!(tracker.label_writes().is_empty());
}

#[tokio::test]
async fn unresumable_record_is_purged_on_review() {
    let (root, _checkout) = workspace();
    let tracker = FakeTracker::new();
    tracker.add_ticket(61, &[REVIEW]);
    tracker.add_note(61, "Alice", "alice", Utc::now());

    let store = memory_store().await;
    let mut record = SessionRecord::new(
        61,
        "issue-61-1699999999".into(),
        PROJECT.into(),
        EnvironmentSnapshot::default(),
    );
    record.completed_at = Utc::now() - ChronoDuration::hours(1);
    store.upsert(&record).await.expect("seed record");

    let daemon = daemon_for(&tracker, test_config(root.path(), "exit 0"), store.clone());

    assert_eq!(daemon.tick(true).await, TickReport::default());
    assert!(store.get(61).await.expect("get").is_none());
}

#[tokio::test]
async fn memoryless_reply_starts_fresh_run_once() {
    let (root, _checkout) = workspace();
    let tracker = FakeTracker::new();
    tracker.add_ticket(71, &[REVIEW]);
    tracker.add_note(71, "Alice", "alice", Utc::now());

    let daemon = daemon_for(&tracker, test_config(root.path(), "exec sleep 30"), memory_store().await);

    let report = daemon.tick(false).await;
    assert_eq!(report.started, 1);
    assert_eq!(tracker.labels_of(71), vec![PROGRESS.to_owned()]);
    assert!(daemon.runs().is_active(71).await);

    daemon.shutdown().await;
}

#[tokio::test]
async fn dry_run_touches_nothing() {
    let (root, _checkout) = workspace();
    let tracker = FakeTracker::new();
    tracker.add_ticket(81, &[TRIGGER]);
    let mut config = test_config(root.path(), "exit 0");
    config.mode = ExecutionMode::DryRun;
    let daemon = daemon_for(&tracker, config, memory_store().await);

    assert_eq!(daemon.tick(true).await, TickReport::default());
    assert_eq!(tracker.labels_of(81), vec![TRIGGER.to_owned()]);
    assert!(tracker.label_writes().is_empty());
    assert!(daemon.runs().is_empty().await);
}

#[tokio::test]
async fn shutdown_leaves_claimed_ticket_in_progress() {
    let (root, _checkout) = workspace();
    let tracker = FakeTracker::new();
    tracker.add_ticket(91, &[TRIGGER]);
    let daemon = daemon_for(&tracker, test_config(root.path(), "exec sleep 30"), memory_store().await);

    let loop_daemon = daemon.clone();
    let handle = tokio::spawn(async move { loop_daemon.run_with_memory().await });

    timeout(WAIT, async {
        while !daemon.runs().is_active(91).await {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("run started by the loop");

    daemon.cancellation_token().cancel();
    timeout(WAIT, handle)
        .await
        .expect("loop exits after shutdown")
        .expect("loop task joined")
        .expect("clean shutdown");

    timeout(WAIT, async {
        while !daemon.runs().is_empty().await {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("run reaped");

    assert_eq!(tracker.labels_of(91), vec![PROGRESS.to_owned()]);
    assert!(tracker.comments().is_empty());
}

#[tokio::test]
async fn hung_clone_does_not_block_shutdown() {
    let root = tempfile::tempdir().expect("empty workspace root");
    let (remote, _server) = silent_remote().await;
    let tracker = FakeTracker::new();
    tracker.add_ticket(92, &[TRIGGER]);
    let mut config = test_config(root.path(), "exit 0");
    config.gitlab.url = remote;
    let daemon = daemon_for(&tracker, config, memory_store().await);

    let loop_daemon = daemon.clone();
    let handle = tokio::spawn(async move { loop_daemon.run_without_memory().await });

    timeout(WAIT, async {
        while tracker.label_writes().is_empty() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("ticket claimed before cloning");
    sleep(Duration::from_millis(300)).await;

    daemon.cancellation_token().cancel();
    timeout(Duration::from_secs(3), handle)
        .await
        .expect("loop exits while clone is pending")
        .expect("loop task joined")
        .expect("clean shutdown");
    assert!(daemon.runs().is_empty().await);
}

#[tokio::test]
async fn clone_past_deadline_fails_the_ticket() {
    let root = tempfile::tempdir().expect("empty workspace root");
    let (remote, _server) = silent_remote().await;
    let tracker = FakeTracker::new();
    tracker.add_ticket(93, &[TRIGGER]);
    let mut config = test_config(root.path(), "exit 0");
    config.gitlab.url = remote;
    config.daemon.clone_timeout_seconds = 1;
    let daemon = daemon_for(&tracker, config, memory_store().await);

    let report = timeout(WAIT, daemon.tick(true))
        .await
        .expect("tick bounded by clone deadline");

    assert_eq!(report, TickReport::default());
    assert!(tracker.labels_of(93).contains(&"error".to_owned()));
    assert!(!tracker.labels_of(93).contains(&PROGRESS.to_owned()));
    assert!(daemon.runs().is_empty().await);
}
