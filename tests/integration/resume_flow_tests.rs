//! Resume subprocess exit handling and its effect on the session store.

use std::path::Path;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

use issue_autopilot::agent::command::AgentCommand;
use issue_autopilot::models::session::{EnvironmentSnapshot, SessionRecord};
use issue_autopilot::orchestrator::resume::{ResumeRegistry, ResumeRequest};
use issue_autopilot::persistence::session_repo::SessionRepo;

use super::test_helpers::{current_env, memory_store, PROJECT, SESSION_ID, WAIT};

fn resume_command(ticket: u64, script: &str, dir: &Path) -> AgentCommand {
    AgentCommand {
        ticket,
        program: "sh".into(),
        flags: vec!["-c".into(), script.into(), "agent".into()],
        resume: Some(SESSION_ID.into()),
        prompt: "# New Comments on Issue".into(),
        working_dir: dir.to_path_buf(),
        env: current_env(),
    }
}

async fn seeded_store(ticket: u64) -> SessionRepo {
    let store = memory_store().await;
    let mut record = SessionRecord::new(
        ticket,
        SESSION_ID.into(),
        PROJECT.into(),
        EnvironmentSnapshot::default(),
    );
    record.completed_at = Utc::now() - ChronoDuration::hours(1);
    store.upsert(&record).await.expect("seed");
    store
}

async fn wait_idle(registry: &ResumeRegistry) {
    timeout(WAIT, async {
        while !registry.is_empty().await {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("resume finished");
}

#[tokio::test]
async fn missing_session_removes_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = seeded_store(1).await;
    let registry = ResumeRegistry::new();

    registry
        .launch(
            ResumeRequest {
                command: resume_command(
                    1,
                    "echo \"No conversation found with session ID\" >&2; exit 1",
                    dir.path(),
                ),
                newest_note_at: Utc::now(),
            },
            store.clone(),
            CancellationToken::new(),
        )
        .await
        .expect("launch");

    wait_idle(&registry).await;
    assert!(store.get(1).await.expect("get").is_none());
}

#[tokio::test]
async fn generic_failure_still_advances_comment_time() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = seeded_store(2).await;
    let registry = ResumeRegistry::new();
    let newest = Utc::now() - ChronoDuration::minutes(1);

    registry
        .launch(
            ResumeRequest {
                command: resume_command(2, "echo boom >&2; exit 4", dir.path()),
                newest_note_at: newest,
            },
            store.clone(),
            CancellationToken::new(),
        )
        .await
        .expect("launch");

    wait_idle(&registry).await;
    let record = store.get(2).await.expect("get").expect("kept");
    assert_eq!(record.last_comment_at, Some(newest));
}

#[tokio::test]
async fn concurrent_resume_for_same_ticket_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = seeded_store(3).await;
    let registry = ResumeRegistry::new();
    let shutdown = CancellationToken::new();

    let request = ResumeRequest {
        command: resume_command(3, "exec sleep 30", dir.path()),
        newest_note_at: Utc::now(),
    };
    registry
        .launch(request.clone(), store.clone(), shutdown.clone())
        .await
        .expect("first launch");
    assert!(registry.launch(request, store.clone(), shutdown.clone()).await.is_err());

    shutdown.cancel();
    registry.terminate_all(Duration::from_secs(1)).await;
    wait_idle(&registry).await;

    let record = store.get(3).await.expect("get").expect("kept");
    assert!(record.last_comment_at.is_none(), "cancelled resume writes nothing");
}

#[tokio::test]
async fn tool_not_found_output_keeps_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = seeded_store(4).await;
    let registry = ResumeRegistry::new();
    let newest = Utc::now() - ChronoDuration::minutes(2);

    registry
        .launch(
            ResumeRequest {
                command: resume_command(
                    4,
                    "echo \"sh: 1: rg: command not found\"; echo \"file not found: go.sum\" >&2; exit 1",
                    dir.path(),
                ),
                newest_note_at: newest,
            },
            store.clone(),
            CancellationToken::new(),
        )
        .await
        .expect("launch");

    wait_idle(&registry).await;
    let record = store.get(4).await.expect("get").expect("record kept");
    assert_eq!(record.last_comment_at, Some(newest));
}
