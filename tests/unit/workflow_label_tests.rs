use issue_autopilot::config::DaemonConfig;
use issue_autopilot::models::workflow::{WorkflowLabels, WorkflowState};

fn labels() -> WorkflowLabels {
    WorkflowLabels::from(&DaemonConfig::default())
}

fn set(items: &[&str]) -> Vec<String> {
    items.iter().map(|&s| s.to_owned()).collect()
}

#[test]
fn claim_then_complete() {
    let wl = labels();
    let claimed = wl.claimed(&set(&["backend", "claude"]));
    assert_eq!(claimed, set(&["backend", "picked_up_by_claude"]));
    assert_eq!(wl.state_of(&claimed), WorkflowState::InProgress);

    let done = wl.completed(&claimed);
    assert_eq!(done, set(&["backend", "waiting_human_review"]));
    assert_eq!(wl.state_of(&done), WorkflowState::AwaitingReview);
}

#[test]
fn claiming_twice_changes_nothing() {
    let wl = labels();
    let once = wl.claimed(&set(&["claude"]));
    assert_eq!(wl.claimed(&once), once);
}

#[test]
fn failure_moves_to_error() {
    let wl = labels();
    let failed = wl.failed(&set(&["picked_up_by_claude"]));
    assert_eq!(failed, set(&["error"]));
    assert_eq!(wl.state_of(&failed), WorkflowState::Errored);
}

#[test]
fn resolved_wins_over_review() {
    let wl = labels();
    assert_eq!(
        wl.state_of(&set(&["waiting_human_review", "solved"])),
        WorkflowState::Resolved
    );
}
