//! Comment classification against realistic note streams.

use chrono::{DateTime, Duration, Utc};

use issue_autopilot::models::ticket::{Author, Note};
use issue_autopilot::orchestrator::classifier::CommentClassifier;

fn note(id: u64, name: &str, username: &str, created_at: DateTime<Utc>) -> Note {
    Note {
        id,
        body: format!("note {id}"),
        created_at,
        system: false,
        author: Author::new(name, username),
    }
}

#[test]
fn bot_and_human_authors() {
    let classifier = CommentClassifier::new("claude-bot");
    assert!(classifier.is_bot(&Author::new("Claude Bot", "claude-bot")));
    assert!(!classifier.is_bot(&Author::new("Alice", "alice123")));
}

#[test]
fn configured_bot_handle_matches_exactly() {
    let classifier = CommentClassifier::new("svc-bot");
    assert!(classifier.is_bot(&Author::new("Service Account", "svc-bot")));
    assert!(!classifier.is_bot(&Author::new("Service Account", "svc")));
}

#[test]
fn cutoff_is_strictly_after() {
    let classifier = CommentClassifier::new("claude-bot");
    let cutoff = Utc::now();
    let notes = vec![
        note(1, "Alice", "alice", cutoff - Duration::seconds(10)),
        note(2, "Alice", "alice", cutoff),
        note(3, "Bob", "bob", cutoff + Duration::seconds(1)),
    ];

    let fresh = classifier.new_human_notes(&notes, cutoff);
    let ids: Vec<u64> = fresh.iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![3]);
}

#[test]
fn bot_notes_after_cutoff_are_excluded() {
    let classifier = CommentClassifier::new("claude-bot");
    let cutoff = Utc::now();
    let notes = vec![
        note(1, "Claude Bot", "claude-bot", cutoff + Duration::seconds(5)),
        note(2, "Alice", "alice", cutoff + Duration::seconds(6)),
    ];

    let fresh = classifier.new_human_notes(&notes, cutoff);
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].author.username, "alice");
}

#[test]
fn memoryless_reply_tracks_last_reacted() {
    let classifier = CommentClassifier::new("claude-bot");
    let base = Utc::now();
    let mut notes = vec![
        note(1, "Claude Bot", "claude-bot", base),
        note(2, "Alice", "alice", base + Duration::seconds(30)),
    ];

    let reply = classifier
        .fresh_human_reply(&notes, Some(base))
        .expect("human reply after the completion comment");
    assert_eq!(reply.id, 2);
    let seen = reply.created_at;

    assert!(classifier.fresh_human_reply(&notes, Some(seen)).is_none());

    notes.push(note(3, "Alice", "alice", base + Duration::seconds(60)));
    assert_eq!(
        classifier
            .fresh_human_reply(&notes, Some(seen))
            .map(|n| n.id),
        Some(3)
    );
}
