//! Tracker-side entities: tickets, discussion threads and notes.
//!
//! Field names follow the GitLab v4 REST payloads so these types
//! deserialize directly from API responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a ticket or note author.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Author {
    /// Numeric user identifier.
    #[serde(default)]
    pub id: u64,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Login handle.
    #[serde(default)]
    pub username: String,
}

impl Author {
    /// Build an author from a display name and handle.
    #[must_use]
    pub fn new(name: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            username: username.into(),
        }
    }
}

/// A ticket (GitLab issue).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ticket {
    /// Global identifier.
    pub id: u64,
    /// Project-scoped, human-facing sequence number.
    pub iid: u64,
    /// Title line.
    pub title: String,
    /// Free-text body.
    #[serde(default)]
    pub description: Option<String>,
    /// `opened` or `closed`.
    pub state: String,
    /// Ordered label set.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Ticket author.
    #[serde(default)]
    pub author: Author,
    /// Browser URL.
    #[serde(default)]
    pub web_url: String,
}

impl Ticket {
    /// Whether the ticket carries `label`.
    #[must_use]
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// A single conversation note.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Note {
    /// Note identifier.
    pub id: u64,
    /// Markdown body.
    pub body: String,
    /// Server-assigned creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Generated by the tracker itself (label changes, mentions).
    #[serde(default)]
    pub system: bool,
    /// Who wrote it.
    pub author: Author,
}

/// A discussion thread: an ordered list of notes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscussionThread {
    /// Thread identifier.
    pub id: String,
    /// Notes in posting order.
    #[serde(default)]
    pub notes: Vec<Note>,
}
