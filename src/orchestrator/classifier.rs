//! Comment classification for tickets awaiting review.
//!
//! Pure functions over conversation notes: who wrote a note, which notes
//! are new relative to a cutoff, and which note the memory-less mode reacts
//! to.

use chrono::{DateTime, Utc};

use crate::models::ticket::{Author, Note};

/// Substrings marking a display name as automated.
const BOT_NAME_MARKERS: [&str; 2] = ["claude", "bot"];
/// Substring marking a handle as automated.
const BOT_HANDLE_MARKER: &str = "bot";

/// Decides whether a note came from the service account or another bot.
#[derive(Debug, Clone)]
pub struct CommentClassifier {
    service_handle: String,
}

impl CommentClassifier {
    /// Build a classifier for the configured service account handle.
    #[must_use]
    pub fn new(service_handle: impl Into<String>) -> Self {
        Self {
            service_handle: service_handle.into(),
        }
    }

    /// Whether `author` is automated.
    ///
    /// An exact match on the service handle only counts when that handle
    /// itself looks like a bot, so a human whose handle happens to be
    /// configured is still treated as human.
    #[must_use]
    pub fn is_bot(&self, author: &Author) -> bool {
        let name = author.name.to_lowercase();
        let handle = author.username.to_lowercase();

        if BOT_NAME_MARKERS.iter().any(|m| name.contains(m)) || handle.contains(BOT_HANDLE_MARKER)
        {
            return true;
        }

        !self.service_handle.is_empty()
            && author.username == self.service_handle
            && self.service_handle.to_lowercase().contains(BOT_HANDLE_MARKER)
    }

    /// Whether `note` was written by a human.
    #[must_use]
    pub fn is_human(&self, note: &Note) -> bool {
        !note.system && !self.is_bot(&note.author)
    }

    /// Human notes created strictly after `cutoff`, in input order.
    #[must_use]
    pub fn new_human_notes<'a>(&self, notes: &'a [Note], cutoff: DateTime<Utc>) -> Vec<&'a Note> {
        notes_after(notes, cutoff)
            .filter(|note| self.is_human(note))
            .collect()
    }

    /// The latest non-system note, if it is human and newer than
    /// `last_reacted` (or nothing has been reacted to yet).
    #[must_use]
    pub fn fresh_human_reply<'a>(
        &self,
        notes: &'a [Note],
        last_reacted: Option<DateTime<Utc>>,
    ) -> Option<&'a Note> {
        let latest = notes
            .iter()
            .filter(|note| !note.system)
            .max_by_key(|note| note.created_at)?;

        if !self.is_human(latest) {
            return None;
        }
        match last_reacted {
            Some(seen) if latest.created_at <= seen => None,
            _ => Some(latest),
        }
    }
}

/// Non-system notes created strictly after `cutoff`.
pub fn notes_after(notes: &[Note], cutoff: DateTime<Utc>) -> impl Iterator<Item = &Note> {
    notes
        .iter()
        .filter(move |note| !note.system && note.created_at > cutoff)
}
