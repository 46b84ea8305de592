//! Resumable session-id extraction from agent output.
//!
//! The agent announces its conversation id somewhere in its stdout. With
//! `--output-format stream-json` it is a top-level `session_id` field; older
//! or plain-text output only mentions it in prose. [`SessionIdScanner`]
//! runs an ordered chain of extractors over each line and the first hit wins.

use regex::Regex;
use serde_json::Value;

use crate::{AppError, Result};

const UUID_PATTERN: &str = "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}";

/// Structured text fields that may carry prose mentioning the id.
const TEXT_FIELDS: [&str; 3] = ["content", "delta", "result"];

/// Compiled extractor chain.
#[derive(Debug, Clone)]
pub struct SessionIdScanner {
    labeled: Vec<Regex>,
    bare: Regex,
}

impl SessionIdScanner {
    /// Compile the extractor patterns.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a pattern fails to compile.
    pub fn new() -> Result<Self> {
        let compile = |pattern: String| {
            Regex::new(&pattern)
                .map_err(|err| AppError::Config(format!("invalid session id pattern: {err}")))
        };

        let labeled = [
            format!(r"(?i)session\s+id[:\s]+({UUID_PATTERN})"),
            format!(r"(?i)session[:\s]+({UUID_PATTERN})"),
            format!(r"(?i)id[:\s]+({UUID_PATTERN})"),
        ]
        .into_iter()
        .map(compile)
        .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            labeled,
            bare: compile(UUID_PATTERN.to_owned())?,
        })
    }

    /// Extract a session id from one line of agent stdout.
    ///
    /// JSON lines are checked for a `session_id` field first, then their
    /// `content`/`delta`/`result` text. Non-JSON lines are scanned as text.
    #[must_use]
    pub fn scan_line(&self, line: &str) -> Option<String> {
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(line) else {
            return self.scan_text(line);
        };

        if let Some(id) = map
            .get("session_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
        {
            return Some(id.to_owned());
        }

        TEXT_FIELDS
            .iter()
            .find_map(|field| map.get(*field).and_then(Value::as_str))
            .and_then(|text| self.scan_text(text))
    }

    /// Labeled patterns first, then a bare id when the text mentions a session.
    #[must_use]
    pub fn scan_text(&self, text: &str) -> Option<String> {
        for pattern in &self.labeled {
            if let Some(id) = pattern.captures(text).and_then(|caps| caps.get(1)) {
                return Some(id.as_str().to_owned());
            }
        }

        if text.to_lowercase().contains("session") {
            return self.bare.find(text).map(|m| m.as_str().to_owned());
        }
        None
    }
}
