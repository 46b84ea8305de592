//! Execution mode: how many side effects the daemon is allowed to perform.
//!
//! `ExecutionMode` is derived from the `--dry-run` / `--semi-dry-run` CLI
//! flags and can also be set in the TOML configuration.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Side-effect level for the scheduler.
///
/// Defaults to [`ExecutionMode::Live`].
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Mutate labels, post comments and run the agent.
    #[default]
    Live,
    /// Log what would happen; touch nothing, not even the workspace.
    DryRun,
    /// Verify or clone the workspace, but never run the agent or touch the tracker.
    SemiDryRun,
}

impl ExecutionMode {
    /// Whether tracker mutations and agent execution are suppressed.
    #[must_use]
    pub fn is_simulated(self) -> bool {
        !matches!(self, Self::Live)
    }

    /// Short log tag used as a structured field.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::DryRun => "dry-run",
            Self::SemiDryRun => "semi-dry-run",
        }
    }
}
