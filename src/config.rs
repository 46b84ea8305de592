//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::mode::ExecutionMode;
use crate::{AppError, Result};

/// Keyring service name used for the tracker token.
const KEYRING_SERVICE: &str = "issue-autopilot";

/// GitLab connectivity settings.
///
/// The access token is loaded at runtime via OS keychain or environment
/// variable, never from the TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GitlabConfig {
    /// Base URL of the GitLab instance.
    #[serde(default = "default_gitlab_url")]
    pub url: String,
    /// Handle of the service account the agent posts as.
    #[serde(default)]
    pub username: String,
    /// Default project path (`group/subgroup/repo`) to monitor.
    #[serde(default)]
    pub project: Option<String>,
    /// Personal access token (populated at runtime).
    #[serde(skip)]
    pub token: String,
}

impl Default for GitlabConfig {
    fn default() -> Self {
        Self {
            url: default_gitlab_url(),
            username: String::new(),
            project: None,
            token: String::new(),
        }
    }
}

/// Coding-agent invocation settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Agent executable.
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Flags placed before the prompt arguments.
    #[serde(default = "default_agent_flags")]
    pub flags: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            flags: default_agent_flags(),
        }
    }
}

/// Poll-loop and workflow-label settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DaemonConfig {
    /// Seconds between poll ticks.
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    /// Label an external actor applies to request work.
    #[serde(default = "default_trigger_label")]
    pub trigger_label: String,
    /// Label present while a run is active.
    #[serde(default = "default_progress_label")]
    pub progress_label: String,
    /// Label present while completed work awaits human feedback.
    #[serde(default = "default_review_label")]
    pub review_label: String,
    /// Label applied when a run fails.
    #[serde(default = "default_error_label")]
    pub error_label: String,
    /// Label a human applies once the ticket is done.
    #[serde(default = "default_resolved_label")]
    pub resolved_label: String,
    /// Resume stored agent sessions instead of starting fresh runs.
    #[serde(default)]
    pub memory: bool,
    /// Days before a stored session is considered expired.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Deadline for a single ticket-listing call.
    #[serde(default = "default_list_timeout_seconds")]
    pub list_timeout_seconds: u64,
    /// Deadline for fetching one ticket's discussions.
    #[serde(default = "default_comment_timeout_seconds")]
    pub comment_timeout_seconds: u64,
    /// Deadline for cloning a missing repository checkout.
    #[serde(default = "default_clone_timeout_seconds")]
    pub clone_timeout_seconds: u64,
    /// Grace period between SIGTERM and force-kill on shutdown.
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
    /// Pause between posting the completion comment and relabeling.
    #[serde(default = "default_completion_settle_millis")]
    pub completion_settle_millis: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            trigger_label: default_trigger_label(),
            progress_label: default_progress_label(),
            review_label: default_review_label(),
            error_label: default_error_label(),
            resolved_label: default_resolved_label(),
            memory: false,
            retention_days: default_retention_days(),
            list_timeout_seconds: default_list_timeout_seconds(),
            comment_timeout_seconds: default_comment_timeout_seconds(),
            clone_timeout_seconds: default_clone_timeout_seconds(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
            completion_settle_millis: default_completion_settle_millis(),
        }
    }
}

impl DaemonConfig {
    /// Poll interval as a [`Duration`].
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Per-call deadline for ticket listings.
    #[must_use]
    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.list_timeout_seconds)
    }

    /// Per-ticket deadline for discussion fetches.
    #[must_use]
    pub fn comment_timeout(&self) -> Duration {
        Duration::from_secs(self.comment_timeout_seconds)
    }

    /// Deadline for `git clone`.
    #[must_use]
    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_seconds)
    }

    /// Grace period before survivors are force-killed.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    /// Delay between completion comment and label rewrite.
    #[must_use]
    pub fn completion_settle(&self) -> Duration {
        Duration::from_millis(self.completion_settle_millis)
    }

    /// Age after which stored sessions are purged.
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 3600)
    }
}

fn default_gitlab_url() -> String {
    "https://gitlab.com".into()
}

fn default_agent_command() -> String {
    "claude".into()
}

fn default_agent_flags() -> Vec<String> {
    [
        "--dangerously-skip-permissions",
        "--output-format",
        "stream-json",
        "--verbose",
    ]
    .iter()
    .map(|&flag| flag.to_owned())
    .collect()
}

fn default_interval_seconds() -> u64 {
    10
}

fn default_trigger_label() -> String {
    "claude".into()
}

fn default_progress_label() -> String {
    "picked_up_by_claude".into()
}

fn default_review_label() -> String {
    "waiting_human_review".into()
}

fn default_error_label() -> String {
    "error".into()
}

fn default_resolved_label() -> String {
    "solved".into()
}

fn default_retention_days() -> u32 {
    7
}

fn default_list_timeout_seconds() -> u64 {
    10
}

fn default_comment_timeout_seconds() -> u64 {
    8
}

fn default_clone_timeout_seconds() -> u64 {
    600
}

fn default_shutdown_grace_seconds() -> u64 {
    3
}

fn default_completion_settle_millis() -> u64 {
    2000
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory holding `sessions.db`; defaults to `$HOME/.issue-autopilot`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Directory under which project repositories are found or cloned;
    /// defaults to the current directory.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    /// Side-effect level.
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Tracker settings.
    #[serde(default)]
    pub gitlab: GitlabConfig,
    /// Agent invocation settings.
    #[serde(default)]
    pub agent: AgentConfig,
    /// Poll loop settings.
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Override selected values from the process environment.
    ///
    /// Recognises `GITLAB_URL`, `GITLAB_USERNAME`, `AGENT_COMMAND` and
    /// `DEFAULT_PROJECT_PATH`. Empty values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(url) = non_empty_env("GITLAB_URL") {
            self.gitlab.url = url;
        }
        if let Some(username) = non_empty_env("GITLAB_USERNAME") {
            self.gitlab.username = username;
        }
        if let Some(command) = non_empty_env("AGENT_COMMAND") {
            self.agent.command = command;
        }
        if let Some(project) = non_empty_env("DEFAULT_PROJECT_PATH") {
            self.gitlab.project = Some(project);
        }
    }

    /// Load the GitLab token from OS keychain with env-var fallback.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if neither keychain nor `GITLAB_TOKEN`
    /// provide a token.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.gitlab.token = load_credential("gitlab_token", "GITLAB_TOKEN").await?;
        Ok(())
    }

    /// Directory holding persisted state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no directory is configured and `HOME`
    /// is not set.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".issue-autopilot"))
            .ok_or_else(|| AppError::Config("HOME is not set and data_dir is missing".into()))
    }

    /// Path to the `SQLite` session database.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::data_dir`] failures.
    pub fn db_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("sessions.db"))
    }

    /// Directory under which repositories live.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if no root is configured and the current
    /// directory cannot be determined.
    pub fn workspace_root(&self) -> Result<PathBuf> {
        match &self.workspace_root {
            Some(root) => Ok(root.clone()),
            None => Ok(env::current_dir()?),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.daemon.interval_seconds == 0 {
            return Err(AppError::Config(
                "daemon.interval_seconds must be greater than zero".into(),
            ));
        }

        if self.agent.command.trim().is_empty() {
            return Err(AppError::Config("agent.command must not be empty".into()));
        }

        let labels = [
            &self.daemon.trigger_label,
            &self.daemon.progress_label,
            &self.daemon.review_label,
            &self.daemon.error_label,
        ];
        if labels.iter().any(|label| label.trim().is_empty()) {
            return Err(AppError::Config("workflow labels must not be empty".into()));
        }
        for (index, label) in labels.iter().enumerate() {
            if labels[index + 1..].contains(label) {
                return Err(AppError::Config(format!(
                    "workflow label '{label}' is used for more than one phase"
                )));
            }
        }

        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    non_empty_env(env_key).ok_or_else(|| {
        AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))
    })
}
