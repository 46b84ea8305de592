//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing, validation or missing credentials.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Issue tracker network, timeout or non-2xx failure.
    Tracker(String),
    /// Agent process could not be launched.
    Launch(String),
    /// Agent process exited unsuccessfully.
    Execution(String),
    /// The agent reported that a resumable session no longer exists.
    ResumeTargetInvalid(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// A bounded external call exceeded its deadline.
    Timeout(String),
    /// The operation observed daemon shutdown.
    Cancelled,
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether the error was caused by the shared shutdown token.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Tracker(msg) => write!(f, "tracker: {msg}"),
            Self::Launch(msg) => write!(f, "launch: {msg}"),
            Self::Execution(msg) => write!(f, "execution: {msg}"),
            Self::ResumeTargetInvalid(msg) => write!(f, "resume target invalid: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Tracker(err.to_string())
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
