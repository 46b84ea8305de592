#![forbid(unsafe_code)]

//! Label-driven GitLab daemon that launches coding agents on tickets,
//! supervises them, and resumes their sessions when humans comment.

pub mod agent;
pub mod config;
pub mod errors;
pub mod mode;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod tracker;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
pub use mode::ExecutionMode;
