//! Scheduling and process supervision.
//!
//! The [`scheduler::Daemon`] polls the tracker and drives the label
//! workflow. Fresh runs are owned by [`run_manager::RunManager`]; resumes of
//! stored sessions by [`resume::ResumeRegistry`].

pub mod classifier;
pub mod resume;
pub mod run_manager;
pub mod scheduler;
pub mod status;
pub mod tasks;
