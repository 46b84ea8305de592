//! Domain model module declarations.

pub mod run;
pub mod session;
pub mod ticket;
pub mod workflow;
