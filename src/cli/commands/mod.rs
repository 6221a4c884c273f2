//! CLI command implementations.

pub mod agent;
pub mod config;
pub mod serve;
pub mod status;
pub mod task;
pub mod ticket;
