//! Domain layer for the taskmesh scheduler
//!
//! Core models, the ports adapters implement, and the error taxonomy.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult};
