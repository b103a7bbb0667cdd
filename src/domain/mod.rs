//! Domain layer for the cascade orchestrator
//!
//! This module contains the core data model, errors, and the port traits
//! that infrastructure adapters implement.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult};
