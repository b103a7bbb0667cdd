//! Application layer: use-case orchestration on top of the services.

pub mod run_coordinator;

pub use run_coordinator::{RunCoordinator, RunSummary};
