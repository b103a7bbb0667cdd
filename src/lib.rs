//! Cascade - dependency-ordered execution of agent work items
//!
//! Cascade takes a plan of work items with dependencies, groups them into
//! batches that can run in parallel, drives each item through an external
//! agent with classified retries, and tracks the run through a fixed
//! eight-stage lifecycle that survives crashes.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): data model, errors and port traits
//! - **Service Layer** (`services`): scheduling, executors, retries, stages,
//!   recovery
//! - **Application Layer** (`application`): the run coordinator
//! - **Infrastructure Layer** (`infrastructure`): locking, state documents,
//!   configuration, logging
//! - **Adapters** (`adapters`): external agent commands and quality gates
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use cascade::{CommandRunner, ConfigLoader, RunCoordinator, StateStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigLoader::load()?;
//!     let store = StateStore::from_config(&config);
//!     let runner = Arc::new(CommandRunner::from_config(&config));
//!     let summary = RunCoordinator::new(config, store, runner).run().await?;
//!     println!("{} completed", summary.completed.len());
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use adapters::{CommandQualityGate, CommandRunner, GateOutputsDodGate};
pub use application::{RunCoordinator, RunSummary};
pub use domain::models::{
    BatchResult, Config, ExecutionBatch, ExecutionStage, ExecutorStrategy, ItemStatus, Plan,
    PlanKind, RetryConfig, StageStatus, WorkItem,
};
pub use domain::ports::{DodGate, QualityGate, StoryRunner};
pub use domain::{DomainError, DomainResult};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use infrastructure::locking::LockManager;
pub use infrastructure::state::StateStore;
pub use services::{
    BatchScheduler, ContextRecovery, ExecutionEvent, RetryManager, StageStateMachine,
};
