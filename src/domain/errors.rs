//! Domain errors for the cascade orchestrator.

use std::path::PathBuf;

use thiserror::Error;

use super::models::{ExecutionStage, StageStatus};

/// Format a cycle path as a human-readable string: `A -> B -> C -> A`.
fn format_cycle_path(path: &[String]) -> String {
    path.join(" -> ")
}

/// Domain-level errors that can occur while orchestrating a run.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Work item not found: {0}")]
    ItemNotFound(String),

    #[error("Duplicate work item id in plan: {0}")]
    DuplicateItem(String),

    #[error("Dependency cycle detected: {}", format_cycle_path(.0))]
    DependencyCycle(Vec<String>),

    #[error("Invalid stage transition for {stage} from {from} to {to}: {reason}")]
    InvalidStateTransition {
        stage: ExecutionStage,
        from: StageStatus,
        to: StageStatus,
        reason: String,
    },

    #[error("Contract violation in stage {stage}: {reason}")]
    ContractViolation {
        stage: ExecutionStage,
        missing: Vec<String>,
        reason: String,
    },

    #[error("Stage {0} is not skippable")]
    StageNotSkippable(ExecutionStage),

    #[error("Retries exhausted for {id} after {attempts} attempts")]
    RetryExhausted { id: String, attempts: u32 },

    #[error("Timed out after {waited_ms}ms waiting for lock '{name}'")]
    LockTimeout { name: String, waited_ms: u64 },

    #[error("Failed to acquire lock '{name}': {reason}")]
    LockFailed { name: String, reason: String },

    #[error("State file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DomainError {
    /// Whether the operation that produced this error may succeed if retried
    /// unchanged.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
