//! Story runner port - interface for the executing agent backend.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{ExecutionOutcome, ExecutionRequest};

/// Capability that actually executes a work item.
///
/// Backends that can report completion synchronously implement `run`.
/// Backends that cannot implement `launch_batch` and report completion by
/// writing item status to the plan document, which the polling executor
/// watches.
#[async_trait]
pub trait StoryRunner: Send + Sync {
    /// Get the runner type name.
    fn name(&self) -> &'static str;

    /// Execute one request to completion.
    async fn run(&self, request: ExecutionRequest) -> DomainResult<ExecutionOutcome>;

    /// Start every request without waiting for any of them to finish.
    async fn launch_batch(&self, requests: Vec<ExecutionRequest>) -> DomainResult<()>;

    /// Detailed outcome of a launched item, if the backend kept one.
    async fn outcome(&self, _item_id: &str) -> Option<ExecutionOutcome> {
        None
    }
}
