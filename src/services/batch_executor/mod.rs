//! Batch executors.
//!
//! Two strategies execute one [`ExecutionBatch`] and report a [`BatchResult`]
//! with identical semantics:
//! - [`ConcurrentExecutor`]: one tokio task per item under a semaphore
//! - [`PollingExecutor`]: one launch call, then polls the plan for item status
//!
//! Both judge every attempt the same way (execution, quality gate, DoD) and
//! allow at most one in-batch retry per item.

mod concurrent;
mod pipeline;
mod polling;

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    BatchResult, ErrorType, ExecutionBatch, ExecutorConfig, ExecutorStrategy, PlanKind,
};
use crate::domain::ports::StoryRunner;
use crate::infrastructure::state::StateStore;

pub use concurrent::ConcurrentExecutor;
pub use pipeline::{ItemPipeline, ProgressTracker, Verdict};
pub use polling::PollingExecutor;

/// Events emitted while a batch executes.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// Batch started.
    BatchStarted { batch_index: usize, item_count: usize },
    /// Item attempt started.
    ItemStarted { item_id: String, agent: String, attempt: u32 },
    /// Item failed and will be attempted again after `delay_ms`.
    ItemRetrying {
        item_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// Item completed.
    ItemCompleted { item_id: String, attempts: u32 },
    /// Item failed for good within this batch.
    ItemFailed {
        item_id: String,
        error: String,
        error_type: ErrorType,
    },
    /// Batch finished.
    BatchCompleted {
        batch_index: usize,
        completed: usize,
        failed: usize,
        duration_secs: f64,
    },
}

/// Executes one batch to a terminal result.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    fn strategy(&self) -> ExecutorStrategy;

    async fn execute(&self, batch: &ExecutionBatch) -> DomainResult<BatchResult>;
}

/// Build the executor selected by `config.strategy`.
///
/// The polling strategy observes the plan document, so it needs a store.
pub fn build_executor(
    config: &ExecutorConfig,
    runner: Arc<dyn StoryRunner>,
    pipeline: ItemPipeline,
    store: Option<StateStore>,
    plan_kind: PlanKind,
) -> DomainResult<Box<dyn BatchExecutor>> {
    match config.strategy {
        ExecutorStrategy::Concurrent => {
            let mut executor = ConcurrentExecutor::new(runner, pipeline, config);
            if let Some(store) = store {
                executor = executor.with_store(store);
            }
            Ok(Box::new(executor))
        }
        ExecutorStrategy::Polling => {
            let store = store.ok_or_else(|| {
                DomainError::Config("the polling executor requires a state store".to_string())
            })?;
            Ok(Box::new(PollingExecutor::new(
                runner, pipeline, store, plan_kind, config,
            )))
        }
    }
}
