pub mod batch_executor;
pub mod batch_scheduler;
pub mod dag_render;
pub mod failure_classifier;
pub mod recovery;
pub mod retry_manager;
pub mod stage_machine;

pub use batch_executor::{
    build_executor, BatchExecutor, ConcurrentExecutor, ExecutionEvent, ItemPipeline,
    PollingExecutor,
};
pub use batch_scheduler::BatchScheduler;
pub use dag_render::{render_dag, render_mermaid};
pub use failure_classifier::{classify_outcome, suggest_fixes};
pub use recovery::{ContextRecovery, RecoveryReport};
pub use retry_manager::{RetryManager, RetrySummary};
pub use stage_machine::StageStateMachine;
