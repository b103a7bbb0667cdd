pub mod batch;
pub mod config;
pub mod contract;
pub mod execution;
pub mod gate;
pub mod progress;
pub mod recovery;
pub mod retry;
pub mod stage;
pub mod work_item;

pub use batch::{BatchResult, ExecutionBatch, ItemResult};
pub use config::{
    AgentCommand, AgentsConfig, Config, ExecutorConfig, ExecutorStrategy, GateCommand,
    GatesConfig, LockBackend, LockConfig, LoggingConfig, RetryConfig, StateConfig,
};
pub use contract::{AcceptanceCheck, ContractRegistry, StageContract};
pub use execution::{base_prompt, ExecutionOutcome, ExecutionRequest};
pub use gate::{
    failed_gates, AiVerificationResult, DodCheckResult, DodRequest, GateResults,
    QualityGateResult,
};
pub use progress::{
    BatchProgress, BatchRecord, IterationState, RunStatus, StoryProgress, StoryProgressStatus,
};
pub use recovery::{IncompleteStateInfo, ResumeReason, ResumeSuggestion};
pub use retry::{
    ErrorType, FailureDetails, FailureRecord, RetryState, RetryStateDocument,
};
pub use stage::{
    ExecutionStage, StageOutputs, StageState, StageStateDocument, StageStatus, StageTransition,
};
pub use work_item::{ItemStatus, Plan, PlanCounts, PlanKind, Priority, WorkItem};
