//! Drives one run end to end: stage lifecycle, batch scheduling, execution
//! and the bookkeeping written back to the plan and iteration state.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    BatchRecord, BatchResult, Config, ContractRegistry, ExecutionStage, ItemStatus, Plan,
    PlanKind, RunStatus, StageOutputs, StageStatus,
};
use crate::domain::ports::{DodGate, QualityGate, StoryRunner};
use crate::infrastructure::state::{blocking, StateStore};
use crate::services::batch_executor::{build_executor, ExecutionEvent, ItemPipeline};
use crate::services::batch_scheduler::BatchScheduler;
use crate::services::retry_manager::RetryManager;
use crate::services::stage_machine::StageStateMachine;

/// Flow name recorded in the stage state.
const FLOW: &str = "standard";

/// What a run did.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub execution_id: String,
    pub plan_kind: PlanKind,
    pub batches: Vec<BatchResult>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Set when `stop_on_first_failure` ended the run before its last batch.
    pub stopped_early: bool,
    pub execute_status: StageStatus,
    pub duration_secs: f64,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.failed.is_empty() && !self.stopped_early
    }

    /// One line per failed item, with its top suggested fix.
    pub fn failure_summaries(&self) -> Vec<String> {
        self.batches
            .iter()
            .flat_map(|batch| batch.item_results.iter())
            .filter_map(|result| result.failure_summary())
            .collect()
    }
}

/// Outcome of the Execute stage before it is recorded.
struct ExecuteOutcome {
    batches: Vec<BatchResult>,
    completed: Vec<String>,
    failed: Vec<String>,
    stopped_early: bool,
}

pub struct RunCoordinator {
    config: Config,
    store: StateStore,
    registry: Arc<ContractRegistry>,
    runner: Arc<dyn StoryRunner>,
    quality_gate: Option<Arc<dyn QualityGate>>,
    dod_gate: Option<Arc<dyn DodGate>>,
    events: Option<mpsc::Sender<ExecutionEvent>>,
    scheduler: BatchScheduler,
}

impl std::fmt::Debug for RunCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunCoordinator")
            .field("strategy", &self.config.executor.strategy)
            .field("state_root", &self.store.root())
            .field("runner", &self.runner.name())
            .finish_non_exhaustive()
    }
}

impl RunCoordinator {
    pub fn new(config: Config, store: StateStore, runner: Arc<dyn StoryRunner>) -> Self {
        Self {
            config,
            store,
            registry: Arc::new(ContractRegistry::standard()),
            runner,
            quality_gate: None,
            dod_gate: None,
            events: None,
            scheduler: BatchScheduler::new(),
        }
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Arc<ContractRegistry>) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_quality_gate(mut self, gate: Arc<dyn QualityGate>) -> Self {
        self.quality_gate = Some(gate);
        self
    }

    #[must_use]
    pub fn with_dod_gate(mut self, gate: Arc<dyn DodGate>) -> Self {
        self.dod_gate = Some(gate);
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: mpsc::Sender<ExecutionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run (or resume) the plan in the state root.
    ///
    /// # Errors
    ///
    /// `NotFound` when no plan exists, `ValidationFailed` when a failed stage
    /// must be rewound first, and any persistence or contract error raised
    /// along the way. Item failures are reported in the summary, not as
    /// errors.
    #[instrument(skip(self), fields(strategy = %self.config.executor.strategy))]
    pub async fn run(&self) -> DomainResult<RunSummary> {
        let started = Instant::now();
        let plan = self
            .store
            .load_any_plan()?
            .ok_or_else(|| DomainError::NotFound(self.store.path(PlanKind::Feature.file_name())))?;

        let mut machine = self.open_machine()?;
        if let Some(stage) = machine.document().stages_with(StageStatus::Failed).first() {
            return Err(DomainError::ValidationFailed(format!(
                "stage {stage} failed; run `cascade stage resume-from {stage}` first"
            )));
        }
        info!(
            execution_id = machine.execution_id(),
            plan = %plan.kind,
            items = plan.len(),
            "run started"
        );

        self.prepare_stages(&mut machine, &plan)?;

        machine.start(ExecutionStage::Execute)?;
        let outcome = self.execute_plan(machine.execution_id(), &plan).await?;

        if outcome.failed.is_empty() && !outcome.stopped_early {
            machine.complete(
                ExecutionStage::Execute,
                outputs([
                    ("completed_items", json!(outcome.completed)),
                    ("failed_items", json!(outcome.failed)),
                ]),
            )?;
            self.finish_stages(&mut machine, &outcome)?;
        } else {
            let mut errors: Vec<String> = outcome
                .batches
                .iter()
                .flat_map(|batch| batch.item_results.iter())
                .filter_map(|result| result.failure_summary())
                .collect();
            if outcome.stopped_early {
                errors.push("run stopped after the first failed batch".to_string());
            }
            machine.fail(ExecutionStage::Execute, errors)?;
        }

        let execute_status = machine.status(ExecutionStage::Execute);
        let run_status = match execute_status {
            StageStatus::Completed => RunStatus::Completed,
            _ if outcome.stopped_early => RunStatus::Stopped,
            _ => RunStatus::Failed,
        };
        self.store
            .update_iteration_state(|state| state.status = run_status)?;

        let summary = RunSummary {
            execution_id: machine.execution_id().to_string(),
            plan_kind: plan.kind,
            batches: outcome.batches,
            completed: outcome.completed,
            failed: outcome.failed,
            stopped_early: outcome.stopped_early,
            execute_status,
            duration_secs: started.elapsed().as_secs_f64(),
        };
        info!(
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            status = %execute_status,
            "run finished"
        );
        Ok(summary)
    }

    /// Reload the persisted stage state, or start a new one. A finished run
    /// is rewound so the plan can be executed again.
    fn open_machine(&self) -> DomainResult<StageStateMachine> {
        let registry = Arc::clone(&self.registry);
        match StageStateMachine::load(Arc::clone(&registry), self.store.clone())? {
            Some(mut machine) => {
                if machine.is_complete() {
                    info!(execution_id = machine.execution_id(), "previous run complete, starting over");
                    machine.reset()?;
                }
                Ok(machine)
            }
            None => StageStateMachine::create(
                registry,
                self.store.clone(),
                self.config.executor.strategy.to_string(),
                FLOW,
            ),
        }
    }

    /// Intake through ReadyCheck, derived from the plan itself.
    fn prepare_stages(&self, machine: &mut StageStateMachine, plan: &Plan) -> DomainResult<()> {
        let goal = if plan.goal.trim().is_empty() {
            format!("Execute the {} plan", plan.kind)
        } else {
            plan.goal.clone()
        };
        advance(machine, ExecutionStage::Intake, outputs([("goal", json!(goal))]))?;
        skip_if_pending(machine, ExecutionStage::Analyze, "context comes from the plan")?;
        advance(
            machine,
            ExecutionStage::Plan,
            outputs([
                ("plan_path", json!(self.store.path(plan.kind.file_name()))),
                ("item_count", json!(plan.len())),
            ]),
        )?;
        skip_if_pending(machine, ExecutionStage::Design, "no design document requested")?;

        let dangling: Vec<String> = plan
            .dangling_dependencies()
            .into_iter()
            .map(|(item, dep)| format!("{item} depends on unknown {dep}"))
            .collect();
        for warning in &dangling {
            warn!("{warning}");
        }
        advance(
            machine,
            ExecutionStage::ReadyCheck,
            outputs([("ready", json!(true)), ("warnings", json!(dangling))]),
        )
    }

    /// VerifyReview and WrapUp after a clean Execute stage.
    fn finish_stages(&self, machine: &mut StageStateMachine, outcome: &ExecuteOutcome) -> DomainResult<()> {
        skip_if_pending(
            machine,
            ExecutionStage::VerifyReview,
            "items were verified by the quality gates",
        )?;
        let retried: usize = outcome.batches.iter().map(|b| b.retried.len()).sum();
        let summary = format!(
            "{} item(s) completed in {} batch(es), {retried} retried",
            outcome.completed.len(),
            outcome.batches.len()
        );
        advance(machine, ExecutionStage::WrapUp, outputs([("summary", json!(summary))]))
    }

    /// Execute every batch in order, writing item statuses and iteration
    /// state after each one.
    async fn execute_plan(&self, execution_id: &str, plan: &Plan) -> DomainResult<ExecuteOutcome> {
        let batches = self.scheduler.schedule_plan(plan);
        let total_items: usize = batches.iter().map(|b| b.len()).sum();
        self.store.update_iteration_state(|state| {
            if state.execution_id.as_deref() != Some(execution_id) {
                state.batch_results.clear();
                state.started_at = None;
            }
            state.execution_id = Some(execution_id.to_string());
            state.status = RunStatus::Running;
            state.iteration += 1;
            state.current_batch = 0;
            state.total_batches = batches.len();
            state.total_items = total_items;
            state.completed_count = 0;
            state.failed_count = 0;
            state.parallel_execution = None;
            state.started_at.get_or_insert_with(Utc::now);
        })?;

        let retries = Arc::new(RetryManager::load(
            self.config.retry.clone(),
            self.config.executor.default_agent.clone(),
            self.store.clone(),
        )?);
        let mut pipeline = ItemPipeline::new(retries);
        if let Some(gate) = &self.quality_gate {
            pipeline = pipeline.with_quality_gate(Arc::clone(gate));
        }
        if let Some(gate) = &self.dod_gate {
            pipeline = pipeline.with_dod_gate(Arc::clone(gate));
        }
        if let Some(events) = &self.events {
            pipeline = pipeline.with_events(events.clone());
        }
        let executor = build_executor(
            &self.config.executor,
            Arc::clone(&self.runner),
            pipeline,
            Some(self.store.clone()),
            plan.kind,
        )?;

        let mut outcome = ExecuteOutcome {
            batches: Vec::with_capacity(batches.len()),
            completed: Vec::new(),
            failed: Vec::new(),
            stopped_early: false,
        };
        let batch_count = batches.len();
        for batch in &batches {
            if batch.forced {
                warn!(batch = batch.index, "executing forced batch; dependencies may be unmet");
            }
            let result = executor.execute(batch).await?;
            let (store, kind, recorded) = (self.store.clone(), plan.kind, result.clone());
            blocking(move || record_batch(&store, kind, &recorded)).await?;

            outcome.completed.extend(result.completed.iter().cloned());
            outcome.failed.extend(result.failed.iter().cloned());
            let failed = !result.success;
            let index = result.batch_index;
            outcome.batches.push(result);

            if failed && self.config.executor.stop_on_first_failure && index + 1 < batch_count {
                warn!(batch = index, "stopping after failed batch");
                outcome.stopped_early = true;
                break;
            }
        }
        Ok(outcome)
    }
}

/// Write a finished batch into the plan and the iteration history.
fn record_batch(store: &StateStore, kind: PlanKind, result: &BatchResult) -> DomainResult<()> {
    store.update_plan(kind, |plan| {
        for id in &result.completed {
            plan.set_status(id, ItemStatus::Complete)?;
        }
        for id in &result.failed {
            plan.set_status(id, ItemStatus::Failed)?;
        }
        Ok(())
    })?;

    let record = BatchRecord {
        batch_index: result.batch_index,
        completed: result.completed.clone(),
        failed: result.failed.clone(),
        retried: result.retried.clone(),
        duration_secs: result.duration.as_secs_f64(),
        success: result.success,
        finished_at: Utc::now(),
    };
    store.update_iteration_state(move |state| {
        state.current_batch = record.batch_index + 1;
        state.completed_count += record.completed.len();
        state.failed_count += record.failed.len();
        state.parallel_execution = None;
        state.batch_results.push(record);
    })?;
    Ok(())
}

fn outputs<const N: usize>(pairs: [(&str, Value); N]) -> StageOutputs {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Start (if needed) and complete `stage`. Stages already done are left alone.
fn advance(machine: &mut StageStateMachine, stage: ExecutionStage, outputs: StageOutputs) -> DomainResult<()> {
    if machine.status(stage).is_done() {
        return Ok(());
    }
    machine.start(stage)?;
    machine.complete(stage, outputs)
}

fn skip_if_pending(machine: &mut StageStateMachine, stage: ExecutionStage, reason: &str) -> DomainResult<()> {
    if machine.status(stage) == StageStatus::Pending {
        machine.skip(stage, reason)?;
    }
    Ok(())
}
