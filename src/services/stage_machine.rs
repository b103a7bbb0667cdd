//! Eight-stage lifecycle of one execution run.
//!
//! Stages only move forward: `pending → in_progress → completed | failed`,
//! or `pending → skipped`. The only way back is `resume_from`, which rewinds a
//! stage and every later one to `pending`. Each transition is recorded in the
//! history and, when a store is attached, persisted before it takes effect in
//! memory.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    ContractRegistry, ExecutionStage, StageOutputs, StageState, StageStateDocument, StageStatus,
    StageTransition,
};
use crate::infrastructure::state::StateStore;

pub struct StageStateMachine {
    registry: Arc<ContractRegistry>,
    doc: StageStateDocument,
    store: Option<StateStore>,
}

impl std::fmt::Debug for StageStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageStateMachine")
            .field("execution_id", &self.doc.execution_id)
            .field("current_stage", &self.doc.current_stage)
            .field("persistent", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

fn record(
    doc: &mut StageStateDocument,
    stage: ExecutionStage,
    new_status: StageStatus,
    errors: Option<Vec<String>>,
    reason: Option<String>,
) {
    doc.history.push(StageTransition {
        timestamp: Utc::now(),
        stage,
        new_status,
        errors,
        reason,
    });
}

fn state_mut(doc: &mut StageStateDocument, stage: ExecutionStage) -> &mut StageState {
    doc.stages
        .entry(stage)
        .or_insert_with(|| StageState::pending(stage))
}

fn invalid(stage: ExecutionStage, from: StageStatus, to: StageStatus, reason: impl Into<String>) -> DomainError {
    DomainError::InvalidStateTransition {
        stage,
        from,
        to,
        reason: reason.into(),
    }
}

fn inputs_for(doc: &StageStateDocument, stage: ExecutionStage) -> StageOutputs {
    let mut available = doc.inputs.clone();
    for earlier in stage.predecessors() {
        if let Some(state) = doc.stages.get(earlier) {
            if state.status == StageStatus::Completed {
                available.extend(state.outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
    }
    available
}

/// Last stage in order that actually ran. Skipped stages do not count.
fn latest_active(doc: &StageStateDocument) -> Option<ExecutionStage> {
    ExecutionStage::ALL
        .into_iter()
        .rev()
        .find(|stage| doc.status(*stage).has_run())
}

impl StageStateMachine {
    /// In-memory machine over an existing document.
    pub fn new(registry: Arc<ContractRegistry>, mut doc: StageStateDocument) -> Self {
        doc.normalize();
        Self {
            registry,
            doc,
            store: None,
        }
    }

    /// Persist every transition through `store`.
    #[must_use]
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Start a new run with every stage pending and persist it.
    pub fn create(
        registry: Arc<ContractRegistry>,
        store: StateStore,
        strategy: impl Into<String>,
        flow: impl Into<String>,
    ) -> DomainResult<Self> {
        let doc = StageStateDocument::new(strategy, flow);
        store.save_stage_state(&doc)?;
        info!(execution_id = %doc.execution_id, "stage state created");
        Ok(Self::new(registry, doc).with_store(store))
    }

    /// Reload a persisted run, if any.
    pub fn load(registry: Arc<ContractRegistry>, store: StateStore) -> DomainResult<Option<Self>> {
        Ok(store
            .load_stage_state()?
            .map(|doc| Self::new(registry, doc).with_store(store)))
    }

    pub fn document(&self) -> &StageStateDocument {
        &self.doc
    }

    pub fn execution_id(&self) -> &str {
        &self.doc.execution_id
    }

    pub fn registry(&self) -> &ContractRegistry {
        &self.registry
    }

    pub fn status(&self, stage: ExecutionStage) -> StageStatus {
        self.doc.status(stage)
    }

    pub fn state(&self, stage: ExecutionStage) -> Option<&StageState> {
        self.doc.stages.get(&stage)
    }

    pub fn history(&self) -> &[StageTransition] {
        &self.doc.history
    }

    pub fn progress(&self) -> u8 {
        self.doc.progress_percent()
    }

    pub fn is_complete(&self) -> bool {
        self.doc.is_complete()
    }

    /// The stage currently `in_progress`, if any.
    pub fn active_stage(&self) -> Option<ExecutionStage> {
        self.doc.stages_with(StageStatus::InProgress).first().copied()
    }

    /// Run-level inputs plus the outputs of every completed earlier stage.
    pub fn available_inputs(&self, stage: ExecutionStage) -> StageOutputs {
        inputs_for(&self.doc, stage)
    }

    /// Add a run-level input visible to every stage.
    pub fn provide_input(&mut self, key: impl Into<String>, value: Value) -> DomainResult<()> {
        let mut next = self.doc.clone();
        next.inputs.insert(key.into(), value);
        self.commit(next)
    }

    /// Move `stage` to `in_progress`.
    ///
    /// Earlier stages still pending are skipped when their contract allows
    /// it. Starting the stage that is already in progress is a no-op. A later
    /// stage that was skipped ahead of time does not block the start.
    pub fn start(&mut self, stage: ExecutionStage) -> DomainResult<()> {
        let current = self.doc.status(stage);
        if current == StageStatus::InProgress {
            return Ok(());
        }
        if current.is_terminal() {
            return Err(invalid(
                stage,
                current,
                StageStatus::InProgress,
                "stage already finished; use resume_from to run it again",
            ));
        }
        if let Some(active) = self.active_stage() {
            return Err(invalid(
                stage,
                current,
                StageStatus::InProgress,
                format!("stage {active} is in progress"),
            ));
        }
        if let Some(later) = stage.this_and_after()[1..]
            .iter()
            .find(|later| self.doc.status(**later).has_run())
        {
            return Err(invalid(
                stage,
                current,
                StageStatus::InProgress,
                format!("later stage {later} has already run; use resume_from to go back"),
            ));
        }

        let mut next = self.doc.clone();
        for &earlier in stage.predecessors() {
            if next.status(earlier) != StageStatus::Pending {
                continue;
            }
            if !self.registry.is_skippable(earlier) {
                return Err(invalid(
                    stage,
                    current,
                    StageStatus::InProgress,
                    format!("earlier stage {earlier} has not run and is not skippable"),
                ));
            }
            let reason = format!("auto-skipped before starting {stage}");
            let state = state_mut(&mut next, earlier);
            state.status = StageStatus::Skipped;
            state.completed_at = Some(Utc::now());
            state.skip_reason = Some(reason.clone());
            record(&mut next, earlier, StageStatus::Skipped, None, Some(reason));
            info!(stage = %earlier, "stage auto-skipped");
        }

        let missing = self
            .registry
            .get(stage)
            .missing_inputs(&inputs_for(&next, stage));
        if !missing.is_empty() {
            return Err(DomainError::ContractViolation {
                stage,
                reason: format!("missing required inputs: {}", missing.join(", ")),
                missing,
            });
        }

        let state = state_mut(&mut next, stage);
        state.status = StageStatus::InProgress;
        state.started_at = Some(Utc::now());
        state.completed_at = None;
        state.errors.clear();
        next.current_stage = Some(stage);
        record(&mut next, stage, StageStatus::InProgress, None, None);

        self.commit(next)?;
        info!(stage = %stage, "stage started");
        Ok(())
    }

    /// Finish `stage` with `outputs`.
    ///
    /// Missing expected outputs or a failed acceptance check is a
    /// `ContractViolation`, and the stage stays `in_progress`.
    pub fn complete(&mut self, stage: ExecutionStage, outputs: StageOutputs) -> DomainResult<()> {
        let current = self.doc.status(stage);
        if current != StageStatus::InProgress {
            return Err(invalid(
                stage,
                current,
                StageStatus::Completed,
                "only an in-progress stage can complete",
            ));
        }

        let contract = self.registry.get(stage);
        let missing = contract.missing_outputs(&outputs);
        if !missing.is_empty() {
            return Err(DomainError::ContractViolation {
                stage,
                reason: format!("missing expected outputs: {}", missing.join(", ")),
                missing,
            });
        }
        if let Err(reason) = contract.check_acceptance(&outputs) {
            return Err(DomainError::ContractViolation {
                stage,
                missing: Vec::new(),
                reason: format!("acceptance check failed: {reason}"),
            });
        }

        let mut next = self.doc.clone();
        let state = state_mut(&mut next, stage);
        state.status = StageStatus::Completed;
        state.completed_at = Some(Utc::now());
        state.outputs = outputs;
        record(&mut next, stage, StageStatus::Completed, None, None);

        self.commit(next)?;
        info!(stage = %stage, "stage completed");
        Ok(())
    }

    /// Mark the in-progress `stage` failed. Failing an already-failed stage
    /// appends errors.
    pub fn fail(&mut self, stage: ExecutionStage, errors: Vec<String>) -> DomainResult<()> {
        let current = self.doc.status(stage);
        if !matches!(current, StageStatus::InProgress | StageStatus::Failed) {
            return Err(invalid(
                stage,
                current,
                StageStatus::Failed,
                "only an in-progress stage can fail",
            ));
        }

        let mut next = self.doc.clone();
        let state = state_mut(&mut next, stage);
        state.status = StageStatus::Failed;
        state.completed_at = Some(Utc::now());
        state.errors.extend(errors.iter().cloned());
        record(&mut next, stage, StageStatus::Failed, Some(errors.clone()), None);

        self.commit(next)?;
        warn!(stage = %stage, errors = ?errors, "stage failed");
        Ok(())
    }

    /// Skip a pending, skippable stage.
    pub fn skip(&mut self, stage: ExecutionStage, reason: impl Into<String>) -> DomainResult<()> {
        if !self.registry.is_skippable(stage) {
            return Err(DomainError::StageNotSkippable(stage));
        }
        let current = self.doc.status(stage);
        if current != StageStatus::Pending {
            return Err(invalid(
                stage,
                current,
                StageStatus::Skipped,
                "only a pending stage can be skipped",
            ));
        }

        let reason = reason.into();
        let mut next = self.doc.clone();
        let state = state_mut(&mut next, stage);
        state.status = StageStatus::Skipped;
        state.completed_at = Some(Utc::now());
        state.skip_reason = Some(reason.clone());
        record(&mut next, stage, StageStatus::Skipped, None, Some(reason));

        self.commit(next)?;
        info!(stage = %stage, "stage skipped");
        Ok(())
    }

    /// Where a resumed run should pick up: the first failed stage, else the
    /// in-progress stage, else the first pending one.
    pub fn resume_point(&self) -> Option<ExecutionStage> {
        [StageStatus::Failed, StageStatus::InProgress, StageStatus::Pending]
            .into_iter()
            .find_map(|status| self.doc.stages_with(status).first().copied())
    }

    /// Rewind `stage` and every later stage to `pending`, discarding their
    /// outputs and errors.
    pub fn resume_from(&mut self, stage: ExecutionStage) -> DomainResult<()> {
        let mut next = self.doc.clone();
        for &later in stage.this_and_after() {
            if next.status(later) == StageStatus::Pending {
                continue;
            }
            next.stages.insert(later, StageState::pending(later));
            record(
                &mut next,
                later,
                StageStatus::Pending,
                None,
                Some(format!("rewound by resume from {stage}")),
            );
        }
        next.current_stage = latest_active(&next);

        self.commit(next)?;
        info!(stage = %stage, "stages rewound");
        Ok(())
    }

    /// Rewind the whole run to its first stage.
    pub fn reset(&mut self) -> DomainResult<()> {
        self.resume_from(ExecutionStage::Intake)
    }

    fn commit(&mut self, mut next: StageStateDocument) -> DomainResult<()> {
        next.updated_at = Utc::now();
        if let Some(store) = &self.store {
            store.save_stage_state(&next)?;
        }
        self.doc = next;
        Ok(())
    }
}
