//! Per-item steps shared by both executor strategies: request preparation,
//! gate and DoD judgement, retry bookkeeping, progress snapshots and events.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::ExecutionEvent;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    base_prompt, failed_gates, BatchProgress, DodRequest, ErrorType, ExecutionOutcome,
    ExecutionRequest, FailureDetails, FailureRecord, GateResults, ItemResult, QualityGateResult,
    WorkItem,
};
use crate::domain::ports::{DodGate, QualityGate};
use crate::infrastructure::state::{blocking, StateStore};
use crate::services::failure_classifier::classify_outcome;
use crate::services::retry_manager::RetryManager;

/// Whether an attempt counts as done.
#[derive(Debug, Clone)]
pub enum Verdict {
    Passed,
    Failed(FailureDetails),
}

#[derive(Clone)]
pub struct ItemPipeline {
    retries: Arc<RetryManager>,
    quality_gate: Option<Arc<dyn QualityGate>>,
    dod_gate: Option<Arc<dyn DodGate>>,
    events: Option<mpsc::Sender<ExecutionEvent>>,
}

impl std::fmt::Debug for ItemPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemPipeline")
            .field("quality_gate", &self.quality_gate.is_some())
            .field("dod_gate", &self.dod_gate.is_some())
            .field("events", &self.events.is_some())
            .finish_non_exhaustive()
    }
}

impl ItemPipeline {
    pub fn new(retries: Arc<RetryManager>) -> Self {
        Self {
            retries,
            quality_gate: None,
            dod_gate: None,
            events: None,
        }
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

    pub fn retries(&self) -> &Arc<RetryManager> {
        &self.retries
    }

    /// Request for the next attempt: rotated agent and failure context when
    /// the item has failed before.
    pub fn prepare(&self, item: &WorkItem) -> ExecutionRequest {
        let agent = self.retries.get_retry_agent(&item.id);
        let prompt = self.retries.build_retry_prompt(&item.id, &base_prompt(item));
        ExecutionRequest::new(item, agent, prompt).with_attempt(self.retries.attempts(&item.id) + 1)
    }

    /// Judge an attempt: execution result, then quality gates, then DoD.
    pub async fn judge(&self, item: &WorkItem, outcome: &ExecutionOutcome) -> Verdict {
        if !outcome.success {
            let message = outcome.error.clone().unwrap_or_else(|| match outcome.exit_code {
                Some(code) => format!("agent exited with status {code}"),
                None => "agent reported failure".to_string(),
            });
            return Verdict::Failed(
                FailureDetails::new(classify_outcome(outcome), message)
                    .with_output(outcome.output.clone())
                    .with_exit_code(outcome.exit_code),
            );
        }

        let gate_results = match &self.quality_gate {
            Some(gate) => match gate.check(item, &outcome.changed_files).await {
                Ok(results) => results,
                Err(err) => {
                    let mut results = GateResults::new();
                    results.insert("quality_gate".to_string(), QualityGateResult::fail(err.to_string()));
                    results
                }
            },
            None => GateResults::new(),
        };

        let failed = failed_gates(&gate_results);
        if !failed.is_empty() {
            let message = format!("quality gate failed: {}", failed.join(", "));
            debug!(item_id = %item.id, gates = ?failed, "quality gate rejected item");
            return Verdict::Failed(
                FailureDetails::new(ErrorType::QualityGate, message)
                    .with_output(outcome.output.clone())
                    .with_exit_code(outcome.exit_code)
                    .with_gate_results(gate_results),
            );
        }

        if let Some(dod) = &self.dod_gate {
            let request = DodRequest {
                item_id: item.id.clone(),
                gate_results: gate_results.clone(),
                ai_verification: outcome.ai_verification.clone(),
                changed_files: outcome.changed_files.clone(),
            };
            let message = match dod.check(request).await {
                Ok(result) if result.passed => None,
                Ok(result) => Some(format!(
                    "definition of done not met: {}",
                    result.errors.join("; ")
                )),
                Err(err) => Some(format!("definition of done check errored: {err}")),
            };
            if let Some(message) = message {
                debug!(item_id = %item.id, "DoD gate rejected item");
                return Verdict::Failed(
                    FailureDetails::new(ErrorType::QualityGate, message)
                        .with_output(outcome.output.clone())
                        .with_gate_results(gate_results),
                );
            }
        }

        Verdict::Passed
    }

    /// Record a failure, tolerating an item that is already out of retries.
    pub async fn record_failure(
        &self,
        item_id: &str,
        agent: &str,
        details: FailureDetails,
    ) -> DomainResult<FailureRecord> {
        let retries = Arc::clone(&self.retries);
        let (id, owner, recorded) = (item_id.to_string(), agent.to_string(), details.clone());
        match blocking(move || retries.record_failure(&id, &owner, recorded)).await {
            Err(DomainError::RetryExhausted { attempts, .. }) => Ok(FailureRecord {
                attempt: attempts,
                agent: agent.to_string(),
                error_type: details.kind(),
                error_message: details.message,
                timestamp: chrono::Utc::now(),
                quality_gate_results: details.gate_results,
                exit_code: details.exit_code,
                output_excerpt: None,
                suggested_fixes: Vec::new(),
            }),
            other => other,
        }
    }

    /// Clear retry state for an item that passed.
    pub async fn record_success(&self, item_id: &str) -> DomainResult<()> {
        let retries = Arc::clone(&self.retries);
        let id = item_id.to_string();
        blocking(move || retries.record_success(&id)).await
    }

    /// Result for an item that has no attempts left before the batch starts.
    pub async fn exhausted_result(&self, item: &WorkItem, tracker: &ProgressTracker) -> ItemResult {
        let state = self.retries.state(&item.id).unwrap_or_default();
        let last = state.last_failure();
        let error_type = last.map_or(ErrorType::Unknown, |f| f.error_type);
        let fixes = last.map(|f| f.suggested_fixes.clone()).unwrap_or_default();
        let error = format!("retries exhausted after {} attempts", state.current_attempt);
        let agent = state
            .last_agent
            .clone()
            .unwrap_or_else(|| self.retries.default_agent().to_string());

        tracker.update(|p| p.mark_failed(&item.id, &error)).await;
        self.emit(ExecutionEvent::ItemFailed {
            item_id: item.id.clone(),
            error: error.clone(),
            error_type,
        })
        .await;
        warn!(item_id = %item.id, "{error}");
        ItemResult::failure(item.id.clone(), agent, 0, error_type, error, fixes)
    }

    pub async fn emit(&self, event: ExecutionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event).await;
        }
    }
}

/// `BatchProgress` behind the executor's single mutex, snapshotted into the
/// iteration state after every change.
///
/// The mutex is never held across the write. Writes are serialized by
/// `written`, and each one persists the newest snapshot, so a slow writer
/// cannot overwrite a later state with an older one.
#[derive(Debug)]
pub struct ProgressTracker {
    current: Mutex<Versioned>,
    written: tokio::sync::Mutex<Option<u64>>,
    store: Option<StateStore>,
}

#[derive(Debug)]
struct Versioned {
    version: u64,
    progress: BatchProgress,
}

impl ProgressTracker {
    pub fn new(batch_index: usize, ids: Vec<String>, store: Option<StateStore>) -> Self {
        Self {
            current: Mutex::new(Versioned {
                version: 0,
                progress: BatchProgress::new(batch_index, ids),
            }),
            written: tokio::sync::Mutex::new(None),
            store,
        }
    }

    /// Persist the initial snapshot.
    pub async fn publish(&self) {
        self.persist().await;
    }

    /// Mutate progress and persist a snapshot. Persistence is best-effort.
    pub async fn update<F: FnOnce(&mut BatchProgress)>(&self, f: F) -> BatchProgress {
        let snapshot = {
            let mut current = self.current();
            f(&mut current.progress);
            current.version += 1;
            current.progress.clone()
        };
        self.persist().await;
        snapshot
    }

    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let mut written = self.written.lock().await;
        let (version, snapshot) = {
            let current = self.current();
            (current.version, current.progress.clone())
        };
        if (*written).is_some_and(|done| done >= version) {
            return;
        }

        let batch = snapshot.batch_index;
        let store = store.clone();
        let result = blocking(move || {
            store
                .update_iteration_state(move |state| state.parallel_execution = Some(snapshot))
                .map(|_| ())
        })
        .await;
        match result {
            Ok(()) => *written = Some(version),
            Err(err) => warn!(error = %err, batch, "failed to persist batch progress"),
        }
    }

    fn current(&self) -> std::sync::MutexGuard<'_, Versioned> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> BatchProgress {
        self.current().progress.clone()
    }

    /// Ids that went through at least one in-batch retry.
    pub fn retried(&self) -> Vec<String> {
        self.snapshot()
            .story_progress
            .into_iter()
            .filter(|(_, p)| p.retry_count > 0)
            .map(|(id, _)| id)
            .collect()
    }
}
