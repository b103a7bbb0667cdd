//! Polling strategy: launch the whole batch in one call, then watch the plan
//! document for item status.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::pipeline::{ItemPipeline, ProgressTracker, Verdict};
use super::{BatchExecutor, ExecutionEvent};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    BatchResult, ErrorType, ExecutionBatch, ExecutionOutcome, ExecutorConfig, ExecutorStrategy,
    FailureDetails, ItemResult, ItemStatus, PlanKind, WorkItem,
};
use crate::domain::ports::StoryRunner;
use crate::infrastructure::state::{blocking, StateStore};

/// An item launched by this batch that has not reached a verdict yet.
#[derive(Debug)]
struct Tracked {
    item: WorkItem,
    agent: String,
    attempts: u32,
    retried: bool,
    retry_at: Option<Instant>,
    launch_error: Option<String>,
}

impl Tracked {
    fn new(item: WorkItem) -> Self {
        Self {
            item,
            agent: String::new(),
            attempts: 0,
            retried: false,
            retry_at: None,
            launch_error: None,
        }
    }
}

pub struct PollingExecutor {
    runner: Arc<dyn StoryRunner>,
    pipeline: ItemPipeline,
    store: StateStore,
    plan_kind: PlanKind,
    poll_interval: Duration,
    batch_timeout: Duration,
}

impl std::fmt::Debug for PollingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingExecutor")
            .field("runner", &self.runner.name())
            .field("plan_kind", &self.plan_kind)
            .field("poll_interval", &self.poll_interval)
            .field("batch_timeout", &self.batch_timeout)
            .finish_non_exhaustive()
    }
}

impl PollingExecutor {
    pub fn new(
        runner: Arc<dyn StoryRunner>,
        pipeline: ItemPipeline,
        store: StateStore,
        plan_kind: PlanKind,
        config: &ExecutorConfig,
    ) -> Self {
        Self {
            runner,
            pipeline,
            store,
            plan_kind,
            poll_interval: config.poll_interval(),
            batch_timeout: config.batch_timeout(),
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    /// Mark the selected items in progress and hand them to the runner in
    /// one call. A launch error is recorded on each item as a crash.
    async fn launch(
        &self,
        tracked: &mut [Tracked],
        selected: &HashSet<String>,
        tracker: &ProgressTracker,
    ) -> DomainResult<()> {
        let mut requests = Vec::new();
        for t in tracked.iter_mut().filter(|t| selected.contains(&t.item.id)) {
            let request = self.pipeline.prepare(&t.item);
            t.agent = request.agent.clone();
            t.attempts += 1;
            t.retry_at = None;
            tracker.update(|p| p.mark_running(&t.item.id, &t.agent)).await;
            self.pipeline
                .emit(ExecutionEvent::ItemStarted {
                    item_id: t.item.id.clone(),
                    agent: t.agent.clone(),
                    attempt: request.attempt,
                })
                .await;
            requests.push(request);
        }
        if requests.is_empty() {
            return Ok(());
        }

        let (store, kind) = (self.store.clone(), self.plan_kind);
        let ids: Vec<String> = selected.iter().cloned().collect();
        blocking(move || {
            store.update_plan(kind, |plan| {
                for id in &ids {
                    plan.set_status(id, ItemStatus::InProgress)?;
                }
                Ok(())
            })
        })
        .await?;

        debug!(items = requests.len(), runner = self.runner.name(), "launching items");
        if let Err(err) = self.runner.launch_batch(requests).await {
            warn!(error = %err, "launch failed");
            for t in tracked.iter_mut().filter(|t| selected.contains(&t.item.id)) {
                t.launch_error = Some(format!("launch failed: {err}"));
            }
        }
        Ok(())
    }

    /// Outcome for an item the plan reports as terminal, or `None` while it
    /// is still running.
    async fn observe(&self, t: &mut Tracked, status: Option<ItemStatus>) -> Option<ExecutionOutcome> {
        if let Some(error) = t.launch_error.take() {
            return Some(ExecutionOutcome::crashed(error));
        }
        match status {
            Some(ItemStatus::Complete) => Some(
                self.runner
                    .outcome(&t.item.id)
                    .await
                    .unwrap_or_else(|| ExecutionOutcome::succeeded("")),
            ),
            Some(ItemStatus::Failed) => Some(
                self.runner
                    .outcome(&t.item.id)
                    .await
                    .unwrap_or_else(|| ExecutionOutcome::failed(1, "item reported failed")),
            ),
            Some(ItemStatus::Pending | ItemStatus::InProgress) => None,
            None => Some(ExecutionOutcome::crashed("item disappeared from the plan")),
        }
    }

    /// Apply gates and retry policy to an observed outcome. Returns the final
    /// result, or `None` when a retry was scheduled.
    async fn settle(
        &self,
        t: &mut Tracked,
        outcome: &ExecutionOutcome,
        tracker: &ProgressTracker,
    ) -> DomainResult<Option<ItemResult>> {
        let id = t.item.id.clone();
        let retries = self.pipeline.retries();
        let details = match self.pipeline.judge(&t.item, outcome).await {
            Verdict::Passed => {
                self.pipeline.record_success(&id).await?;
                tracker.update(|p| p.mark_completed(&id)).await;
                self.pipeline
                    .emit(ExecutionEvent::ItemCompleted {
                        item_id: id.clone(),
                        attempts: t.attempts,
                    })
                    .await;
                info!(item_id = %id, agent = %t.agent, attempts = t.attempts, "item completed");
                return Ok(Some(ItemResult::success(id, t.agent.clone(), t.attempts)));
            }
            Verdict::Failed(details) => details,
        };

        let record = self.pipeline.record_failure(&id, &t.agent, details).await?;
        if !t.retried && retries.can_retry(&id) {
            let delay = retries.get_retry_delay(&id);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            t.retried = true;
            t.retry_at = Some(Instant::now() + delay);
            tracker.update(|p| p.mark_retrying(&id, &record.error_message)).await;
            self.pipeline
                .emit(ExecutionEvent::ItemRetrying {
                    item_id: id.clone(),
                    attempt: record.attempt,
                    delay_ms,
                    error: record.error_message.clone(),
                })
                .await;
            warn!(
                item_id = %id,
                attempt = record.attempt,
                error_type = %record.error_type,
                delay_ms,
                "item failed, retrying"
            );
            return Ok(None);
        }

        tracker.update(|p| p.mark_failed(&id, &record.error_message)).await;
        self.pipeline
            .emit(ExecutionEvent::ItemFailed {
                item_id: id.clone(),
                error: record.error_message.clone(),
                error_type: record.error_type,
            })
            .await;
        warn!(
            item_id = %id,
            attempts = t.attempts,
            error_type = %record.error_type,
            error = %record.error_message,
            "item failed"
        );
        Ok(Some(ItemResult::failure(
            id,
            t.agent.clone(),
            t.attempts,
            record.error_type,
            record.error_message,
            record.suggested_fixes,
        )))
    }

    /// Items still outstanding at the deadline fail with a timeout.
    async fn fail_timed_out(
        &self,
        pending: Vec<Tracked>,
        results: &mut Vec<ItemResult>,
        tracker: &ProgressTracker,
    ) -> DomainResult<()> {
        let message = format!("batch timed out after {}s", self.batch_timeout.as_secs());
        for t in pending {
            let fixes = self
                .pipeline
                .record_failure(
                    &t.item.id,
                    &t.agent,
                    FailureDetails::new(ErrorType::Timeout, message.clone()),
                )
                .await?
                .suggested_fixes;
            tracker.update(|p| p.mark_failed(&t.item.id, &message)).await;
            self.pipeline
                .emit(ExecutionEvent::ItemFailed {
                    item_id: t.item.id.clone(),
                    error: message.clone(),
                    error_type: ErrorType::Timeout,
                })
                .await;
            warn!(item_id = %t.item.id, "{message}");
            results.push(ItemResult::failure(
                t.item.id,
                t.agent,
                t.attempts,
                ErrorType::Timeout,
                message.clone(),
                fixes,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BatchExecutor for PollingExecutor {
    fn strategy(&self) -> ExecutorStrategy {
        ExecutorStrategy::Polling
    }

    async fn execute(&self, batch: &ExecutionBatch) -> DomainResult<BatchResult> {
        let started = Instant::now();
        let deadline = started + self.batch_timeout;
        let order = batch.ids();
        let tracker = ProgressTracker::new(batch.index, order.clone(), Some(self.store.clone()));
        tracker.publish().await;
        info!(
            batch = batch.index,
            items = batch.len(),
            poll_interval_ms = u64::try_from(self.poll_interval.as_millis()).unwrap_or(u64::MAX),
            forced = batch.forced,
            "executing batch"
        );
        self.pipeline
            .emit(ExecutionEvent::BatchStarted {
                batch_index: batch.index,
                item_count: batch.len(),
            })
            .await;

        let mut results = Vec::with_capacity(batch.len());
        let mut pending = Vec::with_capacity(batch.len());
        for item in &batch.items {
            if self.pipeline.retries().can_retry(&item.id) {
                pending.push(Tracked::new(item.clone()));
            } else {
                results.push(self.pipeline.exhausted_result(item, &tracker).await);
            }
        }

        let initial: HashSet<String> = pending.iter().map(|t| t.item.id.clone()).collect();
        self.launch(&mut pending, &initial, &tracker).await?;

        while !pending.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let due: HashSet<String> = pending
                .iter()
                .filter(|t| t.retry_at.is_some_and(|at| at <= now))
                .map(|t| t.item.id.clone())
                .collect();
            if !due.is_empty() {
                self.launch(&mut pending, &due, &tracker).await?;
            }

            let (store, kind) = (self.store.clone(), self.plan_kind);
            let plan = blocking(move || store.load_plan(kind))
                .await?
                .ok_or_else(|| DomainError::NotFound(self.store.path(self.plan_kind.file_name())))?;

            let mut settled = HashSet::new();
            for t in pending.iter_mut().filter(|t| t.retry_at.is_none()) {
                let status = plan.get(&t.item.id).map(|item| item.status);
                let Some(outcome) = self.observe(t, status).await else {
                    continue;
                };
                if let Some(result) = self.settle(t, &outcome, &tracker).await? {
                    settled.insert(result.item_id.clone());
                    results.push(result);
                }
            }
            pending.retain(|t| !settled.contains(&t.item.id));
            if pending.is_empty() {
                break;
            }

            let now = Instant::now();
            let wake = pending
                .iter()
                .filter_map(|t| t.retry_at)
                .fold((now + self.poll_interval).min(deadline), Instant::min);
            tokio::time::sleep_until(wake.max(now).into()).await;
        }

        if !pending.is_empty() {
            warn!(
                batch = batch.index,
                outstanding = pending.len(),
                timeout_secs = self.batch_timeout.as_secs(),
                "batch timeout elapsed"
            );
            self.fail_timed_out(pending, &mut results, &tracker).await?;
        }

        let result = BatchResult::from_items(
            batch.index,
            &order,
            results,
            tracker.retried(),
            started.elapsed(),
        );
        info!(
            batch = batch.index,
            completed = result.completed.len(),
            failed = result.failed.len(),
            retried = result.retried.len(),
            "batch finished"
        );
        self.pipeline
            .emit(ExecutionEvent::BatchCompleted {
                batch_index: batch.index,
                completed: result.completed.len(),
                failed: result.failed.len(),
                duration_secs: result.duration.as_secs_f64(),
            })
            .await;
        Ok(result)
    }
}
