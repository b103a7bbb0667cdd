//! Concurrent strategy: one tokio task per item, bounded by a semaphore.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::pipeline::{ItemPipeline, ProgressTracker, Verdict};
use super::{BatchExecutor, ExecutionEvent};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    BatchResult, ErrorType, ExecutionBatch, ExecutionOutcome, ExecutorConfig, ExecutorStrategy,
    FailureDetails, ItemResult, WorkItem,
};
use crate::domain::ports::StoryRunner;
use crate::infrastructure::state::StateStore;

/// How an item task ended.
enum TaskEnd {
    Finished(ItemResult),
    /// Stopped by the batch timeout before reaching a verdict.
    Cancelled(Interrupted),
}

/// An item task stopped by cancellation.
struct Interrupted {
    item_id: String,
    agent: String,
    attempts: u32,
    /// The failure of the last attempt is already in the retry state, so the
    /// task was waiting out its backoff.
    recorded: bool,
}

pub struct ConcurrentExecutor {
    runner: Arc<dyn StoryRunner>,
    pipeline: ItemPipeline,
    store: Option<StateStore>,
    max_concurrency: usize,
    batch_timeout: Duration,
}

impl std::fmt::Debug for ConcurrentExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentExecutor")
            .field("runner", &self.runner.name())
            .field("max_concurrency", &self.max_concurrency)
            .field("batch_timeout", &self.batch_timeout)
            .finish_non_exhaustive()
    }
}

impl ConcurrentExecutor {
    pub fn new(runner: Arc<dyn StoryRunner>, pipeline: ItemPipeline, config: &ExecutorConfig) -> Self {
        Self {
            runner,
            pipeline,
            store: None,
            max_concurrency: config.max_concurrency.max(1),
            batch_timeout: config.batch_timeout(),
        }
    }

    /// Persist batch progress into the iteration state.
    #[must_use]
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    #[must_use]
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    /// Record items that never produced a result as failed.
    async fn fail_unfinished(
        &self,
        batch: &ExecutionBatch,
        results: &mut Vec<ItemResult>,
        cancelled: Vec<Interrupted>,
        tracker: &ProgressTracker,
        timed_out: bool,
    ) -> DomainResult<()> {
        let finished: HashSet<String> = results.iter().map(|r| r.item_id.clone()).collect();
        for item in &batch.items {
            if finished.contains(&item.id) {
                continue;
            }
            let (agent, attempts, recorded) = cancelled
                .iter()
                .find(|task| task.item_id == item.id)
                .map_or_else(
                    || (self.pipeline.retries().get_retry_agent(&item.id), 0, false),
                    |task| (task.agent.clone(), task.attempts, task.recorded),
                );
            let (error_type, message) = if timed_out {
                (
                    ErrorType::Timeout,
                    format!("batch timed out after {}s", self.batch_timeout.as_secs()),
                )
            } else {
                (ErrorType::ProcessCrash, "execution task aborted".to_string())
            };

            let fixes = if recorded {
                self.pipeline
                    .retries()
                    .state(&item.id)
                    .and_then(|state| state.last_failure().map(|f| f.suggested_fixes.clone()))
                    .unwrap_or_default()
            } else if attempts > 0 {
                self.pipeline
                    .record_failure(&item.id, &agent, FailureDetails::new(error_type, message.clone()))
                    .await?
                    .suggested_fixes
            } else {
                Vec::new()
            };
            tracker.update(|p| p.mark_failed(&item.id, &message)).await;
            self.pipeline
                .emit(ExecutionEvent::ItemFailed {
                    item_id: item.id.clone(),
                    error: message.clone(),
                    error_type,
                })
                .await;
            warn!(item_id = %item.id, error_type = %error_type, "{message}");
            results.push(ItemResult::failure(
                item.id.clone(),
                agent,
                attempts,
                error_type,
                message,
                fixes,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BatchExecutor for ConcurrentExecutor {
    fn strategy(&self) -> ExecutorStrategy {
        ExecutorStrategy::Concurrent
    }

    async fn execute(&self, batch: &ExecutionBatch) -> DomainResult<BatchResult> {
        let started = Instant::now();
        let order = batch.ids();
        let tracker = Arc::new(ProgressTracker::new(
            batch.index,
            order.clone(),
            self.store.clone(),
        ));
        tracker.publish().await;
        info!(
            batch = batch.index,
            items = batch.len(),
            max_concurrency = self.max_concurrency,
            forced = batch.forced,
            "executing batch"
        );
        self.pipeline
            .emit(ExecutionEvent::BatchStarted {
                batch_index: batch.index,
                item_count: batch.len(),
            })
            .await;

        let cancel = CancellationToken::new();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();

        for item in batch.items.iter().cloned() {
            let task = ItemTask {
                runner: Arc::clone(&self.runner),
                pipeline: self.pipeline.clone(),
                tracker: Arc::clone(&tracker),
                cancel: cancel.clone(),
            };
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = tokio::select! {
                    () = task.cancel.cancelled() => {
                        let agent = task.pipeline.retries().get_retry_agent(&item.id);
                        let end = TaskEnd::Cancelled(Interrupted {
                            item_id: item.id.clone(),
                            agent,
                            attempts: 0,
                            recorded: false,
                        });
                        return (item.id, Ok(end));
                    }
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            return (
                                item.id,
                                Err(DomainError::ExecutionFailed("semaphore closed".to_string())),
                            );
                        }
                    },
                };
                let end = task.run(&item).await;
                (item.id, end)
            });
        }

        let deadline = tokio::time::sleep(self.batch_timeout);
        tokio::pin!(deadline);

        let mut results = Vec::with_capacity(batch.len());
        let mut cancelled = Vec::new();
        let mut first_error: Option<DomainError> = None;
        let mut timed_out = false;

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((_, Ok(TaskEnd::Finished(result))))) => results.push(result),
                    Some(Ok((_, Ok(TaskEnd::Cancelled(task))))) => cancelled.push(task),
                    Some(Ok((id, Err(err)))) => {
                        error!(item_id = %id, error = %err, "item task failed");
                        first_error.get_or_insert(err);
                    }
                    Some(Err(err)) => error!(error = %err, "item task panicked"),
                },
                () = &mut deadline, if !timed_out => {
                    timed_out = true;
                    warn!(
                        batch = batch.index,
                        timeout_secs = self.batch_timeout.as_secs(),
                        "batch timeout elapsed, cancelling running items"
                    );
                    cancel.cancel();
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        self.fail_unfinished(batch, &mut results, cancelled, &tracker, timed_out)
            .await?;

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
            duration_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
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

/// Everything one item task needs, cloned per task.
struct ItemTask {
    runner: Arc<dyn StoryRunner>,
    pipeline: ItemPipeline,
    tracker: Arc<ProgressTracker>,
    cancel: CancellationToken,
}

impl ItemTask {
    fn interrupted(&self, id: &str, agent: String, attempts: u32, recorded: bool) -> TaskEnd {
        debug!(item_id = id, attempts, recorded, "item task cancelled");
        TaskEnd::Cancelled(Interrupted {
            item_id: id.to_string(),
            agent,
            attempts,
            recorded,
        })
    }

    async fn run(&self, item: &WorkItem) -> DomainResult<TaskEnd> {
        let id = item.id.as_str();
        let retries = Arc::clone(self.pipeline.retries());

        if !retries.can_retry(id) {
            return Ok(TaskEnd::Finished(
                self.pipeline.exhausted_result(item, &self.tracker).await,
            ));
        }

        let mut attempts = 0;
        let mut retried = false;
        loop {
            let request = self.pipeline.prepare(item);
            let agent = request.agent.clone();
            let attempt = request.attempt;
            attempts += 1;

            self.tracker.update(|p| p.mark_running(id, &agent)).await;
            self.pipeline
                .emit(ExecutionEvent::ItemStarted {
                    item_id: id.to_string(),
                    agent: agent.clone(),
                    attempt,
                })
                .await;
            debug!(item_id = id, agent = %agent, attempt, "executing item");

            let outcome = tokio::select! {
                () = self.cancel.cancelled() => return Ok(self.interrupted(id, agent, attempts, false)),
                result = self.runner.run(request) => result.unwrap_or_else(|err| {
                    warn!(item_id = id, error = %err, "runner error");
                    ExecutionOutcome::crashed(err.to_string())
                }),
            };
            let verdict = tokio::select! {
                () = self.cancel.cancelled() => return Ok(self.interrupted(id, agent, attempts, false)),
                verdict = self.pipeline.judge(item, &outcome) => verdict,
            };

            let details = match verdict {
                Verdict::Passed => {
                    self.pipeline.record_success(id).await?;
                    self.tracker.update(|p| p.mark_completed(id)).await;
                    self.pipeline
                        .emit(ExecutionEvent::ItemCompleted {
                            item_id: id.to_string(),
                            attempts,
                        })
                        .await;
                    info!(item_id = id, agent = %agent, attempts, "item completed");
                    return Ok(TaskEnd::Finished(ItemResult::success(id, agent, attempts)));
                }
                Verdict::Failed(details) => details,
            };

            let record = self.pipeline.record_failure(id, &agent, details).await?;
            if !retried && retries.can_retry(id) {
                retried = true;
                let delay = retries.get_retry_delay(id);
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                self.tracker.update(|p| p.mark_retrying(id, &record.error_message)).await;
                self.pipeline
                    .emit(ExecutionEvent::ItemRetrying {
                        item_id: id.to_string(),
                        attempt: record.attempt,
                        delay_ms,
                        error: record.error_message.clone(),
                    })
                    .await;
                warn!(
                    item_id = id,
                    attempt = record.attempt,
                    error_type = %record.error_type,
                    delay_ms,
                    "item failed, retrying"
                );
                tokio::select! {
                    () = self.cancel.cancelled() => return Ok(self.interrupted(id, agent, attempts, true)),
                    () = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            self.tracker.update(|p| p.mark_failed(id, &record.error_message)).await;
            self.pipeline
                .emit(ExecutionEvent::ItemFailed {
                    item_id: id.to_string(),
                    error: record.error_message.clone(),
                    error_type: record.error_type,
                })
                .await;
            warn!(
                item_id = id,
                attempts,
                error_type = %record.error_type,
                error = %record.error_message,
                "item failed"
            );
            return Ok(TaskEnd::Finished(ItemResult::failure(
                id,
                agent,
                attempts,
                record.error_type,
                record.error_message,
                record.suggested_fixes,
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ExecutionRequest, RetryConfig};
    use crate::services::retry_manager::RetryManager;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Fails items listed in `fail` on every attempt, succeeds otherwise.
    struct FlakyRunner {
        fail: HashMap<String, u32>,
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl StoryRunner for FlakyRunner {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn run(&self, request: ExecutionRequest) -> DomainResult<ExecutionOutcome> {
            let mut calls = self.calls.lock().unwrap();
            calls.push((request.item_id.clone(), request.agent.clone()));
            let seen = calls.iter().filter(|(id, _)| *id == request.item_id).count();
            let failures = self.fail.get(&request.item_id).copied().unwrap_or(0);
            if u32::try_from(seen).unwrap() <= failures {
                Ok(ExecutionOutcome::failed(1, "SyntaxError: unexpected token"))
            } else {
                Ok(ExecutionOutcome::succeeded("done"))
            }
        }

        async fn launch_batch(&self, _requests: Vec<ExecutionRequest>) -> DomainResult<()> {
            Ok(())
        }
    }

    fn retry_config() -> RetryConfig {
        RetryConfig {
            base_delay_ms: 1,
            max_delay_ms: 5,
            agent_chain: vec!["codex".to_string()],
            ..RetryConfig::default()
        }
    }

    fn executor(fail: &[(&str, u32)]) -> (ConcurrentExecutor, Arc<FlakyRunner>) {
        let runner = Arc::new(FlakyRunner {
            fail: fail.iter().map(|(id, n)| ((*id).to_string(), *n)).collect(),
            calls: Mutex::new(Vec::new()),
        });
        let retries = Arc::new(RetryManager::new(retry_config(), "claude"));
        let executor = ConcurrentExecutor::new(
            runner.clone(),
            ItemPipeline::new(retries),
            &ExecutorConfig::default(),
        )
        .with_max_concurrency(2);
        (executor, runner)
    }

    fn batch(ids: &[&str]) -> ExecutionBatch {
        ExecutionBatch::new(0, ids.iter().map(|id| WorkItem::new(*id, *id)).collect())
    }

    #[tokio::test]
    async fn test_retry_once_with_rotated_agent() {
        let (executor, runner) = executor(&[("b", 1)]);
        let result = executor.execute(&batch(&["a", "b"])).await.unwrap();

        assert!(result.success);
        assert_eq!(result.completed, vec!["a", "b"]);
        assert_eq!(result.retried, vec!["b"]);
        let b = result.result_for("b").unwrap();
        assert_eq!(b.attempts, 2);
        assert_eq!(b.agent, "codex");

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|(id, _)| id == "b").count(), 2);
    }

    #[tokio::test]
    async fn test_second_failure_is_final_within_batch() {
        let (executor, _) = executor(&[("a", 5)]);
        let result = executor.execute(&batch(&["a", "b"])).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.failed, vec!["a"]);
        assert_eq!(result.completed, vec!["b"]);
        let a = result.result_for("a").unwrap();
        assert_eq!(a.attempts, 2);
        assert_eq!(a.error_type, Some(ErrorType::ExitCode));
        assert!(a.suggested_fixes[0].starts_with("Fix the syntax error"));
    }

    #[tokio::test]
    async fn test_timeout_during_backoff_records_one_failure() {
        let runner = Arc::new(FlakyRunner {
            fail: HashMap::from([("a".to_string(), 5)]),
            calls: Mutex::new(Vec::new()),
        });
        let config = RetryConfig {
            base_delay_ms: 5_000,
            max_delay_ms: 5_000,
            ..retry_config()
        };
        let retries = Arc::new(RetryManager::new(config, "claude"));
        let executor = ConcurrentExecutor::new(
            runner.clone(),
            ItemPipeline::new(Arc::clone(&retries)),
            &ExecutorConfig::default(),
        )
        .with_batch_timeout(Duration::from_millis(100));

        let result = executor.execute(&batch(&["a"])).await.unwrap();

        assert_eq!(runner.calls.lock().unwrap().len(), 1);
        let a = result.result_for("a").unwrap();
        assert_eq!(a.attempts, 1);
        assert_eq!(a.error_type, Some(ErrorType::Timeout));
        assert!(!a.suggested_fixes.is_empty());

        let state = retries.state("a").unwrap();
        assert_eq!(state.current_attempt, 1);
        let types: Vec<ErrorType> = state.failures.iter().map(|f| f.error_type).collect();
        assert_eq!(types, vec![ErrorType::ExitCode]);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let (executor, _) = executor(&[]);
        let result = executor.execute(&batch(&[])).await.unwrap();
        assert!(result.success);
        assert!(result.item_results.is_empty());
    }
}
