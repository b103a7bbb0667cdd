//! Integration tests for the batch executors against scripted ports.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use cascade::domain::models::{
    ErrorType, ExecutionBatch, ExecutionOutcome, ExecutorConfig, PlanKind, RetryConfig,
};
use cascade::services::batch_executor::{
    BatchExecutor, ConcurrentExecutor, ExecutionEvent, ItemPipeline, PollingExecutor,
};
use cascade::services::retry_manager::RetryManager;
use tokio::sync::mpsc;

use common::{items, save_plan, temp_store, ScriptedDodGate, ScriptedQualityGate, ScriptedRunner};

fn retries(chain: &[&str]) -> Arc<RetryManager> {
    let config = RetryConfig {
        base_delay_ms: 1,
        max_delay_ms: 5,
        agent_chain: chain.iter().map(|s| (*s).to_string()).collect(),
        ..RetryConfig::default()
    };
    Arc::new(RetryManager::new(config, "claude"))
}

fn batch(ids: &[&str]) -> ExecutionBatch {
    let layout: Vec<(&str, &[&str])> = ids.iter().map(|id| (*id, &[][..])).collect();
    ExecutionBatch::new(0, items(&layout))
}

#[tokio::test]
async fn test_concurrency_is_bounded_by_semaphore() {
    let runner = Arc::new(ScriptedRunner::new().with_delay(Duration::from_millis(100)));
    let executor = ConcurrentExecutor::new(
        runner.clone(),
        ItemPipeline::new(retries(&[])),
        &ExecutorConfig::default(),
    )
    .with_max_concurrency(2);

    let started = Instant::now();
    let result = executor
        .execute(&batch(&["a", "b", "c", "d", "e"]))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(result.success);
    assert_eq!(result.completed.len(), 5);
    assert!(runner.peak() <= 2, "peak concurrency was {}", runner.peak());
    assert!(elapsed >= Duration::from_millis(300), "finished in {elapsed:?}");
}

#[tokio::test]
async fn test_retry_uses_next_agent_and_failure_context() {
    let runner = Arc::new(
        ScriptedRunner::new().script("a", vec![ExecutionOutcome::failed(2, "SyntaxError: unexpected }")]),
    );
    let executor = ConcurrentExecutor::new(
        runner.clone(),
        ItemPipeline::new(retries(&["codex", "aider"])),
        &ExecutorConfig::default(),
    );

    let result = executor.execute(&batch(&["a"])).await.unwrap();

    assert!(result.success);
    assert_eq!(result.retried, vec!["a"]);
    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].agent, "claude");
    assert_eq!(calls[1].agent, "codex");
    assert_eq!(calls[1].attempt, 2);
    assert!(calls[1].prompt.starts_with("## Previous Attempt Failed"));
    assert!(calls[1].prompt.contains("SyntaxError: unexpected }"));
}

#[tokio::test]
async fn test_quality_gate_failure_is_classified() {
    let runner = Arc::new(ScriptedRunner::new());
    let pipeline = ItemPipeline::new(retries(&[])).with_quality_gate(ScriptedQualityGate::failing(&["b"]));
    let executor = ConcurrentExecutor::new(runner.clone(), pipeline, &ExecutorConfig::default());

    let result = executor.execute(&batch(&["a", "b"])).await.unwrap();

    assert_eq!(result.completed, vec!["a"]);
    assert_eq!(result.failed, vec!["b"]);
    let b = result.result_for("b").unwrap();
    assert_eq!(b.error_type, Some(ErrorType::QualityGate));
    assert_eq!(runner.calls_for("b"), 2);
}

#[tokio::test]
async fn test_dod_rejection_fails_item() {
    let runner = Arc::new(ScriptedRunner::new());
    let pipeline = ItemPipeline::new(retries(&[])).with_dod_gate(ScriptedDodGate::rejecting(&["a"]));
    let executor = ConcurrentExecutor::new(runner, pipeline, &ExecutorConfig::default());

    let result = executor.execute(&batch(&["a"])).await.unwrap();

    let a = result.result_for("a").unwrap();
    assert!(!a.success);
    assert!(a
        .error
        .as_deref()
        .unwrap()
        .contains("acceptance criteria not met"));
}

#[tokio::test]
async fn test_batch_timeout_fails_unfinished_items() {
    let runner = Arc::new(ScriptedRunner::new().with_delay(Duration::from_secs(5)));
    let executor = ConcurrentExecutor::new(
        runner,
        ItemPipeline::new(retries(&[])),
        &ExecutorConfig::default(),
    )
    .with_batch_timeout(Duration::from_millis(50));

    let started = Instant::now();
    let result = executor.execute(&batch(&["a", "b"])).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!result.success);
    assert_eq!(result.failed.len(), 2);
    for id in ["a", "b"] {
        assert_eq!(result.result_for(id).unwrap().error_type, Some(ErrorType::Timeout));
    }
}

#[tokio::test]
async fn test_events_bracket_the_batch() {
    let (tx, mut rx) = mpsc::channel(64);
    let runner = Arc::new(ScriptedRunner::new().always_fail("b"));
    let pipeline = ItemPipeline::new(retries(&[])).with_events(tx);
    let executor = ConcurrentExecutor::new(runner, pipeline, &ExecutorConfig::default());

    executor.execute(&batch(&["a", "b"])).await.unwrap();
    drop(executor);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    assert!(matches!(
        events.first(),
        Some(ExecutionEvent::BatchStarted { item_count: 2, .. })
    ));
    assert!(matches!(
        events.last(),
        Some(ExecutionEvent::BatchCompleted {
            completed: 1,
            failed: 1,
            ..
        })
    ));
    assert!(events
        .iter()
        .any(|event| matches!(event, ExecutionEvent::ItemRetrying { item_id, .. } if item_id == "b")));
    assert!(events
        .iter()
        .any(|event| matches!(event, ExecutionEvent::ItemFailed { item_id, .. } if item_id == "b")));
}

#[tokio::test]
async fn test_polling_executor_reads_plan_statuses() {
    let (_dir, store) = temp_store();
    save_plan(&store, PlanKind::Project, items(&[("a", &[]), ("b", &[])]));
    let runner = Arc::new(
        ScriptedRunner::new()
            .always_fail("b")
            .with_plan_sink(store.clone(), PlanKind::Project),
    );
    let executor = PollingExecutor::new(
        runner.clone(),
        ItemPipeline::new(retries(&[])),
        store.clone(),
        PlanKind::Project,
        &ExecutorConfig::default(),
    )
    .with_poll_interval(Duration::from_millis(5));

    let result = executor.execute(&batch(&["a", "b"])).await.unwrap();

    assert_eq!(result.completed, vec!["a"]);
    assert_eq!(result.failed, vec!["b"]);
    assert_eq!(runner.calls_for("b"), 2);
    assert_eq!(result.result_for("b").unwrap().attempts, 2);
}
