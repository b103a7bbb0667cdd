//! Common test utilities for integration tests
//!
//! Provides isolated state roots, plan fixtures and scripted doubles for the
//! runner and gate ports.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use cascade::domain::models::{
    Config, DodCheckResult, DodRequest, ExecutionOutcome, ExecutionRequest, GateResults,
    ItemStatus, LockConfig, Plan, PlanKind, QualityGateResult, WorkItem,
};
use cascade::domain::ports::{DodGate, QualityGate, StoryRunner};
use cascade::domain::DomainResult;
use cascade::infrastructure::locking::LockManager;
use cascade::infrastructure::state::StateStore;

/// Lock settings that fail fast in tests.
pub fn fast_locks() -> LockConfig {
    LockConfig {
        timeout_secs: 5,
        initial_backoff_ms: 2,
        max_backoff_ms: 20,
        ..LockConfig::default()
    }
}

/// A state store rooted in a fresh temporary directory.
pub fn temp_store() -> (TempDir, StateStore) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let locks = LockManager::new(dir.path().join("locks"), &fast_locks());
    let store = StateStore::new(dir.path(), locks);
    (dir, store)
}

/// Configuration with millisecond retry delays.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.executor.poll_interval_ms = 5;
    config.locking = fast_locks();
    config
}

/// Build items from `(id, deps)` pairs.
pub fn items(layout: &[(&str, &[&str])]) -> Vec<WorkItem> {
    layout.iter()
        .map(|(id, deps)| WorkItem::new(*id, format!("Item {id}")).with_dependencies(deps.iter().copied()))
        .collect()
}

pub fn save_plan(store: &StateStore, kind: PlanKind, items: Vec<WorkItem>) -> Plan {
    let plan = Plan::new(kind, "test goal", items).expect("valid plan");
    store.save_plan(&plan).expect("plan saved");
    plan
}

/// Story runner whose outcomes are scripted per item.
///
/// Each call pops the next scripted outcome for the item; once the queue is
/// empty the item succeeds. Every call sleeps for `delay` and the highest
/// number of concurrent calls is recorded.
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<ExecutionOutcome>>>,
    delay: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
    calls: Mutex<Vec<ExecutionRequest>>,
    sink: Option<(StateStore, PlanKind)>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            sink: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue outcomes for `item_id`, consumed in order.
    pub fn script(self, item_id: &str, outcomes: Vec<ExecutionOutcome>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(item_id.to_string(), outcomes.into());
        self
    }

    /// Make `item_id` fail with exit code 1 on every call.
    pub fn always_fail(self, item_id: &str) -> Self {
        let outcomes = (0..16)
            .map(|_| ExecutionOutcome::failed(1, "error: tests failed"))
            .collect();
        self.script(item_id, outcomes)
    }

    /// Report launched items by writing their status into the plan.
    pub fn with_plan_sink(mut self, store: StateStore, kind: PlanKind) -> Self {
        self.sink = Some((store, kind));
        self
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<ExecutionRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, item_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.item_id == item_id)
            .count()
    }

    async fn execute(&self, request: &ExecutionRequest) -> ExecutionOutcome {
        self.calls.lock().unwrap().push(request.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&request.item_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| ExecutionOutcome::succeeded("done"))
    }
}

#[async_trait]
impl StoryRunner for ScriptedRunner {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(&self, request: ExecutionRequest) -> DomainResult<ExecutionOutcome> {
        Ok(self.execute(&request).await)
    }

    async fn launch_batch(&self, requests: Vec<ExecutionRequest>) -> DomainResult<()> {
        let (store, kind) = self.sink.clone().expect("launch needs a plan sink");
        for request in requests {
            let outcome = self.execute(&request).await;
            let status = if outcome.success {
                ItemStatus::Complete
            } else {
                ItemStatus::Failed
            };
            store.set_item_status(kind, &request.item_id, status)?;
        }
        Ok(())
    }
}

/// Quality gate failing a fixed set of items with a `tests` check.
pub struct ScriptedQualityGate {
    failing: HashSet<String>,
}

impl ScriptedQualityGate {
    pub fn failing(ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            failing: ids.iter().map(|id| (*id).to_string()).collect(),
        })
    }
}

#[async_trait]
impl QualityGate for ScriptedQualityGate {
    async fn check(&self, item: &WorkItem, _changed_files: &[String]) -> DomainResult<GateResults> {
        let mut results = GateResults::new();
        let result = if self.failing.contains(&item.id) {
            QualityGateResult::fail("1 test failed")
        } else {
            QualityGateResult::pass()
        };
        results.insert("tests".to_string(), result);
        Ok(results)
    }
}

/// DoD gate rejecting a fixed set of items.
pub struct ScriptedDodGate {
    rejecting: HashSet<String>,
}

impl ScriptedDodGate {
    pub fn rejecting(ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            rejecting: ids.iter().map(|id| (*id).to_string()).collect(),
        })
    }
}

#[async_trait]
impl DodGate for ScriptedDodGate {
    async fn check(&self, request: DodRequest) -> DomainResult<DodCheckResult> {
        let mut result = DodCheckResult {
            passed: true,
            ..DodCheckResult::default()
        };
        if self.rejecting.contains(&request.item_id) {
            result.passed = false;
            result.errors.push("acceptance criteria not met".to_string());
        }
        Ok(result)
    }
}
