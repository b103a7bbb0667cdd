//! Execution batches and their results.

use std::time::Duration;

use serde::Serialize;

use super::retry::ErrorType;
use super::work_item::WorkItem;

/// Items whose dependencies are all satisfied by earlier batches.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionBatch {
    /// 0-based position in the batch sequence.
    pub index: usize,
    pub items: Vec<WorkItem>,
    /// Set when the batch was produced by the deadlock fallback: its members'
    /// dependencies are not guaranteed to be satisfied.
    pub forced: bool,
}

impl ExecutionBatch {
    pub fn new(index: usize, items: Vec<WorkItem>) -> Self {
        Self {
            index,
            items,
            forced: false,
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|item| item.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Final result for one item of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemResult {
    pub item_id: String,
    pub success: bool,
    /// Invocations made during this batch.
    pub attempts: u32,
    pub agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    pub suggested_fixes: Vec<String>,
}

impl ItemResult {
    pub fn success(item_id: impl Into<String>, agent: impl Into<String>, attempts: u32) -> Self {
        Self {
            item_id: item_id.into(),
            success: true,
            attempts,
            agent: agent.into(),
            error: None,
            error_type: None,
            suggested_fixes: Vec::new(),
        }
    }

    pub fn failure(
        item_id: impl Into<String>,
        agent: impl Into<String>,
        attempts: u32,
        error_type: ErrorType,
        error: impl Into<String>,
        suggested_fixes: Vec<String>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            success: false,
            attempts,
            agent: agent.into(),
            error: Some(error.into()),
            error_type: Some(error_type),
            suggested_fixes,
        }
    }

    /// Human-readable one-liner for a failure, with the top suggested fix.
    pub fn failure_summary(&self) -> Option<String> {
        let error = self.error.as_deref()?;
        Some(match self.suggested_fixes.first() {
            Some(fix) => format!("{}: {error} (try: {fix})", self.item_id),
            None => format!("{}: {error}", self.item_id),
        })
    }
}

/// Outcome of executing one batch, identical for every executor strategy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    pub batch_index: usize,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub retried: Vec<String>,
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
    pub success: bool,
    pub item_results: Vec<ItemResult>,
}

impl BatchResult {
    /// Assemble a result; `item_results` are reordered to follow `order`.
    pub fn from_items(
        batch_index: usize,
        order: &[String],
        mut item_results: Vec<ItemResult>,
        retried: Vec<String>,
        duration: Duration,
    ) -> Self {
        item_results.sort_by_key(|r| order.iter().position(|id| *id == r.item_id));
        let completed: Vec<String> = item_results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.item_id.clone())
            .collect();
        let failed: Vec<String> = item_results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.item_id.clone())
            .collect();
        let mut retried = retried;
        retried.sort_by_key(|id| order.iter().position(|o| o == id));
        retried.dedup();
        Self {
            batch_index,
            success: failed.is_empty(),
            completed,
            failed,
            retried,
            duration,
            item_results,
        }
    }

    pub fn result_for(&self, id: &str) -> Option<&ItemResult> {
        self.item_results.iter().find(|r| r.item_id == id)
    }
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}
