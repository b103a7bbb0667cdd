//! Batch and iteration progress persisted in `.iteration-state.json`.
//!
//! `BatchProgress` is what a killed process reloads to see which items were
//! running when it died.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a single item within the running batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryProgressStatus {
    #[default]
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
}

/// Per-item progress record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoryProgress {
    pub status: StoryProgressStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub agent: Option<String>,
}

/// Progress of the batch currently being executed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BatchProgress {
    #[serde(default)]
    pub batch_index: usize,
    #[serde(default)]
    pub running: Vec<String>,
    #[serde(default)]
    pub completed: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
    #[serde(default)]
    pub story_progress: BTreeMap<String, StoryProgress>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl BatchProgress {
    pub fn new<I, S>(batch_index: usize, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            batch_index,
            story_progress: ids
                .into_iter()
                .map(|id| (id.into(), StoryProgress::default()))
                .collect(),
            updated_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn mark_running(&mut self, id: &str, agent: &str) {
        let now = Utc::now();
        remove(&mut self.failed, id);
        push_unique(&mut self.running, id);
        let entry = self.story_progress.entry(id.to_string()).or_default();
        entry.status = StoryProgressStatus::Running;
        entry.started_at.get_or_insert(now);
        entry.agent = Some(agent.to_string());
        self.updated_at = Some(now);
    }

    pub fn mark_retrying(&mut self, id: &str, error: &str) {
        let entry = self.story_progress.entry(id.to_string()).or_default();
        entry.status = StoryProgressStatus::Retrying;
        entry.retry_count += 1;
        entry.error = Some(error.to_string());
        self.updated_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, id: &str) {
        let now = Utc::now();
        remove(&mut self.running, id);
        push_unique(&mut self.completed, id);
        let entry = self.story_progress.entry(id.to_string()).or_default();
        entry.status = StoryProgressStatus::Completed;
        entry.completed_at = Some(now);
        entry.error = None;
        self.updated_at = Some(now);
    }

    pub fn mark_failed(&mut self, id: &str, error: &str) {
        let now = Utc::now();
        remove(&mut self.running, id);
        push_unique(&mut self.failed, id);
        let entry = self.story_progress.entry(id.to_string()).or_default();
        entry.status = StoryProgressStatus::Failed;
        entry.completed_at = Some(now);
        entry.error = Some(error.to_string());
        self.updated_at = Some(now);
    }

    /// Ids neither completed nor failed.
    pub fn unfinished(&self) -> Vec<String> {
        self.story_progress
            .keys()
            .filter(|id| !self.completed.contains(id) && !self.failed.contains(id))
            .cloned()
            .collect()
    }
}

fn push_unique(list: &mut Vec<String>, id: &str) {
    if !list.iter().any(|existing| existing == id) {
        list.push(id.to_string());
    }
}

fn remove(list: &mut Vec<String>, id: &str) {
    list.retain(|existing| existing != id);
}

/// Overall status of a run as recorded in the iteration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Stopped,
}

/// Summary of one finished batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_index: usize,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    #[serde(default)]
    pub retried: Vec<String>,
    pub duration_secs: f64,
    pub success: bool,
    pub finished_at: DateTime<Utc>,
}

/// The whole `.iteration-state.json` document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IterationState {
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub current_batch: usize,
    #[serde(default)]
    pub total_batches: usize,
    #[serde(default)]
    pub total_items: usize,
    #[serde(default)]
    pub completed_count: usize,
    #[serde(default)]
    pub failed_count: usize,
    #[serde(default)]
    pub batch_results: Vec<BatchRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_execution: Option<BatchProgress>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}
