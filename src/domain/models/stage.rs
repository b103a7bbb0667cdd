//! Execution stage lifecycle types.
//!
//! Persisted as `stage-state.json`. The state machine in
//! `services::stage_machine` owns every mutation; these types only carry
//! the data and the ordering rules that do not need the contract registry.
//!
//! ```text
//! Intake → Analyze → Plan → Design → ReadyCheck → Execute → VerifyReview → WrapUp
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::errors::DomainError;

/// Key/value outputs produced by a stage.
pub type StageOutputs = BTreeMap<String, Value>;

/// Version written into `stage-state.json`.
pub const STAGE_STATE_VERSION: &str = "1.0";

/// The eight fixed phases of one execution run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStage {
    Intake,
    Analyze,
    Plan,
    Design,
    ReadyCheck,
    Execute,
    VerifyReview,
    WrapUp,
}

impl ExecutionStage {
    pub const ALL: [Self; 8] = [
        Self::Intake,
        Self::Analyze,
        Self::Plan,
        Self::Design,
        Self::ReadyCheck,
        Self::Execute,
        Self::VerifyReview,
        Self::WrapUp,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn next(self) -> Option<Self> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Stages strictly before this one.
    pub fn predecessors(self) -> &'static [Self] {
        &Self::ALL[..self.index()]
    }

    /// This stage and every stage after it.
    pub fn this_and_after(self) -> &'static [Self] {
        &Self::ALL[self.index()..]
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Analyze => "analyze",
            Self::Plan => "plan",
            Self::Design => "design",
            Self::ReadyCheck => "ready_check",
            Self::Execute => "execute",
            Self::VerifyReview => "verify_review",
            Self::WrapUp => "wrap_up",
        }
    }
}

impl fmt::Display for ExecutionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == normalized)
            .ok_or_else(|| DomainError::ValidationFailed(format!("unknown stage '{s}'")))
    }
}

/// Status of a single stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Completed or skipped: the stage will not need to run again.
    pub fn is_done(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// The stage actually ran: in progress, completed or failed.
    pub fn has_run(self) -> bool {
        matches!(self, Self::InProgress | Self::Completed | Self::Failed)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Runtime state of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub stage: ExecutionStage,
    #[serde(default)]
    pub status: StageStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outputs: StageOutputs,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl StageState {
    pub fn pending(stage: ExecutionStage) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            outputs: StageOutputs::new(),
            errors: Vec::new(),
            skip_reason: None,
        }
    }

    /// Last moment this stage changed, if it ever did.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.completed_at.or(self.started_at)
    }
}

/// One entry of the transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTransition {
    pub timestamp: DateTime<Utc>,
    pub stage: ExecutionStage,
    pub new_status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The whole `stage-state.json` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStateDocument {
    pub version: String,
    pub execution_id: String,
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub flow: String,
    #[serde(default)]
    pub current_stage: Option<ExecutionStage>,
    pub stages: BTreeMap<ExecutionStage, StageState>,
    #[serde(default)]
    pub history: Vec<StageTransition>,
    /// Run-level inputs available to every stage (e.g. the plan path).
    #[serde(default)]
    pub inputs: StageOutputs,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StageStateDocument {
    /// A fresh run with every stage pending.
    pub fn new(strategy: impl Into<String>, flow: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: STAGE_STATE_VERSION.to_string(),
            execution_id: Uuid::new_v4().to_string(),
            strategy: strategy.into(),
            flow: flow.into(),
            current_stage: None,
            stages: ExecutionStage::ALL
                .into_iter()
                .map(|stage| (stage, StageState::pending(stage)))
                .collect(),
            history: Vec::new(),
            inputs: StageOutputs::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Fill in any stage missing from a document written by an older build.
    pub fn normalize(&mut self) {
        for stage in ExecutionStage::ALL {
            self.stages
                .entry(stage)
                .or_insert_with(|| StageState::pending(stage));
        }
    }

    pub fn status(&self, stage: ExecutionStage) -> StageStatus {
        self.stages
            .get(&stage)
            .map_or(StageStatus::Pending, |state| state.status)
    }

    pub fn is_complete(&self) -> bool {
        ExecutionStage::ALL
            .into_iter()
            .all(|stage| self.status(stage).is_done())
    }

    pub fn stages_with(&self, status: StageStatus) -> Vec<ExecutionStage> {
        ExecutionStage::ALL
            .into_iter()
            .filter(|stage| self.status(*stage) == status)
            .collect()
    }

    /// Share of stages completed or skipped, 0-100.
    pub fn progress_percent(&self) -> u8 {
        let done = ExecutionStage::ALL
            .into_iter()
            .filter(|stage| self.status(*stage).is_done())
            .count();
        percent(done, ExecutionStage::ALL.len())
    }

    /// Timestamp of the last recorded transition.
    pub fn last_transition_at(&self) -> Option<DateTime<Utc>> {
        self.history.last().map(|entry| entry.timestamp)
    }
}

/// Integer percentage rounded down, 0 when `total` is 0.
pub(crate) fn percent(part: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    u8::try_from(part.min(total) * 100 / total).unwrap_or(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_and_navigation() {
        assert_eq!(ExecutionStage::Intake.index(), 0);
        assert_eq!(ExecutionStage::WrapUp.index(), 7);
        assert_eq!(ExecutionStage::Design.next(), Some(ExecutionStage::ReadyCheck));
        assert_eq!(ExecutionStage::WrapUp.next(), None);
        assert_eq!(ExecutionStage::Plan.predecessors().len(), 2);
        assert_eq!(ExecutionStage::VerifyReview.this_and_after().len(), 2);
    }

    #[test]
    fn test_stage_parse_accepts_dashes() {
        assert_eq!(
            "ready-check".parse::<ExecutionStage>().unwrap(),
            ExecutionStage::ReadyCheck
        );
        assert_eq!("EXECUTE".parse::<ExecutionStage>().unwrap(), ExecutionStage::Execute);
        assert!("deploy".parse::<ExecutionStage>().is_err());
    }

    #[test]
    fn test_document_serializes_stage_keys_as_names() {
        let doc = StageStateDocument::new("parallel", "standard");
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json["stages"]["ready_check"].is_object());
        assert_eq!(json["stages"]["verify_review"]["status"], "pending");

        let back: StageStateDocument = serde_json::from_value(json).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_normalize_fills_missing_stages() {
        let mut doc = StageStateDocument::new("s", "f");
        doc.stages.remove(&ExecutionStage::WrapUp);
        doc.normalize();
        assert_eq!(doc.stages.len(), 8);
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(3, 8), 37);
        assert_eq!(percent(8, 8), 100);
    }
}
