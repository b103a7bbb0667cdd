//! What crash/context recovery reports back.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stage::{ExecutionStage, StageStatus};
use super::work_item::PlanKind;

/// Why execution should (or should not) be resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeReason {
    /// A stage was running when the process stopped.
    StageInProgress,
    /// A stage failed and needs inspection.
    StageFailed,
    /// The run stopped between stages.
    StagePending,
    /// A plan has some, but not all, items complete.
    PlanIncomplete,
    /// A plan exists but nothing has been started.
    NeedsApproval,
    /// Everything recorded is complete.
    Complete,
    /// No stage state and no plan.
    NoContext,
}

impl fmt::Display for ResumeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StageInProgress => "stage_in_progress",
            Self::StageFailed => "stage_failed",
            Self::StagePending => "stage_pending",
            Self::PlanIncomplete => "plan_incomplete",
            Self::NeedsApproval => "needs_approval",
            Self::Complete => "complete",
            Self::NoContext => "no_context",
        };
        f.write_str(s)
    }
}

/// Structured summary of an interrupted run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompleteStateInfo {
    pub execution_id: Option<String>,
    pub last_stage: Option<ExecutionStage>,
    pub last_stage_status: Option<StageStatus>,
    pub progress_percent: u8,
    pub completed_stages: Vec<ExecutionStage>,
    pub failed_stages: Vec<ExecutionStage>,
    pub resume_reason: ResumeReason,
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub plan_kind: Option<PlanKind>,
    #[serde(default)]
    pub stage_errors: Vec<String>,
    /// Items the concurrent executor had marked running when it stopped.
    #[serde(default)]
    pub interrupted_items: Vec<String>,
}

/// What to tell the operator and what to run next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeSuggestion {
    pub title: String,
    pub message: String,
    pub command: String,
    pub details: Vec<String>,
    pub can_auto_resume: bool,
}
