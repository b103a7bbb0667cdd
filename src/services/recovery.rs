//! Cold-start inspection of persisted state.
//!
//! Reads the stage state, plans and iteration state and reports what was
//! happening plus a runnable next command. Never writes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    ExecutionStage, IncompleteStateInfo, ItemStatus, Plan, PlanKind, ResumeReason,
    ResumeSuggestion, StageStateDocument, StageStatus,
};
use crate::domain::models::stage::percent;
use crate::infrastructure::state::StateStore;

/// Detection result plus the suggestion derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub info: IncompleteStateInfo,
    pub suggestion: ResumeSuggestion,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_relative: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ContextRecovery {
    store: StateStore,
}

impl ContextRecovery {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Describe the persisted state. Reading the same files twice yields the
    /// same result.
    pub fn detect(&self) -> DomainResult<IncompleteStateInfo> {
        let interrupted = self.interrupted_items()?;
        let plan = self.load_plan()?;

        if let Some(doc) = self.store.load_stage_state()? {
            let mut info = from_stage_state(&doc);
            info.plan_kind = plan.as_ref().map(|plan| plan.kind);
            info.interrupted_items = interrupted;
            debug!(reason = %info.resume_reason, "recovered from stage state");
            return Ok(info);
        }

        let info = match plan {
            Some(plan) => from_plan(&plan, interrupted, self.last_iteration_activity()?),
            None => empty_info(ResumeReason::NoContext),
        };
        debug!(reason = %info.resume_reason, "recovered from plan inspection");
        Ok(info)
    }

    /// Detect and attach a suggestion; `now` anchors the relative time.
    pub fn recover(&self, now: DateTime<Utc>) -> DomainResult<RecoveryReport> {
        let info = self.detect()?;
        Ok(RecoveryReport {
            suggestion: suggest(&info),
            last_activity_relative: info.last_activity.map(|ts| relative_time(ts, now)),
            info,
        })
    }

    /// Project plan first, then feature plan.
    fn load_plan(&self) -> DomainResult<Option<Plan>> {
        if let Some(plan) = self.store.load_plan(PlanKind::Project)? {
            return Ok(Some(plan));
        }
        self.store.load_plan(PlanKind::Feature)
    }

    fn interrupted_items(&self) -> DomainResult<Vec<String>> {
        Ok(self
            .store
            .load_iteration_state()?
            .and_then(|state| state.parallel_execution)
            .map(|progress| progress.running)
            .unwrap_or_default())
    }

    fn last_iteration_activity(&self) -> DomainResult<Option<DateTime<Utc>>> {
        Ok(self
            .store
            .load_iteration_state()?
            .and_then(|state| state.updated_at))
    }
}

fn empty_info(reason: ResumeReason) -> IncompleteStateInfo {
    IncompleteStateInfo {
        execution_id: None,
        last_stage: None,
        last_stage_status: None,
        progress_percent: 0,
        completed_stages: Vec::new(),
        failed_stages: Vec::new(),
        resume_reason: reason,
        last_activity: None,
        plan_kind: None,
        stage_errors: Vec::new(),
        interrupted_items: Vec::new(),
    }
}

fn from_stage_state(doc: &StageStateDocument) -> IncompleteStateInfo {
    let failed = doc.stages_with(StageStatus::Failed);
    let in_progress = doc.stages_with(StageStatus::InProgress);

    let (reason, last_stage) = if doc.is_complete() {
        (ResumeReason::Complete, Some(ExecutionStage::WrapUp))
    } else if let Some(stage) = failed.first() {
        (ResumeReason::StageFailed, Some(*stage))
    } else if let Some(stage) = in_progress.first() {
        (ResumeReason::StageInProgress, Some(*stage))
    } else {
        let latest = ExecutionStage::ALL
            .into_iter()
            .rev()
            .find(|stage| doc.status(*stage) != StageStatus::Pending);
        (ResumeReason::StagePending, latest)
    };

    let stage_errors = last_stage
        .and_then(|stage| doc.stages.get(&stage))
        .map(|state| state.errors.clone())
        .unwrap_or_default();

    IncompleteStateInfo {
        execution_id: Some(doc.execution_id.clone()),
        last_stage,
        last_stage_status: last_stage.map(|stage| doc.status(stage)),
        progress_percent: doc.progress_percent(),
        completed_stages: doc.stages_with(StageStatus::Completed),
        failed_stages: failed,
        resume_reason: reason,
        last_activity: doc.last_transition_at().or(Some(doc.updated_at)),
        plan_kind: None,
        stage_errors,
        interrupted_items: Vec::new(),
    }
}

fn from_plan(
    plan: &Plan,
    mut interrupted: Vec<String>,
    last_activity: Option<DateTime<Utc>>,
) -> IncompleteStateInfo {
    let counts = plan.counts();
    let reason = if plan.is_complete() {
        ResumeReason::Complete
    } else if counts.pending == counts.total {
        ResumeReason::NeedsApproval
    } else {
        ResumeReason::PlanIncomplete
    };

    for item in plan.items() {
        if item.status == ItemStatus::InProgress && !interrupted.contains(&item.id) {
            interrupted.push(item.id.clone());
        }
    }

    let mut info = empty_info(reason);
    info.progress_percent = percent(counts.complete, counts.total);
    info.plan_kind = Some(plan.kind);
    info.last_activity = last_activity;
    info.interrupted_items = interrupted;
    info.stage_errors = plan
        .items()
        .iter()
        .filter(|item| item.status == ItemStatus::Failed)
        .map(|item| format!("work item {} failed", item.id))
        .collect();
    info
}

fn plan_label(kind: Option<PlanKind>) -> &'static str {
    match kind {
        Some(PlanKind::Project) => "Project plan",
        Some(PlanKind::Feature) => "Feature plan",
        None => "Plan",
    }
}

/// Map detection output to what the operator should do next.
pub fn suggest(info: &IncompleteStateInfo) -> ResumeSuggestion {
    let stage = info
        .last_stage
        .map_or_else(|| "unknown".to_string(), |stage| stage.to_string());
    let progress = format!("Progress: {}%", info.progress_percent);
    let mut details = Vec::new();

    let (title, message, command, can_auto_resume) = match info.resume_reason {
        ResumeReason::StageFailed => {
            details.extend(info.stage_errors.iter().cloned());
            details.push(progress);
            (
                format!("Stage {stage} failed"),
                format!("The run stopped because stage {stage} failed. Fix the reported errors, then resume from that stage."),
                format!("cascade stage resume-from {stage}"),
                false,
            )
        }
        ResumeReason::StageInProgress => {
            details.push(progress);
            details.extend(
                info.interrupted_items
                    .iter()
                    .map(|id| format!("Interrupted while running: {id}")),
            );
            (
                format!("Interrupted during {stage}"),
                format!("The process stopped while stage {stage} was running. Resuming continues from that stage."),
                "cascade run".to_string(),
                true,
            )
        }
        ResumeReason::StagePending => {
            details.push(progress);
            (
                "Run paused between stages".to_string(),
                format!("The last finished stage was {stage}. Resuming starts the next pending stage."),
                "cascade run".to_string(),
                true,
            )
        }
        ResumeReason::PlanIncomplete => {
            let failed = !info.stage_errors.is_empty();
            details.push(progress);
            details.extend(info.stage_errors.iter().cloned());
            details.extend(
                info.interrupted_items
                    .iter()
                    .map(|id| format!("Interrupted while running: {id}")),
            );
            let message = if failed {
                "Some work items failed. Review them (cascade retry show) before resuming."
            } else {
                "Some work items are complete. Resuming schedules the remaining ones."
            };
            (
                format!("{} partially complete", plan_label(info.plan_kind)),
                message.to_string(),
                "cascade run".to_string(),
                !failed,
            )
        }
        ResumeReason::NeedsApproval => {
            details.push("Review the batches with `cascade batches` first".to_string());
            (
                format!("{} ready to start", plan_label(info.plan_kind)),
                "A plan exists but no work item has started. Approve it by starting the run.".to_string(),
                "cascade run".to_string(),
                false,
            )
        }
        ResumeReason::Complete => (
            "Nothing to resume".to_string(),
            "Every recorded stage and work item is complete.".to_string(),
            "cascade stage show".to_string(),
            false,
        ),
        ResumeReason::NoContext => {
            details.push("Create prd.json or mega-plan.json in the state directory".to_string());
            (
                "No execution context found".to_string(),
                "There is no stage state and no plan. Write a plan to begin.".to_string(),
                "cascade run".to_string(),
                false,
            )
        }
    };

    ResumeSuggestion {
        title,
        message,
        command,
        details,
        can_auto_resume,
    }
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{n} {unit}s ago")
    }
}

/// Human-friendly age of `ts` relative to `now`, e.g. "2 hours ago".
pub fn relative_time(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - ts).num_seconds();
    match secs {
        s if s < 60 => "just now".to_string(),
        s if s < 3_600 => plural(s / 60, "minute"),
        s if s < 86_400 => plural(s / 3_600, "hour"),
        s => plural(s / 86_400, "day"),
    }
}
