use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

use crate::cli::output::{output, CommandOutput};
use crate::domain::models::PlanCounts;
use crate::services::recovery::{ContextRecovery, RecoveryReport};

use super::Workspace;

#[derive(Debug, Serialize)]
pub struct StatusOutput {
    #[serde(flatten)]
    pub report: RecoveryReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanCounts>,
}

impl CommandOutput for StatusOutput {
    fn to_human(&self) -> String {
        let info = &self.report.info;
        let suggestion = &self.report.suggestion;
        let mut lines = vec![suggestion.title.clone(), suggestion.message.clone(), String::new()];

        if let Some(id) = &info.execution_id {
            lines.push(format!("  Execution: {id}"));
        }
        if let Some(stage) = info.last_stage {
            let status = info
                .last_stage_status
                .map_or_else(String::new, |status| format!(" ({status})"));
            lines.push(format!("  Stage: {stage}{status}"));
        }
        lines.push(format!("  Progress: {}%", info.progress_percent));
        if let Some(plan) = &self.plan {
            lines.push(format!(
                "  Items: {} total, {} complete, {} in progress, {} failed, {} pending",
                plan.total, plan.complete, plan.in_progress, plan.failed, plan.pending
            ));
        }
        if let Some(relative) = &self.report.last_activity_relative {
            lines.push(format!("  Last activity: {relative}"));
        }
        if !info.interrupted_items.is_empty() {
            lines.push(format!("  Interrupted: {}", info.interrupted_items.join(", ")));
        }
        for detail in &suggestion.details {
            lines.push(format!("  - {detail}"));
        }
        if !suggestion.command.is_empty() {
            lines.push(format!("\nNext: {}", suggestion.command));
        }
        lines.join("\n")
    }
}

/// Handle `cascade status`
pub fn handle_status(workspace: &Workspace, json: bool) -> Result<()> {
    let report = ContextRecovery::new(workspace.store.clone())
        .recover(Utc::now())
        .context("Failed to inspect state")?;
    let plan = workspace
        .store
        .load_any_plan()
        .context("Failed to load plan")?
        .map(|plan| plan.counts());

    output(&StatusOutput { report, plan }, json);
    Ok(())
}
