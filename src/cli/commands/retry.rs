use anyhow::{Context, Result};
use serde::Serialize;

use crate::cli::output::{output, CommandOutput, TableFormatter};
use crate::services::retry_manager::{RetryManager, RetrySummary};

use super::Workspace;

#[derive(Debug, Serialize)]
pub struct RetryShowOutput {
    #[serde(flatten)]
    pub summary: RetrySummary,
}

impl CommandOutput for RetryShowOutput {
    fn to_human(&self) -> String {
        let summary = &self.summary;
        if summary.items.is_empty() {
            return "No retry state recorded.".to_string();
        }
        format!(
            "{} item(s) tracked, {} exhausted, {} failure(s) recorded\n{}",
            summary.tracked,
            summary.exhausted,
            summary.total_failures,
            TableFormatter::new().format_retries(summary)
        )
    }
}

#[derive(Debug, Serialize)]
pub struct RetryResetOutput {
    pub cleared: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

impl CommandOutput for RetryResetOutput {
    fn to_human(&self) -> String {
        match (&self.item_id, self.cleared) {
            (Some(id), 0) => format!("No retry state recorded for {id}."),
            (Some(id), _) => format!("Retry state for {id} reset."),
            (None, n) => format!("Retry state reset for {n} item(s)."),
        }
    }
}

fn manager(workspace: &Workspace) -> Result<RetryManager> {
    RetryManager::load(
        workspace.config.retry.clone(),
        workspace.config.executor.default_agent.clone(),
        workspace.store.clone(),
    )
    .context("Failed to load retry state")
}

/// Handle `cascade retry show`
pub fn handle_show(workspace: &Workspace, json: bool) -> Result<()> {
    let summary = manager(workspace)?.summary();
    output(&RetryShowOutput { summary }, json);
    Ok(())
}

/// Handle `cascade retry reset [<id>] [--all]`
pub fn handle_reset(workspace: &Workspace, item_id: Option<String>, all: bool, json: bool) -> Result<()> {
    let retries = manager(workspace)?;
    let out = match item_id {
        Some(id) if !all => {
            let cleared = retries
                .reset(&id)
                .with_context(|| format!("Failed to reset retry state for {id}"))?;
            RetryResetOutput {
                cleared: usize::from(cleared),
                item_id: Some(id),
            }
        }
        _ => RetryResetOutput {
            cleared: retries.reset_all().context("Failed to reset retry state")?,
            item_id: None,
        },
    };
    output(&out, json);
    Ok(())
}
