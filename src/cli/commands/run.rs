use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use serde::Serialize;

use crate::adapters::{CommandQualityGate, CommandRunner, GateOutputsDodGate};
use crate::application::{RunCoordinator, RunSummary};
use crate::cli::output::{output, CommandOutput, ExecutionProgress, TableFormatter};
use crate::domain::models::{ExecutorStrategy, ItemStatus};

use super::Workspace;

/// Overrides taken from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub strategy: Option<ExecutorStrategy>,
    pub max_concurrency: Option<usize>,
    pub stop_on_first_failure: bool,
}

#[derive(Debug, Serialize)]
pub struct RunOutput {
    #[serde(flatten)]
    pub summary: RunSummary,
    pub success: bool,
    pub failures: Vec<String>,
}

impl CommandOutput for RunOutput {
    fn to_human(&self) -> String {
        let summary = &self.summary;
        let mut lines = vec![format!(
            "Run {} on {} plan: {} completed, {} failed in {:.1}s",
            summary.execution_id,
            summary.plan_kind,
            summary.completed.len(),
            summary.failed.len(),
            summary.duration_secs
        )];
        if !summary.batches.is_empty() {
            lines.push(TableFormatter::new().format_batch_results(&summary.batches));
        }
        if !self.failures.is_empty() {
            lines.push("\nFailures:".to_string());
            for failure in &self.failures {
                lines.push(format!("  {} {failure}", style("✗").red()));
            }
        }
        if summary.stopped_early {
            lines.push("Stopped after the first failed batch.".to_string());
        }
        if self.success {
            lines.push(format!("{} execute stage completed", style("✓").green()));
        } else {
            lines.push(
                "Fix the failures, then run `cascade stage resume-from execute` and `cascade run` again."
                    .to_string(),
            );
        }
        lines.join("\n")
    }
}

/// Handle `cascade run`
pub async fn handle_run(workspace: Workspace, options: RunOptions, json: bool) -> Result<()> {
    let mut config = workspace.config.clone();
    if let Some(strategy) = options.strategy {
        config.executor.strategy = strategy;
    }
    if let Some(max) = options.max_concurrency {
        anyhow::ensure!(max >= 1, "--max-concurrency must be at least 1");
        config.executor.max_concurrency = max;
    }
    if options.stop_on_first_failure {
        config.executor.stop_on_first_failure = true;
    }

    let plan = workspace.require_plan()?;
    let pending = plan
        .items()
        .iter()
        .filter(|item| item.status != ItemStatus::Complete)
        .count() as u64;

    let runner = CommandRunner::from_config(&config)
        .with_working_dir(&workspace.project_dir)
        .with_plan_sink(workspace.store.clone(), plan.kind);
    let mut coordinator = RunCoordinator::new(config.clone(), workspace.store.clone(), Arc::new(runner))
        .with_dod_gate(Arc::new(GateOutputsDodGate));
    if !config.gates.checks.is_empty() {
        let gate = CommandQualityGate::new(config.gates.checks.clone(), config.executor.item_timeout())
            .with_working_dir(&workspace.project_dir);
        coordinator = coordinator.with_quality_gate(Arc::new(gate));
    }

    let progress = if json {
        ExecutionProgress::hidden(pending)
    } else {
        ExecutionProgress::new(pending)
    };
    let (events, display) = progress.spawn();
    let coordinator = coordinator.with_events(events);

    let result = coordinator.run().await;
    // Dropping the coordinator closes the channel so the display can finish.
    drop(coordinator);
    let _ = display.await;

    let summary = result.context("Run failed")?;
    let success = summary.success();
    let out = RunOutput {
        failures: summary.failure_summaries(),
        success,
        summary,
    };
    output(&out, json);

    if success {
        Ok(())
    } else {
        anyhow::bail!("{} item(s) failed", out.summary.failed.len())
    }
}
