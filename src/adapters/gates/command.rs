//! Quality gate that runs named shell checks.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::adapters::process::run_with_timeout;
use crate::domain::errors::DomainResult;
use crate::domain::models::{GateCommand, GateResults, QualityGateResult, WorkItem};
use crate::domain::ports::QualityGate;

/// Lines kept in a failed check's error summary.
const SUMMARY_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct CommandQualityGate {
    checks: Vec<GateCommand>,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CommandQualityGate {
    pub fn new(checks: Vec<GateCommand>, timeout: Duration) -> Self {
        Self {
            checks,
            working_dir: PathBuf::from("."),
            timeout,
        }
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    async fn run_check(&self, check: &GateCommand, item: &WorkItem, changed: &[String]) -> QualityGateResult {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&check.command)
            .current_dir(&self.working_dir)
            .env("CASCADE_ITEM_ID", &item.id)
            .env("CASCADE_CHANGED_FILES", changed.join("\n"));

        match run_with_timeout(cmd, None, self.timeout).await {
            Ok(output) if output.status.is_some_and(|s| s.success()) => QualityGateResult::pass(),
            Ok(output) => {
                let diagnostics = output.diagnostics();
                let errors: Vec<String> = diagnostics
                    .lines()
                    .filter(|line| line.to_ascii_lowercase().contains("error"))
                    .map(str::to_string)
                    .collect();
                QualityGateResult {
                    passed: false,
                    error_summary: Some(tail_lines(diagnostics, SUMMARY_LINES)),
                    structured_errors: (!errors.is_empty()).then_some(errors),
                }
            }
            Err(err) => QualityGateResult::fail(format!("failed to run '{}': {err}", check.command)),
        }
    }
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

#[async_trait]
impl QualityGate for CommandQualityGate {
    async fn check(&self, item: &WorkItem, changed_files: &[String]) -> DomainResult<GateResults> {
        let mut results = GateResults::new();
        for check in &self.checks {
            let result = self.run_check(check, item, changed_files).await;
            debug!(item_id = %item.id, gate = %check.name, passed = result.passed, "gate checked");
            results.insert(check.name.clone(), result);
        }
        Ok(results)
    }
}
