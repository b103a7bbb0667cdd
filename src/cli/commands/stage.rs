use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::cli::output::{output, CommandOutput, TableFormatter};
use crate::domain::models::{ContractRegistry, ExecutionStage, StageStateDocument};
use crate::services::stage_machine::StageStateMachine;

use super::Workspace;

#[derive(Debug, Serialize)]
pub struct StageShowOutput {
    #[serde(flatten)]
    pub document: StageStateDocument,
    pub progress_percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_point: Option<ExecutionStage>,
}

impl CommandOutput for StageShowOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![
            format!(
                "Execution {} ({} flow, {} strategy): {}% done",
                self.document.execution_id,
                self.document.flow,
                self.document.strategy,
                self.progress_percent
            ),
            TableFormatter::new().format_stages(&self.document),
        ];
        if let Some(stage) = self.resume_point {
            lines.push(format!("Resume point: {stage}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ResumeFromOutput {
    pub execution_id: String,
    pub stage: ExecutionStage,
    pub message: String,
}

impl CommandOutput for ResumeFromOutput {
    fn to_human(&self) -> String {
        self.message.clone()
    }
}

fn load_machine(workspace: &Workspace) -> Result<StageStateMachine> {
    StageStateMachine::load(
        Arc::new(ContractRegistry::standard()),
        workspace.store.clone(),
    )
    .context("Failed to load stage state")?
    .ok_or_else(|| anyhow::anyhow!("No stage state found. Start a run with 'cascade run'."))
}

/// Handle `cascade stage show`
pub fn handle_show(workspace: &Workspace, json: bool) -> Result<()> {
    let machine = load_machine(workspace)?;
    let out = StageShowOutput {
        progress_percent: machine.progress(),
        resume_point: machine.resume_point(),
        document: machine.document().clone(),
    };
    output(&out, json);
    Ok(())
}

/// Handle `cascade stage resume-from <stage>`
pub fn handle_resume_from(workspace: &Workspace, stage: ExecutionStage, json: bool) -> Result<()> {
    let mut machine = load_machine(workspace)?;
    machine
        .resume_from(stage)
        .with_context(|| format!("Failed to rewind to stage {stage}"))?;

    let out = ResumeFromOutput {
        execution_id: machine.execution_id().to_string(),
        stage,
        message: format!(
            "Stages from {stage} onward reset to pending. Run 'cascade run' to continue \
             (use 'cascade retry reset --all' first if items exhausted their retries)."
        ),
    };
    output(&out, json);
    Ok(())
}
