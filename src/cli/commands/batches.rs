use anyhow::Result;
use serde::Serialize;

use crate::cli::output::{output, CommandOutput};
use crate::services::batch_scheduler::BatchScheduler;
use crate::services::dag_render::{render_dag, render_mermaid};

use super::Workspace;

#[derive(Debug, Serialize)]
pub struct BatchView {
    pub index: usize,
    pub items: Vec<String>,
    pub forced: bool,
}

#[derive(Debug, Serialize)]
pub struct BatchesOutput {
    pub batches: Vec<BatchView>,
    pub cycles: Vec<Vec<String>>,
    #[serde(skip)]
    rendered: String,
}

impl CommandOutput for BatchesOutput {
    fn to_human(&self) -> String {
        self.rendered.clone()
    }
}

/// Handle `cascade batches`
pub fn handle_batches(workspace: &Workspace, mermaid: bool, json: bool) -> Result<()> {
    let plan = workspace.require_plan()?;
    let scheduler = BatchScheduler::new();

    let batches = scheduler
        .schedule_plan(&plan)
        .into_iter()
        .map(|batch| BatchView {
            index: batch.index,
            items: batch.ids(),
            forced: batch.forced,
        })
        .collect();
    let rendered = if mermaid {
        render_mermaid(&plan)
    } else {
        render_dag(&plan)
    };

    let out = BatchesOutput {
        batches,
        cycles: scheduler.detect_cycles(plan.items()),
        rendered,
    };
    output(&out, json);
    Ok(())
}
