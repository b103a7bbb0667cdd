//! Runs a configured external agent command per work item.
//!
//! The prompt is written to the child's stdin. In launch mode every request
//! runs in the background and the item's terminal status is written to the
//! plan when it exits.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::adapters::process::run_with_timeout;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    AgentCommand, Config, ExecutionOutcome, ExecutionRequest, ItemStatus, PlanKind,
};
use crate::domain::ports::StoryRunner;
use crate::infrastructure::state::StateStore;

/// Where launched items report their terminal status.
#[derive(Debug, Clone)]
struct PlanSink {
    store: StateStore,
    kind: PlanKind,
}

#[derive(Debug, Clone)]
pub struct CommandRunner {
    agents: Arc<BTreeMap<String, AgentCommand>>,
    working_dir: PathBuf,
    item_timeout: Duration,
    sink: Option<PlanSink>,
    outcomes: Arc<RwLock<HashMap<String, ExecutionOutcome>>>,
}

impl CommandRunner {
    pub fn new(agents: BTreeMap<String, AgentCommand>, item_timeout: Duration) -> Self {
        Self {
            agents: Arc::new(agents),
            working_dir: PathBuf::from("."),
            item_timeout,
            sink: None,
            outcomes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.agents.commands.clone(), config.executor.item_timeout())
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Enable `launch_batch`, reporting into the plan of `kind`.
    #[must_use]
    pub fn with_plan_sink(mut self, store: StateStore, kind: PlanKind) -> Self {
        self.sink = Some(PlanSink { store, kind });
        self
    }

    fn command_for(&self, request: &ExecutionRequest) -> DomainResult<Command> {
        let agent = self.agents.get(&request.agent).ok_or_else(|| {
            DomainError::Config(format!("no command configured for agent '{}'", request.agent))
        })?;
        let mut cmd = Command::new(&agent.program);
        cmd.args(&agent.args)
            .current_dir(&self.working_dir)
            .env("CASCADE_ITEM_ID", &request.item_id)
            .env("CASCADE_ATTEMPT", request.attempt.to_string());
        Ok(cmd)
    }
}

#[async_trait]
impl StoryRunner for CommandRunner {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn run(&self, request: ExecutionRequest) -> DomainResult<ExecutionOutcome> {
        let cmd = self.command_for(&request)?;
        debug!(item_id = %request.item_id, agent = %request.agent, attempt = request.attempt, "spawning agent");

        let output = run_with_timeout(cmd, Some(request.prompt), self.item_timeout)
            .await
            .map_err(|err| {
                DomainError::ExecutionFailed(format!("failed to spawn agent '{}': {err}", request.agent))
            })?;

        let outcome = match output.status {
            None => ExecutionOutcome::timed_out(format!(
                "agent timed out after {}s",
                self.item_timeout.as_secs()
            )),
            Some(status) if status.success() => ExecutionOutcome::succeeded(output.stdout),
            Some(status) => match status.code() {
                Some(code) => {
                    let diagnostics = output.diagnostics();
                    let message = if diagnostics.is_empty() {
                        format!("agent exited with status {code}")
                    } else {
                        diagnostics.to_string()
                    };
                    ExecutionOutcome {
                        output: format!("{}{}", output.stdout, output.stderr),
                        ..ExecutionOutcome::failed(code, message)
                    }
                }
                None => ExecutionOutcome {
                    output: output.stderr,
                    ..ExecutionOutcome::crashed("agent terminated by a signal")
                },
            },
        };
        Ok(outcome)
    }

    async fn launch_batch(&self, requests: Vec<ExecutionRequest>) -> DomainResult<()> {
        let sink = self.sink.clone().ok_or_else(|| {
            DomainError::Config("launch mode requires a plan to report into".to_string())
        })?;

        // A relaunched item must not report the previous attempt's outcome.
        {
            let mut outcomes = self.outcomes.write().await;
            for request in &requests {
                outcomes.remove(&request.item_id);
            }
        }

        for request in requests {
            let runner = self.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                let item_id = request.item_id.clone();
                let outcome = runner.run(request).await.unwrap_or_else(|err| {
                    warn!(item_id = %item_id, error = %err, "launched agent failed to start");
                    ExecutionOutcome::crashed(err.to_string())
                });
                let status = if outcome.success {
                    ItemStatus::Complete
                } else {
                    ItemStatus::Failed
                };
                runner
                    .outcomes
                    .write()
                    .await
                    .insert(item_id.clone(), outcome);

                let written = tokio::task::spawn_blocking(move || {
                    sink.store.set_item_status(sink.kind, &item_id, status)
                })
                .await;
                match written {
                    Ok(Ok(())) => info!(status = %status, "launched item finished"),
                    Ok(Err(err)) => error!(error = %err, "failed to report item status"),
                    Err(err) => error!(error = %err, "status writer panicked"),
                }
            });
        }
        Ok(())
    }

    async fn outcome(&self, item_id: &str) -> Option<ExecutionOutcome> {
        self.outcomes.read().await.get(item_id).cloned()
    }
}
