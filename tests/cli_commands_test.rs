//! Command handlers against a temporary project directory.

mod common;

use std::sync::Arc;

use cascade::application::RunCoordinator;
use cascade::cli::commands::{batches, locks, retry, stage, status};
use cascade::cli::Workspace;
use cascade::domain::models::{ContractRegistry, ExecutionStage, PlanKind, StageStatus};
use cascade::services::{RetryManager, StageStateMachine};

use common::{fast_config, items, save_plan, ScriptedRunner};

fn workspace() -> (tempfile::TempDir, Workspace) {
    let dir = tempfile::tempdir().unwrap();
    let workspace = Workspace::new(dir.path(), fast_config());
    (dir, workspace)
}

#[test]
fn test_read_only_commands_need_a_plan_or_state() {
    let (_dir, workspace) = workspace();
    assert!(status::handle_status(&workspace, true).is_ok());
    assert!(batches::handle_batches(&workspace, false, true).is_err());
    assert!(stage::handle_show(&workspace, true).is_err());
    assert!(retry::handle_show(&workspace, true).is_ok());
    assert!(locks::handle_cleanup(&workspace, Some(0), true).is_ok());
}

#[test]
fn test_stage_and_retry_commands_after_failed_run() {
    let (_dir, workspace) = workspace();
    save_plan(&workspace.store, PlanKind::Feature, items(&[("a", &[]), ("b", &["a"])]));
    batches::handle_batches(&workspace, true, true).unwrap();

    let runner = Arc::new(ScriptedRunner::new().always_fail("b"));
    let coordinator = RunCoordinator::new(workspace.config.clone(), workspace.store.clone(), runner);
    let summary = tokio_test::block_on(coordinator.run()).unwrap();
    assert_eq!(summary.failed, vec!["b"]);

    stage::handle_show(&workspace, true).unwrap();
    stage::handle_resume_from(&workspace, ExecutionStage::Execute, true).unwrap();
    let machine = StageStateMachine::load(Arc::new(ContractRegistry::standard()), workspace.store.clone())
        .unwrap()
        .unwrap();
    assert_eq!(machine.status(ExecutionStage::Execute), StageStatus::Pending);
    assert_eq!(machine.status(ExecutionStage::ReadyCheck), StageStatus::Completed);

    retry::handle_reset(&workspace, Some("b".to_string()), false, true).unwrap();
    let retries = RetryManager::load(
        workspace.config.retry.clone(),
        "claude",
        workspace.store.clone(),
    )
    .unwrap();
    assert_eq!(retries.attempts("b"), 0);
}
