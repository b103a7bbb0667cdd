//! Configuration precedence: defaults, project YAML, local YAML, environment.

use std::fs;

use cascade::domain::models::{ExecutorStrategy, LockBackend};
use cascade::infrastructure::config::ConfigLoader;
use tempfile::TempDir;

fn project(config_yaml: &str) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = dir.path().join(".cascade");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(config_dir.join("config.yaml"), config_yaml).unwrap();
    dir
}

#[test]
fn test_env_overrides_yaml() {
    let dir = project("executor:\n  max_concurrency: 3\n  strategy: concurrent\n");

    temp_env::with_vars(
        [
            ("CASCADE_EXECUTOR__MAX_CONCURRENCY", Some("7")),
            ("CASCADE_EXECUTOR__STRATEGY", Some("polling")),
            ("CASCADE_LOCKING__BACKEND", Some("pid_file")),
        ],
        || {
            let config = ConfigLoader::load_from_dir(dir.path()).unwrap();
            assert_eq!(config.executor.max_concurrency, 7);
            assert_eq!(config.executor.strategy, ExecutorStrategy::Polling);
            assert_eq!(config.locking.backend, LockBackend::PidFile);
        },
    );
}

#[test]
fn test_yaml_applies_without_env() {
    let dir = project(
        "retry:\n  max_retries: 5\n  agent_chain: [codex]\nagents:\n  commands:\n    codex:\n      program: codex\n      args: [exec]\n",
    );

    temp_env::with_vars_unset(["CASCADE_RETRY__MAX_RETRIES"], || {
        let config = ConfigLoader::load_from_dir(dir.path()).unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.agent_chain, vec!["codex"]);
        assert_eq!(config.agents.commands["codex"].args, vec!["exec"]);
        assert!(config.agents.commands.contains_key("claude"));
    });
}

#[test]
fn test_invalid_env_value_is_rejected() {
    let dir = project("logging:\n  level: info\n");

    temp_env::with_var("CASCADE_EXECUTOR__MAX_CONCURRENCY", Some("0"), || {
        let err = ConfigLoader::load_from_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("max_concurrency"));
    });
}

#[test]
fn test_load_from_file_ignores_project_layers() {
    let dir = project("executor:\n  max_concurrency: 3\n");
    let standalone = dir.path().join("standalone.yaml");
    fs::write(&standalone, "executor:\n  batch_timeout_secs: 42\n").unwrap();

    let config = ConfigLoader::load_from_file(&standalone).unwrap();
    assert_eq!(config.executor.batch_timeout_secs, 42);
    assert_ne!(config.executor.max_concurrency, 0);
}
