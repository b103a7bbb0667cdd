use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid max_concurrency: {0}. Must be at least 1")]
    InvalidMaxConcurrency(usize),

    #[error("Invalid max_retries: {0}. Cannot be 0")]
    InvalidMaxRetries(u32),

    #[error("Invalid retry delays: base_delay_ms ({0}) must not exceed max_delay_ms ({1})")]
    InvalidRetryDelay(u64, u64),

    #[error("Invalid lock timeout: {0}s. Must be at least 1")]
    InvalidLockTimeout(u64),

    #[error(
        "Invalid lock backoff: initial_backoff_ms ({0}) must not exceed max_backoff_ms ({1})"
    )]
    InvalidLockBackoff(u64, u64),

    #[error("Invalid poll_interval_ms: {0}. Must be positive")]
    InvalidPollInterval(u64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for the current directory.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .cascade/config.yaml (project config)
    /// 3. .cascade/local.yaml (project local overrides, optional)
    /// 4. Environment variables (CASCADE_* prefix, `__` for nesting)
    pub fn load() -> Result<Config> {
        Self::load_from_dir(Path::new("."))
    }

    /// Same as [`ConfigLoader::load`] with the project rooted at `dir`.
    pub fn load_from_dir(dir: &Path) -> Result<Config> {
        let config_dir = dir.join(".cascade");
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(config_dir.join("config.yaml")))
            .merge(Yaml::file(config_dir.join("local.yaml")))
            .merge(Env::prefixed("CASCADE_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let executor = &config.executor;
        if executor.max_concurrency == 0 {
            return Err(ConfigError::InvalidMaxConcurrency(executor.max_concurrency));
        }
        if executor.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidPollInterval(executor.poll_interval_ms));
        }

        let retry = &config.retry;
        if retry.max_retries == 0 {
            return Err(ConfigError::InvalidMaxRetries(retry.max_retries));
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(ConfigError::InvalidRetryDelay(
                retry.base_delay_ms,
                retry.max_delay_ms,
            ));
        }

        let locking = &config.locking;
        if locking.timeout_secs == 0 {
            return Err(ConfigError::InvalidLockTimeout(locking.timeout_secs));
        }
        if locking.initial_backoff_ms > locking.max_backoff_ms {
            return Err(ConfigError::InvalidLockBackoff(
                locking.initial_backoff_ms,
                locking.max_backoff_ms,
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.state.root.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "state root cannot be empty".to_string(),
            ));
        }

        for (name, command) in &config.agents.commands {
            if command.program.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "agent '{name}' program cannot be empty"
                )));
            }
        }
        for agent in std::iter::once(&executor.default_agent).chain(&retry.agent_chain) {
            if !config.agents.commands.contains_key(agent) {
                return Err(ConfigError::ValidationFailed(format!(
                    "agent '{agent}' has no entry under agents.commands"
                )));
            }
        }

        for gate in &config.gates.checks {
            if gate.name.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "quality gate name cannot be empty".to_string(),
                ));
            }
            if gate.command.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "quality gate '{}' command cannot be empty",
                    gate.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::{ExecutorStrategy, GateCommand, LockBackend};

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        ConfigLoader::validate(&config).expect("Default config should be valid");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
executor:
  strategy: polling
  max_concurrency: 2
  stop_on_first_failure: true
retry:
  max_retries: 5
  agent_chain: [codex]
locking:
  backend: pid_file
agents:
  commands:
    claude:
      program: claude
      args: ['--print']
    codex:
      program: codex
gates:
  checks:
    - name: tests
      command: cargo test
";

        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");

        assert_eq!(config.executor.strategy, ExecutorStrategy::Polling);
        assert_eq!(config.executor.max_concurrency, 2);
        assert!(config.executor.stop_on_first_failure);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 5_000);
        assert_eq!(config.locking.backend, LockBackend::PidFile);
        assert_eq!(config.gates.checks[0].name, "tests");

        ConfigLoader::validate(&config).expect("Parsed config should be valid");
    }

    #[test]
    fn test_validate_zero_concurrency() {
        let mut config = Config::default();
        config.executor.max_concurrency = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMaxConcurrency(0))
        ));
    }

    #[test]
    fn test_validate_zero_max_retries() {
        let mut config = Config::default();
        config.retry.max_retries = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMaxRetries(0))
        ));
    }

    #[test]
    fn test_validate_base_delay_above_max() {
        let mut config = Config::default();
        config.retry.base_delay_ms = 90_000;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidRetryDelay(90_000, 60_000))
        ));
    }

    #[test]
    fn test_validate_zero_lock_timeout() {
        let mut config = Config::default();
        config.locking.timeout_secs = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLockTimeout(0))
        ));
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();

        match ConfigLoader::validate(&config).unwrap_err() {
            ConfigError::InvalidLogLevel(level) => assert_eq!(level, "invalid"),
            other => panic!("Expected InvalidLogLevel error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogFormat(_))
        ));
    }

    #[test]
    fn test_validate_unknown_chain_agent() {
        let mut config = Config::default();
        config.retry.agent_chain = vec!["ghost".to_string()];
        match ConfigLoader::validate(&config).unwrap_err() {
            ConfigError::ValidationFailed(msg) => assert!(msg.contains("ghost")),
            other => panic!("Expected ValidationFailed error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_empty_gate_command() {
        let mut config = Config::default();
        config.gates.checks.push(GateCommand {
            name: "lint".to_string(),
            command: "  ".to_string(),
        });
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_hierarchical_merging() {
        let temp = tempfile::tempdir().unwrap();
        let config_dir = temp.path().join(".cascade");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.yaml"),
            "executor:\n  max_concurrency: 3\nlogging:\n  level: info\n  format: json\n",
        )
        .unwrap();
        std::fs::write(
            config_dir.join("local.yaml"),
            "executor:\n  max_concurrency: 6\nlogging:\n  level: debug\n",
        )
        .unwrap();

        let config = ConfigLoader::load_from_dir(temp.path()).unwrap();

        assert_eq!(config.executor.max_concurrency, 6, "Override should win");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(
            config.logging.format, "json",
            "Base value should persist when not overridden"
        );
    }
}
