use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main configuration structure for cascade
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Batch executor configuration
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Retry policy configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// File locking configuration
    #[serde(default)]
    pub locking: LockConfig,

    /// State directory configuration
    #[serde(default)]
    pub state: StateConfig,

    /// External agent commands
    #[serde(default)]
    pub agents: AgentsConfig,

    /// Quality-gate commands
    #[serde(default)]
    pub gates: GatesConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which batch executor strategy to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorStrategy {
    /// One task per item under a semaphore.
    #[default]
    Concurrent,
    /// Launch the whole batch, then poll the plan for item status.
    Polling,
}

impl std::fmt::Display for ExecutorStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Concurrent => write!(f, "concurrent"),
            Self::Polling => write!(f, "polling"),
        }
    }
}

impl std::str::FromStr for ExecutorStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "concurrent" | "parallel" => Ok(Self::Concurrent),
            "polling" | "sequential" => Ok(Self::Polling),
            other => Err(format!("unknown executor strategy '{other}'")),
        }
    }
}

/// Batch executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExecutorConfig {
    /// Executor strategy
    #[serde(default)]
    pub strategy: ExecutorStrategy,

    /// Maximum items executing at once (defaults to the host CPU count)
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Whole-batch timeout in seconds
    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: u64,

    /// Per-invocation timeout for the external agent in seconds
    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,

    /// Poll interval of the polling strategy in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Stop the run after the first batch with a failed item
    #[serde(default)]
    pub stop_on_first_failure: bool,

    /// Agent used when no retry rotation applies
    #[serde(default = "default_agent")]
    pub default_agent: String,
}

fn default_max_concurrency() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

const fn default_batch_timeout_secs() -> u64 {
    3600
}

const fn default_item_timeout_secs() -> u64 {
    1800
}

const fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_agent() -> String {
    "claude".to_string()
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            strategy: ExecutorStrategy::default(),
            max_concurrency: default_max_concurrency(),
            batch_timeout_secs: default_batch_timeout_secs(),
            item_timeout_secs: default_item_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            stop_on_first_failure: false,
            default_agent: default_agent(),
        }
    }
}

impl ExecutorConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Maximum number of failed attempts recorded per item
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any retry delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Double the delay on every attempt; flat `base_delay_ms` otherwise
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,

    /// Alternate agents tried in order on retries
    #[serde(default)]
    pub agent_chain: Vec<String>,

    /// Characters of agent output kept in a failure record
    #[serde(default = "default_output_excerpt_chars")]
    pub output_excerpt_chars: usize,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    5_000
}

const fn default_max_delay_ms() -> u64 {
    60_000
}

const fn default_true() -> bool {
    true
}

const fn default_output_excerpt_chars() -> usize {
    2_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_backoff: true,
            agent_chain: Vec::new(),
            output_excerpt_chars: default_output_excerpt_chars(),
        }
    }
}

/// Which file-lock implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockBackend {
    /// OS advisory locks (`flock` on Unix, `LockFileEx` on Windows).
    #[default]
    Native,
    /// Cooperative PID marker files. No OS-level exclusion.
    PidFile,
}

/// File locking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LockConfig {
    /// Lock implementation
    #[serde(default)]
    pub backend: LockBackend,

    /// Hard timeout for acquiring a lock in seconds
    #[serde(default = "default_lock_timeout_secs")]
    pub timeout_secs: u64,

    /// First wait between acquisition attempts in milliseconds
    #[serde(default = "default_lock_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Longest wait between acquisition attempts in milliseconds
    #[serde(default = "default_lock_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Age after which an unheld lock file counts as orphaned
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

const fn default_lock_timeout_secs() -> u64 {
    30
}

const fn default_lock_initial_backoff_ms() -> u64 {
    25
}

const fn default_lock_max_backoff_ms() -> u64 {
    1_000
}

const fn default_stale_after_secs() -> u64 {
    3_600
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::default(),
            timeout_secs: default_lock_timeout_secs(),
            initial_backoff_ms: default_lock_initial_backoff_ms(),
            max_backoff_ms: default_lock_max_backoff_ms(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// State directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StateConfig {
    /// Directory holding plan and state documents
    #[serde(default = "default_state_root")]
    pub root: PathBuf,

    /// Directory for lock files (defaults to `<root>/locks`)
    #[serde(default)]
    pub locks_dir: Option<PathBuf>,
}

fn default_state_root() -> PathBuf {
    PathBuf::from(".cascade/state")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            root: default_state_root(),
            locks_dir: None,
        }
    }
}

impl StateConfig {
    pub fn locks_dir(&self) -> PathBuf {
        self.locks_dir
            .clone()
            .unwrap_or_else(|| self.root.join("locks"))
    }
}

/// How to launch one external agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// External agent commands keyed by agent name
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AgentsConfig {
    #[serde(default = "default_agent_commands")]
    pub commands: BTreeMap<String, AgentCommand>,
}

fn default_agent_commands() -> BTreeMap<String, AgentCommand> {
    let mut commands = BTreeMap::new();
    commands.insert(
        "claude".to_string(),
        AgentCommand {
            program: "claude".to_string(),
            args: vec!["--print".to_string()],
        },
    );
    commands
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            commands: default_agent_commands(),
        }
    }
}

/// One named quality-gate command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateCommand {
    pub name: String,
    /// Shell command line; a zero exit status passes the gate.
    pub command: String,
}

/// Quality-gate configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GatesConfig {
    #[serde(default)]
    pub checks: Vec<GateCommand>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files (stderr only when unset)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.executor.max_concurrency >= 1);
        assert_eq!(config.executor.strategy, ExecutorStrategy::Concurrent);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.locking.timeout(), Duration::from_secs(30));
        assert_eq!(config.state.locks_dir(), PathBuf::from(".cascade/state/locks"));
        assert!(config.agents.commands.contains_key("claude"));
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("parallel".parse::<ExecutorStrategy>(), Ok(ExecutorStrategy::Concurrent));
        assert_eq!("polling".parse::<ExecutorStrategy>(), Ok(ExecutorStrategy::Polling));
        assert!("random".parse::<ExecutorStrategy>().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"retry": {"max_retries": 5}, "locking": {"backend": "pid_file"}}"#)
                .unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 5_000);
        assert_eq!(config.locking.backend, LockBackend::PidFile);
    }
}
