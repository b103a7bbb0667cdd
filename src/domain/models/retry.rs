//! Retry bookkeeping persisted in `.retry-state.json`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::gate::GateResults;

/// Version written into `.retry-state.json`.
pub const RETRY_STATE_VERSION: &str = "1.0";

/// Classification of why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Timeout,
    ExitCode,
    QualityGate,
    ProcessCrash,
    Unknown,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::ExitCode => "exit_code",
            Self::QualityGate => "quality_gate",
            Self::ProcessCrash => "process_crash",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub attempt: u32,
    pub agent: String,
    pub error_type: ErrorType,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_gate_results: Option<GateResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_excerpt: Option<String>,
    #[serde(default)]
    pub suggested_fixes: Vec<String>,
}

/// Retry state of one work item. Created on first failure.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RetryState {
    pub current_attempt: u32,
    #[serde(default)]
    pub failures: Vec<FailureRecord>,
    #[serde(default)]
    pub last_agent: Option<String>,
    #[serde(default)]
    pub exhausted: bool,
}

impl RetryState {
    pub fn last_failure(&self) -> Option<&FailureRecord> {
        self.failures.last()
    }

    /// Agents that have already attempted this item, in first-use order.
    pub fn agents_tried(&self) -> Vec<&str> {
        let mut agents: Vec<&str> = Vec::new();
        for failure in &self.failures {
            if !agents.contains(&failure.agent.as_str()) {
                agents.push(failure.agent.as_str());
            }
        }
        agents
    }
}

/// The whole `.retry-state.json` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStateDocument {
    pub version: String,
    #[serde(default)]
    pub stories: BTreeMap<String, RetryState>,
}

impl Default for RetryStateDocument {
    fn default() -> Self {
        Self {
            version: RETRY_STATE_VERSION.to_string(),
            stories: BTreeMap::new(),
        }
    }
}

/// Inputs to `RetryManager::record_failure`.
#[derive(Debug, Clone, Default)]
pub struct FailureDetails {
    pub error_type: Option<ErrorType>,
    pub message: String,
    pub output: Option<String>,
    pub exit_code: Option<i32>,
    pub gate_results: Option<GateResults>,
}

impl FailureDetails {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type: Some(error_type),
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_gate_results(mut self, results: GateResults) -> Self {
        self.gate_results = Some(results);
        self
    }

    pub fn kind(&self) -> ErrorType {
        self.error_type.unwrap_or(ErrorType::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(attempt: u32, agent: &str) -> FailureRecord {
        FailureRecord {
            attempt,
            agent: agent.to_string(),
            error_type: ErrorType::ExitCode,
            error_message: "boom".to_string(),
            timestamp: Utc::now(),
            quality_gate_results: None,
            exit_code: Some(1),
            output_excerpt: None,
            suggested_fixes: vec![],
        }
    }

    #[test]
    fn test_agents_tried_is_deduplicated_in_order() {
        let state = RetryState {
            current_attempt: 3,
            failures: vec![failure(1, "claude"), failure(2, "codex"), failure(3, "claude")],
            last_agent: Some("claude".into()),
            exhausted: false,
        };
        assert_eq!(state.agents_tried(), vec!["claude", "codex"]);
    }

    #[test]
    fn test_error_type_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorType::ProcessCrash).unwrap(),
            "\"process_crash\""
        );
        assert_eq!(ErrorType::QualityGate.to_string(), "quality_gate");
    }
}
