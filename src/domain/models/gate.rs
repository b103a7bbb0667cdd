//! Results returned by the external judges consulted after an item executes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Outcome of one named quality-gate check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityGateResult {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_errors: Option<Vec<String>>,
}

impl QualityGateResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            error_summary: None,
            structured_errors: None,
        }
    }

    pub fn fail(summary: impl Into<String>) -> Self {
        Self {
            passed: false,
            error_summary: Some(summary.into()),
            structured_errors: None,
        }
    }
}

/// Quality-gate results keyed by check name.
pub type GateResults = BTreeMap<String, QualityGateResult>;

/// Names of the failed checks in `results`, in key order.
pub fn failed_gates(results: &GateResults) -> Vec<&str> {
    results
        .iter()
        .filter(|(_, r)| !r.passed)
        .map(|(name, _)| name.as_str())
        .collect()
}

/// Structured result of an AI verification pass, when one was performed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AiVerificationResult {
    pub passed: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub skeleton_detected: bool,
}

/// Everything the Definition-of-Done gate is given.
#[derive(Debug, Clone, Default)]
pub struct DodRequest {
    pub item_id: String,
    pub gate_results: GateResults,
    pub ai_verification: Option<AiVerificationResult>,
    pub changed_files: Vec<String>,
}

/// Verdict of the Definition-of-Done gate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename = "DoDCheckResult")]
pub struct DodCheckResult {
    pub passed: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}
