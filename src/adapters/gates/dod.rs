//! Definition-of-Done judge derived from gate outputs.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{failed_gates, DodCheckResult, DodRequest};
use crate::domain::ports::DodGate;

/// Passes iff every quality gate passed and any AI verification passed
/// without detecting skeleton code.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateOutputsDodGate;

#[async_trait]
impl DodGate for GateOutputsDodGate {
    async fn check(&self, request: DodRequest) -> DomainResult<DodCheckResult> {
        let mut result = DodCheckResult {
            passed: true,
            ..DodCheckResult::default()
        };

        for name in failed_gates(&request.gate_results) {
            result.errors.push(format!("quality gate '{name}' failed"));
            result
                .suggestions
                .push(format!("Fix the failures reported by '{name}'"));
        }
        if request.gate_results.is_empty() {
            result.warnings.push("no quality gates ran".to_string());
        }

        match &request.ai_verification {
            Some(verification) => {
                if !verification.passed {
                    result.errors.push("AI verification failed".to_string());
                    result.errors.extend(verification.issues.iter().cloned());
                }
                if verification.skeleton_detected {
                    result.errors.push("skeleton code detected".to_string());
                    result
                        .suggestions
                        .push("Replace placeholder code with a complete implementation".to_string());
                }
            }
            None => result.warnings.push("AI verification skipped".to_string()),
        }
        if request.changed_files.is_empty() {
            result.warnings.push("no changed files reported".to_string());
        }

        result.passed = result.errors.is_empty();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{AiVerificationResult, GateResults, QualityGateResult};

    #[tokio::test]
    async fn test_passes_with_warnings_when_nothing_ran() {
        let result = GateOutputsDodGate
            .check(DodRequest {
                item_id: "s1".into(),
                ..DodRequest::default()
            })
            .await
            .unwrap();
        assert!(result.passed);
        assert_eq!(result.warnings.len(), 3);
    }

    #[tokio::test]
    async fn test_failed_gate_and_skeleton_fail() {
        let mut gates = GateResults::new();
        gates.insert("tests".into(), QualityGateResult::fail("boom"));
        let result = GateOutputsDodGate
            .check(DodRequest {
                item_id: "s1".into(),
                gate_results: gates,
                ai_verification: Some(AiVerificationResult {
                    passed: true,
                    issues: vec![],
                    skeleton_detected: true,
                }),
                changed_files: vec!["src/lib.rs".into()],
            })
            .await
            .unwrap();
        assert!(!result.passed);
        assert_eq!(
            result.errors,
            vec!["quality gate 'tests' failed", "skeleton code detected"]
        );
        assert!(result.warnings.is_empty());
    }
}
