//! Turns a failed attempt into an error type and a short list of suggested
//! fixes.

use std::sync::LazyLock;

use regex::Regex;

use crate::domain::models::{failed_gates, ErrorType, ExecutionOutcome, GateResults};

/// At most this many fixes are suggested per failure.
pub const MAX_SUGGESTED_FIXES: usize = 5;

struct FixPattern {
    regex: Regex,
    fixes: &'static [&'static str],
}

const PATTERN_TABLE: &[(&str, &[&str])] = &[
    (
        r"(?i)(ModuleNotFoundError|ImportError|no module named|cannot find module|unresolved import|could not resolve)",
        &[
            "Check that the imported module exists and the import path is correct",
            "Install or declare the missing dependency",
        ],
    ),
    (
        r"(?i)(TypeError|type error|mismatched types|is not assignable to|expected type)",
        &[
            "Check argument and return types against the declared signatures",
            "Run the type checker locally and fix the reported errors",
        ],
    ),
    (
        r"(?i)(SyntaxError|syntax error|unexpected token|unexpected EOF|parse error)",
        &[
            "Fix the syntax error at the reported location",
            "Check for unbalanced brackets, braces or quotes",
        ],
    ),
    (
        r"(?i)(AssertionError|assertion failed|tests? failed|\bFAILED\b|expected .+ (but )?(got|received))",
        &[
            "Review the failing assertions and compare expected with actual values",
            "Run the failing tests in isolation before changing more code",
        ],
    ),
    (
        r"(?i)(timed out|timeout|deadline exceeded)",
        &[
            "Split the work into smaller steps that finish within the time limit",
            "Look for hanging processes or unbounded loops",
        ],
    ),
    (
        r"(?i)(permission denied|EACCES|EPERM|operation not permitted|access is denied)",
        &[
            "Check file permissions and ownership",
            "Avoid writing outside the project directory",
        ],
    ),
    (
        r"(?i)(NotImplementedError|not implemented|unimplemented!|todo!\(|\bTODO\b|\bFIXME\b|placeholder|skeleton)",
        &["Replace placeholder or skeleton code with a complete implementation"],
    ),
];

static PATTERNS: LazyLock<Vec<FixPattern>> = LazyLock::new(|| {
    PATTERN_TABLE
        .iter()
        .filter_map(|(pattern, fixes)| {
            Regex::new(pattern).ok().map(|regex| FixPattern { regex, fixes })
        })
        .collect()
});

fn error_type_fixes(error_type: ErrorType, gate_results: Option<&GateResults>) -> Vec<String> {
    match error_type {
        ErrorType::Timeout => {
            vec!["Reduce the scope of the change so it completes before the timeout".to_string()]
        }
        ErrorType::ProcessCrash => {
            vec!["Check the agent process for crashes or resource exhaustion".to_string()]
        }
        ErrorType::ExitCode => {
            vec!["Inspect the command output for the first reported error".to_string()]
        }
        ErrorType::QualityGate => gate_results
            .map(|results| {
                failed_gates(results)
                    .into_iter()
                    .map(|name| format!("Fix the failures reported by the '{name}' check"))
                    .collect()
            })
            .unwrap_or_default(),
        ErrorType::Unknown => Vec::new(),
    }
}

/// Suggested fixes for a failure: pattern matches over the message, output
/// and gate errors first, then fixes specific to the error type.
/// Deduplicated and capped at [`MAX_SUGGESTED_FIXES`].
pub fn suggest_fixes(
    error_type: ErrorType,
    message: &str,
    output: Option<&str>,
    gate_results: Option<&GateResults>,
) -> Vec<String> {
    let mut haystack = String::from(message);
    if let Some(output) = output {
        haystack.push('\n');
        haystack.push_str(output);
    }
    for result in gate_results.into_iter().flat_map(|r| r.values()) {
        if let Some(summary) = &result.error_summary {
            haystack.push('\n');
            haystack.push_str(summary);
        }
        for error in result.structured_errors.iter().flatten() {
            haystack.push('\n');
            haystack.push_str(error);
        }
    }

    let mut fixes: Vec<String> = Vec::new();
    let candidates = PATTERNS
        .iter()
        .filter(|pattern| pattern.regex.is_match(&haystack))
        .flat_map(|pattern| pattern.fixes.iter().map(|fix| (*fix).to_string()))
        .chain(error_type_fixes(error_type, gate_results));
    for fix in candidates {
        if fixes.len() == MAX_SUGGESTED_FIXES {
            break;
        }
        if !fixes.contains(&fix) {
            fixes.push(fix);
        }
    }
    fixes
}

/// Error type of a failed execution that never reached the gates.
pub fn classify_outcome(outcome: &ExecutionOutcome) -> ErrorType {
    if outcome.timed_out {
        ErrorType::Timeout
    } else if outcome.crashed {
        ErrorType::ProcessCrash
    } else if outcome.exit_code.is_some_and(|code| code != 0) {
        ErrorType::ExitCode
    } else {
        ErrorType::Unknown
    }
}

/// The last `max_chars` characters of `output`, prefixed with an ellipsis
/// when truncated.
pub fn output_excerpt(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_string();
    }
    let tail: String = output.chars().skip(total - max_chars).collect();
    format!("...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::QualityGateResult;

    #[test]
    fn test_every_pattern_compiles() {
        assert_eq!(PATTERNS.len(), PATTERN_TABLE.len());
    }

    #[test]
    fn test_import_error_suggests_dependency_fix() {
        let fixes = suggest_fixes(
            ErrorType::ExitCode,
            "exit status 1",
            Some("ModuleNotFoundError: No module named 'requests'"),
            None,
        );
        assert_eq!(
            fixes[0],
            "Check that the imported module exists and the import path is correct"
        );
        assert!(fixes.contains(&"Inspect the command output for the first reported error".to_string()));
    }

    #[test]
    fn test_fixes_are_capped_and_unique() {
        let fixes = suggest_fixes(
            ErrorType::QualityGate,
            "SyntaxError and TypeError and ImportError and AssertionError and permission denied",
            None,
            None,
        );
        assert_eq!(fixes.len(), MAX_SUGGESTED_FIXES);
        let mut unique = fixes.clone();
        unique.dedup();
        assert_eq!(unique.len(), fixes.len());
    }

    #[test]
    fn test_gate_errors_are_scanned_and_named() {
        let mut gates = GateResults::new();
        gates.insert("tests".into(), QualityGateResult::fail("3 tests failed"));
        gates.insert("lint".into(), QualityGateResult::pass());

        let fixes = suggest_fixes(ErrorType::QualityGate, "quality gate failed", None, Some(&gates));
        assert!(fixes[0].starts_with("Review the failing assertions"));
        assert!(fixes.contains(&"Fix the failures reported by the 'tests' check".to_string()));
        assert!(!fixes.iter().any(|f| f.contains("'lint'")));
    }

    #[test]
    fn test_skeleton_markers() {
        let fixes = suggest_fixes(ErrorType::Unknown, "found todo!() in handler", None, None);
        assert_eq!(
            fixes,
            vec!["Replace placeholder or skeleton code with a complete implementation"]
        );
    }

    #[test]
    fn test_classify_outcome() {
        assert_eq!(classify_outcome(&ExecutionOutcome::timed_out("slow")), ErrorType::Timeout);
        assert_eq!(classify_outcome(&ExecutionOutcome::crashed("sigkill")), ErrorType::ProcessCrash);
        assert_eq!(classify_outcome(&ExecutionOutcome::failed(2, "bad")), ErrorType::ExitCode);
    }

    #[test]
    fn test_output_excerpt_keeps_tail() {
        assert_eq!(output_excerpt("short", 10), "short");
        assert_eq!(output_excerpt("abcdefghij", 4), "...ghij");
        assert_eq!(output_excerpt("ééééé", 2), "...éé");
    }
}
