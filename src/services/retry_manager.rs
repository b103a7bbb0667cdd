//! Per-item retry bookkeeping: authorization, backoff, agent rotation and the
//! failure context handed to the next attempt.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    ErrorType, FailureDetails, FailureRecord, RetryConfig, RetryState, RetryStateDocument,
};
use crate::infrastructure::state::{StateStore, RETRY_STATE_FILE};
use crate::services::failure_classifier::{output_excerpt, suggest_fixes};

/// Display summary of one tracked item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryItemSummary {
    pub item_id: String,
    pub attempts: u32,
    pub exhausted: bool,
    pub last_error_type: Option<ErrorType>,
    pub last_error: Option<String>,
    pub agents: Vec<String>,
}

/// Display summary of all retry state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub max_retries: u32,
    pub tracked: usize,
    pub exhausted: usize,
    pub total_failures: usize,
    pub items: Vec<RetryItemSummary>,
}

pub struct RetryManager {
    config: RetryConfig,
    default_agent: String,
    states: Mutex<BTreeMap<String, RetryState>>,
    store: Option<StateStore>,
}

impl std::fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryManager")
            .field("max_retries", &self.config.max_retries)
            .field("default_agent", &self.default_agent)
            .field("persistent", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl RetryManager {
    /// In-memory manager with no prior state.
    pub fn new(config: RetryConfig, default_agent: impl Into<String>) -> Self {
        Self {
            config,
            default_agent: default_agent.into(),
            states: Mutex::new(BTreeMap::new()),
            store: None,
        }
    }

    /// Manager backed by `.retry-state.json`, seeded from its current contents.
    pub fn load(
        config: RetryConfig,
        default_agent: impl Into<String>,
        store: StateStore,
    ) -> DomainResult<Self> {
        let doc = store.load_retry_state()?;
        Ok(Self {
            config,
            default_agent: default_agent.into(),
            states: Mutex::new(doc.stories),
            store: Some(store),
        })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn default_agent(&self) -> &str {
        &self.default_agent
    }

    fn states(&self) -> MutexGuard<'_, BTreeMap<String, RetryState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write one item's state (or its removal) through to disk.
    fn persist(&self, item_id: &str, state: Option<&RetryState>) -> DomainResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store.update_json(RETRY_STATE_FILE, |doc: &mut RetryStateDocument| {
            match state {
                Some(state) => {
                    doc.stories.insert(item_id.to_string(), state.clone());
                }
                None => {
                    doc.stories.remove(item_id);
                }
            }
            Ok(())
        })
    }

    pub fn state(&self, item_id: &str) -> Option<RetryState> {
        self.states().get(item_id).cloned()
    }

    pub fn attempts(&self, item_id: &str) -> u32 {
        self.states().get(item_id).map_or(0, |s| s.current_attempt)
    }

    pub fn is_exhausted(&self, item_id: &str) -> bool {
        self.states().get(item_id).is_some_and(|s| s.exhausted)
    }

    /// Whether another attempt is allowed.
    pub fn can_retry(&self, item_id: &str) -> bool {
        self.states()
            .get(item_id)
            .is_none_or(|s| !s.exhausted && s.current_attempt < self.config.max_retries)
    }

    /// Record a failed attempt.
    ///
    /// # Errors
    ///
    /// `RetryExhausted` when the item has no attempts left; the stored state
    /// is not changed. Persistence failures propagate.
    pub fn record_failure(
        &self,
        item_id: &str,
        agent: &str,
        details: FailureDetails,
    ) -> DomainResult<FailureRecord> {
        // One task owns an item at a time, so the entry cannot change between
        // this read and the insert below; the map stays unlocked during I/O.
        let mut state = self.states().get(item_id).cloned().unwrap_or_default();
        if state.exhausted || state.current_attempt >= self.config.max_retries {
            return Err(DomainError::RetryExhausted {
                id: item_id.to_string(),
                attempts: state.current_attempt,
            });
        }

        let error_type = details.kind();
        let record = FailureRecord {
            attempt: state.current_attempt + 1,
            agent: agent.to_string(),
            error_type,
            error_message: details.message.clone(),
            timestamp: Utc::now(),
            suggested_fixes: suggest_fixes(
                error_type,
                &details.message,
                details.output.as_deref(),
                details.gate_results.as_ref(),
            ),
            quality_gate_results: details.gate_results,
            exit_code: details.exit_code,
            output_excerpt: details
                .output
                .as_deref()
                .filter(|output| !output.is_empty())
                .map(|output| output_excerpt(output, self.config.output_excerpt_chars)),
        };

        state.current_attempt = record.attempt;
        state.last_agent = Some(agent.to_string());
        state.exhausted = state.current_attempt >= self.config.max_retries;
        state.failures.push(record.clone());

        self.persist(item_id, Some(&state))?;
        if state.exhausted {
            warn!(
                item_id,
                attempt = record.attempt,
                error_type = %error_type,
                "retries exhausted"
            );
        } else {
            info!(
                item_id,
                attempt = record.attempt,
                max_retries = self.config.max_retries,
                error_type = %error_type,
                "failure recorded"
            );
        }
        self.states().insert(item_id.to_string(), state);
        Ok(record)
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay_ms;
        let delay_ms = if self.config.exponential_backoff {
            let exponent = attempt.saturating_sub(1).min(63);
            base.saturating_mul(1u64 << exponent)
        } else {
            base
        };
        Duration::from_millis(delay_ms.min(self.config.max_delay_ms))
    }

    /// Backoff before the next attempt of `item_id`.
    pub fn get_retry_delay(&self, item_id: &str) -> Duration {
        self.compute_delay(self.attempts(item_id).max(1))
    }

    /// Agent for the next attempt: the first agent of the chain not yet tried
    /// on this item, otherwise the default agent.
    pub fn get_retry_agent(&self, item_id: &str) -> String {
        let states = self.states();
        let Some(state) = states.get(item_id) else {
            return self.default_agent.clone();
        };
        let tried = state.agents_tried();
        self.config
            .agent_chain
            .iter()
            .find(|agent| !tried.contains(&agent.as_str()))
            .cloned()
            .unwrap_or_else(|| self.default_agent.clone())
    }

    /// Prefix `original_prompt` with the context of the last failure. Returns
    /// the prompt unchanged when the item has not failed.
    pub fn build_retry_prompt(&self, item_id: &str, original_prompt: &str) -> String {
        let Some(failure) = self.state(item_id).and_then(|s| s.last_failure().cloned()) else {
            return original_prompt.to_string();
        };

        let mut block = String::from("## Previous Attempt Failed\n\n");
        let _ = writeln!(
            block,
            "Attempt {} of {} failed ({}) using agent `{}`.\n",
            failure.attempt, self.config.max_retries, failure.error_type, failure.agent
        );
        let _ = writeln!(block, "**Error:** {}\n", failure.error_message);
        if let Some(code) = failure.exit_code {
            let _ = writeln!(block, "**Exit code:** {code}\n");
        }
        if let Some(gates) = &failure.quality_gate_results {
            block.push_str("**Quality gates:**\n");
            for (name, result) in gates {
                let verdict = if result.passed { "passed" } else { "FAILED" };
                match &result.error_summary {
                    Some(summary) if !result.passed => {
                        let _ = writeln!(block, "- {name}: {verdict} - {summary}");
                    }
                    _ => {
                        let _ = writeln!(block, "- {name}: {verdict}");
                    }
                }
            }
            block.push('\n');
        }
        if let Some(excerpt) = &failure.output_excerpt {
            let _ = writeln!(block, "**Output (tail):**\n```text\n{excerpt}\n```\n");
        }
        if !failure.suggested_fixes.is_empty() {
            block.push_str("**Suggested fixes:**\n");
            for (i, fix) in failure.suggested_fixes.iter().enumerate() {
                let _ = writeln!(block, "{}. {fix}", i + 1);
            }
            block.push('\n');
        }
        block.push_str("Address the problems above before continuing.\n\n---\n\n");
        block.push_str(original_prompt);
        block
    }

    /// Clear retry state after a successful attempt.
    pub fn record_success(&self, item_id: &str) -> DomainResult<()> {
        if !self.states().contains_key(item_id) {
            return Ok(());
        }
        self.persist(item_id, None)?;
        self.states().remove(item_id);
        debug!(item_id, "retry state cleared after success");
        Ok(())
    }

    /// Forget one item's retry history. Returns whether there was any.
    pub fn reset(&self, item_id: &str) -> DomainResult<bool> {
        if !self.states().contains_key(item_id) {
            return Ok(false);
        }
        self.persist(item_id, None)?;
        self.states().remove(item_id);
        info!(item_id, "retry state reset");
        Ok(true)
    }

    /// Forget every item's retry history. Returns how many were cleared.
    pub fn reset_all(&self) -> DomainResult<usize> {
        let mut states = self.states();
        if let Some(store) = &self.store {
            store.save_retry_state(&RetryStateDocument::default())?;
        }
        let cleared = states.len();
        states.clear();
        info!(cleared, "all retry state reset");
        Ok(cleared)
    }

    pub fn snapshot(&self) -> RetryStateDocument {
        RetryStateDocument {
            stories: self.states().clone(),
            ..RetryStateDocument::default()
        }
    }

    pub fn summary(&self) -> RetrySummary {
        let states = self.states();
        let items: Vec<RetryItemSummary> = states
            .iter()
            .map(|(id, state)| RetryItemSummary {
                item_id: id.clone(),
                attempts: state.current_attempt,
                exhausted: state.exhausted,
                last_error_type: state.last_failure().map(|f| f.error_type),
                last_error: state.last_failure().map(|f| f.error_message.clone()),
                agents: state.agents_tried().into_iter().map(String::from).collect(),
            })
            .collect();
        RetrySummary {
            max_retries: self.config.max_retries,
            tracked: items.len(),
            exhausted: items.iter().filter(|i| i.exhausted).count(),
            total_failures: states.values().map(|s| s.failures.len()).sum(),
            items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{GateResults, LockConfig, QualityGateResult};
    use crate::infrastructure::locking::LockManager;

    fn config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            agent_chain: vec!["codex".into(), "gemini".into()],
            ..RetryConfig::default()
        }
    }

    fn fail(manager: &RetryManager, id: &str, agent: &str) -> DomainResult<FailureRecord> {
        manager.record_failure(id, agent, FailureDetails::new(ErrorType::ExitCode, "exit 1"))
    }

    #[test]
    fn test_exhaustion_after_exactly_max_retries() {
        let manager = RetryManager::new(config(3), "claude");
        assert!(manager.can_retry("s1"));

        for expected in 1..=3 {
            let record = fail(&manager, "s1", "claude").unwrap();
            assert_eq!(record.attempt, expected);
        }
        assert!(manager.is_exhausted("s1"));
        assert!(!manager.can_retry("s1"));

        let err = fail(&manager, "s1", "claude").unwrap_err();
        assert!(matches!(err, DomainError::RetryExhausted { attempts: 3, .. }));
        assert_eq!(manager.attempts("s1"), 3);
        assert_eq!(manager.state("s1").unwrap().failures.len(), 3);
    }

    #[test]
    fn test_backoff_growth_is_clamped() {
        let manager = RetryManager::new(RetryConfig::default(), "claude");
        let delays: Vec<u64> = (1..=5)
            .map(|n| manager.compute_delay(n).as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60]);
        assert_eq!(manager.compute_delay(200), Duration::from_secs(60));
    }

    #[test]
    fn test_flat_backoff() {
        let manager = RetryManager::new(
            RetryConfig {
                exponential_backoff: false,
                ..RetryConfig::default()
            },
            "claude",
        );
        assert_eq!(manager.compute_delay(4), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_delay_follows_recorded_attempts() {
        let manager = RetryManager::new(RetryConfig::default(), "claude");
        assert_eq!(manager.get_retry_delay("s1"), Duration::from_secs(5));
        fail(&manager, "s1", "claude").unwrap();
        fail(&manager, "s1", "claude").unwrap();
        assert_eq!(manager.get_retry_delay("s1"), Duration::from_secs(10));
    }

    #[test]
    fn test_agent_rotation_skips_tried_agents() {
        let manager = RetryManager::new(config(5), "claude");
        assert_eq!(manager.get_retry_agent("s1"), "claude");

        fail(&manager, "s1", "claude").unwrap();
        assert_eq!(manager.get_retry_agent("s1"), "codex");

        fail(&manager, "s1", "codex").unwrap();
        assert_eq!(manager.get_retry_agent("s1"), "gemini");

        fail(&manager, "s1", "gemini").unwrap();
        assert_eq!(manager.get_retry_agent("s1"), "claude");
    }

    #[test]
    fn test_retry_prompt_carries_failure_context() {
        let manager = RetryManager::new(config(3), "claude");
        assert_eq!(manager.build_retry_prompt("s1", "Do it"), "Do it");

        let mut gates = GateResults::new();
        gates.insert("tests".into(), QualityGateResult::fail("2 tests failed"));
        manager
            .record_failure(
                "s1",
                "claude",
                FailureDetails::new(ErrorType::QualityGate, "quality gate failed")
                    .with_output("assertion failed: left == right")
                    .with_gate_results(gates),
            )
            .unwrap();

        let prompt = manager.build_retry_prompt("s1", "Do it");
        assert!(prompt.starts_with("## Previous Attempt Failed"));
        assert!(prompt.contains("Attempt 1 of 3 failed (quality_gate)"));
        assert!(prompt.contains("- tests: FAILED - 2 tests failed"));
        assert!(prompt.contains("assertion failed: left == right"));
        assert!(prompt.contains("**Suggested fixes:**\n1. "));
        assert!(prompt.ends_with("---\n\nDo it"));
    }

    #[test]
    fn test_success_and_reset_clear_state() {
        let manager = RetryManager::new(config(3), "claude");
        fail(&manager, "a", "claude").unwrap();
        fail(&manager, "b", "claude").unwrap();
        fail(&manager, "c", "claude").unwrap();

        manager.record_success("a").unwrap();
        assert!(manager.state("a").is_none());
        assert!(manager.reset("b").unwrap());
        assert!(!manager.reset("b").unwrap());
        assert_eq!(manager.reset_all().unwrap(), 1);
        assert_eq!(manager.summary().tracked, 0);
    }

    #[test]
    fn test_summary_counts() {
        let manager = RetryManager::new(config(1), "claude");
        fail(&manager, "a", "claude").unwrap();
        let summary = manager.summary();
        assert_eq!(summary.tracked, 1);
        assert_eq!(summary.exhausted, 1);
        assert_eq!(summary.total_failures, 1);
        assert_eq!(summary.items[0].last_error_type, Some(ErrorType::ExitCode));
    }

    #[test]
    fn test_state_persists_across_managers() {
        let temp = tempfile::tempdir().unwrap();
        let store = StateStore::new(
            temp.path(),
            LockManager::new(temp.path().join("locks"), &LockConfig::default()),
        );

        let first = RetryManager::load(config(3), "claude", store.clone()).unwrap();
        fail(&first, "s1", "claude").unwrap();
        fail(&first, "s2", "claude").unwrap();
        first.record_success("s2").unwrap();

        let second = RetryManager::load(config(3), "claude", store.clone()).unwrap();
        assert_eq!(second.attempts("s1"), 1);
        assert!(second.state("s2").is_none());
        assert_eq!(store.load_retry_state().unwrap().stories.len(), 1);
    }
}
