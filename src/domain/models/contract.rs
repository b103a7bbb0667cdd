//! Stage contracts: what each stage needs, what it must produce, and whether
//! it may be skipped.
//!
//! The registry is an explicit value built once at startup and handed to the
//! stage state machine; nothing here is global.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::stage::{ExecutionStage, StageOutputs};

/// Predicate run against a stage's outputs on completion.
pub type AcceptanceCheck = Arc<dyn Fn(&StageOutputs) -> Result<(), String> + Send + Sync>;

/// Input/output contract for one stage.
#[derive(Clone)]
pub struct StageContract {
    pub stage: ExecutionStage,
    pub description: String,
    pub required_inputs: Vec<String>,
    pub expected_outputs: Vec<String>,
    pub acceptance_check: Option<AcceptanceCheck>,
    pub skippable: bool,
    pub skip_condition: Option<String>,
}

impl fmt::Debug for StageContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContract")
            .field("stage", &self.stage)
            .field("required_inputs", &self.required_inputs)
            .field("expected_outputs", &self.expected_outputs)
            .field("has_acceptance_check", &self.acceptance_check.is_some())
            .field("skippable", &self.skippable)
            .field("skip_condition", &self.skip_condition)
            .finish()
    }
}

impl StageContract {
    pub fn new(stage: ExecutionStage, description: impl Into<String>) -> Self {
        Self {
            stage,
            description: description.into(),
            required_inputs: Vec::new(),
            expected_outputs: Vec::new(),
            acceptance_check: None,
            skippable: false,
            skip_condition: None,
        }
    }

    pub fn requires<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn produces<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn accepts_when<F>(mut self, check: F) -> Self
    where
        F: Fn(&StageOutputs) -> Result<(), String> + Send + Sync + 'static,
    {
        self.acceptance_check = Some(Arc::new(check));
        self
    }

    pub fn skippable_when(mut self, condition: impl Into<String>) -> Self {
        self.skippable = true;
        self.skip_condition = Some(condition.into());
        self
    }

    /// Names from `expected_outputs` absent in `outputs`.
    pub fn missing_outputs(&self, outputs: &StageOutputs) -> Vec<String> {
        self.expected_outputs
            .iter()
            .filter(|key| !outputs.contains_key(key.as_str()))
            .cloned()
            .collect()
    }

    /// Names from `required_inputs` absent in `available`.
    pub fn missing_inputs(&self, available: &StageOutputs) -> Vec<String> {
        self.required_inputs
            .iter()
            .filter(|key| !available.contains_key(key.as_str()))
            .cloned()
            .collect()
    }

    pub fn check_acceptance(&self, outputs: &StageOutputs) -> Result<(), String> {
        self.acceptance_check
            .as_ref()
            .map_or(Ok(()), |check| check(outputs))
    }
}

/// Contracts for all eight stages.
#[derive(Debug, Clone)]
pub struct ContractRegistry {
    contracts: BTreeMap<ExecutionStage, StageContract>,
}

impl ContractRegistry {
    /// A registry where every stage has an empty, non-skippable contract.
    pub fn empty() -> Self {
        Self {
            contracts: ExecutionStage::ALL
                .into_iter()
                .map(|stage| (stage, StageContract::new(stage, stage.as_str())))
                .collect(),
        }
    }

    /// The contracts used by the standard flow.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(
            StageContract::new(ExecutionStage::Intake, "Capture the goal of the run")
                .produces(["goal"])
                .accepts_when(|outputs| non_empty_string(outputs, "goal")),
        );
        registry.register(
            StageContract::new(ExecutionStage::Analyze, "Analyze the project context")
                .requires(["goal"])
                .produces(["analysis"])
                .skippable_when("project context is already known"),
        );
        registry.register(
            StageContract::new(ExecutionStage::Plan, "Produce a plan of work items")
                .requires(["goal"])
                .produces(["plan_path", "item_count"])
                .accepts_when(|outputs| match outputs.get("item_count").and_then(Value::as_u64) {
                    Some(n) if n > 0 => Ok(()),
                    _ => Err("plan must contain at least one work item".to_string()),
                }),
        );
        registry.register(
            StageContract::new(ExecutionStage::Design, "Produce a design document")
                .requires(["plan_path"])
                .produces(["design_doc"])
                .skippable_when("no design document requested"),
        );
        registry.register(
            StageContract::new(ExecutionStage::ReadyCheck, "Confirm the plan is ready to execute")
                .requires(["plan_path"])
                .produces(["ready"])
                .accepts_when(|outputs| match outputs.get("ready").and_then(Value::as_bool) {
                    Some(true) => Ok(()),
                    _ => Err("ready check did not approve the plan".to_string()),
                })
                .skippable_when("plan approved without a readiness review"),
        );
        registry.register(
            StageContract::new(ExecutionStage::Execute, "Execute every work item batch by batch")
                .requires(["plan_path"])
                .produces(["completed_items", "failed_items"])
                .accepts_when(|outputs| {
                    match outputs.get("failed_items").and_then(Value::as_array) {
                        Some(failed) if failed.is_empty() => Ok(()),
                        Some(failed) => Err(format!("{} work item(s) failed", failed.len())),
                        None => Err("failed_items must be a list".to_string()),
                    }
                }),
        );
        registry.register(
            StageContract::new(ExecutionStage::VerifyReview, "Verify and review the results")
                .requires(["completed_items"])
                .produces(["verified"])
                .skippable_when("verification disabled for this run"),
        );
        registry.register(
            StageContract::new(ExecutionStage::WrapUp, "Summarize and close the run")
                .produces(["summary"]),
        );
        registry
    }

    pub fn register(&mut self, contract: StageContract) {
        self.contracts.insert(contract.stage, contract);
    }

    pub fn get(&self, stage: ExecutionStage) -> &StageContract {
        // Every stage is populated by `empty()` and never removed.
        &self.contracts[&stage]
    }

    pub fn is_skippable(&self, stage: ExecutionStage) -> bool {
        self.get(stage).skippable
    }
}

impl Default for ContractRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

fn non_empty_string(outputs: &StageOutputs, key: &str) -> Result<(), String> {
    match outputs.get(key).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err(format!("'{key}' must be a non-empty string")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(pairs: &[(&str, Value)]) -> StageOutputs {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_standard_registry_skip_rules() {
        let registry = ContractRegistry::standard();
        assert!(!registry.is_skippable(ExecutionStage::Intake));
        assert!(registry.is_skippable(ExecutionStage::Analyze));
        assert!(!registry.is_skippable(ExecutionStage::Plan));
        assert!(registry.is_skippable(ExecutionStage::Design));
        assert!(registry.is_skippable(ExecutionStage::ReadyCheck));
        assert!(!registry.is_skippable(ExecutionStage::Execute));
    }

    #[test]
    fn test_missing_outputs() {
        let registry = ContractRegistry::standard();
        let contract = registry.get(ExecutionStage::Plan);
        let missing = contract.missing_outputs(&outputs(&[("plan_path", json!("prd.json"))]));
        assert_eq!(missing, vec!["item_count".to_string()]);
    }

    #[test]
    fn test_execute_acceptance_rejects_failures() {
        let registry = ContractRegistry::standard();
        let contract = registry.get(ExecutionStage::Execute);
        assert!(contract
            .check_acceptance(&outputs(&[("failed_items", json!([]))]))
            .is_ok());
        let err = contract
            .check_acceptance(&outputs(&[("failed_items", json!(["s1"]))]))
            .unwrap_err();
        assert!(err.contains("1 work item"));
    }

    #[test]
    fn test_intake_requires_goal_text() {
        let registry = ContractRegistry::standard();
        let contract = registry.get(ExecutionStage::Intake);
        assert!(contract.check_acceptance(&outputs(&[("goal", json!("  "))])).is_err());
        assert!(contract.check_acceptance(&outputs(&[("goal", json!("ship"))])).is_ok());
    }
}
