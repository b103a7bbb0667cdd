//! Requests sent to the execution capability and what comes back.

use serde::{Deserialize, Serialize};

use super::gate::AiVerificationResult;
use super::work_item::WorkItem;

/// One invocation of an executing agent for one work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub item_id: String,
    pub title: String,
    pub agent: String,
    pub prompt: String,
    /// 1-based attempt number within this run.
    pub attempt: u32,
}

impl ExecutionRequest {
    pub fn new(item: &WorkItem, agent: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            item_id: item.id.clone(),
            title: item.title.clone(),
            agent: agent.into(),
            prompt: prompt.into(),
            attempt: 1,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// Instructions given to the agent for an item on its first attempt.
pub fn base_prompt(item: &WorkItem) -> String {
    let mut prompt = format!("Implement work item {}: {}\n", item.id, item.title);
    if !item.description.trim().is_empty() {
        prompt.push('\n');
        prompt.push_str(item.description.trim());
        prompt.push('\n');
    }
    if !item.dependencies.is_empty() {
        prompt.push_str(&format!(
            "\nThis item builds on: {}\n",
            item.dependencies.join(", ")
        ));
    }
    prompt
}

/// What an executing agent reported for one attempt.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub crashed: bool,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default)]
    pub ai_verification: Option<AiVerificationResult>,
}

impl ExecutionOutcome {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn failed(exit_code: i32, error: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(exit_code),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn timed_out(error: impl Into<String>) -> Self {
        Self {
            success: false,
            timed_out: true,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn crashed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            crashed: true,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_prompt_mentions_dependencies() {
        let item = WorkItem::new("story-002", "Add API")
            .with_description("Expose the login endpoint")
            .with_dependencies(["story-001"]);
        let prompt = base_prompt(&item);
        assert!(prompt.starts_with("Implement work item story-002: Add API"));
        assert!(prompt.contains("Expose the login endpoint"));
        assert!(prompt.contains("builds on: story-001"));
    }
}
