//! Work items and the plans that carry them.
//!
//! A plan comes in two surface forms that the scheduler treats identically:
//! a feature plan (`prd.json`, items under `stories`) and a project plan
//! (`mega-plan.json`, items under `features`). Both are validated once when
//! they are deserialized; the rest of the crate works with typed values.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::errors::{DomainError, DomainResult};

/// Scheduling priority of a work item. Orders `High < Medium < Low` so that a
/// stable ascending sort puts high-priority items first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[serde(alias = "High", alias = "HIGH")]
    High,
    #[default]
    #[serde(alias = "Medium", alias = "MEDIUM")]
    Medium,
    #[serde(alias = "Low", alias = "LOW")]
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Execution status of a single work item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One schedulable unit: a story of a feature plan or a feature of a project plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub status: ItemStatus,
    /// Fields this crate does not interpret (acceptance criteria, notes, ...)
    /// are carried through untouched so a rewrite never loses them.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            priority: Priority::default(),
            dependencies: Vec::new(),
            status: ItemStatus::default(),
            extra: Map::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_status(mut self, status: ItemStatus) -> Self {
        self.status = status;
        self
    }
}

/// Which surface form a plan was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    /// `prd.json` with `stories`.
    Feature,
    /// `mega-plan.json` with `features`.
    Project,
}

impl PlanKind {
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Feature => "prd.json",
            Self::Project => "mega-plan.json",
        }
    }

    pub const fn items_key(self) -> &'static str {
        match self {
            Self::Feature => "stories",
            Self::Project => "features",
        }
    }
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Feature => write!(f, "feature"),
            Self::Project => write!(f, "project"),
        }
    }
}

impl FromStr for PlanKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "feature" | "prd" => Ok(Self::Feature),
            "project" | "mega" | "mega-plan" => Ok(Self::Project),
            other => Err(DomainError::ValidationFailed(format!(
                "unknown plan kind '{other}' (expected feature or project)"
            ))),
        }
    }
}

/// Counts of items per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanCounts {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub complete: usize,
    pub failed: usize,
}

/// An ordered collection of work items plus plan-level metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPlan", into = "RawPlan")]
pub struct Plan {
    pub kind: PlanKind,
    pub goal: String,
    pub metadata: Map<String, Value>,
    items: Vec<WorkItem>,
    extra: Map<String, Value>,
}

impl Plan {
    /// Build a plan, rejecting duplicate ids.
    pub fn new(kind: PlanKind, goal: impl Into<String>, items: Vec<WorkItem>) -> DomainResult<Self> {
        validate_unique_ids(&items)?;
        Ok(Self {
            kind,
            goal: goal.into(),
            metadata: Map::new(),
            items,
            extra: Map::new(),
        })
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&WorkItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn set_status(&mut self, id: &str, status: ItemStatus) -> DomainResult<()> {
        let item = self
            .items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| DomainError::ItemNotFound(id.to_string()))?;
        item.status = status;
        Ok(())
    }

    /// Ids of items whose status is `complete`.
    pub fn completed_ids(&self) -> HashSet<String> {
        self.items
            .iter()
            .filter(|item| item.status == ItemStatus::Complete)
            .map(|item| item.id.clone())
            .collect()
    }

    pub fn counts(&self) -> PlanCounts {
        let mut counts = PlanCounts {
            total: self.items.len(),
            ..PlanCounts::default()
        };
        for item in &self.items {
            match item.status {
                ItemStatus::Pending => counts.pending += 1,
                ItemStatus::InProgress => counts.in_progress += 1,
                ItemStatus::Complete => counts.complete += 1,
                ItemStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn is_complete(&self) -> bool {
        self.items.iter().all(|item| item.status == ItemStatus::Complete)
    }

    /// `(item, missing dependency)` pairs for dependencies that name no item in the plan.
    pub fn dangling_dependencies(&self) -> Vec<(String, String)> {
        let ids: HashSet<&str> = self.items.iter().map(|item| item.id.as_str()).collect();
        self.items
            .iter()
            .flat_map(|item| {
                item.dependencies
                    .iter()
                    .filter(|dep| !ids.contains(dep.as_str()))
                    .map(move |dep| (item.id.clone(), dep.clone()))
            })
            .collect()
    }
}

fn validate_unique_ids(items: &[WorkItem]) -> DomainResult<()> {
    let mut seen = HashMap::with_capacity(items.len());
    for item in items {
        if item.id.trim().is_empty() {
            return Err(DomainError::ValidationFailed(
                "work item id cannot be empty".to_string(),
            ));
        }
        if seen.insert(item.id.as_str(), ()).is_some() {
            return Err(DomainError::DuplicateItem(item.id.clone()));
        }
    }
    Ok(())
}

/// On-disk shape shared by `prd.json` and `mega-plan.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawPlan {
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stories: Option<Vec<WorkItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    features: Option<Vec<WorkItem>>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl TryFrom<RawPlan> for Plan {
    type Error = DomainError;

    fn try_from(raw: RawPlan) -> Result<Self, Self::Error> {
        let (kind, items) = match (raw.stories, raw.features) {
            (Some(_), Some(_)) => {
                return Err(DomainError::ValidationFailed(
                    "plan defines both 'stories' and 'features'".to_string(),
                ))
            }
            (Some(stories), None) => (PlanKind::Feature, stories),
            (None, Some(features)) => (PlanKind::Project, features),
            (None, None) => {
                return Err(DomainError::ValidationFailed(
                    "plan defines neither 'stories' nor 'features'".to_string(),
                ))
            }
        };
        validate_unique_ids(&items)?;
        Ok(Self {
            kind,
            goal: raw.goal,
            metadata: raw.metadata,
            items,
            extra: raw.extra,
        })
    }
}

impl From<Plan> for RawPlan {
    fn from(plan: Plan) -> Self {
        let (stories, features) = match plan.kind {
            PlanKind::Feature => (Some(plan.items), None),
            PlanKind::Project => (None, Some(plan.items)),
        };
        Self {
            metadata: plan.metadata,
            goal: plan.goal,
            stories,
            features,
            extra: plan.extra,
        }
    }
}
