//! Judge ports consulted after an item executes.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{DodCheckResult, DodRequest, GateResults, WorkItem};

/// Runs named quality checks (tests, lint, type-check, ...) for an item.
#[async_trait]
pub trait QualityGate: Send + Sync {
    async fn check(&self, item: &WorkItem, changed_files: &[String]) -> DomainResult<GateResults>;
}

/// Decides whether an item meets its Definition of Done.
#[async_trait]
pub trait DodGate: Send + Sync {
    async fn check(&self, request: DodRequest) -> DomainResult<DodCheckResult>;
}
