//! Port trait definitions (Hexagonal Architecture)
//!
//! Interfaces the orchestrator calls but does not implement itself:
//! - StoryRunner: the external executing agent
//! - QualityGate: named pass/fail checks run after an item executes
//! - DodGate: the Definition-of-Done judge
//!
//! Adapters live in `crate::adapters`; tests substitute scripted doubles.

pub mod gates;
pub mod story_runner;

pub use gates::{DodGate, QualityGate};
pub use story_runner::StoryRunner;
