//! Adapters for the external systems the orchestrator drives: the executing
//! agent and the judges consulted after it.

pub mod gates;
pub mod process;
pub mod runners;

pub use gates::{CommandQualityGate, GateOutputsDodGate};
pub use runners::CommandRunner;
