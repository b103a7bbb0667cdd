//! Quality-gate and Definition-of-Done judges.

pub mod command;
pub mod dod;

pub use command::CommandQualityGate;
pub use dod::GateOutputsDodGate;
