//! Flowpilot library
//!
//! Exposes the dry-run simulation backend for integration testing.

pub mod sim;

pub use sim::{SimStepExecutor, SimTargetProvisioner};
