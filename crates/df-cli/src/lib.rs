//! df-cli: Command-line interface for devfleet
//!
//! Provides the `devfleet` binary that resolves devices, connects to them,
//! and drives the deployment orchestrator.

pub mod commands;
pub mod output;
