//! Shared types for the Cloudward Platform
//!
//! Type vocabulary consumed by the action-executor service and by callers
//! driving it: execution plans and steps, cloud connection records,
//! governance state (kill switches, cost controls), and execution results.

pub mod types;

// Export all types from types module
pub use types::*;
