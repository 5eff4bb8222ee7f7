//! Action Executor Service Library
//!
//! This library provides the governed cloud action execution core for the
//! Cloudward platform. It turns validated action descriptors into batched
//! execution plans and runs them under strict, auditable, time-boxed
//! control.
//!
//! # Features
//!
//! - **Plan Generation**: Ordered, resource-batched plans with cost, risk,
//!   and duration estimates plus auto-derived rollback plans
//! - **Approval Lifecycle**: Single-use, expiring approval tokens consumed
//!   atomically at execution admission
//! - **Kill Switches**: Global, customer, service, and connection freeze
//!   flags plus a write-blocking read-only mode, with an audit trail
//! - **Cost Anomaly Guard**: Threshold, rate-limit, and region admission
//!   checks with self-monitoring that can trip read-only mode
//! - **Execution Engine**: Sequential step execution with progress events,
//!   cooperative cancellation, and automatic rollback on failure
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌───────────────────┐     ┌─────────────────┐
//! │ Automation Layer │────▶│  Action Executor   │────▶│  Cloud Provider │
//! │ (intent, DSL)    │     │     Service        │     │   (via clients) │
//! └──────────────────┘     └───────────────────┘     └─────────────────┘
//!                                   │
//!                          ┌───────────────────┐
//!                          │ Kill Switches +   │
//!                          │ Cost Guard        │
//!                          └───────────────────┘
//! ```

// Public modules
pub mod actions;
pub mod approvals;
pub mod clients;
pub mod config;
pub mod costguard;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod killswitch;
pub mod metrics;
pub mod models;
pub mod planner;
pub mod server;
pub mod telemetry;

// Re-exports for convenience
pub use approvals::ApprovalStore;
pub use config::ExecutorConfig;
pub use costguard::CostAnomalyGuard;
pub use engine::ExecutionEngine;
pub use error::{ExecutorError, Result};
pub use killswitch::KillSwitchRegistry;
pub use planner::PlanGenerator;
pub use server::ActionExecutorServer;
