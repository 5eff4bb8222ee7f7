//! HTTP Request Handlers Module
//!
//! All HTTP request handlers for the action executor, organized by
//! functionality area: plan lifecycle, execution lifecycle, connection
//! records, governance administration, and service introspection.

pub mod admin;
pub mod connections;
pub mod executions;
pub mod health;
pub mod plans;
pub mod status;

// Re-exports for convenience.
pub use admin::*;
pub use connections::*;
pub use executions::*;
pub use health::*;
pub use plans::*;
pub use status::*;
