//! Cloud connection types
//!
//! A `Connection` binds one customer to one cloud account. The record is
//! owned by the connection-management subsystem; the execution core only
//! reads it for admission (execution mode, allowed regions) and increments
//! its usage counters after every execution attempt.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether actions against this connection mutate real infrastructure.
/// New connections start in `simulation` and graduate to live execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Simulation,
    Live,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Simulation
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Simulation => write!(f, "simulation"),
            ExecutionMode::Live => write!(f, "live"),
        }
    }
}

/// One customer's cloud account binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub connection_id: String,
    pub customer_id: String,
    /// Cloud provider identifier, e.g. `aws`.
    pub provider: String,
    pub display_name: Option<String>,
    pub execution_mode: ExecutionMode,
    /// When the simulation observation period began.
    pub simulation_started_at: Option<DateTime<Utc>>,
    /// Days of simulation required before live execution is permitted.
    pub simulation_days_required: u32,
    /// Ordered region allowlist; the first entry is the default region.
    pub allowed_regions: Vec<String>,
    pub last_used: Option<DateTime<Utc>>,
    pub total_executions: u64,
    pub total_api_calls: u64,
    pub created_at: DateTime<Utc>,
}

impl Connection {
    /// Whether this connection may execute against real infrastructure.
    ///
    /// Live-mode connections always may. Simulation-mode connections may
    /// once their required observation period has elapsed.
    pub fn can_execute_live(&self) -> bool {
        match self.execution_mode {
            ExecutionMode::Live => true,
            ExecutionMode::Simulation => match self.simulation_started_at {
                Some(started) => {
                    Utc::now() - started >= Duration::days(i64::from(self.simulation_days_required))
                }
                None => false,
            },
        }
    }

    /// The connection's default region, when any region is allowed.
    pub fn default_region(&self) -> Option<&str> {
        self.allowed_regions.first().map(String::as_str)
    }

    /// Record a finished execution attempt against the usage counters.
    pub fn record_execution(&mut self, api_calls: u64) {
        self.last_used = Some(Utc::now());
        self.total_executions += 1;
        self.total_api_calls += api_calls;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_connection(mode: ExecutionMode) -> Connection {
        Connection {
            connection_id: "conn-1".to_string(),
            customer_id: "cust-1".to_string(),
            provider: "aws".to_string(),
            display_name: Some("production".to_string()),
            execution_mode: mode,
            simulation_started_at: None,
            simulation_days_required: 7,
            allowed_regions: vec!["us-east-1".to_string(), "eu-west-1".to_string()],
            last_used: None,
            total_executions: 0,
            total_api_calls: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_live_mode_can_execute() {
        assert!(sample_connection(ExecutionMode::Live).can_execute_live());
    }

    #[test]
    fn test_simulation_without_start_cannot_execute() {
        assert!(!sample_connection(ExecutionMode::Simulation).can_execute_live());
    }

    #[test]
    fn test_simulation_graduates_after_required_days() {
        let mut conn = sample_connection(ExecutionMode::Simulation);
        conn.simulation_started_at = Some(Utc::now() - Duration::days(8));
        assert!(conn.can_execute_live());

        conn.simulation_started_at = Some(Utc::now() - Duration::days(2));
        assert!(!conn.can_execute_live());
    }

    #[test]
    fn test_default_region_is_first() {
        let conn = sample_connection(ExecutionMode::Live);
        assert_eq!(conn.default_region(), Some("us-east-1"));
    }

    #[test]
    fn test_record_execution_updates_counters() {
        let mut conn = sample_connection(ExecutionMode::Live);
        conn.record_execution(7);
        conn.record_execution(3);

        assert_eq!(conn.total_executions, 2);
        assert_eq!(conn.total_api_calls, 10);
        assert!(conn.last_used.is_some());
    }
}
