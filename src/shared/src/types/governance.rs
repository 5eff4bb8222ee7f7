//! Governance types
//!
//! State shared between the kill-switch registry and the cost anomaly
//! guard: scoped freeze entries, execution check requests and verdicts,
//! running cost metrics, thresholds, validation results, and typed alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::plan::RiskLevel;

// ============================================================================
// KILL SWITCH TYPES
// ============================================================================

/// Scope an operator can freeze. `Global` ignores the target id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchScope {
    Global,
    Customer,
    Service,
    Connection,
}

impl fmt::Display for KillSwitchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KillSwitchScope::Global => write!(f, "global"),
            KillSwitchScope::Customer => write!(f, "customer"),
            KillSwitchScope::Service => write!(f, "service"),
            KillSwitchScope::Connection => write!(f, "connection"),
        }
    }
}

/// Which guard blocked an execution request. Distinguishes read-only mode
/// from the scoped freezes so callers can tell "writes paused" apart from
/// "you specifically are frozen".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedScope {
    Global,
    ReadOnly,
    Customer,
    Service,
    Connection,
}

/// One scoped freeze entry. Expired entries are treated as inactive at
/// check time even before the expiry sweep removes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchEntry {
    pub active: bool,
    pub activated_at: DateTime<Utc>,
    pub activated_by: String,
    pub reason: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl KillSwitchEntry {
    pub fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(at) if Utc::now() >= at)
    }

    /// Active and not yet past its expiry.
    pub fn is_blocking(&self) -> bool {
        self.active && !self.is_expired()
    }
}

/// What the execution engine asks the registry before running a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionCheckRequest {
    pub customer_id: String,
    pub service: String,
    pub connection_id: String,
    pub action: String,
    /// Whether the request mutates infrastructure. Read-only mode blocks
    /// only when this is true.
    pub is_write: bool,
    pub risk_level: RiskLevel,
}

/// Registry verdict for one execution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchCheck {
    pub allowed: bool,
    pub reason: Option<String>,
    pub scope: Option<BlockedScope>,
}

impl KillSwitchCheck {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            scope: None,
        }
    }

    pub fn blocked(scope: BlockedScope, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            scope: Some(scope),
        }
    }
}

/// Append-only audit record of a kill-switch state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    /// `activated`, `deactivated`, `expired`, `read_only_enabled`,
    /// `read_only_disabled`.
    pub event: String,
    pub scope: String,
    pub target_id: Option<String>,
    pub actor: String,
    pub reason: String,
}

/// One documented way to stop execution. Customer-side methods work in
/// the customer's own account even when this service is unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyStopMethod {
    pub method: String,
    /// `customer` or `platform`, whoever performs the stop.
    pub operated_by: String,
    pub description: String,
    /// When the stop takes effect relative to running executions.
    pub takes_effect: String,
}

// ============================================================================
// COST CONTROL TYPES
// ============================================================================

/// Running cost totals, maintained per customer and globally. Monthly USD
/// estimates, not billing figures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostMetrics {
    pub total_cost_increase: f64,
    pub total_cost_decrease: f64,
    pub net_cost_change: f64,
    pub actions_executed: u64,
    pub last_updated: DateTime<Utc>,
}

impl Default for CostMetrics {
    fn default() -> Self {
        Self {
            total_cost_increase: 0.0,
            total_cost_decrease: 0.0,
            net_cost_change: 0.0,
            actions_executed: 0,
            last_updated: Utc::now(),
        }
    }
}

impl CostMetrics {
    /// Fold one completed action's signed cost change into the totals.
    pub fn record(&mut self, cost_change: f64) {
        if cost_change >= 0.0 {
            self.total_cost_increase += cost_change;
        } else {
            self.total_cost_decrease += cost_change.abs();
        }
        self.net_cost_change += cost_change;
        self.actions_executed += 1;
        self.last_updated = Utc::now();
    }
}

/// Admission thresholds. Defaults apply unless a customer override exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostThresholds {
    /// Maximum allowed predicted increase as a percentage of baseline spend.
    pub cost_increase_percent: f64,
    /// Maximum allowed predicted absolute increase in monthly USD.
    pub cost_increase_absolute: f64,
    /// Per-customer validation calls allowed per fixed one-minute window.
    pub api_calls_per_minute: u32,
    /// Whether to reject plans touching regions outside the allowlist.
    pub unexpected_regions: bool,
}

impl Default for CostThresholds {
    fn default() -> Self {
        Self {
            cost_increase_percent: 20.0,
            cost_increase_absolute: 1000.0,
            api_calls_per_minute: 100,
            unexpected_regions: true,
        }
    }
}

/// Confidence in a cost prediction. `High` only when the caller supplied a
/// real monthly baseline; otherwise the configured default baseline is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostConfidence {
    Low,
    High,
}

/// Predicted cost impact of one candidate plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostPrediction {
    pub absolute_increase: f64,
    pub percent_increase: f64,
    pub baseline: f64,
    pub confidence: CostConfidence,
}

/// Verdict of cost-anomaly admission for one candidate plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostValidation {
    pub allowed: bool,
    pub reason: Option<String>,
    pub recommendation: Option<String>,
    pub risk_level: RiskLevel,
    pub prediction: Option<CostPrediction>,
    /// Set on rejection; categorizes the check that failed.
    pub alert_type: Option<CostAlertType>,
}

/// Category of a recorded cost alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostAlertType {
    CostIncrease,
    RateLimit,
    UnexpectedRegion,
    SelfMonitoring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// One recorded admission rejection or self-monitoring event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostAlert {
    pub alert_type: CostAlertType,
    pub severity: AlertSeverity,
    pub customer_id: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
