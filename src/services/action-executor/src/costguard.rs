//! Cost Anomaly Guard
//!
//! Admission control on a candidate plan's predicted cost impact, checked
//! in a fixed order with a hard stop at the first violation: per-customer
//! rate limit, percentage threshold, absolute threshold, region allowlist.
//! Only a fully successful validation consumes rate budget. The guard also
//! keeps running cost totals per customer and globally, and a self-monitor
//! that trips the kill-switch registry into read-only mode when the
//! platform's own actions net-increase customer spend.

use chrono::Utc;
use cloudward_shared::{
    AlertSeverity, CostAlert, CostAlertType, CostConfidence, CostMetrics, CostPrediction,
    CostThresholds, CostValidation, ExecutionPlan, RiskLevel,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::killswitch::KillSwitchRegistry;

/// Guard tuning knobs.
#[derive(Debug, Clone)]
pub struct CostGuardConfig {
    pub default_thresholds: CostThresholds,
    /// Baseline monthly spend assumed when the caller supplies none.
    /// Predictions against it carry low confidence.
    pub default_monthly_baseline: f64,
    /// Alerts retained in the in-memory ring.
    pub alert_capacity: usize,
    /// Fixed rate-limit window length; counters reset on this timer.
    pub rate_window_seconds: u64,
    pub self_monitor_interval_seconds: u64,
    /// Global actions required before the self-monitor evaluates at all.
    pub self_monitor_min_actions: u64,
    /// Increase-vs-decrease ratio above which read-only mode is tripped.
    pub self_monitor_ratio: f64,
}

impl Default for CostGuardConfig {
    fn default() -> Self {
        Self {
            default_thresholds: CostThresholds::default(),
            default_monthly_baseline: 1000.0,
            alert_capacity: 200,
            rate_window_seconds: 60,
            self_monitor_interval_seconds: 30,
            self_monitor_min_actions: 10,
            self_monitor_ratio: 1.5,
        }
    }
}

/// Counters kept for operational visibility.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CostGuardStats {
    pub validations_total: u64,
    pub rejections_total: u64,
    pub alerts_total: u64,
    pub self_monitor_trips: u64,
}

#[derive(Debug)]
pub struct CostAnomalyGuard {
    config: CostGuardConfig,
    kill_switches: Arc<KillSwitchRegistry>,
    /// Per-customer threshold overrides; defaults apply otherwise.
    overrides: DashMap<String, CostThresholds>,
    /// Validation calls per customer in the current fixed window.
    rate_counters: DashMap<String, u32>,
    customer_metrics: DashMap<String, CostMetrics>,
    global_metrics: RwLock<CostMetrics>,
    alerts: RwLock<VecDeque<CostAlert>>,
    stats: RwLock<CostGuardStats>,
}

impl CostAnomalyGuard {
    pub fn new(config: CostGuardConfig, kill_switches: Arc<KillSwitchRegistry>) -> Self {
        Self {
            config,
            kill_switches,
            overrides: DashMap::new(),
            rate_counters: DashMap::new(),
            customer_metrics: DashMap::new(),
            global_metrics: RwLock::new(CostMetrics::default()),
            alerts: RwLock::new(VecDeque::new()),
            stats: RwLock::new(CostGuardStats::default()),
        }
    }

    /// Install a customer-specific threshold override.
    pub fn set_thresholds(&self, customer_id: &str, thresholds: CostThresholds) {
        info!(customer_id = %customer_id, ?thresholds, "cost thresholds overridden");
        self.overrides.insert(customer_id.to_string(), thresholds);
    }

    pub fn thresholds_for(&self, customer_id: &str) -> CostThresholds {
        self.overrides
            .get(customer_id)
            .map(|t| t.clone())
            .unwrap_or_else(|| self.config.default_thresholds.clone())
    }

    /// Validate one candidate plan. Checks run in a fixed order and stop at
    /// the first violation; only a full pass increments the rate counter,
    /// so rejected calls never consume rate budget.
    pub fn validate(
        &self,
        plan: &ExecutionPlan,
        customer_id: &str,
        current_monthly_cost: Option<f64>,
        expected_regions: &[String],
    ) -> CostValidation {
        self.stats.write().validations_total += 1;
        let thresholds = self.thresholds_for(customer_id);

        // Rate limit first; everything after costs real work.
        let calls_this_window = self
            .rate_counters
            .get(customer_id)
            .map(|c| *c)
            .unwrap_or(0);
        if calls_this_window >= thresholds.api_calls_per_minute {
            return self.reject(
                customer_id,
                CostAlertType::RateLimit,
                AlertSeverity::Warning,
                format!(
                    "rate limit reached: {} validation calls this window (limit {})",
                    calls_this_window, thresholds.api_calls_per_minute
                ),
                Some("retry after the current one-minute window resets".to_string()),
                RiskLevel::Medium,
                None,
            );
        }

        let prediction = self.predict(plan, current_monthly_cost);

        // Percentage threshold. The boundary is exclusive: a prediction
        // exactly at the threshold passes.
        if prediction.percent_increase > thresholds.cost_increase_percent {
            let severity = if prediction.percent_increase > thresholds.cost_increase_percent * 2.0 {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            };
            return self.reject(
                customer_id,
                CostAlertType::CostIncrease,
                severity,
                format!(
                    "predicted increase {:.1}% of baseline exceeds the {:.1}% threshold",
                    prediction.percent_increase, thresholds.cost_increase_percent
                ),
                Some("reduce the plan's scope or raise the customer threshold".to_string()),
                RiskLevel::High,
                Some(prediction),
            );
        }

        // Absolute threshold, independently of the percentage.
        if prediction.absolute_increase > thresholds.cost_increase_absolute {
            return self.reject(
                customer_id,
                CostAlertType::CostIncrease,
                AlertSeverity::Critical,
                format!(
                    "predicted increase ${:.2}/month exceeds the ${:.2} absolute threshold",
                    prediction.absolute_increase, thresholds.cost_increase_absolute
                ),
                Some("split the action into smaller plans".to_string()),
                RiskLevel::High,
                Some(prediction),
            );
        }

        if thresholds.unexpected_regions {
            if let Some(region) = plan
                .regions
                .iter()
                .find(|r| !expected_regions.contains(r))
            {
                return self.reject(
                    customer_id,
                    CostAlertType::UnexpectedRegion,
                    AlertSeverity::Critical,
                    format!("plan touches unexpected region {}", region),
                    Some("add the region to the connection allowlist first".to_string()),
                    RiskLevel::Critical,
                    Some(prediction),
                );
            }
        }

        // All checks passed; this call now consumes rate budget.
        *self
            .rate_counters
            .entry(customer_id.to_string())
            .or_insert(0) += 1;

        let recommendation = match prediction.confidence {
            CostConfidence::Low => Some(
                "supply the customer's real monthly spend for a confident percentage".to_string(),
            ),
            CostConfidence::High => None,
        };
        let risk_level = if prediction.percent_increase > thresholds.cost_increase_percent / 2.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        debug!(
            customer_id = %customer_id,
            plan_id = %plan.plan_id,
            percent = prediction.percent_increase,
            absolute = prediction.absolute_increase,
            "cost validation passed"
        );

        CostValidation {
            allowed: true,
            reason: None,
            recommendation,
            risk_level,
            prediction: Some(prediction),
            alert_type: None,
        }
    }

    fn predict(&self, plan: &ExecutionPlan, current_monthly_cost: Option<f64>) -> CostPrediction {
        let absolute_increase = plan.summary.estimated_cost_impact.max(0.0);
        let baseline = current_monthly_cost.unwrap_or(self.config.default_monthly_baseline);
        let percent_increase = if baseline > 0.0 {
            absolute_increase / baseline * 100.0
        } else if absolute_increase > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };
        let confidence = if current_monthly_cost.is_some() {
            CostConfidence::High
        } else {
            CostConfidence::Low
        };

        CostPrediction {
            absolute_increase,
            percent_increase,
            baseline,
            confidence,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn reject(
        &self,
        customer_id: &str,
        alert_type: CostAlertType,
        severity: AlertSeverity,
        message: String,
        recommendation: Option<String>,
        risk_level: RiskLevel,
        prediction: Option<CostPrediction>,
    ) -> CostValidation {
        warn!(customer_id = %customer_id, reason = %message, "cost validation rejected");
        self.stats.write().rejections_total += 1;
        self.record_alert(alert_type, severity, Some(customer_id), &message);

        CostValidation {
            allowed: false,
            reason: Some(message),
            recommendation,
            risk_level,
            prediction,
            alert_type: Some(alert_type),
        }
    }

    /// Fold one completed action's signed cost change into the per-customer
    /// and global totals.
    pub fn record_action_cost(&self, customer_id: &str, cost_change: f64) {
        self.customer_metrics
            .entry(customer_id.to_string())
            .or_default()
            .record(cost_change);
        self.global_metrics.write().record(cost_change);
    }

    /// Running totals, global or for one customer. Unknown customers read
    /// as zeroed metrics.
    pub fn metrics(&self, customer_id: Option<&str>) -> CostMetrics {
        match customer_id {
            Some(id) => self
                .customer_metrics
                .get(id)
                .map(|m| m.clone())
                .unwrap_or_default(),
            None => self.global_metrics.read().clone(),
        }
    }

    pub fn customer_metrics(&self) -> Vec<(String, CostMetrics)> {
        self.customer_metrics
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect()
    }

    /// Most recent alerts, newest first.
    pub fn alerts(&self, limit: usize) -> Vec<CostAlert> {
        let alerts = self.alerts.read();
        alerts.iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> CostGuardStats {
        self.stats.read().clone()
    }

    /// Reset every fixed rate window. Driven by the server on the window
    /// timer; the windows do not slide.
    pub fn reset_rate_windows(&self) {
        self.rate_counters.clear();
    }

    /// One self-monitoring pass. Once enough global actions have run,
    /// compares cumulative increase against cumulative decrease and trips
    /// read-only mode when the ratio crosses the configured threshold.
    /// Returns whether this pass tripped it.
    pub fn self_monitor_tick(&self) -> bool {
        let (actions, increase, decrease) = {
            let metrics = self.global_metrics.read();
            (
                metrics.actions_executed,
                metrics.total_cost_increase,
                metrics.total_cost_decrease,
            )
        };

        if actions < self.config.self_monitor_min_actions {
            return false;
        }

        let ratio = increase / decrease.max(1.0);
        if ratio <= self.config.self_monitor_ratio {
            return false;
        }

        if self.kill_switches.is_read_only() {
            // Already frozen; nothing further to trip.
            return false;
        }

        let message = format!(
            "platform actions are net-increasing spend: +${:.2} vs -${:.2} over {} actions (ratio {:.2})",
            increase, decrease, actions, ratio
        );
        error!(ratio, actions, "self-monitoring tripped read-only mode");
        self.record_alert(
            CostAlertType::SelfMonitoring,
            AlertSeverity::Critical,
            None,
            &message,
        );
        self.kill_switches
            .enable_read_only("cost-guard self-monitor", &message);
        self.stats.write().self_monitor_trips += 1;
        true
    }

    fn record_alert(
        &self,
        alert_type: CostAlertType,
        severity: AlertSeverity,
        customer_id: Option<&str>,
        message: &str,
    ) {
        let alert = CostAlert {
            alert_type,
            severity,
            customer_id: customer_id.map(str::to_string),
            message: message.to_string(),
            timestamp: Utc::now(),
        };

        let mut alerts = self.alerts.write();
        if alerts.len() >= self.config.alert_capacity {
            alerts.pop_front();
        }
        alerts.push_back(alert);
        self.stats.write().alerts_total += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::killswitch::KillSwitchConfig;
    use chrono::Duration;
    use cloudward_shared::PlanSummary;

    fn create_test_guard() -> CostAnomalyGuard {
        let kill_switches = Arc::new(KillSwitchRegistry::new(KillSwitchConfig::default()));
        CostAnomalyGuard::new(CostGuardConfig::default(), kill_switches)
    }

    fn create_test_plan(cost_impact: f64, regions: Vec<&str>) -> ExecutionPlan {
        let now = Utc::now();
        ExecutionPlan {
            plan_id: "plan-1".to_string(),
            dsl_hash: "hash".to_string(),
            dsl_version: "1.0".to_string(),
            steps: vec![],
            summary: PlanSummary {
                total_steps: 0,
                estimated_duration_ms: 0,
                estimated_cost_impact: cost_impact,
                risk_score: 20,
                resources_affected: 0,
                services_affected: vec![],
                requires_approval: true,
                reversible: true,
            },
            regions: regions.into_iter().map(str::to_string).collect(),
            visualization: None,
            rollback_plan: None,
            created_at: now,
            expires_at: now + Duration::minutes(15),
        }
    }

    fn us_east() -> Vec<String> {
        vec!["us-east-1".to_string()]
    }

    #[test]
    fn test_threshold_boundary_is_exclusive() {
        let guard = create_test_guard();
        // 20% of a $1000 baseline is exactly $200.
        let at_threshold = create_test_plan(200.0, vec!["us-east-1"]);
        let verdict = guard.validate(&at_threshold, "cust-1", Some(1000.0), &us_east());
        assert!(verdict.allowed, "{:?}", verdict.reason);

        let over_threshold = create_test_plan(201.0, vec!["us-east-1"]);
        let verdict = guard.validate(&over_threshold, "cust-1", Some(1000.0), &us_east());
        assert!(!verdict.allowed);
        assert!(verdict.reason.unwrap().contains("threshold"));
    }

    #[test]
    fn test_absolute_threshold_is_independent() {
        let guard = create_test_guard();
        // 0.15% of a million-dollar baseline, but over $1000 absolute.
        let plan = create_test_plan(1500.0, vec!["us-east-1"]);
        let verdict = guard.validate(&plan, "cust-1", Some(1_000_000.0), &us_east());
        assert!(!verdict.allowed);
        assert!(verdict.reason.unwrap().contains("absolute"));
    }

    #[test]
    fn test_savings_always_pass_cost_checks() {
        let guard = create_test_guard();
        let plan = create_test_plan(-5000.0, vec!["us-east-1"]);
        let verdict = guard.validate(&plan, "cust-1", Some(100.0), &us_east());
        assert!(verdict.allowed);
        assert_eq!(verdict.prediction.unwrap().absolute_increase, 0.0);
    }

    #[test]
    fn test_default_baseline_lowers_confidence() {
        let guard = create_test_guard();
        let plan = create_test_plan(50.0, vec!["us-east-1"]);

        let verdict = guard.validate(&plan, "cust-1", None, &us_east());
        assert!(verdict.allowed);
        let prediction = verdict.prediction.unwrap();
        assert_eq!(prediction.confidence, CostConfidence::Low);
        assert_eq!(prediction.baseline, 1000.0);
        assert!(verdict.recommendation.is_some());

        let verdict = guard.validate(&plan, "cust-1", Some(2000.0), &us_east());
        assert_eq!(
            verdict.prediction.unwrap().confidence,
            CostConfidence::High
        );
    }

    #[test]
    fn test_rate_limit_rejects_at_cap() {
        let guard = create_test_guard();
        guard.set_thresholds(
            "cust-1",
            CostThresholds {
                api_calls_per_minute: 2,
                ..CostThresholds::default()
            },
        );
        let plan = create_test_plan(10.0, vec!["us-east-1"]);

        assert!(guard.validate(&plan, "cust-1", None, &us_east()).allowed);
        assert!(guard.validate(&plan, "cust-1", None, &us_east()).allowed);

        let verdict = guard.validate(&plan, "cust-1", None, &us_east());
        assert!(!verdict.allowed);
        assert!(verdict.reason.unwrap().contains("rate limit"));

        // A fixed-window reset restores the budget.
        guard.reset_rate_windows();
        assert!(guard.validate(&plan, "cust-1", None, &us_east()).allowed);
    }

    #[test]
    fn test_rejected_calls_do_not_consume_rate_budget() {
        let guard = create_test_guard();
        guard.set_thresholds(
            "cust-1",
            CostThresholds {
                api_calls_per_minute: 2,
                ..CostThresholds::default()
            },
        );

        // Cost-rejected validations must leave the window untouched.
        let too_expensive = create_test_plan(5000.0, vec!["us-east-1"]);
        for _ in 0..5 {
            assert!(!guard.validate(&too_expensive, "cust-1", None, &us_east()).allowed);
        }

        let cheap = create_test_plan(10.0, vec!["us-east-1"]);
        assert!(guard.validate(&cheap, "cust-1", None, &us_east()).allowed);
        assert!(guard.validate(&cheap, "cust-1", None, &us_east()).allowed);
    }

    #[test]
    fn test_unexpected_region_rejected() {
        let guard = create_test_guard();
        let plan = create_test_plan(10.0, vec!["eu-west-1"]);

        let verdict = guard.validate(&plan, "cust-1", None, &us_east());
        assert!(!verdict.allowed);
        assert!(verdict.reason.unwrap().contains("eu-west-1"));
        assert_eq!(verdict.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn test_region_check_can_be_disabled() {
        let guard = create_test_guard();
        guard.set_thresholds(
            "cust-1",
            CostThresholds {
                unexpected_regions: false,
                ..CostThresholds::default()
            },
        );
        let plan = create_test_plan(10.0, vec!["eu-west-1"]);
        assert!(guard.validate(&plan, "cust-1", None, &us_east()).allowed);
    }

    #[test]
    fn test_metrics_split_increase_and_decrease() {
        let guard = create_test_guard();
        guard.record_action_cost("cust-1", 250.0);
        guard.record_action_cost("cust-1", -100.0);
        guard.record_action_cost("cust-2", -50.0);

        let cust1 = guard.metrics(Some("cust-1"));
        assert_eq!(cust1.total_cost_increase, 250.0);
        assert_eq!(cust1.total_cost_decrease, 100.0);
        assert_eq!(cust1.actions_executed, 2);

        let global = guard.metrics(None);
        assert_eq!(global.actions_executed, 3);
        assert_eq!(global.net_cost_change, 100.0);
    }

    #[test]
    fn test_self_monitor_requires_minimum_actions() {
        let guard = create_test_guard();
        for _ in 0..9 {
            guard.record_action_cost("cust-1", 100.0);
        }
        assert!(!guard.self_monitor_tick());
        assert!(!guard.kill_switches.is_read_only());
    }

    #[test]
    fn test_self_monitor_trips_read_only() {
        let guard = create_test_guard();
        for _ in 0..10 {
            guard.record_action_cost("cust-1", 100.0);
        }

        assert!(guard.self_monitor_tick());
        assert!(guard.kill_switches.is_read_only());

        let alerts = guard.alerts(5);
        assert_eq!(alerts[0].alert_type, CostAlertType::SelfMonitoring);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);

        // A second pass must not re-trip while read-only holds.
        assert!(!guard.self_monitor_tick());
    }

    #[test]
    fn test_self_monitor_tolerates_balanced_spend() {
        let guard = create_test_guard();
        for _ in 0..6 {
            guard.record_action_cost("cust-1", 100.0);
        }
        for _ in 0..6 {
            guard.record_action_cost("cust-1", -90.0);
        }

        // 600 / 540 is under the 1.5 ratio.
        assert!(!guard.self_monitor_tick());
        assert!(!guard.kill_switches.is_read_only());
    }

    #[test]
    fn test_rejections_record_typed_alerts() {
        let guard = create_test_guard();
        let plan = create_test_plan(5000.0, vec!["us-east-1"]);
        guard.validate(&plan, "cust-1", None, &us_east());

        let alerts = guard.alerts(5);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, CostAlertType::CostIncrease);
        assert_eq!(alerts[0].customer_id.as_deref(), Some("cust-1"));
    }
}
