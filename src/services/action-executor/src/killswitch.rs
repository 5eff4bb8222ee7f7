//! Kill Switch Registry
//!
//! Holds the freeze flags that can stop execution at any scope: one global
//! switch, a write-blocking read-only mode, and per-customer, per-service,
//! and per-connection entries. `check` answers in O(1) with a fixed
//! precedence and evaluates expiry inline, so an expired-but-unswept entry
//! never blocks anything. Every state change lands in an append-only
//! in-memory audit ring.

use chrono::{DateTime, Utc};
use cloudward_shared::{
    AuditRecord, BlockedScope, EmergencyStopMethod, ExecutionCheckRequest, KillSwitchCheck,
    KillSwitchEntry, KillSwitchScope,
};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, error, info, warn};

use crate::error::{ExecutorError, Result};

/// Registry tuning knobs.
#[derive(Debug, Clone)]
pub struct KillSwitchConfig {
    /// Audit records retained in the in-memory ring.
    pub audit_capacity: usize,
    /// Interval of the expiry sweep driven by the server.
    pub sweep_interval_seconds: u64,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            audit_capacity: 500,
            sweep_interval_seconds: 60,
        }
    }
}

/// Counters kept for operational visibility.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KillSwitchStats {
    pub activations_total: u64,
    pub deactivations_total: u64,
    pub checks_total: u64,
    pub blocks_total: u64,
    pub expired_total: u64,
}

/// Point-in-time view of the registry, returned by the admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchStatus {
    pub global_active: bool,
    pub read_only_active: bool,
    pub customer_switches: usize,
    pub service_switches: usize,
    pub connection_switches: usize,
    pub audit_records: usize,
}

#[derive(Debug, Default)]
struct GlobalFlags {
    global: Option<KillSwitchEntry>,
    read_only: Option<KillSwitchEntry>,
}

/// The registry itself. Cheap to share behind an `Arc`; every method takes
/// `&self` and the guarded maps make each read-modify-write atomic.
#[derive(Debug)]
pub struct KillSwitchRegistry {
    config: KillSwitchConfig,
    flags: RwLock<GlobalFlags>,
    customers: DashMap<String, KillSwitchEntry>,
    services: DashMap<String, KillSwitchEntry>,
    connections: DashMap<String, KillSwitchEntry>,
    audit: RwLock<VecDeque<AuditRecord>>,
    stats: RwLock<KillSwitchStats>,
}

impl KillSwitchRegistry {
    pub fn new(config: KillSwitchConfig) -> Self {
        Self {
            config,
            flags: RwLock::new(GlobalFlags::default()),
            customers: DashMap::new(),
            services: DashMap::new(),
            connections: DashMap::new(),
            audit: RwLock::new(VecDeque::new()),
            stats: RwLock::new(KillSwitchStats::default()),
        }
    }

    /// Activate a freeze at the given scope. `Global` needs no target id;
    /// every other scope does. Global activations default to no expiry and
    /// must be explicitly deactivated.
    pub fn activate(
        &self,
        scope: KillSwitchScope,
        target_id: Option<&str>,
        reason: &str,
        activated_by: &str,
        expires_at: Option<DateTime<Utc>>,
        notes: Option<String>,
    ) -> Result<()> {
        let entry = KillSwitchEntry {
            active: true,
            activated_at: Utc::now(),
            activated_by: activated_by.to_string(),
            reason: reason.to_string(),
            expires_at,
            notes,
        };

        if scope == KillSwitchScope::Global {
            self.flags.write().global = Some(entry);
            error!(
                activated_by = %activated_by,
                reason = %reason,
                "GLOBAL kill switch activated; all execution is frozen"
            );
        } else {
            let id = target_id.ok_or_else(|| {
                ExecutorError::InvalidRequest(format!("scope {} requires a target id", scope))
            })?;
            self.scope_map(scope).insert(id.to_string(), entry);
            warn!(
                scope = %scope,
                target_id = %id,
                activated_by = %activated_by,
                reason = %reason,
                "kill switch activated"
            );
        }

        self.stats.write().activations_total += 1;
        self.record_audit("activated", &scope.to_string(), target_id, activated_by, reason);
        Ok(())
    }

    /// Deactivate a freeze. Returns whether anything was actually removed.
    pub fn deactivate(
        &self,
        scope: KillSwitchScope,
        target_id: Option<&str>,
        deactivated_by: &str,
    ) -> Result<bool> {
        let removed = if scope == KillSwitchScope::Global {
            self.flags.write().global.take().is_some()
        } else {
            let id = target_id.ok_or_else(|| {
                ExecutorError::InvalidRequest(format!("scope {} requires a target id", scope))
            })?;
            self.scope_map(scope).remove(id).is_some()
        };

        if removed {
            info!(scope = %scope, deactivated_by = %deactivated_by, "kill switch deactivated");
            self.stats.write().deactivations_total += 1;
            self.record_audit(
                "deactivated",
                &scope.to_string(),
                target_id,
                deactivated_by,
                "deactivated by operator",
            );
        }
        Ok(removed)
    }

    /// Block all mutating actions while leaving reads untouched. Also the
    /// entry point the cost guard's self-monitor uses.
    pub fn enable_read_only(&self, enabled_by: &str, reason: &str) {
        let entry = KillSwitchEntry {
            active: true,
            activated_at: Utc::now(),
            activated_by: enabled_by.to_string(),
            reason: reason.to_string(),
            expires_at: None,
            notes: None,
        };
        self.flags.write().read_only = Some(entry);
        warn!(enabled_by = %enabled_by, reason = %reason, "read-only mode enabled");
        self.stats.write().activations_total += 1;
        self.record_audit("read_only_enabled", "read_only", None, enabled_by, reason);
    }

    pub fn disable_read_only(&self, disabled_by: &str) -> bool {
        let removed = self.flags.write().read_only.take().is_some();
        if removed {
            info!(disabled_by = %disabled_by, "read-only mode disabled");
            self.stats.write().deactivations_total += 1;
            self.record_audit(
                "read_only_disabled",
                "read_only",
                None,
                disabled_by,
                "disabled by operator",
            );
        }
        removed
    }

    pub fn is_read_only(&self) -> bool {
        self.flags
            .read()
            .read_only
            .as_ref()
            .map(KillSwitchEntry::is_blocking)
            .unwrap_or(false)
    }

    /// Answer whether this execution request may proceed right now.
    ///
    /// First match wins: global freeze, then read-only mode (writes only),
    /// then customer, service, and connection entries. Expiry is evaluated
    /// inline, so a stale entry stops blocking the moment it expires.
    pub fn check(&self, request: &ExecutionCheckRequest) -> KillSwitchCheck {
        let verdict = self.evaluate(request);

        let mut stats = self.stats.write();
        stats.checks_total += 1;
        if !verdict.allowed {
            stats.blocks_total += 1;
        }
        drop(stats);

        if let Some(reason) = &verdict.reason {
            warn!(
                customer_id = %request.customer_id,
                service = %request.service,
                action = %request.action,
                risk_level = %request.risk_level,
                reason = %reason,
                "execution blocked by kill switch"
            );
        } else {
            debug!(
                customer_id = %request.customer_id,
                action = %request.action,
                "kill switch check passed"
            );
        }
        verdict
    }

    fn evaluate(&self, request: &ExecutionCheckRequest) -> KillSwitchCheck {
        {
            let flags = self.flags.read();
            if let Some(entry) = &flags.global {
                if entry.is_blocking() {
                    return KillSwitchCheck::blocked(
                        BlockedScope::Global,
                        format!("all execution frozen: {}", entry.reason),
                    );
                }
            }
            if request.is_write {
                if let Some(entry) = &flags.read_only {
                    if entry.is_blocking() {
                        return KillSwitchCheck::blocked(
                            BlockedScope::ReadOnly,
                            format!("read-only mode active: {}", entry.reason),
                        );
                    }
                }
            }
        }

        if let Some(entry) = self.customers.get(&request.customer_id) {
            if entry.is_blocking() {
                return KillSwitchCheck::blocked(
                    BlockedScope::Customer,
                    format!("customer frozen: {}", entry.reason),
                );
            }
        }
        if let Some(entry) = self.services.get(&request.service) {
            if entry.is_blocking() {
                return KillSwitchCheck::blocked(
                    BlockedScope::Service,
                    format!("service frozen: {}", entry.reason),
                );
            }
        }
        if let Some(entry) = self.connections.get(&request.connection_id) {
            if entry.is_blocking() {
                return KillSwitchCheck::blocked(
                    BlockedScope::Connection,
                    format!("connection frozen: {}", entry.reason),
                );
            }
        }

        KillSwitchCheck::allowed()
    }

    /// Delete every entry whose expiry has passed. Driven by the server on
    /// a fixed interval; returns how many entries were removed.
    pub fn sweep_expired(&self) -> usize {
        let mut removed = 0;

        for (scope, map) in [
            (KillSwitchScope::Customer, &self.customers),
            (KillSwitchScope::Service, &self.services),
            (KillSwitchScope::Connection, &self.connections),
        ] {
            let expired: Vec<(String, KillSwitchEntry)> = map
                .iter()
                .filter(|item| item.value().is_expired())
                .map(|item| (item.key().clone(), item.value().clone()))
                .collect();
            for (id, entry) in expired {
                if map.remove(&id).is_some() {
                    removed += 1;
                    self.record_audit(
                        "expired",
                        &scope.to_string(),
                        Some(&id),
                        "sweep",
                        &entry.reason,
                    );
                }
            }
        }

        {
            let mut flags = self.flags.write();
            if flags.global.as_ref().map(KillSwitchEntry::is_expired) == Some(true) {
                let entry = flags.global.take();
                removed += 1;
                if let Some(entry) = entry {
                    self.record_audit("expired", "global", None, "sweep", &entry.reason);
                }
            }
        }

        if removed > 0 {
            info!(removed, "kill switch expiry sweep removed entries");
            self.stats.write().expired_total += removed as u64;
        }
        removed
    }

    /// Current registry state, counting only entries that are blocking now.
    pub fn status(&self) -> KillSwitchStatus {
        let flags = self.flags.read();
        KillSwitchStatus {
            global_active: flags
                .global
                .as_ref()
                .map(KillSwitchEntry::is_blocking)
                .unwrap_or(false),
            read_only_active: flags
                .read_only
                .as_ref()
                .map(KillSwitchEntry::is_blocking)
                .unwrap_or(false),
            customer_switches: self.count_blocking(&self.customers),
            service_switches: self.count_blocking(&self.services),
            connection_switches: self.count_blocking(&self.connections),
            audit_records: self.audit.read().len(),
        }
    }

    pub fn stats(&self) -> KillSwitchStats {
        self.stats.read().clone()
    }

    /// Most recent audit records, newest first.
    pub fn audit_log(&self, limit: usize) -> Vec<AuditRecord> {
        let audit = self.audit.read();
        audit.iter().rev().take(limit).cloned().collect()
    }

    /// Static documentation of every way execution can be stopped,
    /// including customer-side controls that work even when this service
    /// is unreachable.
    pub fn emergency_stop_methods() -> &'static [EmergencyStopMethod] {
        &EMERGENCY_STOP_METHODS
    }

    // Only called for scoped entries; Global lives in the flags lock.
    fn scope_map(&self, scope: KillSwitchScope) -> &DashMap<String, KillSwitchEntry> {
        match scope {
            KillSwitchScope::Customer => &self.customers,
            KillSwitchScope::Service => &self.services,
            KillSwitchScope::Global | KillSwitchScope::Connection => &self.connections,
        }
    }

    fn count_blocking(&self, map: &DashMap<String, KillSwitchEntry>) -> usize {
        map.iter().filter(|item| item.value().is_blocking()).count()
    }

    fn record_audit(
        &self,
        event: &str,
        scope: &str,
        target_id: Option<&str>,
        actor: &str,
        reason: &str,
    ) {
        let record = AuditRecord {
            timestamp: Utc::now(),
            event: event.to_string(),
            scope: scope.to_string(),
            target_id: target_id.map(str::to_string),
            actor: actor.to_string(),
            reason: reason.to_string(),
        };

        let mut audit = self.audit.write();
        if audit.len() >= self.config.audit_capacity {
            audit.pop_front();
        }
        audit.push_back(record);
    }
}

static EMERGENCY_STOP_METHODS: Lazy<Vec<EmergencyStopMethod>> = Lazy::new(|| {
    vec![
        EmergencyStopMethod {
            method: "iam-role-revoke".to_string(),
            operated_by: "customer".to_string(),
            description: "Delete or edit the trust policy of the cross-account role the \
                          platform assumes. No new credentials can be issued afterwards."
                .to_string(),
            takes_effect: "immediately for new executions; in-flight sessions expire within \
                           the credential lifetime"
                .to_string(),
        },
        EmergencyStopMethod {
            method: "scp-deny".to_string(),
            operated_by: "customer".to_string(),
            description: "Attach a service control policy denying the platform role's \
                          actions at the organization or account level."
                .to_string(),
            takes_effect: "immediately for every API call, including in-flight executions"
                .to_string(),
        },
        EmergencyStopMethod {
            method: "external-id-rotation".to_string(),
            operated_by: "customer".to_string(),
            description: "Rotate the external id on the cross-account role so existing \
                          connection records can no longer assume it."
                .to_string(),
            takes_effect: "immediately for new executions".to_string(),
        },
        EmergencyStopMethod {
            method: "global-kill-switch".to_string(),
            operated_by: "platform".to_string(),
            description: "Freezes every execution for every customer until explicitly \
                          deactivated."
                .to_string(),
            takes_effect: "at the next admission check; running steps finish, no new step \
                           starts a new execution"
                .to_string(),
        },
        EmergencyStopMethod {
            method: "customer-kill-switch".to_string(),
            operated_by: "platform".to_string(),
            description: "Freezes executions for one customer, optionally with an expiry."
                .to_string(),
            takes_effect: "at the next admission check".to_string(),
        },
        EmergencyStopMethod {
            method: "read-only-mode".to_string(),
            operated_by: "platform".to_string(),
            description: "Blocks all mutating actions system-wide; also tripped \
                          automatically by the cost guard's self-monitor."
                .to_string(),
            takes_effect: "at the next admission check".to_string(),
        },
    ]
});

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use cloudward_shared::RiskLevel;

    fn create_test_registry() -> KillSwitchRegistry {
        KillSwitchRegistry::new(KillSwitchConfig::default())
    }

    fn check_request(is_write: bool) -> ExecutionCheckRequest {
        ExecutionCheckRequest {
            customer_id: "cust-1".to_string(),
            service: "ec2".to_string(),
            connection_id: "conn-1".to_string(),
            action: "ec2.stop".to_string(),
            is_write,
            risk_level: RiskLevel::Medium,
        }
    }

    #[test]
    fn test_clean_registry_allows() {
        let registry = create_test_registry();
        let verdict = registry.check(&check_request(true));
        assert!(verdict.allowed);
        assert!(verdict.scope.is_none());
    }

    #[test]
    fn test_global_blocks_everything_and_restores() {
        let registry = create_test_registry();
        registry
            .activate(
                KillSwitchScope::Customer,
                Some("other-customer"),
                "billing dispute",
                "ops",
                None,
                None,
            )
            .unwrap();

        registry
            .activate(KillSwitchScope::Global, None, "incident", "ops", None, None)
            .unwrap();
        let verdict = registry.check(&check_request(false));
        assert!(!verdict.allowed);
        assert_eq!(verdict.scope, Some(BlockedScope::Global));

        assert!(registry.deactivate(KillSwitchScope::Global, None, "ops").unwrap());
        // Prior per-scope state is untouched by the global round trip.
        assert!(registry.check(&check_request(true)).allowed);
        let mut other = check_request(true);
        other.customer_id = "other-customer".to_string();
        assert_eq!(registry.check(&other).scope, Some(BlockedScope::Customer));
    }

    #[test]
    fn test_read_only_blocks_writes_only() {
        let registry = create_test_registry();
        registry.enable_read_only("self-monitor", "net cost increase");

        assert!(!registry.check(&check_request(true)).allowed);
        assert!(registry.check(&check_request(false)).allowed);

        assert!(registry.disable_read_only("ops"));
        assert!(registry.check(&check_request(true)).allowed);
    }

    #[test]
    fn test_precedence_order() {
        let registry = create_test_registry();
        registry
            .activate(
                KillSwitchScope::Connection,
                Some("conn-1"),
                "flapping",
                "ops",
                None,
                None,
            )
            .unwrap();
        registry
            .activate(
                KillSwitchScope::Customer,
                Some("cust-1"),
                "requested pause",
                "ops",
                None,
                None,
            )
            .unwrap();

        // Customer outranks connection in the fixed order.
        let verdict = registry.check(&check_request(true));
        assert_eq!(verdict.scope, Some(BlockedScope::Customer));
    }

    #[test]
    fn test_scoped_activation_requires_target() {
        let registry = create_test_registry();
        let err = registry
            .activate(KillSwitchScope::Service, None, "x", "ops", None, None)
            .unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidRequest(_)));
    }

    #[test]
    fn test_expired_entry_is_inactive_before_sweep() {
        let registry = create_test_registry();
        registry
            .activate(
                KillSwitchScope::Customer,
                Some("cust-1"),
                "short pause",
                "ops",
                Some(Utc::now() - Duration::seconds(1)),
                None,
            )
            .unwrap();

        // Not yet swept, but the check must already ignore it.
        assert!(registry.check(&check_request(true)).allowed);

        let removed = registry.sweep_expired();
        assert_eq!(removed, 1);
        assert_eq!(registry.status().customer_switches, 0);
    }

    #[test]
    fn test_sweep_keeps_unexpired_entries() {
        let registry = create_test_registry();
        registry
            .activate(
                KillSwitchScope::Service,
                Some("rds"),
                "maintenance window",
                "ops",
                Some(Utc::now() + Duration::hours(1)),
                None,
            )
            .unwrap();

        assert_eq!(registry.sweep_expired(), 0);
        assert_eq!(registry.status().service_switches, 1);
    }

    #[test]
    fn test_audit_ring_records_lifecycle() {
        let registry = create_test_registry();
        registry
            .activate(KillSwitchScope::Global, None, "incident", "ops", None, None)
            .unwrap();
        registry.deactivate(KillSwitchScope::Global, None, "ops").unwrap();

        let log = registry.audit_log(10);
        assert_eq!(log.len(), 2);
        // Newest first.
        assert_eq!(log[0].event, "deactivated");
        assert_eq!(log[1].event, "activated");
        assert_eq!(log[1].actor, "ops");
    }

    #[test]
    fn test_audit_ring_is_bounded() {
        let registry = KillSwitchRegistry::new(KillSwitchConfig {
            audit_capacity: 3,
            ..KillSwitchConfig::default()
        });
        for i in 0..5 {
            registry
                .activate(
                    KillSwitchScope::Customer,
                    Some(&format!("cust-{}", i)),
                    "pause",
                    "ops",
                    None,
                    None,
                )
                .unwrap();
        }
        assert_eq!(registry.audit_log(10).len(), 3);
    }

    #[test]
    fn test_emergency_stop_methods_cover_both_sides() {
        let methods = KillSwitchRegistry::emergency_stop_methods();
        assert!(methods.len() >= 4);
        assert!(methods.iter().any(|m| m.operated_by == "customer"));
        assert!(methods.iter().any(|m| m.operated_by == "platform"));
        assert!(methods.iter().any(|m| m.method == "global-kill-switch"));
    }
}
