//! Action catalog
//!
//! Static metadata for every governed action the platform can execute:
//! which cloud service and API operations it maps to, its per-resource
//! monthly cost estimate, duration estimate, risk classification, and its
//! inverse action when one exists. The plan generator resolves validated
//! action descriptors against this catalog; actions missing here cannot be
//! planned at all.

use cloudward_shared::RiskLevel;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// Pre-execution verification types a catalog entry can declare. Each one
/// becomes a zero-resource, zero-cost step ahead of the mutating batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreCheck {
    Permissions,
    Backup,
    Dependencies,
    CostEstimate,
    Idleness,
    Tags,
}

impl PreCheck {
    pub fn tag(&self) -> &'static str {
        match self {
            PreCheck::Permissions => "precheck:permissions",
            PreCheck::Backup => "precheck:backup",
            PreCheck::Dependencies => "precheck:dependencies",
            PreCheck::CostEstimate => "precheck:cost_estimate",
            PreCheck::Idleness => "precheck:idleness",
            PreCheck::Tags => "precheck:tags",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            PreCheck::Permissions => "Verify the connection may perform every declared API call",
            PreCheck::Backup => "Verify a recent backup or snapshot exists for affected resources",
            PreCheck::Dependencies => "Verify no dependent resource relies on the targets",
            PreCheck::CostEstimate => "Confirm the cost estimate against current pricing",
            PreCheck::Idleness => "Verify the targets are idle enough to act on",
            PreCheck::Tags => "Verify governance tags permit automation on the targets",
        }
    }
}

/// Post-execution verification types, appended symmetrically after the
/// mutating batches. The same three apply to every action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostCheck {
    VerifyState,
    UpdateInventory,
    Notify,
}

impl PostCheck {
    pub fn tag(&self) -> &'static str {
        match self {
            PostCheck::VerifyState => "postcheck:verify_state",
            PostCheck::UpdateInventory => "postcheck:update_inventory",
            PostCheck::Notify => "postcheck:notify",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            PostCheck::VerifyState => "Verify every target reached the expected final state",
            PostCheck::UpdateInventory => "Record the new resource state in the inventory",
            PostCheck::Notify => "Notify subscribed channels of the completed action",
        }
    }

    pub fn all() -> &'static [PostCheck] {
        &[
            PostCheck::VerifyState,
            PostCheck::UpdateInventory,
            PostCheck::Notify,
        ]
    }
}

/// Catalog entry for one governed action type.
#[derive(Debug, Clone)]
pub struct ActionSpec {
    /// Dot-namespaced identifier, e.g. `ec2.stop`.
    pub action: &'static str,
    pub service: &'static str,
    pub resource_type: &'static str,
    pub description: &'static str,
    /// Cloud API operations run per batch, in order.
    pub operations: &'static [&'static str],
    /// Signed monthly USD estimate per affected resource.
    pub per_resource_monthly_delta: f64,
    /// Expected duration of one API call.
    pub call_duration_ms: u64,
    pub risk_level: RiskLevel,
    pub reversible: bool,
    /// True only for actions known to interrupt service.
    pub downtime: bool,
    pub data_loss: bool,
    /// Default approval requirement; a descriptor override wins.
    pub requires_approval: bool,
    /// Inverse action used to synthesize rollback plans. Actions without
    /// one never get an auto-generated rollback plan.
    pub inverse: Option<&'static str>,
    pub pre_checks: &'static [PreCheck],
}

static ACTION_CATALOG: Lazy<HashMap<&'static str, ActionSpec>> = Lazy::new(|| {
    let entries = [
        ActionSpec {
            action: "ec2.stop",
            service: "ec2",
            resource_type: "instance",
            description: "Stop compute instances",
            operations: &["StopInstances"],
            per_resource_monthly_delta: -50.0,
            call_duration_ms: 30_000,
            risk_level: RiskLevel::Medium,
            reversible: true,
            downtime: true,
            data_loss: false,
            requires_approval: true,
            inverse: Some("ec2.start"),
            pre_checks: &[
                PreCheck::Permissions,
                PreCheck::Dependencies,
                PreCheck::Idleness,
                PreCheck::Tags,
            ],
        },
        ActionSpec {
            action: "ec2.start",
            service: "ec2",
            resource_type: "instance",
            description: "Start compute instances",
            operations: &["StartInstances"],
            per_resource_monthly_delta: 50.0,
            call_duration_ms: 30_000,
            risk_level: RiskLevel::Low,
            reversible: true,
            downtime: false,
            data_loss: false,
            requires_approval: true,
            inverse: Some("ec2.stop"),
            pre_checks: &[PreCheck::Permissions, PreCheck::CostEstimate, PreCheck::Tags],
        },
        ActionSpec {
            action: "ec2.resize",
            service: "ec2",
            resource_type: "instance",
            description: "Change the instance class of compute instances",
            operations: &["StopInstances", "ModifyInstanceAttribute", "StartInstances"],
            per_resource_monthly_delta: 25.0,
            call_duration_ms: 45_000,
            risk_level: RiskLevel::High,
            // The previous instance class is not recorded anywhere, so there
            // is no automatic way back.
            reversible: false,
            downtime: true,
            data_loss: false,
            requires_approval: true,
            inverse: None,
            pre_checks: &[
                PreCheck::Permissions,
                PreCheck::Dependencies,
                PreCheck::CostEstimate,
                PreCheck::Idleness,
                PreCheck::Tags,
            ],
        },
        ActionSpec {
            action: "rds.stop",
            service: "rds",
            resource_type: "db_instance",
            description: "Stop database instances",
            operations: &["StopDBInstance"],
            per_resource_monthly_delta: -100.0,
            call_duration_ms: 60_000,
            risk_level: RiskLevel::High,
            reversible: true,
            downtime: true,
            data_loss: false,
            requires_approval: true,
            inverse: Some("rds.start"),
            pre_checks: &[
                PreCheck::Permissions,
                PreCheck::Backup,
                PreCheck::Dependencies,
                PreCheck::Idleness,
                PreCheck::Tags,
            ],
        },
        ActionSpec {
            action: "rds.start",
            service: "rds",
            resource_type: "db_instance",
            description: "Start database instances",
            operations: &["StartDBInstance"],
            per_resource_monthly_delta: 100.0,
            call_duration_ms: 60_000,
            risk_level: RiskLevel::Low,
            reversible: true,
            downtime: false,
            data_loss: false,
            requires_approval: true,
            inverse: Some("rds.stop"),
            pre_checks: &[PreCheck::Permissions, PreCheck::CostEstimate, PreCheck::Tags],
        },
        ActionSpec {
            action: "rds.snapshot",
            service: "rds",
            resource_type: "db_instance",
            description: "Snapshot database instances",
            operations: &["CreateDBSnapshot"],
            per_resource_monthly_delta: 5.0,
            call_duration_ms: 120_000,
            risk_level: RiskLevel::Low,
            reversible: false,
            downtime: false,
            data_loss: false,
            requires_approval: true,
            inverse: None,
            pre_checks: &[PreCheck::Permissions, PreCheck::Tags],
        },
        ActionSpec {
            action: "rds.resize",
            service: "rds",
            resource_type: "db_instance",
            description: "Change the instance class of database instances",
            operations: &["ModifyDBInstance"],
            per_resource_monthly_delta: 150.0,
            call_duration_ms: 180_000,
            risk_level: RiskLevel::High,
            reversible: false,
            downtime: true,
            data_loss: false,
            requires_approval: true,
            inverse: None,
            pre_checks: &[
                PreCheck::Permissions,
                PreCheck::Backup,
                PreCheck::Dependencies,
                PreCheck::CostEstimate,
                PreCheck::Tags,
            ],
        },
        ActionSpec {
            action: "s3.set_lifecycle",
            service: "s3",
            resource_type: "bucket",
            description: "Apply a lifecycle configuration to buckets",
            operations: &["PutBucketLifecycleConfiguration"],
            per_resource_monthly_delta: -30.0,
            call_duration_ms: 5_000,
            risk_level: RiskLevel::Medium,
            reversible: true,
            downtime: false,
            data_loss: true,
            requires_approval: true,
            inverse: Some("s3.delete_lifecycle"),
            pre_checks: &[PreCheck::Permissions, PreCheck::Backup, PreCheck::Tags],
        },
        ActionSpec {
            action: "s3.delete_lifecycle",
            service: "s3",
            resource_type: "bucket",
            description: "Remove the lifecycle configuration from buckets",
            operations: &["DeleteBucketLifecycle"],
            per_resource_monthly_delta: 30.0,
            call_duration_ms: 5_000,
            risk_level: RiskLevel::Low,
            reversible: true,
            downtime: false,
            data_loss: false,
            requires_approval: true,
            inverse: Some("s3.set_lifecycle"),
            pre_checks: &[PreCheck::Permissions, PreCheck::Tags],
        },
        ActionSpec {
            action: "s3.set_tiering",
            service: "s3",
            resource_type: "bucket",
            description: "Apply an intelligent tiering configuration to buckets",
            operations: &["PutBucketIntelligentTieringConfiguration"],
            per_resource_monthly_delta: -20.0,
            call_duration_ms: 5_000,
            risk_level: RiskLevel::Low,
            reversible: true,
            downtime: false,
            data_loss: false,
            requires_approval: true,
            inverse: Some("s3.delete_tiering"),
            pre_checks: &[PreCheck::Permissions, PreCheck::Tags],
        },
        ActionSpec {
            action: "s3.delete_tiering",
            service: "s3",
            resource_type: "bucket",
            description: "Remove the intelligent tiering configuration from buckets",
            operations: &["DeleteBucketIntelligentTieringConfiguration"],
            per_resource_monthly_delta: 20.0,
            call_duration_ms: 5_000,
            risk_level: RiskLevel::Low,
            reversible: true,
            downtime: false,
            data_loss: false,
            requires_approval: true,
            inverse: Some("s3.set_tiering"),
            pre_checks: &[PreCheck::Permissions, PreCheck::Tags],
        },
        ActionSpec {
            action: "lambda.update_config",
            service: "lambda",
            resource_type: "function",
            description: "Update function memory/timeout configuration",
            operations: &["UpdateFunctionConfiguration"],
            per_resource_monthly_delta: -10.0,
            call_duration_ms: 10_000,
            risk_level: RiskLevel::Medium,
            reversible: false,
            downtime: false,
            data_loss: false,
            requires_approval: true,
            inverse: None,
            pre_checks: &[PreCheck::Permissions, PreCheck::Dependencies, PreCheck::Tags],
        },
    ];

    entries.into_iter().map(|spec| (spec.action, spec)).collect()
});

static ACTION_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z][a-z0-9_]*\.[a-z][a-z0-9_]*$").unwrap()
});

/// Look up a catalog entry by its dot-namespaced identifier.
pub fn lookup(action: &str) -> Option<&'static ActionSpec> {
    ACTION_CATALOG.get(action)
}

/// The catalog entry for an action's inverse, when the table declares one.
pub fn inverse_of(action: &str) -> Option<&'static ActionSpec> {
    lookup(action).and_then(|spec| spec.inverse).and_then(lookup)
}

/// Whether a string is shaped like a catalog action identifier.
pub fn is_valid_action_id(action: &str) -> bool {
    ACTION_ID_RE.is_match(action)
}

/// All known action identifiers, for diagnostics and docs endpoints.
pub fn known_actions() -> Vec<&'static str> {
    let mut actions: Vec<&'static str> = ACTION_CATALOG.keys().copied().collect();
    actions.sort_unstable();
    actions
}
