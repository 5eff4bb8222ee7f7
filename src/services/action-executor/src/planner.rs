//! Plan Generator
//!
//! Converts a validated action descriptor into an ordered, resource-batched
//! `ExecutionPlan`: pre-check steps, one mutating step per resource batch
//! chained strictly one after another, post-check steps, an aggregated
//! summary, a textual visualization, and, for reversible actions, an
//! auto-synthesized rollback plan built from the inverse-action table.
//! Plans expire a fixed interval after creation; expiry is the only thing
//! `validate` checks.

use chrono::{Duration, Utc};
use cloudward_shared::{
    ApiCall, Connection, ExecutionPlan, ExecutionStep, PlanSummary, RiskLevel, StepImpact,
    StepStatus, ValidatedAction,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::actions::{self, ActionSpec, PostCheck};
use crate::clients::{PermissionBoundary, PermissionRequest};
use crate::error::{ExecutorError, Result};

/// Generator tuning knobs.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Plans expire this long after creation.
    pub plan_ttl_minutes: i64,
    /// Resources per mutating batch step.
    pub batch_size: usize,
    /// Hard cap on resources per plan.
    pub max_resources_per_plan: usize,
    /// Duration estimate for one pre/post-check step.
    pub check_duration_ms: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            plan_ttl_minutes: 15,
            batch_size: 10,
            max_resources_per_plan: 100,
            check_duration_ms: 500,
        }
    }
}

/// Counters kept for operational visibility.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlannerStats {
    pub plans_generated: u64,
    pub rollback_plans_generated: u64,
    pub rejections_total: u64,
}

/// Result of the freshness check on a previously generated plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanValidation {
    pub valid: bool,
    pub reason: Option<String>,
}

#[derive(Debug)]
pub struct PlanGenerator {
    config: PlannerConfig,
    permission_boundary: Arc<dyn PermissionBoundary>,
    stats: RwLock<PlannerStats>,
}

impl PlanGenerator {
    pub fn new(config: PlannerConfig, permission_boundary: Arc<dyn PermissionBoundary>) -> Self {
        Self {
            config,
            permission_boundary,
            stats: RwLock::new(PlannerStats::default()),
        }
    }

    /// Generate a plan for one validated action against one connection.
    ///
    /// `resources` overrides the descriptor's resource list when supplied.
    /// Fails when the action has no catalog entry, the permission boundary
    /// denies it, or the resource count exceeds the per-plan cap.
    pub async fn generate(
        &self,
        action: &ValidatedAction,
        connection: &Connection,
        resources: Option<&[String]>,
    ) -> Result<ExecutionPlan> {
        let result = self.generate_inner(action, connection, resources).await;
        match &result {
            Ok(plan) => {
                let mut stats = self.stats.write();
                stats.plans_generated += 1;
                if plan.rollback_plan.is_some() {
                    stats.rollback_plans_generated += 1;
                }
            }
            Err(_) => self.stats.write().rejections_total += 1,
        }
        result
    }

    async fn generate_inner(
        &self,
        action: &ValidatedAction,
        connection: &Connection,
        resources: Option<&[String]>,
    ) -> Result<ExecutionPlan> {
        if !actions::is_valid_action_id(&action.action) {
            return Err(ExecutorError::UnknownAction(format!(
                "{} is not a dot-namespaced action identifier",
                action.action
            )));
        }
        let spec = actions::lookup(&action.action).ok_or_else(|| {
            ExecutorError::UnknownAction(format!("{} has no catalog entry", action.action))
        })?;

        let resources: Vec<String> = resources
            .map(<[String]>::to_vec)
            .unwrap_or_else(|| action.resources.clone());
        if resources.len() > self.config.max_resources_per_plan {
            return Err(ExecutorError::ResourceLimitExceeded(format!(
                "{} resources exceed the per-plan limit of {}",
                resources.len(),
                self.config.max_resources_per_plan
            )));
        }

        // Explicit regions win; otherwise the connection's allowlist is the
        // plan's region set.
        let regions: Vec<String> = if action.regions.is_empty() {
            connection.allowed_regions.clone()
        } else {
            action.regions.clone()
        };
        let primary_region = regions.first().cloned();

        let decision = self
            .permission_boundary
            .validate_action(
                &PermissionRequest {
                    service: spec.service.to_string(),
                    action: spec.action.to_string(),
                    resources: resources.clone(),
                    region: primary_region.clone(),
                },
                connection,
            )
            .await?;
        if !decision.allowed {
            return Err(ExecutorError::PermissionDenied(
                decision
                    .reason
                    .unwrap_or_else(|| format!("{} denied for this connection", spec.action)),
            ));
        }

        let plan = self.assemble_plan(spec, action, &resources, regions, primary_region, true);
        info!(
            plan_id = %plan.plan_id,
            action = %spec.action,
            steps = plan.summary.total_steps,
            resources = plan.summary.resources_affected,
            cost_impact = plan.summary.estimated_cost_impact,
            has_rollback = plan.rollback_plan.is_some(),
            "execution plan generated"
        );
        Ok(plan)
    }

    /// Freshness validation. Staleness is the only reason a generated plan
    /// becomes invalid; nothing else is re-checked here.
    pub fn validate(&self, plan: &ExecutionPlan) -> PlanValidation {
        if plan.is_expired() {
            PlanValidation {
                valid: false,
                reason: Some(format!(
                    "plan {} expired at {}",
                    plan.plan_id, plan.expires_at
                )),
            }
        } else {
            PlanValidation {
                valid: true,
                reason: None,
            }
        }
    }

    pub fn stats(&self) -> PlannerStats {
        self.stats.read().clone()
    }

    fn assemble_plan(
        &self,
        spec: &ActionSpec,
        action: &ValidatedAction,
        resources: &[String],
        regions: Vec<String>,
        primary_region: Option<String>,
        with_rollback: bool,
    ) -> ExecutionPlan {
        let mut steps: Vec<ExecutionStep> = Vec::new();
        let mut order: u32 = 0;

        // Pre-checks, chained so the whole plan stays a single line.
        for check in spec.pre_checks {
            let depends_on = steps
                .last()
                .map(|prev: &ExecutionStep| vec![prev.step_id.clone()])
                .unwrap_or_default();
            steps.push(ExecutionStep {
                step_id: new_step_id(),
                order,
                service: spec.service.to_string(),
                action: check.tag().to_string(),
                description: check.description().to_string(),
                resources: vec![],
                impact: StepImpact::none(),
                api_calls: vec![],
                depends_on,
                status: StepStatus::Pending,
                result: None,
            });
            order += 1;
        }

        // One mutating step per batch. An empty resource list still yields
        // one empty batch so the action itself is represented.
        let batches: Vec<&[String]> = if resources.is_empty() {
            vec![&resources[..]]
        } else {
            resources.chunks(self.config.batch_size).collect()
        };
        let batch_count = batches.len();
        for (index, batch) in batches.into_iter().enumerate() {
            let depends_on = steps
                .last()
                .map(|prev| vec![prev.step_id.clone()])
                .unwrap_or_default();
            let api_calls: Vec<ApiCall> = spec
                .operations
                .iter()
                .map(|operation| ApiCall {
                    service: spec.service.to_string(),
                    operation: (*operation).to_string(),
                    parameters: serde_json::json!({
                        "resources": batch,
                        "region": primary_region,
                        "parameters": action.parameters,
                    }),
                    expected_duration_ms: spec.call_duration_ms,
                })
                .collect();

            let step = ExecutionStep {
                step_id: new_step_id(),
                order,
                service: spec.service.to_string(),
                action: spec.action.to_string(),
                description: format!(
                    "{} (batch {} of {}, {} resources)",
                    spec.description,
                    index + 1,
                    batch_count,
                    batch.len()
                ),
                resources: batch.to_vec(),
                impact: StepImpact {
                    resource_count: batch.len() as u32,
                    cost_change: spec.per_resource_monthly_delta * batch.len() as f64,
                    reversible: spec.reversible,
                    downtime: spec.downtime,
                    data_loss: spec.data_loss,
                    risk_level: spec.risk_level,
                },
                api_calls,
                depends_on,
                status: StepStatus::Pending,
                result: None,
            };
            steps.push(step);
            order += 1;
        }
        let last_action_step_id = steps
            .last()
            .map(|s| s.step_id.clone())
            .unwrap_or_default();

        // Post-checks all hang off the last mutating step.
        for check in PostCheck::all() {
            steps.push(ExecutionStep {
                step_id: new_step_id(),
                order,
                service: spec.service.to_string(),
                action: check.tag().to_string(),
                description: check.description().to_string(),
                resources: vec![],
                impact: StepImpact::none(),
                api_calls: vec![],
                depends_on: vec![last_action_step_id.clone()],
                status: StepStatus::Pending,
                result: None,
            });
            order += 1;
        }

        let summary = self.summarize(spec, action, &steps, resources);
        let visualization = Some(build_visualization(&steps));

        let rollback_plan = if with_rollback {
            self.synthesize_rollback(spec, action, resources, &regions, &primary_region)
        } else {
            None
        };

        let now = Utc::now();
        ExecutionPlan {
            plan_id: format!("plan_{}", Uuid::new_v4().simple()),
            dsl_hash: action.dsl_hash.clone(),
            dsl_version: action.dsl_version.clone(),
            steps,
            summary,
            regions,
            visualization,
            rollback_plan: rollback_plan.map(Box::new),
            created_at: now,
            expires_at: now + Duration::minutes(self.config.plan_ttl_minutes),
        }
    }

    fn summarize(
        &self,
        spec: &ActionSpec,
        action: &ValidatedAction,
        steps: &[ExecutionStep],
        resources: &[String],
    ) -> PlanSummary {
        let estimated_duration_ms: u64 = steps
            .iter()
            .map(|step| {
                if step.is_check() {
                    self.config.check_duration_ms
                } else {
                    step.api_calls.iter().map(|c| c.expected_duration_ms).sum()
                }
            })
            .sum();
        let estimated_cost_impact: f64 = steps.iter().map(|s| s.impact.cost_change).sum();
        let risk_score = steps
            .iter()
            .map(|s| s.impact.risk_level)
            .max()
            .unwrap_or(RiskLevel::Low)
            .score();

        PlanSummary {
            total_steps: steps.len() as u32,
            estimated_duration_ms,
            estimated_cost_impact,
            risk_score,
            resources_affected: resources.len() as u32,
            services_affected: vec![spec.service.to_string()],
            requires_approval: action.requires_approval.unwrap_or(spec.requires_approval),
            reversible: steps.iter().all(|s| s.impact.reversible),
        }
    }

    /// Build the inverse plan for a reversible action. Rollback plans never
    /// require a fresh approval: they are a failure-recovery reaction, not
    /// a new user-initiated action.
    fn synthesize_rollback(
        &self,
        spec: &ActionSpec,
        action: &ValidatedAction,
        resources: &[String],
        regions: &[String],
        primary_region: &Option<String>,
    ) -> Option<ExecutionPlan> {
        let inverse = actions::inverse_of(spec.action)?;
        let inverse_action = ValidatedAction {
            action: inverse.action.to_string(),
            resources: resources.to_vec(),
            regions: regions.to_vec(),
            parameters: action.parameters.clone(),
            dsl_hash: action.dsl_hash.clone(),
            dsl_version: action.dsl_version.clone(),
            requires_approval: Some(false),
        };

        debug!(
            action = %spec.action,
            inverse = %inverse.action,
            "synthesized rollback plan"
        );
        Some(self.assemble_plan(
            inverse,
            &inverse_action,
            resources,
            regions.to_vec(),
            primary_region.clone(),
            false,
        ))
    }
}

fn new_step_id() -> String {
    format!("step_{}", Uuid::new_v4().simple())
}

/// Directed visualization of a plan: one node per step, check steps in
/// stadium brackets, mutating steps in rectangles, edges following the
/// dependency chain.
fn build_visualization(steps: &[ExecutionStep]) -> String {
    let mut lines = vec!["graph TD".to_string()];

    for (index, step) in steps.iter().enumerate() {
        let label = if step.is_check() {
            step.action.clone()
        } else {
            format!("{} - {} resources", step.action, step.resources.len())
        };
        if step.is_check() {
            lines.push(format!("    s{}([\"{}\"])", index, label));
        } else {
            lines.push(format!("    s{}[\"{}\"]", index, label));
        }
    }

    for (index, step) in steps.iter().enumerate() {
        for dependency in &step.depends_on {
            if let Some(dep_index) = steps.iter().position(|s| &s.step_id == dependency) {
                lines.push(format!("    s{} --> s{}", dep_index, index));
            }
        }
    }

    lines.join("\n")
}
