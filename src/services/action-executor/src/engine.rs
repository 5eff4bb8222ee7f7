//! Execution Engine
//!
//! Runs approved plans against the cloud provider. Admission revalidates
//! everything that matters at the moment of execution: the single-use
//! approval token, plan freshness, the kill-switch registry, and the
//! connection's simulation gate. Steps then run strictly in order with
//! progress events around each one, cooperative cancellation between
//! steps, per-call permission checks, and an automatic rollback of the
//! completed batches when a mutating step fails partway through.

use chrono::{DateTime, Utc};
use cloudward_shared::{
    ApprovalGrant, CancellationResult, Connection, ExecutionCheckRequest, ExecutionContext,
    ExecutionPlan, ExecutionProgress, ExecutionResult, ExecutionStatus, ExecutionStep, RiskLevel,
    StepOutcome, StepResult, StepStatus,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::approvals::ApprovalStore;
use crate::clients::{
    CloudDispatcher, ConnectionStore, CredentialIssuer, PermissionBoundary, PermissionRequest,
    TemporaryCredentials,
};
use crate::costguard::CostAnomalyGuard;
use crate::error::{ExecutorError, Result};
use crate::killswitch::KillSwitchRegistry;
use crate::planner::PlanGenerator;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Simulated latency of one pre/post-check step.
    pub check_latency_ms: u64,
    /// Buffered progress events per in-flight execution for late
    /// subscribers.
    pub progress_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            check_latency_ms: 50,
            progress_buffer: 64,
        }
    }
}

/// Counters kept for operational visibility.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub executions_started: u64,
    pub completed_total: u64,
    pub partial_total: u64,
    pub failed_total: u64,
    pub rolled_back_total: u64,
    pub cancelled_total: u64,
    pub api_calls_dispatched: u64,
}

/// Snapshot of one in-flight execution, for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveExecutionView {
    pub plan_id: String,
    pub user_id: String,
    pub customer_id: String,
    pub connection_id: String,
    pub started_at: DateTime<Utc>,
    pub cancel_requested: bool,
}

/// Registry entry for one in-flight execution. The cancel flag is shared
/// with the step loop; the broadcast sender feeds late progress
/// subscribers.
#[derive(Debug)]
struct ActiveExecution {
    user_id: String,
    customer_id: String,
    connection_id: String,
    started_at: DateTime<Utc>,
    cancel_requested: Arc<AtomicBool>,
    events: broadcast::Sender<ExecutionProgress>,
}

/// Everything the engine calls out to, injected at construction.
#[derive(Clone)]
pub struct EngineDependencies {
    pub approvals: Arc<ApprovalStore>,
    pub kill_switches: Arc<KillSwitchRegistry>,
    pub cost_guard: Arc<CostAnomalyGuard>,
    pub planner: Arc<PlanGenerator>,
    pub permission_boundary: Arc<dyn PermissionBoundary>,
    pub credential_issuer: Arc<dyn CredentialIssuer>,
    pub dispatcher: Arc<dyn CloudDispatcher>,
    pub connections: Arc<dyn ConnectionStore>,
}

/// Fans one progress event out to the caller's channel and to any
/// broadcast subscribers. Send failures mean nobody is listening and are
/// ignored.
struct ProgressEmitter {
    plan_id: String,
    total_steps: u32,
    external: Option<mpsc::UnboundedSender<ExecutionProgress>>,
    subscribers: broadcast::Sender<ExecutionProgress>,
}

impl ProgressEmitter {
    fn emit(&self, step_id: Option<String>, current_step: u32, completed: u32, message: String) {
        let percent = if self.total_steps == 0 {
            100.0
        } else {
            completed as f32 / self.total_steps as f32 * 100.0
        };
        let event = ExecutionProgress {
            plan_id: self.plan_id.clone(),
            step_id,
            current_step,
            total_steps: self.total_steps,
            percent,
            message,
            timestamp: Utc::now(),
        };
        if let Some(sender) = &self.external {
            let _ = sender.send(event.clone());
        }
        let _ = self.subscribers.send(event);
    }
}

/// Per-run parameters shared by every step of one phase.
struct StepRunContext<'a> {
    connection: &'a Connection,
    credentials: &'a TemporaryCredentials,
    primary_region: Option<String>,
    customer_id: &'a str,
    /// "step" for the forward plan, "rollback step" during recovery.
    label: &'static str,
    /// Cancellation is honored between steps of the forward plan only;
    /// once recovery starts it runs to its own end.
    cancel: Option<&'a AtomicBool>,
    /// When set, only the first N mutating steps run. Used to confine a
    /// rollback to the batches whose forward counterparts completed.
    action_batch_limit: Option<usize>,
}

/// Accumulated outcome of one pass over a step list.
#[derive(Debug, Default)]
struct StepRun {
    completed: u32,
    api_calls: u64,
    failure: Option<(usize, String)>,
    cancelled: bool,
}

/// Outcome of one step's body, before status bookkeeping.
struct StepExecution {
    request_ids: Vec<String>,
    api_calls: u64,
    error: Option<String>,
}

pub struct ExecutionEngine {
    config: EngineConfig,
    approvals: Arc<ApprovalStore>,
    kill_switches: Arc<KillSwitchRegistry>,
    cost_guard: Arc<CostAnomalyGuard>,
    planner: Arc<PlanGenerator>,
    permission_boundary: Arc<dyn PermissionBoundary>,
    credential_issuer: Arc<dyn CredentialIssuer>,
    dispatcher: Arc<dyn CloudDispatcher>,
    connections: Arc<dyn ConnectionStore>,
    active: DashMap<String, ActiveExecution>,
    stats: RwLock<EngineStats>,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig, deps: EngineDependencies) -> Self {
        Self {
            config,
            approvals: deps.approvals,
            kill_switches: deps.kill_switches,
            cost_guard: deps.cost_guard,
            planner: deps.planner,
            permission_boundary: deps.permission_boundary,
            credential_issuer: deps.credential_issuer,
            dispatcher: deps.dispatcher,
            connections: deps.connections,
            active: DashMap::new(),
            stats: RwLock::new(EngineStats::default()),
        }
    }

    /// Issue a single-use approval for a plan, bound to the requesting
    /// user. Refused outright for plans that have already expired.
    pub fn issue_approval(
        &self,
        plan: &ExecutionPlan,
        context: &ExecutionContext,
    ) -> Result<ApprovalGrant> {
        if plan.is_expired() {
            return Err(ExecutorError::PlanExpired(format!(
                "plan {} expired at {}",
                plan.plan_id, plan.expires_at
            )));
        }
        Ok(self
            .approvals
            .issue(&plan.plan_id, &context.user_id, &context.connection_id))
    }

    /// Execute a plan end to end and return its terminal result.
    ///
    /// Admission failures (bad token, stale plan, kill switch, simulation
    /// gate, missing connection, credential refusal) return an error and
    /// run nothing. Once steps start, the outcome is always an
    /// `ExecutionResult`; step failures surface there, not as errors.
    pub async fn execute(
        &self,
        mut plan: ExecutionPlan,
        approval_token: Option<&str>,
        context: &ExecutionContext,
        progress: Option<mpsc::UnboundedSender<ExecutionProgress>>,
    ) -> Result<ExecutionResult> {
        // The token is consumed first, so a retry after any later
        // rejection needs a fresh approval.
        if plan.summary.requires_approval {
            let token = approval_token.ok_or_else(|| {
                ExecutorError::ApprovalDenied("plan requires an approval token".to_string())
            })?;
            self.approvals
                .validate_and_consume(token, &plan.plan_id, &context.user_id)?;
        }

        let freshness = self.planner.validate(&plan);
        if !freshness.valid {
            return Err(ExecutorError::PlanExpired(
                freshness
                    .reason
                    .unwrap_or_else(|| "plan expired".to_string()),
            ));
        }

        let verdict = self.kill_switches.check(&ExecutionCheckRequest {
            customer_id: context.customer_id.clone(),
            service: plan.primary_service().unwrap_or("unknown").to_string(),
            connection_id: context.connection_id.clone(),
            action: plan.primary_action().unwrap_or("unknown").to_string(),
            is_write: true,
            risk_level: RiskLevel::from_score(plan.summary.risk_score),
        });
        if !verdict.allowed {
            return Err(ExecutorError::KillSwitchActive(
                verdict
                    .reason
                    .unwrap_or_else(|| "execution is frozen".to_string()),
            ));
        }

        let connection = self.connections.get(&context.connection_id).await?;
        if !connection.can_execute_live() {
            return Err(ExecutorError::SimulationBlocked(format!(
                "connection {} has not completed its {}-day simulation period",
                connection.connection_id, connection.simulation_days_required
            )));
        }

        // Register first, then acquire credentials. A concurrent execute
        // of the same plan is refused while the entry exists.
        let plan_id = plan.plan_id.clone();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let (events, _) = broadcast::channel(self.config.progress_buffer);
        match self.active.entry(plan_id.clone()) {
            Entry::Occupied(_) => {
                return Err(ExecutorError::InvalidRequest(format!(
                    "plan {plan_id} is already executing"
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(ActiveExecution {
                    user_id: context.user_id.clone(),
                    customer_id: context.customer_id.clone(),
                    connection_id: context.connection_id.clone(),
                    started_at: Utc::now(),
                    cancel_requested: Arc::clone(&cancel_flag),
                    events: events.clone(),
                });
            }
        }
        self.stats.write().executions_started += 1;

        let credentials = match self.credential_issuer.assume_role(&connection, &plan_id).await {
            Ok(credentials) => credentials,
            Err(err) => {
                // Nothing ran, so usage counters stay untouched.
                self.active.remove(&plan_id);
                error!(plan_id = %plan_id, error = %err, "credential acquisition failed");
                return Err(err);
            }
        };

        info!(
            plan_id = %plan_id,
            action = plan.primary_action().unwrap_or("unknown"),
            steps = plan.steps.len(),
            user_id = %context.user_id,
            connection_id = %context.connection_id,
            "execution started"
        );
        let started_at = Utc::now();
        let emitter = ProgressEmitter {
            plan_id: plan_id.clone(),
            total_steps: plan.steps.len() as u32,
            external: progress,
            subscribers: events,
        };
        let primary_region = plan.regions.first().cloned();

        let forward = self
            .run_steps(
                &mut plan.steps,
                &StepRunContext {
                    connection: &connection,
                    credentials: &credentials,
                    primary_region: primary_region.clone(),
                    customer_id: &context.customer_id,
                    label: "step",
                    cancel: Some(&cancel_flag),
                    action_batch_limit: None,
                },
                &emitter,
            )
            .await;
        let mut api_calls_made = forward.api_calls;

        let mut rollback_executed = false;
        let mut rollback_steps: Vec<StepOutcome> = Vec::new();
        let (status, result_error) = if forward.cancelled {
            info!(plan_id = %plan_id, "execution cancelled by its owner");
            (
                ExecutionStatus::Cancelled,
                Some("execution cancelled by owner".to_string()),
            )
        } else if let Some((failed_index, message)) = forward.failure {
            let completed_batches = plan.steps[..failed_index]
                .iter()
                .filter(|s| !s.is_check() && s.status == StepStatus::Completed)
                .count();
            match plan.rollback_plan.as_deref_mut() {
                // Roll back only when something was actually mutated.
                Some(rollback) if completed_batches > 0 => {
                    warn!(
                        plan_id = %plan_id,
                        failed_step = failed_index,
                        completed_batches,
                        error = %message,
                        "step failed; rolling back completed batches"
                    );
                    let rollback_emitter = ProgressEmitter {
                        plan_id: plan_id.clone(),
                        total_steps: rollback.steps.len() as u32,
                        external: emitter.external.clone(),
                        subscribers: emitter.subscribers.clone(),
                    };
                    let recovery = self
                        .run_steps(
                            &mut rollback.steps,
                            &StepRunContext {
                                connection: &connection,
                                credentials: &credentials,
                                primary_region: primary_region.clone(),
                                customer_id: &context.customer_id,
                                label: "rollback step",
                                cancel: None,
                                action_batch_limit: Some(completed_batches),
                            },
                            &rollback_emitter,
                        )
                        .await;
                    api_calls_made += recovery.api_calls;
                    rollback_executed = true;

                    // The completed forward batches have now been undone.
                    for step in plan
                        .steps
                        .iter_mut()
                        .filter(|s| !s.is_check() && s.status == StepStatus::Completed)
                    {
                        step.status = StepStatus::RolledBack;
                    }
                    rollback_steps = rollback.steps.iter().map(StepOutcome::from_step).collect();

                    // A failed rollback is terminal; the original error
                    // stays first in the message.
                    let combined = match recovery.failure {
                        Some((_, rollback_error)) => {
                            error!(
                                plan_id = %plan_id,
                                error = %rollback_error,
                                "rollback itself failed; manual intervention required"
                            );
                            format!("{message}; rollback incomplete: {rollback_error}")
                        }
                        None => message,
                    };
                    (ExecutionStatus::RolledBack, Some(combined))
                }
                _ => {
                    let status = if forward.completed == 0 {
                        ExecutionStatus::Failed
                    } else {
                        ExecutionStatus::Partial
                    };
                    (status, Some(message))
                }
            }
        } else {
            (ExecutionStatus::Completed, None)
        };

        // Completion-path bookkeeping runs for every outcome.
        self.active.remove(&plan_id);
        if let Err(err) = self
            .connections
            .record_usage(&context.connection_id, api_calls_made)
            .await
        {
            warn!(plan_id = %plan_id, error = %err, "failed to record connection usage");
        }
        {
            let mut stats = self.stats.write();
            stats.api_calls_dispatched += api_calls_made;
            match status {
                ExecutionStatus::Completed => stats.completed_total += 1,
                ExecutionStatus::Partial => stats.partial_total += 1,
                ExecutionStatus::Failed => stats.failed_total += 1,
                ExecutionStatus::RolledBack => stats.rolled_back_total += 1,
                ExecutionStatus::Cancelled => stats.cancelled_total += 1,
            }
        }

        let result = ExecutionResult {
            plan_id,
            status,
            steps_completed: forward.completed,
            steps_total: plan.steps.len() as u32,
            steps: plan.steps.iter().map(StepOutcome::from_step).collect(),
            rollback_executed,
            rollback_steps,
            error: result_error,
            api_calls_made,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            plan_id = %result.plan_id,
            status = %result.status,
            steps_completed = result.steps_completed,
            steps_total = result.steps_total,
            api_calls = result.api_calls_made,
            rollback = result.rollback_executed,
            "execution finished"
        );
        Ok(result)
    }

    /// Request cooperative cancellation of an in-flight execution. Only
    /// the user who started it may cancel; the current step still runs to
    /// its end before the request is observed.
    pub fn cancel(&self, plan_id: &str, user_id: &str) -> CancellationResult {
        match self.active.get(plan_id) {
            None => CancellationResult {
                success: false,
                reason: Some(format!("no active execution for plan {plan_id}")),
            },
            Some(entry) => {
                if entry.user_id != user_id {
                    return CancellationResult {
                        success: false,
                        reason: Some("only the initiating user may cancel an execution".to_string()),
                    };
                }
                entry.cancel_requested.store(true, Ordering::SeqCst);
                info!(plan_id = %plan_id, user_id = %user_id, "cancellation requested");
                CancellationResult {
                    success: true,
                    reason: None,
                }
            }
        }
    }

    /// Subscribe to the progress stream of an in-flight execution.
    pub fn subscribe(&self, plan_id: &str) -> Result<broadcast::Receiver<ExecutionProgress>> {
        self.active
            .get(plan_id)
            .map(|entry| entry.events.subscribe())
            .ok_or_else(|| ExecutorError::ExecutionNotFound(plan_id.to_string()))
    }

    pub fn active_executions(&self) -> Vec<ActiveExecutionView> {
        self.active
            .iter()
            .map(|entry| ActiveExecutionView {
                plan_id: entry.key().clone(),
                user_id: entry.value().user_id.clone(),
                customer_id: entry.value().customer_id.clone(),
                connection_id: entry.value().connection_id.clone(),
                started_at: entry.value().started_at,
                cancel_requested: entry.value().cancel_requested.load(Ordering::SeqCst),
            })
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.read().clone()
    }

    /// Run one ordered pass over a step list, stopping at the first
    /// failure or observed cancellation.
    async fn run_steps(
        &self,
        steps: &mut [ExecutionStep],
        ctx: &StepRunContext<'_>,
        emitter: &ProgressEmitter,
    ) -> StepRun {
        let mut run = StepRun::default();
        let total = steps.len();
        let mut action_index = 0usize;

        for index in 0..total {
            if let Some(flag) = ctx.cancel {
                if flag.load(Ordering::SeqCst) {
                    run.cancelled = true;
                    emitter.emit(
                        None,
                        (index + 1) as u32,
                        run.completed,
                        format!("cancelled before {} {} of {}", ctx.label, index + 1, total),
                    );
                    break;
                }
            }

            if !steps[index].is_check() {
                let batch = action_index;
                action_index += 1;
                if let Some(limit) = ctx.action_batch_limit {
                    if batch >= limit {
                        continue;
                    }
                }
            }

            steps[index].status = StepStatus::Running;
            emitter.emit(
                Some(steps[index].step_id.clone()),
                (index + 1) as u32,
                index as u32,
                format!(
                    "starting {} {} of {}: {}",
                    ctx.label,
                    index + 1,
                    total,
                    steps[index].action
                ),
            );

            let execution = self.run_step(&steps[index], ctx).await;
            run.api_calls += execution.api_calls;

            let step = &mut steps[index];
            match execution.error {
                None => {
                    step.status = StepStatus::Completed;
                    step.result = Some(StepResult {
                        success: true,
                        message: format!("{} completed", step.action),
                        request_ids: execution.request_ids,
                        completed_at: Utc::now(),
                    });
                    run.completed += 1;
                    if !step.is_check() {
                        self.cost_guard
                            .record_action_cost(ctx.customer_id, step.impact.cost_change);
                    }
                    emitter.emit(
                        Some(step.step_id.clone()),
                        (index + 1) as u32,
                        (index + 1) as u32,
                        format!(
                            "completed {} {} of {}: {}",
                            ctx.label,
                            index + 1,
                            total,
                            step.action
                        ),
                    );
                }
                Some(message) => {
                    step.status = StepStatus::Failed;
                    step.result = Some(StepResult {
                        success: false,
                        message: message.clone(),
                        request_ids: execution.request_ids,
                        completed_at: Utc::now(),
                    });
                    warn!(
                        step_id = %step.step_id,
                        action = %step.action,
                        error = %message,
                        "step failed"
                    );
                    emitter.emit(
                        Some(step.step_id.clone()),
                        (index + 1) as u32,
                        index as u32,
                        format!("{} {} of {} failed: {}", ctx.label, index + 1, total, message),
                    );
                    run.failure = Some((index, message));
                    break;
                }
            }
        }
        run
    }

    /// Execute one step's body. Check steps validate state only; mutating
    /// steps run their declared API calls in order, each behind a fresh
    /// permission decision. The first denial or dispatch error ends the
    /// step.
    async fn run_step(&self, step: &ExecutionStep, ctx: &StepRunContext<'_>) -> StepExecution {
        if step.is_check() {
            if self.config.check_latency_ms > 0 {
                tokio::time::sleep(StdDuration::from_millis(self.config.check_latency_ms)).await;
            }
            debug!(step_id = %step.step_id, check = %step.action, "check satisfied");
            return StepExecution {
                request_ids: vec![],
                api_calls: 0,
                error: None,
            };
        }

        let mut request_ids = Vec::with_capacity(step.api_calls.len());
        let mut api_calls = 0u64;
        for call in &step.api_calls {
            let decision = match self
                .permission_boundary
                .validate_action(
                    &PermissionRequest {
                        service: call.service.clone(),
                        action: call.operation.clone(),
                        resources: step.resources.clone(),
                        region: ctx.primary_region.clone(),
                    },
                    ctx.connection,
                )
                .await
            {
                Ok(decision) => decision,
                Err(err) => {
                    return StepExecution {
                        request_ids,
                        api_calls,
                        error: Some(format!(
                            "permission check failed for {}: {}",
                            call.operation, err
                        )),
                    };
                }
            };
            if !decision.allowed {
                return StepExecution {
                    request_ids,
                    api_calls,
                    error: Some(format!(
                        "{} denied at execution time: {}",
                        call.operation,
                        decision
                            .reason
                            .unwrap_or_else(|| "no reason given".to_string())
                    )),
                };
            }

            // An attempted dispatch counts as a call made even when the
            // provider rejects it.
            api_calls += 1;
            match self.dispatcher.execute_call(call, ctx.credentials).await {
                Ok(receipt) => request_ids.push(receipt.request_id),
                Err(err) => {
                    return StepExecution {
                        request_ids,
                        api_calls,
                        error: Some(err.to_string()),
                    };
                }
            }
        }

        StepExecution {
            request_ids,
            api_calls,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvals::ApprovalConfig;
    use crate::clients::{
        InMemoryConnectionStore, SimulatedDispatcher, StaticPermissionBoundary,
        StubCredentialIssuer,
    };
    use crate::costguard::CostGuardConfig;
    use crate::killswitch::KillSwitchConfig;
    use crate::planner::PlannerConfig;
    use chrono::Duration;
    use cloudward_shared::{ExecutionMode, KillSwitchScope, ValidatedAction};

    struct TestHarness {
        engine: ExecutionEngine,
        kill_switches: Arc<KillSwitchRegistry>,
        cost_guard: Arc<CostAnomalyGuard>,
        planner: Arc<PlanGenerator>,
        approvals: Arc<ApprovalStore>,
        boundary: Arc<StaticPermissionBoundary>,
        issuer: Arc<StubCredentialIssuer>,
        dispatcher: Arc<SimulatedDispatcher>,
        connections: Arc<InMemoryConnectionStore>,
    }

    async fn create_test_harness() -> TestHarness {
        create_test_harness_with(0).await
    }

    async fn create_test_harness_with(dispatch_latency_ms: u64) -> TestHarness {
        let kill_switches = Arc::new(KillSwitchRegistry::new(KillSwitchConfig::default()));
        let cost_guard = Arc::new(CostAnomalyGuard::new(
            CostGuardConfig::default(),
            kill_switches.clone(),
        ));
        let boundary = Arc::new(StaticPermissionBoundary::new());
        let planner = Arc::new(PlanGenerator::new(
            PlannerConfig::default(),
            boundary.clone(),
        ));
        let approvals = Arc::new(ApprovalStore::new(ApprovalConfig::default()));
        let issuer = Arc::new(StubCredentialIssuer::new());
        let dispatcher = Arc::new(SimulatedDispatcher::new(dispatch_latency_ms));
        let connections = Arc::new(InMemoryConnectionStore::new());
        connections
            .upsert(create_test_connection())
            .await
            .unwrap();

        let engine = ExecutionEngine::new(
            EngineConfig {
                check_latency_ms: 0,
                progress_buffer: 64,
            },
            EngineDependencies {
                approvals: approvals.clone(),
                kill_switches: kill_switches.clone(),
                cost_guard: cost_guard.clone(),
                planner: planner.clone(),
                permission_boundary: boundary.clone(),
                credential_issuer: issuer.clone(),
                dispatcher: dispatcher.clone(),
                connections: connections.clone(),
            },
        );
        TestHarness {
            engine,
            kill_switches,
            cost_guard,
            planner,
            approvals,
            boundary,
            issuer,
            dispatcher,
            connections,
        }
    }

    fn create_test_connection() -> Connection {
        Connection {
            connection_id: "conn-1".to_string(),
            customer_id: "cust-1".to_string(),
            provider: "aws".to_string(),
            display_name: None,
            execution_mode: ExecutionMode::Live,
            simulation_started_at: None,
            simulation_days_required: 7,
            allowed_regions: vec!["us-east-1".to_string()],
            last_used: None,
            total_executions: 0,
            total_api_calls: 0,
            created_at: Utc::now(),
        }
    }

    fn create_test_context() -> ExecutionContext {
        ExecutionContext {
            user_id: "user-1".to_string(),
            customer_id: "cust-1".to_string(),
            connection_id: "conn-1".to_string(),
        }
    }

    fn create_test_action(action: &str, resource_count: usize) -> ValidatedAction {
        ValidatedAction {
            action: action.to_string(),
            resources: (0..resource_count).map(|i| format!("r-{:03}", i)).collect(),
            regions: vec![],
            parameters: serde_json::json!({}),
            dsl_hash: "hash-1".to_string(),
            dsl_version: "1.0".to_string(),
            requires_approval: None,
        }
    }

    async fn generate_test_plan(
        harness: &TestHarness,
        action: &str,
        resource_count: usize,
    ) -> ExecutionPlan {
        let connection = harness.connections.get("conn-1").await.unwrap();
        harness
            .planner
            .generate(&create_test_action(action, resource_count), &connection, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_successful_execution_end_to_end() {
        let harness = create_test_harness().await;
        let plan = generate_test_plan(&harness, "ec2.stop", 5).await;
        let total_steps = plan.steps.len() as u32;
        let context = create_test_context();
        let grant = harness
            .approvals
            .issue(&plan.plan_id, &context.user_id, &context.connection_id);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = harness
            .engine
            .execute(plan, Some(&grant.token), &context, Some(tx))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.steps_completed, total_steps);
        assert!(result.steps.iter().all(|s| s.status == StepStatus::Completed));
        assert!(!result.rollback_executed);
        assert!(result.error.is_none());
        assert_eq!(result.api_calls_made, 1);
        assert_eq!(harness.dispatcher.calls_for("StopInstances"), 1);

        // The mutating step carries the provider request id.
        let batch = result.steps.iter().find(|s| s.action == "ec2.stop").unwrap();
        assert_eq!(batch.request_ids.len(), 1);
        assert!(batch.request_ids[0].starts_with("sim-"));

        // Connection usage counters moved.
        let connection = harness.connections.get("conn-1").await.unwrap();
        assert_eq!(connection.total_executions, 1);
        assert_eq!(connection.total_api_calls, 1);
        assert!(connection.last_used.is_some());

        // Cost metrics recorded once per completed mutating step.
        let metrics = harness.cost_guard.metrics(Some("cust-1"));
        assert_eq!(metrics.actions_executed, 1);
        assert_eq!(metrics.total_cost_decrease, 250.0);

        // A before and an after event for every step, ending at 100%.
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), (total_steps * 2) as usize);
        assert_eq!(events.last().unwrap().percent, 100.0);

        assert_eq!(harness.engine.active_count(), 0);
        let stats = harness.engine.stats();
        assert_eq!(stats.executions_started, 1);
        assert_eq!(stats.completed_total, 1);
        assert_eq!(stats.api_calls_dispatched, 1);
    }

    #[tokio::test]
    async fn test_approval_token_is_single_use() {
        let harness = create_test_harness().await;
        let plan = generate_test_plan(&harness, "ec2.stop", 2).await;
        let context = create_test_context();
        let grant = harness
            .approvals
            .issue(&plan.plan_id, &context.user_id, &context.connection_id);

        harness
            .engine
            .execute(plan.clone(), Some(&grant.token), &context, None)
            .await
            .unwrap();

        let err = harness
            .engine
            .execute(plan, Some(&grant.token), &context, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::ApprovalDenied(_)));
        assert!(err.to_string().contains("already used"));
    }

    #[tokio::test]
    async fn test_missing_token_rejected() {
        let harness = create_test_harness().await;
        let plan = generate_test_plan(&harness, "ec2.stop", 1).await;
        let err = harness
            .engine
            .execute(plan, None, &create_test_context(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::ApprovalDenied(_)));
    }

    #[tokio::test]
    async fn test_token_bound_to_user() {
        let harness = create_test_harness().await;
        let plan = generate_test_plan(&harness, "ec2.stop", 1).await;
        let grant = harness.approvals.issue(&plan.plan_id, "user-1", "conn-1");

        let mut context = create_test_context();
        context.user_id = "user-2".to_string();
        let err = harness
            .engine
            .execute(plan, Some(&grant.token), &context, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::ApprovalDenied(_)));
        assert!(err.to_string().contains("different user"));
    }

    #[tokio::test]
    async fn test_plan_without_approval_requirement_runs_tokenless() {
        let harness = create_test_harness().await;
        let connection = harness.connections.get("conn-1").await.unwrap();
        let mut action = create_test_action("ec2.stop", 1);
        action.requires_approval = Some(false);
        let plan = harness
            .planner
            .generate(&action, &connection, None)
            .await
            .unwrap();

        let result = harness
            .engine
            .execute(plan, None, &create_test_context(), None)
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_expired_plan_rejected_before_any_call() {
        let harness = create_test_harness().await;
        let mut plan = generate_test_plan(&harness, "ec2.stop", 2).await;
        let context = create_test_context();
        let grant = harness
            .approvals
            .issue(&plan.plan_id, &context.user_id, &context.connection_id);
        plan.expires_at = Utc::now() - Duration::seconds(5);

        let err = harness
            .engine
            .execute(plan, Some(&grant.token), &context, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::PlanExpired(_)));
        assert_eq!(harness.dispatcher.calls_total(), 0);

        // The token was spent by the attempt even though admission failed
        // later in the pipeline.
        let err = harness
            .approvals
            .validate_and_consume(&grant.token, "other", "other")
            .unwrap_err();
        assert!(err.to_string().contains("already used"));
    }

    #[tokio::test]
    async fn test_kill_switch_blocks_admission() {
        let harness = create_test_harness().await;
        harness
            .kill_switches
            .activate(
                KillSwitchScope::Customer,
                Some("cust-1"),
                "cost incident",
                "ops",
                None,
                None,
            )
            .unwrap();

        let plan = generate_test_plan(&harness, "ec2.stop", 1).await;
        let context = create_test_context();
        let grant = harness
            .approvals
            .issue(&plan.plan_id, &context.user_id, &context.connection_id);

        let err = harness
            .engine
            .execute(plan.clone(), Some(&grant.token), &context, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::KillSwitchActive(_)));
        assert_eq!(harness.dispatcher.calls_total(), 0);

        // Lifting the freeze restores execution, with a fresh approval.
        harness
            .kill_switches
            .deactivate(KillSwitchScope::Customer, Some("cust-1"), "ops")
            .unwrap();
        let grant = harness
            .approvals
            .issue(&plan.plan_id, &context.user_id, &context.connection_id);
        let result = harness
            .engine
            .execute(plan, Some(&grant.token), &context, None)
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_read_only_mode_blocks_writes() {
        let harness = create_test_harness().await;
        harness.kill_switches.enable_read_only("ops", "change freeze");

        let plan = generate_test_plan(&harness, "ec2.stop", 1).await;
        let context = create_test_context();
        let grant = harness
            .approvals
            .issue(&plan.plan_id, &context.user_id, &context.connection_id);
        let err = harness
            .engine
            .execute(plan, Some(&grant.token), &context, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::KillSwitchActive(_)));
    }

    #[tokio::test]
    async fn test_simulation_mode_gates_live_execution() {
        let harness = create_test_harness().await;
        let mut connection = harness.connections.get("conn-1").await.unwrap();
        connection.execution_mode = ExecutionMode::Simulation;
        connection.simulation_started_at = Some(Utc::now() - Duration::days(2));
        connection.simulation_days_required = 7;
        harness.connections.upsert(connection.clone()).await.unwrap();

        let plan = generate_test_plan(&harness, "ec2.stop", 1).await;
        let context = create_test_context();
        let grant = harness
            .approvals
            .issue(&plan.plan_id, &context.user_id, &context.connection_id);
        let err = harness
            .engine
            .execute(plan.clone(), Some(&grant.token), &context, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::SimulationBlocked(_)));

        // Once the observation window has elapsed the same connection may
        // run live.
        connection.simulation_started_at = Some(Utc::now() - Duration::days(8));
        harness.connections.upsert(connection).await.unwrap();
        let grant = harness
            .approvals
            .issue(&plan.plan_id, &context.user_id, &context.connection_id);
        let result = harness
            .engine
            .execute(plan, Some(&grant.token), &context, None)
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_credential_failure_aborts_cleanly() {
        let harness = create_test_harness().await;
        harness.issuer.set_failing(true);

        let plan = generate_test_plan(&harness, "ec2.stop", 1).await;
        let context = create_test_context();
        let grant = harness
            .approvals
            .issue(&plan.plan_id, &context.user_id, &context.connection_id);
        let err = harness
            .engine
            .execute(plan, Some(&grant.token), &context, None)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::CredentialAcquisition(_)));
        assert!(err.is_retryable());
        assert_eq!(harness.engine.active_count(), 0);
        assert_eq!(harness.dispatcher.calls_total(), 0);
        let connection = harness.connections.get("conn-1").await.unwrap();
        assert_eq!(connection.total_executions, 0);
    }

    #[tokio::test]
    async fn test_failure_triggers_rollback_of_completed_batches() {
        let harness = create_test_harness().await;
        // First StopDBInstance succeeds, the second fails: batch 2 of 3.
        harness
            .dispatcher
            .fail_operation_after("StopDBInstance", "db is busy", 1);

        let plan = generate_test_plan(&harness, "rds.stop", 25).await;
        let context = create_test_context();
        let grant = harness
            .approvals
            .issue(&plan.plan_id, &context.user_id, &context.connection_id);
        let result = harness
            .engine
            .execute(plan, Some(&grant.token), &context, None)
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::RolledBack);
        assert!(result.rollback_executed);
        assert!(result.error.as_ref().unwrap().contains("db is busy"));

        // Forward plan: batch 1 rolled back, batch 2 failed, batch 3
        // never dispatched.
        let batches: Vec<&StepOutcome> = result
            .steps
            .iter()
            .filter(|s| s.action == "rds.stop")
            .collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].status, StepStatus::RolledBack);
        assert_eq!(batches[1].status, StepStatus::Failed);
        assert_eq!(batches[2].status, StepStatus::Pending);
        assert_eq!(harness.dispatcher.calls_for("StopDBInstance"), 2);

        // Recovery restarted exactly the one completed batch.
        assert_eq!(harness.dispatcher.calls_for("StartDBInstance"), 1);
        let rollback_batches: Vec<&StepOutcome> = result
            .rollback_steps
            .iter()
            .filter(|s| s.action == "rds.start")
            .collect();
        assert_eq!(rollback_batches.len(), 3);
        assert_eq!(rollback_batches[0].status, StepStatus::Completed);
        assert_eq!(rollback_batches[1].status, StepStatus::Pending);
        assert_eq!(rollback_batches[2].status, StepStatus::Pending);

        // Usage counters reflect every dispatched call, recovery included.
        let connection = harness.connections.get("conn-1").await.unwrap();
        assert_eq!(connection.total_api_calls, 3);
        assert_eq!(connection.total_executions, 1);
        assert_eq!(harness.engine.stats().rolled_back_total, 1);
    }

    #[tokio::test]
    async fn test_first_batch_failure_skips_rollback() {
        let harness = create_test_harness().await;
        harness.dispatcher.fail_operation("StopDBInstance", "throttled");

        let plan = generate_test_plan(&harness, "rds.stop", 5).await;
        let context = create_test_context();
        let grant = harness
            .approvals
            .issue(&plan.plan_id, &context.user_id, &context.connection_id);
        let result = harness
            .engine
            .execute(plan, Some(&grant.token), &context, None)
            .await
            .unwrap();

        // Nothing was mutated, so there is nothing to roll back: the five
        // pre-checks completed and the result is partial.
        assert_eq!(result.status, ExecutionStatus::Partial);
        assert!(!result.rollback_executed);
        assert!(result.rollback_steps.is_empty());
        assert_eq!(result.steps_completed, 5);
        assert_eq!(harness.dispatcher.calls_for("StartDBInstance"), 0);
    }

    #[tokio::test]
    async fn test_execution_time_permission_revocation() {
        let harness = create_test_harness().await;
        let plan = generate_test_plan(&harness, "ec2.stop", 2).await;
        // Plan generation already passed; policy tightens afterwards.
        harness.boundary.deny("StopInstances");

        let context = create_test_context();
        let grant = harness
            .approvals
            .issue(&plan.plan_id, &context.user_id, &context.connection_id);
        let result = harness
            .engine
            .execute(plan, Some(&grant.token), &context, None)
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Partial);
        let batch = result.steps.iter().find(|s| s.action == "ec2.stop").unwrap();
        assert_eq!(batch.status, StepStatus::Failed);
        assert!(batch.message.as_ref().unwrap().contains("denied"));
        // The denial aborted the step before any dispatch.
        assert_eq!(harness.dispatcher.calls_total(), 0);
        assert_eq!(result.api_calls_made, 0);
    }

    #[tokio::test]
    async fn test_cancellation_between_steps() {
        let harness = Arc::new(create_test_harness_with(50).await);
        let plan = generate_test_plan(&harness, "ec2.stop", 30).await;
        let plan_id = plan.plan_id.clone();
        let context = create_test_context();
        let grant = harness
            .approvals
            .issue(&plan_id, &context.user_id, &context.connection_id);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = {
            let harness = Arc::clone(&harness);
            let context = context.clone();
            tokio::spawn(async move {
                harness
                    .engine
                    .execute(plan, Some(&grant.token), &context, Some(tx))
                    .await
            })
        };

        // Wait for the first batch to finish, then cancel.
        while let Some(event) = rx.recv().await {
            if event.message.contains("completed step") && event.message.contains("ec2.stop") {
                break;
            }
        }

        // While in flight the execution is visible and subscribable.
        let views = harness.engine.active_executions();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].plan_id, plan_id);
        let mut live_events = harness.engine.subscribe(&plan_id).unwrap();

        let denied = harness.engine.cancel(&plan_id, "someone-else");
        assert!(!denied.success);

        let cancelled = harness.engine.cancel(&plan_id, &context.user_id);
        assert!(cancelled.success);

        let result = task.await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(result.error.as_ref().unwrap().contains("cancelled"));
        // At least the third batch never ran, and no rollback fired.
        assert!(harness.dispatcher.calls_for("StopInstances") < 3);
        assert_eq!(harness.dispatcher.calls_for("StartInstances"), 0);
        assert!(!result.rollback_executed);
        assert_eq!(harness.engine.active_count(), 0);

        // The late subscriber saw the tail of the run.
        let event = tokio::time::timeout(StdDuration::from_secs(2), live_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.plan_id, plan_id);
    }

    #[tokio::test]
    async fn test_duplicate_execution_refused_while_active() {
        let harness = Arc::new(create_test_harness_with(50).await);
        let plan = generate_test_plan(&harness, "ec2.stop", 30).await;
        let plan_id = plan.plan_id.clone();
        let context = create_test_context();
        let grant = harness
            .approvals
            .issue(&plan_id, &context.user_id, &context.connection_id);

        let task = {
            let harness = Arc::clone(&harness);
            let plan = plan.clone();
            let context = context.clone();
            let token = grant.token.clone();
            tokio::spawn(async move {
                harness
                    .engine
                    .execute(plan, Some(&token), &context, None)
                    .await
            })
        };

        // Wait for the execution to register itself.
        for _ in 0..200 {
            if harness.engine.active_count() > 0 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        assert_eq!(harness.engine.active_count(), 1);

        let second_grant = harness
            .approvals
            .issue(&plan_id, &context.user_id, &context.connection_id);
        let err = harness
            .engine
            .execute(plan, Some(&second_grant.token), &context, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidRequest(_)));
        assert!(err.to_string().contains("already executing"));

        harness.engine.cancel(&plan_id, &context.user_id);
        let result = task.await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_without_active_execution() {
        let harness = create_test_harness().await;
        let result = harness.engine.cancel("plan_missing", "user-1");
        assert!(!result.success);
        assert!(result.reason.unwrap().contains("no active execution"));

        let err = harness.engine.subscribe("plan_missing").unwrap_err();
        assert!(matches!(err, ExecutorError::ExecutionNotFound(_)));
    }

    #[tokio::test]
    async fn test_issue_approval_refuses_expired_plan() {
        let harness = create_test_harness().await;
        let mut plan = generate_test_plan(&harness, "ec2.stop", 1).await;
        plan.expires_at = Utc::now() - Duration::seconds(1);

        let err = harness
            .engine
            .issue_approval(&plan, &create_test_context())
            .unwrap_err();
        assert!(matches!(err, ExecutorError::PlanExpired(_)));
    }
}
