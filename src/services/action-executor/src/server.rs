//! Action Executor Server Module
//!
//! Main server implementation: component wiring, shared application state,
//! the HTTP router, background maintenance tasks, and graceful shutdown.

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        Method,
    },
    routing::{delete, get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{debug, info};

use crate::{
    approvals::ApprovalStore,
    clients::{
        ConnectionStore, InMemoryConnectionStore, SimulatedDispatcher, StaticPermissionBoundary,
        StubCredentialIssuer,
    },
    config::ExecutorConfig,
    costguard::CostAnomalyGuard,
    engine::{EngineDependencies, ExecutionEngine},
    error::{ExecutorError, Result},
    handlers, killswitch::KillSwitchRegistry,
    metrics, planner::PlanGenerator,
};
use cloudward_shared::ExecutionPlan;

// ============================================================================
// PLAN STORE
// ============================================================================

/// A generated plan held for approval and execution, together with the
/// context it was generated under.
#[derive(Debug, Clone)]
pub struct StoredPlan {
    pub plan: ExecutionPlan,
    pub customer_id: String,
    pub connection_id: String,
    pub created_by: String,
}

/// In-memory store of unexpired plans, keyed by plan id. Plans are
/// ephemeral: they live here between generation and expiry, never longer.
#[derive(Debug, Default)]
pub struct PlanStore {
    plans: DashMap<String, StoredPlan>,
}

impl PlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: StoredPlan) {
        self.plans.insert(record.plan.plan_id.clone(), record);
    }

    pub fn get(&self, plan_id: &str) -> Option<StoredPlan> {
        self.plans.get(plan_id).map(|entry| entry.clone())
    }

    pub fn remove(&self, plan_id: &str) -> Option<StoredPlan> {
        self.plans.remove(plan_id).map(|(_, record)| record)
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Drop every expired plan. Returns how many were evicted.
    pub fn sweep_expired(&self) -> usize {
        let before = self.plans.len();
        self.plans.retain(|_, record| !record.plan.is_expired());
        before - self.plans.len()
    }
}

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Configuration
    pub config: Arc<ExecutorConfig>,

    /// Execution engine
    pub engine: Arc<ExecutionEngine>,

    /// Plan generator
    pub planner: Arc<PlanGenerator>,

    /// Approval token store
    pub approvals: Arc<ApprovalStore>,

    /// Kill-switch registry
    pub kill_switches: Arc<KillSwitchRegistry>,

    /// Cost anomaly guard
    pub cost_guard: Arc<CostAnomalyGuard>,

    /// Connection records
    pub connections: Arc<dyn ConnectionStore>,

    /// Stored plans awaiting approval or execution
    pub plans: Arc<PlanStore>,

    /// When the server came up
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn planner(&self) -> &Arc<PlanGenerator> {
        &self.planner
    }

    pub fn approvals(&self) -> &Arc<ApprovalStore> {
        &self.approvals
    }

    pub fn kill_switches(&self) -> &Arc<KillSwitchRegistry> {
        &self.kill_switches
    }

    pub fn cost_guard(&self) -> &Arc<CostAnomalyGuard> {
        &self.cost_guard
    }

    pub fn connections(&self) -> &Arc<dyn ConnectionStore> {
        &self.connections
    }

    pub fn plans(&self) -> &Arc<PlanStore> {
        &self.plans
    }

    pub fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    pub fn is_development(&self) -> bool {
        self.config.is_development()
    }
}

// ============================================================================
// SERVER
// ============================================================================

/// Action executor server.
pub struct ActionExecutorServer {
    config: Arc<ExecutorConfig>,
    app_state: AppState,
    shutdown: CancellationToken,
}

impl ActionExecutorServer {
    /// Wire up all components from configuration.
    pub fn new(config: ExecutorConfig) -> Self {
        info!("Initializing Action Executor Server");
        let config = Arc::new(config);

        let kill_switches = Arc::new(KillSwitchRegistry::new(config.kill_switch_config()));
        let cost_guard = Arc::new(CostAnomalyGuard::new(
            config.cost_guard_config(),
            Arc::clone(&kill_switches),
        ));
        let approvals = Arc::new(ApprovalStore::new(config.approval_config()));

        let permission_boundary = Arc::new(StaticPermissionBoundary::new());
        let credential_issuer = Arc::new(StubCredentialIssuer::new());
        let dispatcher = Arc::new(SimulatedDispatcher::new(
            config.execution.dispatch_latency_ms,
        ));
        let connections: Arc<dyn ConnectionStore> = Arc::new(InMemoryConnectionStore::new());

        let planner = Arc::new(PlanGenerator::new(
            config.planner_config(),
            permission_boundary.clone(),
        ));

        let engine = Arc::new(ExecutionEngine::new(
            config.engine_config(),
            EngineDependencies {
                approvals: Arc::clone(&approvals),
                kill_switches: Arc::clone(&kill_switches),
                cost_guard: Arc::clone(&cost_guard),
                planner: Arc::clone(&planner),
                permission_boundary,
                credential_issuer,
                dispatcher,
                connections: Arc::clone(&connections),
            },
        ));

        let app_state = AppState {
            config: Arc::clone(&config),
            engine,
            planner,
            approvals,
            kill_switches,
            cost_guard,
            connections,
            plans: Arc::new(PlanStore::new()),
            started_at: Utc::now(),
        };

        Self {
            config,
            app_state,
            shutdown: CancellationToken::new(),
        }
    }

    /// Shared state, for tests and embedding.
    pub fn app_state(&self) -> &AppState {
        &self.app_state
    }

    /// Start the server and serve until a shutdown signal arrives.
    pub async fn start(&self) -> Result<()> {
        info!(
            address = %self.config.server_address(),
            environment = %self.config.environment,
            "Starting Action Executor Server"
        );

        self.start_background_tasks();

        let app = self.create_router();

        let listener = TcpListener::bind(&self.config.server_address())
            .await
            .map_err(|e| {
                ExecutorError::Internal(format!(
                    "failed to bind {}: {}",
                    self.config.server_address(),
                    e
                ))
            })?;

        info!(
            address = %self.config.server_address(),
            "Action Executor Server listening"
        );

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| ExecutorError::Internal(format!("server error: {}", e)));

        self.shutdown.cancel();
        info!("Action Executor Server stopped");
        result
    }

    /// Build the application router with all routes and middleware.
    pub fn create_router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([AUTHORIZATION, CONTENT_TYPE])
            .allow_origin(Any);

        Router::new()
            // Health and status endpoints
            .route("/health", get(handlers::health::health_check))
            .route("/status", get(handlers::status::service_status))
            .route("/metrics/summary", get(metrics::get_metrics_summary))
            // Plan lifecycle
            .route("/api/v1/plans", post(handlers::plans::create_plan))
            .route("/api/v1/plans/:plan_id", get(handlers::plans::get_plan))
            .route(
                "/api/v1/plans/:plan_id/approve",
                post(handlers::plans::approve_plan),
            )
            // Execution lifecycle
            .route(
                "/api/v1/executions",
                post(handlers::executions::execute_plan),
            )
            .route(
                "/api/v1/executions",
                get(handlers::executions::list_active_executions),
            )
            .route(
                "/api/v1/executions/:plan_id/events",
                get(handlers::executions::execution_events),
            )
            .route(
                "/api/v1/executions/:plan_id/cancel",
                post(handlers::executions::cancel_execution),
            )
            // Connection records
            .route(
                "/api/v1/connections",
                put(handlers::connections::upsert_connection),
            )
            .route(
                "/api/v1/connections/:connection_id",
                get(handlers::connections::get_connection),
            )
            // Governance administration
            .route(
                "/api/v1/admin/kill-switches",
                get(handlers::admin::kill_switch_status),
            )
            .route(
                "/api/v1/admin/kill-switches",
                post(handlers::admin::activate_kill_switch),
            )
            .route(
                "/api/v1/admin/kill-switches",
                delete(handlers::admin::deactivate_kill_switch),
            )
            .route(
                "/api/v1/admin/kill-switches/audit",
                get(handlers::admin::kill_switch_audit),
            )
            .route(
                "/api/v1/admin/read-only",
                post(handlers::admin::enable_read_only),
            )
            .route(
                "/api/v1/admin/read-only",
                delete(handlers::admin::disable_read_only),
            )
            .route(
                "/api/v1/admin/emergency-stop-methods",
                get(handlers::admin::emergency_stop_methods),
            )
            .route(
                "/api/v1/admin/cost/metrics",
                get(handlers::admin::cost_metrics),
            )
            .route(
                "/api/v1/admin/cost/alerts",
                get(handlers::admin::cost_alerts),
            )
            .route(
                "/api/v1/admin/cost/thresholds/:customer_id",
                put(handlers::admin::update_thresholds),
            )
            // Middleware
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(PropagateRequestIdLayer::x_request_id())
                    .layer(TraceLayer::new_for_http())
                    .layer(TimeoutLayer::new(self.config.request_timeout()))
                    .layer(cors)
                    .layer(DefaultBodyLimit::max(1024 * 1024)),
            )
            .with_state(self.app_state.clone())
    }

    /// Spawn the periodic maintenance tasks. Each loop exits when the
    /// shutdown token fires.
    fn start_background_tasks(&self) {
        let state = &self.app_state;

        // Kill-switch expiry sweep.
        spawn_sweeper(
            self.shutdown.clone(),
            self.config.governance.kill_switch_sweep_interval_seconds,
            {
                let kill_switches = Arc::clone(&state.kill_switches);
                move || {
                    let swept = kill_switches.sweep_expired();
                    if swept > 0 {
                        debug!(swept, "expired kill switches removed");
                    }
                }
            },
        );

        // Spent and expired approval tokens.
        spawn_sweeper(
            self.shutdown.clone(),
            self.config.governance.approval_sweep_interval_seconds,
            {
                let approvals = Arc::clone(&state.approvals);
                move || {
                    let swept = approvals.sweep_expired();
                    if swept > 0 {
                        debug!(swept, "stale approval tokens removed");
                    }
                }
            },
        );

        // Expired plans.
        spawn_sweeper(
            self.shutdown.clone(),
            self.config.planning.plan_sweep_interval_seconds,
            {
                let plans = Arc::clone(&state.plans);
                move || {
                    let swept = plans.sweep_expired();
                    if swept > 0 {
                        debug!(swept, "expired plans evicted");
                    }
                }
            },
        );

        // Fixed-window rate counters.
        spawn_sweeper(
            self.shutdown.clone(),
            self.config.cost.rate_window_seconds,
            {
                let cost_guard = Arc::clone(&state.cost_guard);
                move || cost_guard.reset_rate_windows()
            },
        );

        // Cost self-monitor; trips read-only mode when the executor's own
        // behavior looks anomalous.
        spawn_sweeper(
            self.shutdown.clone(),
            self.config.cost.self_monitor_interval_seconds,
            {
                let cost_guard = Arc::clone(&state.cost_guard);
                move || {
                    cost_guard.self_monitor_tick();
                }
            },
        );

        info!("Background maintenance tasks started");
    }
}

/// Run `tick` every `interval_seconds` until the token is cancelled.
fn spawn_sweeper<F>(token: CancellationToken, interval_seconds: u64, mut tick: F)
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(interval_seconds.max(1)));
        // The first tick fires immediately; skip it so a sweep never races
        // server startup.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => tick(),
            }
        }
    });
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
