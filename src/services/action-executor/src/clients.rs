//! Collaborator contracts
//!
//! The execution core depends on four external collaborators: the
//! permission boundary, the credential issuer, the cloud dispatcher, and
//! the connection store. Each is a trait here, with an in-process
//! implementation good enough to run the service standalone and to drive
//! every failure path in tests. A deployment substitutes real ones at
//! construction time.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use cloudward_shared::{ApiCall, Connection};
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ExecutorError, Result};

// ============================================================================
// PERMISSION BOUNDARY
// ============================================================================

/// One unit of work submitted for a policy decision. At plan time the
/// action is the catalog identifier; at execution time it is the concrete
/// API operation of one call.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub service: String,
    pub action: String,
    pub resources: Vec<String>,
    pub region: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PermissionDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

/// External policy check constraining what a connection may ever perform.
/// Called once per candidate plan and again per API call at execution time.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PermissionBoundary: Send + Sync + fmt::Debug {
    async fn validate_action(
        &self,
        request: &PermissionRequest,
        connection: &Connection,
    ) -> Result<PermissionDecision>;
}

/// Allow-everything boundary with a configurable denylist, matched against
/// the request's action field (catalog id or API operation name).
#[derive(Debug, Default)]
pub struct StaticPermissionBoundary {
    denied: parking_lot::RwLock<HashSet<String>>,
}

impl StaticPermissionBoundary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&self, action: &str) {
        self.denied.write().insert(action.to_string());
    }

    pub fn allow(&self, action: &str) {
        self.denied.write().remove(action);
    }
}

#[async_trait]
impl PermissionBoundary for StaticPermissionBoundary {
    async fn validate_action(
        &self,
        request: &PermissionRequest,
        _connection: &Connection,
    ) -> Result<PermissionDecision> {
        if self.denied.read().contains(&request.action) {
            return Ok(PermissionDecision {
                allowed: false,
                reason: Some(format!("action {} is denied by policy", request.action)),
            });
        }
        Ok(PermissionDecision {
            allowed: true,
            reason: None,
        })
    }
}

// ============================================================================
// CREDENTIAL ISSUER
// ============================================================================

/// Temporary, plan-scoped credentials. The secret fields never appear in
/// logs; the `Debug` impl redacts them.
#[derive(Clone)]
pub struct TemporaryCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for TemporaryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemporaryCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Issues short-lived credentials scoped to one plan execution.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialIssuer: Send + Sync + fmt::Debug {
    async fn assume_role(
        &self,
        connection: &Connection,
        plan_id: &str,
    ) -> Result<TemporaryCredentials>;
}

/// Deterministic in-process issuer with a failure toggle for tests.
#[derive(Debug, Default)]
pub struct StubCredentialIssuer {
    fail: AtomicBool,
}

impl StubCredentialIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl CredentialIssuer for StubCredentialIssuer {
    async fn assume_role(
        &self,
        connection: &Connection,
        plan_id: &str,
    ) -> Result<TemporaryCredentials> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ExecutorError::CredentialAcquisition(format!(
                "role assumption refused for connection {}",
                connection.connection_id
            )));
        }

        debug!(
            connection_id = %connection.connection_id,
            plan_id = %plan_id,
            "issued plan-scoped credentials"
        );
        Ok(TemporaryCredentials {
            access_key_id: format!("ASIA{}", random_token(16)),
            secret_access_key: random_token(40),
            session_token: random_token(64),
            expires_at: Utc::now() + Duration::hours(1),
        })
    }
}

// ============================================================================
// CLOUD DISPATCHER
// ============================================================================

/// Receipt for one dispatched API call. The provider request id is kept on
/// the step result for audit.
#[derive(Debug, Clone)]
pub struct DispatchReceipt {
    pub request_id: String,
}

/// Executes one declared API call against the provider.
#[async_trait]
pub trait CloudDispatcher: Send + Sync + fmt::Debug {
    async fn execute_call(
        &self,
        call: &ApiCall,
        credentials: &TemporaryCredentials,
    ) -> Result<DispatchReceipt>;
}

/// Failure script for one operation: fail every dispatch once the
/// operation has already been called `after_calls` times.
#[derive(Debug, Clone)]
struct ScriptedFailure {
    message: String,
    after_calls: u64,
}

/// Simulated provider: fixed latency, per-operation call counting, and
/// scripted per-operation failures so rollback and partial paths are
/// testable without a cloud account.
#[derive(Debug)]
pub struct SimulatedDispatcher {
    latency_ms: u64,
    failures: DashMap<String, ScriptedFailure>,
    call_counts: DashMap<String, u64>,
    calls_total: AtomicU64,
}

impl SimulatedDispatcher {
    pub fn new(latency_ms: u64) -> Self {
        Self {
            latency_ms,
            failures: DashMap::new(),
            call_counts: DashMap::new(),
            calls_total: AtomicU64::new(0),
        }
    }

    /// Make every future dispatch of `operation` fail with `message`.
    pub fn fail_operation(&self, operation: &str, message: &str) {
        self.fail_operation_after(operation, message, 0);
    }

    /// Let the first `after_calls` dispatches of `operation` succeed, then
    /// fail the rest.
    pub fn fail_operation_after(&self, operation: &str, message: &str, after_calls: u64) {
        self.failures.insert(
            operation.to_string(),
            ScriptedFailure {
                message: message.to_string(),
                after_calls,
            },
        );
    }

    pub fn clear_failure(&self, operation: &str) {
        self.failures.remove(operation);
    }

    pub fn calls_for(&self, operation: &str) -> u64 {
        self.call_counts.get(operation).map(|c| *c).unwrap_or(0)
    }

    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedDispatcher {
    fn default() -> Self {
        Self::new(10)
    }
}

#[async_trait]
impl CloudDispatcher for SimulatedDispatcher {
    async fn execute_call(
        &self,
        call: &ApiCall,
        _credentials: &TemporaryCredentials,
    ) -> Result<DispatchReceipt> {
        if self.latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.latency_ms)).await;
        }

        let prior_calls = self.calls_for(&call.operation);
        self.calls_total.fetch_add(1, Ordering::SeqCst);
        *self
            .call_counts
            .entry(call.operation.clone())
            .or_insert(0) += 1;

        if let Some(script) = self.failures.get(&call.operation) {
            if prior_calls >= script.after_calls {
                return Err(ExecutorError::Internal(format!(
                    "{} failed: {}",
                    call.operation, script.message
                )));
            }
        }

        debug!(
            service = %call.service,
            operation = %call.operation,
            "dispatched simulated call"
        );
        Ok(DispatchReceipt {
            request_id: format!("sim-{}", Uuid::new_v4().simple()),
        })
    }
}

// ============================================================================
// CONNECTION STORE
// ============================================================================

/// Read/write access to connection records. The execution core reads for
/// admission and increments usage counters afterwards; ownership of the
/// records stays with connection management.
#[async_trait]
pub trait ConnectionStore: Send + Sync + fmt::Debug {
    async fn get(&self, connection_id: &str) -> Result<Connection>;
    async fn upsert(&self, connection: Connection) -> Result<()>;
    async fn record_usage(&self, connection_id: &str, api_calls: u64) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryConnectionStore {
    connections: DashMap<String, Connection>,
}

impl InMemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionStore for InMemoryConnectionStore {
    async fn get(&self, connection_id: &str) -> Result<Connection> {
        self.connections
            .get(connection_id)
            .map(|c| c.clone())
            .ok_or_else(|| ExecutorError::ConnectionNotFound(connection_id.to_string()))
    }

    async fn upsert(&self, connection: Connection) -> Result<()> {
        self.connections
            .insert(connection.connection_id.clone(), connection);
        Ok(())
    }

    async fn record_usage(&self, connection_id: &str, api_calls: u64) -> Result<()> {
        let mut entry = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| ExecutorError::ConnectionNotFound(connection_id.to_string()))?;
        entry.record_execution(api_calls);
        Ok(())
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
