//! Approval token store
//!
//! Opaque, single-use, time-boxed tokens binding one plan to one user and
//! connection. Validation and consumption are one atomic operation against
//! the guarded map, so two near-simultaneous executions can never both
//! spend the same token. Expiry is enforced by timestamp comparison at use
//! time; the sweep only reclaims memory.

use chrono::{DateTime, Duration, Utc};
use cloudward_shared::ApprovalGrant;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ExecutorError, Result};

/// Store tuning knobs.
#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    /// Tokens expire this long after issuance.
    pub token_ttl_minutes: i64,
    /// Length of the opaque token string.
    pub token_length: usize,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            token_ttl_minutes: 15,
            token_length: 48,
        }
    }
}

/// Counters kept for operational visibility.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApprovalStats {
    pub issued_total: u64,
    pub consumed_total: u64,
    pub rejected_total: u64,
    pub swept_total: u64,
}

#[derive(Debug, Clone)]
struct ApprovalRecord {
    plan_id: String,
    user_id: String,
    connection_id: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    used: bool,
}

#[derive(Debug)]
pub struct ApprovalStore {
    config: ApprovalConfig,
    tokens: DashMap<String, ApprovalRecord>,
    stats: RwLock<ApprovalStats>,
}

impl ApprovalStore {
    pub fn new(config: ApprovalConfig) -> Self {
        Self {
            config,
            tokens: DashMap::new(),
            stats: RwLock::new(ApprovalStats::default()),
        }
    }

    /// Issue a fresh single-use token for one plan, user, and connection.
    pub fn issue(&self, plan_id: &str, user_id: &str, connection_id: &str) -> ApprovalGrant {
        let now = Utc::now();
        let token = generate_token(self.config.token_length);
        let record = ApprovalRecord {
            plan_id: plan_id.to_string(),
            user_id: user_id.to_string(),
            connection_id: connection_id.to_string(),
            created_at: now,
            expires_at: now + Duration::minutes(self.config.token_ttl_minutes),
            used: false,
        };
        let expires_at = record.expires_at;
        self.tokens.insert(token.clone(), record);
        self.stats.write().issued_total += 1;

        info!(
            plan_id = %plan_id,
            user_id = %user_id,
            connection_id = %connection_id,
            expires_at = %expires_at,
            "approval issued"
        );
        ApprovalGrant {
            token,
            plan_id: plan_id.to_string(),
            expires_at,
        }
    }

    /// Validate a token against its bindings and consume it.
    ///
    /// The `used` flag flips atomically with a successful validation while
    /// the map entry is exclusively held, so exactly one caller can ever
    /// spend a token. Failed validations (wrong plan, wrong user, expired)
    /// leave the token unconsumed.
    pub fn validate_and_consume(&self, token: &str, plan_id: &str, user_id: &str) -> Result<()> {
        let outcome = match self.tokens.get_mut(token) {
            None => Err(ExecutorError::ApprovalDenied(
                "unknown approval token".to_string(),
            )),
            Some(mut record) => {
                if record.used {
                    Err(ExecutorError::ApprovalDenied(
                        "approval token already used".to_string(),
                    ))
                } else if Utc::now() >= record.expires_at {
                    Err(ExecutorError::ApprovalDenied(
                        "approval token expired".to_string(),
                    ))
                } else if record.plan_id != plan_id {
                    Err(ExecutorError::ApprovalDenied(
                        "approval token is bound to a different plan".to_string(),
                    ))
                } else if record.user_id != user_id {
                    Err(ExecutorError::ApprovalDenied(
                        "approval token is bound to a different user".to_string(),
                    ))
                } else {
                    record.used = true;
                    debug!(
                        plan_id = %plan_id,
                        user_id = %user_id,
                        connection_id = %record.connection_id,
                        issued_at = %record.created_at,
                        "approval consumed"
                    );
                    Ok(())
                }
            }
        };

        match &outcome {
            Ok(()) => self.stats.write().consumed_total += 1,
            Err(e) => {
                debug!(plan_id = %plan_id, reason = %e, "approval rejected");
                self.stats.write().rejected_total += 1;
            }
        }
        outcome
    }

    /// Tokens issued but neither consumed nor expired.
    pub fn outstanding(&self) -> usize {
        let now = Utc::now();
        self.tokens
            .iter()
            .filter(|entry| !entry.value().used && now < entry.value().expires_at)
            .count()
    }

    /// Drop expired and spent tokens. An expired-but-unswept token already
    /// fails validation; this only reclaims memory.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.tokens.len();
        self.tokens
            .retain(|_, record| !record.used && now < record.expires_at);
        let removed = before - self.tokens.len();
        if removed > 0 {
            debug!(removed, "approval sweep removed tokens");
            self.stats.write().swept_total += removed as u64;
        }
        removed
    }

    pub fn stats(&self) -> ApprovalStats {
        self.stats.read().clone()
    }
}

fn generate_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
