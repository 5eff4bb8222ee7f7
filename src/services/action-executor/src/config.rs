//! Configuration for the action executor service
//!
//! All tunables live here: HTTP server settings, governance knobs
//! (approvals, kill switches), cost-guard thresholds, planning limits,
//! execution behavior, and logging. Loaded from YAML and validated before
//! the server starts; every section has defaults matching the documented
//! governance behavior.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::approvals::ApprovalConfig;
use crate::costguard::CostGuardConfig;
use crate::engine::EngineConfig;
use crate::killswitch::KillSwitchConfig;
use crate::planner::PlannerConfig;
use cloudward_shared::CostThresholds;

/// Main configuration structure for the action executor.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ExecutorConfig {
    /// Environment (development, staging, production)
    pub environment: String,

    /// HTTP server configuration
    #[validate]
    pub server: ServerConfig,

    /// Approval and kill-switch configuration
    #[validate]
    pub governance: GovernanceConfig,

    /// Cost anomaly guard configuration
    #[validate]
    pub cost: CostConfig,

    /// Plan generation configuration
    #[validate]
    pub planning: PlanningConfig,

    /// Execution engine configuration
    #[validate]
    pub execution: ExecutionSettings,

    /// Logging configuration
    #[validate]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    /// Bind host
    #[validate(length(min = 1))]
    pub host: String,

    /// Bind port
    #[validate(range(min = 1024, max = 65535))]
    pub port: u16,

    /// Request timeout in seconds
    #[validate(range(min = 1, max = 300))]
    pub request_timeout_seconds: u64,

    /// Graceful shutdown timeout in seconds
    #[validate(range(min = 1, max = 120))]
    pub shutdown_timeout_seconds: u64,

    /// CORS settings
    pub cors: CorsConfig,
}

/// CORS configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CorsConfig {
    /// Allowed origins; `*` allows any
    pub allowed_origins: Vec<String>,

    /// Preflight max age in seconds
    #[validate(range(min = 0, max = 86400))]
    pub max_age_seconds: u64,
}

/// Approval-token and kill-switch configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GovernanceConfig {
    /// Approval tokens expire this many minutes after issuance
    #[validate(range(min = 1, max = 60))]
    pub approval_token_ttl_minutes: i64,

    /// Length of the opaque approval token string
    #[validate(range(min = 16, max = 128))]
    pub approval_token_length: usize,

    /// Interval of the spent/expired token sweep in seconds
    #[validate(range(min = 10, max = 3600))]
    pub approval_sweep_interval_seconds: u64,

    /// Interval of the kill-switch expiry sweep in seconds
    #[validate(range(min = 10, max = 3600))]
    pub kill_switch_sweep_interval_seconds: u64,

    /// Kill-switch audit records retained in memory
    #[validate(range(min = 16, max = 10000))]
    pub audit_capacity: usize,
}

/// Cost anomaly guard configuration. The threshold fields are the
/// defaults; per-customer overrides are set at runtime through the admin
/// API.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CostConfig {
    /// Maximum predicted cost increase as a percentage of baseline spend
    #[validate(range(min = 0.0, max = 500.0))]
    pub cost_increase_percent: f64,

    /// Maximum predicted absolute cost increase in monthly USD
    #[validate(range(min = 0.0))]
    pub cost_increase_absolute: f64,

    /// Per-customer validation calls allowed per rate window
    #[validate(range(min = 1, max = 10000))]
    pub api_calls_per_minute: u32,

    /// Reject plans touching regions outside the connection allowlist
    pub unexpected_regions: bool,

    /// Baseline monthly spend assumed when the caller supplies none
    #[validate(range(min = 0.0))]
    pub default_monthly_baseline: f64,

    /// Cost alerts retained in memory
    #[validate(range(min = 16, max = 10000))]
    pub alert_capacity: usize,

    /// Fixed rate-limit window length in seconds
    #[validate(range(min = 10, max = 3600))]
    pub rate_window_seconds: u64,

    /// Interval of the self-monitoring check in seconds
    #[validate(range(min = 5, max = 3600))]
    pub self_monitor_interval_seconds: u64,

    /// Global actions required before the self-monitor evaluates
    #[validate(range(min = 1, max = 100000))]
    pub self_monitor_min_actions: u64,

    /// Increase-vs-decrease ratio that trips read-only mode
    #[validate(range(min = 1.0, max = 100.0))]
    pub self_monitor_ratio: f64,
}

/// Plan generation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PlanningConfig {
    /// Plans expire this many minutes after creation
    #[validate(range(min = 1, max = 120))]
    pub plan_ttl_minutes: i64,

    /// Resources per mutating batch step
    #[validate(range(min = 1, max = 100))]
    pub batch_size: usize,

    /// Hard cap on resources per plan
    #[validate(range(min = 1, max = 10000))]
    pub max_resources_per_plan: usize,

    /// Duration estimate for one pre/post-check step in milliseconds
    #[validate(range(min = 0, max = 60000))]
    pub check_duration_ms: u64,

    /// Interval of the expired-plan sweep in seconds
    #[validate(range(min = 10, max = 3600))]
    pub plan_sweep_interval_seconds: u64,
}

/// Execution engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ExecutionSettings {
    /// Simulated latency of one pre/post-check step in milliseconds
    #[validate(range(min = 0, max = 10000))]
    pub check_latency_ms: u64,

    /// Buffered progress events per execution for late subscribers
    #[validate(range(min = 8, max = 1024))]
    pub progress_buffer: usize,

    /// Latency of the simulated cloud dispatcher in milliseconds
    #[validate(range(min = 0, max = 60000))]
    pub dispatch_latency_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoggingConfig {
    /// Log level
    #[validate(custom = "validate_log_level")]
    pub level: String,

    /// Log format (json, pretty, compact)
    #[validate(custom = "validate_log_format")]
    pub format: String,

    /// Enable console logging
    pub console: bool,
}

impl ExecutorConfig {
    /// Load configuration from a YAML file and validate it.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: ExecutorConfig =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse configuration YAML")?;

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    /// Get server bind address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Get request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_seconds)
    }

    /// Get graceful shutdown timeout
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_seconds)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    /// Check if running in production mode
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn default_thresholds(&self) -> CostThresholds {
        CostThresholds {
            cost_increase_percent: self.cost.cost_increase_percent,
            cost_increase_absolute: self.cost.cost_increase_absolute,
            api_calls_per_minute: self.cost.api_calls_per_minute,
            unexpected_regions: self.cost.unexpected_regions,
        }
    }

    pub fn kill_switch_config(&self) -> KillSwitchConfig {
        KillSwitchConfig {
            audit_capacity: self.governance.audit_capacity,
            sweep_interval_seconds: self.governance.kill_switch_sweep_interval_seconds,
        }
    }

    pub fn cost_guard_config(&self) -> CostGuardConfig {
        CostGuardConfig {
            default_thresholds: self.default_thresholds(),
            default_monthly_baseline: self.cost.default_monthly_baseline,
            alert_capacity: self.cost.alert_capacity,
            rate_window_seconds: self.cost.rate_window_seconds,
            self_monitor_interval_seconds: self.cost.self_monitor_interval_seconds,
            self_monitor_min_actions: self.cost.self_monitor_min_actions,
            self_monitor_ratio: self.cost.self_monitor_ratio,
        }
    }

    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            plan_ttl_minutes: self.planning.plan_ttl_minutes,
            batch_size: self.planning.batch_size,
            max_resources_per_plan: self.planning.max_resources_per_plan,
            check_duration_ms: self.planning.check_duration_ms,
        }
    }

    pub fn approval_config(&self) -> ApprovalConfig {
        ApprovalConfig {
            token_ttl_minutes: self.governance.approval_token_ttl_minutes,
            token_length: self.governance.approval_token_length,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            check_latency_ms: self.execution.check_latency_ms,
            progress_buffer: self.execution.progress_buffer,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            server: ServerConfig::default(),
            governance: GovernanceConfig::default(),
            cost: CostConfig::default(),
            planning: PlanningConfig::default(),
            execution: ExecutionSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8085,
            request_timeout_seconds: 30,
            shutdown_timeout_seconds: 30,
            cors: CorsConfig::default(),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            max_age_seconds: 3600,
        }
    }
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            approval_token_ttl_minutes: 15,
            approval_token_length: 48,
            approval_sweep_interval_seconds: 60,
            kill_switch_sweep_interval_seconds: 60,
            audit_capacity: 500,
        }
    }
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            cost_increase_percent: 20.0,
            cost_increase_absolute: 1000.0,
            api_calls_per_minute: 100,
            unexpected_regions: true,
            default_monthly_baseline: 1000.0,
            alert_capacity: 200,
            rate_window_seconds: 60,
            self_monitor_interval_seconds: 30,
            self_monitor_min_actions: 10,
            self_monitor_ratio: 1.5,
        }
    }
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            plan_ttl_minutes: 15,
            batch_size: 10,
            max_resources_per_plan: 100,
            check_duration_ms: 500,
            plan_sweep_interval_seconds: 60,
        }
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            check_latency_ms: 50,
            progress_buffer: 64,
            dispatch_latency_ms: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            console: true,
        }
    }
}

// Validation functions
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ValidationError::new("Invalid log level")),
    }
}

fn validate_log_format(format: &str) -> Result<(), ValidationError> {
    match format.to_lowercase().as_str() {
        "json" | "pretty" | "compact" => Ok(()),
        _ => Err(ValidationError::new("Invalid log format")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_default_config() {
        let config = ExecutorConfig::default();
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_config_from_file() {
        let yaml_content = r#"
environment: "test"
server:
  host: "127.0.0.1"
  port: 8085
  request_timeout_seconds: 30
  shutdown_timeout_seconds: 30
  cors:
    allowed_origins: ["*"]
    max_age_seconds: 3600
governance:
  approval_token_ttl_minutes: 15
  approval_token_length: 48
  approval_sweep_interval_seconds: 60
  kill_switch_sweep_interval_seconds: 60
  audit_capacity: 500
cost:
  cost_increase_percent: 20.0
  cost_increase_absolute: 1000.0
  api_calls_per_minute: 100
  unexpected_regions: true
  default_monthly_baseline: 1000.0
  alert_capacity: 200
  rate_window_seconds: 60
  self_monitor_interval_seconds: 30
  self_monitor_min_actions: 10
  self_monitor_ratio: 1.5
planning:
  plan_ttl_minutes: 15
  batch_size: 10
  max_resources_per_plan: 100
  check_duration_ms: 500
  plan_sweep_interval_seconds: 60
execution:
  check_latency_ms: 50
  progress_buffer: 64
  dispatch_latency_ms: 10
logging:
  level: "debug"
  format: "pretty"
  console: true
"#;

        let temp_file = NamedTempFile::new().unwrap();
        use std::io::Write;
        let mut file = temp_file.reopen().unwrap();
        file.write_all(yaml_content.as_bytes()).unwrap();

        let config = ExecutorConfig::from_file(temp_file.path()).await.unwrap();
        assert_eq!(config.environment, "test");
        assert_eq!(config.server.port, 8085);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.planning.batch_size, 10);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = ExecutorConfig::default();
        config.server.port = 80;
        assert!(config.validate().is_err());

        let mut config = ExecutorConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = ExecutorConfig::default();
        config.planning.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_component_config_conversion() {
        let config = ExecutorConfig::default();

        let thresholds = config.default_thresholds();
        assert_eq!(thresholds.cost_increase_percent, 20.0);
        assert_eq!(thresholds.api_calls_per_minute, 100);

        let planner = config.planner_config();
        assert_eq!(planner.plan_ttl_minutes, 15);
        assert_eq!(planner.batch_size, 10);

        let approvals = config.approval_config();
        assert_eq!(approvals.token_ttl_minutes, 15);
        assert_eq!(approvals.token_length, 48);

        assert_eq!(config.server_address(), "0.0.0.0:8085");
        assert!(config.is_development());
        assert!(!config.is_production());
    }

    #[test]
    fn test_validation_functions() {
        assert!(validate_log_level("info").is_ok());
        assert!(validate_log_level("TRACE").is_ok());
        assert!(validate_log_level("verbose").is_err());

        assert!(validate_log_format("json").is_ok());
        assert!(validate_log_format("pretty").is_ok());
        assert!(validate_log_format("xml").is_err());
    }
}
