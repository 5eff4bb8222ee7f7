//! Telemetry Module
//!
//! Structured logging setup for the action executor. Log level and format
//! come from configuration; `RUST_LOG` wins when set.

use tracing::info;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::{config::ExecutorConfig, error::ExecutorError, Result};

/// Telemetry guard for cleanup
pub struct TelemetryGuard {
    _guard: Option<()>,
}

/// Initialize tracing and logging
pub async fn init_tracing(config: &ExecutorConfig) -> Result<TelemetryGuard> {
    let log_level = config.logging.level.as_str();
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| ExecutorError::Config(format!("invalid log level {}: {}", log_level, e)))?;

    let console_layer = if config.logging.console {
        let layer = fmt::layer()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true);

        match config.logging.format.as_str() {
            "json" => Some(layer.json().boxed()),
            "pretty" => Some(layer.pretty().boxed()),
            _ => Some(layer.compact().boxed()),
        }
    } else {
        None
    };

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if let Some(console_layer) = console_layer {
        subscriber.with(console_layer).init();
    } else {
        subscriber.init();
    }

    info!(
        log_level = log_level,
        format = config.logging.format,
        console_enabled = config.logging.console,
        "Tracing initialized"
    );

    Ok(TelemetryGuard { _guard: None })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracing_initialization() {
        let mut config = ExecutorConfig::default();
        config.logging.format = "compact".to_string();

        let _guard = init_tracing(&config).await.unwrap();
        tracing::info!("test log message");
    }
}
