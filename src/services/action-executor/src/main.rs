//! Action Executor Service - Main Entry Point
//!
//! This service turns validated cloud action descriptors into batched
//! execution plans and runs them under governance controls:
//! - Plan generation with cost, risk and duration estimates
//! - Single-use approval tokens and plan freshness checks
//! - Kill switches, read-only mode, and cost anomaly detection
//! - Sequential execution with progress streaming and rollback

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use tracing::info;
use validator::Validate;

use action_executor::{config::ExecutorConfig, server::ActionExecutorServer, telemetry};

#[derive(Parser, Debug)]
#[command(
    name = "action-executor",
    about = "Governed cloud action execution service",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Configuration file path; defaults apply when omitted
    #[arg(short, long, env = "ACTION_EXECUTOR_CONFIG")]
    config: Option<String>,

    /// Service port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (overrides config)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable development mode
    #[arg(long)]
    dev: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ExecutorConfig::from_file(path)
            .await
            .with_context(|| format!("failed to load configuration from {}", path))?,
        None => ExecutorConfig::default(),
    };

    // Apply command line overrides
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(log_level) = args.log_level {
        config.logging.level = log_level;
    }
    if args.dev {
        config.environment = "development".to_string();
        config.logging.level = "debug".to_string();
        config.logging.format = "pretty".to_string();
    }

    config
        .validate()
        .context("configuration validation failed")?;

    if args.validate_config {
        println!("✅ Configuration is valid");
        return Ok(());
    }

    let _guard = telemetry::init_tracing(&config)
        .await
        .context("failed to initialize tracing")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        "Starting Action Executor Service"
    );

    let server = ActionExecutorServer::new(config);
    server.start().await.context("server error")?;

    Ok(())
}
