//! Work-queue worker
//!
//! Runs one of two roles against a NATS JetStream work queue:
//!
//! ```text
//! workqueue publish                     workqueue subscribe
//!   ProducerLoop                          ConsumerLoop
//!     ↓ WorkItem every ~3s                  ↑ pull batch every ~5s
//!   stream-1 (subject submit-tx) ──────→ consumer-1 (durable, explicit ack)
//! ```
//!
//! Both roles provision the stream on startup (create or reuse), stop on
//! SIGINT/SIGTERM and always close the connection before exiting. Settings
//! come from the environment, see [`config::Config`].

pub mod config;
pub mod lifecycle;

use clap::{Parser, ValueEnum};
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use workqueue::{ConnectionManager, LoggingProcessor};

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "workqueue")]
#[command(about = "Publish to or consume from a durable NATS JetStream work queue")]
pub struct Cli {
    /// Which loop to run
    #[arg(value_enum)]
    pub role: Role,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Publish a work item on every tick
    Publish,
    /// Pull, process and acknowledge work items
    Subscribe,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publish => write!(f, "publish"),
            Role::Subscribe => write!(f, "subscribe"),
        }
    }
}

/// Run the worker until a termination signal or a fatal error.
pub async fn run(cli: Cli) -> Result<()> {
    install_color_eyre();

    let environment = Environment::from_env();
    init_tracing(&environment);

    let config = Config::from_env().wrap_err("Failed to load configuration")?;

    info!(
        role = %cli.role,
        worker_id = %config.worker_id,
        url = %config.nats_url,
        stream = %config.stream_name,
        "Starting work-queue worker"
    );

    if let Some(port) = config.metrics_port {
        workqueue::init_metrics(port).wrap_err("Failed to start metrics exporter")?;
        info!(port, "Prometheus exporter listening");
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    lifecycle::spawn_signal_watcher(shutdown_tx);

    let connected = lifecycle::connect_until_shutdown(
        ConnectionManager::connect(config.connection()),
        &mut shutdown_rx,
    )
    .await
    .wrap_err_with(|| format!("Failed to connect to NATS at {}", config.nats_url))?;

    let Some(connection) = connected else {
        info!("Work-queue worker stopped before connecting");
        return Ok(());
    };

    lifecycle::run_role(
        connection,
        cli.role,
        &config,
        Arc::new(LoggingProcessor),
        shutdown_rx,
    )
    .await?;

    info!("Work-queue worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_parse_roles() {
        let cli = Cli::try_parse_from(["workqueue", "publish"]).unwrap();
        assert_eq!(cli.role, Role::Publish);

        let cli = Cli::try_parse_from(["workqueue", "subscribe"]).unwrap();
        assert_eq!(cli.role, Role::Subscribe);
    }

    #[test]
    fn test_unknown_role_is_usage_error() {
        let err = Cli::try_parse_from(["workqueue", "replay"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_missing_role_is_usage_error() {
        let err = Cli::try_parse_from(["workqueue"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_extra_arguments_rejected() {
        let err = Cli::try_parse_from(["workqueue", "publish", "subscribe"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_role_display_matches_cli_value() {
        for role in [Role::Publish, Role::Subscribe] {
            let value = role.to_string();
            let parsed = Cli::try_parse_from(["workqueue", value.as_str()]).unwrap();
            assert_eq!(parsed.role, role);
        }
    }
}
