//! devicelab-tunneld: tunnel server sidecar for devicelab.
//!
//! Listens on `127.0.0.1:<port>` for length-delimited JSON requests from a
//! `TunnelManager` and keeps at most one tunnel per device. Each tunnel is
//! backed by a provider process started from the command given after `--`,
//! with `{udid}` replaced by the device identifier.
//!
//! ```text
//! devicelab-tunneld 49151 --log-level debug -- my-tunnel-helper --udid {udid}
//! ```

use anyhow::Context;
use clap::Parser;
use devicelab_core::tunnel::{CommandTunnelProvider, TunnelServer, DEFAULT_PORT};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "devicelab-tunneld", version, about)]
struct Args {
    /// TCP port to listen on (loopback only).
    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, env = "DEVICELAB_TUNNELD_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Seconds a provider has to report its endpoint.
    #[arg(long, env = "DEVICELAB_TUNNELD_STARTUP_TIMEOUT", default_value_t = 30)]
    startup_timeout: u64,

    /// Seconds a provider has to exit after SIGTERM before it is killed.
    #[arg(long, env = "DEVICELAB_TUNNELD_STOP_TIMEOUT", default_value_t = 5)]
    stop_timeout: u64,

    /// Provider command, `{udid}` is replaced by the device identifier.
    #[arg(last = true, required = true)]
    provider: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout is left to the supervising process.
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::try_new(&args.log_level)
            .with_context(|| format!("invalid log level {:?}", args.log_level))?,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!(port = args.port, provider = ?args.provider, "devicelab-tunneld starting");

    let provider = CommandTunnelProvider::new(args.provider)
        .with_startup_timeout(Duration::from_secs(args.startup_timeout))
        .with_stop_timeout(Duration::from_secs(args.stop_timeout));
    let server = TunnelServer::bind(args.port, provider)
        .await
        .with_context(|| format!("failed to bind port {}", args.port))?;

    server.serve(shutdown_signal()).await?;

    tracing::info!("devicelab-tunneld stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_provider_after_separator() {
        let args = Args::try_parse_from([
            "devicelab-tunneld",
            "5000",
            "--log-level",
            "debug",
            "--",
            "helper",
            "--udid",
            "{udid}",
        ])
        .unwrap();

        assert_eq!(args.port, 5000);
        assert_eq!(args.log_level, "debug");
        assert_eq!(args.provider, vec!["helper", "--udid", "{udid}"]);
    }

    #[test]
    fn test_args_require_provider() {
        assert!(Args::try_parse_from(["devicelab-tunneld", "5000"]).is_err());
    }

    #[test]
    fn test_args_default_port() {
        let args = Args::try_parse_from(["devicelab-tunneld", "--", "helper"]).unwrap();
        assert_eq!(args.port, DEFAULT_PORT);
        assert_eq!(args.startup_timeout, 30);
    }
}
