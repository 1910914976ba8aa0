use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vtap_broker::config::{
    DEFAULT_BRIDGE, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_SESSIONS, DEFAULT_SOCKET,
    DEFAULT_STEP_TIMEOUT,
};
use vtap_broker::{Broker, BrokerConfig, NetlinkBackend};

#[derive(Parser)]
#[command(name = "vtap-broker")]
#[command(about = "Creates bridged TAP devices and passes them to unprivileged clients")]
struct Args {
    /// Unix socket to listen on (a stale file is replaced)
    #[arg(short, long, env = "VTAP_SOCKET", default_value = DEFAULT_SOCKET)]
    socket: PathBuf,

    /// Bridge to attach TAP devices to (created if not exists)
    #[arg(short, long, env = "VTAP_BRIDGE", default_value = DEFAULT_BRIDGE)]
    bridge: String,

    /// How long a client may take to send its handshake
    #[arg(long, default_value_t = DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64)]
    handshake_timeout_ms: u64,

    /// Upper bound for each provisioning step
    #[arg(long, default_value_t = DEFAULT_STEP_TIMEOUT.as_millis() as u64)]
    step_timeout_ms: u64,

    /// Maximum number of sessions provisioned at the same time
    #[arg(long, default_value_t = DEFAULT_MAX_SESSIONS)]
    max_sessions: usize,

    /// Octal permissions for the socket file, e.g. 660
    #[arg(long, value_parser = parse_mode)]
    socket_mode: Option<u32>,
}

impl From<Args> for BrokerConfig {
    fn from(args: Args) -> Self {
        BrokerConfig {
            socket_path: args.socket,
            bridge: args.bridge,
            handshake_timeout: Duration::from_millis(args.handshake_timeout_ms),
            step_timeout: Duration::from_millis(args.step_timeout_ms),
            max_sessions: args.max_sessions,
            socket_mode: args.socket_mode,
        }
    }
}

fn parse_mode(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s, 8).map_err(|e| format!("invalid octal mode {s:?}: {e}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vtap_broker=info".parse()?))
        .init();

    let config = BrokerConfig::from(Args::parse());
    let socket = config.socket_path.clone();

    let backend = NetlinkBackend::new().context("Failed to open netlink connection")?;
    let broker = Broker::new(config, backend);

    let listener = broker
        .bind()
        .await
        .with_context(|| format!("Failed to listen on {}", socket.display()))?;

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;

    broker
        .serve_with_shutdown(listener, async move {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down...");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                }
            }
        })
        .await?;

    info!("Broker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("660").unwrap(), 0o660);
        assert_eq!(parse_mode("0777").unwrap(), 0o777);
        assert!(parse_mode("999").is_err());
    }

    #[test]
    fn test_args_into_config() {
        let args = Args::parse_from([
            "vtap-broker",
            "--socket",
            "/tmp/t.sock",
            "--bridge",
            "br-test",
            "--max-sessions",
            "4",
            "--socket-mode",
            "600",
        ]);
        let config = BrokerConfig::from(args);
        assert_eq!(config.socket_path, PathBuf::from("/tmp/t.sock"));
        assert_eq!(config.bridge, "br-test");
        assert_eq!(config.max_sessions, 4);
        assert_eq!(config.socket_mode, Some(0o600));
        assert_eq!(config.handshake_timeout, Duration::from_secs(2));
    }
}
