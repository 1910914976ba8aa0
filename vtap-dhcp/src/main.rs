use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::EnvFilter;

use vtap_dhcp::GeneratorConfig;
use vtap_dhcp::dnsmasq::{DEFAULT_LEASE_FILE, DEFAULT_RELEASE_PROGRAM};
use vtap_dhcp::generator::{DEFAULT_INTERFACE, DEFAULT_POLL_INTERVAL};
use vtap_dhcp::metadata::DEFAULT_METADATA_URL;

#[derive(Parser)]
#[command(name = "vtap-dhcp")]
#[command(about = "Serves static DHCP leases for VMs listed by the metadata service")]
struct Args {
    /// Metadata service base URL
    #[arg(long, env = "VTAP_METADATA_URL", default_value = DEFAULT_METADATA_URL)]
    metadata: String,

    /// The interface to expire leases on
    #[arg(short, long, default_value = DEFAULT_INTERFACE)]
    interface: String,

    /// How often to poll the metadata version
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_millis() as u64)]
    poll_interval_ms: u64,

    /// dnsmasq lease database (deleted on startup)
    #[arg(long, default_value = DEFAULT_LEASE_FILE)]
    lease_file: PathBuf,

    /// dnsmasq executable
    #[arg(long, default_value = "dnsmasq")]
    dnsmasq: String,

    /// Helper used to expire superseded leases
    #[arg(long, default_value = DEFAULT_RELEASE_PROGRAM)]
    dhcp_release: String,

    /// Extra arguments passed to dnsmasq (after `--`)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    dnsmasq_args: Vec<String>,
}

impl From<Args> for GeneratorConfig {
    fn from(args: Args) -> Self {
        GeneratorConfig {
            metadata_url: args.metadata,
            interface: args.interface,
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            lease_file: args.lease_file,
            dnsmasq_program: args.dnsmasq,
            release_program: args.dhcp_release,
            dnsmasq_args: args.dnsmasq_args,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vtap_dhcp=info".parse()?))
        .init();

    let config = GeneratorConfig::from(Args::parse());

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;
    let shutdown = async move {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    };

    vtap_dhcp::run(config, shutdown).await?;
    Ok(())
}
