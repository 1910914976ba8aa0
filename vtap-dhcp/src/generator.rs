//! Keeps dnsmasq's static host list in sync with the metadata service.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::dnsmasq::{
    DEFAULT_LEASE_FILE, DEFAULT_RELEASE_PROGRAM, Dnsmasq, dnsmasq_args, release_lease,
};
use crate::error::{DhcpError, Result};
use crate::metadata::{DEFAULT_METADATA_URL, MetadataClient};
use crate::render::{DhcpConfig, LeaseTable};

pub const DEFAULT_INTERFACE: &str = "eth0";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub metadata_url: String,
    /// Interface on which superseded leases are released.
    pub interface: String,
    pub poll_interval: Duration,
    pub lease_file: PathBuf,
    pub dnsmasq_program: String,
    pub release_program: String,
    /// Appended to the dnsmasq command line.
    pub dnsmasq_args: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            metadata_url: DEFAULT_METADATA_URL.to_string(),
            interface: DEFAULT_INTERFACE.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            lease_file: PathBuf::from(DEFAULT_LEASE_FILE),
            dnsmasq_program: "dnsmasq".to_string(),
            release_program: DEFAULT_RELEASE_PROGRAM.to_string(),
            dnsmasq_args: Vec::new(),
        }
    }
}

/// Renders the host and option files for one host.
pub struct Generator {
    metadata: MetadataClient,
    host_uuid: String,
    interface: String,
    release_program: String,
    leases: LeaseTable,
    hosts: NamedTempFile,
    opts: NamedTempFile,
}

impl Generator {
    pub fn new(
        metadata: MetadataClient,
        host_uuid: String,
        interface: String,
        release_program: String,
    ) -> Result<Self> {
        Ok(Self {
            metadata,
            host_uuid,
            interface,
            release_program,
            leases: LeaseTable::new(),
            hosts: NamedTempFile::with_prefix("dnsmasq-hosts")?,
            opts: NamedTempFile::with_prefix("dnsmasq-opts")?,
        })
    }

    pub fn hosts_path(&self) -> &Path {
        self.hosts.path()
    }

    pub fn opts_path(&self) -> &Path {
        self.opts.path()
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    /// Fetch the containers, release superseded leases and rewrite both
    /// files.
    ///
    /// A failed release aborts before the files are touched; the binding
    /// stays superseded and is retried on the next call.
    pub async fn regenerate(&mut self) -> Result<DhcpConfig> {
        let containers = self.metadata.containers().await?;
        let config = DhcpConfig::from_containers(&self.host_uuid, &containers);

        for s in self.leases.superseded(&config) {
            release_lease(&self.release_program, &self.interface, s.ip, s.old).await?;
            self.leases.bind(s.ip, s.new);
        }
        self.leases.update(&config);

        let hosts = config.hosts_file();
        let opts = config.opts_file();
        info!(hosts = config.hosts.len(), gateway = ?config.gateway, "New configuration");
        debug!("\n{hosts}{opts}");

        std::fs::write(self.hosts.path(), hosts)?;
        std::fs::write(self.opts.path(), opts)?;
        Ok(config)
    }
}

/// Render, start dnsmasq and follow metadata changes until `shutdown`
/// resolves or dnsmasq exits.
pub async fn run<F>(config: GeneratorConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let metadata = MetadataClient::new(&config.metadata_url);
    let mut version = metadata.wait_until_ready(config.poll_interval).await;

    let host = metadata.self_host().await?;
    info!(host = %host.uuid, "Serving VMs of this host");

    let mut generator = Generator::new(
        metadata.clone(),
        host.uuid,
        config.interface.clone(),
        config.release_program.clone(),
    )?;
    generator.regenerate().await?;

    let args = dnsmasq_args(
        generator.hosts_path(),
        generator.opts_path(),
        &config.lease_file,
        &config.dnsmasq_args,
    );
    let mut dnsmasq = Dnsmasq::launch(&config.dnsmasq_program, &args, &config.lease_file)?;

    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            status = dnsmasq.wait() => {
                return Err(DhcpError::DnsmasqExited(status?));
            }
            _ = &mut shutdown => {
                info!("Shutting down");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        let current = match metadata.version().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Failed to poll metadata version");
                continue;
            }
        };
        if current == version {
            continue;
        }
        debug!(from = %version, to = %current, "Metadata changed");

        match generator.regenerate().await {
            Ok(_) => {
                version = current;
                if let Err(e) = dnsmasq.reload() {
                    warn!(error = %e, "Failed to reload dnsmasq");
                }
            }
            Err(e) => warn!(error = %e, "Failed to generate config"),
        }
    }
}
