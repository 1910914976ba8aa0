//! Supervision of the dnsmasq lease server.

use std::io;
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use vtap_broker::MacAddress;

use crate::error::{DhcpError, Result};

pub const DEFAULT_LEASE_FILE: &str = "/var/lib/misc/vm-dnsmasq.leases";

/// Only statically configured hosts get leases.
pub const DHCP_RANGE: &str = "10.42.0.1,static";

pub const DEFAULT_RELEASE_PROGRAM: &str = "dhcp_release";

/// Command line for dnsmasq serving the rendered files.
pub fn dnsmasq_args(hosts: &Path, opts: &Path, lease_file: &Path, extra: &[String]) -> Vec<String> {
    let mut args = vec![
        "-d".to_string(),
        format!("--dhcp-range={DHCP_RANGE}"),
        format!("--dhcp-hostsfile={}", hosts.display()),
        format!("--dhcp-optsfile={}", opts.display()),
        format!("--dhcp-leasefile={}", lease_file.display()),
    ];
    args.extend(extra.iter().cloned());
    args
}

/// A running dnsmasq in the foreground.
pub struct Dnsmasq {
    child: Child,
    pid: Pid,
}

impl Dnsmasq {
    /// Start `program` with `args`, removing leftover leases first.
    pub fn launch(program: &str, args: &[String], lease_file: &Path) -> Result<Self> {
        match std::fs::remove_file(lease_file) {
            Ok(()) => info!(path = %lease_file.display(), "Deleted lease file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %lease_file.display(), error = %e, "Failed to delete lease file"),
        }

        info!(program, ?args, "Starting dnsmasq");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DhcpError::Command {
                program: program.to_string(),
                source,
            })?;

        let pid = child.id().ok_or(DhcpError::NoPid)?;
        Ok(Self {
            child,
            pid: Pid::from_raw(pid as i32),
        })
    }

    /// Make dnsmasq re-read the host and option files.
    pub fn reload(&self) -> Result<()> {
        info!(pid = self.pid.as_raw(), "Sending SIGHUP to dnsmasq");
        kill(self.pid, Signal::SIGHUP)?;
        Ok(())
    }

    /// Resolves when dnsmasq exits.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }
}

/// Drop the lease `old` holds on `ip` so the new owner can take it.
pub async fn release_lease(program: &str, interface: &str, ip: Ipv4Addr, old: MacAddress) -> Result<()> {
    info!(%ip, mac = %old, "Expiring old lease");

    let status = Command::new(program)
        .args([interface, &ip.to_string(), &old.to_string(), "*"])
        .status()
        .await
        .map_err(|source| DhcpError::Command {
            program: program.to_string(),
            source,
        })?;

    if !status.success() {
        return Err(DhcpError::CommandFailed {
            program: program.to_string(),
            status,
        });
    }
    Ok(())
}
