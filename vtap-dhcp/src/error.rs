//! Error types for the DHCP configuration generator.

use std::io;
use std::process::ExitStatus;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhcpError {
    #[error("Metadata request {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Metadata service returned {status} for {url}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to run {program}: {source}")]
    Command {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} failed: {status}")]
    CommandFailed { program: String, status: ExitStatus },

    #[error("dnsmasq exited: {0}")]
    DnsmasqExited(ExitStatus),

    #[error("dnsmasq has no process id")]
    NoPid,

    #[error("Failed to signal dnsmasq: {0}")]
    Signal(#[from] nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, DhcpError>;
