//! Error types for the broker.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::server::SessionState;

/// MAC address parsing errors.
#[derive(Debug, Error)]
pub enum MacError {
    #[error("Invalid MAC address: {0:?}")]
    Invalid(String),

    #[error("Failed to read address of interface {name}: {source}")]
    Interface {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Descriptor-transfer channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Socket error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed handshake: {0}")]
    Handshake(#[from] MacError),

    #[error("Handshake not received within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Peer closed the connection before sending a descriptor")]
    Closed,

    #[error("Message carried no descriptor")]
    MissingDescriptor,

    #[error("Message carried {0} descriptors, expected exactly one")]
    TooManyDescriptors(usize),

    #[error("Control data truncated")]
    Truncated,

    #[error("Unexpected descriptor tag {actual:?} (expected {expected:?})")]
    UnexpectedTag { expected: String, actual: String },
}

/// Errors of a single provisioning session or of the kernel backend.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Netlink error: {0}")]
    Netlink(String),

    #[error("Interface not found: {0}")]
    LinkNotFound(String),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Step {state} did not finish within {timeout:?}")]
    StepTimeout {
        state: SessionState,
        timeout: Duration,
    },
}

impl From<rtnetlink::Error> for BrokerError {
    fn from(e: rtnetlink::Error) -> Self {
        BrokerError::Netlink(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
