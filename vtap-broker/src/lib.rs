//! vtap-broker - hands bridged TAP devices to unprivileged processes.
//!
//! The privileged daemon creates a TAP device per connection, gives it a
//! locally administered MAC address, attaches it to a bridge, sets it up and
//! passes the open descriptor back over the Unix socket with `SCM_RIGHTS`.
//! The client half of the wire protocol lives in [`channel`] and is shared
//! with `vtap-client`.

pub mod backend;
pub mod channel;
pub mod config;
pub mod error;
pub mod mac;
pub mod netlink;
pub mod server;
pub mod tap;

pub use backend::{LinkBackend, NetlinkBackend};
pub use config::BrokerConfig;
pub use error::{BrokerError, ChannelError, MacError};
pub use mac::MacAddress;
pub use server::{Broker, SessionState};
pub use tap::TapDevice;
