//! vtap-dhcp - static DHCP for VMs attached through vtap.
//!
//! Reads each VM's MAC, address and hostname from the metadata service,
//! renders them into dnsmasq host and option files and keeps a dnsmasq
//! instance serving exactly those bindings.

pub mod dnsmasq;
pub mod error;
pub mod generator;
pub mod metadata;
pub mod render;

pub use error::DhcpError;
pub use generator::{Generator, GeneratorConfig, run};
pub use metadata::MetadataClient;
pub use render::{DhcpConfig, LeaseTable};
