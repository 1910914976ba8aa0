//! Kernel backend used by provisioning sessions.

use std::io;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{BrokerError, Result};
use crate::mac::MacAddress;
use crate::netlink::NetlinkHandle;
use crate::tap::TapDevice;

/// The kernel operations a session performs, in the order it performs them.
#[async_trait]
pub trait LinkBackend: Send + Sync + 'static {
    /// Allocate a fresh TAP device.
    async fn create_tap(&self) -> Result<TapDevice>;

    /// Assign a hardware address to the device.
    async fn set_address(&self, tap: &TapDevice, mac: MacAddress) -> Result<()>;

    /// Attach the device to the named bridge, creating the bridge if needed.
    async fn attach(&self, tap: &TapDevice, bridge: &str) -> Result<()>;

    /// Set the device administratively up.
    async fn set_up(&self, tap: &TapDevice) -> Result<()>;
}

/// Run a synchronous device allocation on the blocking pool.
///
/// Allocation can sleep on the kernel's rtnl lock. A device that finishes
/// after the caller gave up is closed when the task drops it.
pub async fn allocate_blocking<F>(allocate: F) -> Result<TapDevice>
where
    F: FnOnce() -> io::Result<TapDevice> + Send + 'static,
{
    tokio::task::spawn_blocking(allocate)
        .await
        .map_err(|e| BrokerError::Io(io::Error::other(e)))?
        .map_err(BrokerError::from)
}

/// Backend that talks to the running kernel.
pub struct NetlinkBackend {
    netlink: NetlinkHandle,
}

impl NetlinkBackend {
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Result<Self> {
        Ok(Self {
            netlink: NetlinkHandle::new()?,
        })
    }

    pub fn netlink(&self) -> &NetlinkHandle {
        &self.netlink
    }
}

#[async_trait]
impl LinkBackend for NetlinkBackend {
    async fn create_tap(&self) -> Result<TapDevice> {
        allocate_blocking(TapDevice::create).await
    }

    async fn set_address(&self, tap: &TapDevice, mac: MacAddress) -> Result<()> {
        self.netlink.set_address(tap.if_index(), mac).await
    }

    async fn attach(&self, tap: &TapDevice, bridge: &str) -> Result<()> {
        let bridge_index = self.netlink.ensure_bridge(bridge).await?;
        self.netlink
            .set_controller(tap.if_index(), bridge_index)
            .await?;
        debug!(tap = %tap.name(), bridge = %bridge, "Attached to bridge");
        Ok(())
    }

    async fn set_up(&self, tap: &TapDevice) -> Result<()> {
        self.netlink.set_up(tap.if_index()).await
    }
}
