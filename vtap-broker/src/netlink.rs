//! Netlink operations on links and bridges.
//!
//! All mutating operations are idempotent: creating a bridge that already
//! exists, attaching a port that is already attached or setting a link up
//! twice all succeed.

use futures::TryStreamExt;
use netlink_packet_route::link::{LinkAttribute, LinkFlag, LinkMessage};
use nix::libc;
use rtnetlink::Handle;
use tracing::{debug, info};

use crate::error::{BrokerError, Result};
use crate::mac::MacAddress;

/// Link state read back from the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub index: u32,
    pub name: String,
    pub address: Option<MacAddress>,
    /// Index of the bridge this link is a port of.
    pub controller: Option<u32>,
    pub up: bool,
}

impl LinkStatus {
    fn from_message(link: LinkMessage) -> Self {
        let mut status = LinkStatus {
            index: link.header.index,
            name: String::new(),
            address: None,
            controller: None,
            up: link.header.flags.contains(&LinkFlag::Up),
        };

        for attr in link.attributes {
            match attr {
                LinkAttribute::IfName(name) => status.name = name,
                LinkAttribute::Address(addr) => {
                    if let Ok(octets) = <[u8; 6]>::try_from(addr.as_slice()) {
                        status.address = Some(MacAddress::from(octets));
                    }
                }
                LinkAttribute::Controller(index) => status.controller = Some(index),
                _ => {}
            }
        }

        status
    }
}

/// Handle for netlink operations.
#[derive(Clone)]
pub struct NetlinkHandle {
    handle: Handle,
}

impl NetlinkHandle {
    /// Open a netlink connection and drive it on the current runtime.
    pub fn new() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        Ok(Self { handle })
    }

    /// Look up a link index by name. `None` if no such link exists.
    pub async fn link_index(&self, name: &str) -> Result<Option<u32>> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();

        match links.try_next().await {
            Ok(link) => Ok(link.map(|l| l.header.index)),
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::ENODEV => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Return the index of the named bridge, creating it and setting it up
    /// if it does not exist yet.
    pub async fn ensure_bridge(&self, name: &str) -> Result<u32> {
        if let Some(index) = self.link_index(name).await? {
            debug!(bridge = %name, index, "Bridge already exists");
            return Ok(index);
        }

        info!(bridge = %name, "Creating bridge");
        match self
            .handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await
        {
            Ok(()) => {}
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => {
                // Another session won the race.
                debug!(bridge = %name, "Bridge appeared concurrently");
            }
            Err(e) => return Err(e.into()),
        }

        let index = self
            .link_index(name)
            .await?
            .ok_or_else(|| BrokerError::LinkNotFound(name.to_string()))?;

        self.set_up(index).await?;
        info!(bridge = %name, index, "Bridge created and up");
        Ok(index)
    }

    /// Attach a link to a bridge as one of its ports.
    pub async fn set_controller(&self, index: u32, bridge_index: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .controller(bridge_index)
            .execute()
            .await?;
        Ok(())
    }

    /// Set the hardware address of a link.
    pub async fn set_address(&self, index: u32, mac: MacAddress) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .address(mac.octets().to_vec())
            .execute()
            .await?;
        Ok(())
    }

    /// Bring a network interface up.
    pub async fn set_up(&self, index: u32) -> Result<()> {
        self.handle.link().set(index).up().execute().await?;
        Ok(())
    }

    /// Read back the state of a single link.
    pub async fn link_status(&self, index: u32) -> Result<LinkStatus> {
        let mut links = self.handle.link().get().match_index(index).execute();

        match links.try_next().await {
            Ok(Some(link)) => Ok(LinkStatus::from_message(link)),
            Ok(None) => Err(BrokerError::LinkNotFound(index.to_string())),
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::ENODEV => {
                Err(BrokerError::LinkNotFound(index.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// List the ports currently attached to a bridge.
    pub async fn bridge_ports(&self, bridge_index: u32) -> Result<Vec<LinkStatus>> {
        let mut links = self.handle.link().get().execute();
        let mut ports = Vec::new();

        while let Some(link) = links.try_next().await? {
            let status = LinkStatus::from_message(link);
            if status.controller == Some(bridge_index) {
                ports.push(status);
            }
        }

        Ok(ports)
    }
}
