//! MAC address policy.
//!
//! Every address handed to a TAP device is locally administered and unicast:
//! generated addresses use the prefix octet `0x02` followed by five random
//! octets, and caller-supplied addresses get their first octet rewritten to
//! `0x02`.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use rand::Rng;

use crate::error::MacError;

/// First octet of every address the broker assigns.
pub const LOCAL_PREFIX: u8 = 0x02;

/// Length of the textual form `xx:xx:xx:xx:xx:xx`.
pub const MAC_STRING_LEN: usize = 17;

/// A 6-byte Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// All-zero address. On the wire it means "let the broker choose".
    pub const WILDCARD: MacAddress = MacAddress([0; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Generate a random locally administered unicast address.
    pub fn random() -> Self {
        let mut mac = [0u8; 6];
        rand::thread_rng().fill(&mut mac[1..]);
        mac[0] = LOCAL_PREFIX;
        Self(mac)
    }

    /// Rewrite the first octet into the broker's locally administered prefix.
    pub fn normalized(self) -> Self {
        let mut mac = self.0;
        mac[0] = LOCAL_PREFIX;
        Self(mac)
    }

    /// Read the current address of an existing interface from sysfs.
    pub fn from_interface(name: &str) -> Result<Self, MacError> {
        Self::from_sysfs(Path::new("/sys/class/net"), name)
    }

    fn from_sysfs(root: &Path, name: &str) -> Result<Self, MacError> {
        let path = root.join(name).join("address");
        let s = std::fs::read_to_string(&path).map_err(|source| MacError::Interface {
            name: name.to_string(),
            source,
        })?;
        s.trim().parse()
    }

    pub fn is_wildcard(&self) -> bool {
        *self == Self::WILDCARD
    }

    pub fn is_local_unicast(&self) -> bool {
        self.0[0] & 0x02 == 0x02 && self.0[0] & 0x01 == 0
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl FromStr for MacAddress {
    type Err = MacError;

    /// Parse the fixed format `xx:xx:xx:xx:xx:xx` (either case).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MacError::Invalid(s.to_string());

        if s.len() != MAC_STRING_LEN {
            return Err(invalid());
        }

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(invalid());
        }

        let mut mac = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            mac[i] = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(Self(mac))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}
