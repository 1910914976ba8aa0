//! Turns container metadata into dnsmasq host and option files.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::net::Ipv4Addr;

use serde::Deserialize;
use tracing::warn;

use vtap_broker::MacAddress;

use crate::metadata::Container;

/// Label carrying a VM's network identity as JSON.
pub const VM_METADATA_LABEL: &str = "io.rancher.vm.metadata";

/// Netmask announced alongside the gateway.
pub const GUEST_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 0, 0);

/// Network identity published by a VM container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmMetadata {
    pub mac: MacAddress,
    pub ip: Ipv4Addr,
    pub hostname: String,
    pub gateway: Option<Ipv4Addr>,
}

/// Deserialization shim for [`MacAddress`], which lives in another crate.
struct MacAddressField(MacAddress);

impl<'de> Deserialize<'de> for MacAddressField {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map(MacAddressField).map_err(serde::de::Error::custom)
    }
}

/// Hostname restricted to RFC 1123 labels, so it cannot break out of its
/// field in the hosts file.
struct HostnameField(String);

impl<'de> Deserialize<'de> for HostnameField {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        if !is_valid_hostname(&s) {
            return Err(serde::de::Error::custom(format!("invalid hostname {s:?}")));
        }
        Ok(HostnameField(s))
    }
}

pub fn is_valid_hostname(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub mac: MacAddress,
    pub hostname: String,
    pub create_index: u64,
}

/// Static DHCP configuration for all VMs on one host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhcpConfig {
    pub hosts: BTreeMap<Ipv4Addr, HostEntry>,
    pub gateway: Option<Ipv4Addr>,
}

impl DhcpConfig {
    /// Collect VM records of containers on `host_uuid`.
    ///
    /// When two records claim the same address the newer one (higher
    /// `create_index`, later in the listing on a tie) wins.
    pub fn from_containers(host_uuid: &str, containers: &[Container]) -> Self {
        let mut hosts: BTreeMap<Ipv4Addr, HostEntry> = BTreeMap::new();
        let mut gateways: BTreeMap<Ipv4Addr, Ipv4Addr> = BTreeMap::new();

        for container in containers.iter().filter(|c| c.host_uuid == host_uuid) {
            let Some(raw) = container.labels.get(VM_METADATA_LABEL) else {
                continue;
            };

            let vm = match parse_vm_metadata(raw) {
                Ok(vm) => vm,
                Err(e) => {
                    warn!(container = %container.name, error = %e, "Ignoring malformed VM metadata");
                    continue;
                }
            };

            if hosts
                .get(&vm.ip)
                .is_some_and(|existing| existing.create_index > container.create_index)
            {
                continue;
            }

            match vm.gateway {
                Some(gw) => gateways.insert(vm.ip, gw),
                None => gateways.remove(&vm.ip),
            };
            hosts.insert(
                vm.ip,
                HostEntry {
                    mac: vm.mac,
                    hostname: vm.hostname,
                    create_index: container.create_index,
                },
            );
        }

        Self {
            hosts,
            gateway: gateways.into_values().next(),
        }
    }

    /// Lines of the form `mac,hostname,ip,infinite`, ordered by address.
    pub fn hosts_file(&self) -> String {
        let mut out = String::new();
        for (ip, entry) in &self.hosts {
            let _ = writeln!(out, "{},{},{},infinite", entry.mac, entry.hostname, ip);
        }
        out
    }

    /// Router, netmask and DNS options. Empty without a gateway.
    pub fn opts_file(&self) -> String {
        let mut out = String::new();
        if let Some(gw) = self.gateway {
            let _ = writeln!(out, "option:router,{gw}");
            let _ = writeln!(out, "option:netmask,{GUEST_NETMASK}");
            let _ = writeln!(out, "option:dns-server,{gw}");
        }
        out
    }
}

fn parse_vm_metadata(raw: &str) -> Result<VmMetadata, serde_json::Error> {
    #[derive(Deserialize)]
    struct Raw {
        mac: MacAddressField,
        #[serde(rename = "local-ipv4")]
        ip: Ipv4Addr,
        hostname: HostnameField,
        #[serde(rename = "local-ipv4-gateway", default)]
        gateway: Option<Ipv4Addr>,
    }

    let raw: Raw = serde_json::from_str(raw)?;
    Ok(VmMetadata {
        mac: raw.mac.0,
        ip: raw.ip,
        hostname: raw.hostname.0,
        gateway: raw.gateway,
    })
}

/// An address that moved to a different MAC since the last render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superseded {
    pub ip: Ipv4Addr,
    pub old: MacAddress,
    pub new: MacAddress,
}

/// Address to MAC bindings handed out so far.
#[derive(Debug, Default)]
pub struct LeaseTable {
    bindings: HashMap<Ipv4Addr, MacAddress>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ip: &Ipv4Addr) -> Option<MacAddress> {
        self.bindings.get(ip).copied()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Bindings in `config` that replace a different MAC for the same address.
    pub fn superseded(&self, config: &DhcpConfig) -> Vec<Superseded> {
        config
            .hosts
            .iter()
            .filter_map(|(ip, entry)| match self.bindings.get(ip) {
                Some(old) if *old != entry.mac => Some(Superseded {
                    ip: *ip,
                    old: *old,
                    new: entry.mac,
                }),
                _ => None,
            })
            .collect()
    }

    pub fn bind(&mut self, ip: Ipv4Addr, mac: MacAddress) {
        self.bindings.insert(ip, mac);
    }

    /// Record every binding of `config`. Addresses no longer present keep
    /// their last binding.
    pub fn update(&mut self, config: &DhcpConfig) {
        for (ip, entry) in &config.hosts {
            self.bind(*ip, entry.mac);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "host-1";

    fn vm(name: &str, host: &str, index: u64, metadata: &str) -> Container {
        Container {
            name: name.to_string(),
            host_uuid: host.to_string(),
            labels: HashMap::from([(VM_METADATA_LABEL.to_string(), metadata.to_string())]),
            create_index: index,
        }
    }

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_hosts_sorted_by_address() {
        let containers = vec![
            vm(
                "b",
                HOST,
                1,
                r#"{"mac":"02:00:00:00:00:0b","local-ipv4":"10.42.0.11","hostname":"b"}"#,
            ),
            vm(
                "a",
                HOST,
                2,
                r#"{"mac":"02:00:00:00:00:0a","local-ipv4":"10.42.0.9","hostname":"a"}"#,
            ),
        ];

        let config = DhcpConfig::from_containers(HOST, &containers);
        assert_eq!(
            config.hosts_file(),
            "02:00:00:00:00:0a,a,10.42.0.9,infinite\n02:00:00:00:00:0b,b,10.42.0.11,infinite\n"
        );
        assert_eq!(config.opts_file(), "");
    }

    #[test]
    fn test_other_hosts_and_plain_containers_skipped() {
        let mut plain = vm("plain", HOST, 1, "{}");
        plain.labels.clear();
        let containers = vec![
            plain,
            vm(
                "elsewhere",
                "host-2",
                1,
                r#"{"mac":"02:00:00:00:00:01","local-ipv4":"10.42.0.2","hostname":"x"}"#,
            ),
        ];

        let config = DhcpConfig::from_containers(HOST, &containers);
        assert!(config.hosts.is_empty());
        assert_eq!(config.hosts_file(), "");
    }

    #[test]
    fn test_malformed_metadata_dropped() {
        let containers = vec![
            vm("garbage", HOST, 1, "not json"),
            vm("no-ip", HOST, 2, r#"{"mac":"02:00:00:00:00:01","hostname":"x"}"#),
            vm(
                "bad-mac",
                HOST,
                3,
                r#"{"mac":"zz","local-ipv4":"10.42.0.3","hostname":"x"}"#,
            ),
            vm(
                "injected",
                HOST,
                5,
                r#"{"mac":"02:00:00:00:00:05","local-ipv4":"10.42.0.5","hostname":"a,10.42.0.2,infinite\n02:00:00:00:00:99,evil"}"#,
            ),
            vm(
                "good",
                HOST,
                4,
                r#"{"mac":"02:00:00:00:00:04","local-ipv4":"10.42.0.4","hostname":"good"}"#,
            ),
        ];

        let config = DhcpConfig::from_containers(HOST, &containers);
        assert_eq!(config.hosts.len(), 1);
        assert_eq!(config.hosts[&Ipv4Addr::new(10, 42, 0, 4)].hostname, "good");
        assert_eq!(config.hosts_file().lines().count(), 1);
    }

    #[test]
    fn test_hostname_validation() {
        for ok in ["vm1", "web-01", "vm1.example.com", "A0"] {
            assert!(is_valid_hostname(ok), "{ok}");
        }
        for bad in [
            "",
            "a,b",
            "a\nb",
            "a b",
            "-vm",
            "vm-",
            "vm..local",
            "under_score",
            "x".repeat(64).as_str(),
        ] {
            assert!(!is_valid_hostname(bad), "{bad:?}");
        }
    }

    #[test]
    fn test_newest_record_wins_duplicate_address() {
        let containers = vec![
            vm(
                "new",
                HOST,
                9,
                r#"{"mac":"02:00:00:00:00:09","local-ipv4":"10.42.0.5","hostname":"new"}"#,
            ),
            vm(
                "old",
                HOST,
                3,
                r#"{"mac":"02:00:00:00:00:03","local-ipv4":"10.42.0.5","hostname":"old"}"#,
            ),
        ];

        let config = DhcpConfig::from_containers(HOST, &containers);
        let entry = &config.hosts[&Ipv4Addr::new(10, 42, 0, 5)];
        assert_eq!(entry.hostname, "new");
        assert_eq!(entry.mac, mac("02:00:00:00:00:09"));
    }

    #[test]
    fn test_gateway_options() {
        let containers = vec![vm(
            "gw",
            HOST,
            1,
            r#"{"mac":"02:00:00:00:00:01","local-ipv4":"10.42.0.2","hostname":"gw","local-ipv4-gateway":"10.42.0.1"}"#,
        )];

        let config = DhcpConfig::from_containers(HOST, &containers);
        assert_eq!(config.gateway, Some(Ipv4Addr::new(10, 42, 0, 1)));
        assert_eq!(
            config.opts_file(),
            "option:router,10.42.0.1\noption:netmask,255.255.0.0\noption:dns-server,10.42.0.1\n"
        );
    }

    #[test]
    fn test_gateway_of_lowest_address() {
        let containers = vec![
            vm(
                "high",
                HOST,
                1,
                r#"{"mac":"02:00:00:00:00:01","local-ipv4":"10.42.0.20","hostname":"h","local-ipv4-gateway":"10.42.0.254"}"#,
            ),
            vm(
                "low",
                HOST,
                2,
                r#"{"mac":"02:00:00:00:00:02","local-ipv4":"10.42.0.10","hostname":"l","local-ipv4-gateway":"10.42.0.1"}"#,
            ),
        ];

        let config = DhcpConfig::from_containers(HOST, &containers);
        assert_eq!(config.gateway, Some(Ipv4Addr::new(10, 42, 0, 1)));
    }

    #[test]
    fn test_lease_table_superseded() {
        let ip = Ipv4Addr::new(10, 42, 0, 5);
        let mut table = LeaseTable::new();
        assert!(table.is_empty());

        let first = DhcpConfig::from_containers(
            HOST,
            &[vm(
                "a",
                HOST,
                1,
                r#"{"mac":"02:00:00:00:00:0a","local-ipv4":"10.42.0.5","hostname":"a"}"#,
            )],
        );
        assert!(table.superseded(&first).is_empty());
        table.update(&first);
        assert_eq!(table.get(&ip), Some(mac("02:00:00:00:00:0a")));

        // Same binding again is not superseded.
        assert!(table.superseded(&first).is_empty());

        let second = DhcpConfig::from_containers(
            HOST,
            &[vm(
                "b",
                HOST,
                2,
                r#"{"mac":"02:00:00:00:00:0b","local-ipv4":"10.42.0.5","hostname":"b"}"#,
            )],
        );
        assert_eq!(
            table.superseded(&second),
            vec![Superseded {
                ip,
                old: mac("02:00:00:00:00:0a"),
                new: mac("02:00:00:00:00:0b"),
            }]
        );
        table.update(&second);
        assert_eq!(table.get(&ip), Some(mac("02:00:00:00:00:0b")));
    }

    #[test]
    fn test_lease_table_keeps_vanished_bindings() {
        let mut table = LeaseTable::new();
        table.bind(Ipv4Addr::new(10, 42, 0, 7), mac("02:00:00:00:00:07"));
        table.update(&DhcpConfig::default());
        assert_eq!(table.len(), 1);
    }
}
