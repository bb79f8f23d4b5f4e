use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use crate::mac::MacAddress;
use crate::network::NetworkError;
use crate::resolv::HostResolver;

/// Guest-side interface the virtual NIC appears as.
pub const NET_INTERFACE: &str = "eth1";

/// Set in the environment of the daemon's own background process.
pub const SUBPROCESS_ENV_VAR: &str = "VMCTL_GVPROXY";

pub const GATEWAY_MAC: MacAddress = MacAddress([0x5a, 0x94, 0xef, 0xe4, 0x0c, 0xdd]);
pub const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 107, 1);
pub const DEVICE_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 107, 2);
/// Virtual address the guest uses to reach host loopback.
pub const NAT_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 107, 254);
pub const SUBNET: Subnet = Subnet::new(Ipv4Addr::new(192, 168, 107, 0), 24);
pub const MTU: u16 = 1500;

const DNS_PORT: u16 = 53;
const DNS_ZONE: &str = "host.";
const DNS_RECORDS: [&str; 2] = ["docker.internal", "lima.internal"];

/// An IPv4 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl Subnet {
    pub const fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }

    pub fn netmask(&self) -> Ipv4Addr {
        let bits = match self.prefix_len {
            0 => 0,
            n => u32::MAX << (32 - u32::from(n.min(32))),
        };
        Ipv4Addr::from(bits)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask());
        u32::from(ip) & mask == u32::from(self.addr) & mask
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for Subnet {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetworkError::InvalidConfig(format!("invalid subnet: {s}"));
        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix_len: u8 = prefix.parse().map_err(|_| invalid())?;
        if prefix_len > 32 {
            return Err(invalid());
        }
        Ok(Self::new(addr, prefix_len))
    }
}

/// A DNS record served from a local zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub ip: Ipv4Addr,
}

/// A DNS zone answered by the gateway. Record names are relative to `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    pub name: String,
    pub records: Vec<Record>,
}

/// Framing spoken on the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// 4-byte big-endian length prefix per Ethernet frame.
    Qemu,
}

/// Everything the virtual network needs. Built fresh on every start.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub debug: bool,
    pub mtu: u16,
    pub subnet: Subnet,
    pub gateway_ip: Ipv4Addr,
    pub gateway_mac: MacAddress,
    pub dhcp_static_leases: BTreeMap<Ipv4Addr, MacAddress>,
    pub dns: Vec<Zone>,
    pub dns_search_domains: Vec<String>,
    /// Where queries outside the local zones go; the first one is used.
    pub upstream_nameservers: Vec<SocketAddrV4>,
    /// Virtual IP to host IP.
    pub nat: BTreeMap<Ipv4Addr, Ipv4Addr>,
    /// Extra addresses the gateway answers ARP and ICMP echo for.
    pub gateway_virtual_ips: Vec<Ipv4Addr>,
    pub protocol: Protocol,
}

impl NetworkConfig {
    /// The fixed guest network with `device_mac` leased [`DEVICE_IP`].
    pub fn new(device_mac: MacAddress, resolver: HostResolver) -> Self {
        let records = DNS_RECORDS
            .iter()
            .map(|name| Record {
                name: (*name).to_string(),
                ip: GATEWAY_IP,
            })
            .collect();

        Self {
            debug: false,
            mtu: MTU,
            subnet: SUBNET,
            gateway_ip: GATEWAY_IP,
            gateway_mac: GATEWAY_MAC,
            dhcp_static_leases: BTreeMap::from([(DEVICE_IP, device_mac)]),
            dns: vec![Zone {
                name: DNS_ZONE.to_string(),
                records,
            }],
            dns_search_domains: resolver.search_domains,
            upstream_nameservers: resolver
                .nameservers
                .into_iter()
                .map(|ip| SocketAddrV4::new(ip, DNS_PORT))
                .collect(),
            nat: BTreeMap::from([(NAT_IP, Ipv4Addr::LOCALHOST)]),
            gateway_virtual_ips: vec![NAT_IP],
            protocol: Protocol::Qemu,
        }
    }

    /// Check the configuration is internally consistent.
    pub fn validate(&self) -> Result<(), NetworkError> {
        let invalid = |msg: String| Err(NetworkError::InvalidConfig(msg));

        if self.mtu < 576 {
            return invalid(format!("mtu {} is below 576", self.mtu));
        }
        if !self.subnet.contains(self.gateway_ip) {
            return invalid(format!(
                "gateway {} is outside subnet {}",
                self.gateway_ip, self.subnet
            ));
        }
        for ip in self.dhcp_static_leases.keys() {
            if !self.subnet.contains(*ip) {
                return invalid(format!("lease {ip} is outside subnet {}", self.subnet));
            }
            if *ip == self.gateway_ip {
                return invalid(format!("lease {ip} collides with the gateway"));
            }
        }
        for ip in self.nat.keys().chain(&self.gateway_virtual_ips) {
            if !self.subnet.contains(*ip) {
                return invalid(format!(
                    "virtual ip {ip} is outside subnet {}",
                    self.subnet
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_mac() -> MacAddress {
        MacAddress([0x5a, 0x94, 0xef, 0x01, 0x02, 0x03])
    }

    #[test]
    fn fixed_network_parameters() {
        let config = NetworkConfig::new(device_mac(), HostResolver::default());
        assert_eq!(config.mtu, 1500);
        assert_eq!(config.subnet.to_string(), "192.168.107.0/24");
        assert_eq!(config.gateway_ip.to_string(), "192.168.107.1");
        assert_eq!(config.gateway_mac.to_string(), "5a:94:ef:e4:0c:dd");
        assert_eq!(config.dhcp_static_leases.get(&DEVICE_IP), Some(&device_mac()));
        assert_eq!(
            config.nat.get(&Ipv4Addr::new(192, 168, 107, 254)),
            Some(&Ipv4Addr::LOCALHOST)
        );
        assert_eq!(config.gateway_virtual_ips, vec![NAT_IP]);
        assert_eq!(config.protocol, Protocol::Qemu);
        config.validate().unwrap();
    }

    #[test]
    fn host_zone_points_at_gateway() {
        let config = NetworkConfig::new(device_mac(), HostResolver::default());
        let [zone] = config.dns.as_slice() else {
            panic!("expected one zone");
        };
        assert_eq!(zone.name, "host.");
        let names: Vec<_> = zone.records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["docker.internal", "lima.internal"]);
        assert!(zone.records.iter().all(|r| r.ip == GATEWAY_IP));
    }

    #[test]
    fn resolver_state_is_carried() {
        let resolver = HostResolver::parse("search foo.local\nnameserver 10.0.0.53\n");
        let config = NetworkConfig::new(device_mac(), resolver);
        assert_eq!(config.dns_search_domains, vec!["foo.local"]);
        assert_eq!(
            config.upstream_nameservers,
            vec![SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 53), 53)]
        );
    }

    #[test]
    fn subnet_math() {
        let subnet: Subnet = "192.168.107.0/24".parse().unwrap();
        assert_eq!(subnet, SUBNET);
        assert_eq!(subnet.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert!(subnet.contains(Ipv4Addr::new(192, 168, 107, 254)));
        assert!(!subnet.contains(Ipv4Addr::new(192, 168, 108, 1)));
        assert_eq!(Subnet::new(Ipv4Addr::UNSPECIFIED, 0).netmask(), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn subnet_parse_rejects_garbage() {
        assert!("192.168.107.0".parse::<Subnet>().is_err());
        assert!("192.168.107.0/33".parse::<Subnet>().is_err());
        assert!("nope/24".parse::<Subnet>().is_err());
    }

    #[test]
    fn validate_rejects_lease_outside_subnet() {
        let mut config = NetworkConfig::new(device_mac(), HostResolver::default());
        config
            .dhcp_static_leases
            .insert(Ipv4Addr::new(10, 0, 0, 2), device_mac());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("10.0.0.2"), "got: {err}");
    }

    #[test]
    fn validate_rejects_tiny_mtu() {
        let mut config = NetworkConfig::new(device_mac(), HostResolver::default());
        config.mtu = 100;
        assert!(config.validate().is_err());
    }
}
