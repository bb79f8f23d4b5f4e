use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use daemon::DaemonPaths;
use sha2::{Digest, Sha256};
use smoltcp::wire::EthernetAddress;

/// Locally administered prefix shared by every derived guest MAC.
pub const BASE_HW_ADDR: [u8; 3] = [0x5a, 0x94, 0xef];

/// A 48-bit Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: Self = Self([0xff; 6]);

    /// `prefix` followed by the first three bytes of SHA-256(`identity`).
    ///
    /// Distinct identities give distinct addresses with high probability only;
    /// uniqueness is not guaranteed.
    pub fn derive(prefix: [u8; 3], identity: &str) -> Self {
        let digest: [u8; 32] = Sha256::digest(identity.as_bytes()).into();
        let [a, b, c, ..] = digest;
        let [p0, p1, p2] = prefix;
        Self([p0, p1, p2, a, b, c])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl From<MacAddress> for EthernetAddress {
    fn from(mac: MacAddress) -> Self {
        EthernetAddress(mac.0)
    }
}

impl From<EthernetAddress> for MacAddress {
    fn from(addr: EthernetAddress) -> Self {
        Self(addr.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid MAC address: {0}")]
pub struct ParseMacError(String);

impl FromStr for MacAddress {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in &mut octets {
            let part = parts.next().ok_or_else(|| ParseMacError(s.to_string()))?;
            if part.len() != 2 {
                return Err(ParseMacError(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError(s.to_string()));
        }
        Ok(Self(octets))
    }
}

/// Process-scoped identity of one VM instance.
///
/// Owned by the composition root and shared by reference. The guest MAC is
/// derived from the daemon directory on first use and cached for the
/// lifetime of the value.
#[derive(Debug)]
pub struct Instance {
    paths: DaemonPaths,
    mac: OnceLock<MacAddress>,
}

impl Instance {
    pub fn new(paths: DaemonPaths) -> Self {
        Self {
            paths,
            mac: OnceLock::new(),
        }
    }

    pub fn paths(&self) -> &DaemonPaths {
        &self.paths
    }

    /// MAC address of the guest's virtual NIC.
    pub fn mac_address(&self) -> MacAddress {
        *self.mac.get_or_init(|| {
            MacAddress::derive(BASE_HW_ADDR, &self.paths.dir().to_string_lossy())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn derive_is_deterministic() {
        let a = MacAddress::derive(BASE_HW_ADDR, "/home/u/.vmctl/default/daemon");
        let b = MacAddress::derive(BASE_HW_ADDR, "/home/u/.vmctl/default/daemon");
        assert_eq!(a, b);
        assert_eq!(&a.octets()[..3], &BASE_HW_ADDR);
    }

    #[test]
    fn derive_changes_with_identity() {
        let a = MacAddress::derive(BASE_HW_ADDR, "/home/u/.vmctl/default/daemon");
        let b = MacAddress::derive(BASE_HW_ADDR, "/home/u/.vmctl/work/daemon");
        assert_eq!(&a.octets()[..3], &b.octets()[..3]);
        assert_ne!(&a.octets()[3..], &b.octets()[3..]);
    }

    #[test]
    fn derive_uses_sha256_prefix() {
        // sha256("abc") = ba7816bf...
        let mac = MacAddress::derive(BASE_HW_ADDR, "abc");
        assert_eq!(mac.to_string(), "5a:94:ef:ba:78:16");
    }

    #[test]
    fn display_and_parse() {
        let mac: MacAddress = "5a:94:ef:e4:0c:dd".parse().unwrap();
        assert_eq!(mac, MacAddress([0x5a, 0x94, 0xef, 0xe4, 0x0c, 0xdd]));
        assert_eq!(mac.to_string(), "5a:94:ef:e4:0c:dd");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!("5a:94:ef:e4:0c".parse::<MacAddress>().is_err());
        assert!("5a:94:ef:e4:0c:dd:00".parse::<MacAddress>().is_err());
        assert!("5a:94:ef:e4:0c:zz".parse::<MacAddress>().is_err());
        assert!("5a:94:ef:e4:0c:d".parse::<MacAddress>().is_err());
    }

    #[test]
    fn instance_caches_mac() {
        let instance = Instance::new(DaemonPaths::new(PathBuf::from("/i")));
        let first = instance.mac_address();
        assert_eq!(instance.mac_address(), first);
        assert_eq!(first, MacAddress::derive(BASE_HW_ADDR, "/i/daemon"));
    }

    #[test]
    fn instance_mac_is_stable_under_concurrent_first_access() {
        let instance = Instance::new(DaemonPaths::new(PathBuf::from("/concurrent")));
        let macs: Vec<MacAddress> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8).map(|_| s.spawn(|| instance.mac_address())).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(macs.iter().all(|m| *m == instance.mac_address()));
    }
}
