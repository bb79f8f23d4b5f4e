//! gvproxy: a user-mode network daemon for a single guest VM.
//!
//! ```text
//!  guest VM (qemu)                       host
//! ┌───────────────┐  gvproxy.sock  ┌───────────────────────────┐
//! │ eth1          │───────────────▶│ VirtualNetwork            │
//! │ 192.168.107.2 │  qemu framing  │  gateway 192.168.107.1    │
//! └───────────────┘                │  ARP / ICMP / DHCP / DNS  │
//!                                  │  UDP/TCP NAT ─▶ host      │
//!                                  └───────────────────────────┘
//! ```
//!
//! [`GvproxyDaemon`] owns the control socket and implements the
//! [`daemon::Daemon`] contract. The guest NIC's MAC address is derived from
//! the instance identity, see [`Instance`].

mod config;
mod deps;
mod mac;
mod network;
mod process;
mod resolv;

pub use config::{
    DEVICE_IP, GATEWAY_IP, GATEWAY_MAC, MTU, NAT_IP, NET_INTERFACE, NetworkConfig, Protocol,
    Record, SUBNET, SUBPROCESS_ENV_VAR, Subnet, Zone,
};
pub use deps::qemu_dependencies;
pub use mac::{BASE_HW_ADDR, Instance, MacAddress};
pub use network::{NetworkError, VirtualNetwork};
pub use process::{GvproxyDaemon, Info, NAME, run};
pub use resolv::{HostResolver, RESOLV_CONF};
