//! Static-lease DHCP server.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use bytes::Bytes;
use smoltcp::wire::{DhcpMessageType, DhcpOption, DhcpPacket, DhcpRepr};

pub use smoltcp::wire::{DHCP_CLIENT_PORT as CLIENT_PORT, DHCP_SERVER_PORT as SERVER_PORT};

use crate::config::NetworkConfig;
use crate::mac::MacAddress;

const LEASE_SECS: u32 = 3600;
/// BOOTP minimum; some clients drop anything shorter.
const MIN_MESSAGE_LEN: usize = 300;
/// Longest value a single option instance can carry.
const MAX_OPTION_LEN: usize = 255;

const OPT_MTU: u8 = 26;
const OPT_DOMAIN_SEARCH: u8 = 119;

/// A reply ready to be wrapped in UDP from the server port.
#[derive(Debug)]
pub struct DhcpReply {
    pub client_mac: MacAddress,
    pub dst: Ipv4Addr,
    pub payload: Bytes,
}

/// Answers DISCOVER and REQUEST for clients with a static lease.
#[derive(Debug)]
pub struct DhcpServer {
    leases: BTreeMap<MacAddress, Ipv4Addr>,
    server_ip: Ipv4Addr,
    netmask: Ipv4Addr,
    mtu: [u8; 2],
    search: Vec<u8>,
}

impl DhcpServer {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            leases: config
                .dhcp_static_leases
                .iter()
                .map(|(ip, mac)| (*mac, *ip))
                .collect(),
            server_ip: config.gateway_ip,
            netmask: config.subnet.netmask(),
            mtu: config.mtu.to_be_bytes(),
            search: encode_search_list(&config.dns_search_domains),
        }
    }

    pub fn lease(&self, mac: &MacAddress) -> Option<Ipv4Addr> {
        self.leases.get(mac).copied()
    }

    /// The reply to a client message, if one is owed.
    pub fn handle(&self, message: &[u8]) -> Option<DhcpReply> {
        let packet = DhcpPacket::new_checked(message).ok()?;
        let request = DhcpRepr::parse(&packet).ok()?;
        let client_mac = MacAddress::from(request.client_hardware_address);
        let lease = self.lease(&client_mac)?;

        let reply_type = match request.message_type {
            DhcpMessageType::Discover => DhcpMessageType::Offer,
            DhcpMessageType::Request => {
                if let Some(server) = request.server_identifier
                    && server != self.server_ip
                {
                    return None;
                }
                let wanted = request.requested_ip.unwrap_or(request.client_ip);
                if wanted == lease {
                    DhcpMessageType::Ack
                } else {
                    DhcpMessageType::Nak
                }
            }
            _ => return None,
        };

        let nak = reply_type == DhcpMessageType::Nak;
        let broadcast = nak || request.broadcast || request.client_ip.is_unspecified();
        Some(DhcpReply {
            client_mac,
            dst: if broadcast { Ipv4Addr::BROADCAST } else { lease },
            payload: self.reply(&request, reply_type, lease)?,
        })
    }

    fn reply(
        &self,
        request: &DhcpRepr<'_>,
        reply_type: DhcpMessageType,
        lease: Ipv4Addr,
    ) -> Option<Bytes> {
        let granted = reply_type != DhcpMessageType::Nak;
        let mut extra = Vec::new();
        if granted {
            extra.push(DhcpOption {
                kind: OPT_MTU,
                data: &self.mtu,
            });
            // RFC 3396: long options are split across consecutive instances.
            extra.extend(self.search.chunks(MAX_OPTION_LEN).map(|chunk| DhcpOption {
                kind: OPT_DOMAIN_SEARCH,
                data: chunk,
            }));
        }

        let reply = DhcpRepr {
            message_type: reply_type,
            transaction_id: request.transaction_id,
            secs: 0,
            client_hardware_address: request.client_hardware_address,
            client_ip: request.client_ip,
            your_ip: if granted { lease } else { Ipv4Addr::UNSPECIFIED },
            server_ip: self.server_ip,
            router: granted.then_some(self.server_ip),
            subnet_mask: granted.then_some(self.netmask),
            relay_agent_ip: Ipv4Addr::UNSPECIFIED,
            broadcast: request.broadcast,
            requested_ip: None,
            client_identifier: None,
            server_identifier: Some(self.server_ip),
            parameter_request_list: None,
            dns_servers: granted.then(|| [self.server_ip].into_iter().collect()),
            max_size: None,
            lease_duration: granted.then_some(LEASE_SECS),
            renew_duration: None,
            rebind_duration: None,
            additional_options: &extra,
        };

        let mut buf = vec![0u8; reply.buffer_len().max(MIN_MESSAGE_LEN)];
        reply
            .emit(&mut DhcpPacket::new_unchecked(buf.as_mut_slice()))
            .ok()?;
        Some(Bytes::from(buf))
    }
}

/// RFC 3397 domain search list, in uncompressed DNS wire format.
fn encode_search_list(domains: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for domain in domains {
        for label in domain.trim_end_matches('.').split('.') {
            let Ok(len) = u8::try_from(label.len()) else {
                continue;
            };
            if len == 0 || len > 63 {
                continue;
            }
            out.push(len);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
    }
    out
}
