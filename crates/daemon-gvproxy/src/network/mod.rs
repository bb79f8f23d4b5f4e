//! User-mode network stack behind the virtual gateway.
//!
//! The gateway answers ARP and ICMP echo for its own and virtual addresses,
//! serves DHCP and DNS, and proxies guest UDP and TCP to host sockets. NAT
//! addresses map to host addresses; anything outside the subnet goes to the
//! real destination.

mod dhcp;
mod dns;
mod error;
mod packet;
mod tcp;
mod udp;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetFrame, EthernetProtocol, Icmpv4Packet, Icmpv4Repr,
    IpProtocol, Ipv4Packet, Ipv4Repr, TcpControl, TcpPacket, TcpRepr, UdpPacket,
};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, trace, warn};

pub use error::NetworkError;

use self::dhcp::DhcpServer;
use self::dns::{DnsServer, Lookup};
use self::packet::{Link, TcpHeader, ip, rx_checksums, tcp_reset};
use self::tcp::{ConnKey, Outgoing, TcpEvent, TcpNat};
use self::udp::{DNS_IDLE, FLOW_IDLE, FlowKey, UdpEvent, UdpNat};
use crate::config::{NetworkConfig, Protocol};
use crate::mac::MacAddress;

const MAX_FRAME: usize = 65_536;
const EVENT_QUEUE: usize = 256;

fn codec(protocol: Protocol) -> LengthDelimitedCodec {
    match protocol {
        Protocol::Qemu => LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(MAX_FRAME)
            .new_codec(),
    }
}

/// The network a guest NIC attaches to.
#[derive(Debug, Clone)]
pub struct VirtualNetwork {
    config: Arc<NetworkConfig>,
}

impl VirtualNetwork {
    pub fn new(config: NetworkConfig) -> Result<Self, NetworkError> {
        config.validate()?;
        info!(
            subnet = %config.subnet,
            gateway = %config.gateway_ip,
            mtu = config.mtu,
            "virtual network configured"
        );
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Bridge one guest connection until the guest hangs up.
    ///
    /// Host sockets opened for the guest are closed when this returns or is
    /// dropped.
    pub async fn accept_qemu(&self, conn: UnixStream) -> Result<(), NetworkError> {
        let mut framed = Framed::new(conn, codec(self.config.protocol));
        let (udp_tx, mut udp_rx) = mpsc::channel(EVENT_QUEUE);
        let (tcp_tx, mut tcp_rx) = mpsc::channel(EVENT_QUEUE);
        let mut stack = Stack::new(Arc::clone(&self.config), udp_tx, tcp_tx);
        info!("guest connected");

        loop {
            let frames = tokio::select! {
                frame = framed.next() => match frame {
                    Some(Ok(frame)) => stack.handle_frame(&frame),
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        info!("guest disconnected");
                        return Ok(());
                    }
                },
                Some(event) = udp_rx.recv() => stack.handle_udp_event(event),
                Some(event) = tcp_rx.recv() => stack.handle_tcp_event(event),
            };
            if frames.is_empty() {
                continue;
            }
            for frame in frames {
                SinkExt::<Bytes>::feed(&mut framed, frame).await?;
            }
            SinkExt::<Bytes>::flush(&mut framed).await?;
        }
    }
}

/// Per-connection state of the gateway.
struct Stack {
    config: Arc<NetworkConfig>,
    dhcp: DhcpServer,
    dns: DnsServer,
    udp: UdpNat,
    tcp: TcpNat,
    neighbors: HashMap<Ipv4Addr, MacAddress>,
}

impl Stack {
    fn new(
        config: Arc<NetworkConfig>,
        udp_events: mpsc::Sender<UdpEvent>,
        tcp_events: mpsc::Sender<TcpEvent>,
    ) -> Self {
        Self {
            dhcp: DhcpServer::new(&config),
            dns: DnsServer::new(&config.dns, config.upstream_nameservers.first().copied()),
            udp: UdpNat::new(udp_events),
            tcp: TcpNat::new(tcp_events, config.mtu),
            neighbors: HashMap::new(),
            config,
        }
    }

    /// Whether the gateway itself answers for `ip`.
    fn owns(&self, ip: Ipv4Addr) -> bool {
        ip == self.config.gateway_ip || self.config.gateway_virtual_ips.contains(&ip)
    }

    /// The host address traffic for `ip` is proxied to, if any.
    fn host_ip(&self, ip: Ipv4Addr) -> Option<Ipv4Addr> {
        if let Some(host) = self.config.nat.get(&ip) {
            return Some(*host);
        }
        let local = self.config.subnet.contains(ip)
            || ip.is_broadcast()
            || ip.is_multicast()
            || ip.is_unspecified();
        (!local).then_some(ip)
    }

    fn guest_mac(&self, ip: Ipv4Addr) -> Option<MacAddress> {
        self.neighbors
            .get(&ip)
            .or_else(|| self.config.dhcp_static_leases.get(&ip))
            .copied()
    }

    /// Frames from the gateway to `mac`.
    fn link(&self, mac: MacAddress) -> Link {
        Link {
            src: self.config.gateway_mac,
            dst: mac,
        }
    }

    fn handle_frame(&mut self, frame: &[u8]) -> Vec<Bytes> {
        let Ok(eth) = EthernetFrame::new_checked(frame) else {
            return Vec::new();
        };
        let (src, dst) = (MacAddress::from(eth.src_addr()), MacAddress::from(eth.dst_addr()));
        if dst != self.config.gateway_mac && dst != MacAddress::BROADCAST {
            return Vec::new();
        }
        if self.config.debug {
            trace!(
                %src,
                %dst,
                ethertype = %eth.ethertype(),
                len = frame.len(),
                "guest frame"
            );
        }
        match eth.ethertype() {
            EthernetProtocol::Arp => self.handle_arp(eth.payload()).into_iter().collect(),
            EthernetProtocol::Ipv4 => self.handle_ipv4(src, eth.payload()),
            _ => Vec::new(),
        }
    }

    fn handle_arp(&mut self, payload: &[u8]) -> Option<Bytes> {
        let packet = ArpPacket::new_checked(payload).ok()?;
        let ArpRepr::EthernetIpv4 {
            operation,
            source_hardware_addr,
            source_protocol_addr,
            target_protocol_addr,
            ..
        } = ArpRepr::parse(&packet).ok()?
        else {
            return None;
        };
        let sender = MacAddress::from(source_hardware_addr);
        if !source_protocol_addr.is_unspecified() {
            self.neighbors.insert(source_protocol_addr, sender);
        }
        if operation != ArpOperation::Request || !self.owns(target_protocol_addr) {
            return None;
        }
        let reply = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Reply,
            source_hardware_addr: self.config.gateway_mac.into(),
            source_protocol_addr: target_protocol_addr,
            target_hardware_addr: source_hardware_addr,
            target_protocol_addr: source_protocol_addr,
        };
        Some(packet::arp(self.link(sender), &reply))
    }

    fn handle_ipv4(&mut self, src_mac: MacAddress, payload: &[u8]) -> Vec<Bytes> {
        let Ok(packet) = Ipv4Packet::new_checked(payload) else {
            return Vec::new();
        };
        if packet.more_frags() || packet.frag_offset() != 0 {
            debug!(src = %packet.src_addr(), dst = %packet.dst_addr(), "dropping fragment");
            return Vec::new();
        }
        let Ok(header) = Ipv4Repr::parse(&packet, &rx_checksums()) else {
            return Vec::new();
        };
        if !header.src_addr.is_unspecified() {
            self.neighbors.insert(header.src_addr, src_mac);
        }

        let body = packet.payload();
        match header.next_header {
            IpProtocol::Icmp if self.owns(header.dst_addr) => {
                self.handle_icmp(src_mac, &header, body).into_iter().collect()
            }
            IpProtocol::Udp => self.handle_udp(src_mac, &header, body).into_iter().collect(),
            IpProtocol::Tcp => self.handle_tcp(src_mac, &header, body),
            protocol => {
                trace!(%protocol, dst = %header.dst_addr, "unhandled ip protocol");
                Vec::new()
            }
        }
    }

    fn handle_icmp(&self, src_mac: MacAddress, header: &Ipv4Repr, body: &[u8]) -> Option<Bytes> {
        let echo = Icmpv4Packet::new_checked(body).ok()?;
        let Icmpv4Repr::EchoRequest {
            ident,
            seq_no,
            data,
        } = Icmpv4Repr::parse(&echo, &rx_checksums()).ok()?
        else {
            return None;
        };
        let reply = Icmpv4Repr::EchoReply {
            ident,
            seq_no,
            data,
        };
        Some(packet::icmp(
            self.link(src_mac),
            header.dst_addr,
            header.src_addr,
            &reply,
        ))
    }

    fn handle_udp(&mut self, src_mac: MacAddress, header: &Ipv4Repr, body: &[u8]) -> Option<Bytes> {
        let datagram = UdpPacket::new_checked(body).ok()?;
        let (src_port, dst_port) = (datagram.src_port(), datagram.dst_port());
        let payload = datagram.payload();

        if src_port == dhcp::CLIENT_PORT && dst_port == dhcp::SERVER_PORT {
            let reply = self.dhcp.handle(payload)?;
            return Some(packet::udp(
                self.link(reply.client_mac),
                SocketAddrV4::new(self.config.gateway_ip, dhcp::SERVER_PORT),
                SocketAddrV4::new(reply.dst, dhcp::CLIENT_PORT),
                &reply.payload,
            ));
        }

        let key = FlowKey {
            guest: SocketAddrV4::new(header.src_addr, src_port),
            remote: SocketAddrV4::new(header.dst_addr, dst_port),
        };
        if header.dst_addr == self.config.gateway_ip && dst_port == dns::PORT {
            return match self.dns.lookup(payload) {
                Lookup::Reply(answer) => Some(self.udp_to_guest(src_mac, key, &answer)),
                Lookup::Forward(upstream) => {
                    self.relay(key, upstream, DNS_IDLE, payload);
                    None
                }
                Lookup::Drop => None,
            };
        }

        let host = self.host_ip(header.dst_addr)?;
        self.relay(key, SocketAddrV4::new(host, dst_port), FLOW_IDLE, payload);
        None
    }

    fn relay(&mut self, key: FlowKey, host: SocketAddrV4, idle: Duration, payload: &[u8]) {
        if let Err(e) = self.udp.send(key, host, idle, payload) {
            warn!(%host, error = %e, "udp relay failed");
        }
    }

    fn udp_to_guest(&self, mac: MacAddress, key: FlowKey, payload: &[u8]) -> Bytes {
        packet::udp(self.link(mac), key.remote, key.guest, payload)
    }

    fn handle_udp_event(&mut self, event: UdpEvent) -> Vec<Bytes> {
        match event {
            UdpEvent::Datagram { key, payload } => self
                .guest_mac(*key.guest.ip())
                .map(|mac| self.udp_to_guest(mac, key, &payload))
                .into_iter()
                .collect(),
            UdpEvent::Closed { key, id } => {
                self.udp.close(&key, id);
                Vec::new()
            }
        }
    }

    fn handle_tcp(&mut self, src_mac: MacAddress, header: &Ipv4Repr, body: &[u8]) -> Vec<Bytes> {
        let Ok(raw) = TcpPacket::new_checked(body) else {
            return Vec::new();
        };
        let (src, dst) = (header.src_addr, header.dst_addr);
        let Ok(segment) = TcpRepr::parse(&raw, &ip(src), &ip(dst), &rx_checksums()) else {
            return Vec::new();
        };

        let key = ConnKey {
            guest: SocketAddrV4::new(src, segment.src_port),
            remote: SocketAddrV4::new(dst, segment.dst_port),
        };
        let host = match self.host_ip(dst) {
            Some(host) if segment.control == TcpControl::Syn || self.tcp.contains(&key) => host,
            _ => {
                return tcp_reset(&segment)
                    .map(|rst| packet::tcp(self.link(src_mac), dst, src, &rst))
                    .into_iter()
                    .collect();
            }
        };
        let out = self
            .tcp
            .segment(key, SocketAddrV4::new(host, segment.dst_port), &segment);
        self.tcp_frames(out)
    }

    fn handle_tcp_event(&mut self, event: TcpEvent) -> Vec<Bytes> {
        let out = self.tcp.event(event);
        self.tcp_frames(out)
    }

    fn tcp_frames(&self, out: Vec<Outgoing>) -> Vec<Bytes> {
        out.into_iter()
            .filter_map(|segment| {
                let (remote, guest) = (segment.key.remote, segment.key.guest);
                let mac = self.guest_mac(*guest.ip())?;
                let header = TcpHeader {
                    src_port: remote.port(),
                    dst_port: guest.port(),
                    control: segment.control,
                    seq: segment.seq,
                    ack: Some(segment.ack),
                    window: tcp::WINDOW,
                };
                let repr = header.repr(segment.mss, &segment.payload);
                Some(packet::tcp(self.link(mac), *remote.ip(), *guest.ip(), &repr))
            })
            .collect()
    }
}
