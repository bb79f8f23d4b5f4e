//! Frame builders on top of `smoltcp::wire`.
//!
//! Every builder returns a complete Ethernet frame with checksums filled in.
//! Parsing is left to the `smoltcp::wire` packet views at each call site.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Bytes, BytesMut};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpPacket, ArpRepr, EthernetFrame, EthernetProtocol, EthernetRepr, Icmpv4Packet, Icmpv4Repr,
    IpAddress, IpProtocol, Ipv4Packet, Ipv4Repr, TcpControl, TcpPacket, TcpRepr, TcpSeqNumber,
    UdpPacket, UdpRepr,
};

use crate::mac::MacAddress;

const DEFAULT_TTL: u8 = 64;

/// Checksums checked on guest frames. The guest link is a local socket, so
/// nothing is verified.
pub fn rx_checksums() -> ChecksumCapabilities {
    ChecksumCapabilities::ignored()
}

fn tx_checksums() -> ChecksumCapabilities {
    ChecksumCapabilities::default()
}

/// Ethernet addressing of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub src: MacAddress,
    pub dst: MacAddress,
}

pub fn ip(addr: Ipv4Addr) -> IpAddress {
    IpAddress::Ipv4(addr)
}

pub fn seq_number(raw: u32) -> TcpSeqNumber {
    TcpSeqNumber(raw as i32)
}

pub fn seq_raw(seq: TcpSeqNumber) -> u32 {
    seq.0 as u32
}

fn ethernet(
    link: Link,
    ethertype: EthernetProtocol,
    payload_len: usize,
    emit: impl FnOnce(&mut [u8]),
) -> Bytes {
    let repr = EthernetRepr {
        src_addr: link.src.into(),
        dst_addr: link.dst.into(),
        ethertype,
    };
    let mut buf = BytesMut::zeroed(repr.buffer_len() + payload_len);
    let mut frame = EthernetFrame::new_unchecked(&mut *buf);
    repr.emit(&mut frame);
    emit(frame.payload_mut());
    buf.freeze()
}

fn ipv4(link: Link, repr: Ipv4Repr, emit: impl FnOnce(&mut [u8])) -> Bytes {
    ethernet(
        link,
        EthernetProtocol::Ipv4,
        repr.buffer_len() + repr.payload_len,
        |buf| {
            let mut packet = Ipv4Packet::new_unchecked(buf);
            repr.emit(&mut packet, &tx_checksums());
            emit(packet.payload_mut());
        },
    )
}

fn ipv4_repr(src: Ipv4Addr, dst: Ipv4Addr, next_header: IpProtocol, payload_len: usize) -> Ipv4Repr {
    Ipv4Repr {
        src_addr: src,
        dst_addr: dst,
        next_header,
        payload_len,
        hop_limit: DEFAULT_TTL,
    }
}

pub fn arp(link: Link, repr: &ArpRepr) -> Bytes {
    ethernet(link, EthernetProtocol::Arp, repr.buffer_len(), |buf| {
        repr.emit(&mut ArpPacket::new_unchecked(buf));
    })
}

pub fn icmp(link: Link, src: Ipv4Addr, dst: Ipv4Addr, repr: &Icmpv4Repr<'_>) -> Bytes {
    let header = ipv4_repr(src, dst, IpProtocol::Icmp, repr.buffer_len());
    ipv4(link, header, |buf| {
        repr.emit(&mut Icmpv4Packet::new_unchecked(buf), &tx_checksums());
    })
}

pub fn udp(link: Link, src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Bytes {
    let repr = UdpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
    };
    let header = ipv4_repr(
        *src.ip(),
        *dst.ip(),
        IpProtocol::Udp,
        repr.header_len() + payload.len(),
    );
    ipv4(link, header, |buf| {
        repr.emit(
            &mut UdpPacket::new_unchecked(buf),
            &ip(*src.ip()),
            &ip(*dst.ip()),
            payload.len(),
            |out| out.copy_from_slice(payload),
            &tx_checksums(),
        );
    })
}

pub fn tcp(link: Link, src: Ipv4Addr, dst: Ipv4Addr, repr: &TcpRepr<'_>) -> Bytes {
    let header = ipv4_repr(src, dst, IpProtocol::Tcp, repr.buffer_len());
    ipv4(link, header, |buf| {
        repr.emit(
            &mut TcpPacket::new_unchecked(buf),
            &ip(src),
            &ip(dst),
            &tx_checksums(),
        );
    })
}

/// Header fields of an outgoing TCP segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub control: TcpControl,
    pub seq: u32,
    pub ack: Option<u32>,
    pub window: u16,
}

impl TcpHeader {
    pub fn repr<'a>(&self, mss: Option<u16>, payload: &'a [u8]) -> TcpRepr<'a> {
        TcpRepr {
            src_port: self.src_port,
            dst_port: self.dst_port,
            control: self.control,
            seq_number: seq_number(self.seq),
            ack_number: self.ack.map(seq_number),
            window_len: self.window,
            window_scale: None,
            max_seg_size: mss,
            sack_permitted: false,
            sack_ranges: [None; 3],
            timestamp: None,
            payload,
        }
    }
}

/// The reset refusing `segment`, or `None` when `segment` is itself a reset.
pub fn tcp_reset(segment: &TcpRepr<'_>) -> Option<TcpRepr<'static>> {
    if segment.control == TcpControl::Rst {
        return None;
    }
    let (seq, ack) = match segment.ack_number {
        Some(ack) => (seq_raw(ack), None),
        None => {
            let len = segment.segment_len() as u32;
            (0, Some(seq_raw(segment.seq_number).wrapping_add(len)))
        }
    };
    let header = TcpHeader {
        src_port: segment.dst_port,
        dst_port: segment.src_port,
        control: TcpControl::Rst,
        seq,
        ack,
        window: 0,
    };
    Some(header.repr(None, &[]))
}
