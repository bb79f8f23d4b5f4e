//! DNS for the gateway: local zones, everything else upstream.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};
use smoltcp::wire::{DnsFlags, DnsOpcode, DnsPacket, DnsQueryType, DnsRcode};

use crate::config::Zone;

pub const PORT: u16 = 53;

const HEADER_LEN: usize = 12;
const CLASS_IN: u16 = 1;
const TTL_SECS: u32 = 0;
/// Offset of the question name, as a compression pointer.
const QUESTION_NAME_PTR: u16 = 0xc000 | HEADER_LEN as u16;

/// What to do with a guest query.
#[derive(Debug, PartialEq, Eq)]
pub enum Lookup {
    /// Answer with this message.
    Reply(Bytes),
    /// Relay the query unchanged to this upstream server.
    Forward(SocketAddrV4),
    /// Not a query; say nothing.
    Drop,
}

struct Question<'a> {
    opcode: DnsOpcode,
    /// Lowercased, without the trailing dot.
    name: String,
    qtype: DnsQueryType,
    qclass: u16,
    /// Header and question section, echoed in replies.
    head: &'a [u8],
}

impl<'a> Question<'a> {
    fn parse(message: &'a [u8]) -> Option<Self> {
        let packet = DnsPacket::new_checked(message).ok()?;
        if packet.flags().contains(DnsFlags::RESPONSE) || packet.question_count() != 1 {
            return None;
        }

        let mut labels = Vec::new();
        let mut offset = HEADER_LEN;
        loop {
            let len = usize::from(*message.get(offset)?);
            offset += 1;
            if len == 0 {
                break;
            }
            // Compression pointers never appear in a lone question.
            if len > 63 {
                return None;
            }
            let label = message.get(offset..offset + len)?;
            labels.push(String::from_utf8_lossy(label).to_ascii_lowercase());
            offset += len;
        }
        let fixed: [u8; 4] = message.get(offset..offset + 4)?.try_into().ok()?;
        let [t0, t1, c0, c1] = fixed;

        Some(Self {
            opcode: packet.opcode(),
            name: labels.join("."),
            qtype: DnsQueryType::from(u16::from_be_bytes([t0, t1])),
            qclass: u16::from_be_bytes([c0, c1]),
            head: message.get(..offset + 4)?,
        })
    }

    fn reply(&self, rcode: DnsRcode, authoritative: bool, answers: &[Ipv4Addr]) -> Option<Bytes> {
        let mut buf = BytesMut::with_capacity(self.head.len() + answers.len() * 16);
        buf.put_slice(self.head);
        for ip in answers {
            buf.put_u16(QUESTION_NAME_PTR);
            buf.put_u16(u16::from(DnsQueryType::A));
            buf.put_u16(CLASS_IN);
            buf.put_u32(TTL_SECS);
            buf.put_u16(4);
            buf.put_slice(&ip.octets());
        }
        let count = u16::try_from(answers.len()).ok()?;
        respond(&mut buf, rcode, authoritative, 1, count)?;
        Some(buf.freeze())
    }
}

/// Rewrite the query header at the front of `buf` into a response header.
fn respond(
    buf: &mut [u8],
    rcode: DnsRcode,
    authoritative: bool,
    questions: u16,
    answers: u16,
) -> Option<()> {
    let mut packet = DnsPacket::new_checked(&mut *buf).ok()?;
    let query = packet.flags();
    let opcode = packet.opcode();

    let mut flags = DnsFlags::RESPONSE
        | DnsFlags::RECURSION_AVAILABLE
        | (query & DnsFlags::RECURSION_DESIRED);
    if authoritative {
        flags |= DnsFlags::AUTHORITATIVE;
    }
    packet.set_flags(flags);
    packet.set_opcode(opcode);
    packet.set_question_count(questions);
    packet.set_answer_record_count(answers);
    packet.set_authority_record_count(0);
    packet.set_additional_record_count(0);

    // The rcode is the low nibble of the second flags byte.
    let low = buf.get_mut(3)?;
    *low = (*low & 0xf0) | (u8::from(rcode) & 0x0f);
    Some(())
}

/// A header-only reply carrying `rcode`, for queries too broken to parse.
fn error_reply(message: &[u8], rcode: DnsRcode) -> Option<Bytes> {
    let mut buf = BytesMut::zeroed(HEADER_LEN);
    buf.get_mut(..4)?.copy_from_slice(message.get(..4)?);
    if DnsPacket::new_checked(&buf[..])
        .ok()?
        .flags()
        .contains(DnsFlags::RESPONSE)
    {
        return None;
    }
    respond(&mut buf, rcode, false, 0, 0)?;
    Some(buf.freeze())
}

/// Resolves names in the configured zones and refers the rest upstream.
#[derive(Debug)]
pub struct DnsServer {
    zones: Vec<Zone>,
    upstream: Option<SocketAddrV4>,
}

impl DnsServer {
    pub fn new(zones: &[Zone], upstream: Option<SocketAddrV4>) -> Self {
        Self {
            zones: zones.to_vec(),
            upstream,
        }
    }

    pub fn lookup(&self, message: &[u8]) -> Lookup {
        let reply = match Question::parse(message) {
            Some(question) => return self.answer(&question),
            None => error_reply(message, DnsRcode::FormErr),
        };
        reply.map_or(Lookup::Drop, Lookup::Reply)
    }

    fn answer(&self, question: &Question<'_>) -> Lookup {
        let reply = |rcode, authoritative, answers: &[Ipv4Addr]| {
            question
                .reply(rcode, authoritative, answers)
                .map_or(Lookup::Drop, Lookup::Reply)
        };
        if question.opcode != DnsOpcode::Query {
            return reply(DnsRcode::Refused, false, &[]);
        }

        for zone in &self.zones {
            let zone_name = zone.name.trim_end_matches('.').to_ascii_lowercase();
            let in_zone = question.name == zone_name
                || question.name.ends_with(&format!(".{zone_name}"));
            if !in_zone {
                continue;
            }

            let found: Vec<Ipv4Addr> = zone
                .records
                .iter()
                .filter(|r| {
                    let fqdn = format!("{}.{zone_name}", r.name.trim_end_matches('.'));
                    fqdn.eq_ignore_ascii_case(&question.name)
                })
                .map(|r| r.ip)
                .collect();
            if found.is_empty() {
                return reply(DnsRcode::NXDomain, true, &[]);
            }
            if question.qtype == DnsQueryType::A && question.qclass == CLASS_IN {
                return reply(DnsRcode::NoError, true, &found);
            }
            return reply(DnsRcode::NoError, true, &[]);
        }

        match self.upstream {
            Some(upstream) => Lookup::Forward(upstream),
            None => reply(DnsRcode::Refused, false, &[]),
        }
    }
}
