//! Control messages and their wire codec.
//!
//! The layout is bit-exact with the reference packets: every message
//! starts with a 32-bit word whose top byte is the message type, flags
//! and counts packed below it, all fields big-endian. A packet carries
//! addresses of exactly one family.

use byteorder::{BigEndian, ByteOrder};
use slog::{Record, Result as SlogResult, Serializer, KV};

use crate::address::{Address, AddressFamily};
use crate::{AodvError, AodvErrorKind};

pub const MSG_TYPE_RREQ: u8 = 1;
pub const MSG_TYPE_RREP: u8 = 2;
pub const MSG_TYPE_RERR: u8 = 3;
pub const MSG_TYPE_RREP_ACK: u8 = 4;

const HOP_COUNT_BITS: u32 = 0x0000_00FF;
const DEST_COUNT_BITS: u32 = 0x0000_00FF;
const PREFIX_SIZE_BITS: u32 = 0x0000_1F00;

bitflags! {
    #[derive(Default, Serialize, Deserialize)]
    pub struct RreqFlags: u32 {
        const JOIN = 0x0080_0000;
        const REPAIR = 0x0040_0000;
        const GRATUITOUS_RREP = 0x0020_0000;
        const DESTINATION_ONLY = 0x0010_0000;
    }
}

bitflags! {
    #[derive(Default, Serialize, Deserialize)]
    pub struct RrepFlags: u32 {
        const REPAIR = 0x0080_0000;
        const ACK_REQUIRED = 0x0040_0000;
    }
}

bitflags! {
    #[derive(Default, Serialize, Deserialize)]
    pub struct RerrFlags: u32 {
        const NO_DELETE = 0x0080_0000;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    pub flags: RreqFlags,
    pub hop_count: u8,
    pub flooding_id: u32,
    pub destination: Address,
    pub dest_seq: u32,
    pub originator: Address,
    pub orig_seq: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteReply {
    pub flags: RrepFlags,
    pub prefix_size: u8,
    pub hop_count: u8,
    pub destination: Address,
    pub dest_seq: u32,
    /// Where the reply travels to; the zero address marks a hello.
    pub originator: Address,
    pub lifetime_ms: u32,
}

impl RouteReply {
    pub fn is_hello(&self) -> bool {
        self.originator.is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteError {
    pub flags: RerrFlags,
    /// Unreachable destinations with the sequence numbers to advertise
    pub destinations: Vec<(Address, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AodvMessage {
    Rreq(RouteRequest),
    Rrep(RouteReply),
    Rerr(RouteError),
    RrepAck,
}

impl AodvMessage {
    pub fn msg_type(&self) -> u8 {
        match self {
            AodvMessage::Rreq(_) => MSG_TYPE_RREQ,
            AodvMessage::Rrep(_) => MSG_TYPE_RREP,
            AodvMessage::Rerr(_) => MSG_TYPE_RERR,
            AodvMessage::RrepAck => MSG_TYPE_RREP_ACK,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            AodvMessage::Rreq(rreq) => {
                let word = u32::from(MSG_TYPE_RREQ) << 24
                    | rreq.flags.bits()
                    | u32::from(rreq.hop_count);
                let mut out = Vec::with_capacity(24);
                put_u32(&mut out, word);
                put_u32(&mut out, rreq.flooding_id);
                out.extend_from_slice(&rreq.destination.wire_bytes());
                put_u32(&mut out, rreq.dest_seq);
                out.extend_from_slice(&rreq.originator.wire_bytes());
                put_u32(&mut out, rreq.orig_seq);
                out
            }
            AodvMessage::Rrep(rrep) => {
                let word = u32::from(MSG_TYPE_RREP) << 24
                    | rrep.flags.bits()
                    | (u32::from(rrep.prefix_size) << 8) & PREFIX_SIZE_BITS
                    | u32::from(rrep.hop_count);
                let mut out = Vec::with_capacity(20);
                put_u32(&mut out, word);
                out.extend_from_slice(&rrep.destination.wire_bytes());
                put_u32(&mut out, rrep.dest_seq);
                out.extend_from_slice(&rrep.originator.wire_bytes());
                put_u32(&mut out, rrep.lifetime_ms);
                out
            }
            AodvMessage::Rerr(rerr) => {
                let word = u32::from(MSG_TYPE_RERR) << 24
                    | rerr.flags.bits()
                    | (rerr.destinations.len() as u32 & DEST_COUNT_BITS);
                let mut out = Vec::with_capacity(4 + rerr.destinations.len() * 8);
                put_u32(&mut out, word);
                for (addr, seq) in &rerr.destinations {
                    out.extend_from_slice(&addr.wire_bytes());
                    put_u32(&mut out, *seq);
                }
                out
            }
            // The type word only; classification always reads the top byte
            // of the first word, so the ack carries nothing else.
            AodvMessage::RrepAck => {
                let mut out = Vec::with_capacity(4);
                put_u32(&mut out, u32::from(MSG_TYPE_RREP_ACK) << 24);
                out
            }
        }
    }

    pub fn from_bytes(data: &[u8], family: AddressFamily) -> Result<AodvMessage, AodvError> {
        if data.len() < 4 {
            return Err(AodvErrorKind::Serialization("control packet too short".into()).into());
        }
        let word = BigEndian::read_u32(&data[0..4]);
        let alen = Address::wire_len(family);
        match (word >> 24) as u8 {
            MSG_TYPE_RREQ => {
                let want = 4 + 4 + alen + 4 + alen + 4;
                if data.len() < want {
                    return Err(AodvErrorKind::Serialization("truncated RREQ".into()).into());
                }
                let mut at = 4;
                let flooding_id = BigEndian::read_u32(&data[at..at + 4]);
                at += 4;
                let destination = Address::from_wire(&data[at..], family)?;
                at += alen;
                let dest_seq = BigEndian::read_u32(&data[at..at + 4]);
                at += 4;
                let originator = Address::from_wire(&data[at..], family)?;
                at += alen;
                let orig_seq = BigEndian::read_u32(&data[at..at + 4]);
                Ok(AodvMessage::Rreq(RouteRequest {
                    flags: RreqFlags::from_bits_truncate(word),
                    hop_count: (word & HOP_COUNT_BITS) as u8,
                    flooding_id,
                    destination,
                    dest_seq,
                    originator,
                    orig_seq,
                }))
            }
            MSG_TYPE_RREP => {
                let want = 4 + alen + 4 + alen + 4;
                if data.len() < want {
                    return Err(AodvErrorKind::Serialization("truncated RREP".into()).into());
                }
                let mut at = 4;
                let destination = Address::from_wire(&data[at..], family)?;
                at += alen;
                let dest_seq = BigEndian::read_u32(&data[at..at + 4]);
                at += 4;
                let originator = Address::from_wire(&data[at..], family)?;
                at += alen;
                let lifetime_ms = BigEndian::read_u32(&data[at..at + 4]);
                Ok(AodvMessage::Rrep(RouteReply {
                    flags: RrepFlags::from_bits_truncate(word),
                    prefix_size: ((word & PREFIX_SIZE_BITS) >> 8) as u8,
                    hop_count: (word & HOP_COUNT_BITS) as u8,
                    destination,
                    dest_seq,
                    originator,
                    lifetime_ms,
                }))
            }
            MSG_TYPE_RERR => {
                let count = (word & DEST_COUNT_BITS) as usize;
                let want = 4 + count * (alen + 4);
                if data.len() < want {
                    return Err(AodvErrorKind::Serialization("truncated RERR".into()).into());
                }
                let mut destinations = Vec::with_capacity(count);
                let mut at = 4;
                for _ in 0..count {
                    let addr = Address::from_wire(&data[at..], family)?;
                    at += alen;
                    let seq = BigEndian::read_u32(&data[at..at + 4]);
                    at += 4;
                    destinations.push((addr, seq));
                }
                Ok(AodvMessage::Rerr(RouteError {
                    flags: RerrFlags::from_bits_truncate(word),
                    destinations,
                }))
            }
            MSG_TYPE_RREP_ACK => Ok(AodvMessage::RrepAck),
            other => Err(AodvErrorKind::Serialization(format!(
                "unknown control packet type {}",
                other
            ))
            .into()),
        }
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, value);
    out.extend_from_slice(&buf);
}

impl KV for AodvMessage {
    fn serialize(&self, _rec: &Record, serializer: &mut dyn Serializer) -> SlogResult {
        match self {
            AodvMessage::Rreq(m) => {
                serializer.emit_str("msg_type", "RREQ")?;
                serializer.emit_str("msg_destination", &m.destination.to_string())?;
                serializer.emit_str("msg_originator", &m.originator.to_string())?;
                serializer.emit_u32("flooding_id", m.flooding_id)?;
                serializer.emit_u8("hop_count", m.hop_count)
            }
            AodvMessage::Rrep(m) => {
                serializer.emit_str("msg_type", "RREP")?;
                serializer.emit_str("msg_destination", &m.destination.to_string())?;
                serializer.emit_str("msg_originator", &m.originator.to_string())?;
                serializer.emit_u8("hop_count", m.hop_count)?;
                serializer.emit_u32("lifetime_ms", m.lifetime_ms)
            }
            AodvMessage::Rerr(m) => {
                serializer.emit_str("msg_type", "RERR")?;
                serializer.emit_usize("dest_count", m.destinations.len())
            }
            AodvMessage::RrepAck => serializer.emit_str("msg_type", "RREP_ACK"),
        }
    }
}
