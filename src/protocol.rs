//! Wire protocol: the fixed 64-byte request record exchanged between nodes.
//!
//! Every UDP datagram is exactly one [`Request`]. The layout is
//! little-endian and position-for-position part of the interop contract;
//! two nodes can talk to each other only if they agree on it byte by byte:
//!
//! | offset | width | field |
//! |--------|-------|-------|
//! | 0      | 1     | message kind |
//! | 1      | 1     | flags (reserved) |
//! | 2      | 2     | request id |
//! | 4      | 20    | destination operand |
//! | 24     | 20    | source operand |
//! | 44     | 6     | link-level sender endpoint |
//! | 50     | 6     | link-level recipient endpoint |
//! | 56     | 2     | ttl (max hops, 0 = unlimited) |
//! | 58     | 2     | hop count |
//! | 60     | 4     | reserved padding |
//!
//! The two 20-byte operand slots carry either a `u32` key or a [`NodeRef`]
//! depending on the message kind; sender and receiver agree on the
//! interpretation through the kind alone (see [`Payload`]). Endpoints are
//! packed as four address octets plus a network-order port, both inside
//! the operand slots and in the `sender`/`recipient` fields.

use std::net::{Ipv4Addr, SocketAddrV4};

use anyhow::{bail, Result};

use crate::core::{Endpoint, Key, NodeRef};

/// Size of one encoded [`Request`] on the wire.
pub const WIRE_SIZE: usize = 64;

/// Size of one operand slot.
const SLOT_SIZE: usize = 20;

/// Size of an encoded endpoint (4 address octets + 2 port bytes).
const ENDPOINT_SIZE: usize = 6;

/// Size of an encoded [`NodeRef`] (4 id bytes + endpoint).
pub const NODE_REF_SIZE: usize = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Message kinds
// ─────────────────────────────────────────────────────────────────────────────

/// Discriminant of a [`Request`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Diagnostic liveness probe; logged and otherwise ignored.
    Ping = 0,
    /// Completes the pending request carrying the same id.
    Reply = 1,
    /// Find the node responsible for the key in the destination operand.
    Lookup = 2,
    /// The sender claims us as its successor.
    Notify = 3,
    /// The sender is leaving the ring.
    Leave = 4,
    /// Liveness check; any reply proves the peer is alive.
    Check = 5,
}

impl MessageKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ping),
            1 => Some(Self::Reply),
            2 => Some(Self::Lookup),
            3 => Some(Self::Notify),
            4 => Some(Self::Leave),
            5 => Some(Self::Check),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Operand payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Typed view of a 20-byte operand slot.
///
/// Which variant a slot carries is fixed by the message kind:
///
/// | kind | `src` | `dst` |
/// |------|-------|-------|
/// | `Lookup` | originator node | key |
/// | `Reply` to lookup | responder node | responsible node |
/// | `Notify` | notifier node | unused |
/// | `Reply` to notify | responder node | responder's predecessor |
/// | `Leave` | leaver node | unused |
/// | `Check` / its `Reply` | asker / responder node | unused |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Payload {
    /// A ring key.
    Key(Key),
    /// A node reference.
    Node(NodeRef),
    /// Slot unused by this message kind.
    None,
}

fn encode_endpoint(buf: &mut [u8], addr: &Endpoint) {
    buf[..4].copy_from_slice(&addr.ip().octets());
    buf[4..ENDPOINT_SIZE].copy_from_slice(&addr.port().to_be_bytes());
}

fn decode_endpoint(buf: &[u8]) -> Endpoint {
    let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
    let port = u16::from_be_bytes([buf[4], buf[5]]);
    SocketAddrV4::new(ip, port)
}

/// Pack a [`NodeRef`] into its 10-byte wire form, shared by the operand
/// slots and the TCP client protocol.
pub fn encode_node_ref(node: &NodeRef) -> [u8; NODE_REF_SIZE] {
    let mut buf = [0u8; NODE_REF_SIZE];
    buf[..4].copy_from_slice(&node.id.to_le_bytes());
    encode_endpoint(&mut buf[4..], &node.addr);
    buf
}

/// Unpack a [`NodeRef`] from its 10-byte wire form.
pub fn decode_node_ref(buf: &[u8]) -> NodeRef {
    NodeRef {
        id: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
        addr: decode_endpoint(&buf[4..]),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request record
// ─────────────────────────────────────────────────────────────────────────────

/// One protocol datagram.
///
/// `sender` and `recipient` are the link-level endpoints and change on
/// every hop; the `src` operand names the originator for the whole route.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    /// Message kind.
    pub kind: MessageKind,
    /// Reserved.
    pub flags: u8,
    /// Per-sender request identifier, matching replies to continuations.
    pub id: u16,
    /// Destination operand (key or node, by kind).
    dst: [u8; SLOT_SIZE],
    /// Source operand (originator node, by kind).
    src: [u8; SLOT_SIZE],
    /// Endpoint this record was last sent from.
    pub sender: Endpoint,
    /// Endpoint this record is addressed to.
    pub recipient: Endpoint,
    /// Maximum hop count; 0 means unlimited.
    pub ttl: u16,
    /// Hops this record has been forwarded through.
    pub hop_count: u16,
}

impl Request {
    /// A blank record of the given kind: zeroed operands, wildcard
    /// endpoints, unlimited TTL.
    pub fn new(kind: MessageKind) -> Self {
        let nil = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        Self {
            kind,
            flags: 0,
            id: 0,
            dst: [0; SLOT_SIZE],
            src: [0; SLOT_SIZE],
            sender: nil,
            recipient: nil,
            ttl: 0,
            hop_count: 0,
        }
    }

    /// Write the destination operand.
    pub fn set_dst(&mut self, payload: Payload) {
        write_slot(&mut self.dst, payload);
    }

    /// Write the source operand.
    pub fn set_src(&mut self, payload: Payload) {
        write_slot(&mut self.src, payload);
    }

    /// The destination operand as a key (`Lookup`).
    pub fn dst_key(&self) -> Key {
        u32::from_le_bytes([self.dst[0], self.dst[1], self.dst[2], self.dst[3]])
    }

    /// The destination operand as a node (`Reply` to lookup or notify).
    pub fn dst_node(&self) -> NodeRef {
        decode_node_ref(&self.dst)
    }

    /// The source operand as a node (the originator).
    pub fn src_node(&self) -> NodeRef {
        decode_node_ref(&self.src)
    }

    /// Record one forwarding hop.
    pub fn hop(&mut self) -> &mut Self {
        self.hop_count = self.hop_count.saturating_add(1);
        self
    }

    /// Zero the hop count; a forwarded request converted into a reply
    /// starts its route fresh.
    pub fn reset(&mut self) -> &mut Self {
        self.hop_count = 0;
        self
    }

    /// A record is expired once it has used up its hop budget.
    pub fn is_expired(&self) -> bool {
        self.ttl > 0 && self.hop_count >= self.ttl
    }

    /// Serialize into the fixed 64-byte wire layout.
    pub fn encode(&self) -> [u8; WIRE_SIZE] {
        let mut buf = [0u8; WIRE_SIZE];
        buf[0] = self.kind as u8;
        buf[1] = self.flags;
        buf[2..4].copy_from_slice(&self.id.to_le_bytes());
        buf[4..24].copy_from_slice(&self.dst);
        buf[24..44].copy_from_slice(&self.src);
        encode_endpoint(&mut buf[44..50], &self.sender);
        encode_endpoint(&mut buf[50..56], &self.recipient);
        buf[56..58].copy_from_slice(&self.ttl.to_le_bytes());
        buf[58..60].copy_from_slice(&self.hop_count.to_le_bytes());
        buf
    }

    /// Deserialize one wire record. Anything other than exactly 64 bytes
    /// with a known kind byte is an error; the receive path drops such
    /// datagrams silently.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != WIRE_SIZE {
            bail!("datagram of {} bytes is not a request record", buf.len());
        }
        let Some(kind) = MessageKind::from_u8(buf[0]) else {
            bail!("unknown message kind {:#04x}", buf[0]);
        };

        let mut dst = [0u8; SLOT_SIZE];
        dst.copy_from_slice(&buf[4..24]);
        let mut src = [0u8; SLOT_SIZE];
        src.copy_from_slice(&buf[24..44]);

        Ok(Self {
            kind,
            flags: buf[1],
            id: u16::from_le_bytes([buf[2], buf[3]]),
            dst,
            src,
            sender: decode_endpoint(&buf[44..50]),
            recipient: decode_endpoint(&buf[50..56]),
            ttl: u16::from_le_bytes([buf[56], buf[57]]),
            hop_count: u16::from_le_bytes([buf[58], buf[59]]),
        })
    }
}

fn write_slot(slot: &mut [u8; SLOT_SIZE], payload: Payload) {
    *slot = [0; SLOT_SIZE];
    match payload {
        Payload::Key(key) => slot[..4].copy_from_slice(&key.to_le_bytes()),
        Payload::Node(node) => slot[..NODE_REF_SIZE].copy_from_slice(&encode_node_ref(&node)),
        Payload::None => {}
    }
}
