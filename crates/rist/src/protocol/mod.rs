// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Wire formats and packet types.
//!
//! Two dialects share one decoded vocabulary: the **main profile**
//! ([`gre`]) frames media behind a 12-byte tunnel header with control
//! TLVs, the **simple profile** ([`rtp`]) is RTP-compatible with SSRC
//! carrying the flow id. [`nack`] holds the shared RANGE/BITMAP loss
//! encodings, [`seq`] the sequence-space arithmetic.
//!
//! Decoders are allocation-light and fail closed: any truncation or bad
//! magic is [`DecodeError::MalformedHeader`], reserved TLV types are
//! [`DecodeError::UnknownPayloadType`]. Encoders never exceed the
//! configured datagram budget.

pub mod gre;
pub mod nack;
pub mod rtp;
pub mod seq;

pub use nack::NackMsg;

/// Flow identifier (SSRC in the simple profile).
pub type FlowId = u32;

/// Tunnel header magic, big-endian on the wire.
pub const WIRE_MAGIC: u16 = 0x5249;

/// Payload is sealed with the generation in `key_gen`.
pub const FLAG_ENCRYPTED: u8 = 0x80;
/// Datagram carries a control TLV instead of media.
pub const FLAG_CONTROL: u8 = 0x40;
/// Media payload is a retransmission.
pub const FLAG_RETRANSMIT: u8 = 0x20;
/// Null-packet-deletion map present ahead of the payload.
pub const FLAG_NPD: u8 = 0x10;

/// Fixed tunnel header: magic(2) flags(1) key_gen(1) flow_id(4) seq(4).
pub const TUNNEL_HEADER_LEN: usize = 12;

/// Data sub-header: virt_src(2) virt_dst(2) ts_ntp(8).
pub const DATA_SUBHEADER_LEN: usize = 12;

/// TLV header: type(1) len(2).
pub const TLV_HEADER_LEN: usize = 3;

/// Control TLV types (main profile).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TlvType {
    Handshake = 0x01,
    Keepalive = 0x02,
    NackRange = 0x03,
    NackBitmap = 0x04,
    Oob = 0x05,
    SrpStep = 0x06,
    KeyAnnounce = 0x07,
}

impl TlvType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(TlvType::Handshake),
            0x02 => Some(TlvType::Keepalive),
            0x03 => Some(TlvType::NackRange),
            0x04 => Some(TlvType::NackBitmap),
            0x05 => Some(TlvType::Oob),
            0x06 => Some(TlvType::SrpStep),
            0x07 => Some(TlvType::KeyAnnounce),
            _ => None,
        }
    }
}

/// A decoded media packet. Immutable after decode.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPacket {
    /// 32-bit extended sequence.
    pub seq: u32,
    pub flow_id: FlowId,
    pub virt_src_port: u16,
    pub virt_dst_port: u16,
    /// 64-bit NTP-format timestamp.
    pub ts_ntp: u64,
    /// Set when the sender tagged this as a retransmission.
    pub retransmit: bool,
    /// Payload still sealed; `key_gen` selects the generation.
    pub encrypted: bool,
    pub key_gen: u8,
    /// Null-packet reinsertion map, bit i = elided cell at position i.
    pub npd_map: u8,
    pub payload: Vec<u8>,
}

/// Keepalive exchange used for liveness and RTT sampling.
///
/// A ping carries the sender's monotonic timestamp; the pong echoes it
/// back untouched so the pinger can take `now - ts` as the RTT sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keepalive {
    Ping { ts: u64 },
    Pong { ts: u64 },
}

/// Connection handshake (main profile).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// False for the opening request, true for the acknowledgement.
    pub ack: bool,
    /// Initiator-chosen KDF salt, adopted by both sides.
    pub psk_salt: [u8; 16],
    /// Low nonce half mixed into the AES counter block.
    pub nonce: u32,
}

/// Decoded control payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Handshake(Handshake),
    Keepalive(Keepalive),
    Nack(NackMsg),
    Oob(Vec<u8>),
    SrpStep { step: u8, data: Vec<u8> },
    KeyAnnounce { generation: u8, salt: [u8; 16] },
}

/// Any decoded datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Data(DataPacket),
    Control { flow_id: FlowId, control: Control },
}

/// Encoder rejection: the framed datagram would exceed the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OversizeError {
    pub len: usize,
    pub max: usize,
}

impl std::fmt::Display for OversizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "payload of {} bytes exceeds budget of {}", self.len, self.max)
    }
}

impl std::error::Error for OversizeError {}

/// Codec failure taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Truncated datagram or bad magic.
    MalformedHeader,
    /// Reserved or unknown TLV type value.
    UnknownPayloadType(u8),
    /// Decryption or integrity check failed.
    AuthFailed,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::MalformedHeader => write!(f, "malformed header"),
            DecodeError::UnknownPayloadType(t) => write!(f, "unknown payload type 0x{:02x}", t),
            DecodeError::AuthFailed => write!(f, "authentication failed"),
        }
    }
}

impl std::error::Error for DecodeError {}
