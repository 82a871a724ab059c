// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Simple-profile codec: RTP-compatible framing.
//!
//! Media rides a standard 12-byte RTP header (V=2, PT 33 for MPEG-TS)
//! with the SSRC field carrying the flow id. Retransmissions are tagged
//! by the marker bit and insert an 8-byte extension block between
//! header and payload:
//!
//! ```text
//! seq_hi(2) | nack_type(1) | key_gen(1) | reserved(4)
//! ```
//!
//! `seq_hi` restores the upper half of the 32-bit flow sequence so a
//! retransmission is unambiguous even after a 16-bit wrap; first-pass
//! packets carry no extension and the receiver extends sequences by
//! wrap monitoring ([`super::seq::SeqExtender`]).
//!
//! Loss feedback is an RTCP transport-feedback packet (PT 205, FMT 1)
//! with the classic PID/BLP entry list, which is exactly the BITMAP
//! NACK form; RANGE requests are expressed as consecutive entries.
//! RTP and RTCP share the socket and are demuxed on the payload-type
//! octet (RTCP types live in 200..=207).

use super::DecodeError;

/// RTP payload type for MPEG transport streams.
pub const RTP_PT_MPEGTS: u8 = 33;

/// RTCP packet type for transport-layer feedback.
pub const RTCP_PT_RTPFB: u8 = 205;

/// Fixed RTP header length (no CSRC).
pub const RTP_HEADER_LEN: usize = 12;

/// Retransmit extension block length.
pub const RTP_EXT_LEN: usize = 8;

/// A decoded simple-profile media packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleData {
    pub seq16: u16,
    /// Upper sequence half, present on retransmissions only.
    pub seq_hi: Option<u16>,
    /// SSRC, carrying the flow id.
    pub ssrc: u32,
    /// 90 kHz RTP timestamp.
    pub ts_rtp: u32,
    pub retransmit: bool,
    pub key_gen: u8,
    pub payload: Vec<u8>,
}

/// Any simple-profile datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimpleMessage {
    Data(SimpleData),
    /// RTCP NACK: media SSRC plus PID/BLP entries.
    Nack { ssrc: u32, entries: Vec<(u16, u16)> },
}

/// Convert a 90 kHz RTP timestamp to 64-bit NTP format.
#[inline]
pub fn rtp_ts_to_ntp(ts_rtp: u32) -> u64 {
    (u64::from(ts_rtp) << 32) / 90_000
}

/// Convert an NTP-format timestamp back to the 90 kHz RTP clock.
#[inline]
pub fn ntp_to_rtp_ts(ts_ntp: u64) -> u32 {
    ((ts_ntp.wrapping_mul(90_000)) >> 32) as u32
}

/// Encode a media packet. Retransmissions grow the extension block.
pub fn encode_data(data: &SimpleData) -> Vec<u8> {
    let ext_len = if data.retransmit { RTP_EXT_LEN } else { 0 };
    let mut buf = Vec::with_capacity(RTP_HEADER_LEN + ext_len + data.payload.len());

    buf.push(0x80); // V=2, no padding, no extension flag, no CSRC
    let marker = if data.retransmit { 0x80 } else { 0 };
    buf.push(marker | RTP_PT_MPEGTS);
    buf.extend_from_slice(&data.seq16.to_be_bytes());
    buf.extend_from_slice(&data.ts_rtp.to_be_bytes());
    buf.extend_from_slice(&data.ssrc.to_be_bytes());

    if data.retransmit {
        buf.extend_from_slice(&data.seq_hi.unwrap_or(0).to_be_bytes());
        buf.push(0); // nack_type: originating request form, informational
        buf.push(data.key_gen);
        buf.extend_from_slice(&[0u8; 4]);
    }
    buf.extend_from_slice(&data.payload);
    buf
}

/// Encode an RTCP NACK feedback packet.
pub fn encode_nack(sender_ssrc: u32, media_ssrc: u32, entries: &[(u16, u16)]) -> Vec<u8> {
    // RTCP length is in 32-bit words minus one for the first word.
    let length = 2 + entries.len();
    let mut buf = Vec::with_capacity(4 * (length + 1));
    buf.push(0x81); // V=2, FMT=1 (generic NACK)
    buf.push(RTCP_PT_RTPFB);
    buf.extend_from_slice(&(length as u16).to_be_bytes());
    buf.extend_from_slice(&sender_ssrc.to_be_bytes());
    buf.extend_from_slice(&media_ssrc.to_be_bytes());
    for &(pid, blp) in entries {
        buf.extend_from_slice(&pid.to_be_bytes());
        buf.extend_from_slice(&blp.to_be_bytes());
    }
    buf
}

/// Decode a simple-profile datagram (RTP data or RTCP feedback).
pub fn decode_datagram(buf: &[u8]) -> Result<SimpleMessage, DecodeError> {
    if buf.len() < RTP_HEADER_LEN {
        return Err(DecodeError::MalformedHeader);
    }
    if buf[0] >> 6 != 2 {
        return Err(DecodeError::MalformedHeader);
    }

    // RTCP demux: packet-type octet in 200..=207.
    if (200..=207).contains(&buf[1]) {
        return decode_rtcp(buf);
    }

    let marker = buf[1] & 0x80 != 0;
    let pt = buf[1] & 0x7F;
    if pt != RTP_PT_MPEGTS {
        return Err(DecodeError::UnknownPayloadType(pt));
    }
    let seq16 = u16::from_be_bytes([buf[2], buf[3]]);
    let ts_rtp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

    let mut body = &buf[RTP_HEADER_LEN..];
    let mut seq_hi = None;
    let mut key_gen = 0;
    if marker {
        if body.len() < RTP_EXT_LEN {
            return Err(DecodeError::MalformedHeader);
        }
        seq_hi = Some(u16::from_be_bytes([body[0], body[1]]));
        key_gen = body[3];
        body = &body[RTP_EXT_LEN..];
    }

    Ok(SimpleMessage::Data(SimpleData {
        seq16,
        seq_hi,
        ssrc,
        ts_rtp,
        retransmit: marker,
        key_gen,
        payload: body.to_vec(),
    }))
}

fn decode_rtcp(buf: &[u8]) -> Result<SimpleMessage, DecodeError> {
    if buf[1] != RTCP_PT_RTPFB || buf[0] & 0x1F != 1 {
        return Err(DecodeError::UnknownPayloadType(buf[1]));
    }
    if buf.len() < 12 || (buf.len() - 12) % 4 != 0 {
        return Err(DecodeError::MalformedHeader);
    }
    let media_ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
    let mut entries = Vec::new();
    for chunk in buf[12..].chunks_exact(4) {
        let pid = u16::from_be_bytes([chunk[0], chunk[1]]);
        let blp = u16::from_be_bytes([chunk[2], chunk[3]]);
        entries.push((pid, blp));
    }
    Ok(SimpleMessage::Nack {
        ssrc: media_ssrc,
        entries,
    })
}
