// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Main-profile codec: the 12-byte tunnel header and control TLVs.
//!
//! Wire layout, all fields big-endian:
//!
//! ```text
//! magic(2) | flags(1) | key_gen(1) | flow_id(4) | seq(4)
//! ```
//!
//! Data datagrams continue with a 12-byte sub-header
//! `virt_src(2) | virt_dst(2) | ts_ntp(8)`, an optional one-byte NPD
//! map (FLAG_NPD), and the media payload. Control datagrams
//! (FLAG_CONTROL) continue with exactly one TLV `type(1) | len(2)`.
//!
//! Payload encryption covers the media bytes only; headers, sub-headers
//! and control TLVs stay in the clear so routing and handshakes work
//! before keys exist.

use super::{
    Control, DataPacket, DecodeError, FlowId, Handshake, Keepalive, Message, NackMsg,
    OversizeError, TlvType, DATA_SUBHEADER_LEN, FLAG_CONTROL, FLAG_ENCRYPTED, FLAG_NPD,
    FLAG_RETRANSMIT, TLV_HEADER_LEN, TUNNEL_HEADER_LEN, WIRE_MAGIC,
};

/// Encode a media packet. `max_payload` bounds the media bytes, not the
/// framing; the emitted datagram stays within `max_payload` plus the
/// fixed header overhead.
pub fn encode_data(pkt: &DataPacket, max_payload: usize) -> Result<Vec<u8>, OversizeError> {
    if pkt.payload.len() > max_payload {
        return Err(OversizeError {
            len: pkt.payload.len(),
            max: max_payload,
        });
    }

    let mut flags = 0u8;
    if pkt.encrypted {
        flags |= FLAG_ENCRYPTED;
    }
    if pkt.retransmit {
        flags |= FLAG_RETRANSMIT;
    }
    if pkt.npd_map != 0 {
        flags |= FLAG_NPD;
    }

    let npd_len = usize::from(pkt.npd_map != 0);
    let mut buf =
        Vec::with_capacity(TUNNEL_HEADER_LEN + DATA_SUBHEADER_LEN + npd_len + pkt.payload.len());
    put_tunnel_header(&mut buf, flags, pkt.key_gen, pkt.flow_id, pkt.seq);
    buf.extend_from_slice(&pkt.virt_src_port.to_be_bytes());
    buf.extend_from_slice(&pkt.virt_dst_port.to_be_bytes());
    buf.extend_from_slice(&pkt.ts_ntp.to_be_bytes());
    if pkt.npd_map != 0 {
        buf.push(pkt.npd_map);
    }
    buf.extend_from_slice(&pkt.payload);
    Ok(buf)
}

/// Encode a control message addressed to `flow_id` (0 for peer-scoped
/// control like handshakes and keepalives).
pub fn encode_control(flow_id: FlowId, control: &Control) -> Vec<u8> {
    let (tlv, value) = control_value(control);
    let mut buf = Vec::with_capacity(TUNNEL_HEADER_LEN + TLV_HEADER_LEN + value.len());
    put_tunnel_header(&mut buf, FLAG_CONTROL, 0, flow_id, 0);
    buf.push(tlv as u8);
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(&value);
    buf
}

fn put_tunnel_header(buf: &mut Vec<u8>, flags: u8, key_gen: u8, flow_id: FlowId, seq: u32) {
    buf.extend_from_slice(&WIRE_MAGIC.to_be_bytes());
    buf.push(flags);
    buf.push(key_gen);
    buf.extend_from_slice(&flow_id.to_be_bytes());
    buf.extend_from_slice(&seq.to_be_bytes());
}

fn control_value(control: &Control) -> (TlvType, Vec<u8>) {
    match control {
        Control::Handshake(hs) => {
            let mut v = Vec::with_capacity(21);
            v.push(u8::from(hs.ack));
            v.extend_from_slice(&hs.psk_salt);
            v.extend_from_slice(&hs.nonce.to_be_bytes());
            (TlvType::Handshake, v)
        }
        Control::Keepalive(ka) => {
            let mut v = Vec::with_capacity(9);
            let (kind, ts) = match ka {
                Keepalive::Ping { ts } => (0u8, *ts),
                Keepalive::Pong { ts } => (1u8, *ts),
            };
            v.push(kind);
            v.extend_from_slice(&ts.to_be_bytes());
            (TlvType::Keepalive, v)
        }
        Control::Nack(msg) => {
            let mut v = Vec::with_capacity(msg.encoded_len());
            msg.encode(&mut v);
            let tlv = match msg {
                NackMsg::Range(_) => TlvType::NackRange,
                NackMsg::Bitmap { .. } => TlvType::NackBitmap,
            };
            (tlv, v)
        }
        Control::Oob(data) => (TlvType::Oob, data.clone()),
        Control::SrpStep { step, data } => {
            let mut v = Vec::with_capacity(1 + data.len());
            v.push(*step);
            v.extend_from_slice(data);
            (TlvType::SrpStep, v)
        }
        Control::KeyAnnounce { generation, salt } => {
            let mut v = Vec::with_capacity(17);
            v.push(*generation);
            v.extend_from_slice(salt);
            (TlvType::KeyAnnounce, v)
        }
    }
}

/// Decode one datagram. Encrypted media payloads come back sealed with
/// `encrypted = true`; the caller opens them via the keystore.
pub fn decode_datagram(buf: &[u8]) -> Result<Message, DecodeError> {
    if buf.len() < TUNNEL_HEADER_LEN {
        return Err(DecodeError::MalformedHeader);
    }
    let magic = u16::from_be_bytes([buf[0], buf[1]]);
    if magic != WIRE_MAGIC {
        return Err(DecodeError::MalformedHeader);
    }
    let flags = buf[2];
    let key_gen = buf[3];
    let flow_id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let seq = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
    let rest = &buf[TUNNEL_HEADER_LEN..];

    if flags & FLAG_CONTROL != 0 {
        let control = decode_control(rest)?;
        return Ok(Message::Control { flow_id, control });
    }

    if rest.len() < DATA_SUBHEADER_LEN {
        return Err(DecodeError::MalformedHeader);
    }
    let virt_src_port = u16::from_be_bytes([rest[0], rest[1]]);
    let virt_dst_port = u16::from_be_bytes([rest[2], rest[3]]);
    let ts_ntp = u64::from_be_bytes([
        rest[4], rest[5], rest[6], rest[7], rest[8], rest[9], rest[10], rest[11],
    ]);
    let mut body = &rest[DATA_SUBHEADER_LEN..];
    let mut npd_map = 0u8;
    if flags & FLAG_NPD != 0 {
        let (&map, tail) = body.split_first().ok_or(DecodeError::MalformedHeader)?;
        npd_map = map;
        body = tail;
    }

    Ok(Message::Data(DataPacket {
        seq,
        flow_id,
        virt_src_port,
        virt_dst_port,
        ts_ntp,
        retransmit: flags & FLAG_RETRANSMIT != 0,
        encrypted: flags & FLAG_ENCRYPTED != 0,
        key_gen,
        npd_map,
        payload: body.to_vec(),
    }))
}

fn decode_control(rest: &[u8]) -> Result<Control, DecodeError> {
    if rest.len() < TLV_HEADER_LEN {
        return Err(DecodeError::MalformedHeader);
    }
    let raw_type = rest[0];
    let len = usize::from(u16::from_be_bytes([rest[1], rest[2]]));
    let value = rest
        .get(TLV_HEADER_LEN..TLV_HEADER_LEN + len)
        .ok_or(DecodeError::MalformedHeader)?;
    let tlv = TlvType::from_u8(raw_type).ok_or(DecodeError::UnknownPayloadType(raw_type))?;

    match tlv {
        TlvType::Handshake => {
            if value.len() != 21 {
                return Err(DecodeError::MalformedHeader);
            }
            let mut psk_salt = [0u8; 16];
            psk_salt.copy_from_slice(&value[1..17]);
            let nonce = u32::from_be_bytes([value[17], value[18], value[19], value[20]]);
            Ok(Control::Handshake(Handshake {
                ack: value[0] != 0,
                psk_salt,
                nonce,
            }))
        }
        TlvType::Keepalive => {
            if value.len() != 9 {
                return Err(DecodeError::MalformedHeader);
            }
            let ts = u64::from_be_bytes([
                value[1], value[2], value[3], value[4], value[5], value[6], value[7], value[8],
            ]);
            match value[0] {
                0 => Ok(Control::Keepalive(Keepalive::Ping { ts })),
                1 => Ok(Control::Keepalive(Keepalive::Pong { ts })),
                _ => Err(DecodeError::MalformedHeader),
            }
        }
        TlvType::NackRange => Ok(Control::Nack(NackMsg::decode_range(value)?)),
        TlvType::NackBitmap => Ok(Control::Nack(NackMsg::decode_bitmap(value)?)),
        TlvType::Oob => Ok(Control::Oob(value.to_vec())),
        TlvType::SrpStep => {
            let (&step, data) = value.split_first().ok_or(DecodeError::MalformedHeader)?;
            Ok(Control::SrpStep {
                step,
                data: data.to_vec(),
            })
        }
        TlvType::KeyAnnounce => {
            if value.len() != 17 {
                return Err(DecodeError::MalformedHeader);
            }
            let mut salt = [0u8; 16];
            salt.copy_from_slice(&value[1..17]);
            Ok(Control::KeyAnnounce {
                generation: value[0],
                salt,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> DataPacket {
        DataPacket {
            seq: 0xDEAD_BEEF,
            flow_id: 0x1234_5678,
            virt_src_port: 42,
            virt_dst_port: 1968,
            ts_ntp: 0x0102_0304_0506_0708,
            retransmit: false,
            encrypted: false,
            key_gen: 0,
            npd_map: 0,
            payload: vec![0x47; 188],
        }
    }

    #[test]
    fn test_data_roundtrip() {
        let pkt = sample_packet();
        let wire = encode_data(&pkt, 1316).unwrap();
        assert_eq!(wire.len(), TUNNEL_HEADER_LEN + DATA_SUBHEADER_LEN + 188);

        match decode_datagram(&wire).unwrap() {
            Message::Data(d) => {
                assert_eq!(d.seq, pkt.seq);
                assert_eq!(d.flow_id, pkt.flow_id);
                assert_eq!(d.virt_src_port, 42);
                assert_eq!(d.virt_dst_port, 1968);
                assert_eq!(d.ts_ntp, pkt.ts_ntp);
                assert!(!d.retransmit);
                assert_eq!(d.payload, pkt.payload);
            }
            Message::Control { .. } => panic!("expected data"),
        }
    }

    #[test]
    fn test_data_flags_roundtrip() {
        let mut pkt = sample_packet();
        pkt.retransmit = true;
        pkt.encrypted = true;
        pkt.key_gen = 3;
        pkt.npd_map = 0b0101;
        let wire = encode_data(&pkt, 1316).unwrap();
        match decode_datagram(&wire).unwrap() {
            Message::Data(d) => {
                assert!(d.retransmit);
                assert!(d.encrypted);
                assert_eq!(d.key_gen, 3);
                assert_eq!(d.npd_map, 0b0101);
                assert_eq!(d.payload.len(), 188);
            }
            Message::Control { .. } => panic!("expected data"),
        }
    }

    #[test]
    fn test_encode_rejects_oversize() {
        let mut pkt = sample_packet();
        pkt.payload = vec![0; 1317];
        assert!(encode_data(&pkt, 1316).is_err());
    }

    #[test]
    fn test_decode_bad_magic() {
        let pkt = sample_packet();
        let mut wire = encode_data(&pkt, 1316).unwrap();
        wire[0] = 0x00;
        assert_eq!(decode_datagram(&wire), Err(DecodeError::MalformedHeader));
    }

    #[test]
    fn test_decode_truncated() {
        let pkt = sample_packet();
        let wire = encode_data(&pkt, 1316).unwrap();
        assert_eq!(
            decode_datagram(&wire[..TUNNEL_HEADER_LEN + 3]),
            Err(DecodeError::MalformedHeader)
        );
        assert_eq!(decode_datagram(&[]), Err(DecodeError::MalformedHeader));
    }

    #[test]
    fn test_unknown_tlv_type() {
        let wire = encode_control(7, &Control::Oob(vec![1, 2, 3]));
        let mut bad = wire.clone();
        bad[TUNNEL_HEADER_LEN] = 0x7F;
        assert_eq!(
            decode_datagram(&bad),
            Err(DecodeError::UnknownPayloadType(0x7F))
        );
    }

    #[test]
    fn test_control_roundtrips() {
        let cases = vec![
            Control::Handshake(Handshake {
                ack: true,
                psk_salt: [7; 16],
                nonce: 0xAABB_CCDD,
            }),
            Control::Keepalive(Keepalive::Ping { ts: 123_456_789 }),
            Control::Keepalive(Keepalive::Pong { ts: 99 }),
            Control::Nack(NackMsg::Range(vec![(500, 500)])),
            Control::Nack(NackMsg::Bitmap {
                base: 1000,
                mask: 0x7FFF,
            }),
            Control::Oob(b"auth,10.0.0.1:1968".to_vec()),
            Control::SrpStep {
                step: 2,
                data: vec![9; 32],
            },
            Control::KeyAnnounce {
                generation: 5,
                salt: [3; 16],
            },
        ];
        for control in cases {
            let wire = encode_control(0x42, &control);
            match decode_datagram(&wire).unwrap() {
                Message::Control { flow_id, control: decoded } => {
                    assert_eq!(flow_id, 0x42);
                    assert_eq!(decoded, control);
                }
                Message::Data(_) => panic!("expected control"),
            }
        }
    }

    #[test]
    fn test_tlv_length_beyond_buffer() {
        let mut wire = encode_control(1, &Control::Oob(vec![1, 2, 3]));
        // Claim a longer value than the datagram carries.
        let len_at = TUNNEL_HEADER_LEN + 1;
        wire[len_at] = 0xFF;
        wire[len_at + 1] = 0xFF;
        assert_eq!(decode_datagram(&wire), Err(DecodeError::MalformedHeader));
    }
}
