// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! NACK payload encodings.
//!
//! Two forms exist on the wire: a RANGE list (inclusive from/to pairs,
//! 8 bytes each) and a BITMAP (base sequence plus a 16-bit mask where
//! bit i requests `base + 1 + i`, 6 bytes total). The sender accepts
//! both; the receiver picks whichever is smaller for its loss set.

use super::{seq::seq_distance, DecodeError};

/// Maximum sequences a single bitmap covers (base + 16 mask bits).
pub const BITMAP_SPAN: u32 = 17;

/// A decoded NACK payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackMsg {
    /// Inclusive (from, to) pairs.
    Range(Vec<(u32, u32)>),
    /// `base` plus any `base + 1 + i` where mask bit i is set.
    Bitmap { base: u32, mask: u16 },
}

impl NackMsg {
    /// Expand into the individual requested sequences.
    pub fn sequences(&self) -> Vec<u32> {
        match self {
            NackMsg::Range(pairs) => {
                let mut out = Vec::new();
                for &(from, to) in pairs {
                    let span = seq_distance(to, from);
                    // Guard against a hostile pair flooding the expander.
                    for i in 0..=span.min(u16::MAX as u32) {
                        out.push(from.wrapping_add(i));
                    }
                }
                out
            }
            NackMsg::Bitmap { base, mask } => {
                let mut out = vec![*base];
                for i in 0..16 {
                    if mask & (1 << i) != 0 {
                        out.push(base.wrapping_add(1 + i));
                    }
                }
                out
            }
        }
    }

    /// Encoded payload size in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            NackMsg::Range(pairs) => pairs.len() * 8,
            NackMsg::Bitmap { .. } => 6,
        }
    }

    /// Serialize the TLV value (big-endian fields).
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            NackMsg::Range(pairs) => {
                for &(from, to) in pairs {
                    buf.extend_from_slice(&from.to_be_bytes());
                    buf.extend_from_slice(&to.to_be_bytes());
                }
            }
            NackMsg::Bitmap { base, mask } => {
                buf.extend_from_slice(&base.to_be_bytes());
                buf.extend_from_slice(&mask.to_be_bytes());
            }
        }
    }

    /// Parse a NACK_RANGE TLV value.
    pub fn decode_range(value: &[u8]) -> Result<Self, DecodeError> {
        if value.is_empty() || value.len() % 8 != 0 {
            return Err(DecodeError::MalformedHeader);
        }
        let mut pairs = Vec::with_capacity(value.len() / 8);
        for chunk in value.chunks_exact(8) {
            let from = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let to = u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
            pairs.push((from, to));
        }
        Ok(NackMsg::Range(pairs))
    }

    /// Parse a NACK_BITMAP TLV value.
    pub fn decode_bitmap(value: &[u8]) -> Result<Self, DecodeError> {
        if value.len() != 6 {
            return Err(DecodeError::MalformedHeader);
        }
        let base = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
        let mask = u16::from_be_bytes([value[4], value[5]]);
        Ok(NackMsg::Bitmap { base, mask })
    }

    /// Build the cheapest encoding for a sorted loss set.
    ///
    /// Returns `None` for an empty set (empty NACKs are suppressed, no
    /// datagram is emitted). When every sequence fits inside one bitmap
    /// window the 6-byte bitmap wins unless a single range pair would
    /// tie; wider sets collapse into merged range pairs.
    pub fn for_loss_set(missing: &[u32]) -> Option<NackMsg> {
        if missing.is_empty() {
            return None;
        }
        let base = missing[0];
        let fits_bitmap = missing
            .iter()
            .all(|&s| seq_distance(s, base) < BITMAP_SPAN);
        let ranges = Self::merge_ranges(missing);
        let range_len = ranges.len() * 8;

        if fits_bitmap && 6 < range_len {
            let mut mask = 0u16;
            for &s in &missing[1..] {
                let off = seq_distance(s, base);
                if off >= 1 {
                    mask |= 1 << (off - 1);
                }
            }
            return Some(NackMsg::Bitmap { base, mask });
        }
        Some(NackMsg::Range(ranges))
    }

    /// Collapse a sorted sequence list into inclusive pairs.
    fn merge_ranges(missing: &[u32]) -> Vec<(u32, u32)> {
        let mut pairs: Vec<(u32, u32)> = Vec::new();
        for &s in missing {
            match pairs.last_mut() {
                Some((_, to)) if s == to.wrapping_add(1) => *to = s,
                Some((_, to)) if s == *to => {}
                _ => pairs.push((s, s)),
            }
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_roundtrip() {
        let msg = NackMsg::Range(vec![(10, 14), (20, 20)]);
        let mut buf = Vec::new();
        msg.encode(&mut buf);
        assert_eq!(buf.len(), msg.encoded_len());
        assert_eq!(NackMsg::decode_range(&buf).unwrap(), msg);
    }

    #[test]
    fn test_bitmap_roundtrip() {
        let msg = NackMsg::Bitmap {
            base: 1000,
            mask: 0x7FFF,
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf);
        assert_eq!(buf.len(), 6);
        assert_eq!(NackMsg::decode_bitmap(&buf).unwrap(), msg);
    }

    #[test]
    fn test_decode_range_rejects_ragged() {
        assert_eq!(
            NackMsg::decode_range(&[0; 7]),
            Err(DecodeError::MalformedHeader)
        );
        assert_eq!(
            NackMsg::decode_range(&[]),
            Err(DecodeError::MalformedHeader)
        );
    }

    #[test]
    fn test_bitmap_expansion() {
        let msg = NackMsg::Bitmap {
            base: 100,
            mask: 0b101,
        };
        assert_eq!(msg.sequences(), vec![100, 101, 103]);
    }

    #[test]
    fn test_range_expansion_wraps() {
        let msg = NackMsg::Range(vec![(0xFFFF_FFFE, 0x0000_0001)]);
        assert_eq!(
            msg.sequences(),
            vec![0xFFFF_FFFE, 0xFFFF_FFFF, 0x0000_0000, 0x0000_0001]
        );
    }

    #[test]
    fn test_chooser_empty_suppressed() {
        assert_eq!(NackMsg::for_loss_set(&[]), None);
    }

    #[test]
    fn test_chooser_burst_prefers_bitmap() {
        // 16 consecutive losses: one bitmap instead of one range pair?
        // Range pair is 8 bytes, bitmap 6 -> bitmap wins.
        let missing: Vec<u32> = (1000..1016).collect();
        let msg = NackMsg::for_loss_set(&missing).unwrap();
        assert_eq!(
            msg,
            NackMsg::Bitmap {
                base: 1000,
                mask: 0x7FFF
            }
        );
        assert_eq!(msg.sequences(), missing);
    }

    #[test]
    fn test_chooser_wide_set_uses_ranges() {
        let missing = vec![10, 11, 12, 5000, 5001];
        let msg = NackMsg::for_loss_set(&missing).unwrap();
        assert_eq!(msg, NackMsg::Range(vec![(10, 12), (5000, 5001)]));
    }

    #[test]
    fn test_chooser_single_loss() {
        let msg = NackMsg::for_loss_set(&[42]).unwrap();
        // One lone sequence: bitmap (6B) beats a range pair (8B).
        assert_eq!(msg, NackMsg::Bitmap { base: 42, mask: 0 });
        assert_eq!(msg.sequences(), vec![42]);
    }

    #[test]
    fn test_chooser_scattered_in_window() {
        let missing = vec![100, 103, 109, 116];
        let msg = NackMsg::for_loss_set(&missing).unwrap();
        match msg {
            NackMsg::Bitmap { base, .. } => assert_eq!(base, 100),
            NackMsg::Range(_) => panic!("expected bitmap for in-window set"),
        }
        assert_eq!(msg.sequences(), missing);
    }

    #[test]
    fn test_merge_ranges_dedup() {
        let msg = NackMsg::for_loss_set(&[1, 1, 2, 2, 3]).unwrap();
        assert_eq!(msg.sequences(), vec![1, 2, 3]);
    }
}
