// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Send reliability engine.
//!
//! One [`FlowSender`] per flow: assigns sequence numbers, runs null
//! packet deletion, caches originals for retransmission, services
//! NACK intake with RTT-based coalescing, and meters everything
//! through the bitrate cap. Packets leave here in plaintext; sealing
//! is per peer at egress, since bonded peers hold distinct keys.

mod cache;
mod npd;
mod pacer;

pub use cache::{CacheEntry, CacheStats, Lookup, RetransmitCache};
pub use npd::{elide, reinsert, NPD_MAX_CELLS, TS_CELL, TS_NULL_PID, TS_SYNC};
pub use pacer::TokenBucket;

use crate::config::{ContextConfig, PeerConfig};
use crate::protocol::{DataPacket, FlowId, NackMsg, OversizeError};

const MS: u64 = 1_000_000;

/// Per-flow send counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendStats {
    pub written: u64,
    pub retransmits_sent: u64,
    pub nacks_received: u64,
    /// Requests skipped because a retransmit was already in flight.
    pub coalesced: u64,
    /// Requests for sequences already evicted.
    pub gone: u64,
    pub npd_elided: u64,
}

/// The per-flow send engine.
#[derive(Debug)]
pub struct FlowSender {
    pub flow_id: FlowId,
    virt_src_port: u16,
    virt_dst_port: u16,
    next_seq: u32,
    cache: RetransmitCache,
    bucket: TokenBucket,
    rtt_min_ns: u64,
    npd: bool,
    max_payload: usize,
    pub stats: SendStats,
}

impl FlowSender {
    pub fn new(flow_id: FlowId, config: &PeerConfig, ctx: &ContextConfig, now: u64) -> Self {
        let max_age_ns = u64::from(config.recovery_length_max) * MS;
        Self {
            flow_id,
            virt_src_port: 0,
            virt_dst_port: config.virt_dst_port,
            next_seq: 0,
            cache: RetransmitCache::new(config.recovery_slots(), max_age_ns),
            bucket: TokenBucket::from_mbps(config.recovery_maxbitrate, now),
            rtt_min_ns: u64::from(config.rtt_min) * MS,
            npd: ctx.npd,
            max_payload: ctx.max_packet_size,
            stats: SendStats::default(),
        }
    }

    /// Frame one application payload as the next original.
    pub fn write(
        &mut self,
        payload: &[u8],
        ts_ntp: u64,
        now: u64,
    ) -> Result<DataPacket, OversizeError> {
        self.write_with_seq(payload, ts_ntp, now, None)
    }

    /// Like [`write`](Self::write), but lets RTP passthrough inputs
    /// pin the flow sequence. The hint is adopted while the cache is
    /// empty; once sequences are in flight a disagreeing hint is
    /// ignored so the cache stays contiguous.
    pub fn write_with_seq(
        &mut self,
        payload: &[u8],
        ts_ntp: u64,
        now: u64,
        seq_hint: Option<u32>,
    ) -> Result<DataPacket, OversizeError> {
        if let Some(hint) = seq_hint {
            if self.cache.is_empty() {
                self.next_seq = hint;
            } else if hint != self.next_seq {
                log::debug!(
                    "[send] discontiguous sequence hint {} (expected {}), keeping engine numbering",
                    hint,
                    self.next_seq
                );
            }
        }
        if payload.len() > self.max_payload {
            return Err(OversizeError {
                len: payload.len(),
                max: self.max_payload,
            });
        }

        let (payload, npd_map) = if self.npd {
            match npd::elide(payload) {
                Some((kept, map)) => {
                    self.stats.npd_elided += u64::from(map.count_ones());
                    (kept, map)
                }
                None => (payload.to_vec(), 0),
            }
        } else {
            (payload.to_vec(), 0)
        };

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        self.cache.insert(CacheEntry {
            seq,
            payload: payload.clone(),
            ts_ntp,
            npd_map,
            first_sent: now,
            last_sent: now,
            send_count: 1,
        });
        self.stats.written += 1;

        Ok(DataPacket {
            seq,
            flow_id: self.flow_id,
            virt_src_port: self.virt_src_port,
            virt_dst_port: self.virt_dst_port,
            ts_ntp,
            retransmit: false,
            encrypted: false,
            key_gen: 0,
            npd_map,
            payload,
        })
    }

    /// Service one decoded NACK, producing the retransmissions to send.
    ///
    /// A sequence whose last send is still within `rtt_min` is skipped:
    /// the earlier retransmit is likely still in flight and a duplicate
    /// would only add load exactly when the path is hurting.
    pub fn on_nack(&mut self, msg: &NackMsg, now: u64) -> Vec<DataPacket> {
        self.stats.nacks_received += 1;
        let mut out = Vec::new();
        for seq in msg.sequences() {
            match self.cache.lookup(seq) {
                Lookup::Hit(entry) => {
                    if entry.last_sent + self.rtt_min_ns > now && entry.send_count > 1 {
                        self.stats.coalesced += 1;
                        continue;
                    }
                    entry.send_count += 1;
                    entry.last_sent = now;
                    out.push(DataPacket {
                        seq: entry.seq,
                        flow_id: self.flow_id,
                        virt_src_port: self.virt_src_port,
                        virt_dst_port: self.virt_dst_port,
                        ts_ntp: entry.ts_ntp,
                        retransmit: true,
                        encrypted: false,
                        key_gen: 0,
                        npd_map: entry.npd_map,
                        payload: entry.payload.clone(),
                    });
                    self.stats.retransmits_sent += 1;
                }
                Lookup::Gone => {
                    self.stats.gone += 1;
                }
            }
        }
        out
    }

    /// Bitrate cap gate for one outgoing datagram.
    pub fn try_reserve(&mut self, bytes: usize, now: u64) -> bool {
        self.bucket.try_consume(bytes as u64, now)
    }

    /// How long until `bytes` fit under the cap.
    pub fn send_delay_ns(&mut self, bytes: usize, now: u64) -> u64 {
        self.bucket.time_until(bytes as u64, now)
    }

    /// Periodic maintenance: age out the retransmit cache.
    pub fn tick(&mut self, now: u64) {
        self.cache.evict_expired(now);
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }
}
