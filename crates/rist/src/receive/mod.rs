// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Receive reliability engine.
//!
//! One [`FlowReceiver`] per flow: packets go into the recovery buffer,
//! losses are chased by the NACK scheduler, and in-order egress comes
//! back out bounded by the recovery window. The engine is time-pure
//! (callers pass `now`), which is what the scenario tests lean on.

mod buffer;
mod nack_scheduler;

pub use buffer::{BufferStats, Egress, Insert, RecoveryBuffer};
pub use nack_scheduler::NackScheduler;

use crate::config::PeerConfig;
use crate::protocol::{DataPacket, FlowId, NackMsg};

const MS: u64 = 1_000_000;

/// Per-flow receive counters beyond the buffer's own.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiveStats {
    pub received: u64,
    pub retransmits_received: u64,
    pub nacks_sent: u64,
}

/// The per-flow reliability engine.
#[derive(Debug)]
pub struct FlowReceiver {
    pub flow_id: FlowId,
    buf: RecoveryBuffer,
    sched: NackScheduler,
    rtt_min_ns: u64,
    max_retries: u32,
    last_traffic: u64,
    pub stats: ReceiveStats,
}

impl FlowReceiver {
    /// Build a receiver sized from the registering peer's config.
    pub fn new(flow_id: FlowId, config: &PeerConfig) -> Self {
        let recovery_max_ns = u64::from(config.recovery_length_max) * MS;
        let first_nack_ns = u64::from(config.reorder_buffer.max(config.rtt_min)) * MS;
        let nack_period_ns = u64::from(crate::config::DEFAULT_NACK_PERIOD) * MS;
        Self {
            flow_id,
            buf: RecoveryBuffer::new(config.recovery_slots(), recovery_max_ns, first_nack_ns),
            sched: NackScheduler::new(
                nack_period_ns,
                config.bloat_mode,
                config.bloat_limit as usize,
            ),
            rtt_min_ns: u64::from(config.rtt_min) * MS,
            max_retries: config.max_retries,
            last_traffic: 0,
            stats: ReceiveStats::default(),
        }
    }

    /// Feed one decoded packet; returns whatever became deliverable.
    pub fn on_packet(&mut self, pkt: DataPacket, now: u64) -> Vec<Egress> {
        self.last_traffic = now;
        self.stats.received += 1;
        if pkt.retransmit {
            self.stats.retransmits_received += 1;
        }
        let seq = pkt.seq;
        let outcome = self.buf.insert(pkt, now);

        let mut out = Vec::new();
        if let Insert::Fresh { gaps_opened } = outcome {
            if gaps_opened > 0 {
                let first = seq.wrapping_sub(gaps_opened);
                out = self.sched.on_gaps_opened(&mut self.buf, first, gaps_opened);
            }
        }
        out.extend(self.buf.egress(now));
        out
    }

    /// Periodic driver: expiry egress plus at most one NACK message.
    ///
    /// `rtt_ns` is the current smoothed estimate of the carrying peer
    /// (bonded receives use the best active peer's estimate).
    pub fn tick(&mut self, now: u64, rtt_ns: u64) -> (Vec<Egress>, Option<NackMsg>) {
        let retry_interval = rtt_ns.max(self.rtt_min_ns);
        let nack = self
            .sched
            .poll(&mut self.buf, now, retry_interval, self.max_retries);
        if nack.is_some() {
            self.stats.nacks_sent += 1;
        }
        let out = self.buf.egress(now);
        (out, nack)
    }

    /// Buffer occupancy for stats.
    pub fn occupancy(&self) -> u32 {
        self.buf.in_flight()
    }

    pub fn outstanding_nacks(&self) -> usize {
        self.buf.outstanding()
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.buf.stats
    }

    /// Idle duration for flow garbage collection.
    pub fn idle_ns(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_traffic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;

    fn config() -> PeerConfig {
        PeerConfig {
            address: "127.0.0.1:1968".into(),
            ..PeerConfig::default()
        }
    }

    fn pkt(seq: u32) -> DataPacket {
        DataPacket {
            seq,
            flow_id: 7,
            virt_src_port: 0,
            virt_dst_port: 1968,
            ts_ntp: 0,
            retransmit: false,
            encrypted: false,
            key_gen: 0,
            npd_map: 0,
            payload: vec![0x47],
        }
    }

    fn delivered(items: &[Egress]) -> Vec<u32> {
        items
            .iter()
            .filter_map(|e| match e {
                Egress::Deliver(p) => Some(p.seq),
                Egress::Hole { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_clean_stream_flows_through() {
        let mut rx = FlowReceiver::new(7, &config());
        let mut got = Vec::new();
        for seq in 0..100 {
            got.extend(delivered(&rx.on_packet(pkt(seq), u64::from(seq) * MS)));
        }
        assert_eq!(got, (0..100).collect::<Vec<_>>());
        assert_eq!(rx.stats.received, 100);
        assert_eq!(rx.outstanding_nacks(), 0);
    }

    #[test]
    fn test_single_loss_nack_then_recovery() {
        let cfg = config();
        let mut rx = FlowReceiver::new(7, &cfg);
        rx.on_packet(pkt(0), 0);
        rx.on_packet(pkt(2), MS); // 1 missing

        // First NACK due at reorder/rtt-min horizon.
        let first_due = u64::from(cfg.reorder_buffer.max(cfg.rtt_min)) * MS;
        let (_, nack) = rx.tick(MS + first_due, 20 * MS);
        let nack = nack.expect("first NACK missing");
        assert_eq!(nack.sequences(), vec![1]);
        assert_eq!(rx.stats.nacks_sent, 1);

        // Retransmission arrives and releases in-order egress.
        let mut rt = pkt(1);
        rt.retransmit = true;
        let out = rx.on_packet(rt, MS + first_due + 10 * MS);
        assert_eq!(delivered(&out), vec![1, 2]);
        assert_eq!(rx.stats.retransmits_received, 1);
    }

    #[test]
    fn test_permanent_loss_surfaces_hole() {
        let cfg = config();
        let mut rx = FlowReceiver::new(7, &cfg);
        rx.on_packet(pkt(0), 0);
        rx.on_packet(pkt(2), 0);

        let recovery_max = u64::from(cfg.recovery_length_max) * MS;
        let (out, _) = rx.tick(recovery_max, 20 * MS);
        assert!(out.contains(&Egress::Hole { seq: 1 }));
        assert_eq!(delivered(&out), vec![2]);
    }

    #[test]
    fn test_duplicates_deliver_once() {
        let mut rx = FlowReceiver::new(7, &config());
        let a = rx.on_packet(pkt(0), 0);
        let b = rx.on_packet(pkt(0), 1);
        let total = delivered(&a).len() + delivered(&b).len();
        assert_eq!(total, 1);
        assert_eq!(rx.buffer_stats().duplicates, 1);
    }

    #[test]
    fn test_idle_tracking() {
        let mut rx = FlowReceiver::new(7, &config());
        rx.on_packet(pkt(0), 5 * MS);
        assert_eq!(rx.idle_ns(25 * MS), 20 * MS);
    }
}
