// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! NACK aggregation cadence and buffer-bloat mitigation.
//!
//! All pending NACKs of a flow leave as one message per `nack_period`,
//! never more often, encoded in whichever form is smaller. When the
//! outstanding-placeholder count climbs past the bloat limit the
//! scheduler starts giving up new placeholders probabilistically, and
//! past the hard limit it force-drains the buffer instead of letting
//! the NACK set grow without bound.

use super::buffer::{Egress, RecoveryBuffer};
use crate::config::BloatMode;
use crate::protocol::NackMsg;

/// Per-flow NACK pacing and bloat policy.
#[derive(Debug)]
pub struct NackScheduler {
    nack_period_ns: u64,
    last_emit: Option<u64>,
    bloat_mode: BloatMode,
    bloat_limit: usize,
    hard_limit: usize,
    /// Aggregated NACK messages sent (stats).
    pub emitted: u64,
    /// Placeholders abandoned by the bloat policy (stats).
    pub abandoned: u64,
}

impl NackScheduler {
    pub fn new(nack_period_ns: u64, bloat_mode: BloatMode, bloat_limit: usize) -> Self {
        let hard_limit = match bloat_mode.hard_limit_factor() {
            Some(factor) => ((bloat_limit as f32) * factor) as usize,
            None => usize::MAX,
        };
        Self {
            nack_period_ns,
            last_emit: None,
            bloat_mode,
            bloat_limit,
            hard_limit,
            emitted: 0,
            abandoned: 0,
        }
    }

    /// Aggregate due NACKs into at most one message per period.
    ///
    /// `retry_interval_ns` is `max(rtt_current, rtt_min)`. An empty
    /// due set emits nothing.
    pub fn poll(
        &mut self,
        buf: &mut RecoveryBuffer,
        now: u64,
        retry_interval_ns: u64,
        max_retries: u32,
    ) -> Option<NackMsg> {
        if let Some(last) = self.last_emit {
            if now < last + self.nack_period_ns {
                return None;
            }
        }
        let due = buf.due_nacks(now, retry_interval_ns, max_retries);
        let msg = NackMsg::for_loss_set(&due)?;
        self.last_emit = Some(now);
        self.emitted += 1;
        Some(msg)
    }

    /// Apply the bloat policy to placeholders opened by one insert.
    ///
    /// `first..first+count` (serial order) are the fresh placeholders.
    /// Returns egress forced out by a hard-limit drain, empty in the
    /// common case.
    pub fn on_gaps_opened(
        &mut self,
        buf: &mut RecoveryBuffer,
        first: u32,
        count: u32,
    ) -> Vec<Egress> {
        if self.bloat_mode == BloatMode::Off {
            return Vec::new();
        }

        let outstanding = buf.outstanding();
        if count > 0 && outstanding > self.bloat_limit {
            // Probabilistic early drop, deterministic per sequence so
            // behavior is reproducible under test.
            let span = (self.hard_limit - self.bloat_limit).max(1);
            let over = outstanding - self.bloat_limit;
            let p_millis = (over * 1000 / span).min(1000);
            for i in 0..count {
                let seq = first.wrapping_add(i);
                if (mix(seq) % 1000) < p_millis as u32 {
                    buf.give_up(seq);
                    self.abandoned += 1;
                }
            }
        }

        if buf.outstanding() >= self.hard_limit {
            log::warn!(
                "[recovery] outstanding NACKs hit hard limit {}, force draining",
                self.hard_limit
            );
            let drained = buf.drain_to(self.bloat_limit);
            self.abandoned += drained.len() as u64;
            return drained;
        }
        Vec::new()
    }
}

/// Cheap avalanche mix for the deterministic drop decision.
#[inline]
fn mix(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^ (x >> 16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DataPacket;

    const MS: u64 = 1_000_000;

    fn pkt(seq: u32) -> DataPacket {
        DataPacket {
            seq,
            flow_id: 1,
            virt_src_port: 0,
            virt_dst_port: 1968,
            ts_ntp: 0,
            retransmit: false,
            encrypted: false,
            key_gen: 0,
            npd_map: 0,
            payload: Vec::new(),
        }
    }

    fn buf() -> RecoveryBuffer {
        RecoveryBuffer::new(4096, 1000 * MS, 0)
    }

    #[test]
    fn test_cadence_bounds_emissions() {
        let mut buf = buf();
        let mut sched = NackScheduler::new(10 * MS, BloatMode::Off, 256);
        buf.insert(pkt(1), 0);
        buf.insert(pkt(100), 0);

        // Drive one second at 1 ms ticks with a 1 ms retry interval:
        // cadence must cap emissions at ceil(window / period).
        let mut emissions = 0;
        for t in 0..1000u64 {
            if sched.poll(&mut buf, t * MS, MS, u32::MAX).is_some() {
                emissions += 1;
            }
        }
        assert!(emissions <= 100, "emitted {} messages in 1 s", emissions);
        assert!(emissions >= 99);
    }

    #[test]
    fn test_empty_due_set_suppressed() {
        let mut buf = buf();
        let mut sched = NackScheduler::new(10 * MS, BloatMode::Off, 256);
        buf.insert(pkt(1), 0);
        buf.insert(pkt(2), 0);
        assert_eq!(sched.poll(&mut buf, 100 * MS, MS, 7), None);
        assert_eq!(sched.emitted, 0);
    }

    #[test]
    fn test_burst_yields_single_bitmap() {
        let mut buf = buf();
        let mut sched = NackScheduler::new(10 * MS, BloatMode::Off, 256);
        buf.insert(pkt(999), 0);
        buf.insert(pkt(1016), 0); // 16 consecutive missing: 1000..=1015
        let msg = sched.poll(&mut buf, 10 * MS, MS, 7).expect("nack due");
        assert_eq!(
            msg,
            NackMsg::Bitmap {
                base: 1000,
                mask: 0x7FFF
            }
        );
    }

    #[test]
    fn test_bloat_off_never_abandons() {
        let mut buf = buf();
        let mut sched = NackScheduler::new(10 * MS, BloatMode::Off, 8);
        buf.insert(pkt(0), 0);
        buf.insert(pkt(2000), 0);
        let forced = sched.on_gaps_opened(&mut buf, 1, 1999);
        assert!(forced.is_empty());
        assert_eq!(sched.abandoned, 0);
    }

    #[test]
    fn test_bloat_probabilistic_drop_between_limits() {
        let mut buf = buf();
        // Normal mode: hard limit = 2x bloat limit.
        let mut sched = NackScheduler::new(10 * MS, BloatMode::Normal, 100);
        buf.insert(pkt(0), 0);
        buf.insert(pkt(151), 0); // 150 outstanding, 50% over limit
        let before = buf.outstanding();
        sched.on_gaps_opened(&mut buf, 1, 150);
        let after = buf.outstanding();
        assert!(after < before, "no placeholders were abandoned");
        assert!(
            after > before / 4,
            "drop probability wildly above the configured slope"
        );
    }

    #[test]
    fn test_bloat_hard_limit_drains() {
        let mut buf = buf();
        let mut sched = NackScheduler::new(10 * MS, BloatMode::Aggressive, 100);
        // Aggressive: hard limit = 125. Backlog accumulated before the
        // policy saw it (mode switched at runtime): the periodic check
        // alone must force the drain.
        buf.insert(pkt(0), 0);
        buf.insert(pkt(400), 0); // 399 outstanding, far past hard limit
        let forced = sched.on_gaps_opened(&mut buf, 0, 0);
        assert_eq!(buf.outstanding(), 100);
        assert!(!forced.is_empty(), "hard-limit drain must surface egress");
    }
}
