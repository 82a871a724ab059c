// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Statistics snapshots published to the registered callback.

use crate::peers::PeerState;

/// Per-flow receive-side counters.
#[derive(Debug, Clone, Default)]
pub struct FlowStatsSnapshot {
    pub flow_id: u32,
    pub virt_dst_port: u16,
    pub received: u64,
    pub delivered: u64,
    pub retransmits_received: u64,
    /// Holes surfaced to the application.
    pub lost: u64,
    pub duplicates: u64,
    pub nacks_sent: u64,
    /// Sequences between the cursors right now.
    pub buffer_occupancy: u32,
    pub outstanding_nacks: usize,
    /// Ingress bitrate over the last stats interval.
    pub bitrate_bps: u64,
}

/// Per-flow send-side counters.
#[derive(Debug, Clone, Default)]
pub struct SendStatsSnapshot {
    pub flow_id: u32,
    pub written: u64,
    pub retransmits_sent: u64,
    pub nacks_received: u64,
    pub coalesced: u64,
    pub gone: u64,
    pub cache_size: usize,
    pub bitrate_bps: u64,
}

/// Per-peer link quality.
#[derive(Debug, Clone)]
pub struct PeerStatsSnapshot {
    pub peer_id: u32,
    pub cname: String,
    pub state: PeerState,
    pub rtt_ms: f32,
    pub jitter_ms: f32,
    pub loss_rate: f32,
    pub stale_count: u64,
}

/// Everything the stats callback can observe.
#[derive(Debug, Clone)]
pub enum StatsEvent {
    ReceiverFlow(FlowStatsSnapshot),
    SenderFlow(SendStatsSnapshot),
    Peer(PeerStatsSnapshot),
    /// Decrypt-failure rate crossed the alarm threshold.
    AuthAlarm { failures: u64 },
    /// Dropped a caller write on a full queue.
    DroppedByBackpressure { count: u64 },
    /// Unrecoverable engine failure; workers are exiting.
    FatalError(String),
}

/// Registered observer for periodic statistics.
pub type StatsCallback = std::sync::Arc<dyn Fn(&StatsEvent) + Send + Sync>;

/// Interval bitrate meter (bytes in, bits/s out).
#[derive(Debug, Clone, Copy, Default)]
pub struct BitrateMeter {
    bytes: u64,
    window_start: u64,
}

impl BitrateMeter {
    pub fn on_bytes(&mut self, n: usize) {
        self.bytes += n as u64;
    }

    /// Rate since the last sample, resetting the window.
    pub fn sample(&mut self, now: u64) -> u64 {
        let elapsed_ns = now.saturating_sub(self.window_start);
        let rate = if elapsed_ns == 0 {
            0
        } else {
            (u128::from(self.bytes) * 8 * 1_000_000_000 / u128::from(elapsed_ns)) as u64
        };
        self.bytes = 0;
        self.window_start = now;
        rate
    }
}
