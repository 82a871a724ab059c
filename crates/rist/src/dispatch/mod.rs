// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Flow table and packet routing.
//!
//! The dispatcher exclusively owns the flow table: flows are created
//! lazily on the first authenticated packet bearing a new
//! (flow_id, virt_dst_port) key and torn down after the idle timeout.
//! Each flow sits behind its own mutex; flows are pinned to workers by
//! key hash, so those locks are effectively uncontended and the socket
//! thread never blocks on flow processing.

mod stats;

pub use stats::{
    BitrateMeter, FlowStatsSnapshot, PeerStatsSnapshot, SendStatsSnapshot, StatsCallback,
    StatsEvent,
};

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::PeerConfig;
use crate::protocol::FlowId;
use crate::receive::FlowReceiver;

/// Flow table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub flow_id: FlowId,
    pub dst_port: u16,
}

struct FlowState {
    receiver: Mutex<FlowReceiver>,
    meter: Mutex<BitrateMeter>,
}

/// The receive-side flow dispatcher.
pub struct FlowDispatcher {
    flows: DashMap<FlowKey, FlowState>,
    /// Buffer sizing for lazily created flows.
    template: PeerConfig,
    worker_count: usize,
    flow_idle_ns: u64,
}

impl FlowDispatcher {
    pub fn new(template: PeerConfig, worker_count: usize, flow_idle_ms: u32) -> Self {
        Self {
            flows: DashMap::new(),
            template,
            worker_count: worker_count.max(1),
            flow_idle_ns: u64::from(flow_idle_ms) * 1_000_000,
        }
    }

    /// Worker a flow is pinned to.
    pub fn worker_for(&self, key: FlowKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.worker_count
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Run `f` on the flow, creating it on first contact.
    pub fn with_flow<R>(&self, key: FlowKey, f: impl FnOnce(&mut FlowReceiver) -> R) -> R {
        let state = self.flows.entry(key).or_insert_with(|| {
            log::info!(
                "[dispatch] new flow {:#010x} on port {}",
                key.flow_id,
                key.dst_port
            );
            FlowState {
                receiver: Mutex::new(FlowReceiver::new(key.flow_id, &self.template)),
                meter: Mutex::new(BitrateMeter::default()),
            }
        });
        let mut receiver = state.receiver.lock();
        f(&mut receiver)
    }

    /// Run `f` on the flow only if it already exists.
    pub fn with_existing_flow<R>(
        &self,
        key: FlowKey,
        f: impl FnOnce(&mut FlowReceiver) -> R,
    ) -> Option<R> {
        let state = self.flows.get(&key)?;
        let mut receiver = state.receiver.lock();
        Some(f(&mut receiver))
    }

    /// Account ingress bytes toward the flow's bitrate meter.
    pub fn meter_bytes(&self, key: FlowKey, bytes: usize) {
        if let Some(state) = self.flows.get(&key) {
            state.meter.lock().on_bytes(bytes);
        }
    }

    /// All live keys, for worker tick sweeps.
    pub fn keys(&self) -> Vec<FlowKey> {
        self.flows.iter().map(|e| *e.key()).collect()
    }

    /// Tear down flows idle past the timeout; returns the evicted keys.
    pub fn gc(&self, now: u64) -> Vec<FlowKey> {
        let mut evicted = Vec::new();
        self.flows.retain(|key, state| {
            let idle = state.receiver.lock().idle_ns(now);
            if idle >= self.flow_idle_ns {
                log::info!(
                    "[dispatch] flow {:#010x} idle for {} ms, destroying",
                    key.flow_id,
                    idle / 1_000_000
                );
                evicted.push(*key);
                false
            } else {
                true
            }
        });
        evicted
    }

    /// Per-flow stats snapshots, sampling each bitrate meter.
    pub fn snapshot(&self, now: u64) -> Vec<FlowStatsSnapshot> {
        self.flows
            .iter()
            .map(|entry| {
                let key = *entry.key();
                let receiver = entry.receiver.lock();
                let buffer = receiver.buffer_stats();
                FlowStatsSnapshot {
                    flow_id: key.flow_id,
                    virt_dst_port: key.dst_port,
                    received: receiver.stats.received,
                    delivered: buffer.delivered,
                    retransmits_received: receiver.stats.retransmits_received,
                    lost: buffer.holes + buffer.overflow_drops,
                    duplicates: buffer.duplicates,
                    nacks_sent: receiver.stats.nacks_sent,
                    buffer_occupancy: receiver.occupancy(),
                    outstanding_nacks: receiver.outstanding_nacks(),
                    bitrate_bps: entry.meter.lock().sample(now),
                }
            })
            .collect()
    }
}
