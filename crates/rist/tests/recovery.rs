// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Loss-recovery scenarios over a simulated link with virtual time.
//!
//! The harness wires a `FlowSender` to a `FlowReceiver` through an
//! event queue modelling one-way delay and scripted loss, stepping a
//! millisecond per tick. No sockets, no sleeping: the engines take
//! explicit timestamps, so every scenario is deterministic.

use rist::config::{ContextConfig, PeerConfig};
use rist::protocol::{DataPacket, NackMsg};
use rist::receive::{Egress, FlowReceiver};
use rist::send::FlowSender;

const MS: u64 = 1_000_000;
const FLOW: u32 = 0x4000;

/// Scripted one-way link with loss and delay.
struct SimLink {
    tx: FlowSender,
    rx: FlowReceiver,
    /// One-way delay in ms (RTT = 2x).
    delay_ms: u64,
    /// Packets in flight toward the receiver.
    to_rx: Vec<(u64, DataPacket)>,
    /// NACKs in flight toward the sender.
    to_tx: Vec<(u64, NackMsg)>,
    /// Sequences the link eats, with a per-seq budget (u32::MAX = always).
    drops: Vec<(u32, u32)>,
    delivered: Vec<u32>,
    holes: Vec<u32>,
    nacks_seen: Vec<NackMsg>,
}

impl SimLink {
    fn new(rtt_ms: u64) -> Self {
        let peer = PeerConfig {
            address: "203.0.113.1:1968".into(),
            recovery_maxbitrate: 0,
            ..PeerConfig::default()
        };
        let ctx = ContextConfig::default();
        Self {
            tx: FlowSender::new(FLOW, &peer, &ctx, 0),
            rx: FlowReceiver::new(FLOW, &peer),
            delay_ms: rtt_ms / 2,
            to_rx: Vec::new(),
            to_tx: Vec::new(),
            drops: Vec::new(),
            delivered: Vec::new(),
            holes: Vec::new(),
            nacks_seen: Vec::new(),
        }
    }

    fn drop_seq(&mut self, seq: u32) {
        self.drops.push((seq, 1));
    }

    fn drop_seq_always(&mut self, seq: u32) {
        self.drops.push((seq, u32::MAX));
    }

    fn should_drop(&mut self, seq: u32) -> bool {
        for entry in &mut self.drops {
            if entry.0 == seq && entry.1 > 0 {
                if entry.1 != u32::MAX {
                    entry.1 -= 1;
                }
                return true;
            }
        }
        false
    }

    fn send(&mut self, payload: &[u8], now: u64) {
        let pkt = self.tx.write(payload, 0, now).expect("write");
        self.transmit(pkt, now);
    }

    fn transmit(&mut self, pkt: DataPacket, now: u64) {
        if self.should_drop(pkt.seq) {
            return;
        }
        self.to_rx.push((now + self.delay_ms * MS, pkt));
    }

    fn collect(&mut self, egress: Vec<Egress>) {
        for item in egress {
            match item {
                Egress::Deliver(p) => self.delivered.push(p.seq),
                Egress::Hole { seq } => self.holes.push(seq),
            }
        }
    }

    /// Advance one millisecond of virtual time.
    fn step(&mut self, now: u64) {
        // Deliver link traffic that arrived by now.
        let mut arrivals = Vec::new();
        self.to_rx.retain(|(at, pkt)| {
            if *at <= now {
                arrivals.push(pkt.clone());
                false
            } else {
                true
            }
        });
        for pkt in arrivals {
            let egress = self.rx.on_packet(pkt, now);
            self.collect(egress);
        }

        let mut nacks = Vec::new();
        self.to_tx.retain(|(at, msg)| {
            if *at <= now {
                nacks.push(msg.clone());
                false
            } else {
                true
            }
        });
        for msg in nacks {
            for pkt in self.tx.on_nack(&msg, now) {
                self.transmit(pkt, now);
            }
        }

        // Periodic work on both ends.
        self.tx.tick(now);
        let (egress, nack) = self.rx.tick(now, 2 * self.delay_ms * MS);
        self.collect(egress);
        if let Some(msg) = nack {
            self.nacks_seen.push(msg.clone());
            self.to_tx.push((now + self.delay_ms * MS, msg));
        }
    }

    fn run(&mut self, from_ms: u64, to_ms: u64) {
        for t in from_ms..to_ms {
            self.step(t * MS);
        }
    }
}

#[test]
fn clean_path_delivers_everything_in_order() {
    // S1: zero loss, RTT 20 ms. Five packets per simulated millisecond.
    let mut link = SimLink::new(20);
    let payload = vec![0x47u8; 1316];
    let total: u32 = 10_000;

    let mut sent = 0u32;
    let mut t = 0u64;
    while sent < total {
        for _ in 0..5 {
            link.send(&payload, t * MS);
            sent += 1;
        }
        link.step(t * MS);
        t += 1;
    }
    link.run(t, t + 200);

    assert_eq!(link.delivered.len(), total as usize);
    assert!(link.delivered.windows(2).all(|w| w[0] < w[1]), "out of order");
    assert!(link.holes.is_empty());
    assert_eq!(link.tx.stats.retransmits_sent, 0, "spurious retransmits");
    assert!(link.nacks_seen.is_empty(), "spurious NACKs");
}

#[test]
fn single_loss_recovers_via_nack() {
    // S2: drop sequence 500 once.
    let mut link = SimLink::new(20);
    link.drop_seq(500);
    let payload = vec![0x47u8; 188];

    for t in 0..1000u64 {
        link.send(&payload, t * MS);
        link.step(t * MS);
    }
    link.run(1000, 1500);

    assert_eq!(link.delivered.len(), 1000);
    assert!(link.delivered.windows(2).all(|w| w[0] < w[1]));
    assert!(link.holes.is_empty(), "loss was not recovered");
    assert_eq!(link.tx.stats.retransmits_sent, 1);

    // The first NACK went out within the reorder/rtt-min horizon plus
    // one aggregation period.
    let nacked: Vec<u32> = link.nacks_seen.iter().flat_map(|m| m.sequences()).collect();
    assert_eq!(nacked, vec![500]);
}

#[test]
fn burst_loss_recovers_with_one_bitmap() {
    // S3: sixteen consecutive losses.
    let mut link = SimLink::new(20);
    for seq in 1000..1016 {
        link.drop_seq(seq);
    }
    let payload = vec![0x47u8; 188];

    for t in 0..2000u64 {
        link.send(&payload, t * MS);
        link.step(t * MS);
    }
    link.run(2000, 2500);

    assert_eq!(link.delivered.len(), 2000);
    assert!(link.holes.is_empty());
    assert_eq!(link.tx.stats.retransmits_sent, 16);

    // The burst fits one bitmap and that is what went out first.
    match &link.nacks_seen[0] {
        NackMsg::Bitmap { base, mask } => {
            assert_eq!(*base, 1000);
            assert_eq!(*mask, 0x7FFF);
        }
        NackMsg::Range(pairs) => panic!("expected bitmap, got ranges {:?}", pairs),
    }
}

#[test]
fn permanent_loss_surfaces_hole_and_stops_nacking() {
    // S4: sequence 2000 never arrives, retransmits included.
    let mut link = SimLink::new(20);
    link.drop_seq_always(2000);
    let payload = vec![0x47u8; 188];

    for t in 0..3000u64 {
        link.send(&payload, t * MS);
        link.step(t * MS);
    }
    link.run(3000, 5000);

    assert_eq!(link.delivered.len(), 2999);
    assert_eq!(link.holes, vec![2000]);
    assert!(link.delivered.windows(2).all(|w| w[0] < w[1]));

    // NACK budget: default max_retries = 7.
    let requests = link
        .nacks_seen
        .iter()
        .flat_map(|m| m.sequences())
        .filter(|&s| s == 2000)
        .count();
    assert!(requests <= 7, "NACKed {} times past the budget", requests);
    assert!(requests >= 2, "permanent loss was barely chased");
}

#[test]
fn random_loss_preserves_every_invariant() {
    // Property 5: under 20% random loss everything is recovered or an
    // explicit hole; delivery is strictly monotonic; nothing invented.
    fastrand::seed(7);
    let mut link = SimLink::new(20);
    let payload = vec![0x47u8; 188];
    let total = 5_000u32;

    let mut next_drop_check = 0u32;
    for t in 0..u64::from(total) {
        if fastrand::u32(0..100) < 20 {
            link.drop_seq(next_drop_check);
        }
        next_drop_check += 1;
        link.send(&payload, t * MS);
        link.step(t * MS);
    }
    link.run(u64::from(total), u64::from(total) + 2000);

    // Monotonic, no duplicates.
    assert!(link.delivered.windows(2).all(|w| w[0] < w[1]));
    // Everything is accounted for exactly once.
    let mut all: Vec<u32> = link.delivered.iter().chain(link.holes.iter()).copied().collect();
    all.sort_unstable();
    assert_eq!(all, (0..total).collect::<Vec<_>>());
    // With retransmission the hole rate sits far below the loss rate.
    assert!(
        (link.holes.len() as f64) < f64::from(total) * 0.02,
        "{} holes is too many for recoverable loss",
        link.holes.len()
    );
}

#[test]
fn duplicate_arrivals_deliver_once() {
    // Property 7: idempotence under duplicated datagrams.
    let mut link = SimLink::new(20);
    let payload = vec![0x47u8; 188];

    for t in 0..100u64 {
        let pkt = link.tx.write(&payload, 0, t * MS).expect("write");
        link.transmit(pkt.clone(), t * MS);
        link.transmit(pkt, t * MS); // bonded second path
        link.step(t * MS);
    }
    link.run(100, 200);

    assert_eq!(link.delivered.len(), 100);
    assert!(link.delivered.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn nack_cadence_is_bounded() {
    // Property 4: one aggregated NACK per nack_period at most.
    let mut link = SimLink::new(20);
    link.drop_seq_always(10);
    link.drop_seq_always(50);
    let payload = vec![0x47u8; 188];

    for t in 0..200u64 {
        link.send(&payload, t * MS);
        link.step(t * MS);
    }
    // 200 ms window, 10 ms period: at most 20 emissions.
    assert!(
        link.nacks_seen.len() <= 20,
        "{} NACK messages in 200 ms",
        link.nacks_seen.len()
    );
}

#[test]
fn sequence_wrap_is_transparent() {
    // Boundary: delivery across 0xFFFFFFFF -> 0x00000000 with loss on
    // both sides of the wrap.
    let peer = PeerConfig {
        address: "203.0.113.1:1968".into(),
        recovery_maxbitrate: 0,
        ..PeerConfig::default()
    };
    let mut link = SimLink::new(20);
    link.tx = FlowSender::new(FLOW, &peer, &ContextConfig::default(), 0);
    // Re-anchor the sender just below the wrap.
    let start = 0xFFFF_FFF0u32;
    let first = link
        .tx
        .write_with_seq(&[0u8; 188], 0, 0, Some(start))
        .expect("write");
    link.transmit(first, 0);
    link.drop_seq(0xFFFF_FFFE);
    link.drop_seq(0x0000_0001);

    for t in 1..64u64 {
        link.send(&[0u8; 188], t * MS);
        link.step(t * MS);
    }
    link.run(64, 600);

    assert_eq!(link.delivered.len(), 64);
    assert!(link.holes.is_empty(), "wrap losses were not recovered");
    // Serial order across the wrap.
    for w in link.delivered.windows(2) {
        assert_eq!(w[1], w[0].wrapping_add(1), "gap at {:#x} -> {:#x}", w[0], w[1]);
    }
    assert!(link.delivered.contains(&0xFFFF_FFFF));
    assert!(link.delivered.contains(&0x0000_0000));
}

#[test]
fn empty_loss_set_emits_no_nack() {
    // Boundary: a clean stream never emits a NACK datagram.
    let mut link = SimLink::new(20);
    for t in 0..500u64 {
        link.send(&[0u8; 188], t * MS);
        link.step(t * MS);
    }
    assert!(link.nacks_seen.is_empty());
}
