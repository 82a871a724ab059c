// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Bonded-link scenarios: weighted distribution, lossy-path recovery,
//! and single-delivery merge at the receiver.

use rist::config::{ContextConfig, PeerConfig};
use rist::peers::{BondingSelector, Candidate};
use rist::protocol::{DataPacket, NackMsg};
use rist::receive::{Egress, FlowReceiver};
use rist::send::FlowSender;

const MS: u64 = 1_000_000;
const FLOW: u32 = 0x6000;

fn peer_config() -> PeerConfig {
    PeerConfig {
        address: "203.0.113.1:1968".into(),
        recovery_maxbitrate: 0,
        ..PeerConfig::default()
    }
}

/// Two one-way paths feeding one receiver, with per-path loss.
struct Bond {
    tx: FlowSender,
    rx: FlowReceiver,
    selector: BondingSelector,
    /// (arrival, packet) per path; path 0 is lossy in the scenario.
    in_flight: Vec<(u64, DataPacket)>,
    nacks: Vec<(u64, NackMsg)>,
    loss_pct: [u32; 2],
    weights: [u32; 2],
    sent_via: [u64; 2],
    delivered: Vec<u32>,
    holes: Vec<u32>,
}

impl Bond {
    fn new(weights: [u32; 2], loss_pct: [u32; 2]) -> Self {
        let cfg = peer_config();
        let mut selector = BondingSelector::new(0.30);
        // Prime the selector state so the weights are in play.
        let _ = selector.select(&[
            Candidate { id: 0, weight: weights[0], loss_rate: 0.0 },
            Candidate { id: 1, weight: weights[1], loss_rate: 0.0 },
        ]);
        Self {
            tx: FlowSender::new(FLOW, &cfg, &ContextConfig::default(), 0),
            rx: FlowReceiver::new(FLOW, &cfg),
            selector,
            in_flight: Vec::new(),
            nacks: Vec::new(),
            loss_pct,
            sent_via: [0, 0],
            delivered: Vec::new(),
            holes: Vec::new(),
            weights,
        }
    }

    fn transmit(&mut self, pkt: DataPacket, now: u64) {
        let candidates = [
            Candidate { id: 0, weight: self.weights[0], loss_rate: 0.0 },
            Candidate { id: 1, weight: self.weights[1], loss_rate: 0.0 },
        ];
        let path = self.selector.select(&candidates).expect("bond nonempty") as usize;
        self.sent_via[path] += 1;
        if fastrand::u32(0..100) < self.loss_pct[path] {
            return;
        }
        self.in_flight.push((now + 10 * MS, pkt));
    }

    fn step(&mut self, now: u64) {
        let mut arrivals = Vec::new();
        self.in_flight.retain(|(at, pkt)| {
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

        let mut due = Vec::new();
        self.nacks.retain(|(at, msg)| {
            if *at <= now {
                due.push(msg.clone());
                false
            } else {
                true
            }
        });
        for msg in due {
            for pkt in self.tx.on_nack(&msg, now) {
                self.transmit(pkt, now);
            }
        }

        self.tx.tick(now);
        let (egress, nack) = self.rx.tick(now, 20 * MS);
        self.collect(egress);
        if let Some(msg) = nack {
            self.nacks.push((now + 10 * MS, msg));
        }
    }

    fn collect(&mut self, egress: Vec<Egress>) {
        for item in egress {
            match item {
                Egress::Deliver(p) => self.delivered.push(p.seq),
                Egress::Hole { seq } => self.holes.push(seq),
            }
        }
    }
}

#[test]
fn weighted_split_and_lossy_path_recovery() {
    // S5: weights 1 and 3, path 0 at 20% random loss.
    fastrand::seed(11);
    let mut bond = Bond::new([1, 3], [20, 0]);
    let total = 4_000u32;

    for t in 0..u64::from(total) {
        let pkt = bond.tx.write(&[0x47u8; 188], 0, t * MS).expect("write");
        bond.transmit(pkt, t * MS);
        bond.step(t * MS);
    }
    for t in u64::from(total)..u64::from(total) + 2000 {
        bond.step(t * MS);
    }

    // ~75% of originals (plus some retransmits) rode the weight-3 path.
    let share = bond.sent_via[1] as f64 / (bond.sent_via[0] + bond.sent_via[1]) as f64;
    assert!(
        (0.70..=0.80).contains(&share),
        "weight-3 path carried {:.1}%",
        share * 100.0
    );

    // Losses on the weak path were recovered by NACKs.
    assert!(bond.tx.stats.retransmits_sent > 0);
    assert!(
        bond.holes.len() < 20,
        "{} holes survived bonding recovery",
        bond.holes.len()
    );

    // Exactly-once, in-order delivery despite the merge.
    assert!(bond.delivered.windows(2).all(|w| w[0] < w[1]));
    let mut all: Vec<u32> = bond
        .delivered
        .iter()
        .chain(bond.holes.iter())
        .copied()
        .collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len() as u32, total, "sequence accounted more than once");
}

#[test]
fn cutoff_diverts_traffic_off_a_bad_path() {
    let mut selector = BondingSelector::new(0.30);
    let healthy_only = [
        Candidate { id: 0, weight: 1, loss_rate: 0.45 },
        Candidate { id: 1, weight: 1, loss_rate: 0.01 },
    ];
    for _ in 0..50 {
        assert_eq!(selector.select(&healthy_only), Some(1));
    }
}

#[test]
fn duplicate_arrivals_from_both_paths_merge() {
    // Both paths carry every packet (aggressive redundancy): the
    // receiver must still deliver exactly once, in order.
    let cfg = peer_config();
    let mut tx = FlowSender::new(FLOW, &cfg, &ContextConfig::default(), 0);
    let mut rx = FlowReceiver::new(FLOW, &cfg);
    let mut delivered = Vec::new();

    for t in 0..500u64 {
        let pkt = tx.write(&[0u8; 188], 0, t * MS).expect("write");
        for copy in [pkt.clone(), pkt] {
            for item in rx.on_packet(copy, t * MS) {
                if let Egress::Deliver(p) = item {
                    delivered.push(p.seq);
                }
            }
        }
    }

    assert_eq!(delivered.len(), 500);
    assert!(delivered.windows(2).all(|w| w[0] < w[1]));
}
