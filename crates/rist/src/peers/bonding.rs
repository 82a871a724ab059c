// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Bonded-link egress selection.
//!
//! Smooth weighted round-robin over the active peer set: each pick
//! adds every candidate's weight to its running credit, selects the
//! highest credit, and charges the winner the total weight. The
//! resulting schedule interleaves peers proportionally instead of
//! bursting. Peers above the loss cutoff are skipped; when every
//! candidate is above it the least-lossy one still carries traffic
//! rather than stalling the flow.

use std::collections::HashMap;

use super::PeerId;

/// One candidate as seen by the selector.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub id: PeerId,
    pub weight: u32,
    pub loss_rate: f32,
}

/// Weighted round-robin state.
#[derive(Debug, Default)]
pub struct BondingSelector {
    credit: HashMap<PeerId, i64>,
    cutoff: f32,
}

impl BondingSelector {
    pub fn new(cutoff: f32) -> Self {
        Self {
            credit: HashMap::new(),
            cutoff,
        }
    }

    /// Pick the egress peer for one packet.
    ///
    /// `candidates` must already be filtered to running peers. Returns
    /// `None` only when the slice is empty.
    pub fn select(&mut self, candidates: &[Candidate]) -> Option<PeerId> {
        if candidates.is_empty() {
            return None;
        }

        let below: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.loss_rate <= self.cutoff)
            .collect();
        let pool: Vec<&Candidate> = if below.is_empty() {
            // Everyone is lossy: degrade to the least bad peer.
            let best = candidates
                .iter()
                .min_by(|a, b| a.loss_rate.total_cmp(&b.loss_rate))?;
            vec![best]
        } else {
            below
        };

        // Zero weights participate equally once nothing outranks them.
        let effective = |c: &Candidate| i64::from(c.weight.max(1));
        let total: i64 = pool.iter().map(|c| effective(c)).sum();

        let mut winner = pool[0].id;
        let mut best_credit = i64::MIN;
        for c in &pool {
            let credit = self.credit.entry(c.id).or_insert(0);
            *credit += effective(c);
            if *credit > best_credit {
                best_credit = *credit;
                winner = c.id;
            }
        }
        if let Some(credit) = self.credit.get_mut(&winner) {
            *credit -= total;
        }
        Some(winner)
    }

    /// Drop selector state for a removed peer.
    pub fn forget(&mut self, id: PeerId) {
        self.credit.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: PeerId, weight: u32, loss: f32) -> Candidate {
        Candidate {
            id,
            weight,
            loss_rate: loss,
        }
    }

    fn tally(selector: &mut BondingSelector, candidates: &[Candidate], picks: usize) -> HashMap<PeerId, usize> {
        let mut counts = HashMap::new();
        for _ in 0..picks {
            let id = selector.select(candidates).unwrap();
            *counts.entry(id).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_empty_pool() {
        let mut sel = BondingSelector::new(0.3);
        assert_eq!(sel.select(&[]), None);
    }

    #[test]
    fn test_weights_respected() {
        let mut sel = BondingSelector::new(0.3);
        let candidates = [cand(1, 1, 0.0), cand(2, 3, 0.0)];
        let counts = tally(&mut sel, &candidates, 4000);
        // Weight 1:3 split -> ~25% / ~75%.
        assert_eq!(counts[&1], 1000);
        assert_eq!(counts[&2], 3000);
    }

    #[test]
    fn test_schedule_is_smooth() {
        let mut sel = BondingSelector::new(0.3);
        let candidates = [cand(1, 1, 0.0), cand(2, 3, 0.0)];
        // In any window of four picks, peer 1 appears exactly once.
        let picks: Vec<PeerId> = (0..12).map(|_| sel.select(&candidates).unwrap()).collect();
        for window in picks.chunks(4) {
            assert_eq!(window.iter().filter(|&&id| id == 1).count(), 1);
        }
    }

    #[test]
    fn test_lossy_peer_skipped() {
        let mut sel = BondingSelector::new(0.3);
        let candidates = [cand(1, 1, 0.5), cand(2, 1, 0.0)];
        let counts = tally(&mut sel, &candidates, 100);
        assert_eq!(counts.get(&1), None);
        assert_eq!(counts[&2], 100);
    }

    #[test]
    fn test_all_lossy_degrades_to_least_bad() {
        let mut sel = BondingSelector::new(0.3);
        let candidates = [cand(1, 1, 0.9), cand(2, 1, 0.5)];
        let counts = tally(&mut sel, &candidates, 10);
        assert_eq!(counts[&2], 10);
    }

    #[test]
    fn test_zero_weights_share_equally() {
        let mut sel = BondingSelector::new(0.3);
        let candidates = [cand(1, 0, 0.0), cand(2, 0, 0.0)];
        let counts = tally(&mut sel, &candidates, 100);
        assert_eq!(counts[&1], 50);
        assert_eq!(counts[&2], 50);
    }

    #[test]
    fn test_forget_clears_credit() {
        let mut sel = BondingSelector::new(0.3);
        let candidates = [cand(1, 1, 0.0), cand(2, 1, 0.0)];
        sel.select(&candidates);
        sel.forget(1);
        assert!(!sel.credit.contains_key(&1));
    }
}
