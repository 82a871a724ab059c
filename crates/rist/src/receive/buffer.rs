// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Per-flow recovery buffer.
//!
//! A ring addressed by sequence modulo capacity. Each slot is empty, a
//! missing placeholder awaiting retransmission, or a present packet.
//! Egress is strictly in sequence order: the read cursor only advances
//! by delivering a present packet or by surfacing a hole once the
//! recovery window has elapsed (or bloat mitigation gave the slot up).
//!
//! Invariants maintained here:
//! - a sequence is written at most once; duplicates are counted and
//!   dropped
//! - `read_cursor <= write_cursor` in 32-bit serial order
//! - a missing slot lives at most `recovery_length_max` from the
//!   moment the gap was revealed
//! - delivered sequences are strictly monotonically increasing

use std::collections::VecDeque;

use crate::protocol::seq::{seq_after, seq_distance};
use crate::protocol::DataPacket;

/// What happened to an inserted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// Advanced the write cursor (possibly opening gaps).
    Fresh { gaps_opened: u32 },
    /// Filled a missing placeholder.
    Recovered,
    /// Sequence already present.
    Duplicate,
    /// Sequence behind the read cursor.
    Stale,
}

/// One in-order egress item.
#[derive(Debug, Clone, PartialEq)]
pub enum Egress {
    Deliver(DataPacket),
    /// The sequence was never recovered inside the window.
    Hole { seq: u32 },
}

#[derive(Debug)]
enum Slot {
    Empty,
    Missing {
        seq: u32,
        /// When the gap was revealed (placeholder creation).
        first_missing_at: u64,
        /// Next NACK emission for this slot.
        nack_due: u64,
        nack_count: u32,
        /// Bloat mitigation declared this slot unrecoverable.
        gone: bool,
    },
    Present {
        pkt: DataPacket,
    },
}

/// Running counters, published through the flow stats.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferStats {
    pub delivered: u64,
    pub recovered: u64,
    pub holes: u64,
    pub duplicates: u64,
    pub stale_drops: u64,
    pub overflow_drops: u64,
}

/// The recovery ring.
#[derive(Debug)]
pub struct RecoveryBuffer {
    slots: Vec<Slot>,
    mask: usize,
    read_cursor: u32,
    write_cursor: u32,
    primed: bool,
    /// Missing placeholders currently outstanding (excludes gone).
    outstanding: usize,
    /// Egress forced out by overflow handling, drained first.
    forced: VecDeque<Egress>,
    recovery_max_ns: u64,
    /// First-NACK delay: max(reorder_buffer, rtt_min).
    first_nack_delay_ns: u64,
    pub stats: BufferStats,
}

impl RecoveryBuffer {
    /// `capacity` must be a power of two (see `PeerConfig::recovery_slots`).
    pub fn new(capacity: usize, recovery_max_ns: u64, first_nack_delay_ns: u64) -> Self {
        let capacity = capacity.next_power_of_two();
        Self {
            slots: (0..capacity).map(|_| Slot::Empty).collect(),
            mask: capacity - 1,
            read_cursor: 0,
            write_cursor: 0,
            primed: false,
            outstanding: 0,
            forced: VecDeque::new(),
            recovery_max_ns,
            first_nack_delay_ns,
            stats: BufferStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Sequences between the cursors (buffer occupancy).
    pub fn in_flight(&self) -> u32 {
        if self.primed {
            seq_distance(self.write_cursor, self.read_cursor)
        } else {
            0
        }
    }

    /// Missing placeholders still being chased.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn next_seq(&self) -> u32 {
        self.read_cursor
    }

    #[inline]
    fn idx(&self, seq: u32) -> usize {
        (seq as usize) & self.mask
    }

    /// Insert a decoded packet.
    pub fn insert(&mut self, pkt: DataPacket, now: u64) -> Insert {
        let seq = pkt.seq;
        if !self.primed {
            self.primed = true;
            self.read_cursor = seq;
            self.write_cursor = seq.wrapping_add(1);
            let at = self.idx(seq);
            self.slots[at] = Slot::Present { pkt };
            return Insert::Fresh { gaps_opened: 0 };
        }

        if seq_after(self.read_cursor, seq) {
            self.stats.stale_drops += 1;
            return Insert::Stale;
        }

        if seq_after(self.write_cursor, seq) || seq == self.write_cursor {
            if seq == self.write_cursor {
                // Contiguous next packet.
                self.make_room_for(seq);
                self.write_cursor = seq.wrapping_add(1);
                let at = self.idx(seq);
                self.slots[at] = Slot::Present { pkt };
                return Insert::Fresh { gaps_opened: 0 };
            }
            // Inside the window: duplicate or gap fill.
            let at = self.idx(seq);
            match &self.slots[at] {
                Slot::Present { .. } => {
                    self.stats.duplicates += 1;
                    Insert::Duplicate
                }
                Slot::Missing { gone, .. } => {
                    if !*gone {
                        self.outstanding -= 1;
                    }
                    self.stats.recovered += 1;
                    self.slots[at] = Slot::Present { pkt };
                    Insert::Recovered
                }
                Slot::Empty => {
                    // A hole already surfaced for this slot; late arrival.
                    self.stats.stale_drops += 1;
                    Insert::Stale
                }
            }
        } else {
            // Forward jump: open placeholders for the gap.
            let mut gaps = seq_distance(seq, self.write_cursor);
            if gaps as usize >= self.capacity() {
                // The jump exceeds one ring revolution: flush what we
                // have and re-anchor at the new sequence.
                while let Some(item) = self.pop_front(true) {
                    if matches!(item, Egress::Hole { .. }) {
                        self.stats.overflow_drops += 1;
                    }
                    self.forced.push_back(item);
                }
                log::warn!(
                    "[recovery] sequence jump of {} exceeds buffer of {}, re-anchoring",
                    gaps,
                    self.capacity()
                );
                self.stats.overflow_drops += u64::from(gaps);
                self.read_cursor = seq;
                self.write_cursor = seq;
                gaps = 0;
            } else {
                self.make_room_for(seq);
            }
            let mut cursor = self.write_cursor;
            while cursor != seq {
                let at = self.idx(cursor);
                self.slots[at] = Slot::Missing {
                    seq: cursor,
                    first_missing_at: now,
                    nack_due: now + self.first_nack_delay_ns,
                    nack_count: 0,
                    gone: false,
                };
                self.outstanding += 1;
                cursor = cursor.wrapping_add(1);
            }
            let at = self.idx(seq);
            self.slots[at] = Slot::Present { pkt };
            self.write_cursor = seq.wrapping_add(1);
            Insert::Fresh { gaps_opened: gaps }
        }
    }

    /// Force room so `seq` fits inside one ring revolution, surfacing
    /// whatever falls off the front as forced egress.
    fn make_room_for(&mut self, seq: u32) {
        while seq_distance(seq, self.read_cursor) as usize >= self.capacity() {
            match self.pop_front(true) {
                Some(item) => {
                    if matches!(item, Egress::Hole { .. }) {
                        self.stats.overflow_drops += 1;
                    }
                    self.forced.push_back(item);
                }
                None => break,
            }
        }
    }

    /// Drain everything deliverable in order.
    pub fn egress(&mut self, now: u64) -> Vec<Egress> {
        let mut out: Vec<Egress> = self.forced.drain(..).collect();
        while self.read_cursor != self.write_cursor {
            let at = self.idx(self.read_cursor);
            let expire = match &self.slots[at] {
                Slot::Present { .. } => true,
                Slot::Missing {
                    first_missing_at,
                    gone,
                    ..
                } => *gone || now >= first_missing_at.saturating_add(self.recovery_max_ns),
                Slot::Empty => true,
            };
            if !expire {
                break;
            }
            if let Some(item) = self.pop_front(false) {
                out.push(item);
            }
        }
        out
    }

    /// Pop the slot under the read cursor unconditionally.
    ///
    /// `forced` marks overflow evictions (counted separately from
    /// window-expiry holes).
    fn pop_front(&mut self, forced: bool) -> Option<Egress> {
        if self.read_cursor == self.write_cursor {
            return None;
        }
        let seq = self.read_cursor;
        let at = self.idx(seq);
        let slot = std::mem::replace(&mut self.slots[at], Slot::Empty);
        self.read_cursor = seq.wrapping_add(1);
        match slot {
            Slot::Present { pkt } => {
                self.stats.delivered += 1;
                Some(Egress::Deliver(pkt))
            }
            Slot::Missing { gone, .. } => {
                if !gone {
                    self.outstanding -= 1;
                }
                if !forced {
                    self.stats.holes += 1;
                }
                Some(Egress::Hole { seq })
            }
            Slot::Empty => Some(Egress::Hole { seq }),
        }
    }

    /// Collect sequences whose NACK timer expired, advancing each
    /// slot's schedule by `retry_interval_ns` (max(rtt, rtt_min)).
    ///
    /// Slots that exhausted `max_retries` stop being reported and wait
    /// for the window deadline.
    pub fn due_nacks(&mut self, now: u64, retry_interval_ns: u64, max_retries: u32) -> Vec<u32> {
        if self.outstanding == 0 {
            return Vec::new();
        }
        let mut due = Vec::new();
        let mut cursor = self.read_cursor;
        while cursor != self.write_cursor {
            let at = self.idx(cursor);
            if let Slot::Missing {
                seq,
                nack_due,
                nack_count,
                gone,
                ..
            } = &mut self.slots[at]
            {
                if !*gone && *nack_count < max_retries && now >= *nack_due {
                    due.push(*seq);
                    *nack_count += 1;
                    *nack_due = now + retry_interval_ns;
                }
            }
            cursor = cursor.wrapping_add(1);
        }
        due
    }

    /// Bloat mitigation: declare the newest missing placeholder gone.
    ///
    /// Gone slots surface as holes on the next egress pass and stop
    /// consuming NACK budget.
    pub fn give_up(&mut self, seq: u32) {
        let at = self.idx(seq);
        if let Slot::Missing {
            seq: slot_seq,
            gone,
            ..
        } = &mut self.slots[at]
        {
            if *slot_seq == seq && !*gone {
                *gone = true;
                self.outstanding -= 1;
            }
        }
    }

    /// Hard-limit drain: advance the read cursor (holes included)
    /// until outstanding placeholders drop to `target`.
    pub fn drain_to(&mut self, target: usize) -> Vec<Egress> {
        let mut out = Vec::new();
        while self.outstanding > target {
            match self.pop_front(true) {
                Some(item) => {
                    if matches!(item, Egress::Hole { .. }) {
                        self.stats.overflow_drops += 1;
                    }
                    out.push(item);
                }
                None => break,
            }
        }
        out
    }
}
