// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Per-peer lifecycle state machine.
//!
//! ```text
//! idle -> hs_sent -> hs_acked -> active <-> stale -> dead
//! ```
//!
//! The machine is pure: every input carries an explicit `now` and
//! transitions come back as [`PeerEvent`]s for the runtime to act on
//! (send a handshake, log, notify the auth handler). Time thresholds
//! follow the peer configuration defaults in [`crate::config`].

use crate::config::{
    DEFAULT_DEAD_TIMEOUT, HS_MAX_ATTEMPTS, HS_TIMEOUT_INITIAL, HS_TIMEOUT_MAX,
};

const MS: u64 = 1_000_000;

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    HsSent,
    HsAcked,
    Active,
    Stale,
    Dead,
}

/// Transition outputs for the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// Emit (or re-emit) a handshake request.
    SendHandshake,
    /// Peer reached active; fire the auth-connect handler.
    Connected,
    /// Peer went stale; bonding should deprioritize it.
    WentStale,
    /// Peer died; fire the auth-disconnect handler.
    Died,
}

/// The state machine proper.
#[derive(Debug, Clone)]
pub struct PeerSm {
    state: PeerState,
    last_heard: u64,
    stale_since: u64,
    hs_attempts: u32,
    hs_deadline: u64,
    /// Times the peer has dropped to stale (stats counter).
    pub stale_count: u64,
    keepalive_timeout_ns: u64,
    dead_timeout_ns: u64,
}

impl PeerSm {
    pub fn new(keepalive_timeout_ms: u32) -> Self {
        Self {
            state: PeerState::Idle,
            last_heard: 0,
            stale_since: 0,
            hs_attempts: 0,
            hs_deadline: 0,
            stale_count: 0,
            keepalive_timeout_ns: u64::from(keepalive_timeout_ms) * MS,
            dead_timeout_ns: u64::from(DEFAULT_DEAD_TIMEOUT) * MS,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == PeerState::Active
    }

    /// Active or stale peers still transmit and accept traffic.
    pub fn is_running(&self) -> bool {
        matches!(self.state, PeerState::Active | PeerState::Stale)
    }

    pub fn last_heard(&self) -> u64 {
        self.last_heard
    }

    /// First outbound intent (connect-mode peers kick off here).
    pub fn start(&mut self, now: u64) -> Vec<PeerEvent> {
        if self.state != PeerState::Idle {
            return Vec::new();
        }
        self.begin_handshake(now)
    }

    /// Any datagram arrived from this peer's address.
    pub fn on_datagram(&mut self, now: u64) -> Vec<PeerEvent> {
        self.last_heard = now;
        match self.state {
            // Hearing an unknown peer first also opens a handshake.
            PeerState::Idle => self.begin_handshake(now),
            PeerState::Stale => {
                log::debug!("[peer] stale peer recovered");
                self.state = PeerState::Active;
                Vec::new()
            }
            // A datagram after death revives through a fresh handshake.
            PeerState::Dead => {
                self.hs_attempts = 0;
                self.state = PeerState::Idle;
                self.begin_handshake(now)
            }
            _ => Vec::new(),
        }
    }

    /// Matching handshake reply received.
    pub fn on_handshake_ack(&mut self, now: u64) -> Vec<PeerEvent> {
        self.last_heard = now;
        if self.state == PeerState::HsSent {
            self.state = PeerState::HsAcked;
        }
        Vec::new()
    }

    /// Handshake request received (we are the passive side).
    pub fn on_handshake_request(&mut self, now: u64) -> Vec<PeerEvent> {
        self.last_heard = now;
        if matches!(self.state, PeerState::Idle | PeerState::HsSent) {
            self.state = PeerState::HsAcked;
        }
        Vec::new()
    }

    /// First data packet in either direction, or authenticator success.
    pub fn on_authenticated(&mut self, now: u64) -> Vec<PeerEvent> {
        self.last_heard = now;
        match self.state {
            PeerState::HsAcked => {
                self.state = PeerState::Active;
                vec![PeerEvent::Connected]
            }
            PeerState::Stale => {
                self.state = PeerState::Active;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Simple-profile peers have no handshake; they go straight to
    /// active at start.
    pub fn force_active(&mut self, now: u64) -> Vec<PeerEvent> {
        self.last_heard = now;
        if matches!(self.state, PeerState::Idle | PeerState::HsSent | PeerState::HsAcked) {
            self.state = PeerState::Active;
            return vec![PeerEvent::Connected];
        }
        Vec::new()
    }

    /// Persistent send failure (network unreachable): force stale.
    pub fn on_unreachable(&mut self, now: u64) -> Vec<PeerEvent> {
        if self.state == PeerState::Active {
            self.enter_stale(now)
        } else {
            Vec::new()
        }
    }

    /// Periodic driver: handshake retries and liveness timeouts.
    pub fn tick(&mut self, now: u64) -> Vec<PeerEvent> {
        match self.state {
            PeerState::HsSent if now >= self.hs_deadline => {
                if self.hs_attempts >= HS_MAX_ATTEMPTS {
                    log::warn!(
                        "[peer] handshake abandoned after {} attempts",
                        self.hs_attempts
                    );
                    self.state = PeerState::Dead;
                    return vec![PeerEvent::Died];
                }
                self.arm_handshake(now);
                vec![PeerEvent::SendHandshake]
            }
            PeerState::Active
                if now.saturating_sub(self.last_heard) >= self.keepalive_timeout_ns =>
            {
                self.enter_stale(now)
            }
            PeerState::Stale
                if now.saturating_sub(self.stale_since) >= self.dead_timeout_ns =>
            {
                log::warn!("[peer] stale peer declared dead");
                self.state = PeerState::Dead;
                vec![PeerEvent::Died]
            }
            _ => Vec::new(),
        }
    }

    fn begin_handshake(&mut self, now: u64) -> Vec<PeerEvent> {
        self.state = PeerState::HsSent;
        self.hs_attempts = 0;
        self.arm_handshake(now);
        vec![PeerEvent::SendHandshake]
    }

    fn arm_handshake(&mut self, now: u64) {
        // Exponential backoff: 1s, 2s, 4s, 8s, 8s.
        let backoff_ms =
            (HS_TIMEOUT_INITIAL << self.hs_attempts.min(3)).min(HS_TIMEOUT_MAX);
        self.hs_attempts += 1;
        self.hs_deadline = now + u64::from(backoff_ms) * MS;
    }

    fn enter_stale(&mut self, now: u64) -> Vec<PeerEvent> {
        log::debug!("[peer] peer went stale");
        self.state = PeerState::Stale;
        self.stale_since = now;
        self.stale_count += 1;
        vec![PeerEvent::WentStale]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000 * MS;

    fn machine() -> PeerSm {
        PeerSm::new(700)
    }

    fn activate(sm: &mut PeerSm, now: u64) {
        sm.start(now);
        sm.on_handshake_ack(now + MS);
        sm.on_authenticated(now + 2 * MS);
        assert!(sm.is_active());
    }

    #[test]
    fn test_happy_path_to_active() {
        let mut sm = machine();
        assert_eq!(sm.start(0), vec![PeerEvent::SendHandshake]);
        assert_eq!(sm.state(), PeerState::HsSent);

        assert!(sm.on_handshake_ack(MS).is_empty());
        assert_eq!(sm.state(), PeerState::HsAcked);

        assert_eq!(sm.on_authenticated(2 * MS), vec![PeerEvent::Connected]);
        assert_eq!(sm.state(), PeerState::Active);
    }

    #[test]
    fn test_passive_side_handshake() {
        let mut sm = machine();
        sm.on_handshake_request(0);
        assert_eq!(sm.state(), PeerState::HsAcked);
        assert_eq!(sm.on_authenticated(MS), vec![PeerEvent::Connected]);
    }

    #[test]
    fn test_handshake_retry_backoff() {
        let mut sm = machine();
        sm.start(0);
        // 1s timeout, then retry with doubled backoff.
        assert!(sm.tick(SEC - 1).is_empty());
        assert_eq!(sm.tick(SEC), vec![PeerEvent::SendHandshake]);
        // Second deadline is 2s later.
        assert!(sm.tick(SEC + 2 * SEC - 1).is_empty());
        assert_eq!(sm.tick(3 * SEC), vec![PeerEvent::SendHandshake]);
    }

    #[test]
    fn test_handshake_gives_up_after_budget() {
        let mut sm = machine();
        sm.start(0);
        let mut now = 0;
        let mut died = false;
        // Drive far past every backoff; the machine must die exactly once.
        for _ in 0..10 {
            now += 10 * SEC;
            let events = sm.tick(now);
            if events.contains(&PeerEvent::Died) {
                died = true;
                break;
            }
        }
        assert!(died);
        assert_eq!(sm.state(), PeerState::Dead);
    }

    #[test]
    fn test_active_times_out_to_stale() {
        let mut sm = machine();
        activate(&mut sm, 0);
        // keepalive_timeout = 700 ms from construction.
        assert!(sm.tick(2 * MS + 700 * MS - 1).is_empty());
        assert_eq!(sm.tick(2 * MS + 700 * MS), vec![PeerEvent::WentStale]);
        assert_eq!(sm.state(), PeerState::Stale);
        assert_eq!(sm.stale_count, 1);
    }

    #[test]
    fn test_stale_recovers_on_datagram() {
        let mut sm = machine();
        activate(&mut sm, 0);
        sm.tick(SEC);
        assert_eq!(sm.state(), PeerState::Stale);
        sm.on_datagram(SEC + MS);
        assert_eq!(sm.state(), PeerState::Active);
    }

    #[test]
    fn test_stale_dies_after_dead_timeout() {
        let mut sm = machine();
        activate(&mut sm, 0);
        sm.tick(SEC); // -> stale at 1s
        assert!(sm.tick(SEC + 30 * SEC - 1).is_empty());
        assert_eq!(sm.tick(SEC + 30 * SEC), vec![PeerEvent::Died]);
    }

    #[test]
    fn test_flap_does_not_reconnect() {
        // active -> stale -> active must not refire Connected.
        let mut sm = machine();
        activate(&mut sm, 0);
        sm.tick(SEC);
        let events = sm.on_datagram(SEC + MS);
        assert!(events.is_empty());
        assert!(sm.on_authenticated(SEC + 2 * MS).is_empty());
    }

    #[test]
    fn test_dead_revives_via_new_handshake() {
        let mut sm = machine();
        activate(&mut sm, 0);
        sm.tick(SEC);
        sm.tick(SEC + 31 * SEC);
        assert_eq!(sm.state(), PeerState::Dead);
        assert_eq!(
            sm.on_datagram(SEC + 32 * SEC),
            vec![PeerEvent::SendHandshake]
        );
        assert_eq!(sm.state(), PeerState::HsSent);
    }
}
