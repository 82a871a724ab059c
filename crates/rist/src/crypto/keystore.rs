// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Key material store with two live generations.
//!
//! Holds (current, pending) ciphers so key rollover never drops
//! packets: the sender announces a pending generation, keeps sealing
//! with the current one through the grace window, then promotes;
//! receivers install announced generations as pending and open against
//! whichever generation a packet names. Promotion is a single
//! `ArcSwap` store, so readers never block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::{CryptoError, PskCipher};
use crate::config::{Encryption, ROLLOVER_PACKET_THRESHOLD, ROLLOVER_TIME_THRESHOLD};

/// Fallback rollover grace when no RTT estimate exists yet (100 ms).
pub const ROLLOVER_GRACE_DEFAULT_NS: u64 = 100_000_000;

/// Activation sentinel for receiver-installed pendings: promotion is
/// driven by the unseen-window rule, not by a wall deadline.
const ACTIVATE_ON_UNSEEN: u64 = u64::MAX;

#[derive(Debug)]
struct KeyGeneration {
    generation: u8,
    cipher: PskCipher,
    created_at: u64,
}

#[derive(Debug)]
struct Slots {
    current: Arc<KeyGeneration>,
    pending: Option<Arc<KeyGeneration>>,
    /// Nanosecond deadline at which pending promotes (sender side), or
    /// [`ACTIVATE_ON_UNSEEN`] for receiver-installed pendings.
    activation_at: u64,
    /// Grace window used by the unseen-rule promotion.
    grace_ns: u64,
}

/// Two-generation key store shared by the crypto engine and peers.
pub struct KeyStore {
    passphrase: String,
    iterations: u32,
    encryption: Encryption,
    nonce_lo: u32,
    slots: ArcSwap<Slots>,
    /// Packets sealed under the current generation.
    sealed: AtomicU64,
    /// Last time a packet named the current generation on open.
    current_seen: AtomicU64,
    /// Last time a packet named the pending generation on open.
    pending_seen: AtomicU64,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("encryption", &self.encryption)
            .field("generation", &self.current_generation())
            .finish()
    }
}

impl KeyStore {
    /// Build a store keyed from `passphrase` with generation 0 current.
    pub fn new(
        passphrase: &str,
        encryption: Encryption,
        iterations: u32,
        salt: [u8; 16],
        nonce_lo: u32,
        now: u64,
    ) -> Self {
        let current = Arc::new(KeyGeneration {
            generation: 0,
            cipher: PskCipher::from_passphrase(passphrase, &salt, iterations, nonce_lo, encryption),
            created_at: now,
        });
        Self {
            passphrase: passphrase.to_string(),
            iterations,
            encryption,
            nonce_lo,
            slots: ArcSwap::from_pointee(Slots {
                current,
                pending: None,
                activation_at: 0,
                grace_ns: ROLLOVER_GRACE_DEFAULT_NS,
            }),
            sealed: AtomicU64::new(0),
            current_seen: AtomicU64::new(0),
            pending_seen: AtomicU64::new(0),
        }
    }

    pub fn encryption(&self) -> Encryption {
        self.encryption
    }

    /// Generation the next sealed packet will name.
    pub fn current_generation(&self) -> u8 {
        self.slots.load().current.generation
    }

    /// Seal `buf` in place for `seq`; returns the generation used.
    pub fn seal(&self, seq: u32, buf: &mut [u8]) -> u8 {
        let slots = self.slots.load();
        slots.current.cipher.apply(seq, buf);
        self.sealed.fetch_add(1, Ordering::Relaxed);
        slots.current.generation
    }

    /// Open `buf` in place for the generation the packet names.
    ///
    /// Tries current first, then pending, absorbing rollover skew in
    /// either direction. Unknown generations fail closed.
    pub fn open(&self, generation: u8, seq: u32, buf: &mut [u8], now: u64) -> Result<(), CryptoError> {
        let slots = self.slots.load();
        if slots.current.generation == generation {
            slots.current.cipher.apply(seq, buf);
            self.current_seen.store(now, Ordering::Relaxed);
            return Ok(());
        }
        if let Some(pending) = &slots.pending {
            if pending.generation == generation {
                pending.cipher.apply(seq, buf);
                self.pending_seen.store(now, Ordering::Relaxed);
                return Ok(());
            }
        }
        Err(CryptoError::UnknownGeneration(generation))
    }

    /// Sender-side rollover trigger: packet-count or key-age threshold,
    /// and no rollover already in flight.
    pub fn should_rollover(&self, now: u64) -> bool {
        let slots = self.slots.load();
        if slots.pending.is_some() {
            return false;
        }
        let age_ns = now.saturating_sub(slots.current.created_at);
        self.sealed.load(Ordering::Relaxed) >= ROLLOVER_PACKET_THRESHOLD
            || age_ns >= u64::from(ROLLOVER_TIME_THRESHOLD) * 1_000_000
    }

    /// Start a sender-side rollover: install generation `current + 1`
    /// as pending with a fresh salt, promoting after `grace_ns`.
    ///
    /// Returns `(generation, salt)` for the KEY_ANNOUNCE message.
    pub fn begin_rollover(&self, salt: [u8; 16], now: u64, grace_ns: u64) -> (u8, [u8; 16]) {
        let slots = self.slots.load_full();
        let generation = slots.current.generation.wrapping_add(1);
        let pending = Arc::new(KeyGeneration {
            generation,
            cipher: PskCipher::from_passphrase(
                &self.passphrase,
                &salt,
                self.iterations,
                self.nonce_lo,
                self.encryption,
            ),
            created_at: now,
        });
        log::info!(
            "[crypto] rollover started: generation {} pending, grace {} ms",
            generation,
            grace_ns / 1_000_000
        );
        self.slots.store(Arc::new(Slots {
            current: Arc::clone(&slots.current),
            pending: Some(pending),
            activation_at: now.saturating_add(grace_ns),
            grace_ns,
        }));
        (generation, salt)
    }

    /// Receiver side: install an announced generation as pending.
    ///
    /// Duplicate announcements for an already-known generation are
    /// idempotent.
    pub fn install_announced(&self, generation: u8, salt: [u8; 16], now: u64, grace_ns: u64) {
        let slots = self.slots.load_full();
        if slots.current.generation == generation
            || slots
                .pending
                .as_ref()
                .is_some_and(|p| p.generation == generation)
        {
            return;
        }
        let pending = Arc::new(KeyGeneration {
            generation,
            cipher: PskCipher::from_passphrase(
                &self.passphrase,
                &salt,
                self.iterations,
                self.nonce_lo,
                self.encryption,
            ),
            created_at: now,
        });
        log::debug!("[crypto] installed announced generation {}", generation);
        self.pending_seen.store(0, Ordering::Relaxed);
        self.slots.store(Arc::new(Slots {
            current: Arc::clone(&slots.current),
            pending: Some(pending),
            activation_at: ACTIVATE_ON_UNSEEN,
            grace_ns,
        }));
    }

    /// Periodic maintenance: promote pending to current when due.
    ///
    /// Sender pendings promote at their activation deadline. Receiver
    /// pendings promote once traffic has arrived under the new
    /// generation and the old one has gone unseen for the grace window.
    /// Returns true when a promotion happened.
    pub fn maintain(&self, now: u64) -> bool {
        let slots = self.slots.load_full();
        let Some(pending) = &slots.pending else {
            return false;
        };

        let due = if slots.activation_at == ACTIVATE_ON_UNSEEN {
            let pending_active = self.pending_seen.load(Ordering::Relaxed) != 0;
            let current_idle =
                now.saturating_sub(self.current_seen.load(Ordering::Relaxed)) >= slots.grace_ns;
            pending_active && current_idle
        } else {
            now >= slots.activation_at
        };
        if !due {
            return false;
        }

        log::info!(
            "[crypto] generation {} promoted to current",
            pending.generation
        );
        self.slots.store(Arc::new(Slots {
            current: Arc::clone(pending),
            pending: None,
            activation_at: 0,
            grace_ns: slots.grace_ns,
        }));
        self.sealed.store(0, Ordering::Relaxed);
        true
    }
}
