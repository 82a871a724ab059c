// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Payload encryption: PBKDF2-derived AES-CTR keys with seamless
//! generation rollover, plus the optional EAP-SRP authenticator that
//! produces the shared passphrase.

mod keystore;
mod psk;
#[cfg(feature = "srp")]
pub mod srp;

pub use keystore::{KeyStore, ROLLOVER_GRACE_DEFAULT_NS};
pub use psk::{derive_key, PskCipher};

/// Crypto-layer failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// No key material installed for the packet's generation.
    UnknownGeneration(u8),
    /// Payload failed the post-decrypt sanity check.
    DecryptFailed,
    /// Operation requires encryption but none is configured.
    NoKey,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::UnknownGeneration(g) => write!(f, "no key for generation {}", g),
            CryptoError::DecryptFailed => write!(f, "decrypt failed"),
            CryptoError::NoKey => write!(f, "no key material configured"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Sliding-window decrypt-failure monitor.
///
/// Individual failures are dropped silently (counter only); once the
/// failure count inside the window crosses the threshold the monitor
/// reports an alarm, which the dispatcher surfaces as `AuthAlarm` on
/// the stats callback.
#[derive(Debug)]
pub struct FailureMonitor {
    window_ns: u64,
    threshold: u32,
    window_start: u64,
    in_window: u32,
    /// Lifetime failure count, for stats.
    pub total: u64,
}

impl FailureMonitor {
    pub fn new(window_ns: u64, threshold: u32) -> Self {
        Self {
            window_ns,
            threshold,
            window_start: 0,
            in_window: 0,
            total: 0,
        }
    }

    /// Record one failure; returns true when the alarm threshold is hit.
    pub fn record(&mut self, now: u64) -> bool {
        self.total += 1;
        if now.saturating_sub(self.window_start) > self.window_ns {
            self.window_start = now;
            self.in_window = 0;
        }
        self.in_window += 1;
        if self.in_window == self.threshold {
            log::warn!(
                "[crypto] {} decrypt failures within window, raising auth alarm",
                self.in_window
            );
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_silent_below_threshold() {
        let mut mon = FailureMonitor::new(1_000_000_000, 5);
        for _ in 0..4 {
            assert!(!mon.record(100));
        }
        assert_eq!(mon.total, 4);
    }

    #[test]
    fn test_monitor_alarm_at_threshold() {
        let mut mon = FailureMonitor::new(1_000_000_000, 3);
        assert!(!mon.record(0));
        assert!(!mon.record(1));
        assert!(mon.record(2));
        // Only fires once per window.
        assert!(!mon.record(3));
    }

    #[test]
    fn test_monitor_window_reset() {
        let mut mon = FailureMonitor::new(1_000, 2);
        assert!(!mon.record(0));
        // New window: count restarts.
        assert!(!mon.record(5_000));
        assert!(mon.record(5_001));
    }
}
