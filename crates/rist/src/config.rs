// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Global configuration: protocol constants, tuning defaults, and the
//! per-peer configuration record.
//!
//! All durations are milliseconds unless the name says otherwise. The
//! defaults follow the protocol profile defaults; everything is
//! overridable through `rist://` URL parameters (see [`crate::url`]) or
//! the [`PeerConfig`] builder methods.

/// Maximum media payload per datagram (seven 188-byte MPEG-TS cells).
///
/// The encoder enforces `payload_len <= max_packet_size` and keeps the
/// emitted datagram within `max_packet_size + HEADER_OVERHEAD_MAX`.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1316;

/// Worst-case framing overhead on top of the media payload
/// (tunnel header + data sub-header + NPD map).
pub const HEADER_OVERHEAD_MAX: usize = 28;

/// Minimum recovery window: a missing packet gets at least this long (ms).
pub const DEFAULT_RECOVERY_LENGTH_MIN: u32 = 245;

/// Maximum recovery window: the hard egress ceiling for a hole (ms).
pub const DEFAULT_RECOVERY_LENGTH_MAX: u32 = 1000;

/// Reorder tolerance before the first NACK fires (ms).
pub const DEFAULT_REORDER_BUFFER: u32 = 25;

/// RTT floor used by NACK pacing and retransmit coalescing (ms).
pub const DEFAULT_RTT_MIN: u32 = 50;

/// RTT ceiling for sanity-clamping measured samples (ms).
pub const DEFAULT_RTT_MAX: u32 = 500;

/// Retransmission budget per missing sequence.
pub const DEFAULT_MAX_RETRIES: u32 = 7;

/// Minimum spacing between aggregated NACK emissions (ms).
pub const DEFAULT_NACK_PERIOD: u32 = 10;

/// Keepalive emission interval (ms).
pub const DEFAULT_KEEPALIVE_INTERVAL: u32 = 100;

/// Missed-keepalive multiplier before a peer turns stale.
pub const KEEPALIVE_TIMEOUT_FACTOR: u32 = 7;

/// Time in stale before a peer is declared dead (ms).
pub const DEFAULT_DEAD_TIMEOUT: u32 = 30_000;

/// Handshake retry: initial timeout (ms), doubling per attempt.
pub const HS_TIMEOUT_INITIAL: u32 = 1_000;

/// Handshake retry: backoff ceiling (ms).
pub const HS_TIMEOUT_MAX: u32 = 8_000;

/// Handshake retry: attempt budget before the peer is declared dead.
pub const HS_MAX_ATTEMPTS: u32 = 5;

/// Bonding: loss-rate cutoff above which a peer is skipped (fraction).
pub const DEFAULT_PEER_CUTOFF: f32 = 0.30;

/// Retransmit bitrate cap default (Mbps). 0 means uncapped.
pub const DEFAULT_RECOVERY_MAXBITRATE: u32 = 100;

/// PBKDF2-SHA256 iteration default for the pre-shared-key KDF.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 1024;

/// Stats publication default (ms). 0 disables the stats timer.
pub const DEFAULT_STATS_INTERVAL: u32 = 1_000;

/// A flow with no traffic for this long is torn down (ms).
pub const DEFAULT_FLOW_IDLE_TIMEOUT: u32 = 30_000;

/// Key rollover: packet-count threshold.
pub const ROLLOVER_PACKET_THRESHOLD: u64 = 1 << 20;

/// Key rollover: time threshold (ms).
pub const ROLLOVER_TIME_THRESHOLD: u32 = 3_600_000;

/// Wire dialect spoken with a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "config-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Profile {
    /// RTP-compatible framing, 16-bit sequence, SSRC as flow id.
    Simple,
    /// Tunnel header framing with control TLVs, keepalive, OOB.
    Main,
}

impl Profile {
    /// Parse the numeric CLI encoding (0 = simple, 1 = main).
    pub fn from_cli(n: u32) -> Option<Self> {
        match n {
            0 => Some(Profile::Simple),
            1 | 2 => Some(Profile::Main),
            _ => None,
        }
    }
}

/// Buffer-bloat mitigation aggressiveness.
///
/// Controls the hard-limit multiplier applied on top of `bloat_limit`:
/// `Normal` allows the outstanding-NACK set to double before forced
/// drain, `Aggressive` caps it at 1.25x.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "config-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BloatMode {
    Off,
    #[default]
    Normal,
    Aggressive,
}

impl BloatMode {
    /// Hard-limit multiplier over `bloat_limit` (None = no mitigation).
    pub fn hard_limit_factor(self) -> Option<f32> {
        match self {
            BloatMode::Off => None,
            BloatMode::Normal => Some(2.0),
            BloatMode::Aggressive => Some(1.25),
        }
    }
}

/// Encryption selection for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "config-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Encryption {
    #[default]
    None,
    Aes128,
    Aes256,
}

impl Encryption {
    /// Parse the CLI encoding (0, 128, 256).
    pub fn from_cli(n: u32) -> Option<Self> {
        match n {
            0 => Some(Encryption::None),
            128 => Some(Encryption::Aes128),
            256 => Some(Encryption::Aes256),
            _ => None,
        }
    }

    /// Key length in bytes, or 0 when encryption is off.
    pub fn key_len(self) -> usize {
        match self {
            Encryption::None => 0,
            Encryption::Aes128 => 16,
            Encryption::Aes256 => 32,
        }
    }
}

/// Per-peer configuration, produced by URL parsing or built directly.
///
/// Owned value semantics: `peer_create` copies the record on register, so
/// callers may reuse or drop their copy afterwards.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "config-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeerConfig {
    /// Remote (or listen) address, `host:port`.
    pub address: String,
    /// True when this side binds and waits instead of connecting out.
    pub listening: bool,
    /// IPv6 addressing requested (`rist6://`).
    pub ipv6: bool,
    /// Canonical name reported in handshakes and stats.
    pub cname: String,
    /// Bonding weight. Zero-weight peers only carry retransmits.
    pub weight: u32,
    /// Virtual destination port (flow demux key). Must be even.
    pub virt_dst_port: u16,
    /// Multicast interface name, empty for kernel default.
    pub miface: String,
    pub recovery_length_min: u32,
    pub recovery_length_max: u32,
    pub reorder_buffer: u32,
    pub rtt_min: u32,
    pub rtt_max: u32,
    pub max_retries: u32,
    pub recovery_maxbitrate: u32,
    pub bloat_mode: BloatMode,
    /// Outstanding-NACK count where probabilistic early drop begins.
    pub bloat_limit: u32,
    pub encryption: Encryption,
    /// Pre-shared passphrase; empty disables PSK even if `encryption` set.
    pub secret: String,
    pub pbkdf2_iterations: u32,
    /// SRP identity for EAP-SRP peers (main profile only).
    pub srp_username: String,
    pub srp_password: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            listening: false,
            ipv6: false,
            cname: String::new(),
            weight: 1,
            virt_dst_port: 1968,
            miface: String::new(),
            recovery_length_min: DEFAULT_RECOVERY_LENGTH_MIN,
            recovery_length_max: DEFAULT_RECOVERY_LENGTH_MAX,
            reorder_buffer: DEFAULT_REORDER_BUFFER,
            rtt_min: DEFAULT_RTT_MIN,
            rtt_max: DEFAULT_RTT_MAX,
            max_retries: DEFAULT_MAX_RETRIES,
            recovery_maxbitrate: DEFAULT_RECOVERY_MAXBITRATE,
            bloat_mode: BloatMode::default(),
            bloat_limit: 256,
            encryption: Encryption::None,
            secret: String::new(),
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
            srp_username: String::new(),
            srp_password: String::new(),
        }
    }
}

impl PeerConfig {
    /// Validate cross-field constraints before registration.
    ///
    /// Checks the rules a context cannot start without: even virtual
    /// destination port, ordered recovery window, non-empty address.
    pub fn validate(&self) -> Result<(), String> {
        if self.address.is_empty() {
            return Err("peer address is empty".into());
        }
        if self.virt_dst_port % 2 != 0 {
            return Err(format!(
                "virt-dst-port {} must be even (LSB is reserved)",
                self.virt_dst_port
            ));
        }
        if self.recovery_length_min > self.recovery_length_max {
            return Err(format!(
                "recovery window inverted: min {} > max {}",
                self.recovery_length_min, self.recovery_length_max
            ));
        }
        if self.rtt_min > self.rtt_max {
            return Err(format!(
                "rtt window inverted: min {} > max {}",
                self.rtt_min, self.rtt_max
            ));
        }
        if self.encryption != Encryption::None
            && self.secret.is_empty()
            && self.srp_username.is_empty()
        {
            return Err("encryption enabled but no secret or SRP identity".into());
        }
        Ok(())
    }

    /// Keepalive timeout derived from the keepalive interval.
    pub fn keepalive_timeout_ms(&self) -> u32 {
        DEFAULT_KEEPALIVE_INTERVAL * KEEPALIVE_TIMEOUT_FACTOR
    }

    /// Recovery-buffer slot capacity for a flow using this peer.
    ///
    /// Sized from the recovery window at peak bitrate with a 2x safety
    /// margin, rounded up to a power of two for cheap modulo addressing.
    pub fn recovery_slots(&self) -> usize {
        let bitrate_bps = u64::from(self.recovery_maxbitrate.max(1)) * 1_000_000;
        let window_s = f64::from(self.recovery_length_max.max(1)) / 1000.0;
        let pkts = (bitrate_bps as f64 / 8.0 * window_s / DEFAULT_MAX_PACKET_SIZE as f64) * 2.0;
        (pkts as usize).clamp(256, 65_536).next_power_of_two()
    }
}

/// Context-wide tuning shared by sender and receiver contexts.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub profile: Profile,
    /// Worker threads the flow set is multiplexed onto.
    pub worker_count: usize,
    /// Bounded depth of the caller-facing write/delivery queues.
    pub queue_depth: usize,
    /// Stats publication interval (ms), 0 to disable.
    pub stats_interval: u32,
    pub max_packet_size: usize,
    /// Null-packet deletion on the send path.
    pub npd: bool,
    pub flow_idle_timeout: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            profile: Profile::Main,
            worker_count: 1,
            queue_depth: 1024,
            stats_interval: DEFAULT_STATS_INTERVAL,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            npd: false,
            flow_idle_timeout: DEFAULT_FLOW_IDLE_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_from_cli() {
        assert_eq!(Profile::from_cli(0), Some(Profile::Simple));
        assert_eq!(Profile::from_cli(1), Some(Profile::Main));
        assert_eq!(Profile::from_cli(2), Some(Profile::Main));
        assert_eq!(Profile::from_cli(3), None);
    }

    #[test]
    fn test_encryption_from_cli() {
        assert_eq!(Encryption::from_cli(0), Some(Encryption::None));
        assert_eq!(Encryption::from_cli(128), Some(Encryption::Aes128));
        assert_eq!(Encryption::from_cli(256), Some(Encryption::Aes256));
        assert_eq!(Encryption::from_cli(192), None);
    }

    #[test]
    fn test_validate_rejects_odd_stream_id() {
        let cfg = PeerConfig {
            address: "10.0.0.1:1968".into(),
            virt_dst_port: 1969,
            ..PeerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_window() {
        let cfg = PeerConfig {
            address: "10.0.0.1:1968".into(),
            recovery_length_min: 2000,
            recovery_length_max: 1000,
            ..PeerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_encryption_needs_secret() {
        let mut cfg = PeerConfig {
            address: "10.0.0.1:1968".into(),
            encryption: Encryption::Aes128,
            ..PeerConfig::default()
        };
        assert!(cfg.validate().is_err());
        cfg.secret = "hunter2".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_recovery_slots_power_of_two() {
        let cfg = PeerConfig {
            address: "x:1".into(),
            ..PeerConfig::default()
        };
        let slots = cfg.recovery_slots();
        assert!(slots.is_power_of_two());
        assert!(slots >= 256);
    }

    #[test]
    fn test_bloat_mode_factors() {
        assert_eq!(BloatMode::Off.hard_limit_factor(), None);
        assert_eq!(BloatMode::Normal.hard_limit_factor(), Some(2.0));
        assert_eq!(BloatMode::Aggressive.hard_limit_factor(), Some(1.25));
    }
}
