// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! # RIST - Reliable Internet Stream Transport
//!
//! A pure Rust implementation of NACK-driven reliable media transport
//! over plain UDP: bounded-latency loss recovery, multi-peer bonding
//! with seamless failover, and optional AES-CTR payload encryption
//! with live key rollover.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use rist::{ContextConfig, DataBlock, ReceiverCtx, SenderCtx};
//!
//! fn main() -> rist::Result<()> {
//!     // Sender: connect out to a receiver.
//!     let sender = SenderCtx::new(ContextConfig::default());
//!     let peer = rist::url::parse_rist_url("rist://203.0.113.9:1968?buffer=500")?;
//!     sender.peer_create(&peer)?;
//!     sender.start()?;
//!     sender.write(DataBlock {
//!         payload: vec![0x47; 1316],
//!         ..DataBlock::default()
//!     })?;
//!
//!     // Receiver: listen and read in order.
//!     let receiver = ReceiverCtx::new(ContextConfig::default());
//!     let listen = rist::url::parse_rist_url("rist://@0.0.0.0:1968?buffer=500")?;
//!     receiver.peer_create(&listen)?;
//!     receiver.start()?;
//!     let block = receiver.read(Duration::from_millis(100))?;
//!     println!("got {} bytes of seq {}", block.payload.len(), block.seq);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Public Contract                             |
//! |        SenderCtx / ReceiverCtx, write / read, callbacks            |
//! +--------------------------------------------------------------------+
//! |  Send Engine            | Flow Dispatcher  | Receive Engine        |
//! |  seq assign, cache,     | flow table,      | recovery buffer,      |
//! |  NACK service, pacing   | routing, stats   | NACK schedule, bloat  |
//! +--------------------------------------------------------------------+
//! |   Peers (state machine, RTT, bonding)  |  Crypto (KDF, CTR, SRP)   |
//! +--------------------------------------------------------------------+
//! |        Packet Codec (simple RTP / main tunnel dialects)            |
//! +--------------------------------------------------------------------+
//! |            Socket I/O (socket2 + mio readiness reactor)            |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`SenderCtx`] | Sending context: write payloads, bond peers |
//! | [`ReceiverCtx`] | Receiving context: blocking in-order reads |
//! | [`PeerConfig`] | Per-peer tuning, usually from a `rist://` URL |
//! | [`DataBlock`] | One application payload crossing the API |
//! | [`Error`] | Everything the public surface can fail with |

/// Public contract layer (contexts, read/write, callbacks).
pub mod api;
/// Protocol constants, tuning defaults, peer configuration.
pub mod config;
/// Payload encryption, key rollover, EAP-SRP.
pub mod crypto;
/// Flow table, routing, statistics snapshots.
pub mod dispatch;
/// Peer records, lifecycle state machine, RTT estimation, bonding.
pub mod peers;
/// Wire formats: tunnel and RTP dialects, NACK encodings.
pub mod protocol;
/// Receive reliability engine (recovery buffer, NACK scheduling).
pub mod receive;
/// Monotonic clock and the timer wheel.
pub mod sched;
/// Send reliability engine (retransmit cache, pacing, NPD).
pub mod send;
/// UDP channels and the readiness reactor.
pub mod transport;
/// `rist://` and `udp://` URL parsing.
pub mod url;

pub use api::{
    AuthCallback, DataBlock, Error, OobBlock, OobCallback, PeerInfo, ReceiverCtx, Result,
    SenderCtx,
};
pub use config::{BloatMode, ContextConfig, Encryption, PeerConfig, Profile};
pub use dispatch::{StatsCallback, StatsEvent};
