// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Public contract layer.
//!
//! The opaque [`SenderCtx`] and [`ReceiverCtx`] handles and the
//! blocking read/write APIs consumed by hosting tools. Engines never
//! abort the process; every failure funnels into [`Error`] here and
//! the caller decides whether to destroy and recreate.

mod receiver;
mod sender;

pub use receiver::ReceiverCtx;
pub use sender::SenderCtx;

use std::sync::Arc;

use crate::crypto::CryptoError;
use crate::peers::PeerId;
use crate::protocol::OversizeError;
use crate::url::UrlError;

/// One application payload crossing the API boundary.
#[derive(Debug, Clone, Default)]
pub struct DataBlock {
    pub payload: Vec<u8>,
    /// Zero selects the context's default flow.
    pub flow_id: u32,
    /// Zero selects the registering peer's configured port.
    pub virt_dst_port: u16,
    /// NTP-format timestamp; zero means "stamp on send".
    pub ts_ntp: u64,
    /// Sequence assigned by the library (meaningful on read), or the
    /// caller-chosen sequence when `use_seq` is set on write.
    pub seq: u32,
    /// Adopt `seq` as the flow sequence (RTP passthrough inputs).
    pub use_seq: bool,
}

/// Out-of-band datagram riding the control channel (main profile).
#[derive(Debug, Clone)]
pub struct OobBlock {
    pub peer: PeerId,
    pub payload: Vec<u8>,
}

/// Peer identity handed to the auth callbacks.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub address: String,
    pub cname: String,
}

/// Observer invoked when a peer authenticates or disconnects.
pub type AuthCallback = Arc<dyn Fn(&PeerInfo, bool) + Send + Sync>;

/// Observer for incoming out-of-band blocks.
pub type OobCallback = Arc<dyn Fn(&OobBlock) + Send + Sync>;

/// Errors surfaced by the public API.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Configuration
    // ========================================================================
    /// Invalid peer or context configuration.
    Config(String),
    /// URL failed to parse.
    InvalidUrl(UrlError),
    /// Two inputs claimed the same stream id.
    DuplicateStreamId(u16),

    // ========================================================================
    // Runtime I/O
    // ========================================================================
    Io(std::io::Error),
    BindFailed(String),
    /// Worker or socket thread failed to start.
    ThreadStart(String),

    // ========================================================================
    // Data path
    // ========================================================================
    /// Caller write bounced off a full queue.
    QueueFull,
    /// `read` deadline passed with nothing deliverable.
    Timeout,
    /// Context destroyed; no further traffic.
    Closed,
    /// Payload exceeds the datagram budget.
    Oversize(OversizeError),
    Crypto(CryptoError),

    // ========================================================================
    // Entities
    // ========================================================================
    PeerNotFound(PeerId),
    InvalidState(String),
    /// Operation not available under this profile.
    Unsupported(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
            Error::InvalidUrl(e) => write!(f, "invalid URL: {}", e),
            Error::DuplicateStreamId(id) => {
                write!(f, "stream-id {} used by more than one input", id)
            }
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::BindFailed(msg) => write!(f, "bind failed: {}", msg),
            Error::ThreadStart(msg) => write!(f, "thread start failed: {}", msg),
            Error::QueueFull => write!(f, "write queue full"),
            Error::Timeout => write!(f, "timed out"),
            Error::Closed => write!(f, "context closed"),
            Error::Oversize(e) => write!(f, "{}", e),
            Error::Crypto(e) => write!(f, "crypto error: {}", e),
            Error::PeerNotFound(id) => write!(f, "no peer with id {}", id),
            Error::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            Error::Unsupported(what) => write!(f, "unsupported operation: {}", what),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::InvalidUrl(e) => Some(e),
            Error::Oversize(e) => Some(e),
            Error::Crypto(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<UrlError> for Error {
    fn from(e: UrlError) -> Self {
        Error::InvalidUrl(e)
    }
}

impl From<OversizeError> for Error {
    fn from(e: OversizeError) -> Self {
        Error::Oversize(e)
    }
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self {
        Error::Crypto(e)
    }
}

/// Convenient alias for API results.
pub type Result<T> = core::result::Result<T, Error>;
