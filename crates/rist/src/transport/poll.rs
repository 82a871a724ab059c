// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Readiness reactor for the socket threads.
//!
//! A thin wrapper over `mio::Poll`: channels register under numeric
//! tokens, `wait` blocks until readiness or the timer horizon, and the
//! caller drains each readable channel until `WouldBlock`. The poll
//! timeout is floored so shutdown flags are observed promptly even
//! when no timer is close.

use std::io;
use std::time::Duration;

use mio::{Events, Poll, Token};

/// Ceiling on how long a reactor nap may last, bounding shutdown and
/// flag-check latency (10 ms).
pub const POLL_TIMEOUT_FLOOR: Duration = Duration::from_millis(10);

/// Readiness reactor.
pub struct Reactor {
    poll: Poll,
    events: Events,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(64),
        })
    }

    /// Registry handle for channel registration.
    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// Wait for readiness, at most `timeout` (clamped to the floor).
    ///
    /// Returns the tokens of readable registrations. Interrupted waits
    /// (`EINTR`) come back as an empty readiness set and the caller's
    /// loop retries.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<Vec<usize>> {
        let timeout = timeout.min(POLL_TIMEOUT_FLOOR);
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }
        Ok(self
            .events
            .iter()
            .filter(|e| e.is_readable())
            .map(|e| e.token().0)
            .collect())
    }
}

/// Token namespace helper: channels are indexed from zero.
pub fn channel_token(index: usize) -> Token {
    Token(index)
}
