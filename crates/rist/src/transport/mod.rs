// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Datagram plumbing: non-blocking UDP channels and the readiness
//! reactor the socket threads run on.

mod poll;
mod udp;

pub use poll::{channel_token, Reactor, POLL_TIMEOUT_FLOOR};
pub use udp::{parse_bind_addr, resolve_miface, UdpChannel, UdpSender};
