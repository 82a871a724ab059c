// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Peer records and the shared peer table.
//!
//! The context owns one [`PeerTable`]; everything else addresses peers
//! by [`PeerId`], a stable arena index, so no reciprocal strong
//! references exist between peers and contexts. The table runs under a
//! reader-writer discipline: the per-packet paths take the shared
//! view, registration and key rollover take the exclusive one.

mod bonding;
mod rtt;
mod state;

pub use bonding::{BondingSelector, Candidate};
pub use rtt::{LossWindow, RttEstimator};
pub use state::{PeerEvent, PeerSm, PeerState};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::PeerConfig;
use crate::crypto::KeyStore;
use crate::protocol::seq::SeqExtender;

/// Stable peer handle.
pub type PeerId = u32;

/// Everything the engines track per remote endpoint.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub config: PeerConfig,
    pub sm: PeerSm,
    pub rtt: RttEstimator,
    pub loss: LossWindow,
    /// Key material, shared with the crypto engine. `None` runs clear.
    pub keystore: Option<Arc<KeyStore>>,
    /// Simple-profile 16->32 sequence extension state.
    pub seq_ext: SeqExtender,
    /// Salt this peer's keys were derived from (handshake echo).
    pub psk_salt: [u8; 16],
    /// Low counter nonce exchanged in the handshake.
    pub nonce: u32,
    pub sent_packets: u64,
    pub received_packets: u64,
}

impl Peer {
    pub fn new(id: PeerId, addr: SocketAddr, config: PeerConfig) -> Self {
        let keepalive_timeout = config.keepalive_timeout_ms();
        let rtt = RttEstimator::new(config.rtt_min, config.rtt_max);
        Self {
            id,
            addr,
            config,
            sm: PeerSm::new(keepalive_timeout),
            rtt,
            loss: LossWindow::new(),
            keystore: None,
            seq_ext: SeqExtender::new(),
            psk_salt: [0; 16],
            nonce: 0,
            sent_packets: 0,
            received_packets: 0,
        }
    }

    /// Bonding view of this peer.
    pub fn candidate(&self) -> Candidate {
        Candidate {
            id: self.id,
            weight: self.config.weight,
            loss_rate: self.loss.rate(),
        }
    }
}

#[derive(Debug, Default)]
struct TableInner {
    peers: Vec<Option<Peer>>,
    by_addr: HashMap<SocketAddr, PeerId>,
}

/// Arena-indexed peer table.
#[derive(Debug, Default)]
pub struct PeerTable {
    inner: RwLock<TableInner>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer; the config is copied in (owned value semantics).
    pub fn insert(&self, addr: SocketAddr, config: PeerConfig) -> PeerId {
        let mut inner = self.inner.write();
        let id = inner
            .peers
            .iter()
            .position(Option::is_none)
            .unwrap_or(inner.peers.len()) as PeerId;
        let peer = Peer::new(id, addr, config);
        if (id as usize) == inner.peers.len() {
            inner.peers.push(Some(peer));
        } else {
            inner.peers[id as usize] = Some(peer);
        }
        inner.by_addr.insert(addr, id);
        log::info!("[peers] registered peer {} at {}", id, addr);
        id
    }

    pub fn remove(&self, id: PeerId) {
        let mut inner = self.inner.write();
        if let Some(peer) = inner.peers.get_mut(id as usize).and_then(Option::take) {
            inner.by_addr.remove(&peer.addr);
            log::info!("[peers] removed peer {} at {}", id, peer.addr);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().peers.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Demultiplex an arrival address to its peer.
    pub fn lookup_addr(&self, addr: SocketAddr) -> Option<PeerId> {
        self.inner.read().by_addr.get(&addr).copied()
    }

    /// Run `f` against one peer mutably; None when the id is stale.
    pub fn with_peer<R>(&self, id: PeerId, f: impl FnOnce(&mut Peer) -> R) -> Option<R> {
        let mut inner = self.inner.write();
        inner.peers.get_mut(id as usize)?.as_mut().map(f)
    }

    /// Run `f` against every live peer mutably.
    pub fn for_each(&self, mut f: impl FnMut(&mut Peer)) {
        let mut inner = self.inner.write();
        for peer in inner.peers.iter_mut().flatten() {
            f(peer);
        }
    }

    /// Snapshot the bonding candidates among running peers.
    pub fn candidates(&self) -> Vec<Candidate> {
        self.inner
            .read()
            .peers
            .iter()
            .flatten()
            .filter(|p| p.sm.is_running())
            .map(Peer::candidate)
            .collect()
    }

    /// Re-point a listening peer at the remote that contacted it.
    pub fn update_addr(&self, id: PeerId, addr: SocketAddr) {
        let mut inner = self.inner.write();
        let old = match inner.peers.get_mut(id as usize).and_then(Option::as_mut) {
            Some(peer) if peer.addr != addr => {
                let old = peer.addr;
                peer.addr = addr;
                old
            }
            _ => return,
        };
        inner.by_addr.remove(&old);
        inner.by_addr.insert(addr, id);
        log::debug!("[peers] peer {} re-addressed {} -> {}", id, old, addr);
    }

    /// Address of a peer (send paths resolve ids late).
    pub fn addr_of(&self, id: PeerId) -> Option<SocketAddr> {
        self.inner
            .read()
            .peers
            .get(id as usize)?
            .as_ref()
            .map(|p| p.addr)
    }
}
