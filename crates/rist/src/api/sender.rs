// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Sender context: the application-facing write handle and its worker.
//!
//! `write` enqueues onto a bounded queue and never blocks; one worker
//! thread owns the flow senders, drives the timer wheel (keepalives,
//! stats, key rollover, cache aging) and services NACK intake from the
//! per-peer sockets. Egress fans out across the bond by weighted
//! round-robin; retransmissions go back to the peer that asked.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;

use crate::config::{ContextConfig, Encryption, PeerConfig, Profile, DEFAULT_KEEPALIVE_INTERVAL};
use crate::crypto::KeyStore;
use crate::dispatch::{BitrateMeter, PeerStatsSnapshot, SendStatsSnapshot, StatsCallback, StatsEvent};
use crate::peers::{BondingSelector, PeerEvent, PeerId, PeerTable};
use crate::protocol::{
    gre, rtp, Control, DataPacket, FlowId, Handshake, Keepalive, Message, NackMsg,
};
use crate::sched::{Clock, TimerWheel};
use crate::send::FlowSender;
use crate::transport::{channel_token, parse_bind_addr, Reactor, UdpChannel, UdpSender};

use super::{AuthCallback, DataBlock, Error, OobBlock, OobCallback, PeerInfo, Result};

const MS: u64 = 1_000_000;

// Timer wheel callback ids.
const CB_KEEPALIVE: u64 = 1;
const CB_STATS: u64 = 2;
const CB_MAINTENANCE: u64 = 3;
const MAINTENANCE_PERIOD_NS: u64 = 100 * MS;

#[derive(Default)]
struct Callbacks {
    auth: Option<AuthCallback>,
    oob: Option<OobCallback>,
    stats: Option<StatsCallback>,
}

struct Shared {
    cfg: ContextConfig,
    clock: Clock,
    peers: PeerTable,
    closed: AtomicBool,
    callbacks: Mutex<Callbacks>,
    backpressure_drops: AtomicU64,
    /// Inbound OOB blocks for polled consumption (no callback set).
    oob_in: Sender<OobBlock>,
}

/// The opaque sender handle.
pub struct SenderCtx {
    shared: Arc<Shared>,
    write_tx: Sender<DataBlock>,
    write_rx: Mutex<Option<Receiver<DataBlock>>>,
    oob_tx: Sender<OobBlock>,
    oob_rx: Mutex<Option<Receiver<OobBlock>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    oob_in_rx: Receiver<OobBlock>,
    default_flow: FlowId,
}

impl SenderCtx {
    /// Build a sender context. Peers are registered afterwards and the
    /// engine starts moving data once [`start`](Self::start) returns.
    pub fn new(cfg: ContextConfig) -> Self {
        let (write_tx, write_rx) = bounded(cfg.queue_depth);
        let (oob_tx, oob_rx) = bounded(64);
        let (oob_in_tx, oob_in_rx) = bounded(64);
        // Flow ids keep the LSB clear; it is reserved on the wire.
        let default_flow = rand::random::<u32>() & 0xFFFF_FFFE;
        Self {
            shared: Arc::new(Shared {
                cfg,
                clock: Clock::new(),
                peers: PeerTable::new(),
                closed: AtomicBool::new(false),
                callbacks: Mutex::new(Callbacks::default()),
                backpressure_drops: AtomicU64::new(0),
                oob_in: oob_in_tx,
            }),
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            oob_tx,
            oob_rx: Mutex::new(Some(oob_rx)),
            worker: Mutex::new(None),
            oob_in_rx,
            default_flow,
        }
    }

    /// Poll for an inbound out-of-band block.
    ///
    /// Only blocks that no registered OOB callback consumed are queued
    /// here.
    pub fn oob_read(&self, timeout: Duration) -> Result<OobBlock> {
        match self.oob_in_rx.recv_timeout(timeout) {
            Ok(block) => Ok(block),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if self.shared.closed.load(Ordering::Acquire) {
                    Err(Error::Closed)
                } else {
                    Err(Error::Timeout)
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(Error::Closed),
        }
    }

    pub fn profile(&self) -> Profile {
        self.shared.cfg.profile
    }

    /// Register a peer. Must happen before `start`.
    pub fn peer_create(&self, config: &PeerConfig) -> Result<PeerId> {
        config.validate().map_err(Error::Config)?;
        if self.worker.lock().is_some() {
            return Err(Error::InvalidState(
                "peer_create after start is not supported".into(),
            ));
        }
        let addr = parse_bind_addr(&config.address, config.ipv6)?;
        let id = self.shared.peers.insert(addr, config.clone());

        // Connect-mode peers with a secret derive generation 0 now;
        // the salt travels in our handshake.
        if config.encryption != Encryption::None && !config.secret.is_empty() {
            let salt: [u8; 16] = rand::random();
            let nonce: u32 = rand::random();
            let ks = Arc::new(KeyStore::new(
                &config.secret,
                config.encryption,
                config.pbkdf2_iterations,
                salt,
                nonce,
                self.shared.clock.now(),
            ));
            self.shared.peers.with_peer(id, |p| {
                p.psk_salt = salt;
                p.nonce = nonce;
                p.keystore = Some(ks);
            });
        }
        Ok(id)
    }

    /// Enqueue one application payload.
    ///
    /// Returns the bytes accepted, or [`Error::QueueFull`] rather than
    /// blocking the caller.
    pub fn write(&self, block: DataBlock) -> Result<usize> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let len = block.payload.len();
        match self.write_tx.try_send(block) {
            Ok(()) => Ok(len),
            Err(TrySendError::Full(_)) => {
                self.shared
                    .backpressure_drops
                    .fetch_add(1, Ordering::Relaxed);
                Err(Error::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(Error::Closed),
        }
    }

    /// Like [`write`](Self::write), but waits up to `timeout` for
    /// queue room before giving up with [`Error::QueueFull`].
    pub fn write_blocking(&self, block: DataBlock, timeout: Duration) -> Result<usize> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let len = block.payload.len();
        match self.write_tx.send_timeout(block, timeout) {
            Ok(()) => Ok(len),
            Err(SendTimeoutError::Timeout(_)) => {
                self.shared
                    .backpressure_drops
                    .fetch_add(1, Ordering::Relaxed);
                Err(Error::QueueFull)
            }
            Err(SendTimeoutError::Disconnected(_)) => Err(Error::Closed),
        }
    }

    /// Queue an out-of-band block (main profile only).
    pub fn oob_write(&self, block: OobBlock) -> Result<()> {
        if self.shared.cfg.profile == Profile::Simple {
            return Err(Error::Unsupported("OOB requires the main profile"));
        }
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        self.oob_tx
            .try_send(block)
            .map_err(|_| Error::QueueFull)
    }

    pub fn auth_handler_set(&self, cb: AuthCallback) {
        self.shared.callbacks.lock().auth = Some(cb);
    }

    pub fn oob_callback_set(&self, cb: OobCallback) {
        self.shared.callbacks.lock().oob = Some(cb);
    }

    pub fn stats_callback_set(&self, cb: StatsCallback) {
        self.shared.callbacks.lock().stats = Some(cb);
    }

    /// Bind sockets and launch the worker.
    pub fn start(&self) -> Result<()> {
        let mut guard = self.worker.lock();
        if guard.is_some() {
            return Err(Error::InvalidState("context already started".into()));
        }
        let write_rx = self
            .write_rx
            .lock()
            .take()
            .ok_or_else(|| Error::InvalidState("context was destroyed".into()))?;
        let oob_rx = self
            .oob_rx
            .lock()
            .take()
            .ok_or_else(|| Error::InvalidState("context was destroyed".into()))?;

        // One channel per peer, bound on the caller thread so errors
        // surface synchronously from start().
        let mut channels = Vec::new();
        let mut peer_channel = HashMap::new();
        let mut bind_error: Option<Error> = None;
        self.shared.peers.for_each(|peer| {
            if bind_error.is_some() {
                return;
            }
            let bind = if peer.config.listening {
                peer.addr
            } else if peer.addr.is_ipv6() {
                SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0))
            } else {
                SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, 0))
            };
            match UdpChannel::bind(bind, &peer.config.miface) {
                Ok(chan) => {
                    peer_channel.insert(peer.id, channels.len());
                    channels.push(chan);
                }
                Err(e) => bind_error = Some(Error::BindFailed(format!("{}: {}", bind, e))),
            }
        });
        if let Some(e) = bind_error {
            return Err(e);
        }
        if channels.is_empty() {
            return Err(Error::Config("sender has no peers".into()));
        }

        let worker = Worker::new(
            Arc::clone(&self.shared),
            channels,
            peer_channel,
            write_rx,
            oob_rx,
            self.default_flow,
        )?;
        let handle = std::thread::Builder::new()
            .name("rist-sender".into())
            .spawn(move || worker.run())
            .map_err(|e| Error::ThreadStart(e.to_string()))?;
        *guard = Some(handle);
        Ok(())
    }

    /// Tear the context down. Idempotent; joins the worker.
    pub fn destroy(&self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                log::error!("[sender] worker panicked during shutdown");
            }
        }
    }

    /// Writes dropped because the queue was full.
    pub fn backpressure_drops(&self) -> u64 {
        self.shared.backpressure_drops.load(Ordering::Relaxed)
    }
}

impl Drop for SenderCtx {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Worker-side state, single-threaded by construction.
struct Worker {
    shared: Arc<Shared>,
    reactor: Reactor,
    channels: Vec<UdpChannel>,
    senders: Vec<UdpSender>,
    peer_channel: HashMap<PeerId, usize>,
    write_rx: Receiver<DataBlock>,
    oob_rx: Receiver<OobBlock>,
    flows: HashMap<FlowId, FlowSender>,
    meters: HashMap<FlowId, BitrateMeter>,
    bonding: BondingSelector,
    wheel: TimerWheel,
    default_flow: FlowId,
    /// Datagram awaiting tokens or socket room.
    pending: Option<DataPacket>,
    #[cfg(feature = "srp")]
    srp_clients: HashMap<PeerId, crate::crypto::srp::SrpClient>,
}

impl Worker {
    fn new(
        shared: Arc<Shared>,
        mut channels: Vec<UdpChannel>,
        peer_channel: HashMap<PeerId, usize>,
        write_rx: Receiver<DataBlock>,
        oob_rx: Receiver<OobBlock>,
        default_flow: FlowId,
    ) -> Result<Self> {
        let reactor = Reactor::new()?;
        let mut senders = Vec::with_capacity(channels.len());
        for (i, chan) in channels.iter_mut().enumerate() {
            chan.register(reactor.registry(), channel_token(i))?;
            senders.push(chan.sender()?);
        }
        let cutoff = crate::config::DEFAULT_PEER_CUTOFF;
        Ok(Self {
            shared,
            reactor,
            channels,
            senders,
            peer_channel,
            write_rx,
            oob_rx,
            flows: HashMap::new(),
            meters: HashMap::new(),
            bonding: BondingSelector::new(cutoff),
            wheel: TimerWheel::new(),
            default_flow,
            pending: None,
            #[cfg(feature = "srp")]
            srp_clients: HashMap::new(),
        })
    }

    fn run(mut self) {
        let now = self.shared.clock.now();
        self.wheel
            .schedule(now + u64::from(DEFAULT_KEEPALIVE_INTERVAL) * MS, CB_KEEPALIVE);
        self.wheel.schedule(now + MAINTENANCE_PERIOD_NS, CB_MAINTENANCE);
        if self.shared.cfg.stats_interval > 0 {
            self.wheel
                .schedule(now + u64::from(self.shared.cfg.stats_interval) * MS, CB_STATS);
        }
        self.open_peers(now);

        while !self.shared.closed.load(Ordering::Acquire) {
            let now = self.shared.clock.now();
            for cb in self.wheel.advance(now) {
                self.on_timer(cb, now);
            }
            self.drain_oob(now);
            self.drain_writes(now);

            let timeout = self
                .wheel
                .next_deadline()
                .map(|d| Duration::from_nanos(d.saturating_sub(self.shared.clock.now())))
                .unwrap_or(Duration::from_millis(10));
            let ready = match self.reactor.wait(timeout) {
                Ok(tokens) => tokens,
                Err(e) => {
                    log::error!("[sender] reactor failure: {}", e);
                    self.fatal(format!("reactor failure: {}", e));
                    break;
                }
            };
            for token in ready {
                self.drain_channel(token);
            }
        }
        log::debug!("[sender] worker exiting");
    }

    /// Kick off handshakes (or go straight active on simple profile).
    fn open_peers(&mut self, now: u64) {
        let simple = self.shared.cfg.profile == Profile::Simple;
        let mut events = Vec::new();
        self.shared.peers.for_each(|peer| {
            let evs = if simple {
                peer.sm.force_active(now)
            } else if peer.config.listening {
                Vec::new() // passive side waits for the remote
            } else {
                peer.sm.start(now)
            };
            events.extend(evs.into_iter().map(|e| (peer.id, e)));
        });
        for (peer, event) in events {
            self.on_peer_event(peer, event, now);
        }
    }

    fn on_timer(&mut self, cb: u64, now: u64) {
        match cb {
            CB_KEEPALIVE => {
                if self.shared.cfg.profile == Profile::Main {
                    self.send_keepalives(now);
                }
                self.wheel
                    .schedule(now + u64::from(DEFAULT_KEEPALIVE_INTERVAL) * MS, CB_KEEPALIVE);
            }
            CB_STATS => {
                self.publish_stats(now);
                self.wheel
                    .schedule(now + u64::from(self.shared.cfg.stats_interval) * MS, CB_STATS);
            }
            CB_MAINTENANCE => {
                self.maintenance(now);
                self.wheel.schedule(now + MAINTENANCE_PERIOD_NS, CB_MAINTENANCE);
            }
            other => log::debug!("[sender] unknown timer callback {}", other),
        }
    }

    fn send_keepalives(&mut self, now: u64) {
        let mut targets = Vec::new();
        self.shared.peers.for_each(|peer| {
            if peer.sm.is_running() {
                targets.push(peer.id);
            }
        });
        for peer in targets {
            let wire = gre::encode_control(0, &Control::Keepalive(Keepalive::Ping { ts: now }));
            self.send_wire(peer, &wire);
        }
    }

    fn maintenance(&mut self, now: u64) {
        for flow in self.flows.values_mut() {
            flow.tick(now);
        }

        // Peer lifecycle ticks (main profile; simple peers have no
        // keepalive to miss).
        let mut events = Vec::new();
        if self.shared.cfg.profile == Profile::Main {
            self.shared.peers.for_each(|peer| {
                for e in peer.sm.tick(now) {
                    events.push((peer.id, e));
                }
            });
        }
        for (peer, event) in events {
            self.on_peer_event(peer, event, now);
        }

        // Key rollover.
        let mut announce = Vec::new();
        self.shared.peers.for_each(|peer| {
            if let Some(ks) = &peer.keystore {
                ks.maintain(now);
                if ks.should_rollover(now) {
                    let grace = (2 * peer.rtt.rtt_ns()).max(MS);
                    let (generation, salt) = ks.begin_rollover(rand::random(), now, grace);
                    announce.push((peer.id, generation, salt));
                }
            }
        });
        for (peer, generation, salt) in announce {
            let wire = gre::encode_control(0, &Control::KeyAnnounce { generation, salt });
            self.send_wire(peer, &wire);
        }
    }

    fn publish_stats(&mut self, now: u64) {
        let Some(stats) = self.shared.callbacks.lock().stats.clone() else {
            return;
        };
        for (flow_id, flow) in &self.flows {
            let bitrate = self
                .meters
                .get_mut(flow_id)
                .map(|m| m.sample(now))
                .unwrap_or(0);
            stats(&StatsEvent::SenderFlow(SendStatsSnapshot {
                flow_id: *flow_id,
                written: flow.stats.written,
                retransmits_sent: flow.stats.retransmits_sent,
                nacks_received: flow.stats.nacks_received,
                coalesced: flow.stats.coalesced,
                gone: flow.stats.gone,
                cache_size: flow.cached(),
                bitrate_bps: bitrate,
            }));
        }
        let mut peer_snaps = Vec::new();
        self.shared.peers.for_each(|peer| {
            peer_snaps.push(PeerStatsSnapshot {
                peer_id: peer.id,
                cname: peer.config.cname.clone(),
                state: peer.sm.state(),
                rtt_ms: peer.rtt.rtt_ms(),
                jitter_ms: peer.rtt.jitter_ms(),
                loss_rate: peer.loss.rate(),
                stale_count: peer.sm.stale_count,
            });
        });
        for snap in peer_snaps {
            stats(&StatsEvent::Peer(snap));
        }
        let dropped = self.shared.backpressure_drops.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            stats(&StatsEvent::DroppedByBackpressure { count: dropped });
        }
    }

    fn fatal(&self, message: String) {
        if let Some(stats) = self.shared.callbacks.lock().stats.clone() {
            stats(&StatsEvent::FatalError(message));
        }
        self.shared.closed.store(true, Ordering::Release);
    }

    // ====================================================================
    // Egress
    // ====================================================================

    fn drain_oob(&mut self, _now: u64) {
        while let Ok(block) = self.oob_rx.try_recv() {
            let wire = gre::encode_control(0, &Control::Oob(block.payload));
            self.send_wire(block.peer, &wire);
        }
    }

    fn drain_writes(&mut self, now: u64) {
        // Retry the packet the bitrate cap parked first.
        if let Some(pkt) = self.pending.take() {
            if !self.emit(pkt, now) {
                return;
            }
        }
        for _ in 0..64 {
            let Ok(block) = self.write_rx.try_recv() else {
                break;
            };
            let flow_id = if block.flow_id == 0 {
                self.default_flow
            } else {
                block.flow_id
            };
            let ts = if block.ts_ntp == 0 {
                self.shared.clock.now_ntp()
            } else {
                block.ts_ntp
            };
            let cfg = &self.shared.cfg;
            let flow = self.flows.entry(flow_id).or_insert_with(|| {
                // Flow tuning follows the first registered peer.
                let mut template = None;
                self.shared.peers.for_each(|peer| {
                    if template.is_none() {
                        template = Some(peer.config.clone());
                    }
                });
                FlowSender::new(flow_id, &template.unwrap_or_default(), cfg, now)
            });
            let seq_hint = block.use_seq.then_some(block.seq);
            match flow.write_with_seq(&block.payload, ts, now, seq_hint) {
                Ok(pkt) => {
                    self.meters.entry(flow_id).or_default().on_bytes(pkt.payload.len());
                    if !self.emit(pkt, now) {
                        break;
                    }
                }
                Err(e) => log::warn!("[sender] dropping oversize write: {}", e),
            }
        }
    }

    /// Push one packet through pacing, bonding, sealing and the socket.
    /// Returns false when the packet was parked (bucket dry).
    fn emit(&mut self, pkt: DataPacket, now: u64) -> bool {
        let bytes = pkt.payload.len() + crate::config::HEADER_OVERHEAD_MAX;
        if let Some(flow) = self.flows.get_mut(&pkt.flow_id) {
            if !flow.try_reserve(bytes, now) {
                let delay = flow.send_delay_ns(bytes, now);
                self.wheel.schedule(now + delay.max(MS), CB_MAINTENANCE);
                self.pending = Some(pkt);
                return false;
            }
        }
        let candidates = self.shared.peers.candidates();
        let Some(peer) = self.bonding.select(&candidates) else {
            // No running peer yet; park and retry shortly.
            self.pending = Some(pkt);
            return false;
        };
        self.send_data_to(peer, pkt, now);
        true
    }

    /// Seal and frame a data packet for one peer, then transmit.
    fn send_data_to(&mut self, peer: PeerId, mut pkt: DataPacket, now: u64) {
        let profile = self.shared.cfg.profile;
        let Some(keystore) = self.shared.peers.with_peer(peer, |p| {
            p.loss.on_received(now); // denominator for the NACK ratio
            p.sent_packets += 1;
            p.keystore.clone()
        }) else {
            return;
        };

        if let Some(ks) = keystore {
            let generation = ks.seal(pkt.seq, &mut pkt.payload);
            pkt.encrypted = true;
            pkt.key_gen = generation;
        }

        let wire = match profile {
            Profile::Main => match gre::encode_data(&pkt, self.shared.cfg.max_packet_size) {
                Ok(w) => w,
                Err(e) => {
                    log::warn!("[sender] encode failed: {}", e);
                    return;
                }
            },
            Profile::Simple => rtp::encode_data(&rtp::SimpleData {
                seq16: pkt.seq as u16,
                seq_hi: pkt.retransmit.then_some((pkt.seq >> 16) as u16),
                ssrc: pkt.flow_id,
                ts_rtp: rtp::ntp_to_rtp_ts(pkt.ts_ntp),
                retransmit: pkt.retransmit,
                key_gen: pkt.key_gen,
                payload: pkt.payload.clone(),
            }),
        };
        self.send_wire(peer, &wire);
    }

    fn send_wire(&mut self, peer: PeerId, wire: &[u8]) {
        let Some(addr) = self.shared.peers.addr_of(peer) else {
            return;
        };
        let Some(&chan) = self.peer_channel.get(&peer) else {
            return;
        };
        match self.senders[chan].send_to(wire, addr) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // Transient; the datagram is lost to the kernel queue
                // and recovered by the normal NACK path.
                log::debug!("[sender] socket backpressure toward {}", addr);
            }
            Err(e) => {
                log::warn!("[sender] send to {} failed: {}", addr, e);
                let now = self.shared.clock.now();
                let mut events = Vec::new();
                self.shared.peers.with_peer(peer, |p| {
                    events = p.sm.on_unreachable(now);
                });
                for event in events {
                    self.on_peer_event(peer, event, now);
                }
            }
        }
    }

    // ====================================================================
    // Ingress
    // ====================================================================

    fn drain_channel(&mut self, token: usize) {
        let mut buf = [0u8; 2048];
        loop {
            let (len, from) = match self.channels.get(token).map(|c| c.recv_from(&mut buf)) {
                Some(Ok(x)) => x,
                Some(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Some(Err(e)) => {
                    log::debug!("[sender] recv error: {}", e);
                    break;
                }
                None => break,
            };
            self.handle_datagram(token, &buf[..len], from);
        }
    }

    fn handle_datagram(&mut self, token: usize, wire: &[u8], from: SocketAddr) {
        let now = self.shared.clock.now();
        let peer = self.peer_for(token, from);

        match self.shared.cfg.profile {
            Profile::Main => match gre::decode_datagram(wire) {
                Ok(Message::Control { flow_id, control }) => {
                    self.handle_control(peer, flow_id, control, now);
                }
                Ok(Message::Data(_)) => {
                    // Senders do not accept media; drop and count.
                    log::debug!("[sender] unexpected data datagram from {}", from);
                }
                Err(e) => log::debug!("[sender] undecodable datagram from {}: {}", from, e),
            },
            Profile::Simple => match rtp::decode_datagram(wire) {
                Ok(rtp::SimpleMessage::Nack { ssrc, entries }) => {
                    self.handle_rtcp_nack(peer, ssrc, &entries, now);
                }
                Ok(rtp::SimpleMessage::Data(_)) => {
                    log::debug!("[sender] unexpected RTP data from {}", from);
                }
                Err(e) => log::debug!("[sender] undecodable RTCP from {}: {}", from, e),
            },
        }
    }

    /// Resolve the peer behind an arrival, adopting the remote address
    /// for listening channels on first contact.
    fn peer_for(&mut self, token: usize, from: SocketAddr) -> PeerId {
        if let Some(id) = self.shared.peers.lookup_addr(from) {
            return id;
        }
        // The channel is bound per peer, so an unknown source on a
        // listening channel is that peer's remote showing up.
        let owner = self
            .peer_channel
            .iter()
            .find(|&(_, &chan)| chan == token)
            .map(|(&id, _)| id);
        if let Some(id) = owner {
            self.shared.peers.update_addr(id, from);
            return id;
        }
        PeerId::MAX
    }

    fn handle_control(&mut self, peer: PeerId, flow_id: FlowId, control: Control, now: u64) {
        let mut events = Vec::new();
        self.shared.peers.with_peer(peer, |p| {
            events = p.sm.on_datagram(now);
        });
        for event in events {
            self.on_peer_event(peer, event, now);
        }

        match control {
            Control::Nack(msg) => self.handle_nack(peer, flow_id, &msg, now),
            Control::Keepalive(Keepalive::Ping { ts }) => {
                let wire = gre::encode_control(0, &Control::Keepalive(Keepalive::Pong { ts }));
                self.send_wire(peer, &wire);
            }
            Control::Keepalive(Keepalive::Pong { ts }) => {
                let sample_ms = now.saturating_sub(ts) as f32 / 1_000_000.0;
                self.shared.peers.with_peer(peer, |p| {
                    p.rtt.update(sample_ms);
                });
            }
            Control::Handshake(hs) => self.handle_handshake(peer, hs, now),
            Control::Oob(payload) => {
                let block = OobBlock { peer, payload };
                if let Some(cb) = self.shared.callbacks.lock().oob.clone() {
                    cb(&block);
                } else if self.shared.oob_in.try_send(block).is_err() {
                    log::debug!("[sender] OOB queue full, dropping block");
                }
            }
            Control::KeyAnnounce { .. } => {
                // Senders announce; an announcement back is noise.
                log::debug!("[sender] ignoring KEY_ANNOUNCE from peer {}", peer);
            }
            Control::SrpStep { step, data } => self.handle_srp(peer, step, &data, now),
        }
    }

    fn handle_handshake(&mut self, peer: PeerId, hs: Handshake, now: u64) {
        let mut events = Vec::new();
        let mut reply = None;
        self.shared.peers.with_peer(peer, |p| {
            if hs.ack {
                events.extend(p.sm.on_handshake_ack(now));
                events.extend(p.sm.on_authenticated(now));
            } else {
                // Passive side: adopt the initiator's salt and answer.
                if p.keystore.is_none()
                    && p.config.encryption != Encryption::None
                    && !p.config.secret.is_empty()
                {
                    p.psk_salt = hs.psk_salt;
                    p.nonce = hs.nonce;
                    p.keystore = Some(Arc::new(KeyStore::new(
                        &p.config.secret,
                        p.config.encryption,
                        p.config.pbkdf2_iterations,
                        hs.psk_salt,
                        hs.nonce,
                        now,
                    )));
                }
                events.extend(p.sm.on_handshake_request(now));
                events.extend(p.sm.on_authenticated(now));
                reply = Some(Handshake {
                    ack: true,
                    psk_salt: hs.psk_salt,
                    nonce: hs.nonce,
                });
            }
        });
        if let Some(hs) = reply {
            let wire = gre::encode_control(0, &Control::Handshake(hs));
            self.send_wire(peer, &wire);
        }
        for event in events {
            self.on_peer_event(peer, event, now);
        }
    }

    fn handle_nack(&mut self, peer: PeerId, flow_id: FlowId, msg: &NackMsg, now: u64) {
        let seq_count = msg.sequences().len();
        self.shared.peers.with_peer(peer, |p| {
            for _ in 0..seq_count {
                p.loss.on_retransmit_request(now);
            }
        });
        let Some(flow) = self.flows.get_mut(&flow_id) else {
            log::debug!("[sender] NACK for unknown flow {:#010x}", flow_id);
            return;
        };
        let retransmits = flow.on_nack(msg, now);
        for pkt in retransmits {
            // Retransmissions drain the same token bucket as originals.
            let bytes = pkt.payload.len() + crate::config::HEADER_OVERHEAD_MAX;
            let allowed = self
                .flows
                .get_mut(&flow_id)
                .map(|f| f.try_reserve(bytes, now))
                .unwrap_or(true);
            if !allowed {
                // Dropped under the cap; the receiver re-NACKs if the
                // window still has room.
                log::debug!("[sender] retransmit of seq {} deferred by bitrate cap", pkt.seq);
                continue;
            }
            self.send_data_to(peer, pkt, now);
        }
    }

    fn handle_rtcp_nack(&mut self, peer: PeerId, ssrc: u32, entries: &[(u16, u16)], now: u64) {
        let Some(flow) = self.flows.get(&ssrc) else {
            return;
        };
        let next = flow.next_seq();
        let mut seqs = Vec::new();
        for &(pid, blp) in entries {
            seqs.push(expand_seq16(pid, next));
            for bit in 0..16 {
                if blp & (1 << bit) != 0 {
                    seqs.push(expand_seq16(pid.wrapping_add(1 + bit), next));
                }
            }
        }
        seqs.sort_unstable();
        if let Some(msg) = NackMsg::for_loss_set(&seqs) {
            self.handle_nack(peer, ssrc, &msg, now);
        }
    }

    #[cfg(feature = "srp")]
    fn handle_srp(&mut self, peer: PeerId, step: u8, data: &[u8], now: u64) {
        use crate::crypto::srp::SrpClient;

        let (username, password) = match self
            .shared
            .peers
            .with_peer(peer, |p| (p.config.srp_username.clone(), p.config.srp_password.clone()))
        {
            Some(creds) if !creds.0.is_empty() => creds,
            _ => return,
        };
        match step {
            1 => {
                let mut client = SrpClient::new(&username, &password);
                match client.handle_challenge(data) {
                    Ok(m1) => {
                        self.srp_clients.insert(peer, client);
                        let wire = gre::encode_control(
                            0,
                            &Control::SrpStep { step: 2, data: m1 },
                        );
                        self.send_wire(peer, &wire);
                    }
                    Err(e) => log::warn!("[sender] SRP challenge rejected: {}", e),
                }
            }
            3 => {
                let Some(client) = self.srp_clients.remove(&peer) else {
                    return;
                };
                match client.verify_server(data) {
                    Ok(key) => self.install_srp_key(peer, &key, now),
                    Err(e) => log::warn!("[sender] SRP server proof failed: {}", e),
                }
            }
            other => log::debug!("[sender] unexpected SRP step {}", other),
        }
    }

    #[cfg(feature = "srp")]
    fn install_srp_key(&mut self, peer: PeerId, key: &[u8; 32], now: u64) {
        let passphrase: String = key.iter().map(|b| format!("{:02x}", b)).collect();
        let mut events = Vec::new();
        self.shared.peers.with_peer(peer, |p| {
            let encryption = if p.config.encryption == Encryption::None {
                Encryption::Aes128
            } else {
                p.config.encryption
            };
            p.keystore = Some(Arc::new(KeyStore::new(
                &passphrase,
                encryption,
                p.config.pbkdf2_iterations,
                p.psk_salt,
                p.nonce,
                now,
            )));
            events.extend(p.sm.on_authenticated(now));
        });
        for event in events {
            self.on_peer_event(peer, event, now);
        }
    }

    #[cfg(not(feature = "srp"))]
    fn handle_srp(&mut self, _peer: PeerId, step: u8, _data: &[u8], _now: u64) {
        log::debug!("[sender] SRP step {} ignored (feature disabled)", step);
    }

    fn on_peer_event(&mut self, peer: PeerId, event: PeerEvent, now: u64) {
        match event {
            PeerEvent::SendHandshake => {
                let hs = self
                    .shared
                    .peers
                    .with_peer(peer, |p| Handshake {
                        ack: false,
                        psk_salt: p.psk_salt,
                        nonce: p.nonce,
                    })
                    .unwrap_or(Handshake {
                        ack: false,
                        psk_salt: [0; 16],
                        nonce: 0,
                    });
                if self.shared.cfg.profile == Profile::Main {
                    let wire = gre::encode_control(0, &Control::Handshake(hs));
                    self.send_wire(peer, &wire);
                }
                // A connect-mode SRP peer opens its exchange alongside
                // the transport handshake.
                #[cfg(feature = "srp")]
                self.start_srp(peer);
            }
            PeerEvent::Connected => self.fire_auth(peer, true),
            PeerEvent::Died => self.fire_auth(peer, false),
            PeerEvent::WentStale => {
                log::info!("[sender] peer {} went stale at {} ns", peer, now);
            }
        }
    }

    #[cfg(feature = "srp")]
    fn start_srp(&mut self, peer: PeerId) {
        use crate::crypto::srp::SrpClient;
        let Some((username, password)) = self
            .shared
            .peers
            .with_peer(peer, |p| (p.config.srp_username.clone(), p.config.srp_password.clone()))
        else {
            return;
        };
        if username.is_empty() {
            return;
        }
        let client = SrpClient::new(&username, &password);
        let wire = gre::encode_control(
            0,
            &Control::SrpStep {
                step: 0,
                data: client.start(),
            },
        );
        self.srp_clients.insert(peer, client);
        self.send_wire(peer, &wire);
    }

    fn fire_auth(&self, peer: PeerId, connected: bool) {
        let Some(cb) = self.shared.callbacks.lock().auth.clone() else {
            return;
        };
        let Some(info) = self.shared.peers.with_peer(peer, |p| PeerInfo {
            peer_id: p.id,
            address: p.addr.to_string(),
            cname: p.config.cname.clone(),
        }) else {
            return;
        };
        cb(&info, connected);
    }
}

/// Recover a full 32-bit sequence from an RTCP 16-bit PID, assuming it
/// refers to a recently sent packet below `next_seq`.
fn expand_seq16(pid: u16, next_seq: u32) -> u32 {
    let candidate = (next_seq & 0xFFFF_0000) | u32::from(pid);
    if candidate >= next_seq {
        candidate.wrapping_sub(0x1_0000)
    } else {
        candidate
    }
}
