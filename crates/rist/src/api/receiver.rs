// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Receiver context: socket thread, flow workers, and the blocking
//! in-order read handle.
//!
//! The socket thread drains readiness, decodes and decrypts, and
//! pushes packets onto per-worker ingress queues without touching
//! flow locks. Workers own their pinned flows: they drive the
//! recovery buffers, emit aggregated NACKs back toward the carrying
//! peer, and feed the bounded delivery queue that `read` blocks on.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;

use crate::config::{ContextConfig, Encryption, PeerConfig, Profile, DEFAULT_KEEPALIVE_INTERVAL};
use crate::crypto::{CryptoError, FailureMonitor, KeyStore};
use crate::dispatch::{FlowDispatcher, FlowKey, PeerStatsSnapshot, StatsCallback, StatsEvent};
use crate::peers::{PeerEvent, PeerId, PeerTable};
use crate::protocol::{
    gre, rtp, Control, DataPacket, Handshake, Keepalive, Message, NackMsg,
};
use crate::receive::Egress;
use crate::sched::{Clock, TimerWheel};
use crate::send::{reinsert, TS_CELL, TS_SYNC};
use crate::transport::{channel_token, parse_bind_addr, Reactor, UdpChannel, UdpSender};

use super::{AuthCallback, DataBlock, Error, OobBlock, OobCallback, PeerInfo, Result};

const MS: u64 = 1_000_000;

const CB_KEEPALIVE: u64 = 1;
const CB_STATS: u64 = 2;
const CB_MAINTENANCE: u64 = 3;
const MAINTENANCE_PERIOD_NS: u64 = 100 * MS;
const WORKER_TICK: Duration = Duration::from_millis(5);

/// Decrypt failures inside one second before the alarm fires.
const AUTH_ALARM_THRESHOLD: u32 = 50;

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
    dispatch: Mutex<Option<Arc<FlowDispatcher>>>,
    closed: AtomicBool,
    callbacks: Mutex<Callbacks>,
    backpressure_drops: AtomicU64,
    /// Malformed or unknown-TLV datagrams dropped (no connection reset).
    protocol_drops: AtomicU64,
    auth_monitor: Mutex<FailureMonitor>,
    /// Inbound OOB blocks for polled consumption (no callback set).
    oob_in: Sender<OobBlock>,
    #[cfg(feature = "srp")]
    srp_credentials: Mutex<Vec<crate::crypto::srp::Credential>>,
}

/// One unit of work handed from the socket thread to a flow worker.
struct Ingress {
    key: FlowKey,
    pkt: DataPacket,
    peer: PeerId,
}

/// The opaque receiver handle.
pub struct ReceiverCtx {
    shared: Arc<Shared>,
    delivery_rx: Receiver<DataBlock>,
    delivery_tx: Mutex<Option<Sender<DataBlock>>>,
    socket_thread: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    oob_in_rx: Receiver<OobBlock>,
    oob_out_tx: Sender<OobBlock>,
    oob_out_rx: Mutex<Option<Receiver<OobBlock>>>,
}

impl ReceiverCtx {
    pub fn new(cfg: ContextConfig) -> Self {
        let (delivery_tx, delivery_rx) = bounded(cfg.queue_depth);
        let (oob_in_tx, oob_in_rx) = bounded(64);
        let (oob_out_tx, oob_out_rx) = bounded(64);
        Self {
            shared: Arc::new(Shared {
                cfg,
                clock: Clock::new(),
                peers: PeerTable::new(),
                dispatch: Mutex::new(None),
                closed: AtomicBool::new(false),
                callbacks: Mutex::new(Callbacks::default()),
                backpressure_drops: AtomicU64::new(0),
                protocol_drops: AtomicU64::new(0),
                auth_monitor: Mutex::new(FailureMonitor::new(1_000_000_000, AUTH_ALARM_THRESHOLD)),
                oob_in: oob_in_tx,
                #[cfg(feature = "srp")]
                srp_credentials: Mutex::new(Vec::new()),
            }),
            delivery_rx,
            delivery_tx: Mutex::new(Some(delivery_tx)),
            socket_thread: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            oob_in_rx,
            oob_out_tx,
            oob_out_rx: Mutex::new(Some(oob_out_rx)),
        }
    }

    /// Queue an out-of-band block toward a peer (main profile only).
    pub fn oob_write(&self, block: OobBlock) -> Result<()> {
        if self.shared.cfg.profile == Profile::Simple {
            return Err(Error::Unsupported("OOB requires the main profile"));
        }
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        self.oob_out_tx.try_send(block).map_err(|_| Error::QueueFull)
    }

    /// Poll for an inbound out-of-band block.
    ///
    /// Only blocks that no registered OOB callback consumed are queued
    /// here.
    pub fn oob_read(&self, timeout: Duration) -> Result<OobBlock> {
        match self.oob_in_rx.recv_timeout(timeout) {
            Ok(block) => Ok(block),
            Err(RecvTimeoutError::Timeout) => {
                if self.shared.closed.load(Ordering::Acquire) {
                    Err(Error::Closed)
                } else {
                    Err(Error::Timeout)
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::Closed),
        }
    }

    pub fn profile(&self) -> Profile {
        self.shared.cfg.profile
    }

    /// Register a peer (typically a listening one). Must precede start.
    pub fn peer_create(&self, config: &PeerConfig) -> Result<PeerId> {
        config.validate().map_err(Error::Config)?;
        if self.socket_thread.lock().is_some() {
            return Err(Error::InvalidState(
                "peer_create after start is not supported".into(),
            ));
        }
        let addr = parse_bind_addr(&config.address, config.ipv6)?;
        let id = self.shared.peers.insert(addr, config.clone());

        // Connect-mode receivers initiate, so they pick the salt.
        if !config.listening
            && config.encryption != Encryption::None
            && !config.secret.is_empty()
        {
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

    /// Blocking in-order read.
    ///
    /// Returns the next payload for any flow, [`Error::Timeout`] when
    /// the deadline passes, or [`Error::Closed`] once destroyed and
    /// drained. Never returns out-of-order data.
    pub fn read(&self, timeout: Duration) -> Result<DataBlock> {
        match self.delivery_rx.recv_timeout(timeout) {
            Ok(block) => Ok(block),
            Err(RecvTimeoutError::Timeout) => {
                if self.shared.closed.load(Ordering::Acquire) {
                    Err(Error::Closed)
                } else {
                    Err(Error::Timeout)
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::Closed),
        }
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

    /// Install the SRP credential list used to authenticate peers.
    #[cfg(feature = "srp")]
    pub fn srp_credentials_set(&self, credentials: Vec<crate::crypto::srp::Credential>) {
        *self.shared.srp_credentials.lock() = credentials;
    }

    /// Bind sockets and launch the socket thread plus flow workers.
    pub fn start(&self) -> Result<()> {
        let mut socket_guard = self.socket_thread.lock();
        if socket_guard.is_some() {
            return Err(Error::InvalidState("context already started".into()));
        }
        let delivery_tx = self
            .delivery_tx
            .lock()
            .take()
            .ok_or_else(|| Error::InvalidState("context was destroyed".into()))?;
        let oob_out_rx = self
            .oob_out_rx
            .lock()
            .take()
            .ok_or_else(|| Error::InvalidState("context was destroyed".into()))?;

        // Flow buffers are sized from the first registered peer.
        let mut template = None;
        self.shared.peers.for_each(|peer| {
            if template.is_none() {
                template = Some(peer.config.clone());
            }
        });
        let template = template.ok_or_else(|| Error::Config("receiver has no peers".into()))?;
        let dispatch = Arc::new(FlowDispatcher::new(
            template,
            self.shared.cfg.worker_count,
            self.shared.cfg.flow_idle_timeout,
        ));
        *self.shared.dispatch.lock() = Some(Arc::clone(&dispatch));

        // Bind one channel per peer.
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
            return Err(Error::Config("receiver has no peers".into()));
        }

        let mut peer_senders = HashMap::new();
        for (&peer, &chan) in &peer_channel {
            peer_senders.insert(peer, channels[chan].sender()?);
        }

        // Flow workers.
        let mut worker_txs = Vec::new();
        let mut workers = self.workers.lock();
        for idx in 0..self.shared.cfg.worker_count.max(1) {
            let (tx, rx) = bounded::<Ingress>(4096);
            worker_txs.push(tx);
            let worker = FlowWorker {
                idx,
                shared: Arc::clone(&self.shared),
                dispatch: Arc::clone(&dispatch),
                ingress: rx,
                delivery: delivery_tx.clone(),
                senders: clone_senders(&peer_senders)?,
                last_source: HashMap::new(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("rist-rx-{}", idx))
                .spawn(move || worker.run())
                .map_err(|e| Error::ThreadStart(e.to_string()))?;
            workers.push(handle);
        }
        drop(delivery_tx);

        // Socket thread.
        let thread = SocketThread::new(
            Arc::clone(&self.shared),
            dispatch,
            channels,
            peer_channel,
            peer_senders,
            worker_txs,
            oob_out_rx,
        )?;
        let handle = std::thread::Builder::new()
            .name("rist-receiver".into())
            .spawn(move || thread.run())
            .map_err(|e| Error::ThreadStart(e.to_string()))?;
        *socket_guard = Some(handle);
        Ok(())
    }

    /// Tear down: wake waiters with `Closed`, drain and join workers.
    /// Idempotent.
    pub fn destroy(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.delivery_tx.lock().take();
        if let Some(handle) = self.socket_thread.lock().take() {
            if handle.join().is_err() {
                log::error!("[receiver] socket thread panicked during shutdown");
            }
        }
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                log::error!("[receiver] worker panicked during shutdown");
            }
        }
    }

    pub fn backpressure_drops(&self) -> u64 {
        self.shared.backpressure_drops.load(Ordering::Relaxed)
    }
}

impl Drop for ReceiverCtx {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn clone_senders(senders: &HashMap<PeerId, UdpSender>) -> Result<HashMap<PeerId, UdpSender>> {
    let mut out = HashMap::with_capacity(senders.len());
    for (&peer, sender) in senders {
        out.insert(peer, sender.try_clone()?);
    }
    Ok(out)
}

// ========================================================================
// Flow workers
// ========================================================================

struct FlowWorker {
    idx: usize,
    shared: Arc<Shared>,
    dispatch: Arc<FlowDispatcher>,
    ingress: Receiver<Ingress>,
    delivery: Sender<DataBlock>,
    senders: HashMap<PeerId, UdpSender>,
    /// Peer that most recently carried each flow (NACK target).
    last_source: HashMap<FlowKey, PeerId>,
}

impl FlowWorker {
    fn run(mut self) {
        let mut last_tick = 0u64;
        loop {
            match self.ingress.recv_timeout(WORKER_TICK) {
                Ok(work) => self.on_ingress(work),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.shared.closed.load(Ordering::Acquire) {
                break;
            }
            let now = self.shared.clock.now();
            if now.saturating_sub(last_tick) >= WORKER_TICK.as_nanos() as u64 {
                last_tick = now;
                self.tick_flows(now);
            }
        }
        log::debug!("[receiver] worker {} exiting", self.idx);
    }

    fn on_ingress(&mut self, work: Ingress) {
        let now = self.shared.clock.now();
        self.last_source.insert(work.key, work.peer);
        self.dispatch.meter_bytes(work.key, work.pkt.payload.len());
        let egress = self
            .dispatch
            .with_flow(work.key, |flow| flow.on_packet(work.pkt, now));
        self.deliver(work.key, egress);
    }

    fn tick_flows(&mut self, now: u64) {
        for key in self.dispatch.keys() {
            if self.dispatch.worker_for(key) != self.idx {
                continue;
            }
            let peer = self.last_source.get(&key).copied();
            let rtt_ns = peer
                .and_then(|id| self.shared.peers.with_peer(id, |p| p.rtt.rtt_ns()))
                .unwrap_or(0);
            let Some((egress, nack)) = self
                .dispatch
                .with_existing_flow(key, |flow| flow.tick(now, rtt_ns))
            else {
                continue;
            };
            self.deliver(key, egress);
            if let (Some(msg), Some(peer)) = (nack, peer) {
                self.send_nack(key, peer, &msg);
            }
        }
    }

    fn deliver(&mut self, key: FlowKey, egress: Vec<Egress>) {
        for item in egress {
            match item {
                Egress::Deliver(pkt) => {
                    let payload = if pkt.npd_map != 0 {
                        reinsert(&pkt.payload, pkt.npd_map)
                    } else {
                        pkt.payload
                    };
                    let block = DataBlock {
                        payload,
                        flow_id: key.flow_id,
                        virt_dst_port: key.dst_port,
                        ts_ntp: pkt.ts_ntp,
                        seq: pkt.seq,
                        use_seq: false,
                    };
                    match self.delivery.try_send(block) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            self.shared
                                .backpressure_drops
                                .fetch_add(1, Ordering::Relaxed);
                        }
                        Err(TrySendError::Disconnected(_)) => return,
                    }
                }
                Egress::Hole { seq } => {
                    log::debug!(
                        "[receiver] flow {:#010x} hole at seq {}",
                        key.flow_id,
                        seq
                    );
                }
            }
        }
    }

    fn send_nack(&mut self, key: FlowKey, peer: PeerId, msg: &NackMsg) {
        let Some(addr) = self.shared.peers.addr_of(peer) else {
            return;
        };
        let Some(sender) = self.senders.get(&peer) else {
            return;
        };
        let wire = match self.shared.cfg.profile {
            Profile::Main => gre::encode_control(key.flow_id, &Control::Nack(msg.clone())),
            Profile::Simple => rtp::encode_nack(0, key.flow_id, &nack_to_rtcp(msg)),
        };
        if let Err(e) = sender.send_to(&wire, addr) {
            if e.kind() != std::io::ErrorKind::WouldBlock {
                log::debug!("[receiver] NACK send failed: {}", e);
            }
        }
    }
}

/// Convert a NACK into RTCP generic-NACK PID/BLP entries.
fn nack_to_rtcp(msg: &NackMsg) -> Vec<(u16, u16)> {
    let seqs = msg.sequences();
    let mut entries = Vec::new();
    let mut i = 0;
    while i < seqs.len() {
        let base = seqs[i];
        let pid = base as u16;
        let mut blp = 0u16;
        i += 1;
        while i < seqs.len() {
            let off = seqs[i].wrapping_sub(base);
            if (1..=16).contains(&off) {
                blp |= 1 << (off - 1);
                i += 1;
            } else {
                break;
            }
        }
        entries.push((pid, blp));
    }
    entries
}

// ========================================================================
// Socket thread
// ========================================================================

struct SocketThread {
    shared: Arc<Shared>,
    dispatch: Arc<FlowDispatcher>,
    reactor: Reactor,
    channels: Vec<UdpChannel>,
    senders: HashMap<PeerId, UdpSender>,
    peer_channel: HashMap<PeerId, usize>,
    worker_txs: Vec<Sender<Ingress>>,
    oob_out_rx: Receiver<OobBlock>,
    wheel: TimerWheel,
    #[cfg(feature = "srp")]
    srp_servers: HashMap<PeerId, crate::crypto::srp::SrpServer>,
}

impl SocketThread {
    fn new(
        shared: Arc<Shared>,
        dispatch: Arc<FlowDispatcher>,
        mut channels: Vec<UdpChannel>,
        peer_channel: HashMap<PeerId, usize>,
        senders: HashMap<PeerId, UdpSender>,
        worker_txs: Vec<Sender<Ingress>>,
        oob_out_rx: Receiver<OobBlock>,
    ) -> Result<Self> {
        let reactor = Reactor::new()?;
        for (i, chan) in channels.iter_mut().enumerate() {
            chan.register(reactor.registry(), channel_token(i))?;
        }
        Ok(Self {
            shared,
            dispatch,
            reactor,
            channels,
            senders,
            peer_channel,
            worker_txs,
            oob_out_rx,
            wheel: TimerWheel::new(),
            #[cfg(feature = "srp")]
            srp_servers: HashMap::new(),
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
            while let Ok(block) = self.oob_out_rx.try_recv() {
                let wire = gre::encode_control(0, &Control::Oob(block.payload));
                self.send_wire(block.peer, &wire);
            }
            let timeout = self
                .wheel
                .next_deadline()
                .map(|d| Duration::from_nanos(d.saturating_sub(self.shared.clock.now())))
                .unwrap_or(Duration::from_millis(10));
            let ready = match self.reactor.wait(timeout) {
                Ok(tokens) => tokens,
                Err(e) => {
                    log::error!("[receiver] reactor failure: {}", e);
                    if let Some(stats) = self.shared.callbacks.lock().stats.clone() {
                        stats(&StatsEvent::FatalError(format!("reactor failure: {}", e)));
                    }
                    self.shared.closed.store(true, Ordering::Release);
                    break;
                }
            };
            for token in ready {
                self.drain_channel(token);
            }
        }
        log::debug!("[receiver] socket thread exiting");
    }

    /// Connect-mode peers open their handshake; listeners wait.
    fn open_peers(&mut self, now: u64) {
        let simple = self.shared.cfg.profile == Profile::Simple;
        let mut events = Vec::new();
        self.shared.peers.for_each(|peer| {
            let evs = if simple {
                peer.sm.force_active(now)
            } else if peer.config.listening {
                Vec::new()
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
            other => log::debug!("[receiver] unknown timer callback {}", other),
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

        self.shared.peers.for_each(|peer| {
            if let Some(ks) = &peer.keystore {
                ks.maintain(now);
            }
        });
        self.dispatch.gc(now);
    }

    fn publish_stats(&mut self, now: u64) {
        let Some(stats) = self.shared.callbacks.lock().stats.clone() else {
            return;
        };
        for snap in self.dispatch.snapshot(now) {
            stats(&StatsEvent::ReceiverFlow(snap));
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
        let bad = self.shared.protocol_drops.swap(0, Ordering::Relaxed);
        if bad > 0 {
            log::info!("[receiver] dropped {} undecodable datagrams", bad);
        }
    }

    fn drain_channel(&mut self, token: usize) {
        let mut buf = [0u8; 2048];
        loop {
            let (len, from) = match self.channels.get(token).map(|c| c.recv_from(&mut buf)) {
                Some(Ok(x)) => x,
                Some(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Some(Err(e)) => {
                    log::debug!("[receiver] recv error: {}", e);
                    break;
                }
                None => break,
            };
            self.handle_datagram(token, &buf[..len], from);
        }
    }

    fn peer_for(&mut self, token: usize, from: SocketAddr) -> PeerId {
        if let Some(id) = self.shared.peers.lookup_addr(from) {
            return id;
        }
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

    fn handle_datagram(&mut self, token: usize, wire: &[u8], from: SocketAddr) {
        let now = self.shared.clock.now();
        let peer = self.peer_for(token, from);

        let mut events = Vec::new();
        self.shared.peers.with_peer(peer, |p| {
            events = p.sm.on_datagram(now);
            p.received_packets += 1;
        });
        for event in events {
            self.on_peer_event(peer, event, now);
        }

        match self.shared.cfg.profile {
            Profile::Main => match gre::decode_datagram(wire) {
                Ok(Message::Data(pkt)) => self.handle_data(peer, pkt, now),
                Ok(Message::Control { flow_id, control }) => {
                    self.handle_control(peer, flow_id, control, now);
                }
                Err(e) => {
                    self.shared.protocol_drops.fetch_add(1, Ordering::Relaxed);
                    log::debug!("[receiver] undecodable datagram from {}: {}", from, e);
                }
            },
            Profile::Simple => match rtp::decode_datagram(wire) {
                Ok(rtp::SimpleMessage::Data(data)) => {
                    let pkt = self.simple_to_packet(peer, data, now);
                    if let Some(pkt) = pkt {
                        self.handle_data(peer, pkt, now);
                    }
                }
                Ok(rtp::SimpleMessage::Nack { .. }) => {
                    // Receivers emit NACKs; inbound ones are noise.
                }
                Err(e) => {
                    self.shared.protocol_drops.fetch_add(1, Ordering::Relaxed);
                    log::debug!("[receiver] undecodable RTP from {}: {}", from, e);
                }
            },
        }
    }

    fn simple_to_packet(
        &mut self,
        peer: PeerId,
        data: rtp::SimpleData,
        _now: u64,
    ) -> Option<DataPacket> {
        self.shared.peers.with_peer(peer, |p| {
            let seq = match data.seq_hi {
                Some(hi) => (u32::from(hi) << 16) | u32::from(data.seq16),
                None => p.seq_ext.extend(data.seq16),
            };
            DataPacket {
                seq,
                flow_id: data.ssrc,
                virt_src_port: 0,
                virt_dst_port: p.config.virt_dst_port,
                ts_ntp: rtp::rtp_ts_to_ntp(data.ts_rtp),
                retransmit: data.retransmit,
                encrypted: false,
                key_gen: data.key_gen,
                npd_map: 0,
                payload: data.payload,
            }
        })
    }

    /// Decrypt, authenticate and route one media packet to its worker.
    fn handle_data(&mut self, peer: PeerId, mut pkt: DataPacket, now: u64) {
        if pkt.encrypted {
            let keystore = self
                .shared
                .peers
                .with_peer(peer, |p| p.keystore.clone())
                .flatten();
            let opened = match keystore {
                Some(ks) => {
                    let result = ks.open(pkt.key_gen, pkt.seq, &mut pkt.payload, now);
                    match result {
                        Ok(()) if payload_sane(&pkt.payload) => Ok(()),
                        Ok(()) => Err(CryptoError::DecryptFailed),
                        Err(e) => Err(e),
                    }
                }
                None => Err(CryptoError::NoKey),
            };
            if let Err(e) = opened {
                log::debug!("[receiver] dropping packet seq {}: {}", pkt.seq, e);
                let alarm = self.shared.auth_monitor.lock().record(now);
                if alarm {
                    let failures = self.shared.auth_monitor.lock().total;
                    if let Some(stats) = self.shared.callbacks.lock().stats.clone() {
                        stats(&StatsEvent::AuthAlarm { failures });
                    }
                }
                return;
            }
            pkt.encrypted = false;
        }

        // First decodable data packet flips the peer active.
        let mut events = Vec::new();
        self.shared.peers.with_peer(peer, |p| {
            events = p.sm.on_authenticated(now);
            p.loss.on_received(now);
        });
        for event in events {
            self.on_peer_event(peer, event, now);
        }

        let key = FlowKey {
            flow_id: pkt.flow_id,
            dst_port: pkt.virt_dst_port,
        };
        let worker = self.dispatch.worker_for(key);
        match self.worker_txs[worker].try_send(Ingress { key, pkt, peer }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.shared
                    .backpressure_drops
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn handle_control(&mut self, peer: PeerId, _flow_id: u32, control: Control, now: u64) {
        match control {
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
            Control::KeyAnnounce { generation, salt } => {
                let grace = self
                    .shared
                    .peers
                    .with_peer(peer, |p| (2 * p.rtt.rtt_ns()).max(MS))
                    .unwrap_or(MS);
                if let Some(Some(ks)) = self.shared.peers.with_peer(peer, |p| p.keystore.clone())
                {
                    ks.install_announced(generation, salt, now, grace);
                }
            }
            Control::Oob(payload) => {
                let block = OobBlock { peer, payload };
                if let Some(cb) = self.shared.callbacks.lock().oob.clone() {
                    cb(&block);
                } else if self.shared.oob_in.try_send(block).is_err() {
                    log::debug!("[receiver] OOB queue full, dropping block");
                }
            }
            Control::SrpStep { step, data } => self.handle_srp(peer, step, &data, now),
            Control::Nack(_) => {
                // Receivers emit NACKs; inbound ones are noise.
                log::debug!("[receiver] ignoring NACK from peer {}", peer);
            }
        }
    }

    fn handle_handshake(&mut self, peer: PeerId, hs: Handshake, now: u64) {
        let mut events = Vec::new();
        let mut reply = None;
        self.shared.peers.with_peer(peer, |p| {
            if hs.ack {
                events.extend(p.sm.on_handshake_ack(now));
            } else {
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

    #[cfg(feature = "srp")]
    fn handle_srp(&mut self, peer: PeerId, step: u8, data: &[u8], now: u64) {
        use crate::crypto::srp::SrpServer;

        match step {
            0 => {
                let credentials = self.shared.srp_credentials.lock().clone();
                if credentials.is_empty() {
                    log::warn!("[receiver] SRP step from peer {} but no credentials", peer);
                    return;
                }
                let mut server = SrpServer::new(credentials);
                match server.handle_start(data) {
                    Ok(challenge) => {
                        self.srp_servers.insert(peer, server);
                        let wire = gre::encode_control(
                            0,
                            &Control::SrpStep {
                                step: 1,
                                data: challenge,
                            },
                        );
                        self.send_wire(peer, &wire);
                    }
                    Err(e) => log::warn!("[receiver] SRP start rejected: {}", e),
                }
            }
            2 => {
                let outcome = match self.srp_servers.get_mut(&peer) {
                    Some(server) => server
                        .handle_proof(data)
                        .map(|m2| (m2, server.session_key())),
                    None => return,
                };
                match outcome {
                    Ok((m2, key)) => {
                        let wire = gre::encode_control(
                            0,
                            &Control::SrpStep { step: 3, data: m2 },
                        );
                        self.send_wire(peer, &wire);
                        if let Some(key) = key {
                            self.install_srp_key(peer, &key, now);
                        }
                    }
                    Err(e) => {
                        log::warn!("[receiver] SRP proof rejected: {}", e);
                        self.srp_servers.remove(&peer);
                    }
                }
            }
            other => log::debug!("[receiver] unexpected SRP step {}", other),
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
        log::debug!("[receiver] SRP step {} ignored (feature disabled)", step);
    }

    fn on_peer_event(&mut self, peer: PeerId, event: PeerEvent, now: u64) {
        match event {
            PeerEvent::SendHandshake => {
                if self.shared.cfg.profile == Profile::Main {
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
                    let wire = gre::encode_control(0, &Control::Handshake(hs));
                    self.send_wire(peer, &wire);
                }
            }
            PeerEvent::Connected => self.fire_auth(peer, true),
            PeerEvent::Died => self.fire_auth(peer, false),
            PeerEvent::WentStale => {
                log::info!("[receiver] peer {} went stale at {} ns", peer, now);
            }
        }
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

    fn send_wire(&mut self, peer: PeerId, wire: &[u8]) {
        let Some(addr) = self.shared.peers.addr_of(peer) else {
            return;
        };
        let Some(sender) = self.senders.get(&peer) else {
            return;
        };
        if let Err(e) = sender.send_to(wire, addr) {
            if e.kind() != std::io::ErrorKind::WouldBlock {
                log::debug!("[receiver] send to {} failed: {}", addr, e);
            }
        }
    }
}

/// Post-decrypt sanity: a clean TS block must open on sync bytes. Non-TS
/// payloads pass untested (counter mode has no integrity tag).
fn payload_sane(payload: &[u8]) -> bool {
    if payload.is_empty() || payload.len() % TS_CELL != 0 {
        return true;
    }
    payload[0] == TS_SYNC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_times_out() {
        let ctx = ReceiverCtx::new(ContextConfig::default());
        assert!(matches!(
            ctx.read(Duration::from_millis(5)),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn test_read_after_destroy_is_closed() {
        let ctx = ReceiverCtx::new(ContextConfig::default());
        ctx.destroy();
        assert!(matches!(
            ctx.read(Duration::from_millis(5)),
            Err(Error::Closed)
        ));
    }

    #[test]
    fn test_start_without_peers_fails() {
        let ctx = ReceiverCtx::new(ContextConfig::default());
        assert!(matches!(ctx.start(), Err(Error::Config(_))));
    }

    #[test]
    fn test_destroy_idempotent() {
        let ctx = ReceiverCtx::new(ContextConfig::default());
        ctx.destroy();
        ctx.destroy();
    }

    #[test]
    fn test_nack_to_rtcp_entries() {
        let msg = NackMsg::Range(vec![(1000, 1003)]);
        assert_eq!(nack_to_rtcp(&msg), vec![(1000, 0b111)]);

        let wide = NackMsg::Range(vec![(10, 10), (100, 100)]);
        assert_eq!(nack_to_rtcp(&wide), vec![(10, 0), (100, 0)]);
    }

    #[test]
    fn test_payload_sanity() {
        assert!(payload_sane(b"short"));
        assert!(payload_sane(&[]));
        let mut ts = vec![0u8; TS_CELL];
        ts[0] = TS_SYNC;
        assert!(payload_sane(&ts));
        ts[0] = 0x12;
        assert!(!payload_sane(&ts));
    }
}
