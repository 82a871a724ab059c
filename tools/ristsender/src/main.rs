// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! UDP/RTP to RIST bridge.
//!
//! Listens on one or more UDP (or RTP) inputs and forwards each as an
//! independent RIST flow to a comma-separated list of output peers.
//! Exit codes: 0 normal, 1 configuration error, 2 runtime fatal.

use std::net::UdpSocket;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use rist::url::{parse_rist_url, parse_udp_url, UdpUrl};
use rist::{ContextConfig, DataBlock, Encryption, OobBlock, PeerConfig, Profile, SenderCtx, StatsEvent};

#[derive(Parser, Debug)]
#[command(name = "ristsender", about = "UDP/RTP to RIST bridge", version)]
struct Args {
    /// YAML config file; command-line flags override its values.
    #[arg(short = 'f', long)]
    file: Option<std::path::PathBuf>,

    /// Comma separated list of input udp or rtp URLs.
    #[arg(short, long)]
    inputurl: Option<String>,

    /// Comma separated list of output rist URLs.
    #[arg(short, long)]
    outputurl: Option<String>,

    /// Default buffer size for packet retransmissions (ms).
    #[arg(short, long)]
    buffer: Option<u32>,

    /// Default pre-shared encryption secret.
    #[arg(short, long)]
    secret: Option<String>,

    /// Default encryption type (0, 128 = AES-128, 256 = AES-256).
    #[arg(short, long)]
    encryption_type: Option<u32>,

    /// RIST profile (0 = simple, 1 = main).
    #[arg(short, long)]
    profile: Option<u32>,

    /// Enable null packet deletion (receiver must support it).
    #[arg(short = 'n', long)]
    null_packet_deletion: bool,

    /// Interval at which stats get printed (ms), 0 to disable.
    #[arg(short = 'S', long)]
    stats: Option<u32>,

    /// Log verbosity, syslog-style; -1 disables logging.
    #[arg(short, long)]
    verbose_level: Option<i32>,

    /// SRP credential file (user:verifier:salt lines).
    #[arg(short = 'F', long)]
    srpfile: Option<std::path::PathBuf>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct YamlConfig {
    input_url: Option<String>,
    output_url: Option<String>,
    buffer: Option<u32>,
    secret: Option<String>,
    encryption_type: Option<u32>,
    profile: Option<u32>,
    stats_interval: Option<u32>,
    verbose_level: Option<i32>,
}

/// Effective settings after YAML + flag merge.
struct Settings {
    inputurl: String,
    outputurl: String,
    buffer: Option<u32>,
    secret: Option<String>,
    encryption_type: u32,
    profile: Profile,
    npd: bool,
    stats: u32,
    verbose_level: i32,
    srpfile: Option<std::path::PathBuf>,
}

fn merge_settings(args: Args) -> Result<Settings, String> {
    let yaml = match &args.file {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
            serde_yaml::from_str::<YamlConfig>(&text)
                .map_err(|e| format!("cannot parse {}: {}", path.display(), e))?
        }
        None => YamlConfig::default(),
    };

    let inputurl = args
        .inputurl
        .or(yaml.input_url)
        .ok_or("an input URL is mandatory (-i)")?;
    let outputurl = args
        .outputurl
        .or(yaml.output_url)
        .ok_or("an output URL is mandatory (-o)")?;
    let profile_num = args.profile.or(yaml.profile).unwrap_or(1);
    let profile =
        Profile::from_cli(profile_num).ok_or(format!("invalid profile {}", profile_num))?;
    let encryption_type = args.encryption_type.or(yaml.encryption_type).unwrap_or(0);
    if Encryption::from_cli(encryption_type).is_none() {
        return Err(format!("invalid encryption type {}", encryption_type));
    }

    Ok(Settings {
        inputurl,
        outputurl,
        buffer: args.buffer.or(yaml.buffer),
        secret: args.secret.or(yaml.secret),
        encryption_type,
        profile,
        npd: args.null_packet_deletion,
        stats: args.stats.or(yaml.stats_interval).unwrap_or(1000),
        verbose_level: args.verbose_level.or(yaml.verbose_level).unwrap_or(6),
        srpfile: args.srpfile,
    })
}

fn init_logging(verbose_level: i32) {
    let level = match verbose_level {
        i32::MIN..=-1 => log::LevelFilter::Off,
        0..=3 => log::LevelFilter::Error,
        4 => log::LevelFilter::Warn,
        5 | 6 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

/// Apply CLI defaults onto a parsed output peer URL, the way the
/// original tool overrides `rist_parse_address` results.
fn apply_overrides(mut config: PeerConfig, settings: &Settings, stream_id: u16) -> Result<PeerConfig, String> {
    if let Some(secret) = &settings.secret {
        if config.secret.is_empty() {
            config.secret = secret.clone();
            config.encryption = match settings.encryption_type {
                128 => Encryption::Aes128,
                256 => Encryption::Aes256,
                _ if config.encryption == Encryption::None => Encryption::Aes128,
                _ => config.encryption,
            };
        }
    }
    if let Some(buffer) = settings.buffer {
        config.recovery_length_min = buffer;
        config.recovery_length_max = buffer;
    }
    if stream_id != 0 {
        if stream_id % 2 != 0 {
            return Err(format!("stream-id {} must be even", stream_id));
        }
        config.virt_dst_port = stream_id;
    }
    Ok(config)
}

/// One input bridge: UDP socket feeding a sender context.
struct Bridge {
    ctx: Arc<SenderCtx>,
    socket: UdpSocket,
    input: UdpUrl,
}

fn setup_bridge(input: UdpUrl, settings: &Settings) -> Result<Bridge, String> {
    let ctx = Arc::new(SenderCtx::new(ContextConfig {
        profile: settings.profile,
        stats_interval: settings.stats,
        npd: settings.npd,
        ..ContextConfig::default()
    }));

    if settings.npd {
        log::info!(
            "null packet deletion enabled; the receiver must support it (this implementation does)"
        );
    }

    ctx.stats_callback_set(Arc::new(|event: &StatsEvent| match event {
        StatsEvent::SenderFlow(s) => log::info!(
            "flow {:#010x}: sent {} retransmitted {} nacks {} coalesced {} gone {} cache {} rate {} bps",
            s.flow_id, s.written, s.retransmits_sent, s.nacks_received,
            s.coalesced, s.gone, s.cache_size, s.bitrate_bps
        ),
        StatsEvent::Peer(p) => log::info!(
            "peer {} ({}) state {:?} rtt {:.1} ms jitter {:.1} ms loss {:.1}%",
            p.peer_id, p.cname, p.state, p.rtt_ms, p.jitter_ms, p.loss_rate * 100.0
        ),
        StatsEvent::DroppedByBackpressure { count } => {
            log::warn!("dropped {} writes on backpressure", count);
        }
        StatsEvent::FatalError(msg) => log::error!("fatal: {}", msg),
        _ => {}
    }));

    // Authenticated peers get an OOB hello; the weak handle keeps the
    // callback from pinning the context alive.
    let weak = Arc::downgrade(&ctx);
    ctx.auth_handler_set(Arc::new(move |info, connected| {
        if !connected {
            return;
        }
        log::info!("peer has been authenticated: {}", info.address);
        if let Some(ctx) = weak.upgrade() {
            let message = format!("auth,{}", info.address);
            if ctx
                .oob_write(OobBlock {
                    peer: info.peer_id,
                    payload: message.into_bytes(),
                })
                .is_err()
            {
                log::debug!("auth OOB message not sent (simple profile or closed)");
            }
        }
    }));

    ctx.oob_callback_set(Arc::new(|oob: &OobBlock| {
        if oob.payload.starts_with(b"auth,") {
            log::info!(
                "out-of-band data received: {}",
                String::from_utf8_lossy(&oob.payload)
            );
        }
    }));

    for token in settings.outputurl.split(',') {
        let parsed = parse_rist_url(token.trim()).map_err(|e| format!("{}: {}", token, e))?;
        let config = apply_overrides(parsed, settings, input.stream_id)?;
        log::info!(
            "link configured: maxrate={} Mbps bufmin={} bufmax={} reorder={} rttmin={} rttmax={} retries={}",
            config.recovery_maxbitrate,
            config.recovery_length_min,
            config.recovery_length_max,
            config.reorder_buffer,
            config.rtt_min,
            config.rtt_max,
            config.max_retries
        );
        ctx.peer_create(&config).map_err(|e| e.to_string())?;
    }

    let socket = UdpSocket::bind(&input.address)
        .map_err(|e| format!("cannot bind input {}: {}", input.address, e))?;
    socket
        .set_read_timeout(Some(Duration::from_millis(100)))
        .map_err(|e| e.to_string())?;
    log::info!("input socket is open and bound at {}", input.address);

    Ok(Bridge { ctx, socket, input })
}

/// Strip RTP framing per the input options and forward the payload.
fn forward_datagram(bridge: &Bridge, buf: &[u8]) {
    let mut block = DataBlock::default();
    let mut payload = buf;

    if bridge.input.rtp && buf.len() > 12 {
        if bridge.input.rtp_timestamp {
            let ts_rtp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
            block.ts_ntp = rist::protocol::rtp::rtp_ts_to_ntp(ts_rtp);
        }
        if bridge.input.rtp_sequence {
            block.seq = u32::from(u16::from_be_bytes([buf[2], buf[3]]));
            block.use_seq = true;
        }
        payload = &buf[12..];
    }
    block.payload = payload.to_vec();

    match bridge.ctx.write(block) {
        Ok(_) => {}
        Err(rist::Error::QueueFull) => log::warn!("input overrun, dropping datagram"),
        Err(e) => log::debug!("write failed: {}", e),
    }
}

fn run() -> Result<(), (u8, String)> {
    let args = Args::parse();
    let settings = merge_settings(args).map_err(|e| (1, e))?;
    init_logging(settings.verbose_level);

    if settings.srpfile.is_some() {
        // The credential list authenticates inbound connections; a
        // sender only ever dials out, so it is accepted and unused.
        log::warn!("--srpfile is only meaningful on listening endpoints");
    }

    // Parse inputs and reject duplicate stream ids up front.
    let mut inputs = Vec::new();
    let mut seen_ids = Vec::new();
    for token in settings.inputurl.split(',') {
        let url = parse_udp_url(token.trim()).map_err(|e| (1, format!("{}: {}", token, e)))?;
        if url.stream_id != 0 {
            if seen_ids.contains(&url.stream_id) {
                return Err((
                    1,
                    format!("every input needs a unique stream-id ({})", url.stream_id),
                ));
            }
            seen_ids.push(url.stream_id);
        }
        log::info!("assigning stream-id {} to input {}", url.stream_id, url.address);
        inputs.push(url);
    }

    let mut bridges = Vec::new();
    for input in inputs {
        bridges.push(setup_bridge(input, &settings).map_err(|e| (1, e))?);
    }
    for bridge in &bridges {
        bridge.ctx.start().map_err(|e| (2, e.to_string()))?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            log::info!("signal received, shutting down");
            stop.store(true, Ordering::Release);
        })
        .map_err(|e| (2, e.to_string()))?;
    }

    let mut threads = Vec::new();
    for bridge in bridges {
        let stop = Arc::clone(&stop);
        threads.push(std::thread::spawn(move || {
            let mut buf = [0u8; 2048];
            while !stop.load(Ordering::Acquire) {
                match bridge.socket.recv_from(&mut buf) {
                    Ok((len, _)) => forward_datagram(&bridge, &buf[..len]),
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        log::error!("input receive failed: {}", e);
                        break;
                    }
                }
            }
            bridge.ctx.destroy();
        }));
    }

    for thread in threads {
        if thread.join().is_err() {
            return Err((2, "input thread panicked".into()));
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err((code, msg)) => {
            eprintln!("ristsender: {}", msg);
            ExitCode::from(code)
        }
    }
}
