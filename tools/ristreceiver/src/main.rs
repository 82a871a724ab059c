// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! RIST to UDP bridge.
//!
//! Joins one or more RIST inputs (bonded into one receiving context)
//! and writes the recovered in-order stream to UDP outputs. Outputs
//! with a `stream-id` only carry the matching virtual destination
//! port; outputs without one carry everything.
//! Exit codes: 0 normal, 1 configuration error, 2 runtime fatal.

use std::net::UdpSocket;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use rist::url::{parse_rist_url, parse_udp_url};
use rist::{ContextConfig, Encryption, Error, PeerConfig, Profile, ReceiverCtx, StatsEvent};

#[derive(Parser, Debug)]
#[command(name = "ristreceiver", about = "RIST to UDP bridge", version)]
struct Args {
    /// Comma separated list of input rist URLs.
    #[arg(short, long)]
    inputurl: String,

    /// Comma separated list of output udp URLs.
    #[arg(short, long)]
    outputurl: String,

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
    #[arg(short, long, default_value_t = 1)]
    profile: u32,

    /// Interval at which stats get printed (ms), 0 to disable.
    #[arg(short = 'S', long, default_value_t = 1000)]
    stats: u32,

    /// Log verbosity, syslog-style; -1 disables logging.
    #[arg(short, long, default_value_t = 6)]
    verbose_level: i32,

    /// SRP credential file for authenticating connecting senders.
    #[arg(short = 'F', long)]
    srpfile: Option<std::path::PathBuf>,
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

fn apply_overrides(mut config: PeerConfig, args: &Args) -> PeerConfig {
    if let Some(secret) = &args.secret {
        if config.secret.is_empty() {
            config.secret = secret.clone();
            config.encryption = match args.encryption_type.unwrap_or(0) {
                256 => Encryption::Aes256,
                _ if config.encryption == Encryption::None => Encryption::Aes128,
                _ => config.encryption,
            };
        }
    }
    if let Some(buffer) = args.buffer {
        config.recovery_length_min = buffer;
        config.recovery_length_max = buffer;
    }
    config
}

/// One UDP output and its stream-id filter (0 = carry everything).
struct Output {
    socket: UdpSocket,
    dest: std::net::SocketAddr,
    stream_id: u16,
}

/// Build an output socket, routing multicast through `miface` when
/// one is named.
fn output_socket(dest: std::net::SocketAddr, miface: &str) -> Result<UdpSocket, String> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if dest.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| e.to_string())?;
    if dest.ip().is_multicast() && !miface.is_empty() {
        if let std::net::IpAddr::V4(_) = dest.ip() {
            let iface = rist::transport::resolve_miface(miface).map_err(|e| e.to_string())?;
            socket
                .set_multicast_if_v4(&iface)
                .map_err(|e| e.to_string())?;
        }
    }
    let bind: std::net::SocketAddr = if dest.is_ipv6() {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    };
    socket.bind(&bind.into()).map_err(|e| e.to_string())?;
    Ok(socket.into())
}

fn run() -> Result<(), (u8, String)> {
    let args = Args::parse();
    init_logging(args.verbose_level);

    let profile =
        Profile::from_cli(args.profile).ok_or((1, format!("invalid profile {}", args.profile)))?;
    if let Some(e) = args.encryption_type {
        if Encryption::from_cli(e).is_none() {
            return Err((1, format!("invalid encryption type {}", e)));
        }
    }

    let ctx = ReceiverCtx::new(ContextConfig {
        profile,
        stats_interval: args.stats,
        worker_count: 2,
        ..ContextConfig::default()
    });

    ctx.stats_callback_set(Arc::new(|event: &StatsEvent| match event {
        StatsEvent::ReceiverFlow(s) => log::info!(
            "flow {:#010x}: received {} delivered {} recovered {} lost {} dup {} nacks {} buffer {} rate {} bps",
            s.flow_id, s.received, s.delivered, s.retransmits_received,
            s.lost, s.duplicates, s.nacks_sent, s.buffer_occupancy, s.bitrate_bps
        ),
        StatsEvent::Peer(p) => log::info!(
            "peer {} ({}) state {:?} rtt {:.1} ms jitter {:.1} ms loss {:.1}%",
            p.peer_id, p.cname, p.state, p.rtt_ms, p.jitter_ms, p.loss_rate * 100.0
        ),
        StatsEvent::AuthAlarm { failures } => {
            log::error!("authentication alarm: {} decrypt failures", failures);
        }
        StatsEvent::DroppedByBackpressure { count } => {
            log::warn!("dropped {} blocks on backpressure", count);
        }
        StatsEvent::FatalError(msg) => log::error!("fatal: {}", msg),
        _ => {}
    }));

    ctx.auth_handler_set(Arc::new(|info, connected| {
        if connected {
            log::info!("peer has been authenticated: {}", info.address);
        } else {
            log::info!("peer disconnected: {}", info.address);
        }
    }));

    if let Some(path) = &args.srpfile {
        let credentials = rist::crypto::srp::load_credentials(path)
            .map_err(|e| (1, format!("cannot read {}: {}", path.display(), e)))?;
        log::info!("loaded {} SRP credentials", credentials.len());
        ctx.srp_credentials_set(credentials);
    }

    for token in args.inputurl.split(',') {
        let parsed = parse_rist_url(token.trim()).map_err(|e| (1, format!("{}: {}", token, e)))?;
        let config = apply_overrides(parsed, &args);
        ctx.peer_create(&config).map_err(|e| (1, e.to_string()))?;
    }

    let mut outputs = Vec::new();
    for token in args.outputurl.split(',') {
        let url = parse_udp_url(token.trim()).map_err(|e| (1, format!("{}: {}", token, e)))?;
        let dest = std::net::ToSocketAddrs::to_socket_addrs(&url.address)
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or((1, format!("cannot resolve output '{}'", url.address)))?;
        let socket = output_socket(dest, &url.miface).map_err(|e| (2, e))?;
        log::info!(
            "output {} (stream-id {}, miface '{}')",
            dest,
            url.stream_id,
            url.miface
        );
        outputs.push(Output {
            socket,
            dest,
            stream_id: url.stream_id,
        });
    }
    if outputs.is_empty() {
        return Err((1, "at least one output URL is required".into()));
    }

    ctx.start().map_err(|e| (2, e.to_string()))?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            log::info!("signal received, shutting down");
            stop.store(true, Ordering::Release);
        })
        .map_err(|e| (2, e.to_string()))?;
    }

    while !stop.load(Ordering::Acquire) {
        let block = match ctx.read(Duration::from_millis(100)) {
            Ok(block) => block,
            Err(Error::Timeout) => continue,
            Err(Error::Closed) => break,
            Err(e) => {
                log::error!("read failed: {}", e);
                return Err((2, e.to_string()));
            }
        };
        for output in &outputs {
            if output.stream_id != 0 && output.stream_id != block.virt_dst_port {
                continue;
            }
            if let Err(e) = output.socket.send_to(&block.payload, &output.dest) {
                if e.kind() != std::io::ErrorKind::WouldBlock {
                    log::warn!("output send to {} failed: {}", output.dest, e);
                }
            }
        }
    }

    ctx.destroy();
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err((code, msg)) => {
            eprintln!("ristreceiver: {}", msg);
            ExitCode::from(code)
        }
    }
}
