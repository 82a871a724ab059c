// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! UDP channel construction.
//!
//! Sockets are built through socket2 so we control SO_REUSEADDR,
//! non-blocking mode and multicast membership before binding. Each
//! channel exposes two handles over the same descriptor family: a mio
//! socket owned by the reactor thread for receives, and cloneable
//! plain sockets for the send paths (UDP sends are thread-safe, so
//! workers transmit without handing datagrams to the reactor).

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

/// Resolve a `host:port` string, honoring the `ipv6` dialect flag.
pub fn parse_bind_addr(address: &str, ipv6: bool) -> io::Result<SocketAddr> {
    let mut addrs = address.to_socket_addrs()?;
    addrs
        .find(|a| a.is_ipv6() == ipv6)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {} address for '{}'", if ipv6 { "IPv6" } else { "IPv4" }, address),
            )
        })
}

/// Resolve a multicast interface name (or dotted address) to its IPv4.
///
/// An empty name selects the kernel default (`0.0.0.0`).
pub fn resolve_miface(name: &str) -> io::Result<Ipv4Addr> {
    if name.is_empty() {
        return Ok(Ipv4Addr::UNSPECIFIED);
    }
    if let Ok(addr) = name.parse::<Ipv4Addr>() {
        return Ok(addr);
    }
    let ifas = local_ip_address::list_afinet_netifas()
        .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.to_string()))?;
    for (ifname, ip) in ifas {
        if ifname == name {
            if let IpAddr::V4(v4) = ip {
                return Ok(v4);
            }
        }
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("no IPv4 interface named '{}'", name),
    ))
}

/// Cloneable non-blocking send handle.
#[derive(Debug)]
pub struct UdpSender {
    socket: UdpSocket,
}

impl UdpSender {
    /// Best-effort send; `WouldBlock` surfaces to the caller, which
    /// retries on the next tick rather than spinning.
    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, addr)
    }

    pub fn try_clone(&self) -> io::Result<UdpSender> {
        Ok(UdpSender {
            socket: self.socket.try_clone()?,
        })
    }
}

/// One bound UDP socket with reactor and sender handles.
#[derive(Debug)]
pub struct UdpChannel {
    rx: mio::net::UdpSocket,
    tx: UdpSocket,
    local: SocketAddr,
}

impl UdpChannel {
    /// Bind a channel, joining the multicast group when `bind` names
    /// one. `miface` selects the join interface for multicast binds.
    pub fn bind(bind: SocketAddr, miface: &str) -> io::Result<Self> {
        let domain = if bind.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;

        let is_multicast = bind.ip().is_multicast();
        let bind_to = if is_multicast {
            // Receive the group on the wildcard, membership routes it.
            SocketAddr::new(
                if bind.is_ipv6() {
                    IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
                } else {
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
                },
                bind.port(),
            )
        } else {
            bind
        };
        socket.bind(&bind_to.into())?;

        let std_socket: UdpSocket = socket.into();
        if is_multicast {
            match bind.ip() {
                IpAddr::V4(group) => {
                    let iface = resolve_miface(miface)?;
                    std_socket.join_multicast_v4(&group, &iface)?;
                    log::debug!("[udp] joined multicast {} on iface {}", group, iface);
                }
                IpAddr::V6(group) => {
                    std_socket.join_multicast_v6(&group, 0)?;
                    log::debug!("[udp] joined multicast {}", group);
                }
            }
        }

        let local = std_socket.local_addr()?;
        let tx = std_socket.try_clone()?;
        let rx = mio::net::UdpSocket::from_std(std_socket);
        log::debug!("[udp] channel bound at {}", local);
        Ok(Self { rx, tx, local })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Clone a send handle for a worker thread.
    pub fn sender(&self) -> io::Result<UdpSender> {
        Ok(UdpSender {
            socket: self.tx.try_clone()?,
        })
    }

    /// Non-blocking receive; drained until `WouldBlock` by the reactor.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.rx.recv_from(buf)
    }

    /// Reactor registration hook.
    pub fn register(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
    ) -> io::Result<()> {
        use mio::Interest;
        registry.register(&mut self.rx, token, Interest::READABLE)
    }
}
