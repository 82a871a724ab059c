// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! URL parsing for peer and bridge endpoints.
//!
//! Two families are understood:
//!
//! - `rist://[@]host:port?param=value&...` and `rist6://...` produce a
//!   [`PeerConfig`]; the `@` prefix selects listening mode.
//! - `udp://host:port?...` and `rtp://host:port?...` describe the CLI
//!   bridge sockets ([`UdpUrl`]); the `rtp` scheme implies RTP header
//!   stripping on input.
//!
//! Unknown parameters are config errors (fatal at context init), not
//! warnings: a typoed `secrt=` must not silently run unencrypted.

use crate::config::{BloatMode, Encryption, PeerConfig};

/// URL parsing failure taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlError {
    UnknownScheme(String),
    MissingAddress,
    UnknownParameter(String),
    InvalidValue { param: String, value: String },
    /// stream-id LSB is reserved; ids must be even.
    OddStreamId(u16),
}

impl std::fmt::Display for UrlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UrlError::UnknownScheme(s) => write!(f, "unknown URL scheme '{}'", s),
            UrlError::MissingAddress => write!(f, "URL is missing host:port"),
            UrlError::UnknownParameter(p) => write!(f, "unknown URL parameter '{}'", p),
            UrlError::InvalidValue { param, value } => {
                write!(f, "invalid value '{}' for parameter '{}'", value, param)
            }
            UrlError::OddStreamId(id) => {
                write!(f, "stream-id {} must be even (LSB is reserved)", id)
            }
        }
    }
}

impl std::error::Error for UrlError {}

/// A parsed `udp://` or `rtp://` bridge endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpUrl {
    pub address: String,
    pub miface: String,
    pub stream_id: u16,
    /// Strip the 12-byte RTP header from input datagrams.
    pub rtp: bool,
    /// Convert the RTP 90 kHz timestamp to NTP and pass it through.
    pub rtp_timestamp: bool,
    /// Adopt the RTP sequence as the flow sequence.
    pub rtp_sequence: bool,
}

fn split_scheme(url: &str) -> Result<(&str, &str), UrlError> {
    url.split_once("://")
        .ok_or_else(|| UrlError::UnknownScheme(url.to_string()))
}

fn split_params(rest: &str) -> (&str, Vec<(String, String)>) {
    match rest.split_once('?') {
        Some((addr, query)) => {
            let params = query
                .split('&')
                .filter(|kv| !kv.is_empty())
                .map(|kv| match kv.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (kv.to_string(), String::new()),
                })
                .collect();
            (addr, params)
        }
        None => (rest, Vec::new()),
    }
}

fn numeric<T: std::str::FromStr>(param: &str, value: &str) -> Result<T, UrlError> {
    value.parse().map_err(|_| UrlError::InvalidValue {
        param: param.to_string(),
        value: value.to_string(),
    })
}

/// Parse a `rist://` / `rist6://` URL into a peer configuration.
pub fn parse_rist_url(url: &str) -> Result<PeerConfig, UrlError> {
    let (scheme, rest) = split_scheme(url)?;
    let ipv6 = match scheme {
        "rist" => false,
        "rist6" => true,
        other => return Err(UrlError::UnknownScheme(other.to_string())),
    };

    let (addr, params) = split_params(rest);
    let (listening, addr) = match addr.strip_prefix('@') {
        Some(stripped) => (true, stripped),
        None => (false, addr),
    };
    if addr.is_empty() {
        return Err(UrlError::MissingAddress);
    }

    let mut config = PeerConfig {
        address: addr.to_string(),
        listening,
        ipv6,
        ..PeerConfig::default()
    };

    for (key, value) in params {
        match key.as_str() {
            "buffer" => {
                let ms: u32 = numeric(&key, &value)?;
                config.recovery_length_min = ms;
                config.recovery_length_max = ms;
            }
            "bandwidth" => {
                let kbps: u32 = numeric(&key, &value)?;
                config.recovery_maxbitrate = kbps.div_ceil(1000);
            }
            "reorder-size" => config.reorder_buffer = numeric(&key, &value)?,
            "rtt-min" => config.rtt_min = numeric(&key, &value)?,
            "rtt-max" => config.rtt_max = numeric(&key, &value)?,
            "cname" => config.cname = value,
            "secret" => config.secret = value,
            "aes-type" => {
                config.encryption = match value.as_str() {
                    "128" => Encryption::Aes128,
                    "256" => Encryption::Aes256,
                    _ => {
                        return Err(UrlError::InvalidValue {
                            param: key,
                            value,
                        })
                    }
                }
            }
            "bloat-mode" => {
                config.bloat_mode = match value.as_str() {
                    "off" => BloatMode::Off,
                    "normal" => BloatMode::Normal,
                    "aggressive" => BloatMode::Aggressive,
                    _ => {
                        return Err(UrlError::InvalidValue {
                            param: key,
                            value,
                        })
                    }
                }
            }
            "stream-id" => {
                let id: u16 = numeric(&key, &value)?;
                if id % 2 != 0 {
                    return Err(UrlError::OddStreamId(id));
                }
                config.virt_dst_port = id;
            }
            "weight" => config.weight = numeric(&key, &value)?,
            "virt-dst-port" => {
                let port: u16 = numeric(&key, &value)?;
                if port % 2 != 0 {
                    return Err(UrlError::OddStreamId(port));
                }
                config.virt_dst_port = port;
            }
            "miface" => config.miface = value,
            _ => return Err(UrlError::UnknownParameter(key)),
        }
    }
    Ok(config)
}

/// Parse a `udp://` / `rtp://` URL for the CLI bridges.
pub fn parse_udp_url(url: &str) -> Result<UdpUrl, UrlError> {
    let (scheme, rest) = split_scheme(url)?;
    let rtp = match scheme {
        "udp" => false,
        "rtp" => true,
        other => return Err(UrlError::UnknownScheme(other.to_string())),
    };

    let (addr, params) = split_params(rest);
    if addr.is_empty() {
        return Err(UrlError::MissingAddress);
    }

    let mut out = UdpUrl {
        address: addr.to_string(),
        miface: String::new(),
        stream_id: 0,
        rtp,
        rtp_timestamp: false,
        rtp_sequence: false,
    };

    for (key, value) in params {
        match key.as_str() {
            "miface" => out.miface = value,
            "stream-id" => {
                let id: u16 = numeric(&key, &value)?;
                if id % 2 != 0 {
                    return Err(UrlError::OddStreamId(id));
                }
                out.stream_id = id;
            }
            "rtp-timestamp" => out.rtp_timestamp = value != "0",
            "rtp-sequence" => out.rtp_sequence = value != "0",
            _ => return Err(UrlError::UnknownParameter(key)),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_rist_url() {
        let config = parse_rist_url("rist://10.0.0.1:1968").unwrap();
        assert_eq!(config.address, "10.0.0.1:1968");
        assert!(!config.listening);
        assert!(!config.ipv6);
    }

    #[test]
    fn test_listening_prefix() {
        let config = parse_rist_url("rist://@0.0.0.0:1968").unwrap();
        assert!(config.listening);
        assert_eq!(config.address, "0.0.0.0:1968");
    }

    #[test]
    fn test_rist6_scheme() {
        let config = parse_rist_url("rist6://[::1]:1968").unwrap();
        assert!(config.ipv6);
    }

    #[test]
    fn test_full_parameter_set() {
        let config = parse_rist_url(
            "rist://10.0.0.1:1968?buffer=500&bandwidth=12000&reorder-size=30&rtt-min=40\
             &rtt-max=400&cname=edge-a&secret=hunter2&aes-type=256&bloat-mode=aggressive\
             &stream-id=2000&weight=5&miface=eth0",
        )
        .unwrap();
        assert_eq!(config.recovery_length_min, 500);
        assert_eq!(config.recovery_length_max, 500);
        assert_eq!(config.recovery_maxbitrate, 12);
        assert_eq!(config.reorder_buffer, 30);
        assert_eq!(config.rtt_min, 40);
        assert_eq!(config.rtt_max, 400);
        assert_eq!(config.cname, "edge-a");
        assert_eq!(config.secret, "hunter2");
        assert_eq!(config.encryption, Encryption::Aes256);
        assert_eq!(config.bloat_mode, BloatMode::Aggressive);
        assert_eq!(config.virt_dst_port, 2000);
        assert_eq!(config.weight, 5);
        assert_eq!(config.miface, "eth0");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_odd_stream_id_rejected() {
        assert_eq!(
            parse_rist_url("rist://h:1?stream-id=3"),
            Err(UrlError::OddStreamId(3))
        );
    }

    #[test]
    fn test_unknown_parameter_is_fatal() {
        assert_eq!(
            parse_rist_url("rist://h:1?secrt=oops"),
            Err(UrlError::UnknownParameter("secrt".into()))
        );
    }

    #[test]
    fn test_bad_values() {
        assert!(matches!(
            parse_rist_url("rist://h:1?buffer=fast"),
            Err(UrlError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse_rist_url("rist://h:1?aes-type=192"),
            Err(UrlError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse_rist_url("rist://h:1?bloat-mode=maybe"),
            Err(UrlError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_unknown_scheme() {
        assert!(matches!(
            parse_rist_url("http://example.com"),
            Err(UrlError::UnknownScheme(_))
        ));
        assert!(matches!(
            parse_udp_url("rist://h:1"),
            Err(UrlError::UnknownScheme(_))
        ));
    }

    #[test]
    fn test_udp_url() {
        let url = parse_udp_url("udp://127.0.0.1:5000?miface=eth1&stream-id=100").unwrap();
        assert_eq!(url.address, "127.0.0.1:5000");
        assert_eq!(url.miface, "eth1");
        assert_eq!(url.stream_id, 100);
        assert!(!url.rtp);
    }

    #[test]
    fn test_rtp_url_options() {
        let url = parse_udp_url("rtp://0.0.0.0:5004?rtp-timestamp=1&rtp-sequence=1").unwrap();
        assert!(url.rtp);
        assert!(url.rtp_timestamp);
        assert!(url.rtp_sequence);
    }

    #[test]
    fn test_bandwidth_rounds_up() {
        let config = parse_rist_url("rist://h:1?bandwidth=1500").unwrap();
        assert_eq!(config.recovery_maxbitrate, 2);
    }
}
