// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! EAP-SRP authenticator (SRP-6a, 2048-bit group, SHA-256).
//!
//! Produces the shared session key that seeds the per-peer keystore
//! when no pre-shared passphrase is configured. The exchange rides
//! SRP_STEP control TLVs:
//!
//! ```text
//! step 0  client -> server   ulen(1) | username | A
//! step 1  server -> client   slen(1) | salt | B
//! step 2  client -> server   M1 (32 bytes)
//! step 3  server -> client   M2 (32 bytes)
//! ```
//!
//! The server validates identities against a credential list, a
//! newline-delimited `user:verifier:salt` text file with hex-encoded
//! verifier and salt fields. Verifiers are `v = g^x mod N` with
//! `x = H(salt | H(user ":" password))`.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::OnceLock;

use num_bigint::{BigUint, RandBigInt};
use sha2::{Digest, Sha256};

/// RFC 5054 2048-bit group modulus.
const N_HEX: &str = "AC6BDB41324A9A9BF166DE5E1389582FAF72B6651987EE07FC3192943DB56050\
A37329CBB4A099ED8193E0757767A13DD52312AB4B03310DCD7F48A9DA04FD50\
E8083969EDB767B0CF6095179A163AB3661A05FBD5FAAAE82918A9962F0B93B8\
55F97993EC975EEAA80D740ADBF4FF747359D041D5C33EA71D281E446B14773B\
CA97B43A23FB801676BD207A436C6481F1D2B9078717461A5B9D32E688F87748\
544523B524B0D57D5EA77A2775D2ECFA032CFBDBF52FB3786160279004E57AE6\
AF874E7303CE53299CCC041C7BC308D82A5698F3A8D0C38271AE35F8E9DBFBB6\
94B5C803D89F7AE435DE236D525F54759B65E372FCD68EF20FA7111F9E4AFF73";

const G: u32 = 2;

fn group_n() -> &'static BigUint {
    static N: OnceLock<BigUint> = OnceLock::new();
    N.get_or_init(|| {
        BigUint::parse_bytes(N_HEX.as_bytes(), 16).unwrap_or_else(|| BigUint::from(0u8))
    })
}

fn group_g() -> BigUint {
    BigUint::from(G)
}

/// SRP exchange failure taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SrpError {
    /// Username absent from the credential list.
    UnknownUser(String),
    /// A or B was zero mod N (protocol abort per SRP-6a).
    IllegalParameter,
    /// Client or server proof mismatch.
    ProofMismatch,
    /// Step payload too short or out of order.
    Malformed,
}

impl std::fmt::Display for SrpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SrpError::UnknownUser(u) => write!(f, "unknown SRP user '{}'", u),
            SrpError::IllegalParameter => write!(f, "illegal SRP parameter"),
            SrpError::ProofMismatch => write!(f, "SRP proof mismatch"),
            SrpError::Malformed => write!(f, "malformed SRP step"),
        }
    }
}

impl std::error::Error for SrpError {}

/// One line of the credential file.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub verifier: BigUint,
    pub salt: Vec<u8>,
}

/// Parse a `user:verifier:salt` credential file.
///
/// Blank lines and lines starting with `#` are skipped; malformed
/// lines are logged and dropped rather than failing the whole file.
pub fn load_credentials(path: &Path) -> io::Result<Vec<Credential>> {
    let text = fs::read_to_string(path)?;
    let mut out = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(3, ':');
        let (user, ver_hex, salt_hex) = match (parts.next(), parts.next(), parts.next()) {
            (Some(u), Some(v), Some(s)) if !u.is_empty() => (u, v, s),
            _ => {
                log::warn!("[srp] skipping malformed credential line {}", lineno + 1);
                continue;
            }
        };
        let Some(verifier) = BigUint::parse_bytes(ver_hex.as_bytes(), 16) else {
            log::warn!("[srp] bad verifier hex on line {}", lineno + 1);
            continue;
        };
        let Some(salt) = hex_decode(salt_hex) else {
            log::warn!("[srp] bad salt hex on line {}", lineno + 1);
            continue;
        };
        out.push(Credential {
            username: user.to_string(),
            verifier,
            salt,
        });
    }
    Ok(out)
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Compute the password verifier `v = g^x mod N` for enrolment.
pub fn compute_verifier(username: &str, password: &str, salt: &[u8]) -> BigUint {
    let x = private_x(username, password, salt);
    group_g().modpow(&x, group_n())
}

fn private_x(username: &str, password: &str, salt: &[u8]) -> BigUint {
    let inner = Sha256::new()
        .chain_update(username.as_bytes())
        .chain_update(b":")
        .chain_update(password.as_bytes())
        .finalize();
    let outer = Sha256::new()
        .chain_update(salt)
        .chain_update(inner)
        .finalize();
    BigUint::from_bytes_be(&outer)
}

/// Left-pad to the group modulus width, per SRP-6a hashing rules.
fn pad(v: &BigUint) -> Vec<u8> {
    let n_len = (group_n().bits() as usize + 7) / 8;
    let bytes = v.to_bytes_be();
    let mut out = vec![0u8; n_len.saturating_sub(bytes.len())];
    out.extend_from_slice(&bytes);
    out
}

fn multiplier_k() -> BigUint {
    let digest = Sha256::new()
        .chain_update(group_n().to_bytes_be())
        .chain_update(pad(&group_g()))
        .finalize();
    BigUint::from_bytes_be(&digest)
}

fn scrambler_u(a_pub: &BigUint, b_pub: &BigUint) -> BigUint {
    let digest = Sha256::new()
        .chain_update(pad(a_pub))
        .chain_update(pad(b_pub))
        .finalize();
    BigUint::from_bytes_be(&digest)
}

fn session_hash(s: &BigUint) -> [u8; 32] {
    Sha256::digest(s.to_bytes_be()).into()
}

fn proof_m1(a_pub: &BigUint, b_pub: &BigUint, key: &[u8; 32]) -> [u8; 32] {
    Sha256::new()
        .chain_update(pad(a_pub))
        .chain_update(pad(b_pub))
        .chain_update(key)
        .finalize()
        .into()
}

fn proof_m2(a_pub: &BigUint, m1: &[u8; 32], key: &[u8; 32]) -> [u8; 32] {
    Sha256::new()
        .chain_update(pad(a_pub))
        .chain_update(m1)
        .chain_update(key)
        .finalize()
        .into()
}

/// Client side of one SRP exchange.
pub struct SrpClient {
    username: String,
    password: String,
    a: BigUint,
    a_pub: BigUint,
    key: Option<[u8; 32]>,
    m1: Option<[u8; 32]>,
}

impl SrpClient {
    pub fn new(username: &str, password: &str) -> Self {
        let mut rng = rand::thread_rng();
        let a = rng.gen_biguint(256);
        let a_pub = group_g().modpow(&a, group_n());
        Self {
            username: username.to_string(),
            password: password.to_string(),
            a,
            a_pub,
            key: None,
            m1: None,
        }
    }

    /// Step-0 payload: `ulen(1) | username | A`.
    pub fn start(&self) -> Vec<u8> {
        let user = self.username.as_bytes();
        let mut out = Vec::with_capacity(1 + user.len() + 256);
        out.push(user.len() as u8);
        out.extend_from_slice(user);
        out.extend_from_slice(&pad(&self.a_pub));
        out
    }

    /// Consume the step-1 challenge, producing the step-2 proof M1.
    pub fn handle_challenge(&mut self, payload: &[u8]) -> Result<Vec<u8>, SrpError> {
        let (&slen, rest) = payload.split_first().ok_or(SrpError::Malformed)?;
        let slen = usize::from(slen);
        if rest.len() <= slen {
            return Err(SrpError::Malformed);
        }
        let salt = &rest[..slen];
        let b_pub = BigUint::from_bytes_be(&rest[slen..]);
        if (&b_pub % group_n()) == BigUint::from(0u8) {
            return Err(SrpError::IllegalParameter);
        }

        let n = group_n();
        let x = private_x(&self.username, &self.password, salt);
        let k = multiplier_k();
        let u = scrambler_u(&self.a_pub, &b_pub);

        // S = (B - k * g^x) ^ (a + u * x) mod N
        let gx = group_g().modpow(&x, n);
        let kgx = (k * &gx) % n;
        let base = ((&b_pub % n) + n - kgx) % n;
        let exp = &self.a + &u * &x;
        let s = base.modpow(&exp, n);

        let key = session_hash(&s);
        let m1 = proof_m1(&self.a_pub, &b_pub, &key);
        self.key = Some(key);
        self.m1 = Some(m1);
        Ok(m1.to_vec())
    }

    /// Verify the step-3 server proof M2 and release the session key.
    pub fn verify_server(&self, payload: &[u8]) -> Result<[u8; 32], SrpError> {
        let (key, m1) = match (&self.key, &self.m1) {
            (Some(k), Some(m)) => (k, m),
            _ => return Err(SrpError::Malformed),
        };
        let expected = proof_m2(&self.a_pub, m1, key);
        if payload != expected.as_slice() {
            return Err(SrpError::ProofMismatch);
        }
        Ok(*key)
    }
}

/// Server side of one SRP exchange, validating against a credential list.
pub struct SrpServer {
    credentials: Vec<Credential>,
    state: Option<ServerState>,
}

struct ServerState {
    a_pub: BigUint,
    b_pub: BigUint,
    key: [u8; 32],
}

impl SrpServer {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self {
            credentials,
            state: None,
        }
    }

    /// Consume step 0, producing the step-1 challenge.
    pub fn handle_start(&mut self, payload: &[u8]) -> Result<Vec<u8>, SrpError> {
        let (&ulen, rest) = payload.split_first().ok_or(SrpError::Malformed)?;
        let ulen = usize::from(ulen);
        if rest.len() <= ulen {
            return Err(SrpError::Malformed);
        }
        let username =
            std::str::from_utf8(&rest[..ulen]).map_err(|_| SrpError::Malformed)?;
        let a_pub = BigUint::from_bytes_be(&rest[ulen..]);
        let n = group_n();
        if (&a_pub % n) == BigUint::from(0u8) {
            return Err(SrpError::IllegalParameter);
        }

        let cred = self
            .credentials
            .iter()
            .find(|c| c.username == username)
            .ok_or_else(|| SrpError::UnknownUser(username.to_string()))?
            .clone();

        let mut rng = rand::thread_rng();
        let b = rng.gen_biguint(256);
        let k = multiplier_k();
        // B = k*v + g^b mod N
        let b_pub = ((k * &cred.verifier) % n + group_g().modpow(&b, n)) % n;

        let u = scrambler_u(&a_pub, &b_pub);
        // S = (A * v^u) ^ b mod N
        let s = ((&a_pub % n) * cred.verifier.modpow(&u, n) % n).modpow(&b, n);
        let key = session_hash(&s);

        let mut out = Vec::with_capacity(1 + cred.salt.len() + 256);
        out.push(cred.salt.len() as u8);
        out.extend_from_slice(&cred.salt);
        out.extend_from_slice(&pad(&b_pub));

        self.state = Some(ServerState { a_pub, b_pub, key });
        Ok(out)
    }

    /// Consume the step-2 client proof, producing the step-3 proof M2.
    pub fn handle_proof(&mut self, payload: &[u8]) -> Result<Vec<u8>, SrpError> {
        let state = self.state.as_ref().ok_or(SrpError::Malformed)?;
        let expected = proof_m1(&state.a_pub, &state.b_pub, &state.key);
        if payload != expected.as_slice() {
            self.state = None;
            return Err(SrpError::ProofMismatch);
        }
        let m2 = proof_m2(&state.a_pub, &expected, &state.key);
        Ok(m2.to_vec())
    }

    /// Session key, available after a successful proof exchange.
    pub fn session_key(&self) -> Option<[u8; 32]> {
        self.state.as_ref().map(|s| s.key)
    }
}
