// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ristwork.dev

//! Pre-shared-key bulk cipher.
//!
//! Keys come from PBKDF2-SHA256 over the configured passphrase, salted
//! with the 16-byte nonce the handshake initiator picked. Media is
//! sealed with AES-128/256 in counter mode; the counter block is
//!
//! ```text
//! iv[0..8]  = salt[0..8]            (per-session prefix)
//! iv[8..16] = (seq << 32) | nonce_lo  (big-endian, increments per block)
//! ```
//!
//! so every packet owns a disjoint counter range as long as payloads
//! stay under 2^32 blocks, which the datagram budget guarantees.

use aes::cipher::{Iv, Key, KeyIvInit, StreamCipher};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::config::Encryption;

type Aes128Ctr = ctr::Ctr64BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr64BE<aes::Aes256>;

/// Derive key bytes from a passphrase with PBKDF2-SHA256.
///
/// Returns a 32-byte buffer; only the first `encryption.key_len()`
/// bytes are meaningful.
pub fn derive_key(passphrase: &str, salt: &[u8; 16], iterations: u32, encryption: Encryption) -> [u8; 32] {
    let mut out = [0u8; 32];
    let len = encryption.key_len().max(16);
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut out[..len]);
    out
}

/// One generation's AES-CTR cipher.
///
/// Counter mode is an XOR stream, so `apply` both seals and opens.
/// Key bytes are wiped on drop.
pub struct PskCipher {
    key: [u8; 32],
    iv_prefix: [u8; 8],
    nonce_lo: u32,
    encryption: Encryption,
}

impl std::fmt::Debug for PskCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key bytes never reach logs.
        f.debug_struct("PskCipher")
            .field("encryption", &self.encryption)
            .field("nonce_lo", &self.nonce_lo)
            .finish()
    }
}

impl PskCipher {
    pub fn new(key: [u8; 32], salt: &[u8; 16], nonce_lo: u32, encryption: Encryption) -> Self {
        let mut iv_prefix = [0u8; 8];
        iv_prefix.copy_from_slice(&salt[..8]);
        Self {
            key,
            iv_prefix,
            nonce_lo,
            encryption,
        }
    }

    /// Derive the generation key and build the cipher in one step.
    pub fn from_passphrase(
        passphrase: &str,
        salt: &[u8; 16],
        iterations: u32,
        nonce_lo: u32,
        encryption: Encryption,
    ) -> Self {
        let key = derive_key(passphrase, salt, iterations, encryption);
        Self::new(key, salt, nonce_lo, encryption)
    }

    /// Seal or open `buf` in place for the packet at `seq`.
    pub fn apply(&self, seq: u32, buf: &mut [u8]) {
        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&self.iv_prefix);
        let counter = (u64::from(seq) << 32) | u64::from(self.nonce_lo);
        iv[8..].copy_from_slice(&counter.to_be_bytes());

        match self.encryption {
            Encryption::Aes128 => {
                let mut cipher = Aes128Ctr::new(
                    Key::<Aes128Ctr>::from_slice(&self.key[..16]),
                    Iv::<Aes128Ctr>::from_slice(&iv),
                );
                cipher.apply_keystream(buf);
            }
            Encryption::Aes256 => {
                let mut cipher = Aes256Ctr::new(
                    Key::<Aes256Ctr>::from_slice(&self.key[..32]),
                    Iv::<Aes256Ctr>::from_slice(&iv),
                );
                cipher.apply_keystream(buf);
            }
            Encryption::None => {}
        }
    }
}

impl Drop for PskCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: [u8; 16] = [0x11; 16];

    #[test]
    fn test_derive_key_deterministic() {
        let a = derive_key("secret", &SALT, 1024, Encryption::Aes128);
        let b = derive_key("secret", &SALT, 1024, Encryption::Aes128);
        assert_eq!(a, b);
    }

    #[test]
    fn test_derive_key_salt_sensitivity() {
        let a = derive_key("secret", &SALT, 1024, Encryption::Aes256);
        let b = derive_key("secret", &[0x12; 16], 1024, Encryption::Aes256);
        assert_ne!(a, b);
    }

    #[test]
    fn test_seal_open_roundtrip_128() {
        let cipher = PskCipher::from_passphrase("hunter2", &SALT, 1024, 7, Encryption::Aes128);
        let plain = vec![0x47u8; 188];
        let mut buf = plain.clone();
        cipher.apply(1000, &mut buf);
        assert_ne!(buf, plain, "ciphertext equals plaintext");
        cipher.apply(1000, &mut buf);
        assert_eq!(buf, plain);
    }

    #[test]
    fn test_seal_open_roundtrip_256() {
        let cipher = PskCipher::from_passphrase("hunter2", &SALT, 1024, 7, Encryption::Aes256);
        let plain = vec![0xAAu8; 1316];
        let mut buf = plain.clone();
        cipher.apply(u32::MAX, &mut buf);
        cipher.apply(u32::MAX, &mut buf);
        assert_eq!(buf, plain);
    }

    #[test]
    fn test_sequences_get_distinct_keystreams() {
        let cipher = PskCipher::from_passphrase("s", &SALT, 128, 0, Encryption::Aes128);
        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        cipher.apply(1, &mut a);
        cipher.apply(2, &mut b);
        assert_ne!(a, b, "adjacent sequences reused a counter range");
    }

    #[test]
    fn test_wrong_key_garbles() {
        let seal = PskCipher::from_passphrase("right", &SALT, 128, 0, Encryption::Aes128);
        let open = PskCipher::from_passphrase("wrong", &SALT, 128, 0, Encryption::Aes128);
        let plain = vec![0x47u8; 188];
        let mut buf = plain.clone();
        seal.apply(5, &mut buf);
        open.apply(5, &mut buf);
        assert_ne!(buf, plain);
    }

    #[test]
    fn test_none_is_identity() {
        let cipher = PskCipher::from_passphrase("x", &SALT, 128, 0, Encryption::None);
        let mut buf = vec![1, 2, 3];
        cipher.apply(9, &mut buf);
        assert_eq!(buf, vec![1, 2, 3]);
    }
}
