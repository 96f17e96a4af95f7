//! Packet ciphers.
//!
//! - `aes128-ctr`, `aes192-ctr`, `aes256-ctr` (RFC 4344)
//! - `none` (only before the first key exchange completes)

use std::sync::Arc;

use aes::{Aes128, Aes192, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use halyard_platform::{HalyardError, HalyardResult};

use super::registry::NamedFactory;

/// A keyed cipher instance for one direction.
pub trait Cipher: Send {
    /// Block size used for padding alignment.
    fn block_size(&self) -> usize;

    /// Encrypts or decrypts `data` in place, continuing the keystream.
    fn apply(&mut self, data: &mut [u8]);
}

/// Creates [`Cipher`] instances for one algorithm name.
pub trait CipherFactory: NamedFactory + Send + Sync {
    /// Key length in bytes.
    fn key_len(&self) -> usize;

    /// IV length in bytes.
    fn iv_len(&self) -> usize;

    /// Block size in bytes.
    fn block_size(&self) -> usize;

    /// Builds a cipher from derived key material.
    ///
    /// `key` and `iv` may be longer than needed; only the prefix is used.
    fn create(&self, key: &[u8], iv: &[u8]) -> HalyardResult<Box<dyn Cipher>>;
}

/// Builtin cipher factories in preference order.
pub fn builtin_factories() -> Vec<Arc<dyn CipherFactory>> {
    vec![
        Arc::new(AesCtrFactory::Aes128),
        Arc::new(AesCtrFactory::Aes192),
        Arc::new(AesCtrFactory::Aes256),
        Arc::new(NoneCipherFactory),
    ]
}

/// AES in counter mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AesCtrFactory {
    /// aes128-ctr
    Aes128,
    /// aes192-ctr
    Aes192,
    /// aes256-ctr
    Aes256,
}

impl NamedFactory for AesCtrFactory {
    fn name(&self) -> &str {
        match self {
            AesCtrFactory::Aes128 => "aes128-ctr",
            AesCtrFactory::Aes192 => "aes192-ctr",
            AesCtrFactory::Aes256 => "aes256-ctr",
        }
    }
}

impl CipherFactory for AesCtrFactory {
    fn key_len(&self) -> usize {
        match self {
            AesCtrFactory::Aes128 => 16,
            AesCtrFactory::Aes192 => 24,
            AesCtrFactory::Aes256 => 32,
        }
    }

    fn iv_len(&self) -> usize {
        16
    }

    fn block_size(&self) -> usize {
        16
    }

    fn create(&self, key: &[u8], iv: &[u8]) -> HalyardResult<Box<dyn Cipher>> {
        if key.len() < self.key_len() || iv.len() < self.iv_len() {
            return Err(HalyardError::Security(format!(
                "Insufficient key material for {}: key {} bytes, iv {} bytes",
                self.name(),
                key.len(),
                iv.len()
            )));
        }
        let key = &key[..self.key_len()];
        let iv = &iv[..self.iv_len()];
        let invalid = |_| HalyardError::Security(format!("Invalid key length for {}", self.name()));

        let state = match self {
            AesCtrFactory::Aes128 => {
                AesCtr::Aes128(Ctr128BE::<Aes128>::new_from_slices(key, iv).map_err(invalid)?)
            }
            AesCtrFactory::Aes192 => {
                AesCtr::Aes192(Ctr128BE::<Aes192>::new_from_slices(key, iv).map_err(invalid)?)
            }
            AesCtrFactory::Aes256 => {
                AesCtr::Aes256(Ctr128BE::<Aes256>::new_from_slices(key, iv).map_err(invalid)?)
            }
        };
        Ok(Box::new(state))
    }
}

enum AesCtr {
    Aes128(Ctr128BE<Aes128>),
    Aes192(Ctr128BE<Aes192>),
    Aes256(Ctr128BE<Aes256>),
}

impl Cipher for AesCtr {
    fn block_size(&self) -> usize {
        16
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            AesCtr::Aes128(c) => c.apply_keystream(data),
            AesCtr::Aes192(c) => c.apply_keystream(data),
            AesCtr::Aes256(c) => c.apply_keystream(data),
        }
    }
}

impl std::fmt::Debug for AesCtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesCtr").finish_non_exhaustive()
    }
}

/// The `none` cipher.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneCipherFactory;

impl NamedFactory for NoneCipherFactory {
    fn name(&self) -> &str {
        "none"
    }
}

impl CipherFactory for NoneCipherFactory {
    fn key_len(&self) -> usize {
        0
    }

    fn iv_len(&self) -> usize {
        0
    }

    fn block_size(&self) -> usize {
        8
    }

    fn create(&self, _key: &[u8], _iv: &[u8]) -> HalyardResult<Box<dyn Cipher>> {
        Ok(Box::new(NoneCipher))
    }
}

/// Identity cipher.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneCipher;

impl Cipher for NoneCipher {
    fn block_size(&self) -> usize {
        8
    }

    fn apply(&mut self, _data: &mut [u8]) {}
}
