//! Message authentication codes.
//!
//! Encrypt-and-MAC (RFC 4253 Section 6.4): the MAC covers
//! `uint32 sequence_number || unencrypted packet`.

use std::sync::Arc;

use halyard_platform::{HalyardError, HalyardResult};
use hmac::{Hmac, Mac as _};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::registry::NamedFactory;

/// A keyed MAC for one direction.
pub trait Mac: Send {
    /// Output length in bytes.
    fn mac_len(&self) -> usize;

    /// Computes the MAC of `packet` under sequence number `sequence`.
    fn compute(&self, sequence: u32, packet: &[u8]) -> Vec<u8>;

    /// Verifies `received` in constant time.
    fn verify(&self, sequence: u32, packet: &[u8], received: &[u8]) -> HalyardResult<()> {
        let computed = self.compute(sequence, packet);
        if computed.len() != received.len() {
            return Err(HalyardError::Security("MAC length mismatch".to_string()));
        }
        if computed.ct_eq(received).into() {
            Ok(())
        } else {
            Err(HalyardError::Security("MAC verification failed".to_string()))
        }
    }
}

/// Creates [`Mac`] instances for one algorithm name.
pub trait MacFactory: NamedFactory + Send + Sync {
    /// Key length in bytes.
    fn key_len(&self) -> usize;

    /// Output length in bytes.
    fn mac_len(&self) -> usize;

    /// Builds a MAC from derived key material (prefix used).
    fn create(&self, key: &[u8]) -> HalyardResult<Box<dyn Mac>>;
}

/// Builtin MAC factories in preference order.
pub fn builtin_factories() -> Vec<Arc<dyn MacFactory>> {
    vec![
        Arc::new(HmacFactory::Sha256),
        Arc::new(HmacFactory::Sha512),
        Arc::new(HmacFactory::Sha1),
        Arc::new(NoneMacFactory),
    ]
}

/// HMAC variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmacFactory {
    /// hmac-sha2-256
    Sha256,
    /// hmac-sha2-512
    Sha512,
    /// hmac-sha1
    Sha1,
}

impl NamedFactory for HmacFactory {
    fn name(&self) -> &str {
        match self {
            HmacFactory::Sha256 => "hmac-sha2-256",
            HmacFactory::Sha512 => "hmac-sha2-512",
            HmacFactory::Sha1 => "hmac-sha1",
        }
    }
}

impl MacFactory for HmacFactory {
    fn key_len(&self) -> usize {
        self.mac_len()
    }

    fn mac_len(&self) -> usize {
        match self {
            HmacFactory::Sha256 => 32,
            HmacFactory::Sha512 => 64,
            HmacFactory::Sha1 => 20,
        }
    }

    fn create(&self, key: &[u8]) -> HalyardResult<Box<dyn Mac>> {
        if key.len() < self.key_len() {
            return Err(HalyardError::Security(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                self.key_len(),
                key.len()
            )));
        }
        Ok(Box::new(HmacKey {
            variant: *self,
            key: Zeroizing::new(key[..self.key_len()].to_vec()),
        }))
    }
}

struct HmacKey {
    variant: HmacFactory,
    key: Zeroizing<Vec<u8>>,
}

impl HmacKey {
    fn digest<M: hmac::Mac + hmac::digest::KeyInit>(&self, sequence: u32, packet: &[u8]) -> Vec<u8> {
        // HMAC accepts keys of any length
        let mut mac = match <M as hmac::digest::KeyInit>::new_from_slice(&self.key) {
            Ok(mac) => mac,
            Err(_) => return Vec::new(),
        };
        mac.update(&sequence.to_be_bytes());
        mac.update(packet);
        mac.finalize().into_bytes().to_vec()
    }
}

impl Mac for HmacKey {
    fn mac_len(&self) -> usize {
        self.variant.mac_len()
    }

    fn compute(&self, sequence: u32, packet: &[u8]) -> Vec<u8> {
        match self.variant {
            HmacFactory::Sha256 => self.digest::<Hmac<Sha256>>(sequence, packet),
            HmacFactory::Sha512 => self.digest::<Hmac<Sha512>>(sequence, packet),
            HmacFactory::Sha1 => self.digest::<Hmac<Sha1>>(sequence, packet),
        }
    }
}

impl std::fmt::Debug for HmacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacKey")
            .field("algorithm", &self.variant.name())
            .field("key", &"<redacted>")
            .finish()
    }
}

/// The `none` MAC.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneMacFactory;

impl NamedFactory for NoneMacFactory {
    fn name(&self) -> &str {
        "none"
    }
}

impl MacFactory for NoneMacFactory {
    fn key_len(&self) -> usize {
        0
    }

    fn mac_len(&self) -> usize {
        0
    }

    fn create(&self, _key: &[u8]) -> HalyardResult<Box<dyn Mac>> {
        Ok(Box::new(NoneMac))
    }
}

/// Empty MAC.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneMac;

impl Mac for NoneMac {
    fn mac_len(&self) -> usize {
        0
    }

    fn compute(&self, _sequence: u32, _packet: &[u8]) -> Vec<u8> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_compute_and_verify() {
        let mac = HmacFactory::Sha256.create(&[0x42; 32]).unwrap();
        let tag = mac.compute(3, b"packet");
        assert_eq!(tag.len(), 32);
        assert!(mac.verify(3, b"packet", &tag).is_ok());
    }

    #[test]
    fn test_sequence_number_is_authenticated() {
        let mac = HmacFactory::Sha512.create(&[1u8; 64]).unwrap();
        let tag = mac.compute(7, b"data");
        assert!(matches!(
            mac.verify(8, b"data", &tag),
            Err(HalyardError::Security(_))
        ));
    }

    #[test]
    fn test_tampered_tag_rejected() {
        let mac = HmacFactory::Sha1.create(&[5u8; 20]).unwrap();
        let mut tag = mac.compute(0, b"data");
        tag[0] ^= 1;
        assert!(mac.verify(0, b"data", &tag).is_err());
        assert!(mac.verify(0, b"data", &tag[..10]).is_err());
    }

    #[test]
    fn test_rfc4231_case_2() {
        // HMAC-SHA-256 with key "Jefe"; the sequence prefix is part of the data
        // so feed "what do ya want for nothing?" split as seq || rest.
        let data = b"what do ya want for nothing?";
        let seq = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let key = HmacKey {
            variant: HmacFactory::Sha256,
            key: Zeroizing::new(b"Jefe".to_vec()),
        };
        assert_eq!(
            hex::encode(key.compute(seq, &data[4..])),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_insufficient_key_material() {
        assert!(HmacFactory::Sha256.create(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_none_mac_is_empty() {
        let mac = NoneMacFactory.create(&[]).unwrap();
        assert!(mac.compute(1, b"x").is_empty());
        assert!(mac.verify(1, b"x", &[]).is_ok());
    }
}
