//! Elliptic-curve Diffie-Hellman.
//!
//! - `ecdh-sha2-nistp256`, `ecdh-sha2-nistp384`, `ecdh-sha2-nistp521` (RFC 5656)
//! - `curve25519-sha256` (RFC 8731)
//!
//! Public values are exchanged as strings (`Q_C`, `Q_S`); the shared secret
//! is the x-coordinate (NIST curves) or the X25519 output, encoded as an mpint.

use halyard_platform::{HalyardError, HalyardResult};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;

use super::{KexFactory, KexHash, KexParam, KeyExchange, SharedSecret, ValueFormat};
use crate::ssh::registry::NamedFactory;

/// NIST curve selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcdhCurve {
    /// P-256 with SHA-256
    NistP256,
    /// P-384 with SHA-384
    NistP384,
    /// P-521 with SHA-512
    NistP521,
}

impl EcdhCurve {
    /// Method name.
    pub fn name(&self) -> &'static str {
        match self {
            EcdhCurve::NistP256 => "ecdh-sha2-nistp256",
            EcdhCurve::NistP384 => "ecdh-sha2-nistp384",
            EcdhCurve::NistP521 => "ecdh-sha2-nistp521",
        }
    }

    /// Hash bound to the curve size.
    pub fn hash(&self) -> KexHash {
        match self {
            EcdhCurve::NistP256 => KexHash::Sha256,
            EcdhCurve::NistP384 => KexHash::Sha384,
            EcdhCurve::NistP521 => KexHash::Sha512,
        }
    }
}

fn reject_params(name: &str, params: &[KexParam]) -> HalyardResult<()> {
    if params.is_empty() {
        Ok(())
    } else {
        Err(HalyardError::Config(format!(
            "{} takes no parameters, got {}",
            name,
            params.len()
        )))
    }
}

/// ECDH factory for one NIST curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcdhFactory(pub EcdhCurve);

impl NamedFactory for EcdhFactory {
    fn name(&self) -> &str {
        self.0.name()
    }
}

impl KexFactory for EcdhFactory {
    fn hash(&self) -> KexHash {
        self.0.hash()
    }

    fn create(&self, params: &[KexParam]) -> HalyardResult<Box<dyn KeyExchange>> {
        reject_params(self.0.name(), params)?;
        Ok(Box::new(EcdhExchange::new(self.0)))
    }
}

enum EphemeralKey {
    P256(p256::ecdh::EphemeralSecret),
    P384(p384::ecdh::EphemeralSecret),
    P521(p521::ecdh::EphemeralSecret),
}

enum PeerKey {
    P256(p256::PublicKey),
    P384(p384::PublicKey),
    P521(p521::PublicKey),
}

/// ECDH over a NIST curve.
pub struct EcdhExchange {
    curve: EcdhCurve,
    secret: Option<EphemeralKey>,
    peer: Option<PeerKey>,
}

impl EcdhExchange {
    /// Creates an exchange on `curve`.
    pub fn new(curve: EcdhCurve) -> Self {
        Self {
            curve,
            secret: None,
            peer: None,
        }
    }
}

impl KeyExchange for EcdhExchange {
    fn name(&self) -> &str {
        self.curve.name()
    }

    fn hash(&self) -> KexHash {
        self.curve.hash()
    }

    fn value_format(&self) -> ValueFormat {
        ValueFormat::String
    }

    fn initiate(&mut self) -> HalyardResult<Vec<u8>> {
        let (secret, public) = match self.curve {
            EcdhCurve::NistP256 => {
                let s = p256::ecdh::EphemeralSecret::random(&mut OsRng);
                let q = s.public_key().to_encoded_point(false).as_bytes().to_vec();
                (EphemeralKey::P256(s), q)
            }
            EcdhCurve::NistP384 => {
                let s = p384::ecdh::EphemeralSecret::random(&mut OsRng);
                let q = s.public_key().to_encoded_point(false).as_bytes().to_vec();
                (EphemeralKey::P384(s), q)
            }
            EcdhCurve::NistP521 => {
                let s = p521::ecdh::EphemeralSecret::random(&mut OsRng);
                let q = s.public_key().to_encoded_point(false).as_bytes().to_vec();
                (EphemeralKey::P521(s), q)
            }
        };
        self.secret = Some(secret);
        Ok(public)
    }

    fn consume_peer_value(&mut self, peer: &[u8]) -> HalyardResult<()> {
        let invalid = || {
            HalyardError::Protocol(format!("Invalid {} peer public point", self.curve.name()))
        };
        let key = match self.curve {
            EcdhCurve::NistP256 => {
                PeerKey::P256(p256::PublicKey::from_sec1_bytes(peer).map_err(|_| invalid())?)
            }
            EcdhCurve::NistP384 => {
                PeerKey::P384(p384::PublicKey::from_sec1_bytes(peer).map_err(|_| invalid())?)
            }
            EcdhCurve::NistP521 => {
                PeerKey::P521(p521::PublicKey::from_sec1_bytes(peer).map_err(|_| invalid())?)
            }
        };
        self.peer = Some(key);
        Ok(())
    }

    fn compute_shared_secret(&mut self) -> HalyardResult<SharedSecret> {
        let secret = self
            .secret
            .take()
            .ok_or_else(|| HalyardError::Protocol("ECDH exchange not initiated".to_string()))?;
        let peer = self
            .peer
            .as_ref()
            .ok_or_else(|| HalyardError::Protocol("ECDH peer value not received".to_string()))?;

        let k = match (secret, peer) {
            (EphemeralKey::P256(s), PeerKey::P256(p)) => {
                s.diffie_hellman(p).raw_secret_bytes().to_vec()
            }
            (EphemeralKey::P384(s), PeerKey::P384(p)) => {
                s.diffie_hellman(p).raw_secret_bytes().to_vec()
            }
            (EphemeralKey::P521(s), PeerKey::P521(p)) => {
                s.diffie_hellman(p).raw_secret_bytes().to_vec()
            }
            _ => {
                return Err(HalyardError::Protocol(
                    "ECDH curve mismatch".to_string(),
                ))
            }
        };
        Ok(SharedSecret::new(k))
    }
}

impl std::fmt::Debug for EcdhExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdhExchange")
            .field("curve", &self.curve)
            .finish_non_exhaustive()
    }
}

/// `curve25519-sha256` factory.
#[derive(Debug, Clone, Copy, Default)]
pub struct Curve25519Factory;

impl NamedFactory for Curve25519Factory {
    fn name(&self) -> &str {
        "curve25519-sha256"
    }
}

impl KexFactory for Curve25519Factory {
    fn hash(&self) -> KexHash {
        KexHash::Sha256
    }

    fn create(&self, params: &[KexParam]) -> HalyardResult<Box<dyn KeyExchange>> {
        reject_params(self.name(), params)?;
        Ok(Box::new(Curve25519Exchange::new()))
    }
}

/// X25519 exchange backed by `ring`.
pub struct Curve25519Exchange {
    private_key: Option<EphemeralPrivateKey>,
    peer: Option<[u8; 32]>,
}

impl Curve25519Exchange {
    /// Creates an exchange; keys are generated by `initiate`.
    pub fn new() -> Self {
        Self {
            private_key: None,
            peer: None,
        }
    }
}

impl Default for Curve25519Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyExchange for Curve25519Exchange {
    fn name(&self) -> &str {
        "curve25519-sha256"
    }

    fn hash(&self) -> KexHash {
        KexHash::Sha256
    }

    fn value_format(&self) -> ValueFormat {
        ValueFormat::String
    }

    fn initiate(&mut self) -> HalyardResult<Vec<u8>> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng).map_err(|_| {
            HalyardError::Security("Failed to generate Curve25519 key".to_string())
        })?;
        let public_key = private_key.compute_public_key().map_err(|_| {
            HalyardError::Security("Failed to compute Curve25519 public key".to_string())
        })?;
        self.private_key = Some(private_key);
        Ok(public_key.as_ref().to_vec())
    }

    fn consume_peer_value(&mut self, peer: &[u8]) -> HalyardResult<()> {
        let peer: [u8; 32] = peer.try_into().map_err(|_| {
            HalyardError::Protocol(format!(
                "Curve25519 public key must be 32 bytes, got {}",
                peer.len()
            ))
        })?;
        self.peer = Some(peer);
        Ok(())
    }

    fn compute_shared_secret(&mut self) -> HalyardResult<SharedSecret> {
        let private_key = self
            .private_key
            .take()
            .ok_or_else(|| HalyardError::Protocol("Curve25519 exchange not initiated".to_string()))?;
        let peer = self.peer.ok_or_else(|| {
            HalyardError::Protocol("Curve25519 peer value not received".to_string())
        })?;

        let peer_public_key = UnparsedPublicKey::new(&X25519, peer);
        let k = agree_ephemeral(private_key, &peer_public_key, |key_material| {
            key_material.to_vec()
        })
        .map_err(|_| HalyardError::Protocol("Curve25519 key agreement failed".to_string()))?;

        if k.iter().all(|&b| b == 0) {
            return Err(HalyardError::Protocol(
                "Curve25519 shared secret is zero".to_string(),
            ));
        }
        Ok(SharedSecret::new(k))
    }
}

impl std::fmt::Debug for Curve25519Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Curve25519Exchange").finish_non_exhaustive()
    }
}
