//! SSH key exchange (KEX) implementation (RFC 4253 Section 7).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT / SSH_MSG_NEWKEYS and algorithm negotiation ([`proposal`])
//! - Finite-field Diffie-Hellman with fixed groups and group exchange ([`dh`])
//! - Elliptic-curve Diffie-Hellman over NIST curves and Curve25519 ([`ecdh`])
//! - Exchange hash computation and session key derivation ([`derive`])
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (client's first match wins)
//! 3. Method specific exchange producing `K` and `H`
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Each direction switches to the derived keys
//!
//! # Example
//!
//! ```rust
//! use halyard_proto::ssh::kex::{ExchangeTranscript, ValueFormat};
//! use halyard_proto::ssh::registry::AlgorithmRegistry;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = AlgorithmRegistry::global().kex.require("ecdh-sha2-nistp256")?;
//! let mut client = factory.create(&[])?;
//! let mut server = factory.create(&[])?;
//!
//! let q_c = client.initiate()?;
//! let q_s = server.initiate()?;
//! client.consume_peer_value(&q_s)?;
//! server.consume_peer_value(&q_c)?;
//!
//! let k_client = client.compute_shared_secret()?;
//! let k_server = server.compute_shared_secret()?;
//! assert_eq!(k_client.as_bytes(), k_server.as_bytes());
//! assert_eq!(client.value_format(), ValueFormat::String);
//! # Ok(())
//! # }
//! ```

pub mod derive;
pub mod dh;
pub mod ecdh;
pub mod groups;
pub mod proposal;

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use halyard_platform::HalyardResult;
use num_bigint::BigUint;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use zeroize::Zeroizing;

use super::registry::NamedFactory;
use super::wire;

pub use derive::{derive_key, DirectionKeys, KeyLengths, SessionKeys};
pub use dh::{DhExchange, DhGexFactory, DhGroupFactory};
pub use ecdh::{Curve25519Exchange, Curve25519Factory, EcdhCurve, EcdhExchange, EcdhFactory};
pub use groups::{BuiltinGroups, DhGroup, GroupProvider};
pub use proposal::{
    negotiate, negotiate_algorithm, AlgorithmProposal, KexInit, NegotiatedAlgorithms, NewKeys,
};

/// Hash function of a key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KexHash {
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl KexHash {
    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            KexHash::Sha1 => 20,
            KexHash::Sha256 => 32,
            KexHash::Sha384 => 48,
            KexHash::Sha512 => 64,
        }
    }

    /// Hashes `data`.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            KexHash::Sha1 => Sha1::digest(data).to_vec(),
            KexHash::Sha256 => Sha256::digest(data).to_vec(),
            KexHash::Sha384 => Sha384::digest(data).to_vec(),
            KexHash::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// How public values appear in messages and in the exchange hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFormat {
    /// `mpint` (finite-field DH `e`, `f`)
    Mpint,
    /// `string` (ECDH `Q_C`, `Q_S`)
    String,
}

/// Shared secret `K` as an unsigned big-endian magnitude.
#[derive(Clone)]
pub struct SharedSecret(Zeroizing<Vec<u8>>);

impl SharedSecret {
    /// Wraps raw big-endian bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Raw magnitude.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// `mpint` encoding used in hashes.
    pub fn to_mpint(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(wire::encode_mpint(&self.0))
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SharedSecret").field(&"<redacted>").finish()
    }
}

/// Parameters passed to [`KexFactory::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KexParam {
    /// An integer (group exchange `p` and `g`).
    Int(BigUint),
    /// Opaque bytes for extension methods.
    Bytes(Vec<u8>),
}

/// Group exchange request and the group chosen for it (RFC 4419).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupExchangeParams {
    /// Minimal acceptable group size in bits.
    pub min: u32,
    /// Preferred group size in bits.
    pub preferred: u32,
    /// Maximal acceptable group size in bits.
    pub max: u32,
    /// Group sent by the server.
    pub group: DhGroup,
}

/// Inputs of the exchange hash `H`.
#[derive(Debug)]
pub struct ExchangeTranscript<'a> {
    /// `V_C`, without CR LF.
    pub client_version: &'a str,
    /// `V_S`, without CR LF.
    pub server_version: &'a str,
    /// `I_C`, the client's KEXINIT payload.
    pub client_kexinit: &'a [u8],
    /// `I_S`, the server's KEXINIT payload.
    pub server_kexinit: &'a [u8],
    /// `K_S`, the server host key blob.
    pub host_key: &'a [u8],
    /// Group exchange values, for `diffie-hellman-group-exchange-*`.
    pub group_exchange: Option<&'a GroupExchangeParams>,
    /// Client public value (`e` or `Q_C`).
    pub client_value: &'a [u8],
    /// Server public value (`f` or `Q_S`).
    pub server_value: &'a [u8],
    /// `K`.
    pub shared_secret: &'a SharedSecret,
}

/// Computes `H` for a transcript.
///
/// ```text
/// H = HASH(string V_C || string V_S || string I_C || string I_S || string K_S
///          [|| uint32 min || uint32 n || uint32 max || mpint p || mpint g]
///          || e/Q_C || f/Q_S || mpint K)
/// ```
pub fn exchange_hash(
    hash: KexHash,
    format: ValueFormat,
    transcript: &ExchangeTranscript<'_>,
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    wire::write_string(&mut buf, transcript.client_version);
    wire::write_string(&mut buf, transcript.server_version);
    wire::write_bytes(&mut buf, transcript.client_kexinit);
    wire::write_bytes(&mut buf, transcript.server_kexinit);
    wire::write_bytes(&mut buf, transcript.host_key);

    if let Some(gex) = transcript.group_exchange {
        buf.put_u32(gex.min);
        buf.put_u32(gex.preferred);
        buf.put_u32(gex.max);
        wire::write_mpint(&mut buf, &gex.group.p.to_bytes_be());
        wire::write_mpint(&mut buf, &gex.group.g.to_bytes_be());
    }

    match format {
        ValueFormat::Mpint => {
            wire::write_mpint(&mut buf, transcript.client_value);
            wire::write_mpint(&mut buf, transcript.server_value);
        }
        ValueFormat::String => {
            wire::write_bytes(&mut buf, transcript.client_value);
            wire::write_bytes(&mut buf, transcript.server_value);
        }
    }
    buf.put_slice(&transcript.shared_secret.to_mpint());

    let digest = hash.digest(&buf);
    // The transcript contains K
    buf.fill(0);
    digest
}

/// One in-progress key exchange.
///
/// Call order: [`initiate`](Self::initiate), then
/// [`consume_peer_value`](Self::consume_peer_value), then
/// [`compute_shared_secret`](Self::compute_shared_secret).
pub trait KeyExchange: Send {
    /// Method name.
    fn name(&self) -> &str;

    /// Hash used for `H` and key derivation.
    fn hash(&self) -> KexHash;

    /// Encoding of public values.
    fn value_format(&self) -> ValueFormat;

    /// Generates the ephemeral key pair and returns our public value.
    fn initiate(&mut self) -> HalyardResult<Vec<u8>>;

    /// Validates and stores the peer's public value.
    fn consume_peer_value(&mut self, peer: &[u8]) -> HalyardResult<()>;

    /// Computes `K`; consumes the ephemeral private key.
    fn compute_shared_secret(&mut self) -> HalyardResult<SharedSecret>;

    /// Computes `H` over the transcript.
    fn compute_exchange_hash(&self, transcript: &ExchangeTranscript<'_>) -> HalyardResult<Vec<u8>> {
        Ok(exchange_hash(self.hash(), self.value_format(), transcript))
    }
}

/// Creates [`KeyExchange`] instances for one method name.
pub trait KexFactory: NamedFactory + Send + Sync {
    /// Hash of the method.
    fn hash(&self) -> KexHash;

    /// Whether the method negotiates its group first (RFC 4419).
    ///
    /// Group exchange factories take `[Int(p), Int(g)]` in
    /// [`create`](Self::create).
    fn is_group_exchange(&self) -> bool {
        false
    }

    /// Creates an exchange; parameter count and types are checked here.
    fn create(&self, params: &[KexParam]) -> HalyardResult<Box<dyn KeyExchange>>;
}

/// Builtin key exchange factories in preference order.
pub fn builtin_factories() -> Vec<Arc<dyn KexFactory>> {
    vec![
        Arc::new(Curve25519Factory),
        Arc::new(EcdhFactory(EcdhCurve::NistP256)),
        Arc::new(EcdhFactory(EcdhCurve::NistP384)),
        Arc::new(EcdhFactory(EcdhCurve::NistP521)),
        Arc::new(DhGexFactory::sha256()),
        Arc::new(DhGroupFactory::group14_sha256()),
        Arc::new(DhGroupFactory::group14_sha1()),
        Arc::new(DhGexFactory::sha1()),
        Arc::new(DhGroupFactory::group1_sha1()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_lengths() {
        for hash in [KexHash::Sha1, KexHash::Sha256, KexHash::Sha384, KexHash::Sha512] {
            assert_eq!(hash.digest(b"abc").len(), hash.output_len());
        }
    }

    #[test]
    fn test_exchange_hash_depends_on_format_and_group() {
        let k = SharedSecret::new(vec![5; 32]);
        let base = ExchangeTranscript {
            client_version: "SSH-2.0-a",
            server_version: "SSH-2.0-b",
            client_kexinit: b"ic",
            server_kexinit: b"is",
            host_key: b"ks",
            group_exchange: None,
            client_value: &[0x81, 1],
            server_value: &[2, 2],
            shared_secret: &k,
        };
        let mpint = exchange_hash(KexHash::Sha256, ValueFormat::Mpint, &base);
        let string = exchange_hash(KexHash::Sha256, ValueFormat::String, &base);
        assert_ne!(mpint, string);

        let gex = GroupExchangeParams {
            min: 1024,
            preferred: 2048,
            max: 8192,
            group: groups::GROUP14.clone(),
        };
        let with_group = ExchangeTranscript {
            group_exchange: Some(&gex),
            ..base
        };
        assert_ne!(
            mpint,
            exchange_hash(KexHash::Sha256, ValueFormat::Mpint, &with_group)
        );
    }

    #[test]
    fn test_shared_secret_debug_redacted() {
        let k = SharedSecret::new(vec![0xab; 4]);
        assert!(!format!("{:?}", k).contains("ab"));
    }
}
