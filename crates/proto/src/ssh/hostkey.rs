//! SSH Host Key Algorithms
//!
//! Host keys authenticate the server during key exchange (RFC 4253 Section 8):
//! the server signs the exchange hash `H` and the client verifies that
//! signature with the [`SignatureFactory`] negotiated for the host key
//! algorithm.
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519` (RFC 8709)
//! - `ecdsa-sha2-nistp256`, `ecdsa-sha2-nistp384`, `ecdsa-sha2-nistp521` (RFC 5656)
//!
//! # Collaborators
//!
//! - [`HostKeyProvider`] supplies the server's key material.
//! - [`HostKeyVerifier`] decides whether a client trusts a presented key.
//!
//! # Example
//!
//! ```rust
//! use halyard_proto::ssh::hostkey::{Ed25519HostKey, HostKey};
//! use halyard_proto::ssh::registry::AlgorithmRegistry;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hostkey = Ed25519HostKey::generate()?;
//! let blob = hostkey.public_key_blob();
//! let signature = hostkey.sign(b"exchange hash")?;
//!
//! let verifier = AlgorithmRegistry::global().host_keys.require("ssh-ed25519")?;
//! assert!(verifier.verify(&blob, b"exchange hash", &signature)?);
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use bytes::BytesMut;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use halyard_platform::{HalyardError, HalyardResult};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::registry::NamedFactory;
use super::wire::{self, WireReader};

/// Host key algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519
    SshEd25519,
    /// ecdsa-sha2-nistp256
    EcdsaSha2Nistp256,
    /// ecdsa-sha2-nistp384
    EcdsaSha2Nistp384,
    /// ecdsa-sha2-nistp521
    EcdsaSha2Nistp521,
}

impl HostKeyAlgorithm {
    /// Algorithm name as used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::EcdsaSha2Nistp256 => "ecdsa-sha2-nistp256",
            HostKeyAlgorithm::EcdsaSha2Nistp384 => "ecdsa-sha2-nistp384",
            HostKeyAlgorithm::EcdsaSha2Nistp521 => "ecdsa-sha2-nistp521",
        }
    }

    /// Parses an algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssh-ed25519" => Some(HostKeyAlgorithm::SshEd25519),
            "ecdsa-sha2-nistp256" => Some(HostKeyAlgorithm::EcdsaSha2Nistp256),
            "ecdsa-sha2-nistp384" => Some(HostKeyAlgorithm::EcdsaSha2Nistp384),
            "ecdsa-sha2-nistp521" => Some(HostKeyAlgorithm::EcdsaSha2Nistp521),
            _ => None,
        }
    }

    fn curve_id(&self) -> Option<&'static str> {
        match self {
            HostKeyAlgorithm::SshEd25519 => None,
            HostKeyAlgorithm::EcdsaSha2Nistp256 => Some("nistp256"),
            HostKeyAlgorithm::EcdsaSha2Nistp384 => Some("nistp384"),
            HostKeyAlgorithm::EcdsaSha2Nistp521 => Some("nistp521"),
        }
    }

    fn field_len(&self) -> usize {
        match self {
            HostKeyAlgorithm::SshEd25519 => 32,
            HostKeyAlgorithm::EcdsaSha2Nistp256 => 32,
            HostKeyAlgorithm::EcdsaSha2Nistp384 => 48,
            HostKeyAlgorithm::EcdsaSha2Nistp521 => 66,
        }
    }
}

/// A private host key able to sign exchange hashes.
pub trait HostKey: Send + Sync {
    /// Algorithm name advertised in KEXINIT.
    fn algorithm_name(&self) -> &str;

    /// Public key blob (`K_S`).
    fn public_key_blob(&self) -> Vec<u8>;

    /// Signs `data`, returning the signature blob
    /// (`string algorithm || string signature`).
    fn sign(&self, data: &[u8]) -> HalyardResult<Vec<u8>>;
}

/// Verifies host key signatures for one algorithm name.
pub trait SignatureFactory: NamedFactory + Send + Sync {
    /// Verifies `signature` (wire blob) over `data` with `public_key` (wire blob).
    ///
    /// Returns `Ok(false)` for a well-formed but wrong signature.
    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> HalyardResult<bool>;
}

/// Builtin signature factories in preference order.
pub fn builtin_factories() -> Vec<Arc<dyn SignatureFactory>> {
    vec![
        Arc::new(BuiltinSignature(HostKeyAlgorithm::SshEd25519)),
        Arc::new(BuiltinSignature(HostKeyAlgorithm::EcdsaSha2Nistp256)),
        Arc::new(BuiltinSignature(HostKeyAlgorithm::EcdsaSha2Nistp384)),
        Arc::new(BuiltinSignature(HostKeyAlgorithm::EcdsaSha2Nistp521)),
    ]
}

/// Supplies the server's host keys.
pub trait HostKeyProvider: Send + Sync {
    /// Algorithms for which a key is available, in preference order.
    fn algorithms(&self) -> Vec<String>;

    /// Key for a negotiated algorithm.
    fn host_key(&self, algorithm: &str) -> Option<Arc<dyn HostKey>>;
}

/// A fixed set of host keys.
#[derive(Clone, Default)]
pub struct StaticHostKeys {
    keys: Vec<Arc<dyn HostKey>>,
}

impl StaticHostKeys {
    /// Creates an empty key set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key; earlier keys are preferred.
    pub fn with_key(mut self, key: Arc<dyn HostKey>) -> Self {
        self.keys.push(key);
        self
    }
}

impl HostKeyProvider for StaticHostKeys {
    fn algorithms(&self) -> Vec<String> {
        self.keys
            .iter()
            .map(|k| k.algorithm_name().to_string())
            .collect()
    }

    fn host_key(&self, algorithm: &str) -> Option<Arc<dyn HostKey>> {
        self.keys
            .iter()
            .find(|k| k.algorithm_name().eq_ignore_ascii_case(algorithm))
            .cloned()
    }
}

impl std::fmt::Debug for StaticHostKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticHostKeys")
            .field("algorithms", &self.algorithms())
            .finish()
    }
}

/// Decides whether the client accepts the server's host key.
pub trait HostKeyVerifier: Send + Sync {
    /// Returns true if the key is trusted.
    fn verify(&self, algorithm: &str, public_key: &[u8]) -> bool;
}

impl<F> HostKeyVerifier for F
where
    F: Fn(&str, &[u8]) -> bool + Send + Sync,
{
    fn verify(&self, algorithm: &str, public_key: &[u8]) -> bool {
        self(algorithm, public_key)
    }
}

/// Trusts every host key.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAnyHostKey;

impl HostKeyVerifier for AcceptAnyHostKey {
    fn verify(&self, algorithm: &str, public_key: &[u8]) -> bool {
        tracing::debug!(
            algorithm,
            fingerprint = %fingerprint_sha256(public_key),
            "accepting host key without verification"
        );
        true
    }
}

/// Trusts only the given public key blobs.
#[derive(Debug, Clone, Default)]
pub struct PinnedHostKeys {
    blobs: HashSet<Vec<u8>>,
}

impl PinnedHostKeys {
    /// Creates an empty pin set (rejects everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins a public key blob.
    pub fn pin(mut self, blob: Vec<u8>) -> Self {
        self.blobs.insert(blob);
        self
    }
}

impl HostKeyVerifier for PinnedHostKeys {
    fn verify(&self, _algorithm: &str, public_key: &[u8]) -> bool {
        self.blobs.contains(public_key)
    }
}

/// Hex SHA-256 fingerprint of a public key blob.
pub fn fingerprint_sha256(blob: &[u8]) -> String {
    format!("SHA256:{}", hex::encode(Sha256::digest(blob)))
}

/// Ed25519 host key (ssh-ed25519)
#[derive(Clone)]
pub struct Ed25519HostKey {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519HostKey {
    /// Generates a new key pair.
    pub fn generate() -> HalyardResult<Self> {
        let mut csprng = rand::thread_rng();
        let secret = Zeroizing::new(rand::Rng::gen::<[u8; SECRET_KEY_LENGTH]>(&mut csprng));
        Self::from_bytes(&secret[..])
    }

    /// Creates a key from its 32-byte secret.
    pub fn from_bytes(secret_bytes: &[u8]) -> HalyardResult<Self> {
        let key_bytes: [u8; SECRET_KEY_LENGTH] = secret_bytes.try_into().map_err(|_| {
            HalyardError::Security("Ed25519 secret key must be 32 bytes".to_string())
        })?;
        let key_bytes = Zeroizing::new(key_bytes);
        let signing_key = SigningKey::from_bytes(&key_bytes);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// The verifying half.
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }
}

impl HostKey for Ed25519HostKey {
    fn algorithm_name(&self) -> &str {
        HostKeyAlgorithm::SshEd25519.name()
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_string(&mut buf, HostKeyAlgorithm::SshEd25519.name());
        wire::write_bytes(&mut buf, self.verifying_key.as_bytes());
        buf.to_vec()
    }

    fn sign(&self, data: &[u8]) -> HalyardResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);
        let mut buf = BytesMut::new();
        wire::write_string(&mut buf, HostKeyAlgorithm::SshEd25519.name());
        wire::write_bytes(&mut buf, &signature.to_bytes());
        Ok(buf.to_vec())
    }
}

impl std::fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("algorithm", &"ssh-ed25519")
            .field("public_key", &hex::encode(self.verifying_key.as_bytes()))
            .finish_non_exhaustive()
    }
}

enum EcdsaSigningKey {
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
    P521(p521::ecdsa::SigningKey),
}

/// ECDSA host key over a NIST curve (RFC 5656).
///
/// P-256 signs with SHA-256, P-384 with SHA-384 and P-521 with SHA-512.
pub struct EcdsaHostKey {
    algorithm: HostKeyAlgorithm,
    signing_key: EcdsaSigningKey,
}

impl EcdsaHostKey {
    /// Generates a new key pair for the given ECDSA algorithm.
    pub fn generate(algorithm: HostKeyAlgorithm) -> HalyardResult<Self> {
        let mut rng = rand::thread_rng();
        let signing_key = match algorithm {
            HostKeyAlgorithm::EcdsaSha2Nistp256 => {
                EcdsaSigningKey::P256(p256::ecdsa::SigningKey::random(&mut rng))
            }
            HostKeyAlgorithm::EcdsaSha2Nistp384 => {
                EcdsaSigningKey::P384(p384::ecdsa::SigningKey::random(&mut rng))
            }
            HostKeyAlgorithm::EcdsaSha2Nistp521 => {
                EcdsaSigningKey::P521(p521::ecdsa::SigningKey::random(&mut rng))
            }
            HostKeyAlgorithm::SshEd25519 => {
                return Err(HalyardError::Config(
                    "ssh-ed25519 is not an ECDSA algorithm".to_string(),
                ))
            }
        };
        Ok(Self {
            algorithm,
            signing_key,
        })
    }

    /// The algorithm of this key.
    pub fn algorithm(&self) -> HostKeyAlgorithm {
        self.algorithm
    }

    fn public_point(&self) -> Vec<u8> {
        match &self.signing_key {
            EcdsaSigningKey::P256(k) => p256::ecdsa::VerifyingKey::from(k)
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
            EcdsaSigningKey::P384(k) => p384::ecdsa::VerifyingKey::from(k)
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
            EcdsaSigningKey::P521(k) => p521::ecdsa::VerifyingKey::from(k)
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
        }
    }
}

impl HostKey for EcdsaHostKey {
    fn algorithm_name(&self) -> &str {
        self.algorithm.name()
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_string(&mut buf, self.algorithm.name());
        wire::write_string(&mut buf, self.algorithm.curve_id().unwrap_or_default());
        wire::write_bytes(&mut buf, &self.public_point());
        buf.to_vec()
    }

    fn sign(&self, data: &[u8]) -> HalyardResult<Vec<u8>> {
        use signature::Signer;

        let (r, s) = match &self.signing_key {
            EcdsaSigningKey::P256(k) => {
                let sig: p256::ecdsa::Signature = k.sign(data);
                let (r, s) = sig.split_bytes();
                (r.to_vec(), s.to_vec())
            }
            EcdsaSigningKey::P384(k) => {
                let sig: p384::ecdsa::Signature = k.sign(data);
                let (r, s) = sig.split_bytes();
                (r.to_vec(), s.to_vec())
            }
            EcdsaSigningKey::P521(k) => {
                let sig: p521::ecdsa::Signature = k.sign(data);
                let (r, s) = sig.split_bytes();
                (r.to_vec(), s.to_vec())
            }
        };

        let mut inner = BytesMut::new();
        wire::write_mpint(&mut inner, &r);
        wire::write_mpint(&mut inner, &s);

        let mut buf = BytesMut::new();
        wire::write_string(&mut buf, self.algorithm.name());
        wire::write_bytes(&mut buf, &inner);
        Ok(buf.to_vec())
    }
}

impl std::fmt::Debug for EcdsaHostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdsaHostKey")
            .field("algorithm", &self.algorithm.name())
            .field("public_key", &hex::encode(self.public_point()))
            .finish_non_exhaustive()
    }
}

/// Verifier for the builtin host key algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinSignature(pub HostKeyAlgorithm);

impl NamedFactory for BuiltinSignature {
    fn name(&self) -> &str {
        self.0.name()
    }
}

impl SignatureFactory for BuiltinSignature {
    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> HalyardResult<bool> {
        let algorithm = self.0;

        let mut key = WireReader::new(public_key);
        let key_type = key.read_string()?;
        if key_type != algorithm.name() {
            return Err(HalyardError::Security(format!(
                "host key type {} does not match {}",
                key_type,
                algorithm.name()
            )));
        }

        let mut sig = WireReader::new(signature);
        let sig_type = sig.read_string()?;
        if sig_type != algorithm.name() {
            return Err(HalyardError::Security(format!(
                "host key signature type {} does not match {}",
                sig_type,
                algorithm.name()
            )));
        }
        let sig_blob = sig.read_bytes()?;

        match algorithm {
            HostKeyAlgorithm::SshEd25519 => verify_ed25519(key.read_bytes()?, data, sig_blob),
            _ => {
                let curve = key.read_string()?;
                if Some(curve.as_str()) != algorithm.curve_id() {
                    return Err(HalyardError::Security(format!(
                        "host key curve {} does not match {}",
                        curve,
                        algorithm.name()
                    )));
                }
                verify_ecdsa(algorithm, key.read_bytes()?, data, sig_blob)
            }
        }
    }
}

fn verify_ed25519(public_key: &[u8], data: &[u8], signature: &[u8]) -> HalyardResult<bool> {
    let key_bytes: [u8; 32] = public_key.try_into().map_err(|_| {
        HalyardError::Security("Ed25519 host key must be 32 bytes".to_string())
    })?;
    let sig_bytes: [u8; 64] = signature.try_into().map_err(|_| {
        HalyardError::Security("Ed25519 host key signature must be 64 bytes".to_string())
    })?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| HalyardError::Security(format!("Invalid Ed25519 host key: {}", e)))?;
    let signature = Signature::from_bytes(&sig_bytes);
    Ok(verifying_key.verify(data, &signature).is_ok())
}

fn verify_ecdsa(
    algorithm: HostKeyAlgorithm,
    point: &[u8],
    data: &[u8],
    signature: &[u8],
) -> HalyardResult<bool> {
    use signature::Verifier;

    let mut reader = WireReader::new(signature);
    let r = reader.read_mpint()?;
    let s = reader.read_mpint()?;

    let field_len = algorithm.field_len();
    if r.len() > field_len || s.len() > field_len {
        return Ok(false);
    }
    let mut raw = vec![0u8; field_len * 2];
    raw[field_len - r.len()..field_len].copy_from_slice(r);
    raw[2 * field_len - s.len()..].copy_from_slice(s);

    let valid = match algorithm {
        HostKeyAlgorithm::EcdsaSha2Nistp256 => {
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(|e| {
                HalyardError::Security(format!("Invalid {} host key: {}", algorithm.name(), e))
            })?;
            match p256::ecdsa::Signature::from_slice(&raw) {
                Ok(sig) => key.verify(data, &sig).is_ok(),
                Err(_) => false,
            }
        }
        HostKeyAlgorithm::EcdsaSha2Nistp384 => {
            let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(|e| {
                HalyardError::Security(format!("Invalid {} host key: {}", algorithm.name(), e))
            })?;
            match p384::ecdsa::Signature::from_slice(&raw) {
                Ok(sig) => key.verify(data, &sig).is_ok(),
                Err(_) => false,
            }
        }
        HostKeyAlgorithm::EcdsaSha2Nistp521 => {
            let key = p521::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(|e| {
                HalyardError::Security(format!("Invalid {} host key: {}", algorithm.name(), e))
            })?;
            match p521::ecdsa::Signature::from_slice(&raw) {
                Ok(sig) => key.verify(data, &sig).is_ok(),
                Err(_) => false,
            }
        }
        HostKeyAlgorithm::SshEd25519 => false,
    };
    Ok(valid)
}
