//! Session key derivation (RFC 4253 Section 7.2).
//!
//! ```text
//! Initial IV client to server:     HASH(K || H || "A" || session_id)
//! Initial IV server to client:     HASH(K || H || "B" || session_id)
//! Encryption key client to server: HASH(K || H || "C" || session_id)
//! Encryption key server to client: HASH(K || H || "D" || session_id)
//! Integrity key client to server:  HASH(K || H || "E" || session_id)
//! Integrity key server to client:  HASH(K || H || "F" || session_id)
//! ```
//!
//! Longer keys are extended with `K2 = HASH(K || H || K1)`,
//! `K3 = HASH(K || H || K1 || K2)` and so on, then truncated.

use zeroize::Zeroizing;

use super::{KexHash, SharedSecret};

/// Derives one key of `len` bytes for the given tag (`b'A'..=b'F'`).
///
/// Pure: identical inputs always produce identical output.
pub fn derive_key(
    hash: KexHash,
    shared_secret: &SharedSecret,
    exchange_hash: &[u8],
    tag: u8,
    session_id: &[u8],
    len: usize,
) -> Zeroizing<Vec<u8>> {
    let k = shared_secret.to_mpint();

    let mut input = Zeroizing::new(Vec::with_capacity(
        k.len() + exchange_hash.len() + 1 + session_id.len(),
    ));
    input.extend_from_slice(&k);
    input.extend_from_slice(exchange_hash);
    input.push(tag);
    input.extend_from_slice(session_id);

    let mut key = Zeroizing::new(hash.digest(&input));
    while key.len() < len {
        let mut input =
            Zeroizing::new(Vec::with_capacity(k.len() + exchange_hash.len() + key.len()));
        input.extend_from_slice(&k);
        input.extend_from_slice(exchange_hash);
        input.extend_from_slice(&key);
        let block = hash.digest(&input);
        key.extend_from_slice(&block);
    }
    key.truncate(len);
    key
}

/// Key sizes needed for one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyLengths {
    /// Cipher IV length.
    pub iv: usize,
    /// Cipher key length.
    pub enc: usize,
    /// MAC key length.
    pub mac: usize,
}

/// Key material for one direction.
pub struct DirectionKeys {
    /// Initial IV.
    pub iv: Zeroizing<Vec<u8>>,
    /// Encryption key.
    pub enc_key: Zeroizing<Vec<u8>>,
    /// Integrity key.
    pub mac_key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionKeys")
            .field("iv", &"<redacted>")
            .field("enc_key", &"<redacted>")
            .field("mac_key", &"<redacted>")
            .finish()
    }
}

/// Keys for both directions after one exchange.
#[derive(Debug)]
pub struct SessionKeys {
    /// Keys protecting client-to-server traffic.
    pub client_to_server: DirectionKeys,
    /// Keys protecting server-to-client traffic.
    pub server_to_client: DirectionKeys,
}

impl SessionKeys {
    /// Derives all six keys.
    pub fn derive(
        hash: KexHash,
        shared_secret: &SharedSecret,
        exchange_hash: &[u8],
        session_id: &[u8],
        client_to_server: KeyLengths,
        server_to_client: KeyLengths,
    ) -> Self {
        let key = |tag: u8, len: usize| {
            derive_key(hash, shared_secret, exchange_hash, tag, session_id, len)
        };
        Self {
            client_to_server: DirectionKeys {
                iv: key(b'A', client_to_server.iv),
                enc_key: key(b'C', client_to_server.enc),
                mac_key: key(b'E', client_to_server.mac),
            },
            server_to_client: DirectionKeys {
                iv: key(b'B', server_to_client.iv),
                enc_key: key(b'D', server_to_client.enc),
                mac_key: key(b'F', server_to_client.mac),
            },
        }
    }
}
