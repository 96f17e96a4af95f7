//! Transport handshakes driven in memory, without sockets.

use std::sync::Arc;
use std::time::Instant;

use halyard_platform::{HalyardError, HalyardResult};
use halyard_proto::ssh::cipher::{Cipher, CipherFactory};
use halyard_proto::ssh::hostkey::{EcdsaHostKey, Ed25519HostKey, HostKeyAlgorithm, StaticHostKeys};
use halyard_proto::ssh::registry::{AlgorithmRegistry, NamedFactory};
use halyard_proto::ssh::transport::{Transport, TransportConfig, TransportEvent};

fn ed25519_keys() -> Arc<StaticHostKeys> {
    Arc::new(StaticHostKeys::new().with_key(Arc::new(Ed25519HostKey::generate().unwrap())))
}

fn pump(a: &mut Transport, b: &mut Transport, now: Instant) -> HalyardResult<()> {
    loop {
        let mut moved = false;
        if let Some(bytes) = a.take_outbound() {
            b.feed(&bytes, now)?;
            moved = true;
        }
        if let Some(bytes) = b.take_outbound() {
            a.feed(&bytes, now)?;
            moved = true;
        }
        if !moved {
            return Ok(());
        }
    }
}

fn payloads(t: &mut Transport) -> Vec<Vec<u8>> {
    std::iter::from_fn(|| t.poll_event())
        .filter_map(|event| match event {
            TransportEvent::Payload { payload, .. } => Some(payload),
            _ => None,
        })
        .collect()
}

#[test]
fn test_nistp256_aes128_ctr_hmac_sha256() {
    let keys = StaticHostKeys::new()
        .with_key(Arc::new(EcdsaHostKey::generate(HostKeyAlgorithm::EcdsaSha2Nistp256).unwrap()));
    let mut client = TransportConfig::client();
    client.proposal.kex = vec!["ecdh-sha2-nistp256".into()];
    client.proposal.ciphers = vec!["aes128-ctr".into()];
    client.proposal.macs = vec!["hmac-sha2-256".into()];
    let server = TransportConfig::server(Arc::new(keys));

    let now = Instant::now();
    let mut c = Transport::new(client, now).unwrap();
    let mut s = Transport::new(server, now).unwrap();
    pump(&mut c, &mut s, now).unwrap();

    let negotiated = c.negotiated().unwrap().clone();
    assert_eq!(negotiated.kex, "ecdh-sha2-nistp256");
    assert_eq!(negotiated.host_key, "ecdsa-sha2-nistp256");
    assert_eq!(negotiated.cipher_client_to_server, "aes128-ctr");
    assert_eq!(negotiated.mac_server_to_client, "hmac-sha2-256");
    assert_eq!(s.negotiated(), Some(&negotiated));
    assert_eq!(c.session_id(), s.session_id());
    assert_eq!(c.session_id().map(<[u8]>::len), Some(32));

    // Both sides derived the same keys if traffic decrypts and verifies.
    let _ = payloads(&mut c);
    let _ = payloads(&mut s);
    c.send_payload(&[94, 0, 0, 0, 0, 0, 0, 0, 2, b'h', b'i'], now)
        .unwrap();
    s.send_payload(&[80, 0, 0, 0, 1, b'x', 0], now).unwrap();
    pump(&mut c, &mut s, now).unwrap();
    assert_eq!(payloads(&mut s), vec![vec![94, 0, 0, 0, 0, 0, 0, 0, 2, b'h', b'i']]);
    assert_eq!(payloads(&mut c), vec![vec![80, 0, 0, 0, 1, b'x', 0]]);
}

#[test]
fn test_rekey_keeps_session_id() {
    let now = Instant::now();
    let mut c = Transport::new(TransportConfig::client(), now).unwrap();
    let mut s = Transport::new(TransportConfig::server(ed25519_keys()), now).unwrap();
    pump(&mut c, &mut s, now).unwrap();
    let session_id = c.session_id().map(<[u8]>::to_vec);

    s.request_rekey(now).unwrap();
    pump(&mut c, &mut s, now).unwrap();
    let rekeyed = std::iter::from_fn(|| c.poll_event())
        .filter(|e| matches!(e, TransportEvent::Rekeyed { .. }))
        .count();
    assert_eq!(rekeyed, 1);
    assert_eq!(c.session_id().map(<[u8]>::to_vec), session_id);
    assert_eq!(s.session_id().map(<[u8]>::to_vec), session_id);
}

#[test]
fn test_no_common_cipher() {
    let mut client = TransportConfig::client();
    client.proposal.ciphers = vec!["aes256-ctr".into()];
    let mut server = TransportConfig::server(ed25519_keys());
    server.proposal.ciphers = vec!["aes128-ctr".into()];

    let now = Instant::now();
    let mut c = Transport::new(client, now).unwrap();
    let mut s = Transport::new(server, now).unwrap();
    let err = pump(&mut c, &mut s, now).unwrap_err();
    assert!(matches!(err, HalyardError::Negotiation(_)), "{:?}", err);
    assert_eq!(err.disconnect_reason() as u32, 3);
}

/// Toy cipher that XORs with the first key byte.
struct XorFactory;

struct XorCipher(u8);

impl NamedFactory for XorFactory {
    fn name(&self) -> &str {
        "xor8@halyard.test"
    }
}

impl CipherFactory for XorFactory {
    fn key_len(&self) -> usize {
        8
    }

    fn iv_len(&self) -> usize {
        8
    }

    fn block_size(&self) -> usize {
        8
    }

    fn create(&self, key: &[u8], _iv: &[u8]) -> HalyardResult<Box<dyn Cipher>> {
        Ok(Box::new(XorCipher(key[0] | 1)))
    }
}

impl Cipher for XorCipher {
    fn block_size(&self) -> usize {
        8
    }

    fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            *byte ^= self.0;
        }
    }
}

#[test]
fn test_extension_cipher_registration() {
    let registry = Arc::new(AlgorithmRegistry::new());
    registry.ciphers.register(Arc::new(XorFactory)).unwrap();

    let collision = registry.ciphers.register(Arc::new(XorFactory)).unwrap_err();
    assert!(matches!(collision, HalyardError::Config(_)));

    let mut client = TransportConfig::client().with_registry(registry.clone());
    client.proposal.ciphers = vec!["xor8@halyard.test".into()];
    let mut server = TransportConfig::server(ed25519_keys()).with_registry(registry.clone());
    server.proposal.ciphers = vec!["aes128-ctr".into(), "xor8@halyard.test".into()];

    let now = Instant::now();
    let mut c = Transport::new(client, now).unwrap();
    let mut s = Transport::new(server, now).unwrap();
    pump(&mut c, &mut s, now).unwrap();
    assert_eq!(
        c.negotiated().unwrap().cipher_server_to_client,
        "xor8@halyard.test"
    );

    let removed = registry.ciphers.unregister("XOR8@halyard.test").unwrap();
    assert_eq!(removed.name(), "xor8@halyard.test");
    assert!(registry.ciphers.resolve("xor8@halyard.test").is_none());
    assert!(registry.ciphers.unregister("xor8@halyard.test").is_none());
}
