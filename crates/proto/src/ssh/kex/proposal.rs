//! SSH_MSG_KEXINIT, SSH_MSG_NEWKEYS and algorithm negotiation
//! (RFC 4253 Sections 7.1 and 7.3).

use bytes::{BufMut, BytesMut};
use halyard_platform::{HalyardError, HalyardResult};
use rand::RngCore;

use crate::ssh::message::MessageType;
use crate::ssh::registry::{AlgorithmRegistry, FactoryRegistry, NamedFactory};
use crate::ssh::wire::{self, WireReader};

/// Local algorithm preferences, most preferred first.
///
/// The same cipher, MAC and compression lists are offered for both
/// directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmProposal {
    /// Key exchange methods.
    pub kex: Vec<String>,
    /// Host key algorithms.
    pub host_key: Vec<String>,
    /// Ciphers.
    pub ciphers: Vec<String>,
    /// MAC algorithms.
    pub macs: Vec<String>,
    /// Compression methods.
    pub compression: Vec<String>,
}

impl AlgorithmProposal {
    /// Every supported algorithm of `registry`, in registry order.
    ///
    /// The `none` cipher and MAC are left out.
    pub fn from_registry(registry: &AlgorithmRegistry) -> Self {
        let without_none = |names: Vec<String>| -> Vec<String> {
            names.into_iter().filter(|n| n != "none").collect()
        };
        Self {
            kex: registry.kex.supported_names(),
            host_key: registry.host_keys.supported_names(),
            ciphers: without_none(registry.ciphers.supported_names()),
            macs: without_none(registry.macs.supported_names()),
            compression: registry.compression.supported_names(),
        }
    }

    /// Drops names that `registry` cannot resolve to a supported factory.
    pub fn retain_supported(&mut self, registry: &AlgorithmRegistry) {
        fn keep<F: NamedFactory + ?Sized>(names: &mut Vec<String>, reg: &FactoryRegistry<F>) {
            names.retain(|n| reg.resolve(n).map_or(false, |f| f.is_supported()));
        }
        keep(&mut self.kex, &registry.kex);
        keep(&mut self.host_key, &registry.host_keys);
        keep(&mut self.ciphers, &registry.ciphers);
        keep(&mut self.macs, &registry.macs);
        keep(&mut self.compression, &registry.compression);
    }
}

impl Default for AlgorithmProposal {
    fn default() -> Self {
        Self::from_registry(&AlgorithmRegistry::global())
    }
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each algorithm list is ordered by preference (most preferred first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie (16 bytes)
    pub cookie: [u8; 16],
    /// Key exchange algorithms
    pub kex_algorithms: Vec<String>,
    /// Server host key algorithms
    pub server_host_key_algorithms: Vec<String>,
    /// Encryption algorithms client to server
    pub encryption_client_to_server: Vec<String>,
    /// Encryption algorithms server to client
    pub encryption_server_to_client: Vec<String>,
    /// MAC algorithms client to server
    pub mac_client_to_server: Vec<String>,
    /// MAC algorithms server to client
    pub mac_server_to_client: Vec<String>,
    /// Compression algorithms client to server
    pub compression_client_to_server: Vec<String>,
    /// Compression algorithms server to client
    pub compression_server_to_client: Vec<String>,
    /// Languages client to server (usually empty)
    pub languages_client_to_server: Vec<String>,
    /// Languages server to client (usually empty)
    pub languages_server_to_client: Vec<String>,
    /// First KEX packet follows
    pub first_kex_packet_follows: bool,
}

impl KexInit {
    /// Builds a KEXINIT with a fresh random cookie.
    pub fn from_proposal(proposal: &AlgorithmProposal) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algorithms: proposal.kex.clone(),
            server_host_key_algorithms: proposal.host_key.clone(),
            encryption_client_to_server: proposal.ciphers.clone(),
            encryption_server_to_client: proposal.ciphers.clone(),
            mac_client_to_server: proposal.macs.clone(),
            mac_server_to_client: proposal.macs.clone(),
            compression_client_to_server: proposal.compression.clone(),
            compression_server_to_client: proposal.compression.clone(),
            languages_client_to_server: Vec::new(),
            languages_server_to_client: Vec::new(),
            first_kex_packet_follows: false,
        }
    }

    /// Serializes the message.
    ///
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie (random bytes)
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms_client_to_server
    /// name-list    encryption_algorithms_server_to_client
    /// name-list    mac_algorithms_client_to_server
    /// name-list    mac_algorithms_server_to_client
    /// name-list    compression_algorithms_client_to_server
    /// name-list    compression_algorithms_server_to_client
    /// name-list    languages_client_to_server
    /// name-list    languages_server_to_client
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved for future extension)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        for list in self.lists() {
            wire::write_name_list(&mut buf, list);
        }

        wire::write_bool(&mut buf, self.first_kex_packet_follows);
        buf.put_u32(0);
        buf.to_vec()
    }

    /// Parses a KEXINIT payload; the reserved field is ignored.
    pub fn from_bytes(data: &[u8]) -> HalyardResult<Self> {
        let mut r = WireReader::new(data);
        let number = r.read_u8().map_err(|_| {
            HalyardError::Protocol("KEXINIT message is empty".to_string())
        })?;
        if number != MessageType::KexInit as u8 {
            return Err(HalyardError::Protocol(format!(
                "Invalid message type: expected 20 (SSH_MSG_KEXINIT), got {}",
                number
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(r.read_raw(16)?);

        let kex_algorithms = r.read_name_list()?;
        let server_host_key_algorithms = r.read_name_list()?;
        let encryption_client_to_server = r.read_name_list()?;
        let encryption_server_to_client = r.read_name_list()?;
        let mac_client_to_server = r.read_name_list()?;
        let mac_server_to_client = r.read_name_list()?;
        let compression_client_to_server = r.read_name_list()?;
        let compression_server_to_client = r.read_name_list()?;
        let languages_client_to_server = r.read_name_list()?;
        let languages_server_to_client = r.read_name_list()?;
        let first_kex_packet_follows = r.read_bool()?;
        let _reserved = r.read_u32()?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_client_to_server,
            encryption_server_to_client,
            mac_client_to_server,
            mac_server_to_client,
            compression_client_to_server,
            compression_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }

    /// The ten name-lists in wire order.
    pub fn lists(&self) -> [&Vec<String>; 10] {
        [
            &self.kex_algorithms,
            &self.server_host_key_algorithms,
            &self.encryption_client_to_server,
            &self.encryption_server_to_client,
            &self.mac_client_to_server,
            &self.mac_server_to_client,
            &self.compression_client_to_server,
            &self.compression_server_to_client,
            &self.languages_client_to_server,
            &self.languages_server_to_client,
        ]
    }

    /// Whether a guessed first kex packet from the sender of this KEXINIT
    /// matches the negotiated methods (RFC 4253 Section 7).
    pub fn guess_matches(&self, negotiated: &NegotiatedAlgorithms) -> bool {
        self.kex_algorithms.first() == Some(&negotiated.kex)
            && self.server_host_key_algorithms.first() == Some(&negotiated.host_key)
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
///
/// Sequence numbers are not reset by NEWKEYS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a new SSH_MSG_NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> HalyardResult<Self> {
        match data.first() {
            Some(&n) if n == MessageType::NewKeys as u8 => Ok(Self),
            Some(&n) => Err(HalyardError::Protocol(format!(
                "Invalid message type: expected 21 (SSH_MSG_NEWKEYS), got {}",
                n
            ))),
            None => Err(HalyardError::Protocol("NEWKEYS message is empty".to_string())),
        }
    }
}

/// Algorithms agreed for one key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method.
    pub kex: String,
    /// Host key algorithm.
    pub host_key: String,
    /// Cipher client to server.
    pub cipher_client_to_server: String,
    /// Cipher server to client.
    pub cipher_server_to_client: String,
    /// MAC client to server.
    pub mac_client_to_server: String,
    /// MAC server to client.
    pub mac_server_to_client: String,
    /// Compression client to server.
    pub compression_client_to_server: String,
    /// Compression server to client.
    pub compression_server_to_client: String,
    /// Language client to server, if any matched.
    pub language_client_to_server: Option<String>,
    /// Language server to client, if any matched.
    pub language_server_to_client: Option<String>,
}

/// Picks the first algorithm in the client's list that the server also lists.
///
/// ```rust
/// use halyard_proto::ssh::kex::negotiate_algorithm;
///
/// let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
/// let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
/// assert_eq!(negotiate_algorithm(&client, &server), Some("aes256-ctr".to_string()));
/// ```
pub fn negotiate_algorithm(client_list: &[String], server_list: &[String]) -> Option<String> {
    client_list
        .iter()
        .find(|name| server_list.contains(name))
        .cloned()
}

fn required(category: &str, client: &[String], server: &[String]) -> HalyardResult<String> {
    negotiate_algorithm(client, server).ok_or_else(|| {
        HalyardError::Negotiation(format!(
            "No common {} algorithm: client={:?}, server={:?}",
            category, client, server
        ))
    })
}

/// Negotiates every category of a KEXINIT pair.
///
/// The client's order decides. Languages may be left unmatched; all other
/// categories must match and resolve to supported factories in `registry`.
pub fn negotiate(
    client: &KexInit,
    server: &KexInit,
    registry: &AlgorithmRegistry,
) -> HalyardResult<NegotiatedAlgorithms> {
    let negotiated = NegotiatedAlgorithms {
        kex: required("kex", &client.kex_algorithms, &server.kex_algorithms)?,
        host_key: required(
            "host key",
            &client.server_host_key_algorithms,
            &server.server_host_key_algorithms,
        )?,
        cipher_client_to_server: required(
            "cipher (client to server)",
            &client.encryption_client_to_server,
            &server.encryption_client_to_server,
        )?,
        cipher_server_to_client: required(
            "cipher (server to client)",
            &client.encryption_server_to_client,
            &server.encryption_server_to_client,
        )?,
        mac_client_to_server: required(
            "mac (client to server)",
            &client.mac_client_to_server,
            &server.mac_client_to_server,
        )?,
        mac_server_to_client: required(
            "mac (server to client)",
            &client.mac_server_to_client,
            &server.mac_server_to_client,
        )?,
        compression_client_to_server: required(
            "compression (client to server)",
            &client.compression_client_to_server,
            &server.compression_client_to_server,
        )?,
        compression_server_to_client: required(
            "compression (server to client)",
            &client.compression_server_to_client,
            &server.compression_server_to_client,
        )?,
        language_client_to_server: negotiate_algorithm(
            &client.languages_client_to_server,
            &server.languages_client_to_server,
        ),
        language_server_to_client: negotiate_algorithm(
            &client.languages_server_to_client,
            &server.languages_server_to_client,
        ),
    };

    registry.kex.require(&negotiated.kex)?;
    registry.host_keys.require(&negotiated.host_key)?;
    registry.ciphers.require(&negotiated.cipher_client_to_server)?;
    registry.ciphers.require(&negotiated.cipher_server_to_client)?;
    registry.macs.require(&negotiated.mac_client_to_server)?;
    registry.macs.require(&negotiated.mac_server_to_client)?;
    registry
        .compression
        .require(&negotiated.compression_client_to_server)?;
    registry
        .compression
        .require(&negotiated.compression_server_to_client)?;

    Ok(negotiated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn kexinit(kex: &[&str], ciphers: &[&str]) -> KexInit {
        KexInit::from_proposal(&AlgorithmProposal {
            kex: names(kex),
            host_key: names(&["ssh-ed25519", "ecdsa-sha2-nistp256"]),
            ciphers: names(ciphers),
            macs: names(&["hmac-sha2-256", "hmac-sha1"]),
            compression: names(&["none"]),
        })
    }

    #[test]
    fn test_kexinit_wire_layout() {
        let init = kexinit(&["curve25519-sha256"], &["aes128-ctr"]);
        let bytes = init.to_bytes();
        assert_eq!(bytes[0], 20);
        assert_eq!(&bytes[1..17], &init.cookie);
        assert_eq!(&bytes[bytes.len() - 5..], &[0, 0, 0, 0, 0]);
        assert_eq!(KexInit::from_bytes(&bytes).unwrap(), init);
    }

    #[test]
    fn test_kexinit_reserved_ignored() {
        let init = kexinit(&["curve25519-sha256"], &["aes128-ctr"]);
        let mut bytes = init.to_bytes();
        let len = bytes.len();
        bytes[len - 1] = 7;
        assert!(KexInit::from_bytes(&bytes).is_ok());
    }

    #[test]
    fn test_kexinit_truncated() {
        let bytes = kexinit(&["curve25519-sha256"], &["aes128-ctr"]).to_bytes();
        assert!(KexInit::from_bytes(&bytes[..bytes.len() - 3]).is_err());
        assert!(KexInit::from_bytes(&[]).is_err());
        assert!(KexInit::from_bytes(&[21]).is_err());
    }

    #[test]
    fn test_client_preference_wins() {
        let client = kexinit(
            &["ecdh-sha2-nistp256", "curve25519-sha256"],
            &["aes256-ctr", "aes128-ctr"],
        );
        let server = kexinit(
            &["curve25519-sha256", "ecdh-sha2-nistp256"],
            &["aes128-ctr", "aes256-ctr"],
        );
        let registry = AlgorithmRegistry::new();
        let agreed = negotiate(&client, &server, &registry).unwrap();
        assert_eq!(agreed.kex, "ecdh-sha2-nistp256");
        assert_eq!(agreed.cipher_client_to_server, "aes256-ctr");
        assert_eq!(agreed.language_client_to_server, None);
    }

    #[test]
    fn test_negotiation_independent_of_server_order() {
        let registry = AlgorithmRegistry::new();
        let client = kexinit(&["ecdh-sha2-nistp384", "ecdh-sha2-nistp256"], &["aes128-ctr"]);
        let a = kexinit(&["ecdh-sha2-nistp256", "ecdh-sha2-nistp384"], &["aes128-ctr"]);
        let b = kexinit(&["ecdh-sha2-nistp384", "ecdh-sha2-nistp256"], &["aes128-ctr"]);
        assert_eq!(
            negotiate(&client, &a, &registry).unwrap(),
            negotiate(&client, &b, &registry).unwrap()
        );
    }

    #[test]
    fn test_no_common_cipher() {
        let registry = AlgorithmRegistry::new();
        let client = kexinit(&["curve25519-sha256"], &["aes256-ctr"]);
        let server = kexinit(&["curve25519-sha256"], &["aes128-ctr"]);
        assert!(matches!(
            negotiate(&client, &server, &registry),
            Err(HalyardError::Negotiation(_))
        ));
    }

    #[test]
    fn test_unknown_common_name_rejected() {
        let registry = AlgorithmRegistry::new();
        let client = kexinit(&["made-up-kex"], &["aes128-ctr"]);
        let server = kexinit(&["made-up-kex"], &["aes128-ctr"]);
        assert!(matches!(
            negotiate(&client, &server, &registry),
            Err(HalyardError::Negotiation(_))
        ));
    }

    #[test]
    fn test_guess_matches() {
        let registry = AlgorithmRegistry::new();
        let client = kexinit(&["curve25519-sha256", "ecdh-sha2-nistp256"], &["aes128-ctr"]);
        let server = kexinit(&["ecdh-sha2-nistp256"], &["aes128-ctr"]);
        let agreed = negotiate(&client, &server, &registry).unwrap();
        assert!(server.guess_matches(&agreed));
        assert!(!client.guess_matches(&agreed));
    }

    #[test]
    fn test_newkeys() {
        assert_eq!(NewKeys::new().to_bytes(), vec![21]);
        assert!(NewKeys::from_bytes(&[21]).is_ok());
        assert!(NewKeys::from_bytes(&[20]).is_err());
        assert!(NewKeys::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_default_proposal_excludes_none() {
        let proposal = AlgorithmProposal::from_registry(&AlgorithmRegistry::new());
        assert!(!proposal.ciphers.contains(&"none".to_string()));
        assert!(!proposal.macs.contains(&"none".to_string()));
        assert_eq!(proposal.compression, vec!["none"]);
        assert_eq!(proposal.kex[0], "curve25519-sha256");
    }
}
