//! Finite-field Diffie-Hellman (RFC 4253 Section 8, RFC 4419, RFC 8268).
//!
//! - `diffie-hellman-group1-sha1`
//! - `diffie-hellman-group14-sha1`, `diffie-hellman-group14-sha256`
//! - `diffie-hellman-group-exchange-sha1`, `diffie-hellman-group-exchange-sha256`

use halyard_platform::{HalyardError, HalyardResult};
use num_bigint::{BigUint, RandBigInt};
use zeroize::Zeroizing;

use super::groups::{DhGroup, GROUP1, GROUP14};
use super::{KexFactory, KexHash, KexParam, KeyExchange, SharedSecret, ValueFormat};
use crate::ssh::registry::NamedFactory;

/// Smallest group accepted for group exchange.
pub const GEX_MIN_BITS: u32 = 1024;

/// Largest group accepted for group exchange.
pub const GEX_MAX_BITS: u32 = 8192;

/// Fixed-group Diffie-Hellman factory.
#[derive(Debug, Clone, Copy)]
pub struct DhGroupFactory {
    name: &'static str,
    hash: KexHash,
    group: fn() -> &'static DhGroup,
}

impl DhGroupFactory {
    /// `diffie-hellman-group1-sha1`
    pub fn group1_sha1() -> Self {
        Self {
            name: "diffie-hellman-group1-sha1",
            hash: KexHash::Sha1,
            group: || &*GROUP1,
        }
    }

    /// `diffie-hellman-group14-sha1`
    pub fn group14_sha1() -> Self {
        Self {
            name: "diffie-hellman-group14-sha1",
            hash: KexHash::Sha1,
            group: || &*GROUP14,
        }
    }

    /// `diffie-hellman-group14-sha256`
    pub fn group14_sha256() -> Self {
        Self {
            name: "diffie-hellman-group14-sha256",
            hash: KexHash::Sha256,
            group: || &*GROUP14,
        }
    }
}

impl NamedFactory for DhGroupFactory {
    fn name(&self) -> &str {
        self.name
    }
}

impl KexFactory for DhGroupFactory {
    fn hash(&self) -> KexHash {
        self.hash
    }

    fn create(&self, params: &[KexParam]) -> HalyardResult<Box<dyn KeyExchange>> {
        if !params.is_empty() {
            return Err(HalyardError::Config(format!(
                "{} takes no parameters, got {}",
                self.name,
                params.len()
            )));
        }
        Ok(Box::new(DhExchange::new(
            self.name,
            self.hash,
            (self.group)().clone(),
        )))
    }
}

/// Group-exchange Diffie-Hellman factory.
///
/// [`create`](KexFactory::create) requires exactly `[Int(p), Int(g)]`.
#[derive(Debug, Clone, Copy)]
pub struct DhGexFactory {
    name: &'static str,
    hash: KexHash,
}

impl DhGexFactory {
    /// `diffie-hellman-group-exchange-sha1`
    pub fn sha1() -> Self {
        Self {
            name: "diffie-hellman-group-exchange-sha1",
            hash: KexHash::Sha1,
        }
    }

    /// `diffie-hellman-group-exchange-sha256`
    pub fn sha256() -> Self {
        Self {
            name: "diffie-hellman-group-exchange-sha256",
            hash: KexHash::Sha256,
        }
    }
}

impl NamedFactory for DhGexFactory {
    fn name(&self) -> &str {
        self.name
    }
}

impl KexFactory for DhGexFactory {
    fn hash(&self) -> KexHash {
        self.hash
    }

    fn is_group_exchange(&self) -> bool {
        true
    }

    fn create(&self, params: &[KexParam]) -> HalyardResult<Box<dyn KeyExchange>> {
        let (p, g) = match params {
            [KexParam::Int(p), KexParam::Int(g)] => (p, g),
            [_, _] => {
                return Err(HalyardError::Config(format!(
                    "{} parameters must be integers (p, g)",
                    self.name
                )))
            }
            _ => {
                return Err(HalyardError::Config(format!(
                    "{} requires exactly 2 parameters (p, g), got {}",
                    self.name,
                    params.len()
                )))
            }
        };

        let bits = p.bits();
        if bits < u64::from(GEX_MIN_BITS) || bits > u64::from(GEX_MAX_BITS) {
            return Err(HalyardError::Config(format!(
                "{} group size {} bits outside {}..={}",
                self.name, bits, GEX_MIN_BITS, GEX_MAX_BITS
            )));
        }
        let one = BigUint::from(1u32);
        if *g <= one || *g >= p - &one {
            return Err(HalyardError::Config(format!(
                "{} generator out of range",
                self.name
            )));
        }

        Ok(Box::new(DhExchange::new(
            self.name,
            self.hash,
            DhGroup::new(p.clone(), g.clone()),
        )))
    }
}

/// Diffie-Hellman over a MODP group.
pub struct DhExchange {
    name: &'static str,
    hash: KexHash,
    group: DhGroup,
    /// Private exponent `x` (big-endian).
    private: Option<Zeroizing<Vec<u8>>>,
    peer: Option<BigUint>,
}

impl DhExchange {
    /// Creates an exchange over `group`.
    pub fn new(name: &'static str, hash: KexHash, group: DhGroup) -> Self {
        Self {
            name,
            hash,
            group,
            private: None,
            peer: None,
        }
    }

    /// The group in use.
    pub fn group(&self) -> &DhGroup {
        &self.group
    }
}

impl KeyExchange for DhExchange {
    fn name(&self) -> &str {
        self.name
    }

    fn hash(&self) -> KexHash {
        self.hash
    }

    fn value_format(&self) -> ValueFormat {
        ValueFormat::Mpint
    }

    fn initiate(&mut self) -> HalyardResult<Vec<u8>> {
        let p_minus_one = &self.group.p - &BigUint::from(1u32);
        let x = rand::thread_rng().gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
        let y = self.group.g.modpow(&x, &self.group.p);
        self.private = Some(Zeroizing::new(x.to_bytes_be()));
        Ok(y.to_bytes_be())
    }

    fn consume_peer_value(&mut self, peer: &[u8]) -> HalyardResult<()> {
        let one = BigUint::from(1u32);
        let y = BigUint::from_bytes_be(peer);
        if y <= one || y >= &self.group.p - &one {
            return Err(HalyardError::Protocol(
                "Invalid peer DH public value: out of range".to_string(),
            ));
        }
        self.peer = Some(y);
        Ok(())
    }

    fn compute_shared_secret(&mut self) -> HalyardResult<SharedSecret> {
        let private = self.private.take().ok_or_else(|| {
            HalyardError::Protocol("DH exchange not initiated".to_string())
        })?;
        let peer = self.peer.as_ref().ok_or_else(|| {
            HalyardError::Protocol("DH peer value not received".to_string())
        })?;
        let x = BigUint::from_bytes_be(&private);
        let k = peer.modpow(&x, &self.group.p);
        Ok(SharedSecret::new(k.to_bytes_be()))
    }
}

impl std::fmt::Debug for DhExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhExchange")
            .field("name", &self.name)
            .field("group_bits", &self.group.bits())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::kex::{exchange_hash, ExchangeTranscript};

    fn exchange(factory: &dyn KexFactory, params: &[KexParam]) -> (SharedSecret, SharedSecret) {
        let mut a = factory.create(params).unwrap();
        let mut b = factory.create(params).unwrap();
        let ea = a.initiate().unwrap();
        let eb = b.initiate().unwrap();
        a.consume_peer_value(&eb).unwrap();
        b.consume_peer_value(&ea).unwrap();
        (
            a.compute_shared_secret().unwrap(),
            b.compute_shared_secret().unwrap(),
        )
    }

    #[test]
    fn test_group14_agreement() {
        let (a, b) = exchange(&DhGroupFactory::group14_sha256(), &[]);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_group1_agreement() {
        let (a, b) = exchange(&DhGroupFactory::group1_sha1(), &[]);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_gex_agreement() {
        let params = [
            KexParam::Int(GROUP14.p.clone()),
            KexParam::Int(GROUP14.g.clone()),
        ];
        let (a, b) = exchange(&DhGexFactory::sha256(), &params);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_gex_parameter_validation() {
        let gex = DhGexFactory::sha1();
        let p = KexParam::Int(GROUP14.p.clone());
        let g = KexParam::Int(GROUP14.g.clone());

        assert!(matches!(gex.create(&[]), Err(HalyardError::Config(_))));
        assert!(matches!(gex.create(&[p.clone()]), Err(HalyardError::Config(_))));
        assert!(matches!(
            gex.create(&[p.clone(), g.clone(), g.clone()]),
            Err(HalyardError::Config(_))
        ));
        assert!(matches!(
            gex.create(&[p.clone(), KexParam::Bytes(vec![2])]),
            Err(HalyardError::Config(_))
        ));
        assert!(matches!(
            gex.create(&[KexParam::Int(BigUint::from(23u32)), g.clone()]),
            Err(HalyardError::Config(_))
        ));
        assert!(gex.create(&[p, g]).is_ok());
    }

    #[test]
    fn test_fixed_group_rejects_params() {
        let params = [KexParam::Int(BigUint::from(2u32))];
        assert!(matches!(
            DhGroupFactory::group14_sha1().create(&params),
            Err(HalyardError::Config(_))
        ));
    }

    #[test]
    fn test_peer_value_range() {
        let mut dh = DhGroupFactory::group14_sha256().create(&[]).unwrap();
        dh.initiate().unwrap();
        assert!(matches!(
            dh.consume_peer_value(&[1]),
            Err(HalyardError::Protocol(_))
        ));
        assert!(dh.consume_peer_value(&[]).is_err());
        let p_minus_one = (&GROUP14.p - &BigUint::from(1u32)).to_bytes_be();
        assert!(dh.consume_peer_value(&p_minus_one).is_err());
        assert!(dh.consume_peer_value(&GROUP14.p.to_bytes_be()).is_err());
    }

    #[test]
    fn test_secret_requires_initiate() {
        let mut dh = DhGroupFactory::group14_sha256().create(&[]).unwrap();
        assert!(dh.compute_shared_secret().is_err());
    }

    #[test]
    fn test_both_sides_compute_same_hash() {
        let factory = DhGroupFactory::group14_sha1();
        let mut client = factory.create(&[]).unwrap();
        let mut server = factory.create(&[]).unwrap();
        let e = client.initiate().unwrap();
        let f = server.initiate().unwrap();
        client.consume_peer_value(&f).unwrap();
        server.consume_peer_value(&e).unwrap();
        let kc = client.compute_shared_secret().unwrap();
        let ks = server.compute_shared_secret().unwrap();

        let transcript = |k| ExchangeTranscript {
            client_version: "SSH-2.0-client",
            server_version: "SSH-2.0-server",
            client_kexinit: b"I_C",
            server_kexinit: b"I_S",
            host_key: b"K_S",
            group_exchange: None,
            client_value: &e,
            server_value: &f,
            shared_secret: k,
        };
        let hc = client.compute_exchange_hash(&transcript(&kc)).unwrap();
        let hs = server.compute_exchange_hash(&transcript(&ks)).unwrap();
        assert_eq!(hc, hs);
        assert_eq!(hc.len(), 20);
        assert_eq!(
            hc,
            exchange_hash(KexHash::Sha1, ValueFormat::Mpint, &transcript(&kc))
        );
    }
}
