//! MODP groups for finite-field Diffie-Hellman.
//!
//! - Group 1: 1024-bit Oakley group 2 (RFC 2409 Section 6.2)
//! - Group 14: 2048-bit MODP group (RFC 3526 Section 3)
//!
//! Both use generator 2.

use num_bigint::BigUint;
use once_cell::sync::Lazy;

const GROUP1_PRIME: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
    29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
    EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
    E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
    FFFFFFFFFFFFFFFF";

const GROUP14_PRIME: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
    29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
    EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
    E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
    C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
    83655D23DCA3AD961C62F356208552BB9ED529077096966D\
    670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
    E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
    DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
    15728E5A8AACAA68FFFFFFFFFFFFFFFF";

/// A prime modulus and generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhGroup {
    /// Safe prime `p`.
    pub p: BigUint,
    /// Generator `g`.
    pub g: BigUint,
}

impl DhGroup {
    /// Creates a group from explicit parameters.
    pub fn new(p: BigUint, g: BigUint) -> Self {
        Self { p, g }
    }

    /// Size of `p` in bits.
    pub fn bits(&self) -> u64 {
        self.p.bits()
    }

    fn from_hex(prime: &str) -> Self {
        Self {
            p: BigUint::parse_bytes(prime.as_bytes(), 16).unwrap_or_default(),
            g: BigUint::from(2u32),
        }
    }
}

/// Oakley group 2, used by `diffie-hellman-group1-sha1`.
pub static GROUP1: Lazy<DhGroup> = Lazy::new(|| DhGroup::from_hex(GROUP1_PRIME));

/// RFC 3526 group 14, used by the `diffie-hellman-group14-*` methods.
pub static GROUP14: Lazy<DhGroup> = Lazy::new(|| DhGroup::from_hex(GROUP14_PRIME));

/// Supplies groups to a group-exchange responder (RFC 4419 Section 3).
pub trait GroupProvider: Send + Sync {
    /// Picks a group of `min..=max` bits, ideally close to `preferred`.
    fn select(&self, min: u32, preferred: u32, max: u32) -> Option<DhGroup>;
}

/// Serves the compiled-in groups.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinGroups;

impl GroupProvider for BuiltinGroups {
    fn select(&self, min: u32, preferred: u32, max: u32) -> Option<DhGroup> {
        let candidates = [&*GROUP1, &*GROUP14];
        candidates
            .into_iter()
            .filter(|g| {
                let bits = g.bits();
                bits >= u64::from(min) && bits <= u64::from(max)
            })
            .min_by_key(|g| g.bits().abs_diff(u64::from(preferred)))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_sizes() {
        assert_eq!(GROUP1.bits(), 1024);
        assert_eq!(GROUP14.bits(), 2048);
        assert_eq!(GROUP14.g, BigUint::from(2u32));
    }

    #[test]
    fn test_select_prefers_closest() {
        let groups = BuiltinGroups;
        assert_eq!(groups.select(1024, 2048, 8192).unwrap().bits(), 2048);
        assert_eq!(groups.select(1024, 1024, 8192).unwrap().bits(), 1024);
        assert_eq!(groups.select(512, 1500, 1024).unwrap().bits(), 1024);
        assert!(groups.select(3072, 4096, 8192).is_none());
    }
}
