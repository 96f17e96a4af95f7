//! Named algorithm factories and their registries.
//!
//! Every negotiable SSH algorithm category (key exchange, host key signature,
//! cipher, MAC, compression) is backed by a [`FactoryRegistry`]: a fixed set
//! of builtin factories plus runtime-registered extensions.
//!
//! # Lookup rules
//!
//! - Names are matched case-insensitively.
//! - Builtins are consulted first, then extensions.
//! - An extension may not reuse the name of a builtin or of another
//!   extension.
//!
//! # Example
//!
//! ```rust
//! use halyard_proto::ssh::registry::AlgorithmRegistry;
//!
//! let registry = AlgorithmRegistry::global();
//! assert!(registry.kex.resolve("ECDH-SHA2-NISTP256").is_some());
//!
//! let parsed = registry.ciphers.parse_name_list("aes128-ctr,blowfish-cbc");
//! assert_eq!(parsed.names(), vec!["aes128-ctr"]);
//! assert_eq!(parsed.unresolved, vec!["blowfish-cbc"]);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use halyard_platform::{HalyardError, HalyardResult};
use once_cell::sync::Lazy;

use super::cipher::{self, CipherFactory};
use super::compression::{self, CompressionFactory};
use super::hostkey::{self, SignatureFactory};
use super::kex::{self, KexFactory};
use super::mac::{self, MacFactory};

/// A factory identified by its SSH algorithm name.
pub trait NamedFactory {
    /// Algorithm name as it appears in name-lists.
    fn name(&self) -> &str;

    /// Whether the backing implementation is usable in this process.
    fn is_supported(&self) -> bool {
        true
    }
}

/// Outcome of resolving a list of algorithm names.
pub struct ParseResult<F: ?Sized> {
    /// Factories in input order.
    pub resolved: Vec<Arc<F>>,
    /// Names that matched nothing, in input order.
    pub unresolved: Vec<String>,
}

impl<F: NamedFactory + ?Sized> ParseResult<F> {
    /// Names of the resolved factories.
    pub fn names(&self) -> Vec<&str> {
        self.resolved.iter().map(|f| f.name()).collect()
    }
}

impl<F: NamedFactory + ?Sized> fmt::Debug for ParseResult<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParseResult")
            .field("resolved", &self.names())
            .field("unresolved", &self.unresolved)
            .finish()
    }
}

/// Builtin factories plus mutable extensions for one algorithm category.
pub struct FactoryRegistry<F: ?Sized> {
    category: &'static str,
    builtins: Vec<Arc<F>>,
    extensions: RwLock<BTreeMap<String, Arc<F>>>,
}

impl<F: NamedFactory + ?Sized> FactoryRegistry<F> {
    /// Creates a registry with a fixed builtin set.
    pub fn new(category: &'static str, builtins: Vec<Arc<F>>) -> Self {
        Self {
            category,
            builtins,
            extensions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Category label used in diagnostics.
    pub fn category(&self) -> &'static str {
        self.category
    }

    /// Looks up a builtin by name (case-insensitive).
    pub fn builtin(&self, name: &str) -> Option<Arc<F>> {
        self.builtins
            .iter()
            .find(|f| f.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Builtin factories in preference order.
    pub fn builtins(&self) -> &[Arc<F>] {
        &self.builtins
    }

    /// Registers an extension factory.
    ///
    /// Fails with a `Config` error when the name collides (ignoring case)
    /// with a builtin or an already registered extension.
    pub fn register(&self, factory: Arc<F>) -> HalyardResult<()> {
        let name = factory.name().to_string();
        if name.is_empty() {
            return Err(HalyardError::Config(format!(
                "Empty {} factory name",
                self.category
            )));
        }
        if let Some(existing) = self.builtin(&name) {
            return Err(HalyardError::Config(format!(
                "Cannot override builtin {} factory {}",
                self.category,
                existing.name()
            )));
        }

        let key = name.to_ascii_lowercase();
        let mut extensions = self
            .extensions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = extensions.get(&key) {
            return Err(HalyardError::Config(format!(
                "{} factory {} already registered as {}",
                self.category,
                name,
                existing.name()
            )));
        }
        extensions.insert(key, factory);
        tracing::debug!(category = self.category, name = %name, "registered extension factory");
        Ok(())
    }

    /// Removes an extension; `None` when no extension has that name.
    pub fn unregister(&self, name: &str) -> Option<Arc<F>> {
        let removed = self
            .extensions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name.to_ascii_lowercase());
        if removed.is_some() {
            tracing::debug!(category = self.category, name, "unregistered extension factory");
        }
        removed
    }

    /// Resolves a name against builtins, then extensions.
    pub fn resolve(&self, name: &str) -> Option<Arc<F>> {
        if name.is_empty() {
            return None;
        }
        self.builtin(name).or_else(|| {
            self.extensions
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&name.to_ascii_lowercase())
                .cloned()
        })
    }

    /// Resolves each name in order.
    ///
    /// Duplicates are kept as given.
    pub fn parse_list<S: AsRef<str>>(&self, names: &[S]) -> ParseResult<F> {
        let mut resolved = Vec::with_capacity(names.len());
        let mut unresolved = Vec::new();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() {
                continue;
            }
            match self.resolve(name) {
                Some(factory) => resolved.push(factory),
                None => unresolved.push(name.to_string()),
            }
        }
        ParseResult {
            resolved,
            unresolved,
        }
    }

    /// Splits a comma separated list and resolves each entry.
    pub fn parse_name_list(&self, list: &str) -> ParseResult<F> {
        let names: Vec<&str> = list.split(',').collect();
        self.parse_list(&names)
    }

    /// Registered extensions, sorted by name.
    pub fn registered_extensions(&self) -> Vec<Arc<F>> {
        self.extensions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Names of every supported factory: builtins first, then extensions.
    pub fn supported_names(&self) -> Vec<String> {
        self.builtins
            .iter()
            .cloned()
            .chain(self.registered_extensions())
            .filter(|f| f.is_supported())
            .map(|f| f.name().to_string())
            .collect()
    }

    /// Resolves a negotiated name, requiring the factory to be supported.
    pub fn require(&self, name: &str) -> HalyardResult<Arc<F>> {
        match self.resolve(name) {
            Some(f) if f.is_supported() => Ok(f),
            Some(_) => Err(HalyardError::Negotiation(format!(
                "{} algorithm {} is not supported",
                self.category, name
            ))),
            None => Err(HalyardError::Negotiation(format!(
                "Unknown {} algorithm {}",
                self.category, name
            ))),
        }
    }
}

impl<F: NamedFactory + ?Sized> fmt::Debug for FactoryRegistry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let extensions: Vec<String> = self
            .registered_extensions()
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        f.debug_struct("FactoryRegistry")
            .field("category", &self.category)
            .field(
                "builtins",
                &self.builtins.iter().map(|b| b.name()).collect::<Vec<_>>(),
            )
            .field("extensions", &extensions)
            .finish()
    }
}

/// All algorithm categories used by a session.
#[derive(Debug)]
pub struct AlgorithmRegistry {
    /// Key exchange methods.
    pub kex: FactoryRegistry<dyn KexFactory>,
    /// Host key signature algorithms.
    pub host_keys: FactoryRegistry<dyn SignatureFactory>,
    /// Ciphers.
    pub ciphers: FactoryRegistry<dyn CipherFactory>,
    /// MAC algorithms.
    pub macs: FactoryRegistry<dyn MacFactory>,
    /// Compression algorithms.
    pub compression: FactoryRegistry<dyn CompressionFactory>,
}

static GLOBAL: Lazy<Arc<AlgorithmRegistry>> = Lazy::new(|| Arc::new(AlgorithmRegistry::new()));

impl AlgorithmRegistry {
    /// Creates a registry holding only the builtin factories.
    pub fn new() -> Self {
        Self {
            kex: FactoryRegistry::new("kex", kex::builtin_factories()),
            host_keys: FactoryRegistry::new("host key", hostkey::builtin_factories()),
            ciphers: FactoryRegistry::new("cipher", cipher::builtin_factories()),
            macs: FactoryRegistry::new("mac", mac::builtin_factories()),
            compression: FactoryRegistry::new("compression", compression::builtin_factories()),
        }
    }

    /// Process-wide registry shared by sessions that do not supply their own.
    pub fn global() -> Arc<AlgorithmRegistry> {
        Arc::clone(&GLOBAL)
    }
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, bool);

    impl NamedFactory for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn is_supported(&self) -> bool {
            self.1
        }
    }

    fn registry() -> FactoryRegistry<Named> {
        FactoryRegistry::new(
            "test",
            vec![
                Arc::new(Named("alpha", true)),
                Arc::new(Named("beta", false)),
            ],
        )
    }

    #[test]
    fn test_builtin_lookup_ignores_case() {
        let reg = registry();
        assert_eq!(reg.resolve("ALPHA").map(|f| f.name().to_string()), Some("alpha".into()));
        assert!(reg.resolve("gamma").is_none());
        assert!(reg.resolve("").is_none());
    }

    #[test]
    fn test_extension_collisions() {
        let reg = registry();
        assert!(matches!(
            reg.register(Arc::new(Named("Alpha", true))),
            Err(HalyardError::Config(_))
        ));

        reg.register(Arc::new(Named("my-kex", true))).unwrap();
        for variant in ["my-kex", "MY-KEX", "My-Kex"] {
            assert!(matches!(
                reg.register(Arc::new(Named(variant, true))),
                Err(HalyardError::Config(_))
            ));
        }

        assert!(reg.unregister("MY-kex").is_some());
        assert!(reg.unregister("my-kex").is_none());
        reg.register(Arc::new(Named("my-kex", true))).unwrap();
        assert!(reg.resolve("my-KEX").is_some());
    }

    #[test]
    fn test_parse_list_preserves_order() {
        let reg = registry();
        reg.register(Arc::new(Named("zeta", true))).unwrap();
        let parsed = reg.parse_name_list("zeta,unknown,alpha, beta ,,other");
        assert_eq!(parsed.names(), vec!["zeta", "alpha", "beta"]);
        assert_eq!(parsed.unresolved, vec!["unknown", "other"]);
    }

    #[test]
    fn test_registered_extensions_sorted() {
        let reg = registry();
        reg.register(Arc::new(Named("zz", true))).unwrap();
        reg.register(Arc::new(Named("Mm", true))).unwrap();
        reg.register(Arc::new(Named("aa", true))).unwrap();
        let names: Vec<String> = reg
            .registered_extensions()
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        assert_eq!(names, vec!["aa", "Mm", "zz"]);
    }

    #[test]
    fn test_supported_names_filters_unsupported() {
        let reg = registry();
        reg.register(Arc::new(Named("ext-off", false))).unwrap();
        reg.register(Arc::new(Named("ext-on", true))).unwrap();
        assert_eq!(reg.supported_names(), vec!["alpha", "ext-on"]);
    }

    #[test]
    fn test_require_rejects_unsupported() {
        let reg = registry();
        assert!(reg.require("alpha").is_ok());
        assert!(matches!(reg.require("beta"), Err(HalyardError::Negotiation(_))));
        assert!(matches!(reg.require("nope"), Err(HalyardError::Negotiation(_))));
    }

    #[test]
    fn test_global_builtins() {
        let reg = AlgorithmRegistry::global();
        for name in [
            "diffie-hellman-group1-sha1",
            "diffie-hellman-group14-sha1",
            "diffie-hellman-group14-sha256",
            "diffie-hellman-group-exchange-sha1",
            "diffie-hellman-group-exchange-sha256",
            "ecdh-sha2-nistp256",
            "ecdh-sha2-nistp384",
            "ecdh-sha2-nistp521",
            "curve25519-sha256",
        ] {
            assert!(reg.kex.resolve(name).is_some(), "missing kex {}", name);
        }
        assert!(reg.host_keys.resolve("ssh-ed25519").is_some());
        assert!(reg.ciphers.resolve("aes256-ctr").is_some());
        assert!(reg.macs.resolve("hmac-sha1").is_some());
        assert!(reg.compression.resolve("none").is_some());
    }
}
