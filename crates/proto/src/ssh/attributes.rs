//! Typed attribute bags attached to sessions and channels.
//!
//! ```rust
//! use halyard_proto::ssh::attributes::{AttributeKey, Attributes};
//!
//! let user: AttributeKey<String> = AttributeKey::new("user");
//! let attrs = Attributes::new();
//! attrs.set(&user, "alice".to_string());
//! assert_eq!(attrs.get(&user).as_deref(), Some("alice"));
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Identifies one attribute and its value type.
///
/// Every call to [`AttributeKey::new`] yields a distinct key, even for the
/// same name.
pub struct AttributeKey<T> {
    id: u64,
    name: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    /// Creates a new key.
    pub fn new(name: &'static str) -> Self {
        Self {
            id: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            name,
            _type: PhantomData,
        }
    }

    /// Name used in diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> fmt::Debug for AttributeKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttributeKey({}#{})", self.name, self.id)
    }
}

/// Values keyed by [`AttributeKey`].
#[derive(Default)]
pub struct Attributes {
    values: RwLock<HashMap<u64, Box<dyn Any + Send + Sync>>>,
}

impl Attributes {
    /// Creates an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the value stored under `key`.
    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: &AttributeKey<T>) -> Option<T> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key.id)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Stores `value`, returning the previous one.
    pub fn set<T: Send + Sync + 'static>(&self, key: &AttributeKey<T>, value: T) -> Option<T> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.id, Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// Removes and returns the value under `key`.
    pub fn remove<T: Send + Sync + 'static>(&self, key: &AttributeKey<T>) -> Option<T> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key.id)
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// Whether `key` has a value.
    pub fn contains<T>(&self, key: &AttributeKey<T>) -> bool {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&key.id)
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the bag is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attributes").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_distinct() {
        let a: AttributeKey<u32> = AttributeKey::new("n");
        let b: AttributeKey<u32> = AttributeKey::new("n");
        let attrs = Attributes::new();
        attrs.set(&a, 1);
        assert_eq!(attrs.get(&a), Some(1));
        assert_eq!(attrs.get(&b), None);
    }

    #[test]
    fn test_set_replace_remove() {
        let key: AttributeKey<Vec<u8>> = AttributeKey::new("blob");
        let attrs = Attributes::new();
        assert!(attrs.is_empty());
        assert_eq!(attrs.set(&key, vec![1]), None);
        assert_eq!(attrs.set(&key, vec![2]), Some(vec![1]));
        assert!(attrs.contains(&key));
        assert_eq!(attrs.remove(&key), Some(vec![2]));
        assert_eq!(attrs.remove(&key), None);
        assert_eq!(attrs.len(), 0);
    }
}
