//! Caching of compiled units.
//!
//! Provides LRU-based caching of [`CompiledUnit`]s keyed by a BLAKE3 hash of
//! the file name and source. Recompiling the same revision then skips the
//! parse check.
//!
//! # Examples
//!
//! ```
//! use backstage_sandbox::cache::UnitCache;
//!
//! let cache = UnitCache::new(100);
//! let key = UnitCache::cache_key_for_source("fn.js", "function main() {}");
//! assert!(cache.get(&key).is_none());
//! ```

use crate::compiler::CompiledUnit;
use blake3::Hasher;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

/// Cache key for compiled units.
///
/// # Examples
///
/// ```
/// use backstage_sandbox::cache::CacheKey;
///
/// let key1 = CacheKey::new("abc123");
/// let key2 = CacheKey::new("abc123");
/// assert_eq!(key1, key2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Creates a new cache key.
    #[must_use]
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// Returns the cache key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// LRU cache for compiled units.
///
/// # Thread Safety
///
/// This type is `Send` and `Sync`, using `Mutex` for safe concurrent access.
pub struct UnitCache {
    cache: Mutex<lru::LruCache<CacheKey, CompiledUnit>>,
}

impl std::fmt::Debug for UnitCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl UnitCache {
    /// Creates a cache holding up to `capacity` units (at least one).
    ///
    /// # Examples
    ///
    /// ```
    /// use backstage_sandbox::cache::UnitCache;
    ///
    /// assert_eq!(UnitCache::new(50).capacity(), 50);
    /// assert_eq!(UnitCache::new(0).capacity(), 1);
    /// ```
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(lru::LruCache::new(capacity)),
        }
    }

    /// Generates a cache key for one source revision.
    ///
    /// The file name takes part in the hash: it is baked into stack traces.
    ///
    /// # Examples
    ///
    /// ```
    /// use backstage_sandbox::cache::UnitCache;
    ///
    /// let a = UnitCache::cache_key_for_source("a.js", "x");
    /// let b = UnitCache::cache_key_for_source("b.js", "x");
    /// assert_ne!(a, b);
    /// assert!(a.as_str().starts_with("js_"));
    /// ```
    #[must_use]
    pub fn cache_key_for_source(filename: &str, source: &str) -> CacheKey {
        let mut hasher = Hasher::new();
        hasher.update(&(filename.len() as u64).to_le_bytes());
        hasher.update(filename.as_bytes());
        hasher.update(source.as_bytes());
        CacheKey::new(format!("js_{}", hasher.finalize().to_hex()))
    }

    /// Gets a unit, updating LRU order on hit.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<CompiledUnit> {
        self.lock().get(key).cloned()
    }

    /// Inserts a unit, evicting the least recently used one when full.
    pub fn insert(&self, key: CacheKey, unit: CompiledUnit) {
        let mut cache = self.lock();
        tracing::debug!(key = %key, filename = unit.filename(), "compiled unit cached");
        cache.put(key, unit);
    }

    /// Checks if a key exists without touching LRU order.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().contains(key)
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of cached units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of units.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, lru::LruCache<CacheKey, CompiledUnit>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unit(name: &str) -> CompiledUnit {
        CompiledUnit::new(name, &format!("// {name}"), true, Duration::from_millis(100))
    }

    #[test]
    fn test_insert_and_get() {
        let cache = UnitCache::new(10);
        let key = UnitCache::cache_key_for_source("a.js", "x");
        cache.insert(key.clone(), unit("a.js"));

        assert!(cache.contains(&key));
        assert_eq!(cache.get(&key).unwrap().filename(), "a.js");
    }

    #[test]
    fn test_lru_eviction() {
        let cache = UnitCache::new(2);
        let keys: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|s| UnitCache::cache_key_for_source(s, s))
            .collect();
        cache.insert(keys[0].clone(), unit("a"));
        cache.insert(keys[1].clone(), unit("b"));
        let _ = cache.get(&keys[0]);
        cache.insert(keys[2].clone(), unit("c"));

        assert!(cache.contains(&keys[0]));
        assert!(!cache.contains(&keys[1]));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_key_is_deterministic() {
        assert_eq!(
            UnitCache::cache_key_for_source("a.js", "src"),
            UnitCache::cache_key_for_source("a.js", "src")
        );
        assert_ne!(
            UnitCache::cache_key_for_source("a.js", "src"),
            UnitCache::cache_key_for_source("a.js", "src2")
        );
    }

    #[test]
    fn test_clear() {
        let cache = UnitCache::new(4);
        cache.insert(CacheKey::new("k"), unit("a"));
        cache.clear();
        assert!(cache.is_empty());
    }
}
