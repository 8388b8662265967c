use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use concord_shared::{ContextKey, ContextValue};

/// Failure reported by the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct PersistenceError {
    pub reason: String,
}

impl PersistenceError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Optional durable storage behind the context. Loaded on start (or lazily
/// per key), saved on demand.
pub trait Persistence<K, V>: Send + Sync {
    fn load_all(&self) -> Result<Vec<(K, V)>, PersistenceError>;

    fn load(&self, key: &K) -> Result<Option<V>, PersistenceError>;

    fn save_all(&self, entries: &[(K, V)]) -> Result<(), PersistenceError>;

    fn save(&self, key: &K, value: &V) -> Result<(), PersistenceError>;
}

/// Pluggable local storage for the replicated entries.
///
/// Implementations may evict; the context reacts to eviction by treating the
/// key as non-resident (see `ReplicatedContext::on_evicted`). All methods are
/// called under the context's use/lock discipline and must be individually
/// thread-safe.
pub trait CacheAdapter<K, V>: Send + Sync {
    /// Insert, returning the previous value.
    fn put(&self, key: K, value: V) -> Option<V>;

    fn get(&self, key: &K) -> Option<V>;

    fn remove(&self, key: &K) -> Option<V>;

    fn keys(&self) -> Vec<K>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self);

    fn entries(&self) -> Vec<(K, V)>;
}

/// Default in-process store; never evicts.
pub struct LocalStore<K, V> {
    map: RwLock<HashMap<K, V>>,
}

impl<K: ContextKey, V: ContextValue> LocalStore<K, V> {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: ContextKey, V: ContextValue> Default for LocalStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ContextKey, V: ContextValue> CacheAdapter<K, V> for LocalStore<K, V> {
    fn put(&self, key: K, value: V) -> Option<V> {
        let Ok(mut map) = self.map.write() else {
            panic!("local store poisoned");
        };
        map.insert(key, value)
    }

    fn get(&self, key: &K) -> Option<V> {
        let Ok(map) = self.map.read() else {
            panic!("local store poisoned");
        };
        map.get(key).cloned()
    }

    fn remove(&self, key: &K) -> Option<V> {
        let Ok(mut map) = self.map.write() else {
            panic!("local store poisoned");
        };
        map.remove(key)
    }

    fn keys(&self) -> Vec<K> {
        let Ok(map) = self.map.read() else {
            panic!("local store poisoned");
        };
        map.keys().cloned().collect()
    }

    fn len(&self) -> usize {
        let Ok(map) = self.map.read() else {
            panic!("local store poisoned");
        };
        map.len()
    }

    fn clear(&self) {
        let Ok(mut map) = self.map.write() else {
            panic!("local store poisoned");
        };
        map.clear();
    }

    fn entries(&self) -> Vec<(K, V)> {
        let Ok(map) = self.map.read() else {
            panic!("local store poisoned");
        };
        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// Admission filter re-run during snapshot install; rejected entries are not
/// stored locally.
pub trait EntryFilter<K, V>: Send + Sync {
    fn accept(&self, key: &K, value: &V) -> bool;
}

/// Secondary-index collaborator, notified of every entry transition under
/// the same permit that mutated the store.
pub trait KeyIndex<K, V>: Send + Sync {
    fn entry_put(&self, key: &K, value: &V);

    fn entry_removed(&self, key: &K);

    fn cleared(&self);

    fn rebuild(&self, entries: &[(K, V)]);
}
