use std::sync::{Arc, RwLock};

use concord_shared::ValueDiff;

/// Observer of context transitions. Before-hooks run on the originating node
/// only and may veto the operation (a veto is a clean no-op, not an error);
/// after-hooks fire on every node that applied the change.
///
/// Callbacks run on the mutating thread and must not re-enter a mutation on
/// the same key.
pub trait UpdateListener<K, V>: Send + Sync {
    fn before_put(&self, key: &K, candidate: &V, previous: Option<&V>) -> bool {
        let _ = (key, candidate, previous);
        true
    }

    fn after_put(&self, key: &K, value: &V, previous: Option<&V>) {
        let _ = (key, value, previous);
    }

    fn before_update(&self, key: &K, diff: &ValueDiff) -> bool {
        let _ = (key, diff);
        true
    }

    fn after_update(&self, key: &K, diff: &ValueDiff) {
        let _ = (key, diff);
    }

    fn before_remove(&self, key: &K, previous: Option<&V>) -> bool {
        let _ = (key, previous);
        true
    }

    fn after_remove(&self, key: &K, previous: Option<&V>) {
        let _ = (key, previous);
    }

    /// The local replica was cleared as part of a snapshot install.
    fn on_clear_synchronize(&self) {}

    /// An entry arrived as part of a snapshot install.
    fn on_put_synchronize(&self, key: &K, value: &V) {
        let _ = (key, value);
    }

    /// This node gained (`true`) or lost (`false`) the Main role.
    fn on_change_main(&self, is_main: bool) {
        let _ = is_main;
    }
}

/// Ordered listener chain with short-circuiting before-hooks.
pub struct ListenerRegistry<K, V> {
    listeners: RwLock<Vec<Arc<dyn UpdateListener<K, V>>>>,
}

impl<K, V> ListenerRegistry<K, V> {
    pub fn new(listeners: Vec<Arc<dyn UpdateListener<K, V>>>) -> Self {
        Self {
            listeners: RwLock::new(listeners),
        }
    }

    pub fn add(&self, listener: Arc<dyn UpdateListener<K, V>>) {
        let Ok(mut listeners) = self.listeners.write() else {
            panic!("listener registry poisoned");
        };
        listeners.push(listener);
    }

    fn snapshot(&self) -> Vec<Arc<dyn UpdateListener<K, V>>> {
        let Ok(listeners) = self.listeners.read() else {
            panic!("listener registry poisoned");
        };
        listeners.clone()
    }

    pub fn before_put(&self, key: &K, candidate: &V, previous: Option<&V>) -> bool {
        self.snapshot()
            .iter()
            .all(|l| l.before_put(key, candidate, previous))
    }

    pub fn after_put(&self, key: &K, value: &V, previous: Option<&V>) {
        for listener in self.snapshot() {
            listener.after_put(key, value, previous);
        }
    }

    pub fn before_update(&self, key: &K, diff: &ValueDiff) -> bool {
        self.snapshot().iter().all(|l| l.before_update(key, diff))
    }

    pub fn after_update(&self, key: &K, diff: &ValueDiff) {
        for listener in self.snapshot() {
            listener.after_update(key, diff);
        }
    }

    pub fn before_remove(&self, key: &K, previous: Option<&V>) -> bool {
        self.snapshot()
            .iter()
            .all(|l| l.before_remove(key, previous))
    }

    pub fn after_remove(&self, key: &K, previous: Option<&V>) {
        for listener in self.snapshot() {
            listener.after_remove(key, previous);
        }
    }

    pub fn on_clear_synchronize(&self) {
        for listener in self.snapshot() {
            listener.on_clear_synchronize();
        }
    }

    pub fn on_put_synchronize(&self, key: &K, value: &V) {
        for listener in self.snapshot() {
            listener.on_put_synchronize(key, value);
        }
    }

    pub fn on_change_main(&self, is_main: bool) {
        for listener in self.snapshot() {
            listener.on_change_main(is_main);
        }
    }
}
