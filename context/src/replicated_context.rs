use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use log::{debug, info, trace, warn};

use concord_shared::{
    routing_of, ClusterView, ContextError, ContextEvent, ContextKey, ContextResult, ContextValue,
    DiffError, DiffOutcome, EventReply, LockOptions, MemberId, MembershipChange, MessageBus, Role,
    SendError, TimeBudget, TimerService, Topic,
};

use crate::barrier::UseLockBarrier;
use crate::collaborators::{CacheAdapter, EntryFilter, KeyIndex, LocalStore, Persistence};
use crate::config::ContextConfig;
use crate::fetch_gate::{BufferedMutation, ClientFetchGate, GateEntry};
use crate::handler::REJECT_STALE_UPDATE;
use crate::listeners::{ListenerRegistry, UpdateListener};
use crate::locks::{KeyLockManager, LockError, LockHost, ReplyContinuation, SharedLockHost};

/// How often a stale-base rejection from Main is retried with a fresh diff
/// before the update gives up.
const STALE_UPDATE_RETRIES: usize = 2;

/// How an operation travels to the rest of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Propagation {
    /// Broadcast and gather acknowledgements from every server peer.
    Request,
    /// Broadcast without waiting for acknowledgements.
    FireAndForget,
    /// Apply on this node only.
    LocalOnly,
}

pub(crate) struct ContextInner<K, V, B> {
    pub(crate) config: ContextConfig,
    pub(crate) topic: Topic,
    pub(crate) client_topic: Topic,
    pub(crate) bus: B,
    pub(crate) store: Box<dyn CacheAdapter<K, V>>,
    pub(crate) barrier: UseLockBarrier,
    pub(crate) locks: Arc<KeyLockManager<K>>,
    pub(crate) gate: ClientFetchGate<K, V>,
    pub(crate) view: RwLock<ClusterView>,
    pub(crate) current_main: RwLock<Option<MemberId>>,
    pub(crate) listeners: ListenerRegistry<K, V>,
    pub(crate) persistence: Option<Box<dyn Persistence<K, V>>>,
    pub(crate) index: Option<Box<dyn KeyIndex<K, V>>>,
    pub(crate) filter: Option<Box<dyn EntryFilter<K, V>>>,
}

impl<K: ContextKey, V: ContextValue, B: MessageBus<K, V>> ContextInner<K, V, B> {
    pub(crate) fn current_main(&self) -> Option<MemberId> {
        let Ok(main) = self.current_main.read() else {
            panic!("main record poisoned");
        };
        main.clone()
    }

    pub(crate) fn is_main(&self) -> bool {
        self.current_main().as_ref() == Some(&self.bus.local_id())
    }
}

/// A replicated, cluster-aware shared key-value map.
///
/// Every node holds a `ReplicatedContext` on a common bus topic; mutations
/// propagate to all nodes, one elected Main node arbitrates locks and serves
/// snapshots and demand fetches, and client-role nodes hold a demand-filled
/// subset instead of a full replica. Cheap to clone; clones share state.
pub struct ReplicatedContext<K, V, B> {
    pub(crate) inner: Arc<ContextInner<K, V, B>>,
}

impl<K, V, B> Clone for ReplicatedContext<K, V, B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Assembles a [ReplicatedContext] from a bus and optional collaborators.
pub struct ContextBuilder<K, V, B> {
    config: ContextConfig,
    bus: B,
    store: Option<Box<dyn CacheAdapter<K, V>>>,
    persistence: Option<Box<dyn Persistence<K, V>>>,
    index: Option<Box<dyn KeyIndex<K, V>>>,
    filter: Option<Box<dyn EntryFilter<K, V>>>,
    listeners: Vec<Arc<dyn UpdateListener<K, V>>>,
}

impl<K: ContextKey, V: ContextValue, B: MessageBus<K, V>> ContextBuilder<K, V, B> {
    pub fn new(bus: B) -> Self {
        Self {
            config: ContextConfig::default(),
            bus,
            store: None,
            persistence: None,
            index: None,
            filter: None,
            listeners: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: ContextConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Box<dyn CacheAdapter<K, V>>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_persistence(mut self, persistence: Box<dyn Persistence<K, V>>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_index(mut self, index: Box<dyn KeyIndex<K, V>>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_filter(mut self, filter: Box<dyn EntryFilter<K, V>>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn UpdateListener<K, V>>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> ReplicatedContext<K, V, B> {
        let topic = Topic::new(self.config.topic.clone());
        let client_topic = topic.client_sub_topic();
        let local = self.bus.local_id();
        let timers = Arc::new(TimerService::new());
        ReplicatedContext {
            inner: Arc::new(ContextInner {
                config: self.config,
                topic,
                client_topic,
                bus: self.bus,
                store: self
                    .store
                    .unwrap_or_else(|| Box::new(LocalStore::<K, V>::new())),
                barrier: UseLockBarrier::new(),
                locks: Arc::new(KeyLockManager::new(timers)),
                gate: ClientFetchGate::new(),
                view: RwLock::new(ClusterView::solo(local)),
                current_main: RwLock::new(None),
                listeners: ListenerRegistry::new(self.listeners),
                persistence: self.persistence,
                index: self.index,
                filter: self.filter,
            }),
        }
    }
}

impl<K: ContextKey, V: ContextValue, B: MessageBus<K, V> + 'static> ReplicatedContext<K, V, B> {
    // Lifecycle

    /// Bring the context online: elect Main from the current view, load
    /// persisted entries, and pull an initial snapshot when configured.
    ///
    /// A failed startup synchronize is tolerated on client role (the cache
    /// starts empty and demand-fills) and fatal on server roles.
    pub fn start(&self) -> ContextResult<()> {
        self.refresh_main();
        if self.inner.persistence.is_some() && !self.inner.config.lazy_load {
            self.load()?;
        }
        if self.inner.config.synchronize_on_start && !self.is_main() {
            if let Err(err) = self.synchronize() {
                if self.inner.config.client_role {
                    warn!("startup synchronize failed, starting empty: {err}");
                } else {
                    return Err(err);
                }
            }
        }
        info!(
            "context on topic {} started as {:?}",
            self.inner.topic,
            self.role()
        );
        Ok(())
    }

    pub fn local_id(&self) -> MemberId {
        self.inner.bus.local_id()
    }

    pub fn role(&self) -> Role {
        if self.inner.config.client_role {
            Role::Client
        } else if self.is_main() {
            Role::Main
        } else {
            Role::Secondary
        }
    }

    pub fn is_main(&self) -> bool {
        self.inner.is_main()
    }

    pub fn current_main(&self) -> Option<MemberId> {
        self.inner.current_main()
    }

    pub fn add_listener(&self, listener: Arc<dyn UpdateListener<K, V>>) {
        self.inner.listeners.add(listener);
    }

    // Reads

    /// Read a value. Server roles answer from the replica (optionally lazily
    /// loading from persistence); a client miss triggers a single-flight
    /// demand fetch from Main.
    pub fn get(&self, key: &K) -> ContextResult<Option<V>> {
        {
            let _permit = self.inner.barrier.acquire_use(TimeBudget::unbounded())?;
            if let Some(value) = self.inner.store.get(key) {
                return Ok(Some(value));
            }
            if !self.inner.config.client_role {
                if self.inner.config.lazy_load {
                    if let Some(persistence) = &self.inner.persistence {
                        let loaded = persistence
                            .load(key)
                            .map_err(|err| ContextError::Persistence { reason: err.reason })?;
                        if let Some(value) = loaded {
                            self.inner.store.put(key.clone(), value.clone());
                            self.index_put(key, &value);
                            return Ok(Some(value));
                        }
                    }
                }
                return Ok(None);
            }
        }
        // Client miss; fetch outside the permit so inbound traffic and lock
        // phases are not held up by the remote round trip.
        self.demand_fetch(key)
    }

    /// Read from the local store only; never fetches.
    pub fn get_local(&self, key: &K) -> ContextResult<Option<V>> {
        let _permit = self.inner.barrier.acquire_use(TimeBudget::unbounded())?;
        Ok(self.inner.store.get(key))
    }

    /// Local residency check. On client role this reflects the demand-filled
    /// subset, not the cluster.
    pub fn contains_key(&self, key: &K) -> ContextResult<bool> {
        let _permit = self.inner.barrier.acquire_use(TimeBudget::unbounded())?;
        Ok(self.inner.store.get(key).is_some())
    }

    pub fn keys(&self) -> ContextResult<Vec<K>> {
        self.require_replica("keys")?;
        let _permit = self.inner.barrier.acquire_use(TimeBudget::unbounded())?;
        Ok(self.inner.store.keys())
    }

    pub fn len(&self) -> ContextResult<usize> {
        self.require_replica("len")?;
        let _permit = self.inner.barrier.acquire_use(TimeBudget::unbounded())?;
        Ok(self.inner.store.len())
    }

    pub fn is_empty(&self) -> ContextResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn contains_value(&self, value: &V) -> ContextResult<bool>
    where
        V: PartialEq,
    {
        self.require_replica("contains_value")?;
        let _permit = self.inner.barrier.acquire_use(TimeBudget::unbounded())?;
        Ok(self
            .inner
            .store
            .entries()
            .iter()
            .any(|(_, stored)| stored == value))
    }

    /// Consistent snapshot of the given keys, taken under one use permit.
    pub fn view(&self, keys: &[K]) -> ContextResult<Vec<(K, V)>> {
        let _permit = self.inner.barrier.acquire_use(TimeBudget::unbounded())?;
        Ok(keys
            .iter()
            .filter_map(|key| self.inner.store.get(key).map(|value| (key.clone(), value)))
            .collect())
    }

    fn require_replica(&self, operation: &'static str) -> ContextResult<()> {
        if self.inner.config.client_role {
            return Err(ContextError::unsupported(
                operation,
                "client role holds no full replica",
            ));
        }
        Ok(())
    }

    // Mutations

    pub fn put(&self, key: K, value: V) -> ContextResult<Option<V>> {
        self.put_with(key, value, Propagation::Request)
    }

    pub fn put_async(&self, key: K, value: V) -> ContextResult<Option<V>> {
        self.put_with(key, value, Propagation::FireAndForget)
    }

    pub fn put_local(&self, key: K, value: V) -> ContextResult<Option<V>> {
        self.put_with(key, value, Propagation::LocalOnly)
    }

    pub fn put_all(&self, entries: Vec<(K, V)>) -> ContextResult<()> {
        self.put_all_with(entries, Propagation::Request)
    }

    pub fn put_all_async(&self, entries: Vec<(K, V)>) -> ContextResult<()> {
        self.put_all_with(entries, Propagation::FireAndForget)
    }

    pub fn put_all_local(&self, entries: Vec<(K, V)>) -> ContextResult<()> {
        self.put_all_with(entries, Propagation::LocalOnly)
    }

    pub fn remove(&self, key: &K) -> ContextResult<Option<V>> {
        self.remove_with(key, Propagation::Request)
    }

    pub fn remove_async(&self, key: &K) -> ContextResult<Option<V>> {
        self.remove_with(key, Propagation::FireAndForget)
    }

    pub fn remove_local(&self, key: &K) -> ContextResult<Option<V>> {
        self.remove_with(key, Propagation::LocalOnly)
    }

    pub fn clear(&self) -> ContextResult<()> {
        self.clear_with(Propagation::Request)
    }

    pub fn clear_async(&self) -> ContextResult<()> {
        self.clear_with(Propagation::FireAndForget)
    }

    pub fn clear_local(&self) -> ContextResult<()> {
        self.clear_with(Propagation::LocalOnly)
    }

    /// Differential update: compute the sparse diff from the stored value to
    /// `candidate` and propagate only the diff. Falls back to a whole-value
    /// put when the key is absent; value types that do not support diffing
    /// reject the call with an unsupported-operation error.
    pub fn update(&self, key: K, candidate: V) -> ContextResult<()> {
        self.update_with(key, candidate, false, Propagation::Request)
            .map(|_| ())
    }

    pub fn update_async(&self, key: K, candidate: V) -> ContextResult<()> {
        self.update_with(key, candidate, false, Propagation::FireAndForget)
            .map(|_| ())
    }

    pub fn update_local(&self, key: K, candidate: V) -> ContextResult<()> {
        self.update_with(key, candidate, false, Propagation::LocalOnly)
            .map(|_| ())
    }

    /// Like [update](Self::update) but a no-op returning `false` when the
    /// key is absent.
    pub fn update_if_exists(&self, key: K, candidate: V) -> ContextResult<bool> {
        self.update_with(key, candidate, true, Propagation::Request)
    }

    pub fn update_if_exists_async(&self, key: K, candidate: V) -> ContextResult<bool> {
        self.update_with(key, candidate, true, Propagation::FireAndForget)
    }

    pub fn update_if_exists_local(&self, key: K, candidate: V) -> ContextResult<bool> {
        self.update_with(key, candidate, true, Propagation::LocalOnly)
    }

    fn put_with(&self, key: K, value: V, propagation: Propagation) -> ContextResult<Option<V>> {
        let permit = self.inner.barrier.acquire_use(TimeBudget::unbounded())?;
        let peeked = self.inner.store.get(&key);
        if !self.inner.listeners.before_put(&key, &value, peeked.as_ref()) {
            debug!("put of {key:?} vetoed");
            return Ok(None);
        }
        self.broadcast(
            ContextEvent::Put {
                key: key.clone(),
                value: value.clone(),
            },
            Some(routing_of(&key)),
            propagation,
        )?;
        if self.inner.config.client_role {
            // Buffered before the store write: an in-flight demand fetch
            // replays this put instead of resurrecting older state.
            self.inner
                .gate
                .buffer(&key, BufferedMutation::Put(value.clone()));
        }
        let previous = self.inner.store.put(key.clone(), value.clone());
        self.index_put(&key, &value);
        drop(permit);
        self.inner.listeners.after_put(&key, &value, previous.as_ref());
        Ok(previous)
    }

    fn put_all_with(&self, entries: Vec<(K, V)>, propagation: Propagation) -> ContextResult<()> {
        let permit = self.inner.barrier.acquire_use(TimeBudget::unbounded())?;
        let mut accepted = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let peeked = self.inner.store.get(&key);
            if self.inner.listeners.before_put(&key, &value, peeked.as_ref()) {
                accepted.push((key, value));
            } else {
                debug!("put of {key:?} vetoed");
            }
        }
        if accepted.is_empty() {
            return Ok(());
        }
        self.broadcast(
            ContextEvent::PutAll {
                entries: accepted.clone(),
            },
            None,
            propagation,
        )?;
        let mut previous_values = Vec::with_capacity(accepted.len());
        for (key, value) in &accepted {
            if self.inner.config.client_role {
                self.inner
                    .gate
                    .buffer(key, BufferedMutation::Put(value.clone()));
            }
            let previous = self.inner.store.put(key.clone(), value.clone());
            self.index_put(key, value);
            previous_values.push(previous);
        }
        drop(permit);
        for ((key, value), previous) in accepted.iter().zip(&previous_values) {
            self.inner.listeners.after_put(key, value, previous.as_ref());
        }
        Ok(())
    }

    fn remove_with(&self, key: &K, propagation: Propagation) -> ContextResult<Option<V>> {
        let permit = self.inner.barrier.acquire_use(TimeBudget::unbounded())?;
        let peeked = self.inner.store.get(key);
        if !self.inner.listeners.before_remove(key, peeked.as_ref()) {
            debug!("remove of {key:?} vetoed");
            return Ok(None);
        }
        self.broadcast(
            ContextEvent::Remove { key: key.clone() },
            Some(routing_of(key)),
            propagation,
        )?;
        if self.inner.config.client_role {
            self.inner.gate.buffer(key, BufferedMutation::Remove);
        }
        let previous = self.inner.store.remove(key);
        if previous.is_some() {
            self.index_removed(key);
        }
        drop(permit);
        self.inner.listeners.after_remove(key, previous.as_ref());
        Ok(previous)
    }

    fn clear_with(&self, propagation: Propagation) -> ContextResult<()> {
        let _permit = self.inner.barrier.acquire_use(TimeBudget::unbounded())?;
        self.broadcast(ContextEvent::Clear, None, propagation)?;
        self.inner.store.clear();
        if let Some(index) = &self.inner.index {
            index.cleared();
        }
        Ok(())
    }

    fn update_with(
        &self,
        key: K,
        candidate: V,
        if_exists: bool,
        propagation: Propagation,
    ) -> ContextResult<bool> {
        if !candidate.supports_diff() {
            return Err(ContextError::unsupported(
                "update",
                "value type does not support differential updates",
            ));
        }
        let mut current = self.get(&key)?;
        let mut stale_retries = 0;
        loop {
            if if_exists && current.is_none() {
                return Ok(false);
            }
            let Some(mut base) = current else {
                // Nothing to diff against; replaces wholesale.
                self.put_with(key, candidate, propagation)?;
                return Ok(true);
            };
            let diff = match base.diff_against(&candidate).map_err(diff_error)? {
                Some(diff) => diff,
                None => {
                    trace!("update of {key:?} changed nothing");
                    return Ok(true);
                }
            };
            if !self.inner.listeners.before_update(&key, &diff) {
                debug!("update of {key:?} vetoed");
                return Ok(false);
            }
            let permit = self.inner.barrier.acquire_use(TimeBudget::unbounded())?;
            match self.broadcast(
                ContextEvent::Update {
                    key: key.clone(),
                    diff: diff.clone(),
                    if_exists,
                },
                Some(routing_of(&key)),
                propagation,
            ) {
                Ok(()) => {}
                // Main holds versions this replica missed; the diff was
                // computed against a superseded base. Fetch the
                // authoritative value and re-diff against it.
                Err(ContextError::Send(SendError::Remote { message, .. }))
                    if message == REJECT_STALE_UPDATE
                        && stale_retries < STALE_UPDATE_RETRIES =>
                {
                    stale_retries += 1;
                    drop(permit);
                    info!("stale update of {key:?} rejected by main, resyncing");
                    self.resync_key(&key)?;
                    current = self.get_local(&key)?;
                    continue;
                }
                Err(err) => return Err(err),
            }
            match base.apply_diff(&diff).map_err(diff_error)? {
                DiffOutcome::Applied => {
                    if self.inner.config.client_role {
                        self.inner
                            .gate
                            .buffer(&key, BufferedMutation::Update(diff.clone()));
                    }
                    self.inner.store.put(key.clone(), base.clone());
                    self.index_put(&key, &base);
                }
                DiffOutcome::AlreadyCurrent => {
                    debug!("update of {key:?} already current");
                }
                // The diff was computed against this exact base value.
                DiffOutcome::Conflict => {
                    warn!("self-conflict applying update of {key:?}");
                }
            }
            drop(permit);
            self.inner.listeners.after_update(&key, &diff);
            return Ok(true);
        }
    }

    // Key locks

    /// Acquire the distributed lock for `key`. Returns `Ok(false)` when the
    /// lock could not be obtained within the constraints (`if_acquireable`,
    /// `if_exists`, or the timeout); transport failures are errors.
    pub fn lock(&self, key: &K, options: LockOptions, timeout_millis: i64) -> ContextResult<bool> {
        let _permit = self.inner.barrier.acquire_use(TimeBudget::unbounded())?;
        let host = self.lock_host();
        match self.inner.locks.acquire(
            key,
            options,
            TimeBudget::from_millis(timeout_millis),
            &host,
        ) {
            Ok(()) => Ok(true),
            Err(LockError::NotAcquireable | LockError::KeyAbsent | LockError::Timeout) => Ok(false),
            Err(LockError::Send(err)) => Err(err.into()),
            Err(LockError::Rejected { reason }) => Err(SendError::Remote {
                peer: "main".to_string(),
                message: reason,
            }
            .into()),
        }
    }

    /// Release the distributed lock for `key`. Returns whether this node
    /// held it.
    pub fn unlock(&self, key: &K) -> ContextResult<bool> {
        let _permit = self.inner.barrier.acquire_use(TimeBudget::unbounded())?;
        let host = self.lock_host();
        Ok(self
            .inner
            .locks
            .release(key, &self.inner.bus.local_id(), false, &host))
    }

    pub fn lock_owner(&self, key: &K) -> Option<MemberId> {
        self.inner.locks.owner_of(key)
    }

    // Persistence

    /// Push the full replica to the persistence collaborator. Subject to
    /// `save_on_main_only`.
    pub fn save(&self) -> ContextResult<()> {
        let Some(persistence) = &self.inner.persistence else {
            return Err(ContextError::unsupported(
                "save",
                "no persistence collaborator",
            ));
        };
        if self.inner.config.save_on_main_only && !self.is_main() {
            debug!("save skipped, this node is not main");
            return Ok(());
        }
        let entries = {
            let _permit = self.inner.barrier.acquire_use(TimeBudget::unbounded())?;
            self.inner.store.entries()
        };
        persistence
            .save_all(&entries)
            .map_err(|err| ContextError::Persistence { reason: err.reason })
    }

    /// Load every persisted entry into the local store. Local only; loading
    /// never broadcasts.
    pub fn load(&self) -> ContextResult<()> {
        let Some(persistence) = &self.inner.persistence else {
            return Err(ContextError::unsupported(
                "load",
                "no persistence collaborator",
            ));
        };
        let entries = persistence
            .load_all()
            .map_err(|err| ContextError::Persistence { reason: err.reason })?;
        let _permit = self.inner.barrier.acquire_use(TimeBudget::unbounded())?;
        debug!("loaded {} persisted entries", entries.len());
        for (key, value) in entries {
            self.inner.store.put(key.clone(), value.clone());
            self.index_put(&key, &value);
        }
        Ok(())
    }

    /// React to the cache adapter evicting `key`: the key is simply no
    /// longer resident and will be reloaded or demand-fetched on next read.
    pub fn on_evicted(&self, key: &K) {
        debug!("entry {key:?} evicted by the cache adapter");
        self.index_removed(key);
    }

    // Membership

    /// Apply a membership transition: install the new view, re-elect Main,
    /// release locks of departed members (as Main), and announce/handle the
    /// Main role change.
    pub fn on_membership_changed(&self, change: MembershipChange) {
        let local = self.inner.bus.local_id();
        {
            let Ok(mut view) = self.inner.view.write() else {
                panic!("cluster view poisoned");
            };
            *view = ClusterView::new(change.new.clone(), local.clone());
        }
        let previous_main = self.inner.current_main();
        let new_main = self.elect();
        {
            let Ok(mut main) = self.inner.current_main.write() else {
                panic!("main record poisoned");
            };
            *main = new_main.clone();
        }
        if new_main != previous_main {
            info!("main transition {previous_main:?} -> {new_main:?}");
        }

        if self.is_main() {
            let host = self.lock_host();
            for departed in change.departed() {
                self.inner.locks.release_all_owned_by(departed, &host);
            }
        }

        let was_main = previous_main.as_ref() == Some(&local);
        let now_main = new_main.as_ref() == Some(&local);
        if now_main && !was_main {
            info!("{local} took over as main");
            self.announce_mode_change(&local);
            self.inner.listeners.on_change_main(true);
            if let Err(err) = self.synchronize_peers() {
                warn!("peer synchronize after main takeover failed: {err}");
            }
        } else if was_main && !now_main {
            self.inner.listeners.on_change_main(false);
        }
    }

    /// Re-derive the Main record from the current view and live routes,
    /// without announcements. Used at startup.
    pub fn refresh_main(&self) {
        let new_main = self.elect();
        let Ok(mut main) = self.inner.current_main.write() else {
            panic!("main record poisoned");
        };
        *main = new_main;
    }

    fn elect(&self) -> Option<MemberId> {
        let view = {
            let Ok(view) = self.inner.view.read() else {
                panic!("cluster view poisoned");
            };
            view.clone()
        };
        let mut live: HashSet<MemberId> = self.inner.bus.receivers(&self.inner.topic);
        // The receiver set excludes this node; a server-role node is a live
        // candidate for itself.
        if !self.inner.config.client_role {
            live.insert(self.inner.bus.local_id());
        }
        view.elect_main(&self.inner.config.excluded_main_ids, &live)
    }

    fn announce_mode_change(&self, main: &MemberId) {
        let event = ContextEvent::ModeChange { main: main.clone() };
        if let Err(err) = self.inner.bus.send(&self.inner.topic, None, event.clone()) {
            debug!("mode change announcement not delivered: {err}");
        }
        if let Err(err) = self.inner.bus.send(&self.inner.client_topic, None, event) {
            debug!("mode change announcement to clients not delivered: {err}");
        }
    }

    // Plumbing shared with the sync and event-handling impls.

    pub(crate) fn lock_host(&self) -> SharedLockHost<K> {
        Arc::new(BusLockHost {
            inner: self.inner.clone(),
        })
    }

    pub(crate) fn index_put(&self, key: &K, value: &V) {
        if let Some(index) = &self.inner.index {
            index.entry_put(key, value);
        }
    }

    pub(crate) fn index_removed(&self, key: &K) {
        if let Some(index) = &self.inner.index {
            index.entry_removed(key);
        }
    }

    pub(crate) fn broadcast(
        &self,
        event: ContextEvent<K, V>,
        routing: Option<u64>,
        propagation: Propagation,
    ) -> ContextResult<()> {
        match propagation {
            Propagation::LocalOnly => return Ok(()),
            Propagation::FireAndForget => {
                if let Err(err) = self.inner.bus.send(&self.inner.topic, routing, event.clone()) {
                    match err {
                        SendError::NoRoute { .. } => trace!("no peers for {}", event.kind()),
                        err => return Err(err.into()),
                    }
                }
            }
            Propagation::Request => {
                let expected = self.inner.bus.receivers(&self.inner.topic).len();
                if expected > 0 {
                    let budget = TimeBudget::bounded(self.inner.config.request_timeout);
                    let replies = self.inner.bus.request(
                        &self.inner.topic,
                        routing,
                        event.clone(),
                        expected,
                        budget,
                    )?;
                    self.check_replies(&replies, expected, event.kind())?;
                }
            }
        }
        // Mutations additionally travel on the client sub-topic so resident
        // client entries stay fresh; clients never acknowledge.
        if event.is_mutation() {
            if let Err(err) = self.inner.bus.send(&self.inner.client_topic, routing, event) {
                trace!("client sub-topic delivery skipped: {err}");
            }
        }
        Ok(())
    }

    pub(crate) fn check_replies(
        &self,
        replies: &[EventReply<K, V>],
        expected: usize,
        what: &'static str,
    ) -> ContextResult<()> {
        for reply in replies {
            if let EventReply::Error(message) = reply {
                return Err(SendError::Remote {
                    peer: "peer".to_string(),
                    message: message.clone(),
                }
                .into());
            }
        }
        if replies.len() < expected && !self.inner.config.accept_partial_replies {
            warn!("{what} gathered {} of {expected} replies", replies.len());
            return Err(ContextError::timeout("broadcast acknowledgements"));
        }
        Ok(())
    }

    /// Single-flight demand fill for a client-role miss.
    pub(crate) fn demand_fetch(&self, key: &K) -> ContextResult<Option<V>> {
        match self.inner.gate.enter(key) {
            GateEntry::Follower(slot) => {
                slot.await_result(TimeBudget::bounded(self.inner.config.request_timeout))
            }
            GateEntry::Leader => {
                let fetched = self.remote_get(key);
                // The store install happens while the gate is still open, so
                // a concurrent mutation either lands in the gate's buffer or
                // reaches the store after the fetched value.
                match self.inner.barrier.acquire_use(TimeBudget::unbounded()) {
                    Ok(_permit) => self.inner.gate.resolve(key, fetched, |value| match value {
                        Some(value) => {
                            self.inner.store.put(key.clone(), value.clone());
                            self.index_put(key, value);
                        }
                        None => {
                            if self.inner.store.remove(key).is_some() {
                                self.index_removed(key);
                            }
                        }
                    }),
                    Err(err) => self.inner.gate.resolve(key, Err(err), |_| {}),
                }
            }
        }
    }

    /// Fetch the authoritative value for `key` from Main.
    pub(crate) fn remote_get(&self, key: &K) -> ContextResult<Option<V>> {
        let budget = TimeBudget::bounded(self.inner.config.request_timeout);
        let replies = self.inner.bus.request(
            &self.inner.topic,
            Some(routing_of(key)),
            ContextEvent::Get { key: key.clone() },
            1,
            budget,
        )?;
        match replies.into_iter().next() {
            Some(EventReply::Value(value)) => Ok(value),
            Some(EventReply::Error(message)) => Err(SendError::Remote {
                peer: "main".to_string(),
                message,
            }
            .into()),
            Some(_) => Err(SendError::Delivery {
                topic: self.inner.topic.as_str().to_string(),
                reason: "unexpected reply to get".to_string(),
            }
            .into()),
            None => Err(ContextError::timeout("remote get")),
        }
    }
}

fn diff_error(err: DiffError) -> ContextError {
    match err {
        DiffError::Unsupported => ContextError::unsupported(
            "update",
            "value type does not support differential updates",
        ),
        DiffError::MalformedProperty { .. } => {
            ContextError::unsupported("update", "diff property could not be decoded")
        }
    }
}

/// The lock manager's window into this context: role, residency, and the
/// grant/release/forward traffic on the bus.
struct BusLockHost<K, V, B> {
    inner: Arc<ContextInner<K, V, B>>,
}

impl<K: ContextKey, V: ContextValue, B: MessageBus<K, V>> LockHost<K> for BusLockHost<K, V, B> {
    fn is_main(&self) -> bool {
        self.inner.is_main()
    }

    fn local_id(&self) -> MemberId {
        self.inner.bus.local_id()
    }

    fn key_is_resident(&self, key: &K) -> bool {
        self.inner.store.get(key).is_some()
    }

    fn broadcast_grant(
        &self,
        key: &K,
        owner: &MemberId,
        budget: TimeBudget,
    ) -> Result<(), LockError> {
        let expected = self.inner.bus.receivers(&self.inner.topic).len();
        if expected == 0 {
            return Ok(());
        }
        let attempt =
            TimeBudget::bounded(budget.remaining_capped(self.inner.config.request_timeout));
        let replies = self.inner.bus.request(
            &self.inner.topic,
            Some(routing_of(key)),
            ContextEvent::LockGranted {
                key: key.clone(),
                owner: owner.clone(),
            },
            expected,
            attempt,
        )?;
        for reply in &replies {
            if let EventReply::Error(message) = reply {
                return Err(LockError::Send(SendError::Remote {
                    peer: "peer".to_string(),
                    message: message.clone(),
                }));
            }
        }
        // Grant acknowledgements are always strict.
        if replies.len() < expected {
            return Err(LockError::Timeout);
        }
        Ok(())
    }

    fn notify_release(&self, key: &K, owner: &MemberId, force: bool) {
        let event = ContextEvent::LockRelease {
            key: key.clone(),
            owner: owner.clone(),
            force,
        };
        if let Err(err) = self
            .inner
            .bus
            .send(&self.inner.topic, Some(routing_of(key)), event)
        {
            debug!("lock release notice for {key:?} not delivered: {err}");
        }
    }

    fn forward_to_main(
        &self,
        key: &K,
        thread_token: u64,
        options: LockOptions,
        budget: TimeBudget,
    ) -> Result<(), LockError> {
        let event = ContextEvent::LockRequest {
            key: key.clone(),
            owner: self.inner.bus.local_id(),
            thread_token,
            options,
            // Clamped to 1ms: a zero remainder would wait indefinitely at
            // the authority instead of expiring.
            timeout_millis: budget
                .remaining()
                .map_or(-1, |remaining| (remaining.as_millis() as i64).max(1)),
        };
        let attempt =
            TimeBudget::bounded(budget.remaining_capped(self.inner.config.request_timeout));
        let replies = self.inner.bus.request(
            &self.inner.topic,
            Some(routing_of(key)),
            event,
            1,
            attempt,
        )?;
        match replies.into_iter().next() {
            Some(EventReply::Ack) => Ok(()),
            Some(EventReply::Error(message)) => Err(LockError::from_reject_reason(&message)),
            Some(_) => Err(LockError::Rejected {
                reason: "unexpected reply to lock request".to_string(),
            }),
            None => Err(LockError::Timeout),
        }
    }

    fn cancel_forward(&self, key: &K, thread_token: u64) {
        let event = ContextEvent::LockCancel {
            key: key.clone(),
            owner: self.inner.bus.local_id(),
            thread_token,
        };
        if let Err(err) = self
            .inner
            .bus
            .send(&self.inner.topic, Some(routing_of(key)), event)
        {
            debug!("lock withdrawal for {key:?} not delivered: {err}");
        }
    }

    fn respond_to_waiter(&self, continuation: &ReplyContinuation, verdict: Result<(), LockError>) {
        let reply = match verdict {
            Ok(()) => EventReply::Ack,
            Err(err) => EventReply::Error(err.reject_reason()),
        };
        if let Err(err) = self
            .inner
            .bus
            .respond(&continuation.source, continuation.sequence, reply)
        {
            debug!(
                "lock verdict for {} not delivered: {err}",
                continuation.source
            );
        }
    }
}
