use log::{debug, info, trace, warn};

use concord_shared::{
    ContextError, ContextEvent, ContextKey, ContextResult, ContextValue, EventReply, MemberId,
    MessageBus, SendError, TimeBudget,
};

use crate::replicated_context::ReplicatedContext;

/// Full and per-key resynchronization against the authoritative Main node.
impl<K: ContextKey, V: ContextValue, B: MessageBus<K, V> + 'static> ReplicatedContext<K, V, B> {
    /// Bring replicas in line. As Main this commands every reachable peer to
    /// pull a snapshot; otherwise this node pulls one itself under the
    /// cluster-wide update lock.
    pub fn synchronize(&self) -> ContextResult<()> {
        if self.is_main() {
            self.synchronize_peers()
        } else {
            self.pull_snapshot()
        }
    }

    /// Command every reachable server peer to synchronize against this node
    /// and fail if any peer reports failure.
    pub(crate) fn synchronize_peers(&self) -> ContextResult<()> {
        let expected = self.inner.bus.receivers(&self.inner.topic).len();
        if expected == 0 {
            debug!("no peers to synchronize");
            return Ok(());
        }
        info!("requesting {expected} peers to synchronize");
        let replies = self.inner.bus.request(
            &self.inner.topic,
            None,
            ContextEvent::Synchronize,
            expected,
            TimeBudget::bounded(self.inner.config.sync_timeout),
        )?;
        self.check_replies(&replies, expected, "peer synchronize")
    }

    /// Full pull: freeze mutations cluster-wide, fetch the snapshot from
    /// Main, install it atomically, and release the freeze on every exit
    /// path.
    pub(crate) fn pull_snapshot(&self) -> ContextResult<()> {
        let local = self.inner.bus.local_id();
        info!("synchronizing from main {:?}", self.current_main());
        let guard = self.inner.barrier.acquire_lock(
            local.clone(),
            TimeBudget::bounded(self.inner.config.update_lock_timeout),
        )?;
        let result = self
            .broadcast_update_lock(&local)
            .and_then(|()| self.fetch_and_install());
        // A failed acquire may still have latched on some peers; release
        // unconditionally.
        self.broadcast_update_release(&local);
        drop(guard);
        result
    }

    /// Pull commanded by Main. Main serializes these, so only the local
    /// barrier phase is taken; no cluster-wide lock round.
    pub(crate) fn pull_snapshot_commanded(&self) -> ContextResult<()> {
        let local = self.inner.bus.local_id();
        let _guard = self.inner.barrier.acquire_lock(
            local,
            TimeBudget::bounded(self.inner.config.update_lock_timeout),
        )?;
        self.fetch_and_install()
    }

    fn broadcast_update_lock(&self, holder: &MemberId) -> ContextResult<()> {
        let expected = self.inner.bus.receivers(&self.inner.topic).len();
        if expected == 0 {
            return Ok(());
        }
        let replies = self.inner.bus.request(
            &self.inner.topic,
            None,
            ContextEvent::AcquireUpdateLock {
                holder: holder.clone(),
            },
            expected,
            TimeBudget::bounded(self.inner.config.update_lock_timeout),
        )?;
        self.check_replies(&replies, expected, "cluster update lock")
    }

    fn broadcast_update_release(&self, holder: &MemberId) {
        let event = ContextEvent::ReleaseUpdateLock {
            holder: holder.clone(),
        };
        if let Err(err) = self.inner.bus.send(&self.inner.topic, None, event) {
            debug!("update lock release not delivered: {err}");
        }
    }

    fn fetch_and_install(&self) -> ContextResult<()> {
        let replies = self.inner.bus.request(
            &self.inner.topic,
            None,
            ContextEvent::SnapshotRequest,
            1,
            TimeBudget::bounded(self.inner.config.sync_timeout),
        )?;
        match replies.into_iter().next() {
            Some(EventReply::Snapshot(entries)) => {
                self.install_snapshot(entries);
                Ok(())
            }
            Some(EventReply::Error(message)) => Err(SendError::Remote {
                peer: "main".to_string(),
                message,
            }
            .into()),
            Some(_) => Err(SendError::Delivery {
                topic: self.inner.topic.as_str().to_string(),
                reason: "unexpected reply to snapshot request".to_string(),
            }
            .into()),
            None => Err(ContextError::timeout("snapshot")),
        }
    }

    /// Replace the local replica with `entries`. The caller holds the local
    /// lock phase, so no use operation observes the intermediate state.
    pub(crate) fn install_snapshot(&self, entries: Vec<(K, V)>) {
        self.inner.store.clear();
        let mut installed = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            if let Some(filter) = &self.inner.filter {
                if !filter.accept(&key, &value) {
                    trace!("snapshot entry {key:?} rejected by the filter");
                    continue;
                }
            }
            self.inner.store.put(key.clone(), value.clone());
            installed.push((key, value));
        }
        if let Some(index) = &self.inner.index {
            index.cleared();
            index.rebuild(&installed);
        }
        info!("installed snapshot with {} entries", installed.len());
        self.inner.listeners.on_clear_synchronize();
        for (key, value) in &installed {
            self.inner.listeners.on_put_synchronize(key, value);
        }
    }

    /// Heal one key from Main after a missed update: install the
    /// authoritative value, or drop the key if Main no longer holds it.
    pub(crate) fn resync_key(&self, key: &K) -> ContextResult<()> {
        warn!("resynchronizing {key:?} from main after a version conflict");
        let value = self.remote_get(key)?;
        let _permit = self.inner.barrier.acquire_use(TimeBudget::unbounded())?;
        match value {
            Some(value) => {
                self.inner.store.put(key.clone(), value.clone());
                self.index_put(key, &value);
            }
            None => {
                if self.inner.store.remove(key).is_some() {
                    self.index_removed(key);
                }
            }
        }
        Ok(())
    }
}
