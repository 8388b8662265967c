use log::{debug, error, info, trace, warn};

use concord_shared::{
    ContextEvent, ContextError, ContextKey, ContextValue, DiffOutcome, EventEnvelope, EventReply,
    EventSink, MessageBus, TimeBudget, UpdateVersion, ValueDiff,
};

use crate::fetch_gate::BufferedMutation;
use crate::locks::ReplyContinuation;
use crate::replicated_context::ReplicatedContext;

/// Reject reason Main answers with when an update's diff was computed
/// against a base version it has already superseded. Stable across the wire;
/// the originator reacts by resyncing the key and re-diffing.
pub(crate) const REJECT_STALE_UPDATE: &str = "update-stale-base";

/// What handling an inbound event produced. Server-side mutation handling
/// always yields a reply so synchronous broadcasts can count
/// acknowledgements; `Ignored` is reserved for events this node does not
/// answer (client-role drops, non-Main requests).
enum Outcome<K, V> {
    Ignored,
    Reply(EventReply<K, V>),
}

fn ack<K, V>() -> Outcome<K, V> {
    Outcome::Reply(EventReply::Ack)
}

fn fail<K, V>(message: impl Into<String>) -> Outcome<K, V> {
    Outcome::Reply(EventReply::Error(message.into()))
}

/// Inbound event dispatch: the receiving half of the replication protocol.
impl<K: ContextKey, V: ContextValue, B: MessageBus<K, V> + 'static> ReplicatedContext<K, V, B> {
    fn dispatch(&self, envelope: EventEnvelope<K, V>) -> Outcome<K, V> {
        let source = envelope.source;
        let sequence = envelope.sequence;
        match envelope.event {
            ContextEvent::Put { key, value } => self.apply_remote_put(key, value),
            ContextEvent::PutAll { entries } => self.apply_remote_put_all(entries),
            ContextEvent::Remove { key } => self.apply_remote_remove(key),
            ContextEvent::Clear => self.apply_remote_clear(),
            ContextEvent::Update {
                key,
                diff,
                if_exists,
            } => self.apply_remote_update(key, diff, if_exists),
            ContextEvent::Get { key } => {
                // Only the authority answers reads.
                if !self.is_main() {
                    return Outcome::Ignored;
                }
                Outcome::Reply(EventReply::Value(self.inner.store.get(&key)))
            }
            ContextEvent::LockRequest {
                key,
                owner,
                thread_token,
                options,
                timeout_millis,
            } => {
                if !self.is_main() {
                    return Outcome::Ignored;
                }
                let host = self.lock_host();
                // Answers through the continuation, possibly much later;
                // never blocks this dispatcher.
                self.inner.locks.acquire_remote(
                    &key,
                    owner,
                    thread_token,
                    options,
                    timeout_millis,
                    ReplyContinuation { source, sequence },
                    &host,
                );
                Outcome::Ignored
            }
            ContextEvent::LockCancel {
                key,
                owner,
                thread_token,
            } => {
                if self.is_main() {
                    let host = self.lock_host();
                    self.inner
                        .locks
                        .cancel_remote(&key, &owner, thread_token, &host);
                }
                Outcome::Ignored
            }
            ContextEvent::LockGranted { key, owner } => {
                self.inner
                    .locks
                    .record_remote_grant(&key, &owner, &self.local_id());
                ack()
            }
            ContextEvent::LockRelease { key, owner, force } => {
                if self.is_main() {
                    let host = self.lock_host();
                    self.inner
                        .locks
                        .apply_release_event(&key, &owner, force, &host);
                } else {
                    self.inner.locks.apply_remote_release(&key, &owner, force);
                }
                Outcome::Ignored
            }
            ContextEvent::Synchronize => match self.pull_snapshot_commanded() {
                Ok(()) => ack(),
                Err(err) => {
                    warn!("commanded synchronize failed: {err}");
                    fail(err.to_string())
                }
            },
            ContextEvent::SnapshotRequest => {
                if !self.is_main() {
                    return Outcome::Ignored;
                }
                // The requester holds our barrier phase; the store is frozen,
                // so this read needs no permit of its own.
                Outcome::Reply(EventReply::Snapshot(self.inner.store.entries()))
            }
            ContextEvent::AcquireUpdateLock { holder } => {
                let budget = TimeBudget::bounded(self.inner.config.update_lock_timeout);
                match self.inner.barrier.acquire_lock(holder, budget) {
                    Ok(guard) => {
                        // Held until the matching release event arrives.
                        let holder = guard.detach();
                        trace!("holding update lock phase for {holder}");
                        ack()
                    }
                    Err(err) => fail(err.to_string()),
                }
            }
            ContextEvent::ReleaseUpdateLock { holder } => {
                self.inner.barrier.release_lock(&holder);
                Outcome::Ignored
            }
            ContextEvent::ModeChange { main } => {
                let local = self.local_id();
                let previous = self.inner.current_main();
                {
                    let Ok(mut current) = self.inner.current_main.write() else {
                        panic!("main record poisoned");
                    };
                    *current = Some(main.clone());
                }
                if previous.as_ref() != Some(&main) {
                    info!("main announced: {main}");
                }
                let was_main = previous.as_ref() == Some(&local);
                let now_main = main == local;
                if was_main != now_main {
                    self.inner.listeners.on_change_main(now_main);
                }
                ack()
            }
        }
    }

    fn apply_remote_put(&self, key: K, value: V) -> Outcome<K, V> {
        if self.inner.config.client_role {
            if self
                .inner
                .gate
                .buffer(&key, BufferedMutation::Put(value.clone()))
            {
                return Outcome::Ignored;
            }
            return self.apply_resident_put(key, value);
        }
        self.apply_put_unconditional(key, value)
    }

    fn apply_resident_put(&self, key: K, value: V) -> Outcome<K, V> {
        if self.inner.store.get(&key).is_none() {
            trace!("put for non-resident {key:?} ignored");
            return Outcome::Ignored;
        }
        self.apply_put_unconditional(key, value)
    }

    fn apply_put_unconditional(&self, key: K, value: V) -> Outcome<K, V> {
        let previous = match self.inner.barrier.acquire_use(TimeBudget::unbounded()) {
            Ok(_permit) => {
                let previous = self.inner.store.put(key.clone(), value.clone());
                self.index_put(&key, &value);
                previous
            }
            Err(err) => return fail(err.to_string()),
        };
        self.inner.listeners.after_put(&key, &value, previous.as_ref());
        ack()
    }

    fn apply_remote_put_all(&self, entries: Vec<(K, V)>) -> Outcome<K, V> {
        for (key, value) in entries {
            match self.apply_remote_put(key, value) {
                Outcome::Reply(EventReply::Error(message)) => return fail(message),
                _ => {}
            }
        }
        ack()
    }

    fn apply_remote_remove(&self, key: K) -> Outcome<K, V> {
        if self.inner.config.client_role {
            if self.inner.gate.buffer(&key, BufferedMutation::Remove) {
                return Outcome::Ignored;
            }
            if self.inner.store.get(&key).is_none() {
                return Outcome::Ignored;
            }
        }
        let previous = match self.inner.barrier.acquire_use(TimeBudget::unbounded()) {
            Ok(_permit) => {
                let previous = self.inner.store.remove(&key);
                if previous.is_some() {
                    self.index_removed(&key);
                }
                previous
            }
            Err(err) => return fail(err.to_string()),
        };
        self.inner.listeners.after_remove(&key, previous.as_ref());
        ack()
    }

    fn apply_remote_clear(&self) -> Outcome<K, V> {
        match self.inner.barrier.acquire_use(TimeBudget::unbounded()) {
            Ok(_permit) => {
                self.inner.store.clear();
                if let Some(index) = &self.inner.index {
                    index.cleared();
                }
                ack()
            }
            Err(err) => fail(err.to_string()),
        }
    }

    fn apply_remote_update(&self, key: K, diff: ValueDiff, if_exists: bool) -> Outcome<K, V> {
        if self.inner.config.client_role
            && self
                .inner
                .gate
                .buffer(&key, BufferedMutation::Update(diff.clone()))
        {
            return Outcome::Ignored;
        }
        let Some(mut base) = self.inner.store.get(&key) else {
            if self.inner.config.client_role {
                return Outcome::Ignored;
            }
            if if_exists {
                // Conditional update of an absent key is a clean no-op.
                return ack();
            }
            if self.is_main() {
                error!("diff for a key the authority does not hold: {key:?}");
                return fail(conflict_message(diff.version(), UpdateVersion::ZERO));
            }
            // This replica missed the original put.
            return self.resync_then_apply(&key, &diff);
        };

        enum Applied {
            Stored,
            Noop,
            Conflicted(UpdateVersion),
        }
        let action = match self.inner.barrier.acquire_use(TimeBudget::unbounded()) {
            Err(err) => return fail(err.to_string()),
            Ok(_permit) => match base.apply_diff(&diff) {
                Ok(DiffOutcome::Applied) => {
                    self.inner.store.put(key.clone(), base.clone());
                    self.index_put(&key, &base);
                    Applied::Stored
                }
                Ok(DiffOutcome::AlreadyCurrent) => Applied::Noop,
                Ok(DiffOutcome::Conflict) => Applied::Conflicted(base.update_version()),
                Err(err) => {
                    warn!("diff for {key:?} not applicable: {err}");
                    return fail(err.to_string());
                }
            },
        };
        match action {
            Applied::Stored => {
                self.inner.listeners.after_update(&key, &diff);
                ack()
            }
            Applied::Noop => {
                if self.is_main() {
                    // The authority never sees its own diffs again, so a
                    // non-advancing diff here means the sender diffed
                    // against a superseded base and must re-diff.
                    warn!("stale-base diff for {key:?} rejected");
                    return fail(REJECT_STALE_UPDATE);
                }
                debug!("redelivered diff for {key:?} ignored");
                ack()
            }
            // Healed outside the permit; resync takes its own.
            Applied::Conflicted(current_version) => self.heal_conflict(&key, &diff, current_version),
        }
    }

    /// A diff arrived whose version does not follow the local one: an update
    /// was missed. Replicas self-heal by resyncing the key from Main; on
    /// Main itself there is no authority to heal from.
    fn heal_conflict(
        &self,
        key: &K,
        diff: &ValueDiff,
        current_version: UpdateVersion,
    ) -> Outcome<K, V> {
        if self.is_main() {
            error!(
                "version conflict at main for {key:?}: diff {} against {current_version}",
                diff.version()
            );
            return fail(conflict_message(diff.version(), current_version));
        }
        self.resync_then_apply(key, diff)
    }

    /// Resync `key` from Main, then retry the pending diff against the
    /// authoritative value. A diff can outrun Main's own local apply, so both
    /// `Applied` and `AlreadyCurrent` are healthy outcomes here.
    fn resync_then_apply(&self, key: &K, diff: &ValueDiff) -> Outcome<K, V> {
        if let Err(err) = self.resync_key(key) {
            warn!("resync of {key:?} failed: {err}");
            return fail(err.to_string());
        }
        let Some(mut base) = self.inner.store.get(key) else {
            // Main no longer holds the key; the diff is moot.
            return ack();
        };
        let applied = match self.inner.barrier.acquire_use(TimeBudget::unbounded()) {
            Err(err) => return fail(err.to_string()),
            Ok(_permit) => match base.apply_diff(diff) {
                Ok(DiffOutcome::Applied) => {
                    self.inner.store.put(key.clone(), base.clone());
                    self.index_put(key, &base);
                    true
                }
                Ok(DiffOutcome::AlreadyCurrent) => false,
                Ok(DiffOutcome::Conflict) => {
                    error!("{key:?} still conflicted after a resync");
                    return fail(conflict_message(diff.version(), base.update_version()));
                }
                Err(err) => return fail(err.to_string()),
            },
        };
        if applied {
            self.inner.listeners.after_update(key, diff);
        }
        ack()
    }
}

fn conflict_message(diff_version: UpdateVersion, current_version: UpdateVersion) -> String {
    ContextError::UpdateConflict {
        diff_version,
        current_version,
    }
    .to_string()
}

impl<K: ContextKey, V: ContextValue, B: MessageBus<K, V> + 'static> EventSink<K, V>
    for ReplicatedContext<K, V, B>
{
    fn deliver(&self, envelope: EventEnvelope<K, V>) {
        let source = envelope.source.clone();
        let sequence = envelope.sequence;
        let wants_reply = envelope.wants_reply;
        trace!("handling {} from {source}", envelope.event.kind());
        if let Outcome::Reply(reply) = self.dispatch(envelope) {
            if wants_reply {
                if let Err(err) = self.inner.bus.respond(&source, sequence, reply) {
                    debug!("reply to {source} not delivered: {err}");
                }
            }
        }
    }
}
