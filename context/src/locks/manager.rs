use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, trace, warn};
use thiserror::Error;

use concord_shared::{
    ContextKey, LockOptions, MemberId, SendError, TimeBudget, TimerHandle, TimerService,
};

// Reject reasons carried in remote error replies. Kept as stable strings so
// both sides of the wire agree without a dedicated payload type.
pub const REJECT_NOT_ACQUIREABLE: &str = "lock-not-acquireable";
pub const REJECT_KEY_ABSENT: &str = "lock-key-absent";
pub const REJECT_TIMEOUT: &str = "lock-wait-timeout";

/// Errors that can occur acquiring or releasing a key lock
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The key is owned elsewhere and `if_acquireable` was requested
    #[error("key lock is held by another owner")]
    NotAcquireable,

    /// The key is not resident and `if_exists` was requested
    #[error("key is not resident")]
    KeyAbsent,

    /// The acquisition budget ran out while queued
    #[error("timed out waiting for key lock")]
    Timeout,

    /// Main rejected the forwarded request for a reason this node does not
    /// model
    #[error("lock request rejected: {reason}")]
    Rejected { reason: String },

    #[error(transparent)]
    Send(#[from] SendError),
}

impl LockError {
    /// Reconstruct a verdict from a remote error reply's message.
    pub fn from_reject_reason(reason: &str) -> Self {
        match reason {
            REJECT_NOT_ACQUIREABLE => LockError::NotAcquireable,
            REJECT_KEY_ABSENT => LockError::KeyAbsent,
            REJECT_TIMEOUT => LockError::Timeout,
            other => LockError::Rejected {
                reason: other.to_string(),
            },
        }
    }

    /// The message to carry in an error reply for this verdict.
    pub fn reject_reason(&self) -> String {
        match self {
            LockError::NotAcquireable => REJECT_NOT_ACQUIREABLE.to_string(),
            LockError::KeyAbsent => REJECT_KEY_ABSENT.to_string(),
            LockError::Timeout => REJECT_TIMEOUT.to_string(),
            LockError::Rejected { reason } => reason.clone(),
            LockError::Send(err) => err.to_string(),
        }
    }
}

/// Identity of the thread holding or requesting a lock. Local threads compare
/// by `ThreadId`; forwarded requests carry a stable token so re-entrancy and
/// retry idempotence survive the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadRef {
    Local(std::thread::ThreadId),
    Remote(u64),
}

impl ThreadRef {
    pub fn current() -> Self {
        ThreadRef::Local(std::thread::current().id())
    }

    /// Stable per-thread token for forwarded requests.
    pub fn current_token() -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        hasher.finish()
    }
}

/// Full owner identity of a held key lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub member: MemberId,
    pub thread: ThreadRef,
}

/// Reply coordinates of a forwarded lock request parked at Main. Answered
/// through the bus once the waiter is granted or expires, so the dispatcher
/// thread that delivered the request never blocks on it.
#[derive(Debug, Clone)]
pub struct ReplyContinuation {
    pub source: MemberId,
    pub sequence: u64,
}

/// The manager's window into the owning context: role, residency, and the
/// outbound notifications lock transitions produce.
pub trait LockHost<K>: Send + Sync {
    fn is_main(&self) -> bool;

    fn local_id(&self) -> MemberId;

    fn key_is_resident(&self, key: &K) -> bool;

    /// Announce a grant to the replica set and gather their acks. Called by
    /// Main only, after local ownership is recorded.
    fn broadcast_grant(&self, key: &K, owner: &MemberId, budget: TimeBudget)
        -> Result<(), LockError>;

    /// Announce a release to the rest of the cluster. Fire-and-forget.
    fn notify_release(&self, key: &K, owner: &MemberId, force: bool);

    /// Forward an acquisition to Main and block for its verdict. The host
    /// caps each attempt with its request timeout; the manager retries with
    /// the remaining budget.
    fn forward_to_main(
        &self,
        key: &K,
        thread_token: u64,
        options: LockOptions,
        budget: TimeBudget,
    ) -> Result<(), LockError>;

    /// Withdraw a forwarded acquisition whose requester gave up waiting.
    /// Fire-and-forget.
    fn cancel_forward(&self, key: &K, thread_token: u64);

    /// Answer a parked forwarded request.
    fn respond_to_waiter(&self, continuation: &ReplyContinuation, verdict: Result<(), LockError>);
}

pub type SharedLockHost<K> = Arc<dyn LockHost<K>>;

enum WaiterKind {
    Local(Arc<WaiterSlot>),
    Remote(ReplyContinuation),
}

struct Waiter {
    id: u64,
    owner: LockOwner,
    kind: WaiterKind,
    expiry: Option<TimerHandle>,
}

/// Parking slot a local waiter blocks on until granted or expired.
struct WaiterSlot {
    state: Mutex<WaiterVerdict>,
    cond: Condvar,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WaiterVerdict {
    Pending,
    Granted,
    Expired,
}

impl WaiterSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(WaiterVerdict::Pending),
            cond: Condvar::new(),
        }
    }

    fn settle(&self, verdict: WaiterVerdict) {
        let Ok(mut state) = self.state.lock() else {
            panic!("waiter slot poisoned");
        };
        if *state == WaiterVerdict::Pending {
            *state = verdict;
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Block until settled. Bounded waits are settled by the expiry timer, so
    /// no deadline bookkeeping is needed here.
    fn wait(&self) -> Result<(), LockError> {
        let Ok(mut state) = self.state.lock() else {
            panic!("waiter slot poisoned");
        };
        loop {
            match *state {
                WaiterVerdict::Granted => return Ok(()),
                WaiterVerdict::Expired => return Err(LockError::Timeout),
                WaiterVerdict::Pending => {
                    state = match self.cond.wait(state) {
                        Ok(guard) => guard,
                        Err(_) => panic!("waiter slot poisoned"),
                    };
                }
            }
        }
    }
}

struct KeyLock {
    owner: Option<LockOwner>,
    waiters: VecDeque<Waiter>,
}

impl KeyLock {
    fn new() -> Self {
        Self {
            owner: None,
            waiters: VecDeque::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.owner.is_none() && self.waiters.is_empty()
    }
}

struct LockTable<K> {
    locks: HashMap<K, KeyLock>,
    // Reverse index member -> keys, for departed-member cleanup.
    owned: HashMap<MemberId, HashSet<K>>,
    next_waiter_id: u64,
}

enum ClaimOutcome {
    Claimed,
    AlreadyOwner,
    Rejected(LockError),
    Parked(Option<Arc<WaiterSlot>>),
}

/// Per-key lock table with FIFO waiters.
///
/// On Main this is the cluster's authoritative table: local threads block
/// here, forwarded requests park here as reply continuations, and grants are
/// broadcast before the acquirer proceeds. On every other node it is a
/// replica record maintained from grant/release announcements, so a failover
/// inherits the cluster's lock state.
pub struct KeyLockManager<K> {
    table: Mutex<LockTable<K>>,
    timers: Arc<TimerService>,
}

impl<K: ContextKey> KeyLockManager<K> {
    pub fn new(timers: Arc<TimerService>) -> Self {
        Self {
            table: Mutex::new(LockTable {
                locks: HashMap::new(),
                owned: HashMap::new(),
                next_waiter_id: 0,
            }),
            timers,
        }
    }

    fn lock_table(&self) -> MutexGuard<'_, LockTable<K>> {
        let Ok(table) = self.table.lock() else {
            panic!("lock table poisoned");
        };
        table
    }

    /// Acquire `key` for the calling thread, blocking within `budget`.
    pub fn acquire(
        self: &Arc<Self>,
        key: &K,
        options: LockOptions,
        budget: TimeBudget,
        host: &SharedLockHost<K>,
    ) -> Result<(), LockError> {
        if options.if_exists && !host.key_is_resident(key) {
            return Err(LockError::KeyAbsent);
        }
        let owner = LockOwner {
            member: host.local_id(),
            thread: ThreadRef::current(),
        };
        if self.owner_matches(key, &owner) {
            trace!("re-entrant lock on {key:?}");
            return Ok(());
        }
        if host.is_main() {
            self.acquire_as_main(key, owner, options, budget, host)
        } else {
            self.acquire_via_main(key, owner, options, budget, host)
        }
    }

    fn owner_matches(&self, key: &K, owner: &LockOwner) -> bool {
        let table = self.lock_table();
        table
            .locks
            .get(key)
            .and_then(|lock| lock.owner.as_ref())
            .is_some_and(|current| current == owner)
    }

    fn acquire_as_main(
        self: &Arc<Self>,
        key: &K,
        owner: LockOwner,
        options: LockOptions,
        budget: TimeBudget,
        host: &SharedLockHost<K>,
    ) -> Result<(), LockError> {
        match self.claim_or_park(key, owner.clone(), options, budget, None, host) {
            ClaimOutcome::Claimed => self.finish_grant(key, &owner.member, budget, host),
            ClaimOutcome::AlreadyOwner => Ok(()),
            ClaimOutcome::Rejected(err) => Err(err),
            ClaimOutcome::Parked(slot) => {
                let slot = slot.expect("local park without slot");
                slot.wait()?;
                // Ownership was transferred by the releaser; announce it.
                self.finish_grant(key, &owner.member, budget, host)
            }
        }
    }

    fn acquire_via_main(
        self: &Arc<Self>,
        key: &K,
        owner: LockOwner,
        options: LockOptions,
        budget: TimeBudget,
        host: &SharedLockHost<K>,
    ) -> Result<(), LockError> {
        let token = ThreadRef::current_token();
        loop {
            match host.forward_to_main(key, token, options, budget) {
                Ok(()) => {
                    // The grant announcement may have raced ahead of this
                    // reply; recording twice is harmless.
                    self.record_owner(key, owner);
                    return Ok(());
                }
                // Transport timeouts are retried with the remaining budget;
                // the per-thread token keeps retries idempotent at Main.
                Err(LockError::Timeout) if !budget.expired() => {
                    debug!("lock forward for {key:?} timed out, retrying");
                }
                Err(err) => {
                    // A parked forward can outlive this deadline at Main,
                    // where its later grant would leak to a thread that has
                    // already unwound. Withdraw it.
                    if err == LockError::Timeout {
                        host.cancel_forward(key, token);
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Handle a forwarded acquisition at Main. Never blocks: an un-grantable
    /// request parks as a waiter carrying its reply coordinates, and the
    /// reply is sent when a release grants it or its budget expires.
    pub fn acquire_remote(
        self: &Arc<Self>,
        key: &K,
        requester: MemberId,
        thread_token: u64,
        options: LockOptions,
        timeout_millis: i64,
        continuation: ReplyContinuation,
        host: &SharedLockHost<K>,
    ) {
        if options.if_exists && !host.key_is_resident(key) {
            host.respond_to_waiter(&continuation, Err(LockError::KeyAbsent));
            return;
        }
        let owner = LockOwner {
            member: requester,
            thread: ThreadRef::Remote(thread_token),
        };
        let budget = TimeBudget::from_millis(timeout_millis);
        let outcome = self.claim_or_park(
            key,
            owner.clone(),
            options,
            budget,
            Some(continuation.clone()),
            host,
        );
        match outcome {
            ClaimOutcome::Claimed => {
                let verdict = self.finish_grant(key, &owner.member, budget, host);
                host.respond_to_waiter(&continuation, verdict);
            }
            ClaimOutcome::AlreadyOwner => {
                host.respond_to_waiter(&continuation, Ok(()));
            }
            ClaimOutcome::Rejected(err) => {
                host.respond_to_waiter(&continuation, Err(err));
            }
            // Parked; the release or expiry path answers the continuation.
            ClaimOutcome::Parked(_) => {}
        }
    }

    /// Withdraw a forwarded request whose requester timed out. Removes the
    /// parked waiter; if the grant outraced the withdrawal, the lock is
    /// released so no phantom owner remains.
    pub fn cancel_remote(
        self: &Arc<Self>,
        key: &K,
        requester: &MemberId,
        thread_token: u64,
        host: &SharedLockHost<K>,
    ) {
        let owner = LockOwner {
            member: requester.clone(),
            thread: ThreadRef::Remote(thread_token),
        };
        let granted_meanwhile = {
            let mut table = self.lock_table();
            let Some(lock) = table.locks.get_mut(key) else {
                return;
            };
            if let Some(position) = lock.waiters.iter().position(|w| w.owner == owner) {
                let waiter = lock.waiters.remove(position).expect("positioned waiter");
                if let Some(expiry) = waiter.expiry {
                    expiry.cancel();
                }
                if lock.is_idle() {
                    table.locks.remove(key);
                }
                debug!("parked lock request for {key:?} by {requester} withdrawn");
                false
            } else {
                lock.owner.as_ref() == Some(&owner)
            }
        };
        if granted_meanwhile {
            debug!("grant of {key:?} outraced {requester}, releasing");
            self.release(key, requester, false, host);
        }
    }

    fn claim_or_park(
        self: &Arc<Self>,
        key: &K,
        owner: LockOwner,
        options: LockOptions,
        budget: TimeBudget,
        continuation: Option<ReplyContinuation>,
        host: &SharedLockHost<K>,
    ) -> ClaimOutcome {
        let mut table = self.lock_table();
        let table = &mut *table;
        let lock = table.locks.entry(key.clone()).or_insert_with(KeyLock::new);
        match &lock.owner {
            None => {
                lock.owner = Some(owner.clone());
                table
                    .owned
                    .entry(owner.member)
                    .or_default()
                    .insert(key.clone());
                ClaimOutcome::Claimed
            }
            Some(current) if *current == owner => ClaimOutcome::AlreadyOwner,
            Some(_) if options.if_acquireable => ClaimOutcome::Rejected(LockError::NotAcquireable),
            Some(_) => {
                // A retried forward supersedes its earlier parked waiter:
                // same queue position, fresh continuation and expiry.
                if let Some(continuation) = &continuation {
                    if let Some(existing) =
                        lock.waiters.iter_mut().find(|waiter| waiter.owner == owner)
                    {
                        existing.kind = WaiterKind::Remote(continuation.clone());
                        if let Some(expiry) = existing.expiry.take() {
                            expiry.cancel();
                        }
                        let id = existing.id;
                        existing.expiry = budget
                            .remaining()
                            .map(|delay| self.schedule_expiry(key.clone(), id, delay, host.clone()));
                        return ClaimOutcome::Parked(None);
                    }
                }
                let id = table.next_waiter_id;
                table.next_waiter_id += 1;
                let (kind, slot) = match continuation {
                    Some(continuation) => (WaiterKind::Remote(continuation), None),
                    None => {
                        let slot = Arc::new(WaiterSlot::new());
                        (WaiterKind::Local(slot.clone()), Some(slot))
                    }
                };
                let expiry = budget
                    .remaining()
                    .map(|delay| self.schedule_expiry(key.clone(), id, delay, host.clone()));
                lock.waiters.push_back(Waiter {
                    id,
                    owner,
                    kind,
                    expiry,
                });
                trace!("lock waiter {id} parked on {key:?}");
                ClaimOutcome::Parked(slot)
            }
        }
    }

    /// Announce a fresh grant to the replica set; on failure the grant is
    /// rolled back so the lock does not leak.
    fn finish_grant(
        self: &Arc<Self>,
        key: &K,
        member: &MemberId,
        budget: TimeBudget,
        host: &SharedLockHost<K>,
    ) -> Result<(), LockError> {
        match host.broadcast_grant(key, member, budget) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("grant broadcast for {key:?} failed, rolling back: {err}");
                self.release(key, member, true, host);
                Err(err)
            }
        }
    }

    fn schedule_expiry(
        self: &Arc<Self>,
        key: K,
        waiter_id: u64,
        delay: Duration,
        host: SharedLockHost<K>,
    ) -> TimerHandle {
        let manager = self.clone();
        self.timers
            .schedule(delay, move || manager.expire_waiter(&key, waiter_id, &host))
    }

    /// Timer callback for a waiter's deadline. Idempotent with a grant: if
    /// the waiter already left the queue, this is a no-op.
    fn expire_waiter(&self, key: &K, waiter_id: u64, host: &SharedLockHost<K>) {
        let expired = {
            let mut table = self.lock_table();
            let Some(lock) = table.locks.get_mut(key) else {
                return;
            };
            let Some(position) = lock.waiters.iter().position(|w| w.id == waiter_id) else {
                return;
            };
            let waiter = lock.waiters.remove(position).expect("positioned waiter");
            if lock.is_idle() {
                table.locks.remove(key);
            }
            waiter
        };
        debug!("lock waiter {waiter_id} on {key:?} expired");
        match expired.kind {
            WaiterKind::Local(slot) => slot.settle(WaiterVerdict::Expired),
            WaiterKind::Remote(continuation) => {
                host.respond_to_waiter(&continuation, Err(LockError::Timeout));
            }
        }
    }

    /// Release `key` held by `releaser`, granting the next waiter in FIFO
    /// order. Returns whether a held lock was actually released. `force`
    /// overrides the ownership check (departed members, rollback paths).
    pub fn release(
        self: &Arc<Self>,
        key: &K,
        releaser: &MemberId,
        force: bool,
        host: &SharedLockHost<K>,
    ) -> bool {
        self.release_inner(key, releaser, force, true, host)
    }

    /// Apply a release announced by the owner node: same transfer semantics
    /// as [release](Self::release) but without re-announcing it.
    pub fn apply_release_event(
        self: &Arc<Self>,
        key: &K,
        releaser: &MemberId,
        force: bool,
        host: &SharedLockHost<K>,
    ) -> bool {
        self.release_inner(key, releaser, force, false, host)
    }

    fn release_inner(
        self: &Arc<Self>,
        key: &K,
        releaser: &MemberId,
        force: bool,
        notify: bool,
        host: &SharedLockHost<K>,
    ) -> bool {
        let granted = {
            let mut table = self.lock_table();
            let table = &mut *table;
            let Some(lock) = table.locks.get_mut(key) else {
                return false;
            };
            let Some(owner) = &lock.owner else {
                return false;
            };
            if owner.member != *releaser && !force {
                warn!(
                    "release of {key:?} by {releaser} denied, held by {}",
                    owner.member
                );
                return false;
            }
            let previous = owner.member.clone();
            lock.owner = None;
            if let Some(keys) = table.owned.get_mut(&previous) {
                keys.remove(key);
                if keys.is_empty() {
                    table.owned.remove(&previous);
                }
            }
            // Ownership transfers directly to the next waiter, so no third
            // party can barge in between release and grant.
            let granted = lock.waiters.pop_front().map(|waiter| {
                if let Some(expiry) = &waiter.expiry {
                    expiry.cancel();
                }
                lock.owner = Some(waiter.owner.clone());
                table
                    .owned
                    .entry(waiter.owner.member.clone())
                    .or_default()
                    .insert(key.clone());
                waiter
            });
            if lock.is_idle() {
                table.locks.remove(key);
            }
            granted
        };
        if notify {
            host.notify_release(key, releaser, force);
        }
        if let Some(waiter) = granted {
            trace!("lock on {key:?} transferred to waiter {}", waiter.id);
            match waiter.kind {
                // The woken thread announces its own grant.
                WaiterKind::Local(slot) => slot.settle(WaiterVerdict::Granted),
                WaiterKind::Remote(continuation) => {
                    // The waiter's budget lived in its now-cancelled expiry
                    // timer; the host caps the announcement on its own.
                    let verdict =
                        self.finish_grant(key, &waiter.owner.member, TimeBudget::unbounded(), host);
                    host.respond_to_waiter(&continuation, verdict);
                }
            }
        }
        true
    }

    /// Force-release every lock held by `member`; used when a member departs
    /// the cluster. Returns how many keys were released.
    pub fn release_all_owned_by(
        self: &Arc<Self>,
        member: &MemberId,
        host: &SharedLockHost<K>,
    ) -> usize {
        let keys: Vec<K> = {
            let table = self.lock_table();
            table
                .owned
                .get(member)
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default()
        };
        for key in &keys {
            self.release(key, member, true, host);
        }
        if !keys.is_empty() {
            debug!("released {} locks held by departed {member}", keys.len());
        }
        keys.len()
    }

    fn record_owner(&self, key: &K, owner: LockOwner) {
        let mut table = self.lock_table();
        let table = &mut *table;
        let lock = table.locks.entry(key.clone()).or_insert_with(KeyLock::new);
        lock.owner = Some(owner.clone());
        table
            .owned
            .entry(owner.member)
            .or_default()
            .insert(key.clone());
    }

    /// Replica bookkeeping for a grant announced by Main. The announced
    /// thread identity is opaque here; the token is unknown off-Main.
    pub fn record_remote_grant(&self, key: &K, owner: &MemberId, local: &MemberId) {
        if owner == local {
            // Our own grant; the acquiring thread records itself.
            return;
        }
        self.record_owner(
            key,
            LockOwner {
                member: owner.clone(),
                thread: ThreadRef::Remote(0),
            },
        );
    }

    /// Replica bookkeeping for a release announced by a peer.
    pub fn apply_remote_release(&self, key: &K, owner: &MemberId, force: bool) {
        let mut table = self.lock_table();
        let table = &mut *table;
        let Some(lock) = table.locks.get_mut(key) else {
            return;
        };
        let Some(current) = &lock.owner else {
            return;
        };
        if current.member != *owner && !force {
            return;
        }
        let previous = current.member.clone();
        lock.owner = None;
        if let Some(keys) = table.owned.get_mut(&previous) {
            keys.remove(key);
            if keys.is_empty() {
                table.owned.remove(&previous);
            }
        }
        if lock.is_idle() {
            table.locks.remove(key);
        }
    }

    pub fn owner_of(&self, key: &K) -> Option<MemberId> {
        let table = self.lock_table();
        table
            .locks
            .get(key)
            .and_then(|lock| lock.owner.as_ref())
            .map(|owner| owner.member.clone())
    }

    pub fn is_locked(&self, key: &K) -> bool {
        self.owner_of(key).is_some()
    }
}
