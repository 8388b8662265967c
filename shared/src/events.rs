use crate::membership::MemberId;
use crate::value::ValueDiff;

/// Options accompanying a key-lock acquisition, locally and across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockOptions {
    /// Fail immediately instead of queueing when the key is already owned.
    pub if_acquireable: bool,
    /// Fail immediately without side effects when the key is not resident.
    pub if_exists: bool,
}

/// The wire payload: one event per context operation, routed by
/// `(topic, key)` so same-key operations reach each recipient in sender
/// order. Constructed per operation, never mutated after send.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextEvent<K, V> {
    Put {
        key: K,
        value: V,
    },
    PutAll {
        entries: Vec<(K, V)>,
    },
    Remove {
        key: K,
    },
    Clear,
    /// Request the current value for a single key; answered by Main with
    /// `EventReply::Value`.
    Get {
        key: K,
    },
    Update {
        key: K,
        diff: ValueDiff,
        if_exists: bool,
    },
    /// Forwarded acquire from a non-Main node. `thread_token` preserves the
    /// requesting thread's identity so re-entrancy survives the wire.
    LockRequest {
        key: K,
        owner: MemberId,
        thread_token: u64,
        options: LockOptions,
        timeout_millis: i64,
    },
    /// Withdrawal of a forwarded acquire whose requester gave up waiting.
    /// Main drops the parked waiter, or releases the lock if the grant
    /// outraced the requester's deadline.
    LockCancel {
        key: K,
        owner: MemberId,
        thread_token: u64,
    },
    /// Main announcing a granted lock to the replica set.
    LockGranted {
        key: K,
        owner: MemberId,
    },
    LockRelease {
        key: K,
        owner: MemberId,
        force: bool,
    },
    /// Command from Main: synchronize yourself against the sender.
    Synchronize,
    /// Pull the full key/value snapshot; answered by Main with
    /// `EventReply::Snapshot`.
    SnapshotRequest,
    /// Drain and hold the recipient's barrier lock phase for `holder`.
    AcquireUpdateLock {
        holder: MemberId,
    },
    ReleaseUpdateLock {
        holder: MemberId,
    },
    /// Announcement that `main` is now the authoritative node.
    ModeChange {
        main: MemberId,
    },
}

impl<K, V> ContextEvent<K, V> {
    /// Event kind tag, for logging and bus-side accounting.
    pub fn kind(&self) -> &'static str {
        match self {
            ContextEvent::Put { .. } => "put",
            ContextEvent::PutAll { .. } => "put-all",
            ContextEvent::Remove { .. } => "remove",
            ContextEvent::Clear => "clear",
            ContextEvent::Get { .. } => "get",
            ContextEvent::Update { .. } => "update",
            ContextEvent::LockRequest { .. } => "lock-request",
            ContextEvent::LockCancel { .. } => "lock-cancel",
            ContextEvent::LockGranted { .. } => "lock-granted",
            ContextEvent::LockRelease { .. } => "lock-release",
            ContextEvent::Synchronize => "synchronize",
            ContextEvent::SnapshotRequest => "snapshot-request",
            ContextEvent::AcquireUpdateLock { .. } => "get-update-lock",
            ContextEvent::ReleaseUpdateLock { .. } => "release-update-lock",
            ContextEvent::ModeChange { .. } => "mode-change",
        }
    }

    /// Whether this event mutates replica state (and therefore also travels
    /// on the client sub-topic).
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            ContextEvent::Put { .. }
                | ContextEvent::PutAll { .. }
                | ContextEvent::Remove { .. }
                | ContextEvent::Clear
                | ContextEvent::Update { .. }
        )
    }
}

/// Reply payload to a synchronous request.
///
/// Remote errors travel as a distinguished variant and are re-thrown locally
/// as a send error wrapping the original message.
#[derive(Debug, Clone, PartialEq)]
pub enum EventReply<K, V> {
    Ack,
    Value(Option<V>),
    Snapshot(Vec<(K, V)>),
    Error(String),
}
