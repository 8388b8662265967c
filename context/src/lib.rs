//! # Concord Context
//! The replication core: a cluster-aware shared key-value map with
//! distributed per-key locking, differential updates, and full or per-key
//! resynchronization against an elected Main node.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod barrier;
mod collaborators;
mod config;
mod fetch_gate;
mod handler;
mod listeners;
mod locks;
mod replicated_context;
mod sync;

pub use barrier::{BarrierLockGuard, UseLockBarrier, UsePermit};
pub use collaborators::{
    CacheAdapter, EntryFilter, KeyIndex, LocalStore, Persistence, PersistenceError,
};
pub use config::ContextConfig;
pub use fetch_gate::{BufferedMutation, ClientFetchGate, FetchGateSlot, GateEntry};
pub use listeners::{ListenerRegistry, UpdateListener};
pub use locks::{
    KeyLockManager, LockError, LockHost, LockOwner, ReplyContinuation, SharedLockHost, ThreadRef,
};
pub use replicated_context::{ContextBuilder, ReplicatedContext};
