//! Per-key distributed mutex: local ownership, FIFO waiter queue, timer-backed
//! timeout cancellation, and cross-node propagation through the owning
//! context.

mod manager;

pub use manager::{
    KeyLockManager, LockError, LockHost, LockOwner, ReplyContinuation, SharedLockHost, ThreadRef,
};
