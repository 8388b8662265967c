use std::sync::{Condvar, Mutex, MutexGuard};

use log::trace;

use concord_shared::{ContextError, ContextResult, MemberId, TimeBudget};

/// Process-local drain barrier gating ordinary "use" operations (get, put,
/// remove, iterate) against cluster-wide "lock" phases (full synchronize).
///
/// This is not a read/write lock. Multiple lock holders may coexist - a node
/// applying its own synchronize while also granting a remote one - and use
/// permits are short-lived, so a pending lock phase drains active use
/// holders without starving normal operations indefinitely. The invariant:
/// a positive use count and a non-empty lock-holder set never hold
/// simultaneously.
pub struct UseLockBarrier {
    state: Mutex<BarrierState>,
    cond: Condvar,
}

#[derive(Default)]
struct BarrierState {
    use_count: usize,
    // Vec rather than a set: the same holder id may legitimately hold two
    // overlapping lock phases, and release must pair one-for-one.
    lock_holders: Vec<MemberId>,
    lock_waiters: usize,
}

impl UseLockBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState::default()),
            cond: Condvar::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BarrierState> {
        let Ok(state) = self.state.lock() else {
            panic!("barrier state poisoned");
        };
        state
    }

    /// Acquire a use permit. Blocks while a lock phase is active or a lock
    /// acquisition is pending, so a requested lock phase always drains.
    pub fn acquire_use(&self, budget: TimeBudget) -> ContextResult<UsePermit<'_>> {
        let mut state = self.lock_state();
        while !state.lock_holders.is_empty() || state.lock_waiters > 0 {
            state = self.wait_step(state, budget, "use permit")?;
        }
        state.use_count += 1;
        Ok(UsePermit { barrier: self })
    }

    /// Register `holder` for a lock phase once every use permit drains.
    /// Multiple concurrent lock holders are permitted.
    pub fn acquire_lock(
        &self,
        holder: MemberId,
        budget: TimeBudget,
    ) -> ContextResult<BarrierLockGuard<'_>> {
        let mut state = self.lock_state();
        state.lock_waiters += 1;
        while state.use_count > 0 {
            state = match self.wait_step(state, budget, "lock phase") {
                Ok(state) => state,
                Err(err) => {
                    let mut state = self.lock_state();
                    state.lock_waiters -= 1;
                    drop(state);
                    // Use acquirers blocked on the pending request may go.
                    self.cond.notify_all();
                    return Err(err);
                }
            };
        }
        state.lock_waiters -= 1;
        state.lock_holders.push(holder.clone());
        trace!("barrier lock phase entered by {holder}");
        Ok(BarrierLockGuard {
            barrier: self,
            holder: Some(holder),
        })
    }

    /// Release one lock phase registered for `holder` without a guard; used
    /// when the phase was entered on behalf of a remote node and the release
    /// arrives as a later event.
    pub fn release_lock(&self, holder: &MemberId) {
        let mut state = self.lock_state();
        if let Some(position) = state.lock_holders.iter().position(|h| h == holder) {
            state.lock_holders.remove(position);
            trace!("barrier lock phase left by {holder}");
        }
        if state.lock_holders.is_empty() {
            drop(state);
            self.cond.notify_all();
        }
    }

    fn release_use(&self) {
        let mut state = self.lock_state();
        state.use_count -= 1;
        if state.use_count == 0 {
            drop(state);
            self.cond.notify_all();
        }
    }

    fn wait_step<'a>(
        &'a self,
        state: MutexGuard<'a, BarrierState>,
        budget: TimeBudget,
        waiting_for: &'static str,
    ) -> ContextResult<MutexGuard<'a, BarrierState>> {
        match budget.remaining() {
            None => {
                let Ok(state) = self.cond.wait(state) else {
                    panic!("barrier state poisoned");
                };
                Ok(state)
            }
            Some(remaining) if remaining.is_zero() => Err(ContextError::timeout(waiting_for)),
            Some(remaining) => {
                let Ok((state, _)) = self.cond.wait_timeout(state, remaining) else {
                    panic!("barrier state poisoned");
                };
                Ok(state)
            }
        }
    }

    #[cfg(test)]
    fn snapshot(&self) -> (usize, usize, usize) {
        let state = self.lock_state();
        (state.use_count, state.lock_holders.len(), state.lock_waiters)
    }
}

impl Default for UseLockBarrier {
    fn default() -> Self {
        Self::new()
    }
}

/// Permit for one "use"-class operation; dropping it releases the permit and
/// wakes pending lock acquirers once the count drains to zero.
pub struct UsePermit<'a> {
    barrier: &'a UseLockBarrier,
}

impl Drop for UsePermit<'_> {
    fn drop(&mut self) {
        self.barrier.release_use();
    }
}

/// Guard for one lock phase; dropping it deregisters the holder and wakes
/// blocked use acquirers when the holder set empties.
pub struct BarrierLockGuard<'a> {
    barrier: &'a UseLockBarrier,
    holder: Option<MemberId>,
}

impl BarrierLockGuard<'_> {
    /// Keep the lock phase registered past this guard's lifetime; the phase
    /// must then be ended explicitly via `release_lock`. Used when the
    /// matching release arrives as a later remote event.
    pub fn detach(mut self) -> MemberId {
        self.holder
            .take()
            .expect("lock guard already detached")
    }
}

impl Drop for BarrierLockGuard<'_> {
    fn drop(&mut self) {
        if let Some(holder) = self.holder.take() {
            self.barrier.release_lock(&holder);
        }
    }
}
