use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use log::{trace, warn};

use concord_shared::{
    ContextError, ContextKey, ContextResult, ContextValue, DiffOutcome, TimeBudget, ValueDiff,
};

/// Mutation observed for a key while its demand fetch was in flight. Replayed
/// onto the fetched value in arrival order before anyone sees it.
pub enum BufferedMutation<V> {
    Put(V),
    Update(ValueDiff),
    Remove,
}

/// What `enter` decided for the calling thread.
pub enum GateEntry<V> {
    /// First requester; performs the remote fetch and must `resolve`.
    Leader,
    /// A fetch is already in flight; block on the slot for its outcome.
    Follower(Arc<FetchGateSlot<V>>),
}

/// Single-flight gate for client-role demand fills.
///
/// The first thread to miss on a key becomes the fetch leader; concurrent
/// requesters for the same key park on the gate instead of issuing duplicate
/// remote gets. Broadcast mutations arriving during the window are buffered
/// on the gate so the fetched value never travels backwards in time.
pub struct ClientFetchGate<K, V> {
    gates: Mutex<HashMap<K, Arc<FetchGateSlot<V>>>>,
}

impl<K: ContextKey, V: ContextValue> ClientFetchGate<K, V> {
    pub fn new() -> Self {
        Self {
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn lock_gates(&self) -> MutexGuard<'_, HashMap<K, Arc<FetchGateSlot<V>>>> {
        let Ok(gates) = self.gates.lock() else {
            panic!("fetch gate table poisoned");
        };
        gates
    }

    /// Join or open the gate for `key`.
    pub fn enter(&self, key: &K) -> GateEntry<V> {
        let mut gates = self.lock_gates();
        if let Some(slot) = gates.get(key) {
            trace!("demand fetch for {key:?} already in flight");
            return GateEntry::Follower(slot.clone());
        }
        gates.insert(key.clone(), Arc::new(FetchGateSlot::new()));
        GateEntry::Leader
    }

    /// Buffer a broadcast mutation for a key whose fetch is in flight.
    /// Returns whether a gate was open for the key.
    pub fn buffer(&self, key: &K, mutation: BufferedMutation<V>) -> bool {
        let gates = self.lock_gates();
        let Some(slot) = gates.get(key) else {
            return false;
        };
        let Ok(mut state) = slot.state.lock() else {
            panic!("fetch gate slot poisoned");
        };
        state.buffered.push(mutation);
        true
    }

    /// Close the gate with the fetch outcome: replay buffered mutations onto
    /// it, hand the result to `install` while the gate is still open, then
    /// publish it to followers and return it to the leader.
    ///
    /// `install` runs before the gate leaves the map, so a mutation racing
    /// the resolve is either buffered and replayed here or applied to the
    /// caller's store after the installed value. `install` must not touch
    /// the gate itself.
    pub fn resolve(
        &self,
        key: &K,
        fetched: ContextResult<Option<V>>,
        install: impl FnOnce(&Option<V>),
    ) -> ContextResult<Option<V>> {
        let mut gates = self.lock_gates();
        let Some(slot) = gates.get(key).cloned() else {
            // No followers could exist without a slot; hand back as-is.
            if let Ok(value) = &fetched {
                install(value);
            }
            return fetched;
        };
        let Ok(mut state) = slot.state.lock() else {
            panic!("fetch gate slot poisoned");
        };
        let outcome = match fetched {
            Ok(mut value) => {
                for mutation in state.buffered.drain(..) {
                    replay(key, &mut value, mutation);
                }
                install(&value);
                Ok(value)
            }
            Err(err) => {
                state.buffered.clear();
                Err(err)
            }
        };
        state.outcome = Some(outcome.clone());
        gates.remove(key);
        drop(gates);
        drop(state);
        slot.cond.notify_all();
        outcome
    }
}

impl<K: ContextKey, V: ContextValue> Default for ClientFetchGate<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

fn replay<K: ContextKey, V: ContextValue>(
    key: &K,
    value: &mut Option<V>,
    mutation: BufferedMutation<V>,
) {
    match mutation {
        BufferedMutation::Put(replacement) => *value = Some(replacement),
        BufferedMutation::Remove => *value = None,
        BufferedMutation::Update(diff) => {
            let Some(current) = value.as_mut() else {
                trace!("dropping buffered diff for absent {key:?}");
                return;
            };
            match current.apply_diff(&diff) {
                Ok(DiffOutcome::Applied) | Ok(DiffOutcome::AlreadyCurrent) => {}
                Ok(DiffOutcome::Conflict) => {
                    warn!("buffered diff for {key:?} conflicts with fetched value");
                }
                Err(err) => {
                    warn!("buffered diff for {key:?} not applicable: {err}");
                }
            }
        }
    }
}

/// Parking slot followers block on until the leader resolves.
pub struct FetchGateSlot<V> {
    state: Mutex<SlotState<V>>,
    cond: Condvar,
}

struct SlotState<V> {
    outcome: Option<ContextResult<Option<V>>>,
    buffered: Vec<BufferedMutation<V>>,
}

impl<V: ContextValue> FetchGateSlot<V> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                outcome: None,
                buffered: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Block until the leader publishes the outcome or `budget` runs out.
    pub fn await_result(&self, budget: TimeBudget) -> ContextResult<Option<V>> {
        let Ok(mut state) = self.state.lock() else {
            panic!("fetch gate slot poisoned");
        };
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            state = match budget.remaining() {
                None => match self.cond.wait(state) {
                    Ok(guard) => guard,
                    Err(_) => panic!("fetch gate slot poisoned"),
                },
                Some(remaining) if remaining.is_zero() => {
                    return Err(ContextError::timeout("demand fetch"));
                }
                Some(remaining) => match self.cond.wait_timeout(state, remaining) {
                    Ok((guard, _)) => guard,
                    Err(_) => panic!("fetch gate slot poisoned"),
                },
            };
        }
    }
}
