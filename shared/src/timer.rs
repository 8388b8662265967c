use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::trace;

type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Shared timer service backing lock-waiter expiry.
///
/// One dedicated thread drains a deadline-ordered heap. Handles cancel
/// idempotently: a successful grant and a timeout expiry race safely, and
/// whichever fires first wins while the other becomes a no-op.
pub struct TimerService {
    inner: Arc<TimerInner>,
    thread: Option<JoinHandle<()>>,
}

struct TimerInner {
    state: Mutex<TimerState>,
    cond: Condvar,
}

struct TimerState {
    queue: BinaryHeap<ScheduledEntry>,
    tasks: HashMap<u64, TimerTask>,
    next_id: u64,
    shutdown: bool,
}

struct ScheduledEntry {
    due: Instant,
    id: u64,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.id == other.id
    }
}

impl Eq for ScheduledEntry {}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl TimerService {
    pub fn new() -> Self {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                queue: BinaryHeap::new(),
                tasks: HashMap::new(),
                next_id: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let run_inner = inner.clone();
        let thread = thread::Builder::new()
            .name("concord-timer".to_string())
            .spawn(move || Self::run(&run_inner))
            .ok();

        Self { inner, thread }
    }

    /// Schedule `task` to run after `delay` on the timer thread.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TimerHandle {
        let due = Instant::now() + delay;
        let id;
        {
            let Ok(mut state) = self.inner.state.lock() else {
                panic!("timer state poisoned");
            };
            id = state.next_id;
            state.next_id += 1;
            state.queue.push(ScheduledEntry { due, id });
            state.tasks.insert(id, Box::new(task));
        }
        self.inner.cond.notify_one();

        TimerHandle {
            id,
            inner: self.inner.clone(),
        }
    }

    fn run(inner: &TimerInner) {
        let Ok(mut state) = inner.state.lock() else {
            panic!("timer state poisoned");
        };
        loop {
            if state.shutdown {
                return;
            }

            let now = Instant::now();
            match state.queue.peek() {
                None => {
                    state = match inner.cond.wait(state) {
                        Ok(guard) => guard,
                        Err(_) => panic!("timer state poisoned"),
                    };
                }
                Some(entry) if entry.due > now => {
                    let wait_for = entry.due - now;
                    state = match inner.cond.wait_timeout(state, wait_for) {
                        Ok((guard, _)) => guard,
                        Err(_) => panic!("timer state poisoned"),
                    };
                }
                Some(_) => {
                    let entry = state.queue.pop().expect("peeked entry vanished");
                    // A cancelled task has already left the map.
                    if let Some(task) = state.tasks.remove(&entry.id) {
                        drop(state);
                        trace!("timer task {} firing", entry.id);
                        task();
                        state = match inner.state.lock() {
                            Ok(guard) => guard,
                            Err(_) => panic!("timer state poisoned"),
                        };
                    }
                }
            }
        }
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.shutdown = true;
            state.tasks.clear();
        }
        self.inner.cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Cancellable handle to a scheduled task.
pub struct TimerHandle {
    id: u64,
    inner: Arc<TimerInner>,
}

impl TimerHandle {
    /// Cancel the task. Returns whether the task had not yet fired;
    /// cancelling after the fact is a no-op.
    pub fn cancel(&self) -> bool {
        let Ok(mut state) = self.inner.state.lock() else {
            panic!("timer state poisoned");
        };
        state.tasks.remove(&self.id).is_some()
    }
}
