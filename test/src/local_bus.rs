use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use log::trace;

use concord_shared::{
    ContextEvent, ContextKey, ContextValue, EventEnvelope, EventReply, EventSink, MemberId,
    MessageBus, SendError, TimeBudget, Topic,
};

/// A process-local bus shared by every node of a test cluster.
///
/// Each node gets one FIFO dispatcher thread, so deliveries to a node arrive
/// in sender order, matching the per-(topic, key) ordering contract. Replies
/// bypass the dispatchers and go straight to the pending request, so a node
/// blocked in its own dispatcher can still complete an outbound request.
pub struct BusNetwork<K, V> {
    state: Mutex<NetworkState<K, V>>,
    sequence: AtomicU64,
}

struct NetworkState<K, V> {
    nodes: HashMap<MemberId, NodeSlot<K, V>>,
    pending: HashMap<u64, Sender<EventReply<K, V>>>,
    partitioned: HashSet<MemberId>,
    sent: HashMap<&'static str, usize>,
    delays: HashMap<MemberId, Duration>,
}

struct NodeSlot<K, V> {
    topics: HashSet<Topic>,
    tx: Sender<EventEnvelope<K, V>>,
    rx: Option<Receiver<EventEnvelope<K, V>>>,
}

impl<K: ContextKey, V: ContextValue> BusNetwork<K, V> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NetworkState {
                nodes: HashMap::new(),
                pending: HashMap::new(),
                partitioned: HashSet::new(),
                sent: HashMap::new(),
                delays: HashMap::new(),
            }),
            sequence: AtomicU64::new(0),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, NetworkState<K, V>> {
        self.state.lock().unwrap()
    }

    /// Register a node and its topic subscriptions, returning its bus handle.
    /// The node receives nothing until `attach` wires in its sink.
    pub fn register(self: &Arc<Self>, member: &MemberId, topics: &[Topic]) -> LocalBus<K, V> {
        let (tx, rx) = mpsc::channel();
        self.lock_state().nodes.insert(
            member.clone(),
            NodeSlot {
                topics: topics.iter().cloned().collect(),
                tx,
                rx: Some(rx),
            },
        );
        LocalBus {
            member: member.clone(),
            network: self.clone(),
        }
    }

    /// Spawn the node's dispatcher thread feeding `sink`.
    pub fn attach(self: &Arc<Self>, member: &MemberId, sink: Arc<dyn EventSink<K, V>>) {
        let rx = self
            .lock_state()
            .nodes
            .get_mut(member)
            .and_then(|slot| slot.rx.take())
            .expect("member not registered or already attached");
        let network = self.clone();
        let id = member.clone();
        thread::Builder::new()
            .name(format!("bus-{id}"))
            .spawn(move || {
                while let Ok(envelope) = rx.recv() {
                    let delay = network.lock_state().delays.get(&id).copied();
                    if let Some(delay) = delay {
                        thread::sleep(delay);
                    }
                    sink.deliver(envelope);
                }
            })
            .expect("spawn bus dispatcher");
    }

    /// Cut a member off: it neither receives nor reaches anyone.
    pub fn disconnect(&self, member: &MemberId) {
        self.lock_state().partitioned.insert(member.clone());
    }

    pub fn reconnect(&self, member: &MemberId) {
        self.lock_state().partitioned.remove(member);
    }

    /// Delay every delivery to `member`, widening race windows.
    pub fn set_delivery_delay(&self, member: &MemberId, delay: Duration) {
        self.lock_state().delays.insert(member.clone(), delay);
    }

    pub fn clear_delivery_delay(&self, member: &MemberId) {
        self.lock_state().delays.remove(member);
    }

    /// How many events of `kind` have been sent over this network.
    pub fn sent_count(&self, kind: &str) -> usize {
        self.lock_state().sent.get(kind).copied().unwrap_or(0)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn fan_out(
        &self,
        from: &MemberId,
        topic: &Topic,
        event: ContextEvent<K, V>,
        sequence: u64,
        wants_reply: bool,
    ) -> usize {
        let mut state = self.lock_state();
        *state.sent.entry(event.kind()).or_insert(0) += 1;
        if state.partitioned.contains(from) {
            return 0;
        }
        let mut delivered = 0;
        for (member, slot) in &state.nodes {
            if member == from
                || state.partitioned.contains(member)
                || !slot.topics.contains(topic)
            {
                continue;
            }
            let envelope = EventEnvelope {
                source: from.clone(),
                sequence,
                topic: topic.clone(),
                event: event.clone(),
                wants_reply,
            };
            if slot.tx.send(envelope).is_ok() {
                delivered += 1;
            }
        }
        trace!(
            "{from} fanned out {} on {topic} to {delivered} nodes",
            event.kind()
        );
        delivered
    }
}

/// One node's handle onto the shared [BusNetwork].
pub struct LocalBus<K, V> {
    member: MemberId,
    network: Arc<BusNetwork<K, V>>,
}

impl<K, V> Clone for LocalBus<K, V> {
    fn clone(&self) -> Self {
        Self {
            member: self.member.clone(),
            network: self.network.clone(),
        }
    }
}

impl<K: ContextKey, V: ContextValue> MessageBus<K, V> for LocalBus<K, V> {
    fn local_id(&self) -> MemberId {
        self.member.clone()
    }

    fn send(
        &self,
        topic: &Topic,
        _routing: Option<u64>,
        event: ContextEvent<K, V>,
    ) -> Result<(), SendError> {
        let sequence = self.network.next_sequence();
        let delivered = self
            .network
            .fan_out(&self.member, topic, event, sequence, false);
        if delivered == 0 {
            return Err(SendError::NoRoute {
                topic: topic.as_str().to_string(),
            });
        }
        Ok(())
    }

    fn request(
        &self,
        topic: &Topic,
        _routing: Option<u64>,
        event: ContextEvent<K, V>,
        expected_replies: usize,
        budget: TimeBudget,
    ) -> Result<Vec<EventReply<K, V>>, SendError> {
        if expected_replies == 0 {
            return Ok(Vec::new());
        }
        let sequence = self.network.next_sequence();
        let (reply_tx, reply_rx) = mpsc::channel();
        self.network.lock_state().pending.insert(sequence, reply_tx);
        let delivered = self
            .network
            .fan_out(&self.member, topic, event, sequence, true);
        if delivered == 0 {
            self.network.lock_state().pending.remove(&sequence);
            return Err(SendError::NoRoute {
                topic: topic.as_str().to_string(),
            });
        }

        let mut replies = Vec::with_capacity(expected_replies);
        while replies.len() < expected_replies {
            let step = budget.remaining_capped(Duration::from_secs(5));
            match reply_rx.recv_timeout(step) {
                Ok(reply) => replies.push(reply),
                Err(RecvTimeoutError::Timeout) => {
                    if budget.expired() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.network.lock_state().pending.remove(&sequence);
        Ok(replies)
    }

    fn receivers(&self, topic: &Topic) -> HashSet<MemberId> {
        let state = self.network.lock_state();
        if state.partitioned.contains(&self.member) {
            return HashSet::new();
        }
        state
            .nodes
            .iter()
            .filter(|(member, slot)| {
                **member != self.member
                    && !state.partitioned.contains(member)
                    && slot.topics.contains(topic)
            })
            .map(|(member, _)| member.clone())
            .collect()
    }

    fn respond(
        &self,
        _source: &MemberId,
        sequence: u64,
        reply: EventReply<K, V>,
    ) -> Result<(), SendError> {
        let tx = {
            let state = self.network.lock_state();
            if state.partitioned.contains(&self.member) {
                return Ok(());
            }
            state.pending.get(&sequence).cloned()
        };
        // A missing entry means the requester gave up; stale replies drop.
        if let Some(tx) = tx {
            let _ = tx.send(reply);
        }
        Ok(())
    }
}
