use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use thiserror::Error;

use crate::events::{ContextEvent, EventReply};
use crate::membership::MemberId;
use crate::time_budget::TimeBudget;

/// Fixed suffix distinguishing the client sub-topic from the server topic,
/// so client-role and server-role nodes can be addressed independently while
/// sharing the same event vocabulary.
pub const CLIENT_TOPIC_SUFFIX: &str = ".clients";

/// Logical destination on the message bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The client-only sub-topic paired with this server topic.
    pub fn client_sub_topic(&self) -> Topic {
        Topic(format!("{}{}", self.0, CLIENT_TOPIC_SUFFIX))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors that can occur talking to peers over the bus
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// No live receiver is subscribed to the topic
    #[error("no live receivers on topic {topic}")]
    NoRoute { topic: String },

    /// The transport failed to deliver the message
    #[error("delivery on topic {topic} failed: {reason}")]
    Delivery { topic: String, reason: String },

    /// A peer answered with an error payload instead of data
    #[error("peer {peer} reported an error: {message}")]
    Remote { peer: String, message: String },
}

/// Routing key derived from an entry key. Operations carrying the same
/// routing key on the same topic are delivered to each recipient in sender
/// order; different routing keys carry no relative ordering guarantee.
pub fn routing_of<K: Hash>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Inbound event together with its reply coordinates.
#[derive(Debug, Clone)]
pub struct EventEnvelope<K, V> {
    pub source: MemberId,
    pub sequence: u64,
    pub topic: Topic,
    pub event: ContextEvent<K, V>,
    pub wants_reply: bool,
}

/// The message-bus collaborator consumed by the core.
///
/// The bus owns transport, serialization, and subscription mechanics; the
/// core only constructs events and interprets replies.
pub trait MessageBus<K, V>: Send + Sync {
    /// This node's member id on the bus.
    fn local_id(&self) -> MemberId;

    /// Fire-and-forget broadcast to every subscriber of `topic`.
    fn send(
        &self,
        topic: &Topic,
        routing: Option<u64>,
        event: ContextEvent<K, V>,
    ) -> Result<(), SendError>;

    /// Synchronous multi-reply request.
    ///
    /// Blocks until `expected_replies` replies arrive or the budget runs
    /// out, returning whatever was gathered (partial result on timeout).
    fn request(
        &self,
        topic: &Topic,
        routing: Option<u64>,
        event: ContextEvent<K, V>,
        expected_replies: usize,
        budget: TimeBudget,
    ) -> Result<Vec<EventReply<K, V>>, SendError>;

    /// Members currently subscribed to `topic`, excluding this node. Used to
    /// size reply expectations and to detect "no peers reachable".
    fn receivers(&self, topic: &Topic) -> HashSet<MemberId>;

    /// Asynchronous reply to a previously received request envelope.
    fn respond(
        &self,
        source: &MemberId,
        sequence: u64,
        reply: EventReply<K, V>,
    ) -> Result<(), SendError>;
}

/// Receiving side of the bus: the embedding application wires inbound
/// deliveries into the context through this sink.
pub trait EventSink<K, V>: Send + Sync {
    fn deliver(&self, envelope: EventEnvelope<K, V>);
}
