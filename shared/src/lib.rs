//! # Concord Shared
//! Common types and collaborator contracts shared between concord server &
//! client roles.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod bus;
mod error;
mod events;
mod membership;
mod time_budget;
mod timer;
mod value;
mod wrapping_version;

pub use bus::{
    routing_of, EventEnvelope, EventSink, MessageBus, SendError, Topic, CLIENT_TOPIC_SUFFIX,
};
pub use error::{ContextError, ContextResult};
pub use events::{ContextEvent, EventReply, LockOptions};
pub use membership::{ClusterView, MemberId, MembershipChange, Role};
pub use time_budget::TimeBudget;
pub use timer::{TimerHandle, TimerService};
pub use value::{ContextKey, ContextValue, DiffError, DiffOutcome, ValueDiff};
pub use wrapping_version::{
    try_wrapping_diff, version_greater_than, version_less_than, wrapping_diff, UpdateVersion,
    WrappingVersionError, HALF_RANGE,
};
