use std::collections::HashSet;
use std::time::Duration;

use concord_shared::MemberId;

/// Contains configuration required to instantiate a [ReplicatedContext](crate::ReplicatedContext)
#[derive(Clone, Debug)]
pub struct ContextConfig {
    /// Bus topic this context communicates on. Contexts with different
    /// topics never see each other's events.
    pub topic: String,
    /// Whether this node participates as a client: no full replica, no Main
    /// eligibility, demand-filled local cache.
    pub client_role: bool,
    /// Members that must never be elected Main, regardless of membership
    /// order.
    pub excluded_main_ids: HashSet<MemberId>,
    /// Pull a full snapshot from Main during `start` when this node is not
    /// Main itself.
    pub synchronize_on_start: bool,
    /// Restrict persistence saves to the Main node. When disabled every
    /// server-role node saves.
    pub save_on_main_only: bool,
    /// Load individual entries from persistence on read miss instead of
    /// loading everything up front.
    pub lazy_load: bool,
    /// Accept synchronous broadcasts that gathered only part of the expected
    /// replies within the budget. Lock-grant acknowledgements are always
    /// strict regardless of this flag.
    pub accept_partial_replies: bool,
    /// Budget for a single synchronous request/reply exchange.
    pub request_timeout: Duration,
    /// Budget for draining local use operations when a cluster-wide update
    /// lock is requested.
    pub update_lock_timeout: Duration,
    /// Budget for a full synchronize round (update lock + snapshot pull).
    pub sync_timeout: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            topic: "shared-context".to_string(),
            client_role: false,
            excluded_main_ids: HashSet::new(),
            synchronize_on_start: true,
            save_on_main_only: true,
            lazy_load: false,
            accept_partial_replies: false,
            request_timeout: Duration::from_secs(10),
            update_lock_timeout: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(60),
        }
    }
}
