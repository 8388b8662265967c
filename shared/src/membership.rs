use std::collections::HashSet;
use std::fmt;

/// Unique identifier of a cluster member, assigned by the membership
/// collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Cluster role of a node.
///
/// Exactly one live, reachable, non-client member is Main at any time;
/// Main and Secondary hold a full replica, Client holds a demand-filled
/// subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Main,
    Secondary,
    Client,
}

impl Role {
    pub fn is_server(&self) -> bool {
        matches!(self, Role::Main | Role::Secondary)
    }
}

/// Ordered view of the cluster, injected by the membership collaborator and
/// replaced wholesale on every membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterView {
    members: Vec<MemberId>,
    local: MemberId,
}

impl ClusterView {
    pub fn new(members: Vec<MemberId>, local: MemberId) -> Self {
        Self { members, local }
    }

    /// A view containing only this node, used before the first membership
    /// notification arrives.
    pub fn solo(local: MemberId) -> Self {
        Self {
            members: vec![local.clone()],
            local,
        }
    }

    pub fn local(&self) -> &MemberId {
        &self.local
    }

    pub fn members(&self) -> &[MemberId] {
        &self.members
    }

    pub fn contains(&self, id: &MemberId) -> bool {
        self.members.iter().any(|m| m == id)
    }

    /// Deterministic Main election: the first ordered member that is not
    /// explicitly excluded and currently has a live transport route.
    ///
    /// Client members never carry a live route on the server topic, so they
    /// are never electable. The caller adds itself to `live_routes` when it
    /// is a server-role node (the bus's receiver set excludes the caller).
    pub fn elect_main(
        &self,
        excluded: &HashSet<MemberId>,
        live_routes: &HashSet<MemberId>,
    ) -> Option<MemberId> {
        self.members
            .iter()
            .find(|m| !excluded.contains(m) && live_routes.contains(m))
            .cloned()
    }
}

/// Membership transition carrying the old and new ordered member sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub old: Vec<MemberId>,
    pub new: Vec<MemberId>,
}

impl MembershipChange {
    pub fn new(old: Vec<MemberId>, new: Vec<MemberId>) -> Self {
        Self { old, new }
    }

    /// Members present in the old set but missing from the new one.
    pub fn departed(&self) -> impl Iterator<Item = &MemberId> {
        self.old.iter().filter(|m| !self.new.contains(m))
    }

    /// Members present in the new set but missing from the old one.
    pub fn joined(&self) -> impl Iterator<Item = &MemberId> {
        self.new.iter().filter(|m| !self.old.contains(m))
    }
}
