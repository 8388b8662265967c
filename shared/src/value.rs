use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;

use thiserror::Error;

use crate::wrapping_version::UpdateVersion;

/// Errors that can occur computing or applying a value diff
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    /// The value type does not opt in to differential updates
    #[error("value type does not support differential updates")]
    Unsupported,

    /// A property payload could not be decoded by the value type
    #[error("diff property {index} could not be decoded")]
    MalformedProperty { index: u8 },
}

/// Result of applying a `ValueDiff` to a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    /// The diff version immediately followed the current version and its
    /// property changes were applied
    Applied,
    /// The value already reflects this diff (at-least-once redelivery);
    /// a logged no-op, not an error
    AlreadyCurrent,
    /// The diff version is ahead of the current version but does not
    /// immediately follow it - an update was missed
    Conflict,
}

/// A sparse, versioned description of property-level changes to a value.
///
/// Property payloads are opaque to the core; only the value type that
/// produced a diff can decode it. Constructed per update, never mutated
/// after send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueDiff {
    version: UpdateVersion,
    changes: BTreeMap<u8, Vec<u8>>,
}

impl ValueDiff {
    pub fn new(version: UpdateVersion) -> Self {
        Self {
            version,
            changes: BTreeMap::new(),
        }
    }

    /// The version the target value will carry after this diff applies.
    pub fn version(&self) -> UpdateVersion {
        self.version
    }

    pub fn set_property(&mut self, index: u8, payload: Vec<u8>) {
        self.changes.insert(index, payload);
    }

    pub fn property(&self, index: u8) -> Option<&[u8]> {
        self.changes.get(&index).map(Vec::as_slice)
    }

    pub fn properties(&self) -> impl Iterator<Item = (u8, &[u8])> {
        self.changes.iter().map(|(index, payload)| (*index, payload.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// A null diff carries no changes and version zero. Null diffs are never
    /// transmitted; update calls skip them entirely.
    pub fn is_null(&self) -> bool {
        self.changes.is_empty() && self.version == UpdateVersion::ZERO
    }

    /// The ordering rule shared by every value implementation, keeping
    /// application idempotent under at-least-once delivery:
    /// - `Applied` iff this diff's version immediately follows `current`
    /// - `AlreadyCurrent` iff this diff's version is not strictly newer
    /// - `Conflict` otherwise (newer, but an update in between was missed)
    pub fn classify(&self, current: UpdateVersion) -> DiffOutcome {
        if self.version.follows(&current) {
            DiffOutcome::Applied
        } else if !self.version.newer_than(&current) {
            DiffOutcome::AlreadyCurrent
        } else {
            DiffOutcome::Conflict
        }
    }
}

/// A key stored in the replicated context.
pub trait ContextKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static> ContextKey for T {}

/// A value stored in the replicated context.
///
/// Values are opaque to the core. A type opts in to differential updates by
/// overriding the diff methods; the defaults reject `update` calls with
/// `DiffError::Unsupported`.
pub trait ContextValue: Clone + Send + Sync + 'static {
    /// Whether this value type supports differential updates.
    fn supports_diff(&self) -> bool {
        false
    }

    /// Current update version. Non-diffable values stay at zero.
    fn update_version(&self) -> UpdateVersion {
        UpdateVersion::ZERO
    }

    /// Compute the sparse diff transforming `self` into `candidate`.
    ///
    /// `Ok(None)` means nothing changed and the update should be skipped.
    fn diff_against(&self, candidate: &Self) -> Result<Option<ValueDiff>, DiffError> {
        let _ = candidate;
        Err(DiffError::Unsupported)
    }

    /// Apply a diff in place, following the `ValueDiff::classify` rule.
    fn apply_diff(&mut self, diff: &ValueDiff) -> Result<DiffOutcome, DiffError> {
        let _ = diff;
        Err(DiffError::Unsupported)
    }
}

macro_rules! impl_plain_value {
    ($($value_type:ty),* $(,)?) => {
        $(
            impl ContextValue for $value_type {}
        )*
    };
}

impl_plain_value!(String, Vec<u8>, bool, i32, i64, u32, u64, f32, f64);
