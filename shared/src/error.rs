use thiserror::Error;

use crate::bus::SendError;
use crate::wrapping_version::UpdateVersion;

/// Top-level error taxonomy of the context operation surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    /// A blocking primitive's deadline elapsed. Recoverable; the caller may
    /// retry with a fresh budget.
    #[error("timed out waiting for {waiting_for}")]
    Timeout { waiting_for: &'static str },

    /// Transport or serialization failure talking to peers. Any permit or
    /// key lock held by the failing operation has already been released.
    #[error(transparent)]
    Send(#[from] SendError),

    /// A diff's version did not immediately follow the current version and
    /// no authority exists to resync from (this node is Main).
    #[error("update conflict: diff version {diff_version} against current version {current_version}")]
    UpdateConflict {
        diff_version: UpdateVersion,
        current_version: UpdateVersion,
    },

    /// Operation invoked on a value type or node role that does not support
    /// it. Never retried.
    #[error("unsupported operation {operation}: {reason}")]
    Unsupported {
        operation: &'static str,
        reason: &'static str,
    },

    /// The persistence collaborator failed to load or save.
    #[error("persistence failure: {reason}")]
    Persistence { reason: String },
}

impl ContextError {
    pub fn timeout(waiting_for: &'static str) -> Self {
        ContextError::Timeout { waiting_for }
    }

    pub fn unsupported(operation: &'static str, reason: &'static str) -> Self {
        ContextError::Unsupported { operation, reason }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ContextError::Timeout { .. })
    }
}

pub type ContextResult<T> = Result<T, ContextError>;
