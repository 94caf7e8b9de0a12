//! Error types for the lock table.

use terrarun_core::{LockDomain, LockKey};
use uuid::Uuid;

use crate::locker::LockHolder;

/// Misuse of the lock table. These indicate a bug in the caller, not a
/// runtime condition.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LockError {
    #[error("lock {key} ({domain}) is not held")]
    NotHeld { key: LockKey, domain: LockDomain },

    #[error("lock {key} ({domain}) is held by {holder}, not {caller}")]
    OwnerMismatch {
        key: LockKey,
        domain: LockDomain,
        holder: Uuid,
        caller: Uuid,
    },
}

/// A try-lock that found the lock already taken.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error(
    "{key} ({domain}) locked, held since {}, held by {} ({})",
    .holder.acquired_at.to_rfc3339(),
    .holder.invocation_id,
    .holder.command
)]
pub struct LockContention {
    pub key: LockKey,
    pub domain: LockDomain,
    pub holder: LockHolder,
}

/// Result type for lock table operations.
pub type LockResult<T> = std::result::Result<T, LockError>;
