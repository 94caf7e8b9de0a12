//! terrarun locking - per-project mutual exclusion
//!
//! A process-wide table of held locks keyed by (`LockKey`, `LockDomain`).
//! Acquisition is non-blocking: a contended `try_lock` fails immediately and
//! reports the current holder. Release happens through the returned
//! [`LockGuard`], on drop or explicitly.

pub mod error;
pub mod locker;

pub use error::{LockContention, LockError, LockResult};
pub use locker::{LockGuard, LockHolder, ProjectLocker};
