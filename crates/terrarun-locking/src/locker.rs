//! The project lock table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use terrarun_core::{CommandKind, LockDomain, LockKey};
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{LockContention, LockError, LockResult};

/// Who holds a lock and since when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub invocation_id: Uuid,
    pub command: CommandKind,
    pub pull_num: u64,
    pub user: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockHolder {
    pub fn new(invocation_id: Uuid, command: CommandKind) -> Self {
        Self {
            invocation_id,
            command,
            pull_num: 0,
            user: String::new(),
            acquired_at: Utc::now(),
        }
    }

    pub fn with_pull(mut self, pull_num: u64, user: impl Into<String>) -> Self {
        self.pull_num = pull_num;
        self.user = user.into();
        self
    }
}

type Slot = (LockKey, LockDomain);

/// Process-wide lock table.
///
/// Share it behind an `Arc`; every invocation in the process must consult the
/// same instance. Each operation is a single check-and-set under one mutex
/// acquisition, so two callers can never both see a key as free.
#[derive(Debug, Default)]
pub struct ProjectLocker {
    table: Mutex<HashMap<Slot, LockHolder>>,
}

impl ProjectLocker {
    pub fn new() -> Self {
        Self::default()
    }

    // Every critical section is one insert, remove or read, so a poisoned
    // table is still consistent.
    fn table(&self) -> MutexGuard<'_, HashMap<Slot, LockHolder>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the lock for (`key`, `domain`) without waiting.
    ///
    /// On success the returned guard owns the lock until it is dropped or
    /// released. On contention the current holder is reported.
    pub fn try_lock(
        self: &Arc<Self>,
        key: LockKey,
        domain: LockDomain,
        holder: LockHolder,
    ) -> Result<LockGuard, LockContention> {
        let invocation_id = holder.invocation_id;
        {
            let mut table = self.table();
            let slot = (key.clone(), domain);
            if let Some(current) = table.get(&slot) {
                return Err(LockContention {
                    key,
                    domain,
                    holder: current.clone(),
                });
            }
            table.insert(slot, holder);
        }
        debug!(lock_key = %key, domain = %domain, invocation_id = %invocation_id, "lock acquired");
        Ok(LockGuard {
            locker: Arc::clone(self),
            key,
            domain,
            invocation_id,
            released: false,
        })
    }

    /// Release the lock held by `invocation_id`.
    ///
    /// Releasing a lock that is not held, or that another invocation holds,
    /// is a caller bug: it is logged as an invariant violation and returned
    /// as an error, and the table is left untouched.
    pub fn unlock(
        &self,
        key: &LockKey,
        domain: LockDomain,
        invocation_id: Uuid,
    ) -> LockResult<LockHolder> {
        let mut table = self.table();
        let slot = (key.clone(), domain);
        let outcome = match table.get(&slot) {
            None => Err(LockError::NotHeld {
                key: key.clone(),
                domain,
            }),
            Some(current) if current.invocation_id != invocation_id => {
                Err(LockError::OwnerMismatch {
                    key: key.clone(),
                    domain,
                    holder: current.invocation_id,
                    caller: invocation_id,
                })
            }
            Some(_) => Ok(()),
        };
        match outcome {
            Ok(()) => {
                let holder = table.remove(&slot).ok_or_else(|| LockError::NotHeld {
                    key: key.clone(),
                    domain,
                })?;
                drop(table);
                debug!(lock_key = %key, domain = %domain, invocation_id = %invocation_id, "lock released");
                Ok(holder)
            }
            Err(e) => {
                drop(table);
                error!(event = "lock.invariant_violation", error = %e);
                Err(e)
            }
        }
    }

    /// Current holder of (`key`, `domain`), if any.
    pub fn holder(&self, key: &LockKey, domain: LockDomain) -> Option<LockHolder> {
        self.table().get(&(key.clone(), domain)).cloned()
    }

    pub fn is_locked(&self, key: &LockKey, domain: LockDomain) -> bool {
        self.holder(key, domain).is_some()
    }

    /// Snapshot of every held lock, ordered by key then domain.
    pub fn holders(&self) -> Vec<(LockKey, LockDomain, LockHolder)> {
        let mut held: Vec<_> = self
            .table()
            .iter()
            .map(|((k, d), h)| (k.clone(), *d, h.clone()))
            .collect();
        held.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
        held
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ownership of one held lock. Released on drop, including during unwinding
/// and when the owning future is dropped mid-await.
#[derive(Debug)]
pub struct LockGuard {
    locker: Arc<ProjectLocker>,
    key: LockKey,
    domain: LockDomain,
    invocation_id: Uuid,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn domain(&self) -> LockDomain {
        self.domain
    }

    pub fn invocation_id(&self) -> Uuid {
        self.invocation_id
    }

    /// Release now and report whether the table agreed we held the lock.
    pub fn release(mut self) -> LockResult<()> {
        self.released = true;
        self.locker
            .unlock(&self.key, self.domain, self.invocation_id)
            .map(|_| ())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            // Errors are already logged by unlock.
            let _ = self
                .locker
                .unlock(&self.key, self.domain, self.invocation_id);
        }
    }
}
