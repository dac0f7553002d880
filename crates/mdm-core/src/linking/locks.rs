use crate::error::{MdmError, Result};
use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Per-entity exclusive sections keyed by golden record or target id.
///
/// A caller names every entity it is about to mutate and receives all of
/// them at once, or none. Nothing is held while waiting, so two callers can
/// never each hold half of the other's set; ids are still taken in ascending
/// order so the acquisition order is the same for everyone. Waits are bounded
/// by `timeout` and surface as a retryable [`MdmError::LockTimeout`].
pub struct EntityLocks {
    held: Mutex<HashSet<Uuid>>,
    released: Condvar,
    timeout: Duration,
}

impl EntityLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Block until every id is free, then take them all
    pub fn acquire(&self, ids: impl IntoIterator<Item = Uuid>) -> Result<EntityGuard<'_>> {
        let mut ids: Vec<Uuid> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();

        let deadline = Instant::now() + self.timeout;
        let mut held = self.lock_table()?;

        while ids.iter().any(|id| held.contains(id)) {
            let now = Instant::now();
            if now >= deadline {
                log::warn!("Entity lock wait timed out for {:?}", ids);
                return Err(MdmError::LockTimeout {
                    entities: ids,
                    waited: self.timeout,
                });
            }
            let (guard, _) = self
                .released
                .wait_timeout(held, deadline - now)
                .map_err(|_| MdmError::Conflict("Entity lock table poisoned".into()))?;
            held = guard;
        }

        for id in &ids {
            held.insert(*id);
        }

        Ok(EntityGuard { locks: self, ids })
    }

    /// Whether an id is currently held by anyone
    pub fn is_held(&self, id: Uuid) -> bool {
        self.held.lock().map(|h| h.contains(&id)).unwrap_or(false)
    }

    fn lock_table(&self) -> Result<MutexGuard<'_, HashSet<Uuid>>> {
        self.held
            .lock()
            .map_err(|_| MdmError::Conflict("Entity lock table poisoned".into()))
    }

    fn release(&self, ids: &[Uuid]) {
        // Release even if another holder panicked; the set itself stays consistent
        let mut held = match self.held.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for id in ids {
            held.remove(id);
        }
        drop(held);
        self.released.notify_all();
    }
}

/// Held entity set. Released on drop, on every exit path.
pub struct EntityGuard<'a> {
    locks: &'a EntityLocks,
    ids: Vec<Uuid>,
}

impl EntityGuard<'_> {
    pub fn covers(&self, id: Uuid) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    pub fn ids(&self) -> &[Uuid] {
        &self.ids
    }
}

impl Drop for EntityGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.ids);
    }
}
