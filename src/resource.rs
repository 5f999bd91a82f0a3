//! Lease bookkeeping shared by GPIO lines and PWM channels.
//!
//! A chip keeps a [`LeaseTable`] keyed by offset or channel index. A key is
//! first reserved (so a concurrent acquire of the same key is rejected while
//! the hardware handshake runs) and then committed once the handle exists.
//! Handles hold a [`ReleaseOnce`] so that releasing twice is a no-op.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use log::warn;

use crate::error::{Error, ResourceId, Result};

/// Something a chip can forcibly release on close.
pub(crate) trait Lease: Send + Sync {
    fn release(&self) -> Result<()>;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub(crate) struct ReleaseOnce {
    closed: AtomicBool,
}

impl ReleaseOnce {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the resource closed. Only the first caller gets `true`.
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn ensure_open(&self, id: ResourceId) -> Result<()> {
        if self.is_closed() {
            Err(Error::ClosedHandle(id))
        } else {
            Ok(())
        }
    }
}

enum Slot<T> {
    Pending,
    Held(Weak<T>),
}

pub(crate) struct LeaseTable<T: Lease> {
    id: fn(u32) -> ResourceId,
    slots: Mutex<HashMap<u32, Slot<T>>>,
    /// Set by `release_all` under the slots lock; later commits are refused.
    closed: AtomicBool,
}

impl<T: Lease> LeaseTable<T> {
    pub(crate) fn new(id: fn(u32) -> ResourceId) -> Arc<Self> {
        Arc::new(Self {
            id,
            slots: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Claims `key`, failing with `ResourceInUse` if it is held or being acquired.
    pub(crate) fn reserve(self: &Arc<Self>, key: u32) -> Result<Reservation<T>> {
        let mut slots = lock(&self.slots);
        if slots.contains_key(&key) {
            return Err(Error::ResourceInUse((self.id)(key)));
        }
        slots.insert(key, Slot::Pending);
        Ok(Reservation {
            table: Arc::clone(self),
            key,
            committed: false,
        })
    }

    pub(crate) fn remove(&self, key: u32) {
        lock(&self.slots).remove(&key);
    }

    pub(crate) fn is_leased(&self, key: u32) -> bool {
        lock(&self.slots).contains_key(&key)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Releases every committed lease and refuses any reservation still
    /// pending. Failures are logged and returned, they never stop the
    /// remaining releases.
    pub(crate) fn release_all(&self) -> Vec<(ResourceId, Error)> {
        let held: Vec<(u32, Arc<T>)> = {
            let mut slots = lock(&self.slots);
            self.closed.store(true, Ordering::Release);
            let keys: Vec<u32> = slots
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Held(_)))
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter()
                .filter_map(|key| match slots.remove(&key) {
                    Some(Slot::Held(weak)) => weak.upgrade().map(|lease| (key, lease)),
                    _ => None,
                })
                .collect()
        };

        let mut failures = Vec::new();
        for (key, lease) in held {
            if let Err(err) = lease.release() {
                let id = (self.id)(key);
                warn!("failed to release {} during close: {}", id, err);
                failures.push((id, err));
            }
        }
        failures
    }
}

/// A claimed but not yet committed key. Dropping it frees the key.
pub(crate) struct Reservation<T: Lease> {
    table: Arc<LeaseTable<T>>,
    key: u32,
    committed: bool,
}

impl<T: Lease> Reservation<T> {
    /// Fails with `ClosedHandle(Chip)` if the owning chip closed while the
    /// key was pending; the key is then freed and the caller must undo its
    /// hardware setup.
    pub(crate) fn commit(mut self, lease: &Arc<T>) -> Result<()> {
        let mut slots = lock(&self.table.slots);
        if self.table.closed.load(Ordering::Acquire) {
            return Err(Error::ClosedHandle(ResourceId::Chip));
        }
        slots.insert(self.key, Slot::Held(Arc::downgrade(lease)));
        self.committed = true;
        Ok(())
    }
}

impl<T: Lease> Drop for Reservation<T> {
    fn drop(&mut self) {
        if !self.committed {
            self.table.remove(self.key);
        }
    }
}
