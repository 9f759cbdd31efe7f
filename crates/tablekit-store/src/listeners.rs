//! Ordered callback registries and the [`Subscription`] guard.
//!
//! # Invariants
//!
//! 1. Callbacks run in registration order.
//! 2. A broadcast iterates the list as it was when the broadcast started;
//!    callbacks added or removed meanwhile take effect from the next one.
//! 3. Releasing a [`Subscription`] removes exactly its own registration.
//!    Releasing twice, or after the registry is gone, is a no-op.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// An ordered list of `(id, callback)` pairs.
pub(crate) struct Registry<F: ?Sized> {
    entries: Mutex<Vec<(u64, Arc<F>)>>,
    next_id: AtomicU64,
}

impl<F: ?Sized + Send + Sync + 'static> Registry<F> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    // Callbacks never run under this lock.
    fn entries(&self) -> MutexGuard<'_, Vec<(u64, Arc<F>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `callback`; the returned guard removes it again.
    pub(crate) fn register(self: &Arc<Self>, callback: Arc<F>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries().push((id, callback));
        let weak = Arc::downgrade(self);
        let registry: Weak<dyn Detach> = weak;
        Subscription {
            registry,
            id,
            released: AtomicBool::new(false),
        }
    }

    /// The callbacks at this moment, in registration order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<F>> {
        self.entries().iter().map(|(_, f)| Arc::clone(f)).collect()
    }

    /// Remove every callback. They are dropped after the lock is released.
    #[cfg_attr(not(feature = "observable"), allow(dead_code))]
    pub(crate) fn clear(&self) {
        let removed = std::mem::take(&mut *self.entries());
        drop(removed);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
    fn contains(&self, id: u64) -> bool;
}

impl<F: ?Sized + Send + Sync> Detach for Registry<F> {
    fn detach(&self, id: u64) {
        let removed = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries
                .iter()
                .position(|(entry, _)| *entry == id)
                .map(|at| entries.remove(at))
        };
        drop(removed);
    }

    fn contains(&self, id: u64) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|(entry, _)| *entry == id)
    }
}

/// Handle to one registered callback.
///
/// Dropping the subscription unsubscribes, so keep it alive for as long as
/// the callback should run.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    registry: Weak<dyn Detach>,
    id: u64,
    released: AtomicBool,
}

impl Subscription {
    /// Remove the callback. Later calls do nothing.
    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(self.id);
        }
    }

    /// Whether the callback is still registered. Turns false once the
    /// registry is cleared or dropped.
    pub fn is_active(&self) -> bool {
        if self.released.load(Ordering::Acquire) {
            return false;
        }
        self.registry
            .upgrade()
            .map_or(false, |registry| registry.contains(self.id))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
