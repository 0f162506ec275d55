//! Ordered fan-out to registered callbacks.
//!
//! Listeners are notified in registration order. The list is snapshotted
//! before notifying, so a callback may add or remove listeners (itself
//! included) without deadlocking; the change applies from the next
//! notification on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Handle returned by [`Listeners::add`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

pub(crate) type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct Listeners<E: ?Sized> {
    next_id: Arc<AtomicU64>,
    entries: Mutex<Vec<(ListenerId, Callback<E>)>>,
}

impl<E: ?Sized> Listeners<E> {
    pub fn new() -> Self {
        Self::with_ids(Arc::new(AtomicU64::new(1)))
    }

    /// Lists built from the same counter hand out distinct ids, so one id
    /// can be removed from all of them without touching the wrong entry.
    pub fn with_ids(next_id: Arc<AtomicU64>) -> Self {
        Self {
            next_id,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.entries).push((id, Arc::new(callback)));
        id
    }

    /// Returns whether a listener was removed.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn notify(&self, event: &E) {
        for callback in self.snapshot() {
            callback(event);
        }
    }

    /// Current callbacks in registration order.
    pub(crate) fn snapshot(&self) -> Vec<Callback<E>> {
        lock(&self.entries).iter().map(|(_, cb)| cb.clone()).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

impl<E: ?Sized> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

// Shared state is never left half-updated by a panicking holder, so a
// poisoned lock is still safe to use.

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T: ?Sized>(rw: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rw.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T: ?Sized>(rw: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rw.write().unwrap_or_else(PoisonError::into_inner)
}
