//! Subscription Registry.
//!
//! State transitions are driven by the server:
//! ```text
//! Requested ──ready──► Ready
//!     │                  │
//!     └──nosub──► Stopped ◄──nosub──┘
//! ```
//! `unsub` only asks the server to stop; the handle stays `Ready` until the
//! matching `nosub` arrives. A stopped subscription leaves the registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::listeners::{lock, ListenerId, Listeners};
use crate::methods::RemoteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Requested,
    Ready,
    Stopped,
}

/// Why a subscription stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum StopCause {
    /// `nosub` from the server, with its error if the subscription was
    /// rejected or failed.
    Server(Option<RemoteError>),
    /// The transport closed while the subscription was live.
    ConnectionClosed,
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(Some(error)) => write!(f, "Subscription failed: {error}"),
            Self::Server(None) => write!(f, "Subscription stopped by server"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for StopCause {}

struct SubscriptionInner {
    id: String,
    name: String,
    params: Vec<Value>,
    state: watch::Sender<SubscriptionState>,
    stop_cause: Mutex<Option<StopCause>>,
    /// Orders listener registration against state changes.
    gate: Mutex<()>,
    ready: Listeners<str>,
    nosub: Listeners<StopCause>,
}

/// Caller-side view of one subscription. Cheap to clone.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<SubscriptionInner>,
}

impl SubscriptionHandle {
    fn new(id: String, name: String, params: Vec<Value>) -> Self {
        let (state, _) = watch::channel(SubscriptionState::Requested);
        let listener_ids = Arc::new(AtomicU64::new(1));
        Self {
            inner: Arc::new(SubscriptionInner {
                id,
                name,
                params,
                state,
                stop_cause: Mutex::new(None),
                gate: Mutex::new(()),
                ready: Listeners::with_ids(listener_ids.clone()),
                nosub: Listeners::with_ids(listener_ids),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn params(&self) -> &[Value] {
        &self.inner.params
    }

    pub fn state(&self) -> SubscriptionState {
        *self.inner.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SubscriptionState::Ready
    }

    /// Cause recorded when the subscription stopped.
    pub fn stop_cause(&self) -> Option<StopCause> {
        lock(&self.inner.stop_cause).clone()
    }

    /// Called with the subscription id when it becomes ready. On a handle
    /// that is already `Ready` the callback runs right away, so a `ready`
    /// that raced ahead of registration is not missed.
    pub fn on_ready(&self, callback: impl Fn(&str) + Send + Sync + 'static) -> ListenerId {
        let callback = Arc::new(callback);
        let (id, already_ready) = {
            let _gate = lock(&self.inner.gate);
            let cb = callback.clone();
            (self.inner.ready.add(move |id: &str| cb(id)), self.is_ready())
        };
        if already_ready {
            callback(self.inner.id.as_str());
        }
        id
    }

    /// Called once when the subscription stops; right away if it already has.
    pub fn on_nosub(&self, callback: impl Fn(&StopCause) + Send + Sync + 'static) -> ListenerId {
        let callback = Arc::new(callback);
        let (id, stopped) = {
            let _gate = lock(&self.inner.gate);
            let cb = callback.clone();
            (self.inner.nosub.add(move |cause: &StopCause| cb(cause)), self.stop_cause())
        };
        if let Some(cause) = stopped {
            callback(&cause);
        }
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.ready.remove(id) || self.inner.nosub.remove(id)
    }

    /// Resolve once the subscription leaves `Requested`.
    pub async fn wait_ready(&self) -> Result<(), StopCause> {
        let mut rx = self.inner.state.subscribe();
        let state = match rx.wait_for(|s| *s != SubscriptionState::Requested).await {
            Ok(state) => *state,
            Err(_) => SubscriptionState::Stopped,
        };
        match state {
            SubscriptionState::Ready => Ok(()),
            _ => Err(self.stop_cause().unwrap_or(StopCause::ConnectionClosed)),
        }
    }

    fn mark_ready(&self) -> bool {
        let callbacks = {
            let _gate = lock(&self.inner.gate);
            let changed = self.inner.state.send_if_modified(|state| {
                if *state == SubscriptionState::Requested {
                    *state = SubscriptionState::Ready;
                    true
                } else {
                    false
                }
            });
            if !changed {
                return false;
            }
            self.inner.ready.snapshot()
        };
        for callback in callbacks {
            callback(self.inner.id.as_str());
        }
        true
    }

    fn mark_stopped(&self, cause: StopCause) -> bool {
        let callbacks = {
            let _gate = lock(&self.inner.gate);
            {
                let mut stop_cause = lock(&self.inner.stop_cause);
                if stop_cause.is_some() {
                    return false;
                }
                *stop_cause = Some(cause.clone());
            }
            self.inner.state.send_replace(SubscriptionState::Stopped);
            self.inner.nosub.snapshot()
        };
        for callback in callbacks {
            callback(&cause);
        }
        true
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Live subscriptions of one connection, keyed by subscription id.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subs: Mutex<HashMap<String, SubscriptionHandle>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and track a handle in `Requested` state with a fresh id.
    pub fn create(&self, name: impl Into<String>, params: Vec<Value>) -> SubscriptionHandle {
        let id = Uuid::new_v4().simple().to_string();
        let handle = SubscriptionHandle::new(id.clone(), name.into(), params);
        lock(&self.subs).insert(id, handle.clone());
        handle
    }

    pub fn get(&self, id: &str) -> Option<SubscriptionHandle> {
        lock(&self.subs).get(id).cloned()
    }

    /// Forget a subscription without notifying it.
    pub fn remove(&self, id: &str) -> Option<SubscriptionHandle> {
        lock(&self.subs).remove(id)
    }

    /// Apply a `ready` batch. Fires `Ready` on each listed live handle that
    /// was still `Requested`; returns how many fired.
    pub fn mark_ready(&self, ids: &[String]) -> usize {
        let handles: Vec<SubscriptionHandle> = {
            let subs = lock(&self.subs);
            ids.iter().filter_map(|id| subs.get(id).cloned()).collect()
        };
        handles.iter().filter(|h| h.mark_ready()).count()
    }

    /// Apply a `nosub`. The handle leaves the registry.
    pub fn mark_stopped(&self, id: &str, error: Option<RemoteError>) -> bool {
        match self.remove(id) {
            Some(handle) => handle.mark_stopped(StopCause::Server(error)),
            None => {
                log::debug!("Ignoring nosub for unknown subscription {id}");
                false
            }
        }
    }

    /// Stop every live subscription with `cause`, leaving the registry empty.
    pub fn stop_all(&self, cause: StopCause) -> usize {
        let drained: Vec<SubscriptionHandle> =
            lock(&self.subs).drain().map(|(_, handle)| handle).collect();
        drained
            .iter()
            .filter(|handle| handle.mark_stopped(cause.clone()))
            .count()
    }

    pub fn handles(&self) -> Vec<SubscriptionHandle> {
        lock(&self.subs).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.subs).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.subs).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn count_ready(handle: &SubscriptionHandle) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        handle.on_ready(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        hits
    }

    #[test]
    fn test_create_assigns_unique_ids() {
        let registry = SubscriptionRegistry::new();
        let a = registry.create("tasks", vec![json!(1)]);
        let b = registry.create("tasks", vec![]);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.name(), "tasks");
        assert_eq!(a.params(), &[json!(1)]);
        assert_eq!(a.state(), SubscriptionState::Requested);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_ready_batch_fires_only_listed_handles() {
        let registry = SubscriptionRegistry::new();
        let a = registry.create("a", vec![]);
        let b = registry.create("b", vec![]);
        let c = registry.create("c", vec![]);
        let (ha, hb, hc) = (count_ready(&a), count_ready(&b), count_ready(&c));

        let fired = registry.mark_ready(&[a.id().to_string(), b.id().to_string(), "zzz".into()]);
        assert_eq!(fired, 2);
        assert_eq!(ha.load(Ordering::SeqCst), 1);
        assert_eq!(hb.load(Ordering::SeqCst), 1);
        assert_eq!(hc.load(Ordering::SeqCst), 0);
        assert!(a.is_ready() && b.is_ready());
        assert_eq!(c.state(), SubscriptionState::Requested);

        // A repeated ready does not fire again.
        assert_eq!(registry.mark_ready(&[a.id().to_string()]), 0);
        assert_eq!(ha.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nosub_with_error() {
        let registry = SubscriptionRegistry::new();
        let handle = registry.create("secret", vec![]);
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        handle.on_nosub(move |cause| *s.lock().unwrap() = Some(cause.clone()));

        let error = RemoteError::from_value(json!({"error": 404, "reason": "Subscription not found"}));
        assert!(registry.mark_stopped(handle.id(), Some(error.clone())));
        assert_eq!(handle.state(), SubscriptionState::Stopped);
        assert_eq!(*seen.lock().unwrap(), Some(StopCause::Server(Some(error.clone()))));
        assert_eq!(handle.stop_cause(), Some(StopCause::Server(Some(error))));
        assert!(registry.get(handle.id()).is_none());

        // Late nosub is ignored.
        assert!(!registry.mark_stopped(handle.id(), None));
    }

    #[test]
    fn test_stop_all() {
        let registry = SubscriptionRegistry::new();
        let a = registry.create("a", vec![]);
        let b = registry.create("b", vec![]);
        registry.mark_ready(&[a.id().to_string()]);

        assert_eq!(registry.stop_all(StopCause::ConnectionClosed), 2);
        assert!(registry.is_empty());
        assert_eq!(a.state(), SubscriptionState::Stopped);
        assert_eq!(b.stop_cause(), Some(StopCause::ConnectionClosed));
    }

    #[test]
    fn test_ready_after_stop_is_ignored() {
        let registry = SubscriptionRegistry::new();
        let a = registry.create("a", vec![]);
        let hits = count_ready(&a);
        registry.mark_stopped(a.id(), None);
        assert!(!a.mark_ready());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wait_ready() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let handle = registry.create("a", vec![]);
        let id = handle.id().to_string();
        let r = registry.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            r.mark_ready(&[id]);
        });
        handle.wait_ready().await.unwrap();
        assert!(handle.is_ready());
    }

    #[tokio::test]
    async fn test_wait_ready_reports_stop() {
        let registry = SubscriptionRegistry::new();
        let handle = registry.create("a", vec![]);
        registry.mark_stopped(handle.id(), None);
        assert_eq!(handle.wait_ready().await, Err(StopCause::Server(None)));
    }

    #[test]
    fn test_remove_nosub_listener_keeps_ready_listener() {
        let registry = SubscriptionRegistry::new();
        let handle = registry.create("feed", vec![]);
        let ready_hits = count_ready(&handle);
        let nosub_hits = Arc::new(AtomicUsize::new(0));
        let n = nosub_hits.clone();
        let nosub_id = handle.on_nosub(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        });

        assert!(handle.remove_listener(nosub_id));
        assert!(!handle.remove_listener(nosub_id));

        registry.mark_ready(&[handle.id().to_string()]);
        registry.mark_stopped(handle.id(), None);
        assert_eq!(ready_hits.load(Ordering::SeqCst), 1);
        assert_eq!(nosub_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_ids_distinct_across_kinds() {
        let registry = SubscriptionRegistry::new();
        let handle = registry.create("feed", vec![]);
        let ready_id = handle.on_ready(|_| {});
        let nosub_id = handle.on_nosub(|_| {});
        assert_ne!(ready_id, nosub_id);
    }

    #[test]
    fn test_late_listeners_fire_immediately() {
        let registry = SubscriptionRegistry::new();
        let handle = registry.create("feed", vec![]);
        registry.mark_ready(&[handle.id().to_string()]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        handle.on_ready(move |id| s.lock().unwrap().push(id.to_string()));
        assert_eq!(*seen.lock().unwrap(), vec![handle.id().to_string()]);

        registry.stop_all(StopCause::ConnectionClosed);
        let cause = Arc::new(Mutex::new(None));
        let c = cause.clone();
        handle.on_nosub(move |stop| *c.lock().unwrap() = Some(stop.clone()));
        assert_eq!(*cause.lock().unwrap(), Some(StopCause::ConnectionClosed));
        // Registered before the stop; the ready listener did not fire again.
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
