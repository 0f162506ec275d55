//! Collection Sync Engine.
//!
//! Routes the five diff events to the observers registered for the
//! envelope's `collection`:
//!
//! ```text
//! added / addedBefore / changed / removed / movedBefore
//!       │
//!       ▼
//! collection name ──► [observer 1, observer 2, ...]   (registration order)
//! ```
//!
//! Events for a collection with no observers are dropped before their body
//! is decoded. Delivery is synchronous, so the order of events for one
//! collection is exactly the order the transport handed them over. The
//! engine keeps no document state; see [`crate::cache`] for that.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::listeners::{read, write};
use crate::protocol::{
    AddedBeforeMessage, AddedMessage, ChangedMessage, Envelope, MessageKind, MovedBeforeMessage,
    ProtocolError, RemovedMessage,
};

/// Field the document id is merged into before decoding.
pub const ID_FIELD: &str = "_id";

/// Partial update carried by a `changed` event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldChanges {
    /// New values for changed fields.
    pub fields: Map<String, Value>,
    /// Names of fields that were removed from the document.
    pub cleared: Vec<String>,
}

/// Receiver of diff events for one collection, decoding documents as `T`.
///
/// Every method defaults to a no-op, so an observer implements only the
/// events it cares about.
pub trait CollectionObserver<T>: Send + Sync {
    fn on_added(&self, _id: &str, _document: T) {}

    /// `before` is `None` when the document goes at the end.
    fn on_added_before(&self, _id: &str, _document: T, _before: Option<&str>) {}

    fn on_changed(&self, _id: &str, _changes: &FieldChanges) {}

    fn on_removed(&self, _id: &str) {}

    fn on_moved_before(&self, _id: &str, _before: Option<&str>) {}
}

/// A decoded diff event.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionDiff {
    Added {
        id: String,
        document: Value,
    },
    AddedBefore {
        id: String,
        document: Value,
        before: Option<String>,
    },
    Changed {
        id: String,
        changes: FieldChanges,
    },
    Removed {
        id: String,
    },
    MovedBefore {
        id: String,
        before: Option<String>,
    },
}

impl CollectionDiff {
    /// Decode a diff envelope into the collection name and the event.
    pub fn from_envelope(envelope: &Envelope) -> Result<(String, Self), ProtocolError> {
        let decoded = match envelope.kind {
            MessageKind::Added => {
                let m: AddedMessage = envelope.decode()?;
                let document = document_with_id(&m.id, m.fields);
                (m.collection, Self::Added { id: m.id, document })
            }
            MessageKind::AddedBefore => {
                let m: AddedBeforeMessage = envelope.decode()?;
                let document = document_with_id(&m.id, m.fields);
                (
                    m.collection,
                    Self::AddedBefore {
                        id: m.id,
                        document,
                        before: m.before,
                    },
                )
            }
            MessageKind::Changed => {
                let m: ChangedMessage = envelope.decode()?;
                let changes = FieldChanges {
                    fields: m.fields.unwrap_or_default(),
                    cleared: m.cleared.unwrap_or_default(),
                };
                (m.collection, Self::Changed { id: m.id, changes })
            }
            MessageKind::Removed => {
                let m: RemovedMessage = envelope.decode()?;
                (m.collection, Self::Removed { id: m.id })
            }
            MessageKind::MovedBefore => {
                let m: MovedBeforeMessage = envelope.decode()?;
                (
                    m.collection,
                    Self::MovedBefore {
                        id: m.id,
                        before: m.before,
                    },
                )
            }
            other => {
                return Err(ProtocolError::Decode {
                    kind: other,
                    reason: "not a collection diff".to_string(),
                })
            }
        };
        Ok(decoded)
    }
}

/// Build the document object for an insert, with `id` stored in `_id`.
pub fn document_with_id(id: &str, fields: Option<Map<String, Value>>) -> Value {
    let mut fields = fields.unwrap_or_default();
    fields.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    Value::Object(fields)
}

/// Handle returned by [`CollectionSyncEngine::register_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Type-erased observer entry.
trait DiffSink: Send + Sync {
    fn deliver(&self, collection: &str, diff: &CollectionDiff);
}

struct TypedSink<T, O: ?Sized> {
    observer: Arc<O>,
    _document: PhantomData<fn() -> T>,
}

impl<T, O> TypedSink<T, O>
where
    T: DeserializeOwned,
    O: CollectionObserver<T> + ?Sized,
{
    fn decode(collection: &str, id: &str, document: &Value) -> Option<T> {
        match <T as serde::Deserialize>::deserialize(document) {
            Ok(doc) => Some(doc),
            Err(e) => {
                log::warn!("Skipping observer: cannot decode {collection}/{id}: {e}");
                None
            }
        }
    }
}

impl<T, O> DiffSink for TypedSink<T, O>
where
    T: DeserializeOwned,
    O: CollectionObserver<T> + ?Sized,
{
    fn deliver(&self, collection: &str, diff: &CollectionDiff) {
        match diff {
            CollectionDiff::Added { id, document } => {
                if let Some(doc) = Self::decode(collection, id, document) {
                    self.observer.on_added(id, doc);
                }
            }
            CollectionDiff::AddedBefore {
                id,
                document,
                before,
            } => {
                if let Some(doc) = Self::decode(collection, id, document) {
                    self.observer.on_added_before(id, doc, before.as_deref());
                }
            }
            CollectionDiff::Changed { id, changes } => self.observer.on_changed(id, changes),
            CollectionDiff::Removed { id } => self.observer.on_removed(id),
            CollectionDiff::MovedBefore { id, before } => {
                self.observer.on_moved_before(id, before.as_deref())
            }
        }
    }
}

type Entry = (ObserverId, Arc<dyn DiffSink>);

/// Per-collection observer lists.
///
/// The engine holds observers; observers never hold the engine.
#[derive(Default)]
pub struct CollectionSyncEngine {
    next_id: AtomicU64,
    observers: RwLock<HashMap<String, Vec<Entry>>>,
}

impl CollectionSyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer` for `collection`. Observers of the same
    /// collection are notified in registration order.
    pub fn register_observer<T, O>(&self, collection: impl Into<String>, observer: Arc<O>) -> ObserverId
    where
        T: DeserializeOwned + 'static,
        O: CollectionObserver<T> + ?Sized + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let sink: Arc<dyn DiffSink> = Arc::new(TypedSink::<T, O> {
            observer,
            _document: PhantomData,
        });
        write(&self.observers)
            .entry(collection.into())
            .or_default()
            .push((id, sink));
        id
    }

    /// Stop delivering to `id`. Returns whether it was registered.
    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        let mut observers = write(&self.observers);
        let mut removed = false;
        observers.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|(entry_id, _)| *entry_id != id);
            removed |= entries.len() != before;
            !entries.is_empty()
        });
        removed
    }

    pub fn observer_count(&self, collection: &str) -> usize {
        read(&self.observers).get(collection).map_or(0, Vec::len)
    }

    pub fn has_observers(&self, collection: &str) -> bool {
        self.observer_count(collection) > 0
    }

    /// Route one diff envelope. Returns how many observers received it.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let Some(collection) = envelope.str_field("collection") else {
            log::debug!("Dropping {} without collection", envelope.kind);
            return 0;
        };

        let snapshot: Vec<Arc<dyn DiffSink>> = match read(&self.observers).get(collection) {
            Some(entries) => entries.iter().map(|(_, sink)| sink.clone()).collect(),
            None => {
                log::trace!("No observers for {collection}; dropping {}", envelope.kind);
                return 0;
            }
        };

        let diff = match CollectionDiff::from_envelope(envelope) {
            Ok((_, diff)) => diff,
            Err(e) => {
                log::warn!("Dropping malformed diff for {collection}: {e}");
                return 0;
            }
        };

        for sink in &snapshot {
            sink.deliver(collection, &diff);
        }
        snapshot.len()
    }
}
