//! In-memory copy of one collection, kept up to date by diff events.
//!
//! Register a [`CollectionCache`] as an observer and it applies every
//! `added`/`addedBefore`/`changed`/`removed`/`movedBefore` it receives.
//! Document order follows insertion, with `addedBefore` and `movedBefore`
//! placing a document ahead of another one.

use std::sync::RwLock;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::collections::{CollectionObserver, FieldChanges};
use crate::listeners::{read, write};

pub struct CollectionCache {
    name: String,
    docs: RwLock<IndexMap<String, Map<String, Value>>>,
}

impl CollectionCache {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docs: RwLock::new(IndexMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        read(&self.docs).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.docs).is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        read(&self.docs).contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        read(&self.docs).get(id).cloned().map(Value::Object)
    }

    /// Decode one document. `None` if absent or not decodable as `T`.
    pub fn get_as<T: DeserializeOwned>(&self, id: &str) -> Option<T> {
        let docs = read(&self.docs);
        let fields = docs.get(id)?;
        T::deserialize(&Value::Object(fields.clone())).ok()
    }

    /// Document ids in collection order.
    pub fn ids(&self) -> Vec<String> {
        read(&self.docs).keys().cloned().collect()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        read(&self.docs).get_index_of(id)
    }

    /// Every document, in collection order.
    pub fn documents(&self) -> Vec<Value> {
        read(&self.docs)
            .values()
            .cloned()
            .map(Value::Object)
            .collect()
    }

    pub fn clear(&self) {
        write(&self.docs).clear();
    }

    fn insert_before(&self, id: &str, fields: Map<String, Value>, before: Option<&str>) {
        let mut docs = write(&self.docs);
        docs.shift_remove(id);
        let index = before
            .and_then(|b| docs.get_index_of(b))
            .unwrap_or(docs.len());
        docs.shift_insert(index, id.to_string(), fields);
    }
}

fn into_fields(document: Value) -> Map<String, Value> {
    match document {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl CollectionObserver<Value> for CollectionCache {
    fn on_added(&self, id: &str, document: Value) {
        // Re-adding an id replaces its fields but keeps its position.
        write(&self.docs).insert(id.to_string(), into_fields(document));
    }

    fn on_added_before(&self, id: &str, document: Value, before: Option<&str>) {
        self.insert_before(id, into_fields(document), before);
    }

    fn on_changed(&self, id: &str, changes: &FieldChanges) {
        let mut docs = write(&self.docs);
        let Some(doc) = docs.get_mut(id) else {
            log::debug!("{}: changed for unknown document {id}", self.name);
            return;
        };
        for (key, value) in &changes.fields {
            doc.insert(key.clone(), value.clone());
        }
        for key in &changes.cleared {
            doc.remove(key);
        }
    }

    fn on_removed(&self, id: &str) {
        write(&self.docs).shift_remove(id);
    }

    fn on_moved_before(&self, id: &str, before: Option<&str>) {
        let fields = match write(&self.docs).shift_remove(id) {
            Some(fields) => fields,
            None => {
                log::debug!("{}: movedBefore for unknown document {id}", self.name);
                return;
            }
        };
        self.insert_before(id, fields, before);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, n: i64) -> Value {
        json!({"_id": id, "n": n})
    }

    #[test]
    fn test_added_appends() {
        let cache = CollectionCache::new("items");
        cache.on_added("a", doc("a", 1));
        cache.on_added("b", doc("b", 2));
        assert_eq!(cache.ids(), vec!["a", "b"]);
        assert_eq!(cache.get("b"), Some(doc("b", 2)));
        assert_eq!(cache.name(), "items");
    }

    #[test]
    fn test_added_before_positions() {
        let cache = CollectionCache::new("items");
        cache.on_added_before("c", doc("c", 3), None);
        cache.on_added_before("a", doc("a", 1), Some("c"));
        cache.on_added_before("b", doc("b", 2), Some("c"));
        assert_eq!(cache.ids(), vec!["a", "b", "c"]);
        // Unknown anchor appends.
        cache.on_added_before("d", doc("d", 4), Some("zzz"));
        assert_eq!(cache.position("d"), Some(3));
    }

    #[test]
    fn test_moved_before() {
        let cache = CollectionCache::new("items");
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            cache.on_added_before(id, doc(id, i as i64), None);
        }
        cache.on_moved_before("c", Some("a"));
        assert_eq!(cache.ids(), vec!["c", "a", "b"]);
        cache.on_moved_before("c", None);
        assert_eq!(cache.ids(), vec!["a", "b", "c"]);
        cache.on_moved_before("missing", Some("a"));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_changed_merges_and_clears() {
        let cache = CollectionCache::new("items");
        cache.on_added("a", json!({"_id": "a", "n": 1, "tag": "x"}));

        let mut fields = Map::new();
        fields.insert("n".into(), json!(5));
        fields.insert("extra".into(), json!(true));
        cache.on_changed(
            "a",
            &FieldChanges {
                fields,
                cleared: vec!["tag".into()],
            },
        );
        assert_eq!(cache.get("a"), Some(json!({"_id": "a", "n": 5, "extra": true})));

        // Changes for unknown ids are ignored.
        cache.on_changed("zzz", &FieldChanges::default());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_removed() {
        let cache = CollectionCache::new("items");
        cache.on_added("a", doc("a", 1));
        cache.on_added("b", doc("b", 2));
        cache.on_removed("a");
        assert!(!cache.contains("a"));
        assert_eq!(cache.documents(), vec![doc("b", 2)]);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_get_as() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Item {
            #[serde(rename = "_id")]
            id: String,
            n: i64,
        }
        let cache = CollectionCache::new("items");
        cache.on_added("a", doc("a", 9));
        assert_eq!(
            cache.get_as::<Item>("a"),
            Some(Item {
                id: "a".into(),
                n: 9
            })
        );
        assert_eq!(cache.get_as::<Item>("b"), None);
    }
}
