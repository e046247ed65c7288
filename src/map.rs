//! `Map`: a keyed container whose values are always child nodes, scalars
//! auto-wrapped in a `Register` (§4.4).
use crate::doc::Document;
use crate::error::Result;
use crate::id::Id;
use crate::node::Content;
use crate::op::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub(crate) struct MapData {
    pub entries: BTreeMap<String, Id>,
}

impl MapData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Id> {
        self.entries.get(key).copied()
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Replaces (or inserts) the child id at `key`, returning the id that
    /// was there before, if any, so the caller can detach its subtree.
    pub fn set(&mut self, key: impl Into<String>, id: Id) -> Option<Id> {
        self.entries.insert(key.into(), id)
    }

    /// Removes `key`, returning its child id if present.
    pub fn delete(&mut self, key: &str) -> Option<Id> {
        self.entries.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Id)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// A handle onto one `Map` node, borrowed from its owning [`Document`].
pub struct Map<'a> {
    doc: &'a mut Document,
    id: Id,
}

impl<'a> Map<'a> {
    pub(crate) fn new(doc: &'a mut Document, id: Id) -> Self {
        Self { doc, id }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn has(&self, key: &str) -> bool {
        self.doc.map_data(self.id).map(|m| m.has(key)).unwrap_or(false)
    }

    pub fn size(&self) -> usize {
        self.doc.map_data(self.id).map(|m| m.size()).unwrap_or(0)
    }

    /// The id of the child stored at `key`, if any.
    pub fn child(&self, key: &str) -> Option<Id> {
        self.doc.map_data(self.id).ok()?.get(key)
    }

    /// Every `(key, child id)` entry, in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Id)> + '_ {
        self.doc
            .map_data(self.id)
            .ok()
            .into_iter()
            .flat_map(|m| m.iter())
    }

    /// Runs `f` over every `(key, child id)` entry, in key order.
    pub fn for_each(&self, mut f: impl FnMut(&str, Id)) {
        for (key, id) in self.iter() {
            f(key, id);
        }
    }

    /// Sets `key` to a scalar (auto-wrapped in a `Register`) or a freshly
    /// built node, detaching whatever was there before.
    pub fn set(self, key: impl Into<String>, value: impl Into<Content>) -> Result<()> {
        self.doc.map_set(self.id, key.into(), value.into())
    }

    /// Removes `key` and its subtree.
    pub fn delete(self, key: &str) -> Result<()> {
        self.doc.map_delete(self.id, key)
    }

    /// Materializes every entry into a plain JSON object.
    pub fn to_object(&self) -> serde_json::Map<String, Value> {
        match self.doc.to_json(self.id) {
            Value::Object(map) => map,
            _ => unreachable!("a Map node always materializes to a JSON object"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_returns_previous_child() {
        let mut m = MapData::new();
        assert_eq!(m.set("a", Id::new(0, 1)), None);
        assert_eq!(m.set("a", Id::new(0, 2)), Some(Id::new(0, 1)));
        assert_eq!(m.get("a"), Some(Id::new(0, 2)));
    }

    #[test]
    fn delete_removes_and_returns_child() {
        let mut m = MapData::new();
        m.set("a", Id::new(0, 1));
        assert_eq!(m.delete("a"), Some(Id::new(0, 1)));
        assert!(!m.has("a"));
        assert_eq!(m.delete("a"), None);
    }

    #[test]
    fn size_tracks_entry_count() {
        let mut m = MapData::new();
        m.set("a", Id::new(0, 1));
        m.set("b", Id::new(0, 2));
        assert_eq!(m.size(), 2);
    }
}
