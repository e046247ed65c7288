//! `Object`: a keyed record whose values are either inline scalars or child
//! nodes, with per-key last-writer-wins conflict resolution (§4.3).
use crate::doc::Document;
use crate::error::Result;
use crate::id::{Id, OpId};
use crate::node::{Content, ObjectEntry};
use crate::op::Value;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Default)]
pub(crate) struct ObjectData {
    pub entries: BTreeMap<String, ObjectEntry>,
    /// `key -> opId` of the last locally-originated write still awaiting
    /// acknowledgement. Used to suppress the echo of our own update and to
    /// arbitrate against a concurrently-arriving remote write (§4.3).
    pub prop_to_last_update: HashMap<String, OpId>,
}

impl ObjectData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&ObjectEntry> {
        self.entries.get(key)
    }

    /// Applies one key of a (local or remote) `UpdateObject` op, returning
    /// whether it changed anything.
    ///
    /// `local` means this application is replaying our own change — either
    /// the op already carries one of our [`OpId`]s, or it carries none at
    /// all (the legacy path §9 calls out: an op with no `opId` is always
    /// treated as local, which is also why a local `set`/`update` must
    /// always mint an `opId`, even for scalar-only writes, so this path is
    /// never silently taken for a genuinely remote op).
    pub fn apply_update(&mut self, key: &str, value: &Value, op_id: OpId, local: bool) -> bool {
        if local {
            self.prop_to_last_update.insert(key.to_owned(), op_id);
            self.entries
                .insert(key.to_owned(), ObjectEntry::Scalar(value.clone()));
            return true;
        }
        match self.prop_to_last_update.get(key) {
            None => {
                self.entries
                    .insert(key.to_owned(), ObjectEntry::Scalar(value.clone()));
                true
            }
            Some(pending) if *pending == op_id => {
                // Acknowledgement of our own pending write: clear it, no state change.
                self.prop_to_last_update.remove(key);
                false
            }
            Some(_) => {
                // A different local write is still pending on this key; the
                // remote value loses.
                false
            }
        }
    }

    /// Removes a key unconditionally, returning the prior entry if any.
    pub fn remove(&mut self, key: &str) -> Option<ObjectEntry> {
        self.prop_to_last_update.remove(key);
        self.entries.remove(key)
    }
}

/// A handle onto one `Object` node, borrowed from its owning [`Document`].
pub struct Object<'a> {
    doc: &'a mut Document,
    id: Id,
}

impl<'a> Object<'a> {
    pub(crate) fn new(doc: &'a mut Document, id: Id) -> Self {
        Self { doc, id }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// The scalar value stored inline at `key`, if any. Returns `None` both
    /// for a missing key and for a key holding a node value — use
    /// [`Object::child`] to read those.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self.doc.object_data(self.id).ok()?.get(key)? {
            ObjectEntry::Scalar(v) => Some(v),
            ObjectEntry::Node(_) => None,
        }
    }

    /// The id of the child node stored at `key`, if `key` holds one.
    pub fn child(&self, key: &str) -> Option<Id> {
        match self.doc.object_data(self.id).ok()?.get(key)? {
            ObjectEntry::Node(id) => Some(*id),
            ObjectEntry::Scalar(_) => None,
        }
    }

    /// Sets a single key to a scalar or a freshly-built node.
    pub fn set(self, key: impl Into<String>, value: impl Into<Content>) -> Result<()> {
        let mut partial = BTreeMap::new();
        partial.insert(key.into(), value.into());
        self.doc.object_update(self.id, partial)
    }

    /// Sets every key in `partial` as one coalesced change: the scalar keys
    /// share a single `opId`, each node-valued key gets its own `Create*`
    /// sequence (§4.3).
    pub fn update(self, partial: BTreeMap<String, Content>) -> Result<()> {
        self.doc.object_update(self.id, partial)
    }

    /// Removes `key`, deleting its subtree if it held a node.
    pub fn delete(self, key: &str) -> Result<()> {
        self.doc.object_delete_key(self.id, key)
    }

    /// Materializes this object (and every node-valued descendant) into a
    /// plain JSON object.
    pub fn to_object(&self) -> serde_json::Map<String, Value> {
        match self.doc.to_json(self.id) {
            Value::Object(map) => map,
            _ => unreachable!("an Object node always materializes to a JSON object"),
        }
    }
}
