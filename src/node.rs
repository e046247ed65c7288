//! The node contract shared by all four variants (§4.2) and the small
//! vocabulary ([`Content`], [`NodeLink`]) the arena in
//! [`crate::doc::Document`] and the per-variant modules build on.
use crate::id::Id;
use crate::op::{Data, Value};
use std::collections::BTreeMap;

/// A value to attach under a `Map`/`List` slot, or as a node-valued entry of
/// an `Object`: either an opaque scalar (auto-wrapped in a [`Register`] when
/// attached under Map/List) or the shape of a fresh container node, whose
/// own entries may recursively be scalars or further containers (§3
/// Lifecycle: "a node constructed with child nodes attaches them
/// recursively").
///
/// [`Register`]: crate::register::RegisterData
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Scalar(Value),
    Object(BTreeMap<String, Content>),
    Map(BTreeMap<String, Content>),
    List(Vec<Content>),
}

macro_rules! impl_scalar_content {
    ($($t:ty),* $(,)?) => {
        $(
            impl From<$t> for Content {
                fn from(v: $t) -> Self {
                    Content::Scalar(Value::from(v))
                }
            }
        )*
    };
}

impl_scalar_content!(bool, i64, u64, f64, String);

impl From<&str> for Content {
    fn from(v: &str) -> Self {
        Content::Scalar(Value::from(v))
    }
}

impl From<Value> for Content {
    fn from(v: Value) -> Self {
        Content::Scalar(v)
    }
}

/// Where an attached node sits in the tree: its parent's id and the key it
/// is stored under there (a plain string for Object/Map, a position's
/// string form for List). `None` for both iff this is the document root.
#[derive(Debug, Clone)]
pub(crate) struct NodeLink {
    pub parent: Option<Id>,
    pub parent_key: Option<String>,
}

impl NodeLink {
    pub fn root() -> Self {
        Self {
            parent: None,
            parent_key: None,
        }
    }

    pub fn child(parent: Id, key: String) -> Self {
        Self {
            parent: Some(parent),
            parent_key: Some(key),
        }
    }
}

/// An entry in an `Object`'s data dictionary: a scalar stored inline (no
/// identity) or a reference to a node child (§3: "A scalar value in Object
/// is not a node and has no identity").
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ObjectEntry {
    Scalar(Value),
    Node(Id),
}

pub(crate) fn data_to_object_entries(data: &Data) -> BTreeMap<String, ObjectEntry> {
    data.iter()
        .map(|(k, v)| (k.clone(), ObjectEntry::Scalar(v.clone())))
        .collect()
}
