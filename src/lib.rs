//! A client-side collaborative data tree.
//!
//! A [`Document`] is an id-addressed arena of four node kinds — `Object`,
//! `Map`, `List`, and `Register` — mutated through handle types borrowed by
//! id ([`Object`](object::Object), [`Map`](map::Map), [`List`](list::List)).
//! Every mutation produces both a forward operation, broadcast to other
//! replicas, and a reverse operation, pushed onto an undo stack; applying a
//! batch of operations received from a peer never touches that stack.
//!
//! Conflicts are resolved per variant: `Object` keys use last-writer-wins
//! arbitrated by an acknowledgement scheme (§4.3), `List` positions are
//! drawn from a dense order that never needs renumbering (§4.1), and `Map`
//! entries are simply overwritten.
//!
//! ```
//! use collab_tree::{Content, Document};
//! use std::collections::BTreeMap;
//!
//! let mut fields = BTreeMap::new();
//! fields.insert("title".to_string(), Content::from("hello"));
//! let mut doc = Document::from(fields, 1, |_ops| {});
//! let root = doc.root();
//! doc.object(root).unwrap().set("title", "world").unwrap();
//! assert_eq!(doc.object(root).unwrap().get("title").unwrap(), "world");
//! ```
mod doc;
mod error;
mod id;
mod list;
mod map;
mod node;
mod object;
mod op;
mod position;
mod register;
mod subscriber;

pub use crate::doc::Document;
pub use crate::error::{Error, Result};
pub use crate::id::{Actor, Clock, Id, OpId, ParseIdError};
pub use crate::list::List;
pub use crate::map::Map;
pub use crate::node::Content;
pub use crate::op::{
    Data, NodeData, NodeKind, Op, SerializedNode, SerializedRecord, Value,
};
pub use crate::object::Object;
pub use crate::position::{compare, make_position, ParsePositionError, Position};
pub use crate::subscriber::Disposer;
