//! Wire format: the operation tagged union and the serialized-node record
//! format used by [`crate::doc::Document::load`] (§6).
use crate::id::{Id, OpId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An opaque, JSON-serializable leaf value.
pub type Value = serde_json::Value;

/// An ordered dictionary of scalar values, as carried by `CreateObject` and
/// `UpdateObject`.
pub type Data = BTreeMap<String, Value>;

/// A single change to the tree, as broadcast to peers or replayed from the
/// undo/redo stacks. See the wire format table in §6.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Op {
    CreateObject {
        id: Id,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        parent_id: Option<Id>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        parent_key: Option<String>,
        data: Data,
    },
    CreateMap {
        id: Id,
        parent_id: Id,
        parent_key: String,
    },
    CreateList {
        id: Id,
        parent_id: Id,
        parent_key: String,
    },
    CreateRegister {
        id: Id,
        parent_id: Id,
        parent_key: String,
        data: Value,
    },
    UpdateObject {
        id: Id,
        data: Data,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        op_id: Option<OpId>,
    },
    DeleteObjectKey {
        id: Id,
        key: String,
    },
    DeleteCrdt {
        id: Id,
    },
    SetParentKey {
        id: Id,
        parent_key: String,
    },
}

impl Op {
    /// The id of the node this operation is ultimately addressed at: the
    /// node itself for update/delete/reparent ops, or the parent for
    /// creation ops (§4.7 routing table).
    pub fn target(&self) -> Id {
        match self {
            Op::CreateObject { id, parent_id, .. } => parent_id.unwrap_or(*id),
            Op::CreateMap { parent_id, .. }
            | Op::CreateList { parent_id, .. }
            | Op::CreateRegister { parent_id, .. } => *parent_id,
            Op::UpdateObject { id, .. }
            | Op::DeleteObjectKey { id, .. }
            | Op::DeleteCrdt { id }
            | Op::SetParentKey { id, .. } => *id,
        }
    }

    /// The id of the node a creation op attaches, if this is a creation op.
    pub fn created_id(&self) -> Option<Id> {
        match self {
            Op::CreateObject { id, .. }
            | Op::CreateMap { id, .. }
            | Op::CreateList { id, .. }
            | Op::CreateRegister { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// The tag identifying a node's variant, used by the serialized-node record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Object,
    Map,
    List,
    Register,
}

/// The payload of a serialized node record, present only for `Object`
/// (its scalar data dictionary) and `Register` (its single scalar).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeData {
    Object(Data),
    Scalar(Value),
}

/// A single entry of [`crate::doc::Document::load`]'s input: an id paired
/// with the node's serialized shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedNode {
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_id: Option<Id>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<NodeData>,
}

/// A `(id, serialized node)` pair, the unit [`crate::doc::Document::load`]
/// consumes a flat list of.
pub type SerializedRecord = (Id, SerializedNode);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_object_round_trips_through_json() {
        let op = Op::CreateObject {
            id: Id::new(0, 0),
            parent_id: None,
            parent_key: None,
            data: Data::new(),
        };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"type\":\"CreateObject\""));
        let back: Op = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn target_routes_creation_ops_to_parent() {
        let op = Op::CreateMap {
            id: Id::new(0, 1),
            parent_id: Id::new(0, 0),
            parent_key: "k".into(),
        };
        assert_eq!(op.target(), Id::new(0, 0));
        assert_eq!(op.created_id(), Some(Id::new(0, 1)));
    }

    #[test]
    fn target_routes_update_ops_to_self() {
        let op = Op::DeleteCrdt { id: Id::new(2, 5) };
        assert_eq!(op.target(), Id::new(2, 5));
        assert_eq!(op.created_id(), None);
    }
}
