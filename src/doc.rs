//! [`Document`]: the arena that owns every node, mints identities, and
//! drives dispatch, undo/redo, and subscriber notification (§4.7, §9).
use crate::error::{Error, Result};
use crate::id::{Actor, Id, Minter, OpId};
use crate::list::ListData;
use crate::map::MapData;
use crate::node::{data_to_object_entries, Content, NodeLink, ObjectEntry};
use crate::object::ObjectData;
use crate::op::{Data, NodeData, NodeKind, Op, SerializedNode, SerializedRecord, Value};
use crate::position::Position;
use crate::register::RegisterData;
use crate::subscriber::{self, Disposer, SubscriberBus};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

/// Undo/redo stacks never grow past this many entries; the oldest is
/// evicted to make room for a new one (§9).
const HISTORY_LIMIT: usize = 50;

pub(crate) enum NodeVariant {
    Object(ObjectData),
    Map(MapData),
    List(ListData),
    Register(RegisterData),
}

impl NodeVariant {
    pub(crate) fn kind(&self) -> NodeKind {
        match self {
            NodeVariant::Object(_) => NodeKind::Object,
            NodeVariant::Map(_) => NodeKind::Map,
            NodeVariant::List(_) => NodeKind::List,
            NodeVariant::Register(_) => NodeKind::Register,
        }
    }
}

struct NodeEntry {
    link: NodeLink,
    variant: NodeVariant,
}

#[derive(Default)]
struct BatchState {
    forward: Vec<Op>,
    reverse: Vec<Op>,
    modified: Vec<Id>,
}

fn singleton(key: String, value: Value) -> Data {
    let mut data = Data::new();
    data.insert(key, value);
    data
}

fn push_unique(modified: &mut Vec<Id>, id: Id) {
    if !modified.contains(&id) {
        modified.push(id);
    }
}

/// A client-side collaborative data tree: an id-addressed arena of
/// [`crate::node`] variants, with local mutation, remote-operation
/// application, batching, and undo/redo (§4.7).
pub struct Document {
    actor: Actor,
    nodes: HashMap<Id, NodeEntry>,
    root: Id,
    id_minter: Minter,
    op_minter: Minter,
    broadcast: Box<dyn FnMut(Vec<Op>)>,
    bus: Rc<RefCell<SubscriberBus>>,
    undo_stack: VecDeque<Vec<Op>>,
    redo_stack: Vec<Vec<Op>>,
    batch: Option<BatchState>,
}

impl Document {
    /// Builds a fresh document whose root is an `Object` built from `fields`,
    /// minting the whole subtree and broadcasting its creation.
    pub fn from(
        fields: BTreeMap<String, Content>,
        actor: Actor,
        broadcast: impl FnMut(Vec<Op>) + 'static,
    ) -> Self {
        let mut doc = Self {
            actor,
            nodes: HashMap::new(),
            root: Id::new(actor, 0),
            id_minter: Minter::new(actor),
            op_minter: Minter::new(actor),
            broadcast: Box::new(broadcast),
            bus: SubscriberBus::new(),
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            batch: None,
        };
        let root = doc.id_minter.mint();
        doc.root = root;
        let mut entries = BTreeMap::new();
        let mut data = Data::new();
        let mut node_fields = Vec::new();
        for (key, content) in fields {
            match content {
                Content::Scalar(value) => {
                    entries.insert(key.clone(), ObjectEntry::Scalar(value.clone()));
                    data.insert(key, value);
                }
                other => node_fields.push((key, other)),
            }
        }
        let mut ops = vec![Op::CreateObject {
            id: root,
            parent_id: None,
            parent_key: None,
            data,
        }];
        for (key, content) in node_fields {
            let (child_id, child_ops) = doc.attach_content(content, root, key.clone());
            entries.insert(key, ObjectEntry::Node(child_id));
            ops.extend(child_ops);
        }
        doc.nodes.insert(
            root,
            NodeEntry {
                link: NodeLink::root(),
                variant: NodeVariant::Object(ObjectData {
                    entries,
                    prop_to_last_update: HashMap::new(),
                }),
            },
        );
        (doc.broadcast)(ops);
        doc
    }

    /// Rebuilds a document from a flat list of serialized node records,
    /// e.g. as produced by persistence or an initial sync payload (§6).
    pub fn load(
        records: Vec<SerializedRecord>,
        actor: Actor,
        broadcast: impl FnMut(Vec<Op>) + 'static,
    ) -> Result<Self> {
        if records.is_empty() {
            tracing::error!("load: rejected, record set is empty");
            return Err(Error::EmptyLoad);
        }
        let roots: Vec<&SerializedRecord> =
            records.iter().filter(|(_, n)| n.parent_id.is_none()).collect();
        if roots.len() != 1 {
            tracing::error!("load: rejected, found {} rootless records, expected 1", roots.len());
            return Err(Error::NotExactlyOneRoot(roots.len()));
        }
        let root = roots[0].0;

        let mut doc = Self {
            actor,
            nodes: HashMap::new(),
            root,
            id_minter: Minter::new(actor),
            op_minter: Minter::new(actor),
            broadcast: Box::new(broadcast),
            bus: SubscriberBus::new(),
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            batch: None,
        };

        let mut highest_own_clock: Option<u64> = None;
        for (id, node) in &records {
            if id.actor() == actor {
                highest_own_clock = Some(highest_own_clock.map_or(id.clock(), |c| c.max(id.clock())));
            }
            if node.parent_id.is_some() && node.parent_key.is_none() {
                return Err(Error::MissingParentKey);
            }
            let variant = match node.kind {
                NodeKind::Object => {
                    let data = match &node.data {
                        Some(NodeData::Object(d)) => d.clone(),
                        None => Data::new(),
                        _ => return Err(Error::MalformedRecord),
                    };
                    NodeVariant::Object(ObjectData {
                        entries: data_to_object_entries(&data),
                        prop_to_last_update: HashMap::new(),
                    })
                }
                NodeKind::Map => NodeVariant::Map(MapData::new()),
                NodeKind::List => NodeVariant::List(ListData::new()),
                NodeKind::Register => {
                    let value = match &node.data {
                        Some(NodeData::Scalar(v)) => v.clone(),
                        _ => return Err(Error::MalformedRecord),
                    };
                    NodeVariant::Register(RegisterData::new(value))
                }
            };
            let link = match (node.parent_id, &node.parent_key) {
                (Some(parent), Some(key)) => NodeLink::child(parent, key.clone()),
                _ => NodeLink::root(),
            };
            doc.nodes.insert(*id, NodeEntry { link, variant });
        }
        // continue minting past the highest id we already own, so newly
        // attached nodes never collide with ones restored from the load
        if let Some(clock) = highest_own_clock {
            for _ in 0..=clock {
                doc.id_minter.mint();
            }
        }

        for (id, node) in &records {
            let (Some(parent), Some(key)) = (node.parent_id, node.parent_key.clone()) else {
                continue;
            };
            let parent_entry = doc.nodes.get_mut(&parent).ok_or(Error::MalformedRecord)?;
            match &mut parent_entry.variant {
                NodeVariant::Object(o) => {
                    o.entries.insert(key, ObjectEntry::Node(*id));
                }
                NodeVariant::Map(m) => {
                    m.entries.insert(key, *id);
                }
                NodeVariant::List(l) => {
                    let position: Position = key.parse().map_err(|_| Error::MalformedRecord)?;
                    l.insert_sorted(position, *id);
                }
                NodeVariant::Register(_) => return Err(Error::MalformedRecord),
            }
        }
        Ok(doc)
    }

    pub fn root(&self) -> Id {
        self.root
    }

    pub fn actor(&self) -> Actor {
        self.actor
    }

    pub(crate) fn object_data(&self, id: Id) -> Result<&ObjectData> {
        match self.nodes.get(&id).map(|e| &e.variant) {
            Some(NodeVariant::Object(o)) => Ok(o),
            Some(_) => Err(Error::WrongKind),
            None => Err(Error::NotFound),
        }
    }

    pub(crate) fn map_data(&self, id: Id) -> Result<&MapData> {
        match self.nodes.get(&id).map(|e| &e.variant) {
            Some(NodeVariant::Map(m)) => Ok(m),
            Some(_) => Err(Error::WrongKind),
            None => Err(Error::NotFound),
        }
    }

    pub(crate) fn list_data(&self, id: Id) -> Result<&ListData> {
        match self.nodes.get(&id).map(|e| &e.variant) {
            Some(NodeVariant::List(l)) => Ok(l),
            Some(_) => Err(Error::WrongKind),
            None => Err(Error::NotFound),
        }
    }

    pub(crate) fn register_value(&self, id: Id) -> Result<&Value> {
        match self.nodes.get(&id).map(|e| &e.variant) {
            Some(NodeVariant::Register(r)) => Ok(&r.value),
            Some(_) => Err(Error::WrongKind),
            None => Err(Error::NotFound),
        }
    }

    /// Borrows `id` as an [`crate::object::Object`] handle, the entry point
    /// for reading and mutating an `Object` node.
    pub fn object(&mut self, id: Id) -> Result<crate::object::Object<'_>> {
        self.object_data(id)?;
        Ok(crate::object::Object::new(self, id))
    }

    /// Borrows `id` as a [`crate::map::Map`] handle.
    pub fn map(&mut self, id: Id) -> Result<crate::map::Map<'_>> {
        self.map_data(id)?;
        Ok(crate::map::Map::new(self, id))
    }

    /// Borrows `id` as a [`crate::list::List`] handle.
    pub fn list(&mut self, id: Id) -> Result<crate::list::List<'_>> {
        self.list_data(id)?;
        Ok(crate::list::List::new(self, id))
    }

    /// Reads the scalar value wrapped by a `Register` node.
    pub fn register(&self, id: Id) -> Result<&Value> {
        self.register_value(id)
    }

    /// Recursively materializes a node (and every descendant) into a plain
    /// JSON value: `Object`/`Map` become JSON objects, `List` a JSON array,
    /// `Register` unwraps to its scalar.
    pub(crate) fn to_json(&self, id: Id) -> Value {
        match self.nodes.get(&id).map(|e| &e.variant) {
            Some(NodeVariant::Register(r)) => r.value.clone(),
            Some(NodeVariant::Object(o)) => {
                let mut map = serde_json::Map::new();
                for (k, entry) in &o.entries {
                    let v = match entry {
                        ObjectEntry::Scalar(v) => v.clone(),
                        ObjectEntry::Node(child) => self.to_json(*child),
                    };
                    map.insert(k.clone(), v);
                }
                Value::Object(map)
            }
            Some(NodeVariant::Map(m)) => {
                let mut map = serde_json::Map::new();
                for (k, child) in m.iter() {
                    map.insert(k.to_owned(), self.to_json(child));
                }
                Value::Object(map)
            }
            Some(NodeVariant::List(l)) => Value::Array(l.ids().map(|id| self.to_json(id)).collect()),
            None => Value::Null,
        }
    }

    /// Flattens `id` and its whole subtree into the `(id, SerializedNode)`
    /// record list [`Document::load`] consumes — the two are inverses
    /// (§6: "serialize(root) followed by load yields a structurally equal
    /// tree").
    pub fn serialize(&self, id: Id) -> Vec<SerializedRecord> {
        let mut out = Vec::new();
        self.serialize_into(id, &mut out);
        out
    }

    fn serialize_into(&self, id: Id, out: &mut Vec<SerializedRecord>) {
        let entry = &self.nodes[&id];
        let parent_id = entry.link.parent;
        let parent_key = entry.link.parent_key.clone();
        match &entry.variant {
            NodeVariant::Object(o) => {
                let data: Data = o
                    .entries
                    .iter()
                    .filter_map(|(k, e)| match e {
                        ObjectEntry::Scalar(v) => Some((k.clone(), v.clone())),
                        ObjectEntry::Node(_) => None,
                    })
                    .collect();
                out.push((
                    id,
                    SerializedNode {
                        kind: NodeKind::Object,
                        parent_id,
                        parent_key,
                        data: Some(NodeData::Object(data)),
                    },
                ));
                for entry in o.entries.values() {
                    if let ObjectEntry::Node(child) = entry {
                        self.serialize_into(*child, out);
                    }
                }
            }
            NodeVariant::Map(m) => {
                out.push((
                    id,
                    SerializedNode {
                        kind: NodeKind::Map,
                        parent_id,
                        parent_key,
                        data: None,
                    },
                ));
                for (_, child) in m.iter() {
                    self.serialize_into(child, out);
                }
            }
            NodeVariant::List(l) => {
                out.push((
                    id,
                    SerializedNode {
                        kind: NodeKind::List,
                        parent_id,
                        parent_key,
                        data: None,
                    },
                ));
                for child in l.ids() {
                    self.serialize_into(child, out);
                }
            }
            NodeVariant::Register(r) => {
                out.push((
                    id,
                    SerializedNode {
                        kind: NodeKind::Register,
                        parent_id,
                        parent_key,
                        data: Some(NodeData::Scalar(r.value.clone())),
                    },
                ));
            }
        }
    }

    /// Subscribes to every commit, local or remote.
    pub fn subscribe(&self, callback: impl FnMut(&[Id]) + 'static) -> Disposer {
        let mut callback = callback;
        subscriber::subscribe_global(&self.bus, move |change| callback(change.modified))
    }

    /// Subscribes to commits that touch `id` specifically.
    pub fn subscribe_node(&self, id: Id, callback: impl FnMut(&[Id]) + 'static) -> Disposer {
        let mut callback = callback;
        subscriber::subscribe_node(&self.bus, id, move |change| callback(change.modified))
    }

    // ---- mutation plumbing -------------------------------------------------

    fn mint_id(&mut self) -> Id {
        self.id_minter.mint()
    }

    pub(crate) fn mint_op_id(&mut self) -> OpId {
        self.op_minter.mint()
    }

    /// Attaches `content` as a new child of `parent` under `parent_key`,
    /// returning its id and the `Create*` op sequence that builds it and
    /// every descendant (§3 Lifecycle).
    fn attach_content(&mut self, content: Content, parent: Id, parent_key: String) -> (Id, Vec<Op>) {
        let id = self.mint_id();
        let link = NodeLink::child(parent, parent_key.clone());
        let mut ops = Vec::new();
        match content {
            Content::Scalar(value) => {
                self.nodes.insert(
                    id,
                    NodeEntry {
                        link,
                        variant: NodeVariant::Register(RegisterData::new(value.clone())),
                    },
                );
                ops.push(Op::CreateRegister {
                    id,
                    parent_id: parent,
                    parent_key,
                    data: value,
                });
            }
            Content::Object(fields) => {
                let mut entries = BTreeMap::new();
                let mut data = Data::new();
                let mut node_fields = Vec::new();
                for (key, value) in fields {
                    match value {
                        Content::Scalar(v) => {
                            entries.insert(key.clone(), ObjectEntry::Scalar(v.clone()));
                            data.insert(key, v);
                        }
                        other => node_fields.push((key, other)),
                    }
                }
                ops.push(Op::CreateObject {
                    id,
                    parent_id: Some(parent),
                    parent_key: Some(parent_key),
                    data,
                });
                for (key, value) in node_fields {
                    let (child_id, child_ops) = self.attach_content(value, id, key.clone());
                    entries.insert(key, ObjectEntry::Node(child_id));
                    ops.extend(child_ops);
                }
                self.nodes.insert(
                    id,
                    NodeEntry {
                        link,
                        variant: NodeVariant::Object(ObjectData {
                            entries,
                            prop_to_last_update: HashMap::new(),
                        }),
                    },
                );
            }
            Content::Map(fields) => {
                ops.push(Op::CreateMap {
                    id,
                    parent_id: parent,
                    parent_key: parent_key.clone(),
                });
                let mut entries = BTreeMap::new();
                for (key, value) in fields {
                    let (child_id, child_ops) = self.attach_content(value, id, key.clone());
                    entries.insert(key, child_id);
                    ops.extend(child_ops);
                }
                self.nodes.insert(
                    id,
                    NodeEntry {
                        link,
                        variant: NodeVariant::Map(MapData { entries }),
                    },
                );
            }
            Content::List(items) => {
                ops.push(Op::CreateList {
                    id,
                    parent_id: parent,
                    parent_key: parent_key.clone(),
                });
                let mut list = ListData::new();
                let mut prev: Option<Position> = None;
                for item in items {
                    let position = crate::position::make_position(prev.as_ref(), None);
                    let (child_id, child_ops) =
                        self.attach_content(item, id, position.to_string());
                    list.insert_sorted(position.clone(), child_id);
                    prev = Some(position);
                    ops.extend(child_ops);
                }
                self.nodes.insert(
                    id,
                    NodeEntry {
                        link,
                        variant: NodeVariant::List(list),
                    },
                );
            }
        }
        (id, ops)
    }

    /// Reconstructs the `Create*` op sequence that would recreate `id` and
    /// its whole subtree from scratch, used to build the reverse of a
    /// deletion.
    fn serialize_subtree(&self, id: Id) -> Vec<Op> {
        let entry = &self.nodes[&id];
        let parent_id = entry.link.parent;
        let parent_key = entry.link.parent_key.clone();
        let mut ops = Vec::new();
        match &entry.variant {
            NodeVariant::Object(o) => {
                let data: Data = o
                    .entries
                    .iter()
                    .filter_map(|(k, e)| match e {
                        ObjectEntry::Scalar(v) => Some((k.clone(), v.clone())),
                        ObjectEntry::Node(_) => None,
                    })
                    .collect();
                ops.push(Op::CreateObject {
                    id,
                    parent_id,
                    parent_key,
                    data,
                });
                for entry in o.entries.values() {
                    if let ObjectEntry::Node(child) = entry {
                        ops.extend(self.serialize_subtree(*child));
                    }
                }
            }
            NodeVariant::Map(m) => {
                ops.push(Op::CreateMap {
                    id,
                    parent_id: parent_id.unwrap(),
                    parent_key: parent_key.unwrap(),
                });
                for (_, child) in m.iter() {
                    ops.extend(self.serialize_subtree(child));
                }
            }
            NodeVariant::List(l) => {
                ops.push(Op::CreateList {
                    id,
                    parent_id: parent_id.unwrap(),
                    parent_key: parent_key.unwrap(),
                });
                for child in l.ids() {
                    ops.extend(self.serialize_subtree(child));
                }
            }
            NodeVariant::Register(r) => {
                ops.push(Op::CreateRegister {
                    id,
                    parent_id: parent_id.unwrap(),
                    parent_key: parent_key.unwrap(),
                    data: r.value.clone(),
                });
            }
        }
        ops
    }

    /// Removes `id` and every descendant from the arena, without touching
    /// its entry in the parent's container (the caller already did, or is
    /// about to).
    fn remove_subtree(&mut self, id: Id) {
        let children: Vec<Id> = match self.nodes.get(&id).map(|e| &e.variant) {
            Some(NodeVariant::Object(o)) => o
                .entries
                .values()
                .filter_map(|e| match e {
                    ObjectEntry::Node(c) => Some(*c),
                    ObjectEntry::Scalar(_) => None,
                })
                .collect(),
            Some(NodeVariant::Map(m)) => m.iter().map(|(_, c)| c).collect(),
            Some(NodeVariant::List(l)) => l.ids().collect(),
            Some(NodeVariant::Register(_)) | None => Vec::new(),
        };
        for child in children {
            self.remove_subtree(child);
        }
        self.nodes.remove(&id);
    }

    /// Either folds `forward`/`reverse`/`modified` into the open batch, or
    /// commits them immediately: appends `reverse` to the undo stack
    /// (capped at [`HISTORY_LIMIT`], clearing redo), broadcasts `forward`,
    /// and synchronously notifies subscribers of `modified`.
    fn dispatch(&mut self, forward: Vec<Op>, reverse: Vec<Op>, modified: Vec<Id>) {
        if let Some(batch) = &mut self.batch {
            batch.forward.extend(forward);
            batch.reverse.splice(0..0, reverse);
            for id in modified {
                push_unique(&mut batch.modified, id);
            }
            return;
        }
        (self.broadcast)(forward);
        if !reverse.is_empty() {
            self.undo_stack.push_back(reverse);
            if self.undo_stack.len() > HISTORY_LIMIT {
                self.undo_stack.pop_front();
            }
            self.redo_stack.clear();
        }
        subscriber::notify(&self.bus, &modified);
    }

    /// Runs `f`, coalescing every mutation it performs into a single
    /// broadcast call, a single undo entry, and a single round of subscriber
    /// notification. Batches cannot nest. If `f` returns `Err`, the batch's
    /// accumulated forward/reverse/notify state is discarded entirely —
    /// nothing it did reaches the wire, the undo stack, or subscribers.
    pub fn batch<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        if self.batch.is_some() {
            return Err(Error::NestedBatch);
        }
        self.batch = Some(BatchState::default());
        let outcome = f(self);
        let state = self.batch.take();
        let value = outcome?;
        if let Some(state) = state {
            if !state.forward.is_empty() {
                (self.broadcast)(state.forward);
            }
            if !state.reverse.is_empty() {
                self.undo_stack.push_back(state.reverse);
                if self.undo_stack.len() > HISTORY_LIMIT {
                    self.undo_stack.pop_front();
                }
                self.redo_stack.clear();
            }
            subscriber::notify(&self.bus, &state.modified);
        }
        Ok(value)
    }

    fn in_batch(&self) -> bool {
        self.batch.is_some()
    }

    /// Applies one op as if it arrived from a peer or is being replayed from
    /// undo/redo history, routing it to its target and returning the ids it
    /// touched plus the op that would undo it.
    ///
    /// `is_replay` marks application of our own previously-recorded reverse
    /// ops (undo/redo): such ops are always treated as local bookkeeping,
    /// same as an op that carries no `opId` at all (§9's legacy quirk).
    fn apply_one(&mut self, op: Op, is_replay: bool) -> (Vec<Id>, Vec<Op>) {
        match op {
            Op::CreateObject {
                id,
                parent_id,
                parent_key,
                data,
            } => self.apply_create(
                id,
                parent_id,
                parent_key,
                NodeVariant::Object(ObjectData {
                    entries: data_to_object_entries(&data),
                    prop_to_last_update: HashMap::new(),
                }),
            ),
            Op::CreateMap {
                id,
                parent_id,
                parent_key,
            } => self.apply_create(
                id,
                Some(parent_id),
                Some(parent_key),
                NodeVariant::Map(MapData::new()),
            ),
            Op::CreateList {
                id,
                parent_id,
                parent_key,
            } => self.apply_create(
                id,
                Some(parent_id),
                Some(parent_key),
                NodeVariant::List(ListData::new()),
            ),
            Op::CreateRegister {
                id,
                parent_id,
                parent_key,
                data,
            } => self.apply_create(
                id,
                Some(parent_id),
                Some(parent_key),
                NodeVariant::Register(RegisterData::new(data)),
            ),
            Op::UpdateObject { id, data, op_id } => {
                self.apply_update_object(id, data, op_id, is_replay)
            }
            Op::DeleteObjectKey { id, key } => self.apply_delete_object_key(id, &key),
            Op::DeleteCrdt { id } => self.apply_delete_crdt(id),
            Op::SetParentKey { id, parent_key } => self.apply_set_parent_key(id, parent_key),
        }
    }

    fn apply_create(
        &mut self,
        id: Id,
        parent_id: Option<Id>,
        parent_key: Option<String>,
        variant: NodeVariant,
    ) -> (Vec<Id>, Vec<Op>) {
        if self.nodes.contains_key(&id) {
            tracing::info!("apply: create of {} dropped, id already exists", id);
            return (Vec::new(), Vec::new());
        }
        if let Some(parent) = parent_id {
            let Some(parent_entry) = self.nodes.get_mut(&parent) else {
                tracing::info!("apply: create of {} dropped, parent {} missing", id, parent);
                return (Vec::new(), Vec::new());
            };
            let key = parent_key.clone().unwrap();
            match &mut parent_entry.variant {
                NodeVariant::Object(o) => {
                    o.entries.insert(key, ObjectEntry::Node(id));
                }
                NodeVariant::Map(m) => {
                    m.entries.insert(key, id);
                }
                NodeVariant::List(l) => {
                    let Ok(position) = key.parse::<Position>() else {
                        tracing::error!("apply: create of {} dropped, bad list position {:?}", id, key);
                        return (Vec::new(), Vec::new());
                    };
                    // a concurrently-minted local child may already sit at
                    // this exact position; bump it aside rather than let two
                    // children collide on one key
                    l.displace_collision(&position);
                    l.insert_sorted(position, id);
                }
                NodeVariant::Register(_) => {
                    tracing::error!("apply: create of {} dropped, register {} cannot parent a node", id, parent);
                    return (Vec::new(), Vec::new());
                }
            }
        } else if self.nodes.contains_key(&self.root) {
            // a second rootless creation op while we already have a root
            tracing::info!("apply: rootless create of {} dropped, root already set", id);
            return (Vec::new(), Vec::new());
        }
        let link = match parent_id {
            Some(parent) => NodeLink::child(parent, parent_key.unwrap()),
            None => {
                self.root = id;
                NodeLink::root()
            }
        };
        self.nodes.insert(id, NodeEntry { link, variant });
        let modified = match parent_id {
            Some(parent) => vec![parent, id],
            None => vec![id],
        };
        (modified, vec![Op::DeleteCrdt { id }])
    }

    fn apply_update_object(
        &mut self,
        id: Id,
        data: Data,
        op_id: Option<OpId>,
        is_replay: bool,
    ) -> (Vec<Id>, Vec<Op>) {
        let local = is_replay || op_id.is_none();
        let resolved_op_id = op_id.unwrap_or_else(|| self.mint_op_id());
        let Some(entry) = self.nodes.get_mut(&id) else {
            return (Vec::new(), Vec::new());
        };
        let NodeVariant::Object(obj) = &mut entry.variant else {
            return (Vec::new(), Vec::new());
        };
        let mut changed = false;
        let mut reverse_data = Data::new();
        let mut reverse_deletes = Vec::new();
        for (key, value) in &data {
            let prior = obj.get(key).cloned();
            if obj.apply_update(key, value, resolved_op_id, local) {
                changed = true;
                match prior {
                    Some(ObjectEntry::Scalar(v)) => {
                        reverse_data.insert(key.clone(), v);
                    }
                    Some(ObjectEntry::Node(_)) => {}
                    None => reverse_deletes.push(key.clone()),
                }
            } else if !local {
                tracing::info!("apply: remote update of {}.{} dropped, local write pending", id, key);
            }
        }
        let mut reverse = Vec::new();
        if !reverse_data.is_empty() {
            reverse.push(Op::UpdateObject {
                id,
                data: reverse_data,
                op_id: None,
            });
        }
        for key in reverse_deletes {
            reverse.push(Op::DeleteObjectKey { id, key });
        }
        if changed {
            (vec![id], reverse)
        } else {
            (Vec::new(), Vec::new())
        }
    }

    fn apply_delete_object_key(&mut self, id: Id, key: &str) -> (Vec<Id>, Vec<Op>) {
        let Some(entry) = self.nodes.get_mut(&id) else {
            return (Vec::new(), Vec::new());
        };
        let NodeVariant::Object(obj) = &mut entry.variant else {
            return (Vec::new(), Vec::new());
        };
        match obj.remove(key) {
            Some(ObjectEntry::Node(child)) => {
                let ops = self.serialize_subtree(child);
                self.remove_subtree(child);
                (vec![id], ops)
            }
            Some(ObjectEntry::Scalar(v)) => (
                vec![id],
                vec![Op::UpdateObject {
                    id,
                    data: singleton(key.to_owned(), v),
                    op_id: None,
                }],
            ),
            None => (Vec::new(), Vec::new()),
        }
    }

    fn apply_delete_crdt(&mut self, id: Id) -> (Vec<Id>, Vec<Op>) {
        if !self.nodes.contains_key(&id) {
            return (Vec::new(), Vec::new());
        }
        let link = self.nodes[&id].link.clone();
        let reverse = self.serialize_subtree(id);
        if let (Some(parent), Some(key)) = (link.parent, &link.parent_key) {
            if let Some(parent_entry) = self.nodes.get_mut(&parent) {
                match &mut parent_entry.variant {
                    NodeVariant::Object(o) => {
                        o.entries.remove(key.as_str());
                    }
                    NodeVariant::Map(m) => {
                        m.delete(key.as_str());
                    }
                    NodeVariant::List(l) => {
                        l.remove_id(id);
                    }
                    NodeVariant::Register(_) => {}
                }
            }
        }
        self.remove_subtree(id);
        let modified = match link.parent {
            Some(parent) => vec![parent, id],
            None => vec![id],
        };
        (modified, reverse)
    }

    fn apply_set_parent_key(&mut self, id: Id, new_key: String) -> (Vec<Id>, Vec<Op>) {
        let Some(entry) = self.nodes.get(&id) else {
            return (Vec::new(), Vec::new());
        };
        let Some(parent) = entry.link.parent else {
            return (Vec::new(), Vec::new());
        };
        let old_key = entry.link.parent_key.clone().unwrap();
        if old_key == new_key {
            return (Vec::new(), Vec::new());
        }
        let Some(parent_entry) = self.nodes.get_mut(&parent) else {
            return (Vec::new(), Vec::new());
        };
        // SetParentKey only ever makes sense as a List reorder; a parent of
        // any other kind means the op is stale or malformed and is dropped.
        match &mut parent_entry.variant {
            NodeVariant::List(l) => {
                let Ok(position) = new_key.parse::<Position>() else {
                    tracing::error!("apply: SetParentKey of {} dropped, bad list position {:?}", id, new_key);
                    return (Vec::new(), Vec::new());
                };
                l.remove_id(id);
                l.insert_sorted(position, id);
            }
            NodeVariant::Object(_) | NodeVariant::Map(_) | NodeVariant::Register(_) => {
                tracing::info!("apply: SetParentKey of {} dropped, parent {} is not a List", id, parent);
                return (Vec::new(), Vec::new());
            }
        }
        self.nodes.get_mut(&id).unwrap().link.parent_key = Some(new_key);
        (
            vec![parent, id],
            vec![Op::SetParentKey {
                id,
                parent_key: old_key,
            }],
        )
    }

    /// Reparents `id` under `new_key` in its current parent, used by list
    /// moves and exposed generically for any node with a key-addressed
    /// parent.
    pub(crate) fn reparent(&mut self, id: Id, new_key: String) -> Result<()> {
        let forward_key = new_key.clone();
        let (modified, reverse) = self.apply_set_parent_key(id, new_key);
        if modified.is_empty() {
            return Ok(());
        }
        self.dispatch(
            vec![Op::SetParentKey {
                id,
                parent_key: forward_key,
            }],
            reverse,
            modified,
        );
        Ok(())
    }

    /// Applies a batch of operations received from another replica. Unknown
    /// targets, duplicate creations and the like are silently dropped
    /// (§7). Never touches the undo/redo stacks.
    pub fn apply_remote_operations(&mut self, ops: Vec<Op>) {
        let mut modified = Vec::new();
        for op in ops {
            let (touched, _reverse) = self.apply_one(op, false);
            for id in touched {
                push_unique(&mut modified, id);
            }
        }
        subscriber::notify(&self.bus, &modified);
    }

    fn apply_local_replay(&mut self, ops: Vec<Op>) -> (Vec<Id>, Vec<Op>) {
        let mut modified = Vec::new();
        let mut reverse = Vec::new();
        for op in ops {
            let (touched, rev) = self.apply_one(op, true);
            for id in touched {
                push_unique(&mut modified, id);
            }
            reverse.extend(rev);
        }
        (modified, reverse)
    }

    /// Undoes the most recent entry on the undo stack, pushing its reverse
    /// onto the redo stack. A no-op if the stack is empty. Forbidden inside
    /// a batch (§9).
    pub fn undo(&mut self) -> Result<()> {
        if self.in_batch() {
            return Err(Error::UndoRedoDuringBatch);
        }
        let Some(ops) = self.undo_stack.pop_back() else {
            return Ok(());
        };
        let forward = ops.clone();
        let (modified, reverse) = self.apply_local_replay(ops);
        (self.broadcast)(forward);
        self.redo_stack.push(reverse);
        subscriber::notify(&self.bus, &modified);
        Ok(())
    }

    /// Re-applies the most recently undone entry, pushing its reverse back
    /// onto the undo stack. A no-op if the redo stack is empty. Forbidden
    /// inside a batch (§9).
    pub fn redo(&mut self) -> Result<()> {
        if self.in_batch() {
            return Err(Error::UndoRedoDuringBatch);
        }
        let Some(ops) = self.redo_stack.pop() else {
            return Ok(());
        };
        let forward = ops.clone();
        let (modified, reverse) = self.apply_local_replay(ops);
        (self.broadcast)(forward);
        self.undo_stack.push_back(reverse);
        if self.undo_stack.len() > HISTORY_LIMIT {
            self.undo_stack.pop_front();
        }
        subscriber::notify(&self.bus, &modified);
        Ok(())
    }

    // ---- per-variant local mutators, called by the handle types ----------

    pub(crate) fn object_update(&mut self, id: Id, partial: BTreeMap<String, Content>) -> Result<()> {
        if !matches!(
            self.nodes.get(&id).map(|e| &e.variant),
            Some(NodeVariant::Object(_))
        ) {
            return Err(if self.nodes.contains_key(&id) {
                Error::WrongKind
            } else {
                Error::NotFound
            });
        }
        let mut forward = Vec::new();
        let mut reverse = Vec::new();
        let mut modified = Vec::new();
        let mut scalar_data = Data::new();
        // one opId per call, minted lazily the first time a scalar key is
        // actually written, and reused by every scalar write in this call
        let mut call_op_id: Option<OpId> = None;

        for (key, content) in partial {
            let prior_is_node = matches!(
                self.object_data(id)?.get(&key),
                Some(ObjectEntry::Node(_))
            );
            match content {
                Content::Scalar(value) if !prior_is_node => {
                    scalar_data.insert(key, value);
                }
                other => {
                    let prior = self.object_data(id)?.get(&key).cloned();
                    let key_reverse = match prior {
                        Some(ObjectEntry::Node(child)) => {
                            let ops = self.serialize_subtree(child);
                            self.remove_subtree(child);
                            ops
                        }
                        Some(ObjectEntry::Scalar(v)) => {
                            vec![Op::UpdateObject {
                                id,
                                data: singleton(key.clone(), v),
                                op_id: None,
                            }]
                        }
                        None => vec![Op::DeleteObjectKey {
                            id,
                            key: key.clone(),
                        }],
                    };
                    match other {
                        Content::Scalar(value) => {
                            let op_id = match call_op_id {
                                Some(op_id) => op_id,
                                None => {
                                    let op_id = self.mint_op_id();
                                    call_op_id = Some(op_id);
                                    op_id
                                }
                            };
                            if let NodeVariant::Object(obj) =
                                &mut self.nodes.get_mut(&id).unwrap().variant
                            {
                                obj.entries
                                    .insert(key.clone(), ObjectEntry::Scalar(value.clone()));
                                obj.prop_to_last_update.insert(key.clone(), op_id);
                            }
                            forward.push(Op::UpdateObject {
                                id,
                                data: singleton(key, value),
                                op_id: Some(op_id),
                            });
                        }
                        node_content => {
                            let (child_id, child_ops) =
                                self.attach_content(node_content, id, key.clone());
                            if let NodeVariant::Object(obj) =
                                &mut self.nodes.get_mut(&id).unwrap().variant
                            {
                                obj.entries.insert(key, ObjectEntry::Node(child_id));
                            }
                            forward.extend(child_ops);
                            modified.push(child_id);
                        }
                    }
                    reverse.splice(0..0, key_reverse);
                    modified.push(id);
                }
            }
        }

        if !scalar_data.is_empty() {
            let op_id = match call_op_id {
                Some(op_id) => op_id,
                None => self.mint_op_id(),
            };
            let mut reverse_data = Data::new();
            let mut reverse_deletes = Vec::new();
            if let NodeVariant::Object(obj) = &mut self.nodes.get_mut(&id).unwrap().variant {
                for (key, value) in &scalar_data {
                    let prior = obj.get(key).cloned();
                    obj.apply_update(key, value, op_id, true);
                    match prior {
                        Some(ObjectEntry::Scalar(v)) => {
                            reverse_data.insert(key.clone(), v);
                        }
                        Some(ObjectEntry::Node(_)) => unreachable!(
                            "node-valued keys are routed through the per-key branch above"
                        ),
                        None => reverse_deletes.push(key.clone()),
                    }
                }
            }
            forward.push(Op::UpdateObject {
                id,
                data: scalar_data,
                op_id: Some(op_id),
            });
            if !reverse_data.is_empty() {
                reverse.push(Op::UpdateObject {
                    id,
                    data: reverse_data,
                    op_id: None,
                });
            }
            for key in reverse_deletes {
                reverse.push(Op::DeleteObjectKey { id, key });
            }
            modified.push(id);
        }

        self.dispatch(forward, reverse, modified);
        Ok(())
    }

    pub(crate) fn object_delete_key(&mut self, id: Id, key: &str) -> Result<()> {
        let (modified, reverse) = self.apply_delete_object_key(id, key);
        if modified.is_empty() {
            return Ok(());
        }
        self.dispatch(
            vec![Op::DeleteObjectKey {
                id,
                key: key.to_owned(),
            }],
            reverse,
            modified,
        );
        Ok(())
    }

    pub(crate) fn map_set(&mut self, id: Id, key: String, content: Content) -> Result<()> {
        if self.map_data(id).is_err() {
            return Err(if self.nodes.contains_key(&id) {
                Error::WrongKind
            } else {
                Error::NotFound
            });
        }
        let prior = self.map_data(id)?.get(&key);
        let mut reverse = match prior {
            Some(child) => {
                let ops = self.serialize_subtree(child);
                self.remove_subtree(child);
                ops
            }
            None => Vec::new(),
        };
        let (child_id, forward) = self.attach_content(content, id, key.clone());
        if prior.is_none() {
            // Nothing occupied `key` before, so undoing this write just
            // deletes the node we're about to create.
            reverse.push(Op::DeleteCrdt { id: child_id });
        }
        if let NodeVariant::Map(m) = &mut self.nodes.get_mut(&id).unwrap().variant {
            m.set(key, child_id);
        }
        self.dispatch(forward, reverse, vec![id, child_id]);
        Ok(())
    }

    pub(crate) fn map_delete(&mut self, id: Id, key: &str) -> Result<()> {
        let Some(child) = self.map_data(id)?.get(key) else {
            return Ok(());
        };
        let reverse = self.serialize_subtree(child);
        self.remove_subtree(child);
        if let NodeVariant::Map(m) = &mut self.nodes.get_mut(&id).unwrap().variant {
            m.delete(key);
        }
        self.dispatch(
            vec![Op::DeleteCrdt { id: child }],
            reverse,
            vec![id, child],
        );
        Ok(())
    }

    pub(crate) fn list_insert(&mut self, id: Id, index: usize, content: Content) -> Result<()> {
        let list = self.list_data(id)?;
        if index > list.len() {
            return Err(Error::IndexOutOfRange {
                index,
                len: list.len(),
            });
        }
        let (before, after) = list.bounds_for_insert(index);
        let position = crate::position::make_position(before, after);
        let (child_id, forward) = self.attach_content(content, id, position.to_string());
        if let NodeVariant::List(l) = &mut self.nodes.get_mut(&id).unwrap().variant {
            l.insert_sorted(position, child_id);
        }
        self.dispatch(forward, vec![Op::DeleteCrdt { id: child_id }], vec![id, child_id]);
        Ok(())
    }

    pub(crate) fn list_delete(&mut self, id: Id, index: usize) -> Result<()> {
        let list = self.list_data(id)?;
        if index >= list.len() {
            return Err(Error::IndexOutOfRange {
                index,
                len: list.len(),
            });
        }
        let child = list.get(index).unwrap();
        let reverse = self.serialize_subtree(child);
        self.remove_subtree(child);
        if let NodeVariant::List(l) = &mut self.nodes.get_mut(&id).unwrap().variant {
            l.remove_id(child);
        }
        self.dispatch(vec![Op::DeleteCrdt { id: child }], reverse, vec![id, child]);
        Ok(())
    }

    pub(crate) fn list_move(&mut self, id: Id, from: usize, to: usize) -> Result<()> {
        let list = self.list_data(id)?;
        let len = list.len();
        if from >= len || to >= len {
            return Err(Error::IndexOutOfRange {
                index: from.max(to),
                len,
            });
        }
        let child = list.get(from).unwrap();
        // neighbors are computed against every *other* item's position, so
        // the item being moved never bounds its own destination
        let remaining = list.entries_excluding(child);
        let before = to.checked_sub(1).and_then(|i| remaining.get(i)).map(|(p, _)| p.clone());
        let after = remaining.get(to).map(|(p, _)| p.clone());
        let new_position = crate::position::make_position(before.as_ref(), after.as_ref());
        self.reparent(child, new_position.to_string())?;
        Ok(())
    }
}

/// Routes this process's `log`/`tracing` output to stderr for the duration
/// of the test binary, filtered by `RUST_LOG` (defaults to `info`), and
/// upgrades panics to `tracing::error!` so they show up in captured output
/// alongside everything else.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    use std::sync::Once;
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::EnvFilter;

    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_log::LogTracer::init().ok();
        let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_span_events(FmtSpan::ACTIVE | FmtSpan::CLOSE)
            .with_env_filter(EnvFilter::new(env))
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
        log_panics::init();
    });
}
