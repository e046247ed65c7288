use collab_tree::{Content, Document, Op};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

mod common;

fn outbox() -> (Rc<RefCell<Vec<Op>>>, impl FnMut(Vec<Op>)) {
    let buf = Rc::new(RefCell::new(Vec::new()));
    let sink = buf.clone();
    (buf, move |ops: Vec<Op>| sink.borrow_mut().extend(ops))
}

#[test]
fn object_set_serialize_and_load_round_trips() {
    common::init_test_logging();
    let (_out, sink) = outbox();
    let mut fields = BTreeMap::new();
    fields.insert("a".to_string(), Content::from(1i64));
    let mut doc = Document::from(fields, 1, sink);
    let root = doc.root();
    doc.object(root).unwrap().set("b", 2i64).unwrap();

    let records = doc.serialize(root);
    let (_out2, sink2) = outbox();
    let mut loaded = Document::load(records, 1, sink2).unwrap();

    assert_eq!(loaded.object(loaded.root()).unwrap().get("a").unwrap(), 1);
    assert_eq!(loaded.object(loaded.root()).unwrap().get("b").unwrap(), 2);
}

#[test]
fn undo_broadcasts_the_forward_ops_reverse_right_after_them() {
    let (out, sink) = outbox();
    let mut fields = BTreeMap::new();
    fields.insert("n".to_string(), Content::from(0i64));
    let mut doc = Document::from(fields, 1, sink);
    let root = doc.root();
    out.borrow_mut().clear();

    doc.object(root).unwrap().set("n", 1i64).unwrap();
    let forward = out.borrow().clone();
    assert_eq!(forward.len(), 1);

    doc.undo().unwrap();
    let after_undo = out.borrow().clone();
    assert_eq!(&after_undo[..1], &forward[..]);
    assert_eq!(after_undo.len(), 2);
    assert_eq!(doc.object(root).unwrap().get("n").unwrap(), 0);
}

#[test]
fn list_push_move_undo_redo() {
    let (_out, sink) = outbox();
    let mut doc = Document::from(BTreeMap::new(), 1, sink);
    let root = doc.root();
    doc.object(root).unwrap().set("items", Content::List(Vec::new())).unwrap();
    let list_id = doc.object(root).unwrap().child("items").unwrap();

    doc.list(list_id).unwrap().push("x").unwrap();
    doc.list(list_id).unwrap().push("y").unwrap();
    doc.list(list_id).unwrap().push("z").unwrap();
    assert_eq!(doc.list(list_id).unwrap().to_array(), vec!["x", "y", "z"]);

    doc.list(list_id).unwrap().move_item(0, 2).unwrap();
    assert_eq!(doc.list(list_id).unwrap().to_array(), vec!["y", "z", "x"]);

    doc.undo().unwrap();
    assert_eq!(doc.list(list_id).unwrap().to_array(), vec!["x", "y", "z"]);
    doc.redo().unwrap();
    assert_eq!(doc.list(list_id).unwrap().to_array(), vec!["y", "z", "x"]);
}

#[test]
fn concurrent_object_update_converges_via_opid_acknowledgement() {
    // Two replicas of the same logical document. Replica A's own writes are
    // echoed back as remote ops carrying the opId it minted, which must be
    // absorbed as an acknowledgement rather than re-applied as a conflict.
    let (outbox_a, sink_a) = outbox();
    let mut fields = BTreeMap::new();
    fields.insert("count".to_string(), Content::from(0i64));
    let mut a = Document::from(fields, 1, sink_a);
    let root = a.root();
    outbox_a.borrow_mut().clear();

    a.object(root).unwrap().set("count", 5i64).unwrap();
    let a_ops = outbox_a.borrow_mut().drain(..).collect::<Vec<_>>();

    // A genuinely concurrent remote write loses while our own is pending...
    let remote_op_id = collab_tree::Id::new(2, 0);
    let mut remote_data = BTreeMap::new();
    remote_data.insert("count".to_string(), serde_json::Value::from(99));
    a.apply_remote_operations(vec![Op::UpdateObject {
        id: root,
        data: remote_data,
        op_id: Some(remote_op_id),
    }]);
    assert_eq!(a.object(root).unwrap().get("count").unwrap(), 5);

    // The echo of our own write arrives back and is absorbed as an
    // acknowledgement, clearing the pending write without changing state.
    a.apply_remote_operations(a_ops);
    assert_eq!(a.object(root).unwrap().get("count").unwrap(), 5);

    // ...and once our write has been acknowledged, a later remote write wins.
    let mut remote_data = BTreeMap::new();
    remote_data.insert("count".to_string(), serde_json::Value::from(42));
    a.apply_remote_operations(vec![Op::UpdateObject {
        id: root,
        data: remote_data,
        op_id: Some(collab_tree::Id::new(2, 1)),
    }]);
    assert_eq!(a.object(root).unwrap().get("count").unwrap(), 42);
}

#[test]
fn batch_commits_exactly_one_broadcast_call_and_one_undo_entry() {
    let calls = Rc::new(RefCell::new(0usize));
    let calls2 = calls.clone();
    let ops = Rc::new(RefCell::new(Vec::new()));
    let ops2 = ops.clone();
    let sink = move |batch: Vec<Op>| {
        *calls2.borrow_mut() += 1;
        ops2.borrow_mut().extend(batch);
    };
    let mut fields = BTreeMap::new();
    fields.insert("n".to_string(), Content::from(0i64));
    let mut doc = Document::from(fields, 1, sink);
    let root = doc.root();
    *calls.borrow_mut() = 0;
    ops.borrow_mut().clear();

    doc.batch(|doc| {
        doc.object(root).unwrap().set("n", 1i64)?;
        doc.object(root).unwrap().set("n", 2i64)?;
        Ok(())
    })
    .unwrap();

    // one consolidated broadcast call, carrying both forward ops
    assert_eq!(*calls.borrow(), 1);
    assert_eq!(ops.borrow().len(), 2);
    assert_eq!(doc.object(root).unwrap().get("n").unwrap(), 2);

    // but exactly one undo entry was pushed
    doc.undo().unwrap();
    assert_eq!(doc.object(root).unwrap().get("n").unwrap(), 0);
    assert!(doc.undo().is_ok());
    assert_eq!(doc.object(root).unwrap().get("n").unwrap(), 0);
}

#[test]
fn map_and_list_expose_child_iteration() {
    let (_out, sink) = outbox();
    let mut doc = Document::from(BTreeMap::new(), 1, sink);
    let root = doc.root();
    doc.object(root).unwrap().set("tags", Content::Map(BTreeMap::new())).unwrap();
    let map_id = doc.object(root).unwrap().child("tags").unwrap();
    doc.map(map_id).unwrap().set("a", 1i64).unwrap();
    doc.map(map_id).unwrap().set("b", 2i64).unwrap();

    let map = doc.map(map_id).unwrap();
    let keys: Vec<&str> = map.iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["a", "b"]);
    let mut seen = Vec::new();
    map.for_each(|k, id| seen.push((k.to_string(), id)));
    assert_eq!(seen.len(), 2);

    doc.object(root).unwrap().set("items", Content::List(Vec::new())).unwrap();
    let list_id = doc.object(root).unwrap().child("items").unwrap();
    doc.list(list_id).unwrap().push("x").unwrap();
    doc.list(list_id).unwrap().push("y").unwrap();

    let list = doc.list(list_id).unwrap();
    let first = list.child(0).unwrap();
    assert_eq!(list.index_of(first), Some(0));
    let ids: Vec<_> = list.iter().collect();
    assert_eq!(ids.len(), 2);
    let mut count = 0;
    list.for_each(|_| count += 1);
    assert_eq!(count, 2);
}

#[test]
fn map_holding_list_of_registers_delete_and_undo() {
    let (_out, sink) = outbox();
    let mut doc = Document::from(BTreeMap::new(), 1, sink);
    let root = doc.root();
    doc.object(root).unwrap().set("tags", Content::Map(BTreeMap::new())).unwrap();
    let map_id = doc.object(root).unwrap().child("tags").unwrap();

    doc.map(map_id).unwrap().set("colors", Content::List(vec![
        Content::from("red"),
        Content::from("blue"),
    ])).unwrap();
    let list_id = doc.map(map_id).unwrap().child("colors").unwrap();
    assert_eq!(doc.list(list_id).unwrap().to_array(), vec!["red", "blue"]);

    doc.map(map_id).unwrap().delete("colors").unwrap();
    assert!(!doc.map(map_id).unwrap().has("colors"));
    assert!(doc.list(list_id).is_err());

    doc.undo().unwrap();
    let list_id = doc.map(map_id).unwrap().child("colors").unwrap();
    assert_eq!(doc.list(list_id).unwrap().to_array(), vec!["red", "blue"]);
}

#[test]
fn global_subscriber_sees_every_commit_in_registration_order() {
    let (_out, sink) = outbox();
    let mut fields = BTreeMap::new();
    fields.insert("a".to_string(), Content::from(1i64));
    let mut doc = Document::from(fields, 1, sink);
    let root = doc.root();

    let order = Rc::new(RefCell::new(Vec::new()));
    let order1 = order.clone();
    let order2 = order.clone();
    let _first = doc.subscribe(move |_| order1.borrow_mut().push(1));
    let _second = doc.subscribe(move |_| order2.borrow_mut().push(2));

    doc.object(root).unwrap().set("a", 2i64).unwrap();
    doc.object(root).unwrap().set("a", 3i64).unwrap();

    assert_eq!(*order.borrow(), vec![1, 2, 1, 2]);
}

#[test]
fn subscriber_sees_exactly_the_touched_nodes() {
    let (_out, sink) = outbox();
    let mut fields = BTreeMap::new();
    fields.insert("a".to_string(), Content::from(1i64));
    let mut doc = Document::from(fields, 1, sink);
    let root = doc.root();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen2 = seen.clone();
    let _disposer = doc.subscribe_node(root, move |modified| {
        seen2.borrow_mut().push(modified.to_vec());
    });

    doc.object(root).unwrap().set("a", 2i64).unwrap();
    assert_eq!(seen.borrow().len(), 1);
    assert!(seen.borrow()[0].contains(&root));
}
