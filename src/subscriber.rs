//! Synchronous subscription bus: a global observer notified of every commit
//! and per-node observers notified only when their node was touched (§5).
use crate::id::Id;
use std::collections::HashMap;
use std::rc::Rc;

/// A modification notification: the set of node ids touched by one commit.
pub struct Change<'a> {
    pub modified: &'a [Id],
}

type GlobalCallback = Box<dyn FnMut(&Change<'_>)>;
type NodeCallback = Box<dyn FnMut(&Change<'_>)>;

/// Revokes a subscription when dropped or explicitly told to via
/// [`Disposer::dispose`]. Modeled as an owned guard rather than a bare id so
/// a caller can't double-unsubscribe or leak a dangling handle.
pub struct Disposer {
    kind: DisposerKind,
}

enum DisposerKind {
    Global(u64, Rc<std::cell::RefCell<SubscriberBus>>),
    Node(Id, u64, Rc<std::cell::RefCell<SubscriberBus>>),
    Noop,
}

impl Disposer {
    pub fn dispose(self) {
        // Dropping runs the same logic; this just makes the intent explicit
        // at the call site.
        drop(self);
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        match &self.kind {
            DisposerKind::Global(token, bus) => {
                bus.borrow_mut().globals.retain(|(t, _)| t != token);
            }
            DisposerKind::Node(id, token, bus) => {
                if let Some(subs) = bus.borrow_mut().per_node.get_mut(id) {
                    subs.retain(|(t, _)| t != token);
                }
            }
            DisposerKind::Noop => {}
        }
    }
}

#[derive(Default)]
pub(crate) struct SubscriberBus {
    next_token: u64,
    globals: Vec<(u64, GlobalCallback)>,
    per_node: HashMap<Id, Vec<(u64, NodeCallback)>>,
}

impl SubscriberBus {
    pub fn new() -> Rc<std::cell::RefCell<Self>> {
        Rc::new(std::cell::RefCell::new(Self::default()))
    }
}

/// Registers `callback` to run, in registration order, once per commit,
/// after every per-node subscriber for the nodes touched by that commit.
pub(crate) fn subscribe_global(
    bus: &Rc<std::cell::RefCell<SubscriberBus>>,
    callback: impl FnMut(&Change<'_>) + 'static,
) -> Disposer {
    let mut b = bus.borrow_mut();
    let token = b.next_token;
    b.next_token += 1;
    b.globals.push((token, Box::new(callback)));
    drop(b);
    Disposer {
        kind: DisposerKind::Global(token, Rc::clone(bus)),
    }
}

/// Registers `callback` to run, in registration order, whenever a commit's
/// modified set contains `id`.
pub(crate) fn subscribe_node(
    bus: &Rc<std::cell::RefCell<SubscriberBus>>,
    id: Id,
    callback: impl FnMut(&Change<'_>) + 'static,
) -> Disposer {
    let mut b = bus.borrow_mut();
    let token = b.next_token;
    b.next_token += 1;
    b.per_node
        .entry(id)
        .or_default()
        .push((token, Box::new(callback)));
    drop(b);
    Disposer {
        kind: DisposerKind::Node(id, token, Rc::clone(bus)),
    }
}

/// Notifies every per-node subscriber whose node is in `modified`, then
/// every global subscriber, each synchronously and in registration order.
pub(crate) fn notify(bus: &Rc<std::cell::RefCell<SubscriberBus>>, modified: &[Id]) {
    if modified.is_empty() {
        return;
    }
    let change = Change { modified };
    for id in modified {
        let mut b = bus.borrow_mut();
        if let Some(subs) = b.per_node.get_mut(id) {
            for (_, cb) in subs.iter_mut() {
                cb(&change);
            }
        }
    }
    let mut b = bus.borrow_mut();
    for (_, cb) in b.globals.iter_mut() {
        cb(&change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn global_subscriber_sees_every_commit() {
        let bus = SubscriberBus::new();
        let seen = Rc::new(StdRefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        let _d = subscribe_global(&bus, move |c| seen2.borrow_mut().push(c.modified.to_vec()));
        notify(&bus, &[Id::new(0, 1)]);
        notify(&bus, &[Id::new(0, 2)]);
        assert_eq!(seen.borrow().len(), 2);
    }

    #[test]
    fn node_subscriber_only_sees_its_own_node() {
        let bus = SubscriberBus::new();
        let hits = Rc::new(StdRefCell::new(0));
        let hits2 = Rc::clone(&hits);
        let target = Id::new(0, 1);
        let _d = subscribe_node(&bus, target, move |_| *hits2.borrow_mut() += 1);
        notify(&bus, &[Id::new(0, 2)]);
        assert_eq!(*hits.borrow(), 0);
        notify(&bus, &[target]);
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn disposing_stops_future_notifications() {
        let bus = SubscriberBus::new();
        let hits = Rc::new(StdRefCell::new(0));
        let hits2 = Rc::clone(&hits);
        let d = subscribe_global(&bus, move |_| *hits2.borrow_mut() += 1);
        notify(&bus, &[Id::new(0, 1)]);
        d.dispose();
        notify(&bus, &[Id::new(0, 1)]);
        assert_eq!(*hits.borrow(), 1);
    }
}
