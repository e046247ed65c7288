//! `List`: an ordered sequence of child nodes keyed by dense [`Position`]
//! (§4.5).
use crate::doc::Document;
use crate::error::Result;
use crate::id::Id;
use crate::node::Content;
use crate::op::Value;
use crate::position::{make_position, Position};

#[derive(Debug, Clone, Default)]
pub(crate) struct ListData {
    /// Kept sorted by position at all times; the position doubles as the
    /// child's `parent_key` in its [`crate::node::NodeLink`].
    items: Vec<(Position, Id)>,
}

impl ListData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Id> {
        self.items.get(index).map(|(_, id)| *id)
    }

    pub fn position_at(&self, index: usize) -> Option<&Position> {
        self.items.get(index).map(|(p, _)| p)
    }

    pub fn index_of(&self, id: Id) -> Option<usize> {
        self.items.iter().position(|(_, child)| *child == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = Id> + '_ {
        self.items.iter().map(|(_, id)| *id)
    }

    /// Every `(position, id)` pair other than `exclude`, in order — the
    /// view a move needs to find fresh neighbors for the item in flight.
    pub fn entries_excluding(&self, exclude: Id) -> Vec<(Position, Id)> {
        self.items
            .iter()
            .filter(|(_, id)| *id != exclude)
            .cloned()
            .collect()
    }

    /// Inserts `(position, id)` at its sorted slot, returning that index.
    pub fn insert_sorted(&mut self, position: Position, id: Id) -> usize {
        let index = self
            .items
            .partition_point(|(existing, _)| existing < &position);
        self.items.insert(index, (position, id));
        index
    }

    /// Removes the entry with the given child id, wherever it sits.
    pub fn remove_id(&mut self, id: Id) -> Option<(usize, Position)> {
        let index = self.index_of(id)?;
        let (position, _) = self.items.remove(index);
        Some((index, position))
    }

    /// Bounds a `before`/`after` pair for minting a fresh position at
    /// `index` (insertion point semantics: `index == len()` is a legal
    /// append).
    pub fn bounds_for_insert(&self, index: usize) -> (Option<&Position>, Option<&Position>) {
        let before = index.checked_sub(1).and_then(|i| self.position_at(i));
        let after = self.position_at(index);
        (before, after)
    }

    /// If a child already sits at exactly `position` (two replicas minted
    /// the same key concurrently), bumps that existing child to a fresh
    /// position between its old slot and whatever follows it, freeing
    /// `position` for the incoming remote creation (§4.5 "conflict
    /// resolution on remote insert").
    pub fn displace_collision(&mut self, position: &Position) {
        let Some(index) = self.items.iter().position(|(p, _)| p == position) else {
            return;
        };
        let (_, id) = self.items.remove(index);
        let next = self.items.get(index).map(|(p, _)| p.clone());
        let bumped = make_position(Some(position), next.as_ref());
        self.insert_sorted(bumped, id);
    }
}

/// A handle onto one `List` node, borrowed from its owning [`Document`].
pub struct List<'a> {
    doc: &'a mut Document,
    id: Id,
}

impl<'a> List<'a> {
    pub(crate) fn new(doc: &'a mut Document, id: Id) -> Self {
        Self { doc, id }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn len(&self) -> usize {
        self.doc.list_data(self.id).map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The id of the child at `index`.
    pub fn child(&self, index: usize) -> Option<Id> {
        self.doc.list_data(self.id).ok()?.get(index)
    }

    /// The index of `id` within this list, if it's a child here.
    pub fn index_of(&self, id: Id) -> Option<usize> {
        self.doc.list_data(self.id).ok()?.index_of(id)
    }

    /// Every child id, in list order.
    pub fn iter(&self) -> impl Iterator<Item = Id> + '_ {
        self.doc.list_data(self.id).ok().into_iter().flat_map(|l| l.ids())
    }

    /// Runs `f` over every child id, in list order.
    pub fn for_each(&self, mut f: impl FnMut(Id)) {
        for id in self.iter() {
            f(id);
        }
    }

    /// Inserts `value` at `index`; `index == len()` appends (§4.5).
    pub fn insert(self, index: usize, value: impl Into<Content>) -> Result<()> {
        self.doc.list_insert(self.id, index, value.into())
    }

    /// Appends `value` to the end of the list.
    pub fn push(self, value: impl Into<Content>) -> Result<()> {
        let index = self.len();
        self.doc.list_insert(self.id, index, value.into())
    }

    /// Removes the item at `index`, which must be `< len()`.
    pub fn delete(self, index: usize) -> Result<()> {
        self.doc.list_delete(self.id, index)
    }

    /// Moves the item at `from` so it sits at `to` in the resulting order.
    pub fn move_item(self, from: usize, to: usize) -> Result<()> {
        self.doc.list_move(self.id, from, to)
    }

    /// Materializes every item into a plain JSON array.
    pub fn to_array(&self) -> Vec<Value> {
        match self.doc.to_json(self.id) {
            Value::Array(items) => items,
            _ => unreachable!("a List node always materializes to a JSON array"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::make_position;

    fn pos(seed: &[Option<&Position>; 2]) -> Position {
        make_position(seed[0], seed[1])
    }

    #[test]
    fn insert_sorted_keeps_order() {
        let mut list = ListData::new();
        let p1 = make_position(None, None);
        let p0 = make_position(None, Some(&p1));
        let p2 = make_position(Some(&p1), None);
        assert_eq!(list.insert_sorted(p1.clone(), Id::new(0, 1)), 0);
        assert_eq!(list.insert_sorted(p0.clone(), Id::new(0, 0)), 0);
        assert_eq!(list.insert_sorted(p2.clone(), Id::new(0, 2)), 2);
        assert_eq!(
            list.ids().collect::<Vec<_>>(),
            vec![Id::new(0, 0), Id::new(0, 1), Id::new(0, 2)]
        );
    }

    #[test]
    fn bounds_for_insert_at_ends() {
        let mut list = ListData::new();
        let p = make_position(None, None);
        list.insert_sorted(p.clone(), Id::new(0, 0));
        let (before, after) = list.bounds_for_insert(0);
        assert_eq!(before, None);
        assert_eq!(after, Some(&p));
        let (before, after) = list.bounds_for_insert(1);
        assert_eq!(before, Some(&p));
        assert_eq!(after, None);
        let _ = pos(&[None, None]);
    }

    #[test]
    fn remove_id_reports_index_and_position() {
        let mut list = ListData::new();
        let p = make_position(None, None);
        list.insert_sorted(p.clone(), Id::new(0, 5));
        let (index, removed) = list.remove_id(Id::new(0, 5)).unwrap();
        assert_eq!(index, 0);
        assert_eq!(removed, p);
        assert!(list.is_empty());
    }
}
