//! Replicated canvas document backed by a `yrs` doc.
//!
//! Items live in a single `yrs` map (`"items"`) keyed by [`ItemId`]; each
//! item is a nested map with one key per field (see [`crate::fields`]). A
//! decoded copy is cached so reads never touch the CRDT. All writes go
//! through [`Document::transaction`], which stages edits and commits them in
//! one `yrs` transaction:
//!
//! ```text
//! transaction(f) ──► f(&mut Transaction)   (staged, nothing visible)
//!        │ Ok
//!        ▼
//!   yrs txn: changed fields only ──► encode_update_v1 ──► on_update
//!        │
//!        ▼
//!   cache updated ──► on_node_changed / on_tree_changed (one event)
//! ```

use crate::error::{DocumentError, Result};
use crate::events::{Emitter, Subscription};
use crate::fields::{self, Fields};
use crate::model::{
    normalize_degrees, ChangeEvent, ChangeOrigin, ChangeSet, Comment, Item, ItemChange,
    ItemContent, ItemId,
};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, Map, MapPrelim, MapRef, Out, ReadTxn, StateVector, Transact, TransactionMut, Update,
};

const ITEMS_MAP: &str = "items";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentKind {
    /// The shared document every participant sees.
    Main,
    /// A private fork created by [`Document::fork`].
    Branch,
}

struct DocInner {
    id: Uuid,
    kind: DocumentKind,
    doc: Doc,
    items: MapRef,
    cache: RefCell<BTreeMap<ItemId, Item>>,
    tree_changed: Emitter<ChangeEvent>,
    node_changed: RefCell<HashMap<ItemId, Emitter<ItemChange>>>,
    updates: Emitter<Vec<u8>>,
    in_transaction: Cell<bool>,
    disposed: Cell<bool>,
}

/// Handle to a replicated canvas document. Clones share the same document.
#[derive(Clone)]
pub struct Document {
    inner: Rc<DocInner>,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("items", &self.inner.cache.borrow().len())
            .field("disposed", &self.inner.disposed.get())
            .finish()
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Empty main document.
    pub fn new() -> Self {
        Self::with_kind(DocumentKind::Main, Doc::new())
    }

    /// Main document initialized from a full-state update
    /// (see [`Document::encode_state`]).
    pub fn load(state: &[u8]) -> Result<Self> {
        let document = Self::new();
        document.integrate(state, ChangeOrigin::Remote)?;
        Ok(document)
    }

    fn with_kind(kind: DocumentKind, doc: Doc) -> Self {
        let items = doc.get_or_insert_map(ITEMS_MAP);
        Self {
            inner: Rc::new(DocInner {
                id: Uuid::new_v4(),
                kind,
                doc,
                items,
                cache: RefCell::new(BTreeMap::new()),
                tree_changed: Emitter::new(),
                node_changed: RefCell::new(HashMap::new()),
                updates: Emitter::new(),
                in_transaction: Cell::new(false),
                disposed: Cell::new(false),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn kind(&self) -> DocumentKind {
        self.inner.kind
    }

    pub fn is_branch(&self) -> bool {
        self.inner.kind == DocumentKind::Branch
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    /// True when both handles point at the same document.
    pub fn same_as(&self, other: &Document) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // ─── Reads ───────────────────────────────────────────────

    pub fn get(&self, id: &ItemId) -> Option<Item> {
        self.inner.cache.borrow().get(id).cloned()
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.inner.cache.borrow().contains_key(id)
    }

    /// All items, ordered by id.
    pub fn items(&self) -> Vec<Item> {
        self.inner.cache.borrow().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.cache.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The group containing `id`, if any.
    pub fn parent_of(&self, id: &ItemId) -> Option<Item> {
        let cache = self.inner.cache.borrow();
        let parent = cache.get(id)?.parent.as_ref()?;
        cache.get(parent).cloned()
    }

    pub fn children_of(&self, id: &ItemId) -> Vec<Item> {
        self.inner
            .cache
            .borrow()
            .values()
            .filter(|item| item.parent.as_ref() == Some(id))
            .cloned()
            .collect()
    }

    /// Items not contained in any group.
    pub fn roots(&self) -> Vec<Item> {
        self.inner
            .cache
            .borrow()
            .values()
            .filter(|item| item.parent.is_none())
            .cloned()
            .collect()
    }

    // ─── Writes ──────────────────────────────────────────────

    /// Run `f` against a staging view and commit its edits atomically.
    ///
    /// If `f` returns an error nothing is written and no event fires.
    /// Otherwise every touched item is written in one CRDT transaction and a
    /// single change event is emitted. Opening a transaction from inside
    /// another one on the same document fails with
    /// [`DocumentError::NestedTransaction`].
    pub fn transaction<F>(&self, f: F) -> Result<ChangeSet>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<()>,
    {
        self.ensure_live()?;
        if self.inner.in_transaction.replace(true) {
            return Err(DocumentError::NestedTransaction);
        }

        let staged = {
            let _open = OpenTransaction(&self.inner.in_transaction);
            let mut tx = Transaction {
                base: &self.inner.cache,
                staged: BTreeMap::new(),
            };
            f(&mut tx)?;
            tx.staged
        };
        self.commit(staged, ChangeOrigin::Local)
    }

    /// Write item states directly, bypassing validation. Used to replay
    /// recorded history.
    pub(crate) fn apply_states(
        &self,
        states: BTreeMap<ItemId, Option<Item>>,
        origin: ChangeOrigin,
    ) -> Result<ChangeSet> {
        self.ensure_live()?;
        if self.inner.in_transaction.get() {
            return Err(DocumentError::NestedTransaction);
        }
        self.commit(states, origin)
    }

    fn commit(
        &self,
        staged: BTreeMap<ItemId, Option<Item>>,
        origin: ChangeOrigin,
    ) -> Result<ChangeSet> {
        let mut changes = Vec::new();
        {
            let cache = self.inner.cache.borrow();
            for (id, after) in staged {
                let before = cache.get(&id).cloned();
                if before != after {
                    changes.push(ItemChange { id, before, after });
                }
            }
        }

        if changes.is_empty() {
            return Ok(ChangeSet::default());
        }

        let update = {
            let mut txn = self.inner.doc.transact_mut();
            for change in &changes {
                match &change.after {
                    Some(after) => {
                        self.write_fields(&mut txn, &change.id, change.before.as_ref(), after)
                    }
                    None => {
                        self.inner.items.remove(&mut txn, change.id.as_str());
                    }
                }
            }
            txn.encode_update_v1()
        };

        {
            let mut cache = self.inner.cache.borrow_mut();
            for change in &changes {
                match &change.after {
                    Some(item) => {
                        cache.insert(change.id.clone(), item.clone());
                    }
                    None => {
                        cache.remove(&change.id);
                    }
                }
            }
        }

        let changes = ChangeSet { changes };
        log::debug!(
            "Committed {} item change(s) on {:?} document ({:?})",
            changes.len(),
            self.inner.kind,
            origin
        );
        self.inner.updates.emit(&update);
        self.notify(origin, &changes);
        Ok(changes)
    }

    /// Write only the fields that differ from `before`. New items, and
    /// items whose nested map is gone, get a fresh map.
    fn write_fields(
        &self,
        txn: &mut TransactionMut<'_>,
        id: &ItemId,
        before: Option<&Item>,
        after: &Item,
    ) {
        let new = fields::to_fields(after);
        let existing = match (before, self.inner.items.get(&*txn, id.as_str())) {
            (Some(before), Some(Out::YMap(map))) => Some((fields::to_fields(before), map)),
            _ => None,
        };

        match existing {
            Some((old, map)) => {
                for (key, value) in &new {
                    if old.get(key) != Some(value) {
                        map.insert(txn, key.as_str(), value.clone());
                    }
                }
                for key in old.keys().filter(|key| !new.contains_key(*key)) {
                    map.remove(txn, key);
                }
            }
            None => {
                self.inner
                    .items
                    .insert(txn, id.to_string(), new.into_iter().collect::<MapPrelim>());
            }
        }
    }

    // ─── Replication ─────────────────────────────────────────

    /// Integrate a v1 update produced by a peer's [`Document::on_update`].
    pub fn apply_remote_update(&self, update: &[u8]) -> Result<ChangeSet> {
        self.ensure_live()?;
        if self.inner.in_transaction.get() {
            return Err(DocumentError::NestedTransaction);
        }
        self.integrate(update, ChangeOrigin::Remote)
    }

    /// Apply `update` to the CRDT, then diff the decoded items against the
    /// cache to find what actually changed.
    pub(crate) fn integrate(&self, update: &[u8], origin: ChangeOrigin) -> Result<ChangeSet> {
        let update = Update::decode_v1(update)?;
        {
            let mut txn = self.inner.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DocumentError::Crdt(e.to_string()))?;
        }

        let fresh = self.read_items();
        let changes = {
            let mut cache = self.inner.cache.borrow_mut();
            let changes = diff_items(&cache, &fresh);
            *cache = fresh;
            changes
        };

        if !changes.is_empty() {
            log::debug!(
                "Integrated {} item change(s) into {:?} document ({:?})",
                changes.len(),
                self.inner.kind,
                origin
            );
            self.notify(origin, &changes);
        }
        Ok(changes)
    }

    fn read_items(&self) -> BTreeMap<ItemId, Item> {
        let txn = self.inner.doc.transact();
        let mut items = BTreeMap::new();
        for (key, value) in self.inner.items.iter(&txn) {
            let Out::YMap(map) = value else {
                log::warn!("Skipping non-map value under item key {}", key);
                continue;
            };
            let values: Fields = map
                .iter(&txn)
                .filter_map(|(field, value)| match value {
                    Out::Any(any) => Some((field.to_string(), any)),
                    _ => None,
                })
                .collect();
            match fields::from_fields(ItemId::from(key), &values) {
                Some(item) => {
                    items.insert(item.id.clone(), item);
                }
                None => log::warn!("Skipping malformed item {}", key),
            }
        }
        items
    }

    /// Full document state as a v1 update, for late joiners.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.inner.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encoded state vector of this replica.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.inner.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that the peer described by
    /// `remote_state_vector` is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)?;
        let txn = self.inner.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Spawn a branch document holding a copy of this document's state.
    pub(crate) fn fork_document(&self) -> Result<Document> {
        self.ensure_live()?;
        if self.is_branch() {
            return Err(DocumentError::InvalidSessionState(
                "a branch cannot be forked".to_string(),
            ));
        }
        if self.inner.in_transaction.get() {
            return Err(DocumentError::NestedTransaction);
        }

        let branch = Self::with_kind(DocumentKind::Branch, Doc::new());
        {
            let state = self.encode_state();
            let update = Update::decode_v1(&state)?;
            let mut txn = branch.inner.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DocumentError::Crdt(e.to_string()))?;
        }
        *branch.inner.cache.borrow_mut() = self.inner.cache.borrow().clone();

        log::debug!("Forked document {} into branch {}", self.inner.id, branch.inner.id);
        Ok(branch)
    }

    // ─── Events ──────────────────────────────────────────────

    /// Fires once per commit, remote integration, merge, undo, or redo.
    pub fn on_tree_changed<F>(&self, f: F) -> Subscription
    where
        F: FnMut(&ChangeEvent) + 'static,
    {
        self.inner.tree_changed.subscribe(f)
    }

    /// Fires when the item `id` is created, modified, or deleted.
    pub fn on_node_changed<F>(&self, id: &ItemId, f: F) -> Subscription
    where
        F: FnMut(&ItemChange) + 'static,
    {
        let mut emitters = self.inner.node_changed.borrow_mut();
        emitters.retain(|_, emitter| !emitter.is_empty());
        emitters.entry(id.clone()).or_default().subscribe(f)
    }

    /// Outbound replication deltas (yrs v1 updates) for every local write.
    pub fn on_update<F>(&self, mut f: F) -> Subscription
    where
        F: FnMut(&[u8]) + 'static,
    {
        self.inner.updates.subscribe(move |update: &Vec<u8>| f(update))
    }

    pub(crate) fn broadcast_update(&self, update: &[u8]) {
        self.inner.updates.emit(&update.to_vec());
    }

    fn notify(&self, origin: ChangeOrigin, changes: &ChangeSet) {
        if changes.is_empty() {
            return;
        }
        let event = ChangeEvent {
            origin,
            changes: changes.clone(),
        };

        let targeted: Vec<(Emitter<ItemChange>, &ItemChange)> = {
            let emitters = self.inner.node_changed.borrow();
            changes
                .changes
                .iter()
                .filter_map(|change| emitters.get(&change.id).map(|e| (e.clone(), change)))
                .collect()
        };
        for (emitter, change) in targeted {
            emitter.emit(change);
        }

        self.inner.tree_changed.emit(&event);
    }

    // ─── Lifecycle ───────────────────────────────────────────

    /// Mark this document unusable and drop every listener. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.replace(true) {
            return;
        }
        self.inner.tree_changed.clear();
        self.inner.updates.clear();
        self.inner.node_changed.borrow_mut().clear();
        log::debug!("Disposed {:?} document {}", self.inner.kind, self.inner.id);
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.inner.disposed.get() {
            return Err(DocumentError::InvalidSessionState(format!(
                "document {} has been disposed",
                self.inner.id
            )));
        }
        Ok(())
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.inner.in_transaction.get()
    }
}

/// Clears the open-transaction flag however the closure exits, unwinding
/// included.
struct OpenTransaction<'a>(&'a Cell<bool>);

impl Drop for OpenTransaction<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

fn diff_items(before: &BTreeMap<ItemId, Item>, after: &BTreeMap<ItemId, Item>) -> ChangeSet {
    let mut changes = Vec::new();
    for (id, old) in before {
        match after.get(id) {
            Some(new) if new == old => {}
            new => changes.push(ItemChange {
                id: id.clone(),
                before: Some(old.clone()),
                after: new.cloned(),
            }),
        }
    }
    for (id, new) in after {
        if !before.contains_key(id) {
            changes.push(ItemChange {
                id: id.clone(),
                before: None,
                after: Some(new.clone()),
            });
        }
    }
    changes.sort_by(|a, b| a.id.cmp(&b.id));
    ChangeSet { changes }
}

// ─── Transaction ─────────────────────────────────────────────

/// Staging view handed to [`Document::transaction`].
///
/// Reads see the committed document overlaid with this transaction's own
/// edits. Nothing is visible outside until the closure returns `Ok`.
pub struct Transaction<'a> {
    base: &'a RefCell<BTreeMap<ItemId, Item>>,
    staged: BTreeMap<ItemId, Option<Item>>,
}

impl<'a> Transaction<'a> {
    pub fn get(&self, id: &ItemId) -> Option<Item> {
        match self.staged.get(id) {
            Some(staged) => staged.clone(),
            None => self.base.borrow().get(id).cloned(),
        }
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        match self.staged.get(id) {
            Some(staged) => staged.is_some(),
            None => self.base.borrow().contains_key(id),
        }
    }

    pub fn items(&self) -> Vec<Item> {
        let base = self.base.borrow();
        let mut merged: BTreeMap<&ItemId, &Item> = base.iter().collect();
        for (id, staged) in &self.staged {
            match staged {
                Some(item) => {
                    merged.insert(id, item);
                }
                None => {
                    merged.remove(id);
                }
            }
        }
        let items = merged.into_values().cloned().collect();
        items
    }

    pub fn children_of(&self, id: &ItemId) -> Vec<Item> {
        self.items()
            .into_iter()
            .filter(|item| item.parent.as_ref() == Some(id))
            .collect()
    }

    /// Stage a new item. Its parent, if any, must be an existing group.
    pub fn insert(&mut self, mut item: Item) -> Result<ItemId> {
        if self.contains(&item.id) {
            return Err(DocumentError::DuplicateItem(item.id));
        }
        if let Some(parent) = &item.parent {
            self.check_parent(&item.id, parent)?;
        }
        item.rotation = normalize_degrees(item.rotation);
        let id = item.id.clone();
        self.staged.insert(id.clone(), Some(item));
        Ok(id)
    }

    /// Modify an existing item in place. The id cannot be changed.
    pub fn update<F>(&mut self, id: &ItemId, f: F) -> Result<()>
    where
        F: FnOnce(&mut Item),
    {
        let mut item = self
            .get(id)
            .ok_or_else(|| DocumentError::NotFound(id.clone()))?;
        let old_parent = item.parent.clone();
        f(&mut item);
        item.id = id.clone();
        item.rotation = normalize_degrees(item.rotation);
        if item.parent != old_parent {
            if let Some(parent) = &item.parent {
                self.check_parent(id, parent)?;
            }
        }
        self.staged.insert(id.clone(), Some(item));
        Ok(())
    }

    pub fn set_position(&mut self, id: &ItemId, x: f64, y: f64) -> Result<()> {
        self.update(id, |item| {
            item.x = x;
            item.y = y;
        })
    }

    pub fn set_rotation(&mut self, id: &ItemId, degrees: f64) -> Result<()> {
        self.update(id, |item| item.rotation = degrees)
    }

    pub fn set_color(&mut self, id: &ItemId, color: &str) -> Result<()> {
        let item = self
            .get(id)
            .ok_or_else(|| DocumentError::NotFound(id.clone()))?;
        if !matches!(item.content, ItemContent::Shape(_)) {
            return Err(DocumentError::InvalidOperation(format!(
                "item {} is not a shape",
                id
            )));
        }
        self.update(id, |item| {
            if let ItemContent::Shape(shape) = &mut item.content {
                shape.color = color.to_string();
            }
        })
    }

    pub fn set_text(&mut self, id: &ItemId, text: &str) -> Result<()> {
        let item = self
            .get(id)
            .ok_or_else(|| DocumentError::NotFound(id.clone()))?;
        if !matches!(item.content, ItemContent::Note(_)) {
            return Err(DocumentError::InvalidOperation(format!(
                "item {} is not a note",
                id
            )));
        }
        self.update(id, |item| {
            if let ItemContent::Note(note) = &mut item.content {
                note.text = text.to_string();
            }
        })
    }

    pub fn toggle_vote(&mut self, id: &ItemId, user: &str) -> Result<()> {
        self.update(id, |item| item.toggle_vote(user))
    }

    /// Attach `comment` to an item. Comment ids must be unique on the item
    /// and may not contain `:`.
    pub fn add_comment(&mut self, id: &ItemId, comment: Comment) -> Result<()> {
        let item = self
            .get(id)
            .ok_or_else(|| DocumentError::NotFound(id.clone()))?;
        if comment.id.is_empty() || comment.id.contains(':') {
            return Err(DocumentError::InvalidOperation(format!(
                "invalid comment id {:?}",
                comment.id
            )));
        }
        if item.comment(&comment.id).is_some() {
            return Err(DocumentError::InvalidOperation(format!(
                "comment {} already exists on {}",
                comment.id, id
            )));
        }
        self.update(id, move |item| {
            item.comments.push(comment);
            item.comments.sort_by(Comment::chronological);
        })
    }

    pub fn remove_comment(&mut self, id: &ItemId, comment_id: &str) -> Result<()> {
        self.require_comment(id, comment_id)?;
        self.update(id, |item| item.comments.retain(|c| c.id != comment_id))
    }

    pub fn toggle_comment_vote(&mut self, id: &ItemId, comment_id: &str, user: &str) -> Result<()> {
        self.require_comment(id, comment_id)?;
        self.update(id, |item| {
            if let Some(comment) = item.comments.iter_mut().find(|c| c.id == comment_id) {
                comment.toggle_vote(user);
            }
        })
    }

    fn require_comment(&self, id: &ItemId, comment_id: &str) -> Result<()> {
        let item = self
            .get(id)
            .ok_or_else(|| DocumentError::NotFound(id.clone()))?;
        if item.comment(comment_id).is_none() {
            return Err(DocumentError::InvalidOperation(format!(
                "no comment {} on {}",
                comment_id, id
            )));
        }
        Ok(())
    }

    /// Move an item into `parent`, or to the top level with `None`.
    pub fn move_to(&mut self, id: &ItemId, parent: Option<&ItemId>) -> Result<()> {
        let parent = parent.cloned();
        self.update(id, move |item| item.parent = parent)
    }

    /// Delete an item and everything nested under it. Returns the removed
    /// ids, the item itself first.
    pub fn remove(&mut self, id: &ItemId) -> Result<Vec<ItemId>> {
        if !self.contains(id) {
            return Err(DocumentError::NotFound(id.clone()));
        }
        let mut removed = vec![id.clone()];
        let mut cursor = 0;
        while cursor < removed.len() {
            let children = self.children_of(&removed[cursor]);
            removed.extend(children.into_iter().map(|child| child.id));
            cursor += 1;
        }
        for id in &removed {
            self.staged.insert(id.clone(), None);
        }
        Ok(removed)
    }

    /// Number of items touched so far.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    fn check_parent(&self, item: &ItemId, parent: &ItemId) -> Result<()> {
        let invalid = |reason: &str| DocumentError::InvalidParent {
            item: item.clone(),
            reason: reason.to_string(),
        };
        if parent == item {
            return Err(invalid("an item cannot contain itself"));
        }
        let group = self.get(parent).ok_or_else(|| invalid("parent does not exist"))?;
        if !group.is_group() {
            return Err(invalid("parent is not a group"));
        }

        // Walk up from the new parent; reaching `item` would close a cycle.
        let mut ancestor = group.parent;
        while let Some(current) = ancestor {
            if &current == item {
                return Err(invalid("parent is nested inside the item"));
            }
            ancestor = self.get(&current).and_then(|i| i.parent);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with_shape() -> (Document, ItemId) {
        let doc = Document::new();
        let shape = Item::shape(10.0, 20.0, 60.0, "#FF0000", "circle");
        let id = shape.id.clone();
        doc.transaction(|tx| tx.insert(shape).map(|_| ())).unwrap();
        (doc, id)
    }

    #[test]
    fn test_insert_and_read_back() {
        let (doc, id) = doc_with_shape();
        assert_eq!(doc.len(), 1);
        let item = doc.get(&id).unwrap();
        assert_eq!(item.x, 10.0);
        assert_eq!(item.color(), Some("#FF0000"));
    }

    #[test]
    fn test_transaction_is_all_or_nothing() {
        let (doc, id) = doc_with_shape();
        let result = doc.transaction(|tx| {
            tx.set_position(&id, 99.0, 99.0)?;
            tx.insert(Item::group(0.0, 0.0))?;
            Err(DocumentError::Aborted("user cancelled".into()))
        });
        assert!(matches!(result, Err(DocumentError::Aborted(_))));
        assert_eq!(doc.len(), 1);
        assert_eq!(doc.get(&id).unwrap().x, 10.0);
    }

    #[test]
    fn test_one_event_per_transaction() {
        let (doc, id) = doc_with_shape();
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        let _sub = doc.on_tree_changed(move |e| sink.borrow_mut().push(e.clone()));

        doc.transaction(|tx| {
            tx.set_color(&id, "#00FF00")?;
            tx.insert(Item::note(0.0, 0.0, "hello", "ann"))?;
            tx.insert(Item::note(5.0, 5.0, "world", "ann"))?;
            Ok(())
        })
        .unwrap();

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].origin, ChangeOrigin::Local);
        assert_eq!(events[0].changes.len(), 3);
    }

    #[test]
    fn test_noop_transaction_emits_nothing() {
        let (doc, id) = doc_with_shape();
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let _sub = doc.on_tree_changed(move |_| c.set(c.get() + 1));

        let changes = doc.transaction(|tx| tx.set_position(&id, 10.0, 20.0)).unwrap();
        assert!(changes.is_empty());
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn test_nested_transaction_rejected() {
        let (doc, id) = doc_with_shape();
        let inner = doc.clone();
        let result = doc.transaction(|tx| {
            tx.set_position(&id, 1.0, 1.0)?;
            inner.transaction(|_| Ok(()))?;
            Ok(())
        });
        assert!(matches!(result, Err(DocumentError::NestedTransaction)));
        assert_eq!(doc.get(&id).unwrap().x, 10.0);
        // The document is usable again afterwards.
        doc.transaction(|tx| tx.set_position(&id, 2.0, 2.0)).unwrap();
        assert_eq!(doc.get(&id).unwrap().x, 2.0);
    }

    #[test]
    fn test_panicking_closure_releases_transaction() {
        let (doc, id) = doc_with_shape();
        let inner = doc.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            inner.transaction(|tx| {
                tx.set_position(&id, 99.0, 99.0)?;
                panic!("layout callback failed");
            })
        }));
        assert!(result.is_err());
        assert!(!doc.in_transaction());
        assert_eq!(doc.get(&id).unwrap().x, 10.0);

        doc.transaction(|tx| tx.set_position(&id, 3.0, 4.0)).unwrap();
        assert_eq!(doc.get(&id).unwrap().x, 3.0);
    }

    #[test]
    fn test_update_missing_item_is_not_found() {
        let doc = Document::new();
        let missing = ItemId::from("gone");
        let result = doc.transaction(|tx| tx.set_rotation(&missing, 45.0));
        assert!(matches!(result, Err(DocumentError::NotFound(id)) if id == missing));
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let (doc, id) = doc_with_shape();
        let mut copy = doc.get(&id).unwrap();
        copy.x = 0.0;
        let result = doc.transaction(|tx| tx.insert(copy).map(|_| ()));
        assert!(matches!(result, Err(DocumentError::DuplicateItem(_))));
    }

    #[test]
    fn test_set_color_on_note_is_invalid() {
        let doc = Document::new();
        let note = Item::note(0.0, 0.0, "n", "a");
        let id = note.id.clone();
        doc.transaction(|tx| tx.insert(note).map(|_| ())).unwrap();
        let result = doc.transaction(|tx| tx.set_color(&id, "#000000"));
        assert!(matches!(result, Err(DocumentError::InvalidOperation(_))));
    }

    #[test]
    fn test_rotation_is_normalized() {
        let (doc, id) = doc_with_shape();
        doc.transaction(|tx| tx.set_rotation(&id, -45.0)).unwrap();
        assert_eq!(doc.get(&id).unwrap().rotation, 315.0);
    }

    #[test]
    fn test_parent_must_be_group() {
        let (doc, shape_id) = doc_with_shape();
        let child = Item::note(0.0, 0.0, "n", "a").within(&shape_id);
        let result = doc.transaction(|tx| tx.insert(child).map(|_| ()));
        assert!(matches!(result, Err(DocumentError::InvalidParent { .. })));
    }

    #[test]
    fn test_group_cycle_rejected() {
        let doc = Document::new();
        let outer = Item::group(0.0, 0.0);
        let inner = Item::group(0.0, 0.0).within(&outer.id);
        let (outer_id, inner_id) = (outer.id.clone(), inner.id.clone());
        doc.transaction(|tx| {
            tx.insert(outer)?;
            tx.insert(inner)?;
            Ok(())
        })
        .unwrap();

        let result = doc.transaction(|tx| tx.move_to(&outer_id, Some(&inner_id)));
        assert!(matches!(result, Err(DocumentError::InvalidParent { .. })));
    }

    #[test]
    fn test_remove_deletes_subtree() {
        let doc = Document::new();
        let group = Item::group(0.0, 0.0);
        let nested = Item::group(1.0, 1.0).within(&group.id);
        let leaf = Item::note(2.0, 2.0, "leaf", "a").within(&nested.id);
        let other = Item::shape(3.0, 3.0, 10.0, "#fff", "square");
        let group_id = group.id.clone();
        let other_id = other.id.clone();
        doc.transaction(|tx| {
            for item in [group, nested, leaf, other] {
                tx.insert(item)?;
            }
            Ok(())
        })
        .unwrap();

        let changes = doc.transaction(|tx| tx.remove(&group_id).map(|_| ())).unwrap();
        assert_eq!(changes.len(), 3);
        assert!(changes.changes.iter().all(ItemChange::is_delete));
        assert_eq!(doc.len(), 1);
        assert!(doc.contains(&other_id));
    }

    #[test]
    fn test_parent_and_children_navigation() {
        let doc = Document::new();
        let group = Item::group(0.0, 0.0);
        let child = Item::note(1.0, 1.0, "c", "a").within(&group.id);
        let (group_id, child_id) = (group.id.clone(), child.id.clone());
        doc.transaction(|tx| {
            tx.insert(group)?;
            tx.insert(child)?;
            Ok(())
        })
        .unwrap();

        assert_eq!(doc.parent_of(&child_id).unwrap().id, group_id);
        assert!(doc.parent_of(&group_id).is_none());
        assert_eq!(doc.children_of(&group_id).len(), 1);
        assert_eq!(doc.roots().len(), 1);
    }

    #[test]
    fn test_node_listener_only_sees_its_item() {
        let (doc, id) = doc_with_shape();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let _sub = doc.on_node_changed(&id, move |change| {
            assert!(change.before.is_some());
            h.set(h.get() + 1);
        });

        doc.transaction(|tx| tx.insert(Item::group(0.0, 0.0)).map(|_| ()))
            .unwrap();
        doc.transaction(|tx| tx.toggle_vote(&id, "ann")).unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_remote_update_converges() {
        let a = Document::new();
        let b = Document::new();
        let outbox = Rc::new(RefCell::new(Vec::new()));
        let sink = outbox.clone();
        let _sub = a.on_update(move |update| sink.borrow_mut().push(update.to_vec()));

        let shape = Item::shape(1.0, 2.0, 30.0, "#123456", "star");
        let id = shape.id.clone();
        a.transaction(|tx| tx.insert(shape).map(|_| ())).unwrap();

        let origins = Rc::new(RefCell::new(Vec::new()));
        let seen = origins.clone();
        let _watch = b.on_tree_changed(move |e| seen.borrow_mut().push(e.origin));

        for update in outbox.borrow().iter() {
            b.apply_remote_update(update).unwrap();
        }
        assert_eq!(b.get(&id), a.get(&id));
        assert_eq!(*origins.borrow(), vec![ChangeOrigin::Remote]);
    }

    #[test]
    fn test_load_from_state_and_diff() {
        let (a, id) = doc_with_shape();
        let b = Document::load(&a.encode_state()).unwrap();
        assert_eq!(b.get(&id), a.get(&id));

        a.transaction(|tx| tx.set_position(&id, 5.0, 5.0)).unwrap();
        let diff = a.encode_diff(&b.state_vector()).unwrap();
        b.apply_remote_update(&diff).unwrap();
        assert_eq!(b.get(&id).unwrap().x, 5.0);
    }

    /// Ship everything `to` is missing from `from`.
    fn sync(from: &Document, to: &Document) {
        let diff = from.encode_diff(&to.state_vector()).unwrap();
        to.apply_remote_update(&diff).unwrap();
    }

    #[test]
    fn test_concurrent_field_edits_on_same_item_both_survive() {
        let (a, id) = doc_with_shape();
        let b = Document::load(&a.encode_state()).unwrap();

        a.transaction(|tx| tx.set_position(&id, 70.0, 80.0)).unwrap();
        b.transaction(|tx| {
            tx.set_color(&id, "#00FF00")?;
            tx.toggle_vote(&id, "bob")
        })
        .unwrap();
        sync(&a, &b);
        sync(&b, &a);

        for doc in [&a, &b] {
            let item = doc.get(&id).unwrap();
            assert_eq!((item.x, item.y), (70.0, 80.0));
            assert_eq!(item.color(), Some("#00FF00"));
            assert!(item.has_voted("bob"));
        }
        assert_eq!(a.get(&id), b.get(&id));
    }

    #[test]
    fn test_concurrent_votes_from_two_users_merge() {
        let (a, id) = doc_with_shape();
        let b = Document::load(&a.encode_state()).unwrap();
        a.transaction(|tx| tx.toggle_vote(&id, "ann")).unwrap();
        b.transaction(|tx| tx.toggle_vote(&id, "bob")).unwrap();
        sync(&a, &b);
        sync(&b, &a);
        let votes: Vec<String> = a.get(&id).unwrap().votes.into_iter().collect();
        assert_eq!(votes, vec!["ann".to_string(), "bob".to_string()]);
        assert_eq!(a.get(&id), b.get(&id));
    }

    #[test]
    fn test_comments_add_vote_remove() {
        let (doc, id) = doc_with_shape();
        let first = Comment::new("too red", "ann");
        let first_id = first.id.clone();
        doc.transaction(|tx| {
            tx.add_comment(&id, first)?;
            tx.toggle_comment_vote(&id, &first_id, "bob")
        })
        .unwrap();

        let peer = Document::load(&doc.encode_state()).unwrap();
        let comment = peer.get(&id).unwrap().comment(&first_id).cloned().unwrap();
        assert_eq!(comment.text, "too red");
        assert_eq!(comment.user_id, "ann");
        assert!(comment.votes.contains("bob"));

        let mut clash = Comment::new("dup", "cy");
        clash.id = first_id.clone();
        let result = doc.transaction(|tx| tx.add_comment(&id, clash));
        assert!(matches!(result, Err(DocumentError::InvalidOperation(_))));

        doc.transaction(|tx| tx.remove_comment(&id, &first_id)).unwrap();
        assert!(doc.get(&id).unwrap().comments.is_empty());
        let result = doc.transaction(|tx| tx.remove_comment(&id, &first_id));
        assert!(matches!(result, Err(DocumentError::InvalidOperation(_))));
    }

    #[test]
    fn test_malformed_update_is_an_error() {
        let doc = Document::new();
        assert!(doc.apply_remote_update(&[0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_disposed_document_rejects_writes() {
        let (doc, id) = doc_with_shape();
        doc.dispose();
        let result = doc.transaction(|tx| tx.set_position(&id, 0.0, 0.0));
        assert!(matches!(result, Err(DocumentError::InvalidSessionState(_))));
    }
}
