//! Who has what selected.
//!
//! Each participant publishes its whole selection as a list. Entries compare
//! and hash by `id` alone, so the same id with a different `kind` counts as
//! already selected.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use trellis_core::{Document, Item, ItemId};

use crate::attendee::ParticipantId;
use crate::error::Result;
use crate::latest::LatestState;
use crate::presence::Presence;
use crate::watch::PresenceManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectionKind {
    Row,
    Column,
    Cell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionEntry {
    pub id: String,
    pub kind: Option<SelectionKind>,
}

impl SelectionEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: None,
        }
    }

    pub fn with_kind(id: impl Into<String>, kind: SelectionKind) -> Self {
        Self {
            id: id.into(),
            kind: Some(kind),
        }
    }
}

impl PartialEq for SelectionEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SelectionEntry {}

impl Hash for SelectionEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl From<&ItemId> for SelectionEntry {
    fn from(id: &ItemId) -> Self {
        Self::new(id.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SelectionManager {
    state: LatestState<Vec<SelectionEntry>>,
}

impl SelectionManager {
    /// Register the selection channel `name` on `presence`, starting empty.
    pub fn new(presence: &Presence, name: &str) -> Result<Self> {
        Ok(Self {
            state: presence.register_latest(name, Vec::new())?,
        })
    }

    /// Replace the selection. Later duplicates of an id are dropped.
    pub fn set_selection<I>(&self, entries: I)
    where
        I: IntoIterator<Item = SelectionEntry>,
    {
        let mut selection: Vec<SelectionEntry> = Vec::new();
        for entry in entries {
            if !selection.contains(&entry) {
                selection.push(entry);
            }
        }
        self.state.set_local(selection);
    }

    pub fn add_to_selection(&self, entry: SelectionEntry) {
        let mut selection = self.state.local();
        if !selection.contains(&entry) {
            selection.push(entry);
        }
        self.state.set_local(selection);
    }

    pub fn remove_from_selection(&self, entry: &SelectionEntry) {
        let mut selection = self.state.local();
        selection.retain(|s| s != entry);
        self.state.set_local(selection);
    }

    pub fn toggle_selection(&self, entry: SelectionEntry) {
        if self.test_selection(&entry) {
            self.remove_from_selection(&entry);
        } else {
            self.add_to_selection(entry);
        }
    }

    pub fn clear_selection(&self) {
        self.state.set_local(Vec::new());
    }

    /// Is `entry` in the local selection?
    pub fn test_selection(&self, entry: &SelectionEntry) -> bool {
        self.state.with_local(|selection| selection.contains(entry))
    }

    /// Connected participants that have `entry` selected.
    pub fn test_remote_selection(&self, entry: &SelectionEntry) -> Vec<ParticipantId> {
        self.state
            .remotes()
            .into_iter()
            .filter(|remote| remote.attendee.is_connected() && remote.value.contains(entry))
            .map(|remote| remote.attendee.participant_id)
            .collect()
    }

    pub fn local_selection(&self) -> Vec<SelectionEntry> {
        self.state.local()
    }

    /// Every entry selected by a connected participant, with who selected it.
    pub fn remote_selected(&self) -> HashMap<SelectionEntry, Vec<ParticipantId>> {
        let mut selected: HashMap<SelectionEntry, Vec<ParticipantId>> = HashMap::new();
        for remote in self.state.remotes() {
            if !remote.attendee.is_connected() {
                continue;
            }
            for entry in remote.value {
                selected
                    .entry(entry)
                    .or_default()
                    .push(remote.attendee.participant_id);
            }
        }
        selected
    }

    /// Locally selected items that still exist in `doc`.
    pub fn resolve(&self, doc: &Document) -> Vec<Item> {
        self.state.with_local(|selection| {
            selection
                .iter()
                .filter_map(|entry| doc.get(&ItemId::from(entry.id.as_str())))
                .collect()
        })
    }

    /// Drop locally selected ids that no longer exist in `doc`. Publishes
    /// only when something was removed.
    pub fn prune_stale(&self, doc: &Document) -> usize {
        let mut selection = self.state.local();
        let before = selection.len();
        selection.retain(|entry| doc.contains(&ItemId::from(entry.id.as_str())));
        let removed = before - selection.len();
        if removed > 0 {
            self.state.set_local(selection);
        }
        removed
    }
}

impl PresenceManager for SelectionManager {
    type Value = Vec<SelectionEntry>;

    fn channel(&self) -> &LatestState<Vec<SelectionEntry>> {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalBus;
    use proptest::prelude::*;
    use std::cell::Cell;
    use std::collections::HashSet;
    use std::rc::Rc;

    fn manager() -> (LocalBus, Presence, SelectionManager) {
        let bus = LocalBus::new(64);
        let id = ParticipantId::new();
        let presence = Presence::new(id, bus.connect(id));
        presence.connect().unwrap();
        let selection = SelectionManager::new(&presence, "selection:main").unwrap();
        (bus, presence, selection)
    }

    fn ids(entries: &[SelectionEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_equality_ignores_kind() {
        let row = SelectionEntry::with_kind("r1", SelectionKind::Row);
        let plain = SelectionEntry::new("r1");
        assert_eq!(row, plain);
    }

    #[test]
    fn test_set_selection_dedups_keeping_first() {
        let (_bus, _p, selection) = manager();
        selection.set_selection([
            SelectionEntry::with_kind("a", SelectionKind::Cell),
            SelectionEntry::new("b"),
            SelectionEntry::new("a"),
        ]);
        let local = selection.local_selection();
        assert_eq!(ids(&local), vec!["a", "b"]);
        assert_eq!(local[0].kind, Some(SelectionKind::Cell));
    }

    #[test]
    fn test_add_remove_toggle() {
        let (_bus, _p, selection) = manager();
        selection.add_to_selection(SelectionEntry::new("a"));
        selection.add_to_selection(SelectionEntry::new("a"));
        assert_eq!(selection.local_selection().len(), 1);

        selection.toggle_selection(SelectionEntry::new("b"));
        assert!(selection.test_selection(&SelectionEntry::new("b")));
        selection.toggle_selection(SelectionEntry::new("b"));
        assert!(!selection.test_selection(&SelectionEntry::new("b")));

        selection.remove_from_selection(&SelectionEntry::new("a"));
        assert!(selection.local_selection().is_empty());
    }

    #[test]
    fn test_clear_is_idempotent_and_always_publishes() {
        let (_bus, _p, selection) = manager();
        let writes = Rc::new(Cell::new(0));
        let w = writes.clone();
        let _sub = selection
            .channel()
            .on_local_updated(move |_| w.set(w.get() + 1));

        selection.set_selection([SelectionEntry::new("x")]);
        selection.clear_selection();
        let once = selection.local_selection();
        selection.clear_selection();
        assert_eq!(selection.local_selection(), once);
        assert!(once.is_empty());
        assert_eq!(writes.get(), 3);
    }

    #[test]
    fn test_resolve_and_prune_stale() {
        let (_bus, _p, selection) = manager();
        let doc = Document::new();
        let shape = Item::shape(0.0, 0.0, 10.0, "#fff", "circle");
        let kept = shape.id.clone();
        doc.transaction(|tx| tx.insert(shape).map(|_| ())).unwrap();

        selection.set_selection([SelectionEntry::from(&kept), SelectionEntry::new("deleted")]);
        let resolved = selection.resolve(&doc);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, kept);

        assert_eq!(selection.prune_stale(&doc), 1);
        assert_eq!(ids(&selection.local_selection()), vec![kept.as_str()]);
        assert_eq!(selection.prune_stale(&doc), 0);
    }

    #[derive(Debug, Clone)]
    enum SelectionOp {
        Set(Vec<String>),
        Add(String),
        Remove(String),
        Toggle(String),
        Clear,
    }

    /// Small id alphabet so operations collide often.
    fn arb_op() -> impl Strategy<Value = SelectionOp> {
        let id = "[a-e]";
        prop_oneof![
            prop::collection::vec(id, 0..6).prop_map(SelectionOp::Set),
            id.prop_map(SelectionOp::Add),
            id.prop_map(SelectionOp::Remove),
            id.prop_map(SelectionOp::Toggle),
            Just(SelectionOp::Clear),
        ]
    }

    proptest! {
        /// The local selection always behaves like a set of ids.
        #[test]
        fn prop_local_selection_matches_set_model(
            ops in prop::collection::vec(arb_op(), 1..40)
        ) {
            let (_bus, _p, selection) = manager();
            let mut model: HashSet<String> = HashSet::new();

            for op in ops {
                match op {
                    SelectionOp::Set(ids) => {
                        selection.set_selection(ids.iter().map(SelectionEntry::new));
                        model = ids.into_iter().collect();
                    }
                    SelectionOp::Add(id) => {
                        selection.add_to_selection(SelectionEntry::new(id.clone()));
                        model.insert(id);
                    }
                    SelectionOp::Remove(id) => {
                        selection.remove_from_selection(&SelectionEntry::new(id.clone()));
                        model.remove(&id);
                    }
                    SelectionOp::Toggle(id) => {
                        selection.toggle_selection(SelectionEntry::new(id.clone()));
                        if !model.remove(&id) {
                            model.insert(id);
                        }
                    }
                    SelectionOp::Clear => {
                        selection.clear_selection();
                        model.clear();
                    }
                }

                let local = selection.local_selection();
                let actual: HashSet<String> = local.iter().map(|e| e.id.clone()).collect();
                prop_assert_eq!(actual.len(), local.len(), "duplicate ids in selection");
                prop_assert_eq!(&actual, &model);
            }
        }
    }
}
