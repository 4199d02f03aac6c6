//! Undo/redo over a main document's committed changes.
//!
//! The stack listens to the document's change stream and records one entry
//! per local transaction or revertible merge. Remote changes, changes made
//! on branches, and its own replays are never recorded.
//!
//! Replays work field by field: undo only reverts the fields that still
//! hold the value the entry wrote, so edits that arrived from other
//! replicas in the meantime are kept.
//!
//! ```text
//! Local/Merge commit ──► undo stack ──undo()──► redo stack
//!                            ▲                      │
//!                            └──────redo()──────────┘
//! ```

use crate::document::Document;
use crate::error::{DocumentError, Result};
use crate::events::Subscription;
use crate::fields;
use crate::model::{ChangeOrigin, ChangeSet, Item, ItemId};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

/// Default number of retained undo levels.
pub const DEFAULT_MAX_LEVELS: usize = 100;

#[derive(Debug, Default)]
struct History {
    undo: VecDeque<ChangeSet>,
    redo: Vec<ChangeSet>,
    /// 0 = unlimited.
    max_levels: usize,
}

impl History {
    fn push(&mut self, changes: ChangeSet) {
        self.undo.push_back(changes);
        if self.max_levels > 0 && self.undo.len() > self.max_levels {
            self.undo.pop_front();
        }
        self.redo.clear();
    }
}

/// Undo/redo stack attached to one main document.
#[derive(Debug)]
pub struct UndoRedo {
    doc: Document,
    history: Rc<RefCell<History>>,
    listener: Option<Subscription>,
}

impl UndoRedo {
    pub fn attach(doc: &Document) -> Result<Self> {
        Self::with_max_levels(doc, DEFAULT_MAX_LEVELS)
    }

    /// Attach with a bounded history; the oldest entries are evicted first.
    /// `0` keeps everything.
    pub fn with_max_levels(doc: &Document, max_levels: usize) -> Result<Self> {
        doc.ensure_live()?;
        if doc.is_branch() {
            return Err(DocumentError::InvalidOperation(
                "undo history is tracked on the main document only".to_string(),
            ));
        }

        let history = Rc::new(RefCell::new(History {
            max_levels,
            ..History::default()
        }));
        let recorder = history.clone();
        let listener = doc.on_tree_changed(move |event| {
            let record = match event.origin {
                ChangeOrigin::Local => true,
                ChangeOrigin::Merge { revertible } => revertible,
                ChangeOrigin::Remote | ChangeOrigin::Undo | ChangeOrigin::Redo => false,
            };
            if record && !event.changes.is_empty() {
                recorder.borrow_mut().push(event.changes.clone());
            }
        });

        Ok(Self {
            doc: doc.clone(),
            history,
            listener: Some(listener),
        })
    }

    /// Revert the most recent entry. Returns `false` when there is nothing
    /// to undo.
    pub fn undo(&self) -> Result<bool> {
        self.ensure_attached()?;
        let Some(entry) = self.history.borrow_mut().undo.pop_back() else {
            return Ok(false);
        };

        let states = replay(&self.doc, &entry, Direction::Backward);
        match self.doc.apply_states(states, ChangeOrigin::Undo) {
            Ok(_) => {
                self.history.borrow_mut().redo.push(entry);
                Ok(true)
            }
            Err(e) => {
                self.history.borrow_mut().undo.push_back(entry);
                Err(e)
            }
        }
    }

    /// Re-apply the most recently undone entry. Returns `false` when there
    /// is nothing to redo.
    pub fn redo(&self) -> Result<bool> {
        self.ensure_attached()?;
        let Some(entry) = self.history.borrow_mut().redo.pop() else {
            return Ok(false);
        };

        let states = replay(&self.doc, &entry, Direction::Forward);
        match self.doc.apply_states(states, ChangeOrigin::Redo) {
            Ok(_) => {
                self.history.borrow_mut().undo.push_back(entry);
                Ok(true)
            }
            Err(e) => {
                self.history.borrow_mut().redo.push(entry);
                Err(e)
            }
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.history.borrow().undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.history.borrow().redo.is_empty()
    }

    pub fn undo_levels(&self) -> usize {
        self.history.borrow().undo.len()
    }

    pub fn redo_levels(&self) -> usize {
        self.history.borrow().redo.len()
    }

    pub fn clear(&self) {
        let mut history = self.history.borrow_mut();
        history.undo.clear();
        history.redo.clear();
    }

    /// Stop recording. Existing entries stay readable; undo/redo fail.
    pub fn dispose(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.unsubscribe();
            log::debug!("Undo history detached from document {}", self.doc.id());
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.listener.is_none()
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.listener.is_none() {
            return Err(DocumentError::InvalidSessionState(
                "undo history has been disposed".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Direction {
    /// before ─► after (redo)
    Forward,
    /// after ─► before (undo)
    Backward,
}

/// Target states for replaying `entry` against the document as it is now.
fn replay(
    doc: &Document,
    entry: &ChangeSet,
    direction: Direction,
) -> BTreeMap<ItemId, Option<Item>> {
    let mut states = BTreeMap::new();
    for change in &entry.changes {
        let (from, to) = match direction {
            Direction::Forward => (&change.before, &change.after),
            Direction::Backward => (&change.after, &change.before),
        };
        let target = match (doc.get(&change.id), from, to) {
            (Some(current), Some(from), Some(to)) => Some(fields::rebase(&current, from, to)),
            // Deleted elsewhere since; a field edit has nothing to land on.
            (None, Some(_), Some(_)) => continue,
            (_, _, to) => to.clone(),
        };
        states.insert(change.id.clone(), target);
    }
    states
}
