//! Canvas content model: items, their content, and change records.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Stable identifier of a canvas item.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A colored primitive shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    /// Width and height in canvas units.
    pub size: f64,
    pub color: String,
    /// "circle", "square", "triangle", "star", …
    pub shape_type: String,
}

/// A sticky note with its own vote list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub text: String,
    pub author: String,
    pub votes: Vec<String>,
}

impl Note {
    /// Add `user` to the vote list, or remove them if already present.
    pub fn toggle_vote(&mut self, user: &str) {
        match self.votes.iter().position(|v| v == user) {
            Some(index) => {
                self.votes.remove(index);
            }
            None => self.votes.push(user.to_string()),
        }
    }
}

/// A remark attached to an item, with its own votes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub text: String,
    pub user_id: String,
    pub votes: BTreeSet<String>,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

impl Comment {
    pub fn new(text: impl Into<String>, user_id: impl Into<String>) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            user_id: user_id.into(),
            votes: BTreeSet::new(),
            created_at,
        }
    }

    pub fn toggle_vote(&mut self, user: &str) {
        if !self.votes.remove(user) {
            self.votes.insert(user.to_string());
        }
    }

    /// Display order: creation time, then id.
    pub fn chronological(a: &Comment, b: &Comment) -> Ordering {
        (a.created_at, &a.id).cmp(&(b.created_at, &b.id))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ItemContent {
    Shape(Shape),
    Note(Note),
    /// Container; members point at it through [`Item::parent`].
    Group,
}

/// A positioned object on the canvas.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub x: f64,
    pub y: f64,
    /// Degrees, normalized to `[0, 360)` by the writers in this crate.
    pub rotation: f64,
    /// Containing group, `None` for top-level items.
    pub parent: Option<ItemId>,
    pub votes: BTreeSet<String>,
    pub content: ItemContent,
    /// Oldest first.
    pub comments: Vec<Comment>,
}

impl Item {
    pub fn new(x: f64, y: f64, content: ItemContent) -> Self {
        Self {
            id: ItemId::new(),
            x,
            y,
            rotation: 0.0,
            parent: None,
            votes: BTreeSet::new(),
            content,
            comments: Vec::new(),
        }
    }

    pub fn shape(
        x: f64,
        y: f64,
        size: f64,
        color: impl Into<String>,
        shape_type: impl Into<String>,
    ) -> Self {
        Self::new(
            x,
            y,
            ItemContent::Shape(Shape {
                size,
                color: color.into(),
                shape_type: shape_type.into(),
            }),
        )
    }

    pub fn note(x: f64, y: f64, text: impl Into<String>, author: impl Into<String>) -> Self {
        Self::new(
            x,
            y,
            ItemContent::Note(Note {
                text: text.into(),
                author: author.into(),
                votes: Vec::new(),
            }),
        )
    }

    pub fn group(x: f64, y: f64) -> Self {
        Self::new(x, y, ItemContent::Group)
    }

    /// Builder: place this item inside `parent`.
    pub fn within(mut self, parent: &ItemId) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn is_group(&self) -> bool {
        matches!(self.content, ItemContent::Group)
    }

    /// Shape color, if this item is a shape.
    pub fn color(&self) -> Option<&str> {
        match &self.content {
            ItemContent::Shape(shape) => Some(&shape.color),
            _ => None,
        }
    }

    pub fn toggle_vote(&mut self, user: &str) {
        if !self.votes.remove(user) {
            self.votes.insert(user.to_string());
        }
    }

    pub fn has_voted(&self, user: &str) -> bool {
        self.votes.contains(user)
    }

    pub fn comment(&self, comment_id: &str) -> Option<&Comment> {
        self.comments.iter().find(|c| c.id == comment_id)
    }

    pub fn transform(&self) -> Transform {
        Transform {
            x: self.x,
            y: self.y,
            rotation: self.rotation,
        }
    }
}

/// Position and rotation of an item, committed or previewed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub x: f64,
    pub y: f64,
    pub rotation: f64,
}

/// Normalize an angle in degrees to `[0, 360)`.
pub fn normalize_degrees(angle: f64) -> f64 {
    let a = angle % 360.0;
    if a < 0.0 {
        a + 360.0
    } else {
        a
    }
}

/// Before/after state of one item in a committed change.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemChange {
    pub id: ItemId,
    /// `None` when the item was created.
    pub before: Option<Item>,
    /// `None` when the item was deleted.
    pub after: Option<Item>,
}

impl ItemChange {
    pub fn is_insert(&self) -> bool {
        self.before.is_none() && self.after.is_some()
    }

    pub fn is_delete(&self) -> bool {
        self.before.is_some() && self.after.is_none()
    }
}

/// Every item touched by one commit, in id order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChangeSet {
    pub changes: Vec<ItemChange>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn touches(&self, id: &ItemId) -> bool {
        self.changes.iter().any(|c| &c.id == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ItemId> {
        self.changes.iter().map(|c| &c.id)
    }
}

/// What produced a change on a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A transaction run on this document.
    Local,
    /// A branch merged into this document.
    Merge { revertible: bool },
    /// A delta from another replica.
    Remote,
    Undo,
    Redo,
}

/// Payload of document change notifications.
#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub origin: ChangeOrigin,
    pub changes: ChangeSet,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_id_unique() {
        assert_ne!(ItemId::new(), ItemId::new());
    }

    #[test]
    fn test_item_id_serde_transparent() {
        let id = ItemId::from("item-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"item-1\"");
    }

    #[test]
    fn test_item_toggle_vote() {
        let mut item = Item::shape(0.0, 0.0, 60.0, "#FF0000", "circle");
        item.toggle_vote("alice");
        assert!(item.has_voted("alice"));
        item.toggle_vote("alice");
        assert!(!item.has_voted("alice"));
    }

    #[test]
    fn test_note_toggle_vote_keeps_order() {
        let mut note = Note {
            text: "hi".into(),
            author: "bob".into(),
            votes: Vec::new(),
        };
        note.toggle_vote("a");
        note.toggle_vote("b");
        note.toggle_vote("a");
        assert_eq!(note.votes, vec!["b".to_string()]);
    }

    #[test]
    fn test_comment_vote_toggle() {
        let mut comment = Comment::new("ship it", "ann");
        assert!(comment.created_at > 0);
        comment.toggle_vote("bob");
        comment.toggle_vote("cy");
        comment.toggle_vote("bob");
        assert_eq!(comment.votes.iter().collect::<Vec<_>>(), vec!["cy"]);
    }

    #[test]
    fn test_normalize_degrees() {
        assert_eq!(normalize_degrees(370.0), 10.0);
        assert_eq!(normalize_degrees(-90.0), 270.0);
        assert_eq!(normalize_degrees(0.0), 0.0);
    }

    #[test]
    fn test_within_sets_parent() {
        let group = Item::group(0.0, 0.0);
        let child = Item::note(1.0, 2.0, "x", "y").within(&group.id);
        assert_eq!(child.parent.as_ref(), Some(&group.id));
        assert!(group.is_group());
        assert_eq!(child.color(), None);
    }
}
