//! Field-level encoding of items inside the CRDT.
//!
//! Every item is a nested `yrs` map under its id, one key per field, so that
//! concurrent edits to different fields of the same item both survive a
//! merge. Votes and comments are spread over one key per voter and per
//! comment attribute for the same reason.
//!
//! ```text
//! items/<id>/x                        Number
//! items/<id>/parent                   String (absent at top level)
//! items/<id>/kind                     "shape" | "note" | "group"
//! items/<id>/vote:<user>              true
//! items/<id>/comment:<cid>:text       String
//! items/<id>/comment:<cid>:vote:<u>   true
//! ```

use crate::model::{Comment, Item, ItemContent, ItemId, Note, Shape};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use yrs::Any;

pub(crate) type Fields = BTreeMap<String, Any>;

const KIND_SHAPE: &str = "shape";
const KIND_NOTE: &str = "note";
const KIND_GROUP: &str = "group";
const VOTE_PREFIX: &str = "vote:";
const COMMENT_PREFIX: &str = "comment:";

fn text(value: &str) -> Any {
    Any::String(Arc::from(value))
}

pub(crate) fn to_fields(item: &Item) -> Fields {
    let mut fields = Fields::new();
    fields.insert("x".into(), Any::Number(item.x));
    fields.insert("y".into(), Any::Number(item.y));
    fields.insert("rotation".into(), Any::Number(item.rotation));
    if let Some(parent) = &item.parent {
        fields.insert("parent".into(), text(parent.as_str()));
    }
    for user in &item.votes {
        fields.insert(format!("{VOTE_PREFIX}{user}"), Any::Bool(true));
    }

    match &item.content {
        ItemContent::Shape(shape) => {
            fields.insert("kind".into(), text(KIND_SHAPE));
            fields.insert("size".into(), Any::Number(shape.size));
            fields.insert("color".into(), text(&shape.color));
            fields.insert("shape_type".into(), text(&shape.shape_type));
        }
        ItemContent::Note(note) => {
            fields.insert("kind".into(), text(KIND_NOTE));
            fields.insert("text".into(), text(&note.text));
            fields.insert("author".into(), text(&note.author));
            let votes: Arc<[Any]> = note.votes.iter().map(|v| text(v)).collect();
            fields.insert("note_votes".into(), Any::Array(votes));
        }
        ItemContent::Group => {
            fields.insert("kind".into(), text(KIND_GROUP));
        }
    }

    for comment in &item.comments {
        let prefix = format!("{COMMENT_PREFIX}{}:", comment.id);
        fields.insert(format!("{prefix}text"), text(&comment.text));
        fields.insert(format!("{prefix}user_id"), text(&comment.user_id));
        fields.insert(
            format!("{prefix}created_at"),
            Any::Number(comment.created_at as f64),
        );
        for user in &comment.votes {
            fields.insert(format!("{prefix}{VOTE_PREFIX}{user}"), Any::Bool(true));
        }
    }
    fields
}

fn number(fields: &Fields, key: &str) -> Option<f64> {
    match fields.get(key)? {
        Any::Number(n) => Some(*n),
        Any::BigInt(n) => Some(*n as f64),
        _ => None,
    }
}

fn string(fields: &Fields, key: &str) -> Option<String> {
    match fields.get(key)? {
        Any::String(s) => Some(s.to_string()),
        _ => None,
    }
}

/// Rebuild an item. `None` when a required field is missing or mistyped.
pub(crate) fn from_fields(id: ItemId, fields: &Fields) -> Option<Item> {
    let content = match string(fields, "kind")?.as_str() {
        KIND_SHAPE => ItemContent::Shape(Shape {
            size: number(fields, "size")?,
            color: string(fields, "color")?,
            shape_type: string(fields, "shape_type")?,
        }),
        KIND_NOTE => ItemContent::Note(Note {
            text: string(fields, "text")?,
            author: string(fields, "author")?,
            votes: match fields.get("note_votes") {
                Some(Any::Array(votes)) => votes
                    .iter()
                    .filter_map(|v| match v {
                        Any::String(s) => Some(s.to_string()),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            },
        }),
        KIND_GROUP => ItemContent::Group,
        _ => return None,
    };

    let votes: BTreeSet<String> = fields
        .iter()
        .filter(|(_, value)| **value == Any::Bool(true))
        .filter_map(|(key, _)| key.strip_prefix(VOTE_PREFIX))
        .map(str::to_string)
        .collect();

    Some(Item {
        id,
        x: number(fields, "x")?,
        y: number(fields, "y")?,
        rotation: number(fields, "rotation")?,
        parent: string(fields, "parent").map(ItemId::from),
        votes,
        content,
        comments: comments_from(fields),
    })
}

#[derive(Default)]
struct PartialComment {
    text: Option<String>,
    user_id: Option<String>,
    created_at: Option<u64>,
    votes: BTreeSet<String>,
}

/// Comments missing their text or author are skipped; a concurrent delete
/// can leave stray vote keys behind.
fn comments_from(fields: &Fields) -> Vec<Comment> {
    let mut partial: BTreeMap<&str, PartialComment> = BTreeMap::new();
    for (key, value) in fields {
        let Some((comment_id, attr)) = key
            .strip_prefix(COMMENT_PREFIX)
            .and_then(|rest| rest.split_once(':'))
        else {
            continue;
        };
        let entry = partial.entry(comment_id).or_default();
        match (attr, value) {
            ("text", Any::String(s)) => entry.text = Some(s.to_string()),
            ("user_id", Any::String(s)) => entry.user_id = Some(s.to_string()),
            ("created_at", Any::Number(n)) => entry.created_at = Some(*n as u64),
            (other, Any::Bool(true)) => {
                if let Some(user) = other.strip_prefix(VOTE_PREFIX) {
                    entry.votes.insert(user.to_string());
                }
            }
            _ => {}
        }
    }

    let mut comments: Vec<Comment> = partial
        .into_iter()
        .filter_map(|(id, p)| {
            Some(Comment {
                id: id.to_string(),
                text: p.text?,
                user_id: p.user_id?,
                votes: p.votes,
                created_at: p.created_at.unwrap_or_default(),
            })
        })
        .collect();
    comments.sort_by(Comment::chronological);
    comments
}

/// Move `current` from `from` towards `to`, touching only the fields whose
/// current value still equals the one in `from`. Fields changed by someone
/// else since keep their current value.
pub(crate) fn rebase(current: &Item, from: &Item, to: &Item) -> Item {
    let now = to_fields(current);
    let old = to_fields(from);
    let target = to_fields(to);

    let mut merged = now.clone();
    let keys: BTreeSet<&String> = old.keys().chain(target.keys()).collect();
    for key in keys {
        if now.get(key) != old.get(key) {
            continue;
        }
        match target.get(key) {
            Some(value) => merged.insert(key.clone(), value.clone()),
            None => merged.remove(key),
        };
    }

    from_fields(current.id.clone(), &merged).unwrap_or_else(|| {
        log::warn!("Field rebase of {} produced an invalid item", current.id);
        to.clone()
    })
}
