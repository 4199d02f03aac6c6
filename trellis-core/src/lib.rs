//! Trellis core: the replicated canvas document and speculative editing.
//!
//! - [`Document`]: `yrs`-backed item store with atomic transactions and
//!   change notification
//! - [`Branch`] / [`BranchSession`]: fork, edit in isolation, merge or discard
//! - [`UndoRedo`]: history of commits to the main document
//! - [`Emitter`] / [`Subscription`]: the observer primitive used throughout

pub mod branch;
pub mod document;
pub mod error;
pub mod events;
mod fields;
pub mod model;
pub mod registry;
pub mod undo;

pub use branch::{Branch, BranchSession, MergeOptions, SessionState};
pub use document::{Document, DocumentKind, Transaction};
pub use error::{DocumentError, Result};
pub use events::{Emitter, Subscription};
pub use model::{
    normalize_degrees, ChangeEvent, ChangeOrigin, ChangeSet, Comment, Item, ItemChange,
    ItemContent, ItemId, Note, Shape, Transform,
};
pub use registry::{layout_cache, render_keys, Bounds, LayoutCache, RenderKeys};
pub use undo::UndoRedo;
