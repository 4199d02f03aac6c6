//! `CanvasSession`: everything one participant needs for a shared canvas.
//!
//! Wires the three presence managers onto a [`Presence`], attaches undo
//! history to the main [`Document`], and holds the branch session used for
//! speculative task edits.

use serde::Deserialize;
use trellis_core::{BranchSession, Document, UndoRedo};

use crate::drag::DragManager;
use crate::error::Result;
use crate::presence::Presence;
use crate::selection::SelectionManager;
use crate::users::{UserInfo, UsersManager};

/// Channel names and history size for a [`CanvasSession`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub selection_channel: String,
    pub users_channel: String,
    pub drag_channel: String,
    /// Retained undo levels. 0 keeps everything.
    pub undo_max_levels: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            selection_channel: "selection:main".to_string(),
            users_channel: "users:main".to_string(),
            drag_channel: "drag:main".to_string(),
            undo_max_levels: trellis_core::undo::DEFAULT_MAX_LEVELS,
        }
    }
}

impl SessionConfig {
    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug)]
pub struct CanvasSession {
    presence: Presence,
    document: Document,
    selection: SelectionManager,
    users: UsersManager,
    drag: DragManager,
    undo: UndoRedo,
    branches: BranchSession,
}

impl CanvasSession {
    /// Register the session's channels on `presence` and attach undo history
    /// to `document`. `presence` is not connected here; call
    /// [`Presence::connect`] before or after opening.
    pub fn open(
        presence: &Presence,
        me: UserInfo,
        document: &Document,
        config: &SessionConfig,
    ) -> Result<Self> {
        let selection = SelectionManager::new(presence, &config.selection_channel)?;
        let users = UsersManager::new(presence, &config.users_channel, me)?;
        let drag = DragManager::new(presence, &config.drag_channel)?;
        let undo = UndoRedo::with_max_levels(document, config.undo_max_levels)?;

        log::info!(
            "Canvas session opened for {} on document {}",
            presence.me(),
            document.id()
        );
        Ok(Self {
            presence: presence.clone(),
            document: document.clone(),
            selection,
            users,
            drag,
            undo,
            branches: BranchSession::new(document),
        })
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn selection(&self) -> &SelectionManager {
        &self.selection
    }

    pub fn users(&self) -> &UsersManager {
        &self.users
    }

    pub fn drag(&self) -> &DragManager {
        &self.drag
    }

    pub fn undo(&self) -> &UndoRedo {
        &self.undo
    }

    pub fn branches(&self) -> &BranchSession {
        &self.branches
    }

    pub fn branches_mut(&mut self) -> &mut BranchSession {
        &mut self.branches
    }

    /// Stop recording history, discard any open branch, and leave the room.
    pub fn close(mut self) {
        if self.branches.view().is_ok() {
            if let Err(e) = self.branches.discard() {
                log::warn!("Failed to discard open branch on close: {}", e);
            }
        }
        self.undo.dispose();
        self.presence.disconnect();
        log::info!("Canvas session closed for {}", self.presence.me());
    }
}
