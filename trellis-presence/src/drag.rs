//! Live drag and rotate previews.
//!
//! While a gesture is in progress the moving item's transform is published
//! on the drag channel at pointer rate and the document is left alone.
//! [`DragManager::commit`] writes the final transform in one transaction
//! when the gesture ends, then clears the preview.

use serde::{Deserialize, Serialize};
use trellis_core::{normalize_degrees, Document, DocumentError, Item, ItemId, Transform};

use crate::attendee::ParticipantId;
use crate::error::Result;
use crate::latest::LatestState;
use crate::presence::Presence;
use crate::watch::PresenceManager;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DragPreview {
    pub id: ItemId,
    pub x: f64,
    pub y: f64,
    pub rotation: f64,
}

impl DragPreview {
    pub fn new(id: &ItemId, x: f64, y: f64, rotation: f64) -> Self {
        Self {
            id: id.clone(),
            x,
            y,
            rotation,
        }
    }

    /// Preview of `item` at its committed transform.
    pub fn of(item: &Item) -> Self {
        Self::new(&item.id, item.x, item.y, item.rotation)
    }

    pub fn transform(&self) -> Transform {
        Transform {
            x: self.x,
            y: self.y,
            rotation: normalize_degrees(self.rotation),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DragManager {
    state: LatestState<Option<DragPreview>>,
}

impl DragManager {
    /// Register the drag channel `name` on `presence`, starting idle.
    pub fn new(presence: &Presence, name: &str) -> Result<Self> {
        Ok(Self {
            state: presence.register_latest(name, None)?,
        })
    }

    pub fn set_dragging(&self, preview: DragPreview) {
        self.state.set_local(Some(preview));
    }

    pub fn clear_dragging(&self) {
        self.state.set_local(None);
    }

    pub fn local_preview(&self) -> Option<DragPreview> {
        self.state.local()
    }

    /// Previews published by connected participants.
    pub fn remote_previews(&self) -> Vec<(ParticipantId, DragPreview)> {
        self.state
            .remotes()
            .into_iter()
            .filter(|remote| remote.attendee.is_connected())
            .filter_map(|remote| {
                let participant = remote.attendee.participant_id;
                remote.value.map(|preview| (participant, preview))
            })
            .collect()
    }

    /// A connected participant's preview of `id`, if anyone is dragging it.
    pub fn preview_for(&self, id: &ItemId) -> Option<DragPreview> {
        self.remote_previews()
            .into_iter()
            .map(|(_, preview)| preview)
            .find(|preview| &preview.id == id)
    }

    /// Where to draw `item`: a remote preview wins over committed values.
    pub fn effective_transform(&self, item: &Item) -> Transform {
        self.preview_for(&item.id)
            .map(|preview| preview.transform())
            .unwrap_or_else(|| item.transform())
    }

    /// End a gesture: write `preview` to `doc` in one transaction and clear
    /// the local preview.
    ///
    /// Returns `Ok(false)` when the item no longer exists; the preview is
    /// cleared in that case too. Other document errors leave the preview in
    /// place.
    pub fn commit(&self, doc: &Document, preview: &DragPreview) -> trellis_core::Result<bool> {
        let outcome = doc.transaction(|tx| {
            tx.set_position(&preview.id, preview.x, preview.y)?;
            tx.set_rotation(&preview.id, preview.rotation)
        });
        match outcome {
            Ok(_) => {
                self.clear_dragging();
                Ok(true)
            }
            Err(DocumentError::NotFound(id)) => {
                log::debug!("Drag target {} no longer exists", id);
                self.clear_dragging();
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

impl PresenceManager for DragManager {
    type Value = Option<DragPreview>;

    fn channel(&self) -> &LatestState<Option<DragPreview>> {
        &self.state
    }
}
