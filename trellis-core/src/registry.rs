//! Process-scoped caches keyed by item identity.
//!
//! Both registries are created on first use and live for the rest of the
//! process. Standalone instances are available for tests and embedders that
//! want scoped lifetimes.

use crate::model::ItemId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, RwLock};

/// Stable numeric keys for items, used by renderers that need a cheap
/// `Copy` key per object.
#[derive(Debug, Default)]
pub struct RenderKeys {
    keys: HashMap<ItemId, u64>,
    next: u64,
}

impl RenderKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// The key for `id`, assigning a fresh one the first time it is seen.
    pub fn key_for(&mut self, id: &ItemId) -> u64 {
        if let Some(key) = self.keys.get(id) {
            return *key;
        }
        self.next += 1;
        self.keys.insert(id.clone(), self.next);
        self.next
    }

    pub fn get(&self, id: &ItemId) -> Option<u64> {
        self.keys.get(id).copied()
    }

    /// Forget `id`. A later `key_for` assigns a new key.
    pub fn release(&mut self, id: &ItemId) -> Option<u64> {
        self.keys.remove(id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn contains(&self, px: f64, py: f64) -> bool {
        px >= self.x && px <= self.x + self.width && py >= self.y && py <= self.y + self.height
    }
}

/// Last rendered bounds per item.
#[derive(Debug, Default)]
pub struct LayoutCache {
    bounds: HashMap<ItemId, Bounds>,
}

impl LayoutCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, id: &ItemId, bounds: Bounds) {
        self.bounds.insert(id.clone(), bounds);
    }

    pub fn get(&self, id: &ItemId) -> Option<Bounds> {
        self.bounds.get(id).copied()
    }

    pub fn forget(&mut self, id: &ItemId) {
        self.bounds.remove(id);
    }

    /// Items whose last bounds contain the point, in no particular order.
    pub fn hit_test(&self, x: f64, y: f64) -> Vec<ItemId> {
        self.bounds
            .iter()
            .filter(|(_, b)| b.contains(x, y))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }
}

static RENDER_KEYS: OnceLock<Mutex<RenderKeys>> = OnceLock::new();
static LAYOUT_CACHE: OnceLock<RwLock<LayoutCache>> = OnceLock::new();

/// The process-wide render key registry.
pub fn render_keys() -> &'static Mutex<RenderKeys> {
    RENDER_KEYS.get_or_init(|| Mutex::new(RenderKeys::new()))
}

/// The process-wide layout cache.
pub fn layout_cache() -> &'static RwLock<LayoutCache> {
    LAYOUT_CACHE.get_or_init(|| RwLock::new(LayoutCache::new()))
}
