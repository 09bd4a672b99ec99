use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::frame::AnnotatedFrame;

/// Single-slot holder of the latest frame for one camera.
///
/// Writes swap the `Arc` under a short write lock; the frame itself is never
/// mutated in place, so a reader either sees the old frame or the new one.
/// Readers clone the `Arc` and release the lock immediately.
#[derive(Default)]
pub struct FrameCell {
    slot: RwLock<Option<Arc<AnnotatedFrame>>>,
}

impl FrameCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the slot, returning the frame it replaced.
    pub fn store(&self, frame: Arc<AnnotatedFrame>) -> Option<Arc<AnnotatedFrame>> {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        slot.replace(frame)
    }

    pub fn load(&self) -> Option<Arc<AnnotatedFrame>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Camera id → cell map shared by a sink and its writers.
#[derive(Default)]
pub(crate) struct CellTable {
    cells: RwLock<HashMap<String, Arc<FrameCell>>>,
}

impl CellTable {
    /// Install a fresh, empty cell for `camera_id`, replacing any stale one.
    pub(crate) fn register(&self, camera_id: &str) -> Arc<FrameCell> {
        let cell = Arc::new(FrameCell::new());
        self.cells
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(camera_id.to_string(), cell.clone());
        cell
    }

    /// Remove `camera_id` only if it still maps to `cell`.
    pub(crate) fn unregister(&self, camera_id: &str, cell: &Arc<FrameCell>) -> bool {
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        match cells.get(camera_id) {
            Some(current) if Arc::ptr_eq(current, cell) => {
                cells.remove(camera_id);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn get(&self, camera_id: &str) -> Option<Arc<FrameCell>> {
        self.cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(camera_id)
            .cloned()
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
