use std::sync::Arc;

use super::cell::{CellTable, FrameCell};
use crate::frame::AnnotatedFrame;

/// Continuous distribution: one "current frame" reference per camera.
///
/// The producer sets the current frame once per iteration; an external
/// stream transport asks for the next unit of output whenever it is ready.
/// A fast producer overwrites frames the transport never saw, and a slow
/// producer makes `request_next` return the same `Arc` again. Pacing
/// repeated frames is the transport's job (see `push::PushPump`).
#[derive(Clone, Default)]
pub struct PushSink {
    cells: Arc<CellTable>,
}

impl PushSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame for `camera_id`. Workers write through the
    /// cell handed out by `register` instead.
    ///
    /// Returns `false` when the camera has no registered cell; the frame is
    /// dropped in that case.
    #[cfg(test)]
    pub(crate) fn set_current(&self, camera_id: &str, frame: Arc<AnnotatedFrame>) -> bool {
        match self.cells.get(camera_id) {
            Some(cell) => {
                cell.store(frame);
                true
            }
            None => false,
        }
    }

    /// Current frame for `camera_id`, or `None` before the first frame.
    /// The caller skips emission on `None`.
    pub fn request_next(&self, camera_id: &str) -> Option<Arc<AnnotatedFrame>> {
        self.cells.get(camera_id).and_then(|cell| cell.load())
    }

    pub(crate) fn register(&self, camera_id: &str) -> Arc<FrameCell> {
        self.cells.register(camera_id)
    }

    pub(crate) fn unregister(&self, camera_id: &str, cell: &Arc<FrameCell>) -> bool {
        self.cells.unregister(camera_id, cell)
    }
}
