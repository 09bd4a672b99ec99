//! Frame annotation.
//!
//! An annotator turns a captured frame into an annotated copy plus an object
//! count. Each worker owns its own annotator instance, built from a named
//! factory in `AnnotatorRegistry`, so cameras never contend on a shared lock.

mod backends;
pub mod overlay;
mod registry;

use anyhow::Result;
use std::sync::Arc;

use crate::frame::RawFrame;

pub use backends::{MotionAnnotator, PassthroughAnnotator};
pub use registry::AnnotatorRegistry;

/// Output of one annotation call.
#[derive(Clone, Debug, Default)]
pub struct Annotation {
    /// Annotated RGB pixels, same dimensions as the input frame.
    pub pixels: Vec<u8>,
    /// Number of objects found in the frame.
    pub object_count: u32,
}

/// Annotator backend trait.
///
/// Implementations are called synchronously once per frame and must not
/// retain the input frame past the call. A returned error is recovered by
/// the worker: the frame is skipped and the loop continues.
pub trait Annotator: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Annotate a frame.
    fn annotate(&mut self, frame: &RawFrame) -> Result<Annotation>;

    /// Optional warm-up hook, called once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds a fresh annotator for a worker.
pub type AnnotatorFactory = Arc<dyn Fn() -> Box<dyn Annotator> + Send + Sync>;
