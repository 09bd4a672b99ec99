use anyhow::Result;

use crate::annotate::{Annotation, Annotator};
use crate::frame::RawFrame;

/// Copies frames through untouched and reports no objects.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughAnnotator;

impl Annotator for PassthroughAnnotator {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn annotate(&mut self, frame: &RawFrame) -> Result<Annotation> {
        Ok(Annotation {
            pixels: frame.pixels().to_vec(),
            object_count: 0,
        })
    }
}
