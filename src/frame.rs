//! Frame types flowing through the relay.
//!
//! - `RawFrame`: owned RGB capture, handed from a source to its worker.
//! - `AnnotatedFrame`: immutable annotated result, shared as `Arc` with every sink.
//! - `DetectionEvent`: transient per-frame notification.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Bytes per pixel for the packed RGB layout used everywhere in the relay.
pub const RGB_CHANNELS: usize = 3;

/// Largest accepted width or height.
pub const MAX_FRAME_DIMENSION: u32 = 8192;

/// Byte length of a packed RGB buffer, or an error for sizes the relay
/// refuses to carry.
pub fn rgb_buffer_len(width: u32, height: u32) -> Result<usize> {
    if width > MAX_FRAME_DIMENSION || height > MAX_FRAME_DIMENSION {
        return Err(anyhow!(
            "frame size {}x{} exceeds {}x{}",
            width,
            height,
            MAX_FRAME_DIMENSION,
            MAX_FRAME_DIMENSION
        ));
    }
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|pixels| pixels.checked_mul(RGB_CHANNELS))
        .ok_or_else(|| anyhow!("frame size {}x{} overflows", width, height))
}

// ----------------------------------------------------------------------------
// RawFrame
// ----------------------------------------------------------------------------

/// A captured frame, packed RGB8, row-major without padding.
pub struct RawFrame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    captured_at: Instant,
}

impl RawFrame {
    /// Wrap captured pixels. The capture instant is taken now.
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        let expected = rgb_buffer_len(width, height)?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame buffer is {} bytes, expected {} for {}x{} RGB",
                pixels.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            captured_at: Instant::now(),
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }
}

impl std::fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Pixel content is never printed.
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// AnnotatedFrame
// ----------------------------------------------------------------------------

/// The most recent processed image for a camera.
///
/// Built once per pipeline iteration and then only ever shared behind an
/// `Arc`. There is no mutable accessor: sinks replace the whole `Arc` instead
/// of writing into a frame that readers may hold.
pub struct AnnotatedFrame {
    camera_id: Arc<str>,
    sequence: u64,
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    object_count: u32,
    captured_at: Instant,
}

impl AnnotatedFrame {
    pub fn new(
        camera_id: Arc<str>,
        sequence: u64,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
        object_count: u32,
        captured_at: Instant,
    ) -> Result<Self> {
        let expected = rgb_buffer_len(width, height)?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "annotated buffer is {} bytes, expected {} for {}x{} RGB",
                pixels.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            camera_id,
            sequence,
            width,
            height,
            pixels,
            object_count,
            captured_at,
        })
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Position of this frame in its worker's output, starting at 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn object_count(&self) -> u32 {
        self.object_count
    }

    /// Monotonic capture instant of the source frame.
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }
}

impl std::fmt::Debug for AnnotatedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnotatedFrame")
            .field("camera_id", &self.camera_id)
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("object_count", &self.object_count)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// DetectionEvent
// ----------------------------------------------------------------------------

/// Per-frame notification handed to the event notifier. Not retained.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DetectionEvent {
    pub camera_id: String,
    pub count: u32,
    /// Unix milliseconds at publish time.
    pub timestamp_ms: u64,
}

/// Wire payload published for each event: `{"count": N}`.
#[derive(Serialize)]
struct EventPayload {
    count: u32,
}

impl DetectionEvent {
    pub fn new(camera_id: &str, count: u32) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            count,
            timestamp_ms: crate::unix_millis(),
        }
    }

    pub fn payload_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&EventPayload { count: self.count })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_frame_rejects_mismatched_buffer() {
        assert!(RawFrame::new(vec![0; 12], 2, 2).is_ok());
        assert!(RawFrame::new(vec![0; 11], 2, 2).is_err());
        assert!(RawFrame::new(Vec::new(), 0, 0).is_err());
    }

    #[test]
    fn oversized_dimensions_are_refused() {
        assert_eq!(rgb_buffer_len(4, 2).ok(), Some(24));
        assert!(rgb_buffer_len(MAX_FRAME_DIMENSION, MAX_FRAME_DIMENSION).is_ok());
        assert!(rgb_buffer_len(MAX_FRAME_DIMENSION + 1, 1).is_err());
        assert!(rgb_buffer_len(u32::MAX, u32::MAX).is_err());
        assert!(RawFrame::new(Vec::new(), u32::MAX, u32::MAX).is_err());
    }

    #[test]
    fn raw_frame_debug_hides_pixels() -> Result<()> {
        let frame = RawFrame::new(vec![7; 12], 2, 2)?;
        let printed = format!("{:?}", frame);
        assert!(printed.contains("bytes: 12"));
        assert!(!printed.contains("[7"));
        Ok(())
    }

    #[test]
    fn event_payload_is_count_only() -> Result<()> {
        let event = DetectionEvent::new("cam1", 3);
        assert_eq!(event.payload_json()?, br#"{"count":3}"#.to_vec());
        Ok(())
    }
}
