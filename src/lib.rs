//! Frame Relay
//!
//! This crate ingests frames from independent camera sources, annotates each
//! frame, and fans the result out to live consumers.
//!
//! # Architecture
//!
//! - `registry`: the `StreamRegistry`, the only mutable process-wide table.
//!   It starts and stops per-camera workers, at most one per camera id.
//! - `worker`: the capture loop (capture → annotate → notify → distribute).
//! - `sink`: single-slot, overwrite-only frame cells. `PullSink` serves
//!   snapshot readers, `PushSink` serves continuous-stream transports.
//! - `push`: RTSP server mounts and the paced UDP driver, both fed from
//!   the push sink.
//! - `ingest`: frame sources (synthetic `stub://`, GStreamer capture).
//! - `annotate`: pluggable annotators (motion regions, passthrough).
//! - `notify`: per-frame detection events (MQTT, log).
//! - `api`: loopback HTTP control surface and MJPEG pull transport.
//!
//! Frames are never queued: every sink holds the latest frame only, and
//! slow consumers skip frames.

use anyhow::{anyhow, Result};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod annotate;
pub mod api;
pub mod config;
pub mod frame;
pub mod ingest;
pub mod notify;
pub mod push;
pub mod registry;
pub mod sink;
pub mod worker;

pub use annotate::{Annotation, Annotator, AnnotatorFactory, AnnotatorRegistry};
pub use frame::{AnnotatedFrame, DetectionEvent, RawFrame};
pub use ingest::{DefaultSourceOpener, FrameSource, ReadOutcome, SourceDescriptor, SourceOpener};
pub use notify::{EventNotifier, LogNotifier};
pub use push::{PushAttachment, PushMount, PushOutput, PushOutputFactory, PushPump};
pub use registry::{
    Collaborators, StartOutcome, StopOutcome, StreamRegistry, StreamState, StreamStatus,
    TerminalCondition,
};
pub use sink::{PullSink, PushSink};
pub use worker::{WorkerSettings, WorkerState, WorkerStatsSnapshot};

/// Maximum camera id length accepted by the registry.
pub const MAX_CAMERA_ID_LEN: usize = 64;

/// Validate a caller-supplied camera id.
///
/// Ids are opaque to the relay but end up in MQTT topics and URL paths, so
/// they are restricted to `[A-Za-z0-9_.-]{1,64}`.
pub fn validate_camera_id(camera_id: &str) -> Result<()> {
    static CAMERA_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = CAMERA_ID_RE
        .get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_.-]{1,64}$").expect("valid pattern"));

    if !re.is_match(camera_id) {
        return Err(anyhow!(
            "camera id must match ^[A-Za-z0-9_.-]{{1,{}}}$",
            MAX_CAMERA_ID_LEN
        ));
    }
    Ok(())
}

/// Wall-clock milliseconds since the unix epoch (0 if the clock is before 1970).
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_id_allowlist() {
        assert!(validate_camera_id("cam1").is_ok());
        assert!(validate_camera_id("front_door.hd-2").is_ok());
        assert!(validate_camera_id("").is_err());
        assert!(validate_camera_id("cam/1").is_err());
        assert!(validate_camera_id("events/#").is_err());
        assert!(validate_camera_id(&"a".repeat(65)).is_err());
    }
}
