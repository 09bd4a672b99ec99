//! Frame ingestion sources.
//!
//! This module provides the capture side of the relay:
//! - `SourceDescriptor`: a local device index or a URL, as supplied by callers
//! - `FrameSource`: an open capture handle, owned by exactly one worker
//! - `SourceOpener`: turns a descriptor into an open handle
//!
//! Built-in sources:
//! - Synthetic `stub://` source (tests, demos)
//! - GStreamer capture for devices and rtsp/http/file URLs (feature: rtsp-gstreamer)
//!
//! A source MUST NOT block forever in `read_frame`: when no data is ready it
//! returns `ReadOutcome::Pending` (or an error) and lets the worker back off.

#[cfg(feature = "rtsp-gstreamer")]
pub mod capture;
pub mod stub;

use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::frame::RawFrame;

#[cfg(feature = "rtsp-gstreamer")]
pub use capture::GstreamerSource;
pub use stub::SyntheticSource;

/// URL schemes handed to the capture backend.
pub const CAPTURE_SCHEMES: &[&str] = &["rtsp", "rtsps", "http", "https", "file"];

// ----------------------------------------------------------------------------
// SourceDescriptor
// ----------------------------------------------------------------------------

/// Where a camera's frames come from. Immutable for the stream's lifetime.
///
/// Deserializes from a JSON integer (device index) or string (URL). Strings
/// made only of digits are treated as device indices, so `"0"` and `0` name
/// the same device.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum SourceDescriptor {
    Device(u32),
    Url(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDescriptor {
    Index(u32),
    Text(String),
}

impl<'de> Deserialize<'de> for SourceDescriptor {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match RawDescriptor::deserialize(deserializer)? {
            RawDescriptor::Index(index) => SourceDescriptor::Device(index),
            RawDescriptor::Text(text) => SourceDescriptor::parse(&text),
        })
    }
}

impl SourceDescriptor {
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(index) = value.parse::<u32>() {
                return SourceDescriptor::Device(index);
            }
        }
        SourceDescriptor::Url(value.to_string())
    }

    /// URL scheme, lowercased. Devices have none.
    pub fn scheme(&self) -> Option<String> {
        match self {
            SourceDescriptor::Device(_) => None,
            SourceDescriptor::Url(url) => url
                .split_once("://")
                .map(|(scheme, _)| scheme.to_ascii_lowercase()),
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.scheme().as_deref() == Some("stub")
    }
}

impl std::fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceDescriptor::Device(index) => write!(f, "device:{}", index),
            SourceDescriptor::Url(url) => write!(f, "{}", url),
        }
    }
}

// ----------------------------------------------------------------------------
// Capture handle traits
// ----------------------------------------------------------------------------

/// Result of one read on a capture handle.
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(RawFrame),
    /// No data yet. The caller backs off and retries.
    Pending,
    /// The source finished (end of file or stream). Terminal.
    Ended,
}

/// Callback that unblocks a pending read from another thread and releases
/// the underlying device. Used when a worker does not stop in time.
pub type SourceInterrupter = Arc<dyn Fn() + Send + Sync>;

/// An open capture handle.
pub trait FrameSource: Send {
    /// Read the next frame. Errors are treated as transient by the worker.
    fn read_frame(&mut self) -> Result<ReadOutcome>;

    /// Release the handle. Called exactly once, on every worker exit path.
    fn close(&mut self) {}

    /// Optional out-of-band release hook.
    fn interrupter(&self) -> Option<SourceInterrupter> {
        None
    }
}

/// Opens capture handles for descriptors.
pub trait SourceOpener: Send + Sync {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameSource>>;
}

// ----------------------------------------------------------------------------
// Default opener
// ----------------------------------------------------------------------------

/// Capture defaults shared by the built-in sources.
#[derive(Clone, Debug)]
pub struct CaptureSettings {
    /// Frame width for synthetic sources.
    pub width: u32,
    /// Frame height for synthetic sources.
    pub height: u32,
    /// Target frame rate. Synthetic sources pace to it; 0 disables pacing.
    pub target_fps: u32,
    /// Upper bound on a single blocking read in capture backends.
    pub read_timeout: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            target_fps: 30,
            read_timeout: Duration::from_millis(500),
        }
    }
}

/// Opener for the built-in sources.
#[derive(Clone, Debug, Default)]
pub struct DefaultSourceOpener {
    settings: CaptureSettings,
}

impl DefaultSourceOpener {
    pub fn new(settings: CaptureSettings) -> Self {
        Self { settings }
    }

    #[cfg(feature = "rtsp-gstreamer")]
    fn open_capture(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(GstreamerSource::open(descriptor, &self.settings)?))
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    fn open_capture(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameSource>> {
        anyhow::bail!(
            "capture from {} requires the rtsp-gstreamer feature",
            descriptor
        )
    }
}

impl SourceOpener for DefaultSourceOpener {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameSource>> {
        match (descriptor, descriptor.scheme()) {
            (SourceDescriptor::Url(url), Some(scheme)) if scheme == "stub" => {
                Ok(Box::new(SyntheticSource::open(url, &self.settings)?))
            }
            (SourceDescriptor::Device(_), _) => self.open_capture(descriptor),
            (SourceDescriptor::Url(_), Some(scheme))
                if CAPTURE_SCHEMES.contains(&scheme.as_str()) =>
            {
                self.open_capture(descriptor)
            }
            (SourceDescriptor::Url(url), Some(scheme)) => Err(anyhow::anyhow!(
                "unsupported source scheme '{}' in {}",
                scheme,
                url
            )),
            (SourceDescriptor::Url(url), None) => Err(anyhow::anyhow!(
                "source '{}' is neither a device index nor a URL",
                url
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_from_json_int_or_string() -> Result<()> {
        let device: SourceDescriptor = serde_json::from_str("0")?;
        assert_eq!(device, SourceDescriptor::Device(0));

        let numeric: SourceDescriptor = serde_json::from_str(r#""2""#)?;
        assert_eq!(numeric, SourceDescriptor::Device(2));

        let url: SourceDescriptor = serde_json::from_str(r#""rtsp://10.0.0.5/live""#)?;
        assert_eq!(url, SourceDescriptor::Url("rtsp://10.0.0.5/live".to_string()));
        assert_eq!(url.scheme().as_deref(), Some("rtsp"));

        assert_eq!(serde_json::to_string(&SourceDescriptor::Device(3))?, "3");
        Ok(())
    }

    #[test]
    fn default_opener_rejects_unknown_schemes() {
        let opener = DefaultSourceOpener::default();
        let err = opener
            .open(&SourceDescriptor::parse("bad://source"))
            .err()
            .map(|e| e.to_string())
            .unwrap_or_default();
        assert!(err.contains("unsupported source scheme 'bad'"));
        assert!(opener.open(&SourceDescriptor::parse("not a url")).is_err());
    }

    #[test]
    fn default_opener_opens_synthetic_sources() -> Result<()> {
        let opener = DefaultSourceOpener::default();
        let mut source = opener.open(&SourceDescriptor::parse("stub://cam?width=8&height=6&fps=0"))?;
        match source.read_frame()? {
            ReadOutcome::Frame(frame) => {
                assert_eq!((frame.width, frame.height), (8, 6));
            }
            other => panic!("expected a frame, got {:?}", other),
        }
        source.close();
        Ok(())
    }
}
