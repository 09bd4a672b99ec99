//! Push transport.
//!
//! Two kinds of output hang off a camera's `PushSink` cell. A `PushPump`
//! samples the cell at a fixed rate and hands each sample to a paced
//! `PushOutput` encoder (UDP). An on-demand `PushMount` (the RTSP server)
//! pulls from the cell itself whenever a connected client needs data.
//! Either way, empty cells are skipped and a frame that has not changed is
//! emitted again at the nominal rate, never faster.

#[cfg(feature = "rtsp-gstreamer")]
mod gst;
#[cfg(feature = "rtsp-gstreamer")]
mod rtsp;
#[cfg(feature = "rtsp-gstreamer")]
mod udp;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::AnnotatedFrame;
use crate::sink::PushSink;
use crate::worker::StopSignal;

#[cfg(feature = "rtsp-gstreamer")]
pub use rtsp::{mount_path, RtspMount, RtspOutputFactory};
#[cfg(feature = "rtsp-gstreamer")]
pub use udp::{UdpH264Output, UdpH264OutputFactory};

/// Encoder at the end of a push pump.
pub trait PushOutput: Send {
    /// Emit one frame. `pts` is the running presentation time and
    /// `duration` the nominal frame period.
    fn emit(&mut self, frame: &AnnotatedFrame, pts: Duration, duration: Duration) -> Result<()>;

    /// Flush and release the output. Called once when the pump exits.
    fn finish(&mut self) {}
}

/// An output that reads the push sink on its own schedule. Dropping it
/// withdraws the camera's stream.
pub trait PushMount: Send {
    /// Where consumers connect.
    fn url(&self) -> &str;
}

/// What a factory hands back for one camera.
pub enum PushAttachment {
    /// Driven by a `PushPump` at the configured rate.
    Paced(Box<dyn PushOutput>),
    /// Pulls frames itself; kept alive until the camera stops.
    OnDemand(Box<dyn PushMount>),
}

/// Creates one output per camera when its worker starts.
pub trait PushOutputFactory: Send + Sync {
    fn open(&self, camera_id: &str, sink: &PushSink) -> Result<PushAttachment>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushTransport {
    /// RTSP server, one mount per camera.
    #[default]
    Rtsp,
    /// H.264 over RTP to a UDP port per camera.
    Udp,
}

/// Push transport settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PushSettings {
    pub enabled: bool,
    pub transport: PushTransport,
    pub fps: u32,
    /// Output size; 0 keeps the frame's own dimension.
    pub width: u32,
    pub height: u32,
    /// RTSP bind address, or the UDP destination.
    pub host: String,
    pub rtsp_port: u16,
    /// Cameras are served under `<mount_prefix>/<camera_id>`.
    pub mount_prefix: String,
    /// UDP only. Cameras are assigned consecutive ports from here in start order.
    pub base_port: u16,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            transport: PushTransport::Rtsp,
            fps: 30,
            width: 0,
            height: 0,
            host: "127.0.0.1".to_string(),
            rtsp_port: 8554,
            mount_prefix: "/annotated".to_string(),
            base_port: 5000,
        }
    }
}

/// Build the configured output factory, if push output is enabled.
pub fn output_factory(settings: &PushSettings) -> Result<Option<Arc<dyn PushOutputFactory>>> {
    if !settings.enabled {
        return Ok(None);
    }
    build_factory(settings).map(Some)
}

#[cfg(feature = "rtsp-gstreamer")]
fn build_factory(settings: &PushSettings) -> Result<Arc<dyn PushOutputFactory>> {
    let factory: Arc<dyn PushOutputFactory> = match settings.transport {
        PushTransport::Rtsp => Arc::new(RtspOutputFactory::start(settings)?),
        PushTransport::Udp => Arc::new(UdpH264OutputFactory::new(settings.clone())),
    };
    Ok(factory)
}

#[cfg(not(feature = "rtsp-gstreamer"))]
fn build_factory(_settings: &PushSettings) -> Result<Arc<dyn PushOutputFactory>> {
    anyhow::bail!("push output requires the rtsp-gstreamer feature")
}

/// Per-camera driver thread for a `PushOutput`.
pub struct PushPump {
    camera_id: String,
    handle: Option<JoinHandle<u64>>,
}

impl PushPump {
    /// Start pumping `camera_id` at `fps` until `stop` is raised.
    pub fn spawn(
        camera_id: &str,
        sink: PushSink,
        output: Box<dyn PushOutput>,
        fps: u32,
        stop: StopSignal,
    ) -> Result<Self> {
        let interval = Duration::from_secs(1) / fps.max(1);
        let id = camera_id.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("push-{}", camera_id))
            .spawn(move || pump(&id, &sink, output, interval, &stop))
            .context("failed to spawn push pump thread")?;
        Ok(Self {
            camera_id: camera_id.to_string(),
            handle: Some(handle),
        })
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait for the pump to exit. Returns the number of frames emitted.
    pub fn join(mut self) -> u64 {
        self.handle
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or(0)
    }
}

fn pump(
    camera_id: &str,
    sink: &PushSink,
    mut output: Box<dyn PushOutput>,
    interval: Duration,
    stop: &StopSignal,
) -> u64 {
    let mut emitted = 0u64;
    let mut errors = 0u64;
    let mut next_tick = Instant::now();

    while !stop.is_raised() {
        if let Some(frame) = sink.request_next(camera_id) {
            let pts = Duration::from_nanos((interval.as_nanos() as u64).saturating_mul(emitted));
            match output.emit(&frame, pts, interval) {
                Ok(()) => emitted += 1,
                Err(e) => {
                    errors += 1;
                    if errors == 1 || errors % 100 == 0 {
                        log::warn!("[{}] push output error ({} so far): {:#}", camera_id, errors, e);
                    }
                }
            }
        }

        next_tick += interval;
        let now = Instant::now();
        if next_tick > now {
            if stop.sleep(next_tick - now) {
                break;
            }
        } else {
            // Fell behind; do not burst to catch up.
            next_tick = now;
        }
    }

    output.finish();
    log::debug!("[{}] push pump exited after {} frames", camera_id, emitted);
    emitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::test_frame;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recording {
        emitted: Arc<Mutex<Vec<(u64, Duration)>>>,
        finished: Arc<Mutex<bool>>,
    }

    impl PushOutput for Recording {
        fn emit(&mut self, frame: &AnnotatedFrame, pts: Duration, _duration: Duration) -> Result<()> {
            self.emitted.lock().unwrap().push((frame.sequence(), pts));
            Ok(())
        }

        fn finish(&mut self) {
            *self.finished.lock().unwrap() = true;
        }
    }

    #[test]
    fn skips_until_first_frame() {
        let sink = PushSink::new();
        sink.register("cam");
        let out = Recording::default();
        let stop = StopSignal::new();
        let pump = PushPump::spawn("cam", sink, Box::new(out.clone()), 100, stop.clone()).unwrap();

        std::thread::sleep(Duration::from_millis(60));
        stop.raise();
        assert_eq!(pump.join(), 0);
        assert!(out.emitted.lock().unwrap().is_empty());
        assert!(*out.finished.lock().unwrap());
    }

    #[test]
    fn repeats_frame_at_nominal_rate() {
        let sink = PushSink::new();
        sink.register("cam");
        sink.set_current("cam", test_frame("cam", 7));
        let out = Recording::default();
        let stop = StopSignal::new();
        let started = Instant::now();
        let pump =
            PushPump::spawn("cam", sink.clone(), Box::new(out.clone()), 50, stop.clone()).unwrap();

        std::thread::sleep(Duration::from_millis(200));
        stop.raise();
        let elapsed = started.elapsed();
        let count = pump.join();

        // One emission per 20 ms tick at most; never a burst.
        let ceiling = (elapsed.as_millis() / 20) as u64 + 2;
        assert!(count >= 3, "too few frames: {}", count);
        assert!(count <= ceiling, "pump ran faster than nominal: {} > {}", count, ceiling);
        let emitted = out.emitted.lock().unwrap();
        assert!(emitted.iter().all(|(seq, _)| *seq == 7));
        for (i, (_, pts)) in emitted.iter().enumerate() {
            assert_eq!(*pts, Duration::from_millis(20) * i as u32);
        }
    }

    #[test]
    fn follows_latest_frame() {
        let sink = PushSink::new();
        sink.register("cam");
        sink.set_current("cam", test_frame("cam", 1));
        let out = Recording::default();
        let stop = StopSignal::new();
        let pump =
            PushPump::spawn("cam", sink.clone(), Box::new(out.clone()), 100, stop.clone()).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        sink.set_current("cam", test_frame("cam", 2));
        std::thread::sleep(Duration::from_millis(50));
        stop.raise();
        pump.join();

        let emitted = out.emitted.lock().unwrap();
        assert_eq!(emitted.first().map(|e| e.0), Some(1));
        assert_eq!(emitted.last().map(|e| e.0), Some(2));
        assert!(emitted.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn disabled_settings_build_no_factory() -> Result<()> {
        assert!(output_factory(&PushSettings::default())?.is_none());
        Ok(())
    }

    #[test]
    fn rtsp_is_the_default_transport() -> Result<()> {
        let settings: PushSettings = toml::from_str("enabled = true")?;
        assert_eq!(settings.transport, PushTransport::Rtsp);
        assert_eq!(settings.rtsp_port, 8554);
        assert_eq!(settings.mount_prefix, "/annotated");

        let udp: PushSettings = toml::from_str("transport = \"udp\"\nbase_port = 6000")?;
        assert_eq!(udp.transport, PushTransport::Udp);
        assert_eq!(udp.base_port, 6000);
        Ok(())
    }
}
