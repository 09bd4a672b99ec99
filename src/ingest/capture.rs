//! GStreamer capture source.
//!
//! Decodes local devices (`v4l2src`) and rtsp/http/file URLs (`uridecodebin`)
//! into packed RGB frames pulled from an `appsink`. The sink keeps a single
//! buffer and drops older ones, so a slow worker always sees the newest frame.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{CaptureSettings, FrameSource, ReadOutcome, SourceDescriptor, SourceInterrupter};
use crate::frame::RawFrame;

pub struct GstreamerSource {
    descriptor: SourceDescriptor,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    read_timeout: Duration,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
    closed: bool,
}

impl GstreamerSource {
    /// Build the pipeline and set it to Playing.
    pub fn open(descriptor: &SourceDescriptor, settings: &CaptureSettings) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let head = match descriptor {
            SourceDescriptor::Device(index) => format!("v4l2src device=/dev/video{}", index),
            SourceDescriptor::Url(url) if url.starts_with("rtsp") => {
                format!("rtspsrc location={} latency=0 ! decodebin", url)
            }
            SourceDescriptor::Url(url) => format!("uridecodebin uri={}", url),
        };
        let pipeline_description = format!(
            "{} ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            head
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build capture pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("capture pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .with_context(|| format!("start capture pipeline for {}", descriptor))?;

        // A device or URL that cannot be opened fails here, not on first read.
        let (result, _, _) = pipeline.state(gstreamer::ClockTime::from_seconds(5));
        if let Err(err) = result {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(anyhow!("open {}: {:?}", descriptor, err));
        }

        log::info!("GstreamerSource: opened {}", descriptor);
        Ok(Self {
            descriptor: descriptor.clone(),
            pipeline,
            appsink,
            read_timeout: settings.read_timeout,
            frame_count: 0,
            last_frame_at: None,
            last_error: None,
            closed: false,
        })
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            if let MessageView::Error(err) = message.view() {
                self.last_error = Some(format!(
                    "gstreamer error from {:?}: {}",
                    err.src().map(|s| s.path_string()),
                    err.error()
                ));
            }
        }
    }
}

impl FrameSource for GstreamerSource {
    fn read_frame(&mut self) -> Result<ReadOutcome> {
        self.poll_bus();
        if let Some(err) = self.last_error.take() {
            return Err(anyhow!(err));
        }

        let timeout = gstreamer::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            if self.appsink.is_eos() {
                return Ok(ReadOutcome::Ended);
            }
            return Ok(ReadOutcome::Pending);
        };

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(ReadOutcome::Frame(RawFrame::new(pixels, width, height)?))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("GstreamerSource: release {} failed: {:?}", self.descriptor, err);
        }
        log::info!(
            "GstreamerSource: closed {} after {} frames (last frame {:?} ago)",
            self.descriptor,
            self.frame_count,
            self.last_frame_at.map(|at| at.elapsed())
        );
    }

    fn interrupter(&self) -> Option<SourceInterrupter> {
        let pipeline = self.pipeline.clone();
        Some(Arc::new(move || {
            let _ = pipeline.set_state(gstreamer::State::Null);
        }))
    }
}

impl Drop for GstreamerSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("capture sample missing buffer")?;
    let caps = sample.caps().context("capture sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse capture caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map capture buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .context("capture buffer is shorter than one frame")?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("capture buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
