//! RTP/H.264 over UDP via GStreamer `appsrc`.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::{gst, PushAttachment, PushOutput, PushOutputFactory, PushSettings};
use crate::frame::AnnotatedFrame;
use crate::sink::PushSink;

/// Encodes frames with `x264enc tune=zerolatency` and sends RTP to
/// `host:port`.
pub struct UdpH264Output {
    pipeline: gstreamer::Pipeline,
    appsrc: gstreamer_app::AppSrc,
    fps: u32,
    caps_size: Option<(u32, u32)>,
    target: String,
}

impl UdpH264Output {
    pub fn open(host: &str, port: u16, settings: &PushSettings) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let description = format!(
            "appsrc name=src is-live=true format=time do-timestamp=false ! {} ! \
             udpsink host={} port={} sync=false",
            gst::encoder_chain(settings, None),
            host,
            port
        );
        log::debug!("push pipeline: {}", description);

        let pipeline = gstreamer::parse::launch(&description)
            .context("build push pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("push pipeline is not a Pipeline"))?;
        let appsrc = pipeline
            .by_name("src")
            .context("appsrc element missing from pipeline")?
            .downcast::<gstreamer_app::AppSrc>()
            .map_err(|_| anyhow!("appsrc element has unexpected type"))?;
        appsrc.set_format(gstreamer::Format::Time);
        appsrc.set_is_live(true);
        appsrc.set_stream_type(gstreamer_app::AppStreamType::Stream);

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("start push pipeline")?;

        let target = format!("{}:{}", host, port);
        log::info!("UdpH264Output: streaming to udp://{}", target);
        Ok(Self {
            pipeline,
            appsrc,
            fps: settings.fps.max(1),
            caps_size: None,
            target,
        })
    }

    fn ensure_caps(&mut self, width: u32, height: u32) -> Result<()> {
        if self.caps_size == Some((width, height)) {
            return Ok(());
        }
        self.appsrc
            .set_caps(Some(&gst::rgb_caps(width, height, self.fps)?));
        self.caps_size = Some((width, height));
        Ok(())
    }
}

impl PushOutput for UdpH264Output {
    fn emit(&mut self, frame: &AnnotatedFrame, pts: Duration, duration: Duration) -> Result<()> {
        self.ensure_caps(frame.width(), frame.height())?;

        let buffer = gst::frame_buffer(frame, pts, duration)?;
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| anyhow!("push to udp://{} failed: {:?}", self.target, e))?;
        Ok(())
    }

    fn finish(&mut self) {
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(gstreamer::State::Null);
        log::info!("UdpH264Output: closed udp://{}", self.target);
    }
}

/// Assigns each camera its own port, stable across restarts of that camera.
pub struct UdpH264OutputFactory {
    settings: PushSettings,
    ports: Mutex<HashMap<String, u16>>,
}

impl UdpH264OutputFactory {
    pub fn new(settings: PushSettings) -> Self {
        Self {
            settings,
            ports: Mutex::new(HashMap::new()),
        }
    }

    fn port_for(&self, camera_id: &str) -> Result<u16> {
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(port) = ports.get(camera_id) {
            return Ok(*port);
        }
        let offset = u16::try_from(ports.len()).context("too many push outputs")?;
        let port = self
            .settings
            .base_port
            .checked_add(offset)
            .ok_or_else(|| anyhow!("push port range exhausted"))?;
        ports.insert(camera_id.to_string(), port);
        Ok(port)
    }
}

impl PushOutputFactory for UdpH264OutputFactory {
    fn open(&self, camera_id: &str, _sink: &PushSink) -> Result<PushAttachment> {
        let port = self.port_for(camera_id)?;
        let output = UdpH264Output::open(&self.settings.host, port, &self.settings)?;
        Ok(PushAttachment::Paced(Box::new(output)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_are_stable_per_camera() -> Result<()> {
        let factory = UdpH264OutputFactory::new(PushSettings {
            base_port: 6000,
            ..PushSettings::default()
        });
        assert_eq!(factory.port_for("a")?, 6000);
        assert_eq!(factory.port_for("b")?, 6001);
        assert_eq!(factory.port_for("a")?, 6000);
        Ok(())
    }
}
