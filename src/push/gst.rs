//! GStreamer pieces shared by the push outputs.

use anyhow::{anyhow, Context, Result};
use std::time::Duration;

use super::PushSettings;
use crate::frame::AnnotatedFrame;

/// `! videoconvert ! videoscale ! ... ! rtph264pay` tail after an `appsrc`.
pub(super) fn encoder_chain(settings: &PushSettings, payloader_name: Option<&str>) -> String {
    let scale = match (settings.width, settings.height) {
        (0, 0) => String::new(),
        (w, 0) => format!(",width={}", w),
        (0, h) => format!(",height={}", h),
        (w, h) => format!(",width={},height={}", w, h),
    };
    let name = payloader_name
        .map(|name| format!(" name={}", name))
        .unwrap_or_default();
    format!(
        "videoconvert ! videoscale ! video/x-raw,format=I420{} ! \
         x264enc tune=zerolatency speed-preset=ultrafast ! \
         rtph264pay config-interval=1 pt=96{}",
        scale, name
    )
}

/// Packed RGB caps for frames of the given size.
pub(super) fn rgb_caps(width: u32, height: u32, fps: u32) -> Result<gstreamer::Caps> {
    gstreamer_video::VideoInfo::builder(gstreamer_video::VideoFormat::Rgb, width, height)
        .fps(gstreamer::Fraction::new(fps.max(1) as i32, 1))
        .build()
        .context("push caps")?
        .to_caps()
        .context("push caps")
}

/// Copy a frame into a timestamped buffer.
pub(super) fn frame_buffer(
    frame: &AnnotatedFrame,
    pts: Duration,
    duration: Duration,
) -> Result<gstreamer::Buffer> {
    let mut buffer = gstreamer::Buffer::from_slice(frame.pixels().to_vec());
    {
        let buffer = buffer
            .get_mut()
            .ok_or_else(|| anyhow!("push buffer is not writable"))?;
        buffer.set_pts(gstreamer::ClockTime::from_nseconds(pts.as_nanos() as u64));
        buffer.set_duration(gstreamer::ClockTime::from_nseconds(
            duration.as_nanos() as u64,
        ));
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_chain_scales_and_names_payloader() {
        let settings = PushSettings {
            width: 640,
            ..PushSettings::default()
        };
        let chain = encoder_chain(&settings, Some("pay0"));
        assert!(chain.contains("format=I420,width=640 !"));
        assert!(chain.ends_with("pt=96 name=pay0"));
        assert!(!encoder_chain(&PushSettings::default(), None).contains("name="));
    }
}
