//! Synthetic frame source.
//!
//! `stub://<name>[?key=value&...]` URLs produce a moving-bar RGB pattern
//! without touching any device. Query keys:
//! - `width`, `height`: frame size (defaults from `CaptureSettings`)
//! - `fps`: pacing rate, `0` for unpaced
//! - `fail_after=N`: after N frames every read is `Pending` (dead source)
//! - `end_after=N`: after N frames the source reports end of stream
//! - `error_after=N`: after N frames every read fails

use anyhow::{anyhow, Context, Result};
use std::time::{Duration, Instant};

use super::{CaptureSettings, FrameSource, ReadOutcome};
use crate::frame::{rgb_buffer_len, RawFrame};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct StubOptions {
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    fail_after: Option<u64>,
    end_after: Option<u64>,
    error_after: Option<u64>,
}

/// Synthetic capture handle for `stub://` URLs.
pub struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    frame_interval: Option<Duration>,
    next_frame_at: Option<Instant>,
    options: StubOptions,
    frame_count: u64,
    closed: bool,
}

impl SyntheticSource {
    pub fn open(url: &str, settings: &CaptureSettings) -> Result<Self> {
        let rest = url
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("synthetic sources require a stub:// url"))?;
        let (name, query) = match rest.split_once('?') {
            Some((name, query)) => (name, query),
            None => (rest, ""),
        };
        let options = parse_options(query).with_context(|| format!("parse {}", url))?;

        let width = options.width.unwrap_or(settings.width);
        let height = options.height.unwrap_or(settings.height);
        if width == 0 || height == 0 {
            return Err(anyhow!("synthetic source {} has a zero dimension", url));
        }
        rgb_buffer_len(width, height).with_context(|| format!("open {}", url))?;
        let fps = options.fps.unwrap_or(settings.target_fps);
        let frame_interval = (fps > 0).then(|| Duration::from_secs(1) / fps);

        log::info!(
            "SyntheticSource: opened {} ({}x{}, fps={})",
            name,
            width,
            height,
            fps
        );
        Ok(Self {
            name: name.to_string(),
            width,
            height,
            frame_interval,
            next_frame_at: None,
            options,
            frame_count: 0,
            closed: false,
        })
    }

    pub fn frames_produced(&self) -> u64 {
        self.frame_count
    }

    fn pace(&mut self) {
        let Some(interval) = self.frame_interval else {
            return;
        };
        let now = Instant::now();
        if let Some(due) = self.next_frame_at {
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_frame_at = Some(Instant::now() + interval);
    }

    /// Dark horizontal gradient with a bright vertical bar sweeping left to right.
    fn generate_pixels(&self) -> Vec<u8> {
        let width = self.width as usize;
        let height = self.height as usize;
        let bar_width = (width / 8).max(1);
        let bar_start = ((self.frame_count as usize) * 4) % width;

        let mut pixels = vec![0u8; width * height * 3];
        for (i, px) in pixels.chunks_exact_mut(3).enumerate() {
            let x = i % width;
            let in_bar = (x + width - bar_start) % width < bar_width;
            if in_bar {
                px.copy_from_slice(&[240, 240, 240]);
            } else {
                let shade = ((x * 64) / width) as u8;
                px.copy_from_slice(&[shade, shade / 2, 32]);
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn read_frame(&mut self) -> Result<ReadOutcome> {
        if self.closed {
            return Err(anyhow!("synthetic source {} is closed", self.name));
        }
        if let Some(limit) = self.options.end_after {
            if self.frame_count >= limit {
                return Ok(ReadOutcome::Ended);
            }
        }
        if let Some(limit) = self.options.fail_after {
            if self.frame_count >= limit {
                return Ok(ReadOutcome::Pending);
            }
        }
        if let Some(limit) = self.options.error_after {
            if self.frame_count >= limit {
                return Err(anyhow!("synthetic source {} read error", self.name));
            }
        }

        self.pace();
        let pixels = self.generate_pixels();
        self.frame_count += 1;
        Ok(ReadOutcome::Frame(RawFrame::new(
            pixels,
            self.width,
            self.height,
        )?))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            log::info!(
                "SyntheticSource: closed {} after {} frames",
                self.name,
                self.frame_count
            );
        }
    }
}

fn parse_options(query: &str) -> Result<StubOptions> {
    let mut options = StubOptions::default();
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("query parameter '{}' has no value", pair))?;
        match key {
            "width" => options.width = Some(parse_number(key, value)?),
            "height" => options.height = Some(parse_number(key, value)?),
            "fps" => options.fps = Some(parse_number(key, value)?),
            "fail_after" => options.fail_after = Some(parse_number(key, value)?),
            "end_after" => options.end_after = Some(parse_number(key, value)?),
            "error_after" => options.error_after = Some(parse_number(key, value)?),
            other => return Err(anyhow!("unknown stub parameter '{}'", other)),
        }
    }
    Ok(options)
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("stub parameter '{}' must be a non-negative integer", key))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> CaptureSettings {
        CaptureSettings {
            width: 16,
            height: 8,
            target_fps: 0,
            ..CaptureSettings::default()
        }
    }

    #[test]
    fn parses_query_options() -> Result<()> {
        let options = parse_options("width=32&height=24&fps=0&fail_after=3")?;
        assert_eq!(
            options,
            StubOptions {
                width: Some(32),
                height: Some(24),
                fps: Some(0),
                fail_after: Some(3),
                ..StubOptions::default()
            }
        );
        assert!(parse_options("width=-1").is_err());
        assert!(parse_options("colour=red").is_err());
        assert!(parse_options("width").is_err());
        Ok(())
    }

    #[test]
    fn produces_frames_that_change() -> Result<()> {
        let mut source = SyntheticSource::open("stub://test", &settings())?;
        let ReadOutcome::Frame(first) = source.read_frame()? else {
            panic!("expected frame");
        };
        let ReadOutcome::Frame(second) = source.read_frame()? else {
            panic!("expected frame");
        };
        assert_eq!((first.width, first.height), (16, 8));
        assert_ne!(first.pixels(), second.pixels());
        assert!(second.captured_at() >= first.captured_at());
        Ok(())
    }

    #[test]
    fn fail_after_turns_into_pending() -> Result<()> {
        let mut source = SyntheticSource::open("stub://dead?fail_after=1", &settings())?;
        assert!(matches!(source.read_frame()?, ReadOutcome::Frame(_)));
        assert!(matches!(source.read_frame()?, ReadOutcome::Pending));
        assert!(matches!(source.read_frame()?, ReadOutcome::Pending));
        assert_eq!(source.frames_produced(), 1);
        Ok(())
    }

    #[test]
    fn end_after_reports_end_of_stream() -> Result<()> {
        let mut source = SyntheticSource::open("stub://clip?end_after=2", &settings())?;
        assert!(matches!(source.read_frame()?, ReadOutcome::Frame(_)));
        assert!(matches!(source.read_frame()?, ReadOutcome::Frame(_)));
        assert!(matches!(source.read_frame()?, ReadOutcome::Ended));
        Ok(())
    }

    #[test]
    fn oversized_dimensions_fail_at_open() {
        let huge = "stub://x?width=4294967295&height=4294967295&fps=0";
        assert!(SyntheticSource::open(huge, &settings()).is_err());
        assert!(SyntheticSource::open("stub://x?width=70000&height=70000", &settings()).is_err());
        assert!(SyntheticSource::open("stub://x?width=0", &settings()).is_err());
    }

    #[test]
    fn closed_source_refuses_reads() -> Result<()> {
        let mut source = SyntheticSource::open("stub://test?error_after=5", &settings())?;
        source.close();
        assert!(source.read_frame().is_err());
        Ok(())
    }

    #[test]
    fn paced_source_waits_between_frames() -> Result<()> {
        let mut source = SyntheticSource::open("stub://paced?fps=50", &settings())?;
        let started = Instant::now();
        for _ in 0..3 {
            assert!(matches!(source.read_frame()?, ReadOutcome::Frame(_)));
        }
        // Two full intervals of 20ms separate three frames.
        assert!(started.elapsed() >= Duration::from_millis(35));
        Ok(())
    }
}
