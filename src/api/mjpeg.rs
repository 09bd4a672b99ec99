//! JPEG encoding and `multipart/x-mixed-replace` framing.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use std::io::Write;

use crate::frame::AnnotatedFrame;

pub const BOUNDARY: &str = "frame";
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

pub fn encode_jpeg(frame: &AnnotatedFrame, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(
            frame.pixels(),
            frame.width(),
            frame.height(),
            image::ExtendedColorType::Rgb8,
        )
        .with_context(|| format!("encode jpeg for {}", frame.camera_id()))?;
    Ok(out)
}

pub fn write_stream_header<W: Write>(stream: &mut W) -> Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        BOUNDARY
    );
    stream.write_all(header.as_bytes())?;
    stream.flush()?;
    Ok(())
}

pub fn write_part<W: Write>(stream: &mut W, jpeg: &[u8]) -> Result<()> {
    let part = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    stream.write_all(part.as_bytes())?;
    stream.write_all(jpeg)?;
    stream.write_all(b"\r\n")?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn frame(width: u32, height: u32) -> AnnotatedFrame {
        AnnotatedFrame::new(
            Arc::from("cam"),
            1,
            width,
            height,
            vec![128; (width * height * 3) as usize],
            0,
            Instant::now(),
        )
        .unwrap()
    }

    #[test]
    fn encodes_valid_jpeg() -> Result<()> {
        let jpeg = encode_jpeg(&frame(16, 8), DEFAULT_JPEG_QUALITY)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
        Ok(())
    }

    #[test]
    fn part_framing() -> Result<()> {
        let mut out = Vec::new();
        write_part(&mut out, b"abc")?;
        assert_eq!(
            out,
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 3\r\n\r\nabc\r\n"
        );
        Ok(())
    }
}
