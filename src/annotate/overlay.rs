//! Drawing helpers for packed RGB8 buffers.

use anyhow::{anyhow, Result};

pub const RED: [u8; 3] = [230, 30, 30];

/// Axis-aligned rectangle in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// Draw the outline of `rect`, clipped to the frame.
pub fn draw_rect(
    pixels: &mut [u8],
    width: u32,
    height: u32,
    rect: Rect,
    color: [u8; 3],
    thickness: u32,
) -> Result<()> {
    if pixels.len() != width as usize * height as usize * 3 {
        return Err(anyhow!("overlay buffer does not match {}x{} RGB", width, height));
    }
    if rect.w == 0 || rect.h == 0 || rect.x >= width || rect.y >= height {
        return Ok(());
    }
    let x0 = rect.x;
    let y0 = rect.y;
    let x1 = rect.x.saturating_add(rect.w).min(width) - 1;
    let y1 = rect.y.saturating_add(rect.h).min(height) - 1;
    let t = thickness.max(1);

    for y in y0..=y1 {
        for x in x0..=x1 {
            let on_edge = x < x0 + t || x + t > x1 || y < y0 + t || y + t > y1;
            if on_edge {
                let i = (y as usize * width as usize + x as usize) * 3;
                pixels[i..i + 3].copy_from_slice(&color);
            }
        }
    }
    Ok(())
}
