use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::annotate::overlay::{draw_rect, Rect, RED};
use crate::annotate::{Annotation, Annotator};
use crate::frame::RawFrame;

const DEFAULT_BLOCK: u32 = 16;
const DEFAULT_THRESHOLD: u8 = 12;

/// Block-difference motion annotator.
///
/// The frame is reduced to a grid of mean-luminance blocks. Blocks whose
/// mean moved by more than `threshold` since the previous frame are grouped
/// into 4-connected regions; each region is outlined in red and counted as
/// one object. The first frame, and any frame after a size change, reports
/// zero objects.
pub struct MotionAnnotator {
    block: u32,
    threshold: u8,
    previous: Option<BlockGrid>,
    last_digest: Option<[u8; 32]>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct BlockGrid {
    width: u32,
    height: u32,
    cols: u32,
    rows: u32,
    means: Vec<u8>,
}

impl MotionAnnotator {
    pub fn new() -> Self {
        Self::with_params(DEFAULT_BLOCK, DEFAULT_THRESHOLD)
    }

    pub fn with_params(block: u32, threshold: u8) -> Self {
        Self {
            block: block.max(1),
            threshold,
            previous: None,
            last_digest: None,
        }
    }

    fn regions(&self, previous: &BlockGrid, current: &BlockGrid) -> Vec<Rect> {
        let changed: Vec<bool> = previous
            .means
            .iter()
            .zip(&current.means)
            .map(|(a, b)| a.abs_diff(*b) > self.threshold)
            .collect();

        let cols = current.cols as usize;
        let rows = current.rows as usize;
        let mut seen = vec![false; changed.len()];
        let mut regions = Vec::new();

        for start in 0..changed.len() {
            if !changed[start] || seen[start] {
                continue;
            }
            let (mut min_c, mut max_c) = (start % cols, start % cols);
            let (mut min_r, mut max_r) = (start / cols, start / cols);
            let mut stack = vec![start];
            seen[start] = true;

            while let Some(idx) = stack.pop() {
                let (c, r) = (idx % cols, idx / cols);
                min_c = min_c.min(c);
                max_c = max_c.max(c);
                min_r = min_r.min(r);
                max_r = max_r.max(r);

                let mut neighbours = Vec::with_capacity(4);
                if c > 0 {
                    neighbours.push(idx - 1);
                }
                if c + 1 < cols {
                    neighbours.push(idx + 1);
                }
                if r > 0 {
                    neighbours.push(idx - cols);
                }
                if r + 1 < rows {
                    neighbours.push(idx + cols);
                }
                for n in neighbours {
                    if changed[n] && !seen[n] {
                        seen[n] = true;
                        stack.push(n);
                    }
                }
            }

            let x = min_c as u32 * self.block;
            let y = min_r as u32 * self.block;
            regions.push(Rect {
                x,
                y,
                w: ((max_c as u32 + 1) * self.block).min(current.width) - x,
                h: ((max_r as u32 + 1) * self.block).min(current.height) - y,
            });
        }
        regions
    }
}

impl Default for MotionAnnotator {
    fn default() -> Self {
        Self::new()
    }
}

impl Annotator for MotionAnnotator {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn annotate(&mut self, frame: &RawFrame) -> Result<Annotation> {
        let mut pixels = frame.pixels().to_vec();

        // Identical frames (frozen camera) skip the grid comparison.
        let digest: [u8; 32] = Sha256::digest(frame.pixels()).into();
        if self.last_digest == Some(digest) {
            return Ok(Annotation {
                pixels,
                object_count: 0,
            });
        }
        self.last_digest = Some(digest);

        let grid = block_means(frame, self.block);
        let regions = match &self.previous {
            Some(prev) if prev.width == grid.width && prev.height == grid.height => {
                self.regions(prev, &grid)
            }
            _ => Vec::new(),
        };
        for rect in &regions {
            draw_rect(&mut pixels, frame.width, frame.height, *rect, RED, 2)?;
        }
        self.previous = Some(grid);

        Ok(Annotation {
            pixels,
            object_count: regions.len() as u32,
        })
    }
}

fn block_means(frame: &RawFrame, block: u32) -> BlockGrid {
    let width = frame.width;
    let height = frame.height;
    let cols = width.div_ceil(block);
    let rows = height.div_ceil(block);
    let mut sums = vec![0u64; (cols * rows) as usize];
    let mut counts = vec![0u64; (cols * rows) as usize];

    for (i, px) in frame.pixels().chunks_exact(3).enumerate() {
        let x = i as u32 % width;
        let y = i as u32 / width;
        let luma = (77 * px[0] as u32 + 150 * px[1] as u32 + 29 * px[2] as u32) >> 8;
        let cell = ((y / block) * cols + x / block) as usize;
        sums[cell] += luma as u64;
        counts[cell] += 1;
    }

    let means = sums
        .iter()
        .zip(&counts)
        .map(|(sum, count)| (sum / (*count).max(1)) as u8)
        .collect();

    BlockGrid {
        width,
        height,
        cols,
        rows,
        means,
    }
}
