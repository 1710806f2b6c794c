//! Damage Detection
//!
//! Tile-based frame differencing between the previously submitted frame
//! and the next capture, at 64×64 granularity. Each surface owns one
//! detector; the first encode of a surface, and any encode after an
//! explicit invalidation, damages the whole surface.
//!
//! Comparison is exact: a frame byte-identical to its predecessor
//! produces an empty damage region and no PDU downstream.

use crate::graphics::buffer::RdpBuffer;

/// Tile edge length in pixels.
pub const TILE_SIZE: u32 = 64;

/// A damaged rectangle in surface coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DamageRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl DamageRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        DamageRegion {
            x,
            y,
            width,
            height,
        }
    }

    /// Region covering the whole surface.
    pub fn full_surface(width: u32, height: u32) -> Self {
        DamageRegion {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Per-surface damage detector.
pub struct DamageDetector {
    width: u32,
    height: u32,
    tiles_x: u32,
    tiles_y: u32,
    /// Last submitted frame, `stride == width * 4`.
    previous: Option<Vec<u8>>,
    tile_dirty: Vec<bool>,
    invalidated: bool,
}

impl DamageDetector {
    /// Create a detector for a surface of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        let tiles_x = width.div_ceil(TILE_SIZE);
        let tiles_y = height.div_ceil(TILE_SIZE);
        DamageDetector {
            width,
            height,
            tiles_x,
            tiles_y,
            previous: None,
            tile_dirty: vec![false; (tiles_x * tiles_y) as usize],
            invalidated: true,
        }
    }

    /// Force full-surface damage on the next frame (layout change,
    /// client-side invalidation, graphics reset).
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    /// Compare `frame` against the previous submitted frame and return
    /// the damaged regions, merged into per-row spans of dirty tiles.
    ///
    /// The frame becomes the new comparison baseline regardless of the
    /// result.
    pub fn detect(&mut self, frame: &RdpBuffer) -> Vec<DamageRegion> {
        debug_assert_eq!(frame.width(), self.width);
        debug_assert_eq!(frame.height(), self.height);

        if self.previous.is_none() || self.invalidated {
            self.store_baseline(frame);
            self.invalidated = false;
            return vec![DamageRegion::full_surface(self.width, self.height)];
        }

        self.tile_dirty.iter_mut().for_each(|d| *d = false);

        let previous = self.previous.take().unwrap_or_default();
        let mut any_dirty = false;
        for ty in 0..self.tiles_y {
            for tx in 0..self.tiles_x {
                if self.tile_differs(&previous, frame, tx, ty) {
                    self.tile_dirty[(ty * self.tiles_x + tx) as usize] = true;
                    any_dirty = true;
                }
            }
        }
        self.previous = Some(previous);
        self.store_baseline(frame);

        if !any_dirty {
            return Vec::new();
        }
        self.dirty_tiles_to_regions()
    }

    fn store_baseline(&mut self, frame: &RdpBuffer) {
        let row_bytes = self.width as usize * 4;
        let mut baseline = self.previous.take().unwrap_or_default();
        baseline.clear();
        baseline.reserve(row_bytes * self.height as usize);
        for y in 0..self.height {
            baseline.extend_from_slice(frame.row(y));
        }
        self.previous = Some(baseline);
    }

    fn tile_differs(&self, previous: &[u8], frame: &RdpBuffer, tx: u32, ty: u32) -> bool {
        let x0 = tx * TILE_SIZE;
        let y0 = ty * TILE_SIZE;
        let tile_w = TILE_SIZE.min(self.width - x0) as usize * 4;
        let tile_h = TILE_SIZE.min(self.height - y0);
        let row_bytes = self.width as usize * 4;
        let x_bytes = x0 as usize * 4;

        for row in 0..tile_h {
            let y = (y0 + row) as usize;
            let prev_row = &previous[y * row_bytes + x_bytes..y * row_bytes + x_bytes + tile_w];
            let curr_row = &frame.row(y as u32)[x_bytes..x_bytes + tile_w];
            if prev_row != curr_row {
                return true;
            }
        }
        false
    }

    /// Merge horizontally adjacent dirty tiles into row spans.
    fn dirty_tiles_to_regions(&self) -> Vec<DamageRegion> {
        let mut regions = Vec::new();

        for ty in 0..self.tiles_y {
            let mut span_start: Option<u32> = None;
            for tx in 0..=self.tiles_x {
                let dirty =
                    tx < self.tiles_x && self.tile_dirty[(ty * self.tiles_x + tx) as usize];
                match (dirty, span_start) {
                    (true, None) => span_start = Some(tx),
                    (false, Some(start)) => {
                        regions.push(self.span_region(start, tx, ty));
                        span_start = None;
                    }
                    _ => {}
                }
            }
        }

        regions
    }

    fn span_region(&self, tx_start: u32, tx_end: u32, ty: u32) -> DamageRegion {
        let x = tx_start * TILE_SIZE;
        let y = ty * TILE_SIZE;
        let width = (tx_end * TILE_SIZE).min(self.width) - x;
        let height = TILE_SIZE.min(self.height - y);
        DamageRegion::new(x, y, width, height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u32, height: u32, fill: u8) -> RdpBuffer {
        RdpBuffer::standalone(
            width,
            height,
            width * 4,
            vec![fill; (width * height * 4) as usize],
        )
    }

    #[test]
    fn test_first_frame_full_damage() {
        let mut detector = DamageDetector::new(256, 128);
        let damage = detector.detect(&frame(256, 128, 0));
        assert_eq!(damage, vec![DamageRegion::full_surface(256, 128)]);
    }

    #[test]
    fn test_identical_frames_empty_damage() {
        let mut detector = DamageDetector::new(256, 128);
        let f = frame(256, 128, 0x80);
        let _ = detector.detect(&f);
        assert!(detector.detect(&f).is_empty());
    }

    #[test]
    fn test_invalidate_forces_full_damage() {
        let mut detector = DamageDetector::new(256, 128);
        let f = frame(256, 128, 0x80);
        let _ = detector.detect(&f);
        detector.invalidate();
        assert_eq!(
            detector.detect(&f),
            vec![DamageRegion::full_surface(256, 128)]
        );
    }

    #[test]
    fn test_single_tile_damage() {
        let mut detector = DamageDetector::new(256, 128);
        let f1 = frame(256, 128, 0);
        let _ = detector.detect(&f1);

        // Touch one pixel inside tile (1, 1).
        let mut f2 = frame(256, 128, 0);
        let offset = 70 * 256 * 4 + 70 * 4;
        f2.data_mut()[offset] = 0xFF;

        let damage = detector.detect(&f2);
        assert_eq!(damage, vec![DamageRegion::new(64, 64, 64, 64)]);
    }

    #[test]
    fn test_adjacent_tiles_merge_into_span() {
        let mut detector = DamageDetector::new(256, 64);
        let _ = detector.detect(&frame(256, 64, 0));

        // Touch tiles 1 and 2 of the single tile row.
        let mut f2 = frame(256, 64, 0);
        f2.data_mut()[10 * 256 * 4 + 70 * 4] = 1;
        f2.data_mut()[10 * 256 * 4 + 140 * 4] = 1;

        let damage = detector.detect(&f2);
        assert_eq!(damage, vec![DamageRegion::new(64, 0, 128, 64)]);
    }

    #[test]
    fn test_edge_tiles_clamped() {
        // 100×100 surface: edge tiles are 36 pixels wide/tall.
        let mut detector = DamageDetector::new(100, 100);
        let _ = detector.detect(&frame(100, 100, 0));

        let mut f2 = frame(100, 100, 0);
        f2.data_mut()[99 * 100 * 4 + 99 * 4] = 1;

        let damage = detector.detect(&f2);
        assert_eq!(damage, vec![DamageRegion::new(64, 64, 36, 36)]);
    }

    #[test]
    fn test_baseline_advances_each_frame() {
        let mut detector = DamageDetector::new(64, 64);
        let _ = detector.detect(&frame(64, 64, 0));
        let _ = detector.detect(&frame(64, 64, 1));
        // Same content as the last frame: no damage.
        assert!(detector.detect(&frame(64, 64, 1)).is_empty());
    }
}
