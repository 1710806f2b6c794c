//! Legacy Bitmap Path
//!
//! Fallback encoding for clients without GFX, RFX or NSC: damage is
//! tiled into 64×64 blocks aligned to 4 on both axes, each tile is
//! compressed (planar for 32-bit output, interleaved RLE for 24/16/15),
//! and as many tiles as fit are packed into one BitmapUpdate. The
//! packing budget is `MultifragMaxRequestSize − 2` with 26 bytes of
//! per-tile overhead.

use bytes::{BufMut, Bytes, BytesMut};

use crate::graphics::buffer::RdpBuffer;
use crate::graphics::damage::{DamageRegion, TILE_SIZE};
use crate::peer::pdu::BitmapUpdateRect;

/// Per-tile wire overhead inside a BitmapUpdate.
pub const BITMAP_DATA_OVERHEAD: usize = 26;

/// Budget slack reserved in every BitmapUpdate.
pub const BITMAP_UPDATE_SLACK: usize = 2;

/// One tile destined for a BitmapUpdate, in surface coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Tile a damage region into 64×64 blocks whose origins are aligned
/// down to a multiple of 4 on both axes, clamped to the surface.
pub fn tile_damage(
    region: &DamageRegion,
    surface_width: u32,
    surface_height: u32,
) -> Vec<TileRect> {
    let x0 = region.x & !3;
    let y0 = region.y & !3;
    let x1 = (region.x + region.width).min(surface_width);
    let y1 = (region.y + region.height).min(surface_height);

    let mut tiles = Vec::new();
    let mut y = y0;
    while y < y1 {
        let height = TILE_SIZE.min(y1 - y);
        let mut x = x0;
        while x < x1 {
            let width = TILE_SIZE.min(x1 - x);
            tiles.push(TileRect {
                x,
                y,
                width,
                height,
            });
            x += TILE_SIZE;
        }
        y += TILE_SIZE;
    }
    tiles
}

/// Compress one tile out of a captured BGRA frame at the negotiated
/// color depth. Output scanlines run bottom-up as the wire demands.
pub fn compress_tile(frame: &RdpBuffer, tile: TileRect, bits_per_pixel: u32) -> BitmapUpdateRect {
    let data = match bits_per_pixel {
        32 => planar_compress(frame, tile),
        24 | 16 | 15 => interleaved_compress(frame, tile, bits_per_pixel),
        other => {
            // The capability gate only lets {15, 16, 24, 32} through.
            unreachable!("unsupported bitmap depth {other}")
        }
    };

    BitmapUpdateRect {
        dest_left: tile.x as u16,
        dest_top: tile.y as u16,
        dest_right: (tile.x + tile.width - 1) as u16,
        dest_bottom: (tile.y + tile.height - 1) as u16,
        width: tile.width as u16,
        height: tile.height as u16,
        bits_per_pixel: bits_per_pixel as u16,
        compressed: true,
        data,
    }
}

/// Pack compressed tiles into BitmapUpdates that fit the fragmentation
/// budget. Tiles larger than the remaining budget start a new update.
pub fn pack_updates(
    rects: Vec<BitmapUpdateRect>,
    multifrag_max_request_size: u32,
) -> Vec<Vec<BitmapUpdateRect>> {
    let budget = (multifrag_max_request_size as usize).saturating_sub(BITMAP_UPDATE_SLACK);
    let mut updates = Vec::new();
    let mut current: Vec<BitmapUpdateRect> = Vec::new();
    let mut used = 0usize;

    for rect in rects {
        let cost = BITMAP_DATA_OVERHEAD + rect.data.len();
        if !current.is_empty() && used + cost > budget {
            updates.push(std::mem::take(&mut current));
            used = 0;
        }
        used += cost;
        current.push(rect);
    }
    if !current.is_empty() {
        updates.push(current);
    }
    updates
}

// =============================================================================
// Planar (32-bit)
// =============================================================================

/// Planar format header: no alpha plane, no RLE, no chroma subsampling.
const PLANAR_NO_ALPHA: u8 = 0x20;

/// Raw-plane planar compression ([MS-RDPEGDI] 2.2.2.5.1): a format
/// header, the R/G/B planes scanline by scanline bottom-up, and the
/// mandatory trailing pad byte of the non-RLE form.
fn planar_compress(frame: &RdpBuffer, tile: TileRect) -> Bytes {
    let plane_len = (tile.width * tile.height) as usize;
    let mut out = BytesMut::with_capacity(1 + plane_len * 3 + 1);
    out.put_u8(PLANAR_NO_ALPHA);

    // Capture data is BGRA; planes go out in R, G, B order.
    for channel in [2usize, 1, 0] {
        for row in (0..tile.height).rev() {
            let line = frame.row(tile.y + row);
            for x in 0..tile.width {
                out.put_u8(line[((tile.x + x) * 4) as usize + channel]);
            }
        }
    }

    out.put_u8(0);
    out.freeze()
}

// =============================================================================
// Interleaved RLE (24/16/15-bit)
// =============================================================================

/// Regular order codes ([MS-RDPEGDI] 2.2.2.5.1.1).
const REGULAR_COLOR_RUN: u8 = 0x3;
const REGULAR_COLOR_IMAGE: u8 = 0x4;

fn put_regular_order(out: &mut BytesMut, code: u8, run_length: usize) {
    debug_assert!(run_length >= 1);
    if run_length <= 31 {
        out.put_u8((code << 5) | run_length as u8);
    } else {
        // MEGA run: zero length field, next byte carries length − 32.
        debug_assert!(run_length <= 255 + 32);
        out.put_u8(code << 5);
        out.put_u8((run_length - 32) as u8);
    }
}

/// Longest run encodable by one regular/MEGA order.
const MAX_RUN: usize = 255 + 32;

fn convert_pixel(bgra: &[u8], bits_per_pixel: u32, out: &mut Vec<u8>) {
    let b = bgra[0] as u16;
    let g = bgra[1] as u16;
    let r = bgra[2] as u16;
    match bits_per_pixel {
        24 => {
            out.push(bgra[0]);
            out.push(bgra[1]);
            out.push(bgra[2]);
        }
        16 => {
            let value = ((r >> 3) << 11) | ((g >> 2) << 5) | (b >> 3);
            out.extend_from_slice(&value.to_le_bytes());
        }
        15 => {
            let value = ((r >> 3) << 10) | ((g >> 3) << 5) | (b >> 3);
            out.extend_from_slice(&value.to_le_bytes());
        }
        _ => unreachable!(),
    }
}

/// Interleaved RLE over color runs and literal color images, scanning
/// bottom-up in destination pixel order.
fn interleaved_compress(frame: &RdpBuffer, tile: TileRect, bits_per_pixel: u32) -> Bytes {
    let bytes_per_pixel = if bits_per_pixel == 24 { 3 } else { 2 };

    // Convert the tile bottom-up into the destination pixel format.
    let mut pixels: Vec<u8> =
        Vec::with_capacity((tile.width * tile.height) as usize * bytes_per_pixel);
    for row in (0..tile.height).rev() {
        let line = frame.row(tile.y + row);
        for x in 0..tile.width {
            let offset = ((tile.x + x) * 4) as usize;
            convert_pixel(&line[offset..offset + 4], bits_per_pixel, &mut pixels);
        }
    }

    let pixel_count = (tile.width * tile.height) as usize;
    let pixel_at = |i: usize| &pixels[i * bytes_per_pixel..(i + 1) * bytes_per_pixel];

    let mut out = BytesMut::with_capacity(pixels.len() / 2 + 16);
    let mut i = 0usize;
    let mut literal_start = 0usize;

    let flush_literals = |out: &mut BytesMut, start: usize, end: usize| {
        let mut start = start;
        while start < end {
            let chunk = (end - start).min(MAX_RUN);
            put_regular_order(out, REGULAR_COLOR_IMAGE, chunk);
            out.extend_from_slice(&pixels[start * bytes_per_pixel..(start + chunk) * bytes_per_pixel]);
            start += chunk;
        }
    };

    while i < pixel_count {
        // Length of the run of identical pixels starting at i.
        let mut run = 1usize;
        while i + run < pixel_count && run < MAX_RUN && pixel_at(i + run) == pixel_at(i) {
            run += 1;
        }

        if run >= 4 {
            flush_literals(&mut out, literal_start, i);
            put_regular_order(&mut out, REGULAR_COLOR_RUN, run);
            out.extend_from_slice(pixel_at(i));
            i += run;
            literal_start = i;
        } else {
            i += run;
        }
    }
    flush_literals(&mut out, literal_start, pixel_count);

    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: u32, height: u32, bgra: [u8; 4]) -> RdpBuffer {
        let mut data = vec![0u8; (width * height * 4) as usize];
        for pixel in data.chunks_exact_mut(4) {
            pixel.copy_from_slice(&bgra);
        }
        RdpBuffer::standalone(width, height, width * 4, data)
    }

    #[test]
    fn test_tile_damage_aligns_origin() {
        let region = DamageRegion::new(66, 130, 30, 20);
        let tiles = tile_damage(&region, 1920, 1080);
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].x, 64);
        assert_eq!(tiles[0].y, 128);
    }

    #[test]
    fn test_tile_damage_splits_large_region() {
        let region = DamageRegion::new(0, 0, 130, 70);
        let tiles = tile_damage(&region, 1920, 1080);
        // 3 columns × 2 rows.
        assert_eq!(tiles.len(), 6);
        assert_eq!(tiles[0], TileRect { x: 0, y: 0, width: 64, height: 64 });
        assert_eq!(tiles[2], TileRect { x: 128, y: 0, width: 2, height: 64 });
        assert_eq!(tiles[5].height, 6);
    }

    #[test]
    fn test_tile_damage_clamps_to_surface() {
        let region = DamageRegion::new(60, 60, 64, 64);
        let tiles = tile_damage(&region, 100, 100);
        for tile in tiles {
            assert!(tile.x + tile.width <= 100);
            assert!(tile.y + tile.height <= 100);
        }
    }

    #[test]
    fn test_planar_layout() {
        let frame = solid_frame(4, 4, [0x10, 0x20, 0x30, 0xFF]);
        let tile = TileRect { x: 0, y: 0, width: 4, height: 4 };
        let rect = compress_tile(&frame, tile, 32);

        // Header + three 16-byte planes + pad byte.
        assert_eq!(rect.data.len(), 1 + 3 * 16 + 1);
        assert_eq!(rect.data[0], PLANAR_NO_ALPHA);
        // R plane first.
        assert_eq!(rect.data[1], 0x30);
        // G plane.
        assert_eq!(rect.data[1 + 16], 0x20);
        // B plane.
        assert_eq!(rect.data[1 + 32], 0x10);
        assert_eq!(rect.data[rect.data.len() - 1], 0);
    }

    #[test]
    fn test_interleaved_solid_tile_is_one_run() {
        let frame = solid_frame(8, 8, [0, 0, 0xFF, 0xFF]);
        let tile = TileRect { x: 0, y: 0, width: 8, height: 8 };
        let rect = compress_tile(&frame, tile, 16);

        // One MEGA color run (64 pixels) + pixel value: 4 bytes total.
        assert_eq!(rect.data.len(), 4);
        assert_eq!(rect.data[0], REGULAR_COLOR_RUN << 5);
        assert_eq!(rect.data[1], (64 - 32) as u8);
        // Pure red in RGB565, little endian.
        assert_eq!(&rect.data[2..4], &0xF800u16.to_le_bytes());
    }

    #[test]
    fn test_interleaved_literals() {
        // A 2×2 tile of four distinct colors compresses to one literal image.
        let mut data = vec![0u8; 16];
        for (i, pixel) in data.chunks_exact_mut(4).enumerate() {
            pixel.copy_from_slice(&[i as u8 * 40, 0, 0, 0xFF]);
        }
        let frame = RdpBuffer::standalone(2, 2, 8, data);
        let tile = TileRect { x: 0, y: 0, width: 2, height: 2 };
        let rect = compress_tile(&frame, tile, 16);

        assert_eq!(rect.data[0], (REGULAR_COLOR_IMAGE << 5) | 4);
        assert_eq!(rect.data.len(), 1 + 4 * 2);
    }

    #[test]
    fn test_pack_updates_respects_budget() {
        let rect = |len: usize| BitmapUpdateRect {
            dest_left: 0,
            dest_top: 0,
            dest_right: 63,
            dest_bottom: 63,
            width: 64,
            height: 64,
            bits_per_pixel: 16,
            compressed: true,
            data: Bytes::from(vec![0u8; len]),
        };

        // Budget 200 − 2 = 198; each rect costs 26 + 64 = 90.
        let updates = pack_updates(vec![rect(64), rect(64), rect(64)], 200);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].len(), 2);
        assert_eq!(updates[1].len(), 1);
    }

    #[test]
    fn test_pack_updates_oversized_rect_alone() {
        let big = BitmapUpdateRect {
            dest_left: 0,
            dest_top: 0,
            dest_right: 63,
            dest_bottom: 63,
            width: 64,
            height: 64,
            bits_per_pixel: 16,
            compressed: true,
            data: Bytes::from(vec![0u8; 4096]),
        };
        let updates = pack_updates(vec![big], 200);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].len(), 1);
    }

    #[test]
    fn test_pixel_conversion_15bpp() {
        let mut out = Vec::new();
        convert_pixel(&[0xFF, 0x00, 0x00, 0xFF], 15, &mut out);
        assert_eq!(&out[..], &0x001Fu16.to_le_bytes());
    }
}
