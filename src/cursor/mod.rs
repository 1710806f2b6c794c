//! Cursor Renderer
//!
//! Classifies host pointer updates into system/hidden/cached/normal
//! pointer PDUs and maintains a bounded LRU cache of uploaded cursor
//! bitmaps. Cache capacity is the pointer cache size negotiated with
//! the client; identity is the bitmap header plus a content hash of the
//! pixel bytes.
//!
//! Runs on the graphics thread; the session gates calls while it is
//! not active.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::peer::pdu::SystemPointerType;
use crate::peer::{OutputPdu, PeerResult, RdpPeer};

/// Cursors larger than this on either axis fall back to the system
/// default pointer.
const MAX_CURSOR_EXTENT: u32 = 384;

/// PointerNew carries cursors up to this size; larger ones go out as
/// PointerLarge.
const MAX_POINTER_NEW_EXTENT: u32 = 96;

/// Cache identity: header fields plus pixel content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    hotspot_x: u32,
    hotspot_y: u32,
    width: u32,
    height: u32,
    digest: [u8; 32],
}

struct CacheEntry {
    cache_index: u16,
    last_used: u64,
}

/// The per-session cursor renderer.
pub struct CursorRenderer {
    peer: Arc<dyn RdpPeer>,
    capacity: usize,
    entries: HashMap<CacheKey, CacheEntry>,
    use_counter: u64,
}

impl CursorRenderer {
    /// Create a renderer with the client-negotiated cache size.
    pub fn new(peer: Arc<dyn RdpPeer>, pointer_cache_size: u32) -> Self {
        CursorRenderer {
            peer,
            capacity: pointer_cache_size.max(1) as usize,
            entries: HashMap::new(),
            use_counter: 0,
        }
    }

    /// Forget all cached bitmaps (reconnect or teardown).
    pub fn clear(&mut self) {
        self.entries.clear();
        self.use_counter = 0;
    }

    /// The host hid the cursor.
    pub fn handle_cursor_hidden(&mut self) -> PeerResult<()> {
        trace!("cursor hidden");
        self.peer.send(OutputPdu::PointerSystem {
            ptr_type: SystemPointerType::Null,
        })
    }

    /// New cursor shape from the host: premultiplied BGRA pixels,
    /// `width * height * 4` bytes.
    pub fn handle_cursor_shape(
        &mut self,
        width: u32,
        height: u32,
        hotspot_x: u32,
        hotspot_y: u32,
        data: &[u8],
    ) -> PeerResult<()> {
        debug_assert_eq!(data.len(), (width * height * 4) as usize);

        if width > MAX_CURSOR_EXTENT || height > MAX_CURSOR_EXTENT {
            debug!("cursor {}x{} too large, sending default", width, height);
            return self.peer.send(OutputPdu::PointerSystem {
                ptr_type: SystemPointerType::Default,
            });
        }

        if is_fully_transparent(data) {
            return self.handle_cursor_hidden();
        }

        let key = CacheKey {
            hotspot_x,
            hotspot_y,
            width,
            height,
            digest: Sha256::digest(data).into(),
        };

        self.use_counter += 1;
        let use_counter = self.use_counter;

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.last_used = use_counter;
            trace!("cursor cache hit, index {}", entry.cache_index);
            return self.peer.send(OutputPdu::PointerCached {
                cache_index: entry.cache_index,
            });
        }

        let cache_index = self.allocate_cache_index();
        self.entries.insert(
            key,
            CacheEntry {
                cache_index,
                last_used: use_counter,
            },
        );

        let xor_mask = encode_xor_mask(width, height, data);
        let pdu = if width <= MAX_POINTER_NEW_EXTENT && height <= MAX_POINTER_NEW_EXTENT {
            OutputPdu::PointerNew {
                cache_index,
                hotspot_x: hotspot_x as u16,
                hotspot_y: hotspot_y as u16,
                width: width as u16,
                height: height as u16,
                xor_bpp: 32,
                xor_mask,
                and_mask: Bytes::new(),
            }
        } else {
            OutputPdu::PointerLarge {
                cache_index,
                hotspot_x: hotspot_x as u16,
                hotspot_y: hotspot_y as u16,
                width: width as u16,
                height: height as u16,
                xor_bpp: 32,
                xor_mask,
                and_mask: Bytes::new(),
            }
        };

        self.peer.send(pdu)?;
        self.peer.send(OutputPdu::PointerCached { cache_index })
    }

    /// Number of cached bitmaps.
    pub fn cached_count(&self) -> usize {
        self.entries.len()
    }

    /// Free slot index, evicting the least recently used entry when the
    /// cache is full.
    fn allocate_cache_index(&mut self) -> u16 {
        if self.entries.len() < self.capacity {
            let used: Vec<u16> = self.entries.values().map(|e| e.cache_index).collect();
            for index in 0..self.capacity as u16 {
                if !used.contains(&index) {
                    return index;
                }
            }
        }

        let lru_key = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| *key)
            .expect("cache capacity is at least one");
        let entry = self.entries.remove(&lru_key).expect("entry exists");
        trace!("evicting cursor cache index {}", entry.cache_index);
        entry.cache_index
    }
}

/// All alpha bytes zero means the cursor is invisible.
fn is_fully_transparent(bgra: &[u8]) -> bool {
    bgra.chunks_exact(4).all(|pixel| pixel[3] == 0)
}

/// 32-bit XOR mask in bottom-up scanline order.
fn encode_xor_mask(width: u32, height: u32, bgra: &[u8]) -> Bytes {
    let row_bytes = (width * 4) as usize;
    let mut out = BytesMut::with_capacity(bgra.len());
    for row in (0..height as usize).rev() {
        out.put_slice(&bgra[row * row_bytes..(row + 1) * row_bytes]);
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingPeer;

    fn cursor_data(width: u32, height: u32, alpha: u8) -> Vec<u8> {
        let mut data = vec![0x40u8; (width * height * 4) as usize];
        for pixel in data.chunks_exact_mut(4) {
            pixel[3] = alpha;
        }
        data
    }

    #[test]
    fn test_oversized_cursor_sends_default() {
        let peer = Arc::new(RecordingPeer::default());
        let mut renderer = CursorRenderer::new(peer.clone(), 25);

        renderer
            .handle_cursor_shape(400, 32, 0, 0, &cursor_data(400, 32, 0xFF))
            .unwrap();

        assert_eq!(
            peer.sent(),
            vec![OutputPdu::PointerSystem {
                ptr_type: SystemPointerType::Default
            }]
        );
        assert_eq!(renderer.cached_count(), 0);
    }

    #[test]
    fn test_transparent_cursor_sends_null() {
        let peer = Arc::new(RecordingPeer::default());
        let mut renderer = CursorRenderer::new(peer.clone(), 25);

        renderer
            .handle_cursor_shape(32, 32, 0, 0, &cursor_data(32, 32, 0))
            .unwrap();

        assert_eq!(
            peer.sent(),
            vec![OutputPdu::PointerSystem {
                ptr_type: SystemPointerType::Null
            }]
        );
    }

    #[test]
    fn test_small_cursor_pointer_new_then_cached() {
        let peer = Arc::new(RecordingPeer::default());
        let mut renderer = CursorRenderer::new(peer.clone(), 25);

        renderer
            .handle_cursor_shape(32, 32, 3, 5, &cursor_data(32, 32, 0xFF))
            .unwrap();

        let sent = peer.sent();
        assert_eq!(sent.len(), 2);
        match &sent[0] {
            OutputPdu::PointerNew {
                cache_index,
                hotspot_x,
                hotspot_y,
                width,
                height,
                xor_bpp,
                xor_mask,
                and_mask,
            } => {
                assert_eq!(*cache_index, 0);
                assert_eq!((*hotspot_x, *hotspot_y), (3, 5));
                assert_eq!((*width, *height), (32, 32));
                assert_eq!(*xor_bpp, 32);
                assert_eq!(xor_mask.len(), 32 * 32 * 4);
                assert!(and_mask.is_empty());
            }
            other => panic!("expected PointerNew, got {other:?}"),
        }
        assert_eq!(sent[1], OutputPdu::PointerCached { cache_index: 0 });
    }

    #[test]
    fn test_large_cursor_pointer_large() {
        let peer = Arc::new(RecordingPeer::default());
        let mut renderer = CursorRenderer::new(peer.clone(), 25);

        renderer
            .handle_cursor_shape(150, 150, 4, 4, &cursor_data(150, 150, 0xFF))
            .unwrap();

        let sent = peer.sent();
        match &sent[0] {
            OutputPdu::PointerLarge {
                cache_index,
                width,
                height,
                hotspot_x,
                hotspot_y,
                xor_bpp,
                xor_mask,
                and_mask,
            } => {
                assert_eq!(*cache_index, 0);
                assert_eq!((*width, *height), (150, 150));
                assert_eq!((*hotspot_x, *hotspot_y), (4, 4));
                assert_eq!(*xor_bpp, 32);
                assert_eq!(xor_mask.len(), 150 * 150 * 4);
                assert!(and_mask.is_empty());
            }
            other => panic!("expected PointerLarge, got {other:?}"),
        }
        assert_eq!(sent[1], OutputPdu::PointerCached { cache_index: 0 });
    }

    #[test]
    fn test_repeated_bitmap_uploads_once() {
        let peer = Arc::new(RecordingPeer::default());
        let mut renderer = CursorRenderer::new(peer.clone(), 25);
        let data = cursor_data(32, 32, 0xFF);

        renderer.handle_cursor_shape(32, 32, 0, 0, &data).unwrap();
        renderer.handle_cursor_shape(32, 32, 0, 0, &data).unwrap();
        renderer.handle_cursor_shape(32, 32, 0, 0, &data).unwrap();

        let sent = peer.sent();
        let uploads = sent
            .iter()
            .filter(|pdu| matches!(pdu, OutputPdu::PointerNew { .. }))
            .count();
        assert_eq!(uploads, 1);
        // Upload + cached, then cached only for the repeats.
        assert_eq!(sent.len(), 4);
        assert_eq!(renderer.cached_count(), 1);
    }

    #[test]
    fn test_hotspot_is_part_of_identity() {
        let peer = Arc::new(RecordingPeer::default());
        let mut renderer = CursorRenderer::new(peer.clone(), 25);
        let data = cursor_data(32, 32, 0xFF);

        renderer.handle_cursor_shape(32, 32, 0, 0, &data).unwrap();
        renderer.handle_cursor_shape(32, 32, 1, 0, &data).unwrap();

        assert_eq!(renderer.cached_count(), 2);
    }

    #[test]
    fn test_lru_eviction() {
        let peer = Arc::new(RecordingPeer::default());
        let mut renderer = CursorRenderer::new(peer.clone(), 2);

        let a = cursor_data(32, 32, 0xFF);
        let mut b = cursor_data(32, 32, 0xFF);
        b[0] = 1;
        let mut c = cursor_data(32, 32, 0xFF);
        c[0] = 2;

        renderer.handle_cursor_shape(32, 32, 0, 0, &a).unwrap(); // index 0
        renderer.handle_cursor_shape(32, 32, 0, 0, &b).unwrap(); // index 1
        renderer.handle_cursor_shape(32, 32, 0, 0, &a).unwrap(); // refresh a
        renderer.handle_cursor_shape(32, 32, 0, 0, &c).unwrap(); // evicts b

        assert_eq!(renderer.cached_count(), 2);
        // b was least recently used, so c reuses its index.
        let sent = peer.sent();
        let last_upload = sent
            .iter()
            .rev()
            .find_map(|pdu| match pdu {
                OutputPdu::PointerNew { cache_index, .. } => Some(*cache_index),
                _ => None,
            })
            .unwrap();
        assert_eq!(last_upload, 1);
    }

    #[test]
    fn test_xor_mask_bottom_up() {
        let mut data = vec![0u8; 2 * 2 * 4];
        data[0..4].copy_from_slice(&[1, 1, 1, 1]); // top-left pixel
        data[8..12].copy_from_slice(&[2, 2, 2, 2]); // bottom-left pixel

        let mask = encode_xor_mask(2, 2, &data);
        // Bottom row first.
        assert_eq!(&mask[0..4], &[2, 2, 2, 2]);
        assert_eq!(&mask[8..12], &[1, 1, 1, 1]);
    }
}
