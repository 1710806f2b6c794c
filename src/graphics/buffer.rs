//! Frame Buffers
//!
//! [`RdpBuffer`] is one captured frame rented from a bounded per-surface
//! pool. The pool caps the number of frames in flight between capture
//! and encode; a buffer returns its backing storage on drop.

use std::sync::Arc;

use parking_lot::Mutex;

/// Default number of framebuffer slots per surface.
pub const DEFAULT_POOL_SIZE: usize = 4;

struct PoolShared {
    /// Recycled backing stores, capped at `capacity`.
    free: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
}

/// Bounded pool of frame backing stores for one surface.
#[derive(Clone)]
pub struct FramebufferPool {
    shared: Arc<PoolShared>,
}

impl FramebufferPool {
    /// Create a pool with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        FramebufferPool {
            shared: Arc::new(PoolShared {
                free: Mutex::new(Vec::with_capacity(capacity)),
                capacity,
            }),
        }
    }

    /// Rent a buffer for a frame of the given geometry. Returns `None`
    /// when all slots are in flight.
    pub fn acquire(&self, width: u32, height: u32, stride: u32) -> Option<RdpBuffer> {
        let len = stride as usize * height as usize;
        let mut free = self.shared.free.lock();
        if free.is_empty() && Arc::weak_count(&self.shared) >= self.shared.capacity {
            return None;
        }
        let mut storage = free.pop().unwrap_or_default();
        storage.clear();
        storage.resize(len, 0);

        Some(RdpBuffer {
            width,
            height,
            stride,
            data: storage,
            pool: Arc::downgrade(&self.shared),
        })
    }

    /// Number of buffers currently rented out.
    pub fn in_flight(&self) -> usize {
        // Weak count tracks live buffers; each RdpBuffer holds one.
        Arc::weak_count(&self.shared)
    }

    /// Pool capacity.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

/// One captured frame. Pixel data is tightly described by
/// `width`/`height`/`stride` (BGRA, 4 bytes per pixel).
pub struct RdpBuffer {
    width: u32,
    height: u32,
    stride: u32,
    data: Vec<u8>,
    pool: std::sync::Weak<PoolShared>,
}

impl RdpBuffer {
    /// Standalone buffer not tied to a pool (tests, synthetic frames).
    pub fn standalone(width: u32, height: u32, stride: u32, data: Vec<u8>) -> Self {
        debug_assert!(data.len() >= stride as usize * height as usize);
        RdpBuffer {
            width,
            height,
            stride,
            data,
            pool: std::sync::Weak::new(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row stride in bytes.
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Full backing pixel data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable pixel data (capture fills the frame through this).
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// One row of pixels.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        &self.data[start..start + self.width as usize * 4]
    }
}

impl Drop for RdpBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            let mut free = pool.free.lock();
            if free.len() < pool.capacity {
                free.push(std::mem::take(&mut self.data));
            }
        }
    }
}

impl std::fmt::Debug for RdpBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdpBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .finish()
    }
}
