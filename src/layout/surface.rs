//! Render Surfaces
//!
//! One [`Surface`] per monitor of the active layout: it owns the
//! framebuffer pool, the damage detector, the codec backing (a GFX
//! surface id or a legacy encode session), and the capture stream
//! feeding it. Surfaces are created by the layout manager's
//! prepare-surfaces transition and destroyed on layout changes or
//! session shutdown.

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::graphics::buffer::{FramebufferPool, DEFAULT_POOL_SIZE};
use crate::graphics::damage::DamageDetector;
use crate::graphics::encode::EncodeSession;
use crate::host::{CaptureStream, StreamEvent, StreamEventSender};
use crate::layout::monitor_config::VirtualMonitor;

/// What a surface renders: a host connector (mirror mode) or a virtual
/// monitor (extended mode).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceMapping {
    Connector(String),
    Virtual(VirtualMonitor),
}

impl SurfaceMapping {
    /// Monitor dimensions of this mapping, if intrinsically known.
    pub fn size(&self) -> Option<(u32, u32)> {
        match self {
            SurfaceMapping::Connector(_) => None,
            SurfaceMapping::Virtual(monitor) => Some((monitor.width, monitor.height)),
        }
    }
}

/// Codec backing of a surface.
pub enum SurfaceBacking {
    /// Routed through the graphics pipeline.
    Gfx { surface_id: u16 },
    /// Legacy RemoteFX encode session.
    RemoteFx { session: EncodeSession },
    /// NSC or raw bitmaps; contexts are created per frame.
    PerFrame,
}

/// Per-monitor rendering context.
pub struct Surface {
    stream_id: u32,
    mapping: SurfaceMapping,
    /// Output origin in client desktop coordinates.
    origin_x: i32,
    origin_y: i32,
    width: u32,
    height: u32,

    pool: FramebufferPool,
    damage: DamageDetector,
    backing: Option<SurfaceBacking>,

    stream: Option<Box<dyn CaptureStream>>,
    stream_events_tx: Sender<StreamEvent>,
    stream_events: Receiver<StreamEvent>,
    stream_ready: bool,

    /// Set after the first successful encode; reset on layout change.
    valid: bool,
    next_view_id: u64,
}

impl Surface {
    /// Create a surface for a mapping at the given output origin.
    pub fn new(
        stream_id: u32,
        mapping: SurfaceMapping,
        origin_x: i32,
        origin_y: i32,
        width: u32,
        height: u32,
    ) -> Self {
        let (stream_events_tx, stream_events) = unbounded();
        Surface {
            stream_id,
            mapping,
            origin_x,
            origin_y,
            width,
            height,
            pool: FramebufferPool::new(DEFAULT_POOL_SIZE),
            damage: DamageDetector::new(width, height),
            backing: None,
            stream: None,
            stream_events_tx,
            stream_events,
            stream_ready: false,
            valid: false,
            next_view_id: 0,
        }
    }

    /// Sender handed to the host when recording starts.
    pub fn event_sender(&self) -> StreamEventSender {
        self.stream_events_tx.clone()
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn mapping(&self) -> &SurfaceMapping {
        &self.mapping
    }

    pub fn origin(&self) -> (i32, i32) {
        (self.origin_x, self.origin_y)
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Whether the point (desktop coordinates) falls inside this
    /// surface's rectangle.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.origin_x
            && x < self.origin_x + self.width as i32
            && y >= self.origin_y
            && y < self.origin_y + self.height as i32
    }

    /// Retarget this surface to a new mapping/origin, invalidating the
    /// render state. The capture stream is kept for a params update
    /// when only dimensions changed.
    pub fn remap(
        &mut self,
        mapping: SurfaceMapping,
        origin_x: i32,
        origin_y: i32,
        width: u32,
        height: u32,
    ) {
        let resized = self.width != width || self.height != height;
        self.mapping = mapping;
        self.origin_x = origin_x;
        self.origin_y = origin_y;
        self.width = width;
        self.height = height;
        if resized {
            self.damage = DamageDetector::new(width, height);
            self.pool = FramebufferPool::new(DEFAULT_POOL_SIZE);
        } else {
            self.damage.invalidate();
        }
        self.backing = None;
        self.valid = false;
        if resized {
            // The capture re-negotiates and reports ready again.
            self.stream_ready = false;
        }
    }

    /// Adopt the geometry of an incoming frame. Mirror-mode surfaces
    /// learn their size from the first capture; a mismatch rebuilds
    /// the render state.
    pub fn ensure_frame_geometry(&mut self, width: u32, height: u32) {
        if self.width == width && self.height == height {
            return;
        }
        self.width = width;
        self.height = height;
        self.damage = DamageDetector::new(width, height);
        self.pool = FramebufferPool::new(DEFAULT_POOL_SIZE);
        self.backing = None;
        self.valid = false;
    }

    /// Attach the capture stream created for this surface.
    pub fn attach_stream(&mut self, stream: Box<dyn CaptureStream>) {
        self.stream = Some(stream);
        self.stream_ready = false;
    }

    /// Whether a capture stream is attached.
    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    /// The attached capture stream.
    pub fn stream(&self) -> Option<&dyn CaptureStream> {
        self.stream.as_deref()
    }

    /// Drop the capture stream (external close or teardown).
    pub fn detach_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
        self.stream_ready = false;
    }

    /// Receiver of this surface's stream events.
    pub fn stream_events(&self) -> &Receiver<StreamEvent> {
        &self.stream_events
    }

    /// Record that the stream finished negotiation.
    pub fn mark_stream_ready(&mut self) {
        self.stream_ready = true;
    }

    pub fn is_stream_ready(&self) -> bool {
        self.stream_ready
    }

    /// Framebuffer pool for capture.
    pub fn pool(&self) -> &FramebufferPool {
        &self.pool
    }

    /// Damage detector for this surface.
    pub fn damage_mut(&mut self) -> &mut DamageDetector {
        &mut self.damage
    }

    /// Codec backing, set once the render path is chosen.
    pub fn backing(&self) -> Option<&SurfaceBacking> {
        self.backing.as_ref()
    }

    pub fn backing_mut(&mut self) -> Option<&mut SurfaceBacking> {
        self.backing.as_mut()
    }

    pub fn set_backing(&mut self, backing: SurfaceBacking) {
        self.backing = Some(backing);
    }

    /// Allocate the next image-view id for this surface.
    pub fn next_view_id(&mut self) -> u64 {
        let id = self.next_view_id;
        self.next_view_id = self.next_view_id.wrapping_add(1);
        id
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Mark the surface valid after its first successful encode.
    pub fn mark_valid(&mut self) {
        self.valid = true;
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        self.detach_stream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_surface(origin_x: i32, origin_y: i32, width: u32, height: u32) -> Surface {
        Surface::new(
            1,
            SurfaceMapping::Connector("DP-1".into()),
            origin_x,
            origin_y,
            width,
            height,
        )
    }

    #[test]
    fn test_contains_point() {
        let surface = test_surface(1920, 0, 1280, 1024);
        assert!(surface.contains(1920, 0));
        assert!(surface.contains(3199, 1023));
        assert!(!surface.contains(1919, 0));
        assert!(!surface.contains(3200, 0));
    }

    #[test]
    fn test_remap_resets_validity() {
        let mut surface = test_surface(0, 0, 1920, 1080);
        surface.mark_valid();
        surface.set_backing(SurfaceBacking::PerFrame);

        surface.remap(
            SurfaceMapping::Connector("DP-2".into()),
            0,
            0,
            1280,
            1024,
        );
        assert!(!surface.is_valid());
        assert!(surface.backing().is_none());
        assert_eq!(surface.size(), (1280, 1024));
    }

    #[test]
    fn test_view_ids_monotonic() {
        let mut surface = test_surface(0, 0, 640, 480);
        assert_eq!(surface.next_view_id(), 0);
        assert_eq!(surface.next_view_id(), 1);
        assert_eq!(surface.next_view_id(), 2);
    }
}
