//! Graphics Pipeline Bridge
//!
//! Drives the RDPGFX dynamic virtual channel: one ResetGraphics per
//! pending reset, CreateSurface/DeleteSurface tracking the render
//! surfaces, and per-frame wire-to-surface submission bracketed by
//! StartFrame/EndFrame. Frame ids are monotonically increasing per
//! peer; client acknowledgements drive the backlog accounting, and
//! round-trip-time updates from network autodetection adjust the
//! admission window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::graphics::codec::{CodecError, CodecFactory, CodecResult, ImageView};
use crate::graphics::damage::DamageRegion;
use crate::graphics::encode::{EncodeError, EncodeSession};
use crate::peer::pdu::{DestRect, GfxCodec, GfxServerPdu, MonitorRect};
use crate::peer::{OutputPdu, RdpPeer};

/// Admission window bounds (frames in flight without an ack).
const MIN_FRAMES_IN_FLIGHT: u32 = 1;
const MAX_FRAMES_IN_FLIGHT: u32 = 5;

/// Nominal output frame interval used to scale the admission window.
const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// One GFX surface backed by a progressive (or hardware) encode
/// session.
struct GfxSurface {
    width: u32,
    height: u32,
    encode: EncodeSession,
    next_view_id: u64,
}

/// The graphics-pipeline bridge.
pub struct GfxPipeline {
    peer: Arc<dyn RdpPeer>,
    factory: Arc<dyn CodecFactory>,

    surfaces: HashMap<u16, GfxSurface>,
    next_surface_id: u16,

    next_frame_id: u32,
    frames_in_flight: u32,
    max_frames_in_flight: u32,
    /// Frames dropped because the admission window was full.
    skipped_frames: u64,
}

impl GfxPipeline {
    pub fn new(peer: Arc<dyn RdpPeer>, factory: Arc<dyn CodecFactory>) -> Self {
        GfxPipeline {
            peer,
            factory,
            surfaces: HashMap::new(),
            next_surface_id: 0,
            next_frame_id: 0,
            frames_in_flight: 0,
            max_frames_in_flight: 2,
            skipped_frames: 0,
        }
    }

    /// Emit ResetGraphics for a new desktop layout. Called once per
    /// pending graphics reset.
    pub fn reset_graphics(
        &mut self,
        width: u32,
        height: u32,
        monitors: Vec<MonitorRect>,
    ) -> crate::peer::PeerResult<()> {
        debug!("gfx reset: {}x{}, {} monitors", width, height, monitors.len());
        self.peer.send(OutputPdu::Gfx(GfxServerPdu::ResetGraphics {
            width,
            height,
            monitors,
        }))
    }

    /// Create a GFX surface with its encode session. Prefers a hardware
    /// encoder when the host offers one.
    pub fn create_surface(
        &mut self,
        width: u32,
        height: u32,
        origin_x: u32,
        origin_y: u32,
    ) -> CodecResult<u16> {
        let codec = match self.factory.create_hardware(width, height) {
            Some(codec) => codec,
            None => self.factory.create_progressive(width, height)?,
        };

        let surface_id = self.next_surface_id;
        self.next_surface_id = self.next_surface_id.wrapping_add(1);

        self.peer
            .send(OutputPdu::Gfx(GfxServerPdu::CreateSurface {
                surface_id,
                width: width as u16,
                height: height as u16,
            }))
            .map_err(|e| CodecError::AllocationFailed(e.to_string()))?;
        self.peer
            .send(OutputPdu::Gfx(GfxServerPdu::MapSurfaceToOutput {
                surface_id,
                origin_x,
                origin_y,
            }))
            .map_err(|e| CodecError::AllocationFailed(e.to_string()))?;

        self.surfaces.insert(
            surface_id,
            GfxSurface {
                width,
                height,
                encode: EncodeSession::new(codec, surface_id as u32),
                next_view_id: 0,
            },
        );

        debug!("created gfx surface {} ({}x{})", surface_id, width, height);
        Ok(surface_id)
    }

    /// Delete a GFX surface and stop its encode session.
    pub fn delete_surface(&mut self, surface_id: u16) {
        if self.surfaces.remove(&surface_id).is_some() {
            debug!("deleting gfx surface {}", surface_id);
            let _ = self.peer.send(OutputPdu::Gfx(GfxServerPdu::DeleteSurface {
                surface_id,
            }));
        }
    }

    /// Encode and submit one frame for a surface. Returns `Ok(false)`
    /// when the admission window is full and the frame was skipped.
    pub fn submit_frame(
        &mut self,
        surface_id: u16,
        frame: Arc<crate::graphics::buffer::RdpBuffer>,
        damage: Vec<DamageRegion>,
    ) -> std::result::Result<bool, EncodeError> {
        if self.frames_in_flight >= self.max_frames_in_flight {
            self.skipped_frames += 1;
            trace!(
                "gfx backlog full ({} in flight), skipping frame",
                self.frames_in_flight
            );
            return Ok(false);
        }

        let surface = self
            .surfaces
            .get_mut(&surface_id)
            .ok_or(EncodeError::Stopped)?;

        let view_id = surface.next_view_id;
        surface.next_view_id = surface.next_view_id.wrapping_add(1);
        let view = ImageView::new(view_id, frame);

        surface.encode.encode_frame(view, damage.clone())?;
        let bitstream = surface.encode.lock_bitstream(view_id)?;

        let frame_id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);

        let dest_rect = bounding_rect(&damage, surface.width, surface.height);
        let sent = self
            .peer
            .send(OutputPdu::Gfx(GfxServerPdu::StartFrame { frame_id }))
            .and_then(|_| {
                self.peer.send(OutputPdu::Gfx(GfxServerPdu::WireToSurface {
                    surface_id,
                    codec: GfxCodec::Progressive,
                    dest_rect,
                    data: bitstream.data().clone(),
                }))
            })
            .and_then(|_| self.peer.send(OutputPdu::Gfx(GfxServerPdu::EndFrame { frame_id })));

        surface.encode.unlock_bitstream(bitstream);

        match sent {
            Ok(()) => {
                self.frames_in_flight += 1;
                Ok(true)
            }
            Err(e) => {
                warn!("gfx frame submission failed: {e}");
                Ok(false)
            }
        }
    }

    /// Client acknowledged a frame.
    pub fn frame_acknowledged(&mut self, frame_id: u32, queue_depth: u32) {
        trace!("gfx frame {} acked (queue depth {})", frame_id, queue_depth);
        self.frames_in_flight = self.frames_in_flight.saturating_sub(1);
    }

    /// Adjust the admission window from a round-trip-time measurement.
    pub fn update_round_trip_time(&mut self, rtt: Duration) {
        let intervals = rtt.as_millis() / FRAME_INTERVAL.as_millis().max(1);
        self.max_frames_in_flight =
            (intervals as u32 + 1).clamp(MIN_FRAMES_IN_FLIGHT, MAX_FRAMES_IN_FLIGHT);
        trace!(
            "gfx admission window now {} frames (rtt {:?})",
            self.max_frames_in_flight,
            rtt
        );
    }

    /// Number of frames skipped on a full admission window.
    pub fn skipped_frames(&self) -> u64 {
        self.skipped_frames
    }

    /// Surface ids currently alive.
    pub fn surface_ids(&self) -> Vec<u16> {
        self.surfaces.keys().copied().collect()
    }

    /// Delete every surface (layout change or teardown).
    pub fn clear_surfaces(&mut self) {
        for surface_id in self.surface_ids() {
            self.delete_surface(surface_id);
        }
    }
}

/// Exclusive bounding rectangle of the damage, clamped to the surface.
fn bounding_rect(damage: &[DamageRegion], width: u32, height: u32) -> DestRect {
    if damage.is_empty() {
        return DestRect {
            left: 0,
            top: 0,
            right: width as i32,
            bottom: height as i32,
        };
    }

    let mut left = u32::MAX;
    let mut top = u32::MAX;
    let mut right = 0u32;
    let mut bottom = 0u32;
    for region in damage {
        left = left.min(region.x);
        top = top.min(region.y);
        right = right.max(region.x + region.width);
        bottom = bottom.max(region.y + region.height);
    }

    DestRect {
        left: left as i32,
        top: top as i32,
        right: right.min(width) as i32,
        bottom: bottom.min(height) as i32,
    }
}
