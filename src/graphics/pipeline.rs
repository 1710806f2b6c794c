//! Graphics Submission Pipeline
//!
//! Takes a surface plus a captured frame and produces the PDU sequence
//! for the negotiated codec path, bracketed by frame markers when the
//! client opted into frame acknowledgement.
//!
//! Codec selection, first match wins:
//! 1. Graphics Pipeline negotiated → route via the GFX bridge.
//! 2. RemoteFX offered → bounded `StreamSurfaceBits` messages.
//! 3. NSCodec offered (and fragmentation available) → one worker per
//!    damaged rect, each with a fresh NSC context.
//! 4. Raw bitmaps → 64×64 tiles, planar or interleaved, packed into
//!    BitmapUpdates.

use std::sync::Arc;

use crossbeam_channel::unbounded;
use thiserror::Error;
use tracing::{trace, warn};

use crate::graphics::bitmap::{compress_tile, pack_updates, tile_damage};
use crate::graphics::buffer::RdpBuffer;
use crate::graphics::codec::{CodecError, CodecFactory, ImageView};
use crate::graphics::damage::DamageRegion;
use crate::graphics::encode::{EncodeError, EncodeSession};
use crate::graphics::gfx::GfxPipeline;
use crate::graphics::workers::WorkerPool;
use crate::layout::surface::{Surface, SurfaceBacking};
use crate::peer::pdu::{ClientCapabilities, DestRect, FrameAction, SurfaceCodec};
use crate::peer::{OutputPdu, PeerError, RdpPeer};

/// NSC needs this much fragmentation headroom; below it the codec is
/// disabled in post-connect.
pub const NSC_MIN_MULTIFRAG_SIZE: u32 = 0x3F_0000;

/// Graphics submission errors.
#[derive(Debug, Error)]
pub enum GraphicsError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, GraphicsError>;

/// Render capabilities after the post-connect adjustments.
#[derive(Debug, Clone, Copy)]
pub struct RenderCaps {
    pub use_gfx: bool,
    pub use_rfx: bool,
    pub use_nsc: bool,
    pub frame_acks: bool,
    pub multifrag_max_request_size: u32,
    /// Negotiated output depth (24 is downgraded to 16 by the gate).
    pub color_depth: u32,
}

impl RenderCaps {
    /// Derive render capabilities from the negotiated client set,
    /// applying the post-connect rules: NSC requires the fragmentation
    /// budget, 24-bit output downgrades to 16 due to interleaved-codec
    /// artifacts.
    pub fn from_client(caps: &ClientCapabilities) -> Self {
        let use_nsc =
            caps.supports_nsc && caps.multifrag_max_request_size >= NSC_MIN_MULTIFRAG_SIZE;
        let color_depth = if caps.color_depth == 24 {
            16
        } else {
            caps.color_depth
        };

        RenderCaps {
            use_gfx: caps.supports_graphics_pipeline,
            use_rfx: caps.supports_rfx,
            use_nsc,
            frame_acks: caps.supports_frame_acks,
            multifrag_max_request_size: caps.multifrag_max_request_size,
            color_depth,
        }
    }
}

/// Selected codec path for a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecPath {
    Gfx,
    RemoteFx,
    NsCodec,
    RawBitmap,
}

/// First-match-wins codec selection.
pub fn select_codec(caps: &RenderCaps) -> CodecPath {
    if caps.use_gfx {
        CodecPath::Gfx
    } else if caps.use_rfx {
        CodecPath::RemoteFx
    } else if caps.use_nsc {
        CodecPath::NsCodec
    } else {
        CodecPath::RawBitmap
    }
}

/// The per-session submission pipeline.
pub struct GraphicsPipeline {
    peer: Arc<dyn RdpPeer>,
    factory: Arc<dyn CodecFactory>,
    workers: Arc<WorkerPool>,
    caps: RenderCaps,
    /// Legacy frame-marker ids, monotonic per peer.
    next_frame_id: u32,
}

impl GraphicsPipeline {
    pub fn new(
        peer: Arc<dyn RdpPeer>,
        factory: Arc<dyn CodecFactory>,
        workers: Arc<WorkerPool>,
        caps: RenderCaps,
    ) -> Self {
        GraphicsPipeline {
            peer,
            factory,
            workers,
            caps,
            next_frame_id: 0,
        }
    }

    pub fn caps(&self) -> &RenderCaps {
        &self.caps
    }

    /// Encode and submit one captured frame for a surface.
    ///
    /// Returns `Ok(false)` when nothing was emitted (empty damage, or
    /// the GFX admission window was full).
    pub fn submit_frame(
        &mut self,
        surface: &mut Surface,
        frame: Arc<RdpBuffer>,
        gfx: Option<&mut GfxPipeline>,
    ) -> Result<bool> {
        surface.ensure_frame_geometry(frame.width(), frame.height());
        let damage = surface.damage_mut().detect(&frame);
        if damage.is_empty() {
            trace!("surface {} unchanged, skipping frame", surface.stream_id());
            return Ok(false);
        }

        self.ensure_backing(surface, gfx.is_some())?;

        let submitted = match select_codec(&self.caps) {
            CodecPath::Gfx => {
                let Some(gfx) = gfx else {
                    return Ok(false);
                };
                let Some(SurfaceBacking::Gfx { surface_id }) = surface.backing() else {
                    return Ok(false);
                };
                gfx.submit_frame(*surface_id, frame, damage)?
            }
            CodecPath::RemoteFx => self.submit_rfx(surface, frame, damage)?,
            CodecPath::NsCodec => self.submit_nsc(surface, frame, damage)?,
            CodecPath::RawBitmap => self.submit_raw(surface, frame, damage)?,
        };

        if submitted {
            surface.mark_valid();
        }
        Ok(submitted)
    }

    /// Create the codec backing on first use.
    fn ensure_backing(&mut self, surface: &mut Surface, gfx_available: bool) -> Result<()> {
        if surface.backing().is_some() {
            return Ok(());
        }
        let (width, height) = surface.size();

        let backing = match select_codec(&self.caps) {
            CodecPath::Gfx if gfx_available => {
                // The GFX surface itself is created by the bridge when
                // the layout reaches rendering; here we only tag the
                // surface as GFX-backed if that already happened.
                return Ok(());
            }
            CodecPath::RemoteFx => SurfaceBacking::RemoteFx {
                session: EncodeSession::new(
                    self.factory.create_rfx(width, height)?,
                    surface.stream_id(),
                ),
            },
            _ => SurfaceBacking::PerFrame,
        };
        surface.set_backing(backing);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // RemoteFX path
    // -------------------------------------------------------------------------

    /// Split the damage into groups whose worst-case encoded size fits
    /// the fragmentation budget, one `StreamSurfaceBits` per group.
    fn submit_rfx(
        &mut self,
        surface: &mut Surface,
        frame: Arc<RdpBuffer>,
        damage: Vec<DamageRegion>,
    ) -> Result<bool> {
        let frame_id = self.begin_frame()?;

        let budget = self.caps.multifrag_max_request_size.max(1) as u64;
        let mut groups: Vec<Vec<DamageRegion>> = Vec::new();
        let mut current: Vec<DamageRegion> = Vec::new();
        let mut current_bytes = 0u64;
        for region in damage {
            let worst_case = region.area() * 4;
            if !current.is_empty() && current_bytes + worst_case > budget {
                groups.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current_bytes += worst_case;
            current.push(region);
        }
        if !current.is_empty() {
            groups.push(current);
        }

        for group in groups {
            let dest_rect = group_bounds(&group);
            let view_id = surface.next_view_id();
            let view = ImageView::new(view_id, Arc::clone(&frame));

            let Some(SurfaceBacking::RemoteFx { session }) = surface.backing() else {
                return Ok(false);
            };
            session.encode_frame(view, group)?;
            let bitstream = session.lock_bitstream(view_id)?;
            let result = self.peer.send(OutputPdu::StreamSurfaceBits {
                codec: SurfaceCodec::RemoteFx,
                dest_rect,
                data: bitstream.data().clone(),
            });
            session.unlock_bitstream(bitstream);
            result?;
        }

        self.end_frame(frame_id)?;
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // NSCodec path
    // -------------------------------------------------------------------------

    /// One worker per damaged rect; each creates a fresh NSC context
    /// (the codec is not reentrant across a reset).
    fn submit_nsc(
        &mut self,
        _surface: &mut Surface,
        frame: Arc<RdpBuffer>,
        damage: Vec<DamageRegion>,
    ) -> Result<bool> {
        let frame_id = self.begin_frame()?;

        let (result_tx, result_rx) = unbounded();
        let rect_count = damage.len();

        for region in damage {
            let factory = Arc::clone(&self.factory);
            let frame = Arc::clone(&frame);
            let result_tx = result_tx.clone();
            self.workers.execute(move || {
                let outcome = factory
                    .create_nsc(region.width, region.height)
                    .and_then(|mut codec| {
                        let view = ImageView::new(0, frame);
                        codec.encode_regions(&view, &[region])
                    });
                let _ = result_tx.send((region, outcome));
            });
        }
        drop(result_tx);

        let mut first_error = None;
        for _ in 0..rect_count {
            let Ok((region, outcome)) = result_rx.recv() else {
                break;
            };
            match outcome {
                Ok(data) => {
                    self.peer.send(OutputPdu::SetSurfaceBits {
                        codec: SurfaceCodec::NsCodec,
                        dest_rect: region_rect(&region),
                        data,
                    })?;
                }
                Err(e) => {
                    warn!("nsc worker failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        self.end_frame(frame_id)?;
        if let Some(e) = first_error {
            return Err(GraphicsError::Codec(e));
        }
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Raw bitmap path
    // -------------------------------------------------------------------------

    fn submit_raw(
        &mut self,
        surface: &mut Surface,
        frame: Arc<RdpBuffer>,
        damage: Vec<DamageRegion>,
    ) -> Result<bool> {
        let frame_id = self.begin_frame()?;
        let (width, height) = surface.size();
        let depth = self.caps.color_depth;

        let tiles: Vec<_> = damage
            .iter()
            .flat_map(|region| tile_damage(region, width, height))
            .collect();

        let (result_tx, result_rx) = unbounded();
        for (index, tile) in tiles.iter().copied().enumerate() {
            let frame = Arc::clone(&frame);
            let result_tx = result_tx.clone();
            self.workers.execute(move || {
                let _ = result_tx.send((index, compress_tile(&frame, tile, depth)));
            });
        }
        drop(result_tx);

        let mut rects = vec![None; tiles.len()];
        for _ in 0..tiles.len() {
            let Ok((index, rect)) = result_rx.recv() else {
                break;
            };
            rects[index] = Some(rect);
        }
        let rects: Vec<_> = rects.into_iter().flatten().collect();

        for update in pack_updates(rects, self.caps.multifrag_max_request_size) {
            self.peer.send(OutputPdu::BitmapUpdate { rects: update })?;
        }

        self.end_frame(frame_id)?;
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Frame markers
    // -------------------------------------------------------------------------

    fn begin_frame(&mut self) -> Result<Option<u32>> {
        if !self.caps.frame_acks {
            return Ok(None);
        }
        let frame_id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);
        self.peer.send(OutputPdu::SurfaceFrameMarker {
            action: FrameAction::Begin,
            frame_id,
        })?;
        Ok(Some(frame_id))
    }

    fn end_frame(&mut self, frame_id: Option<u32>) -> Result<()> {
        if let Some(frame_id) = frame_id {
            self.peer.send(OutputPdu::SurfaceFrameMarker {
                action: FrameAction::End,
                frame_id,
            })?;
        }
        Ok(())
    }
}

fn region_rect(region: &DamageRegion) -> DestRect {
    DestRect {
        left: region.x as i32,
        top: region.y as i32,
        right: (region.x + region.width) as i32,
        bottom: (region.y + region.height) as i32,
    }
}

fn group_bounds(regions: &[DamageRegion]) -> DestRect {
    let mut left = u32::MAX;
    let mut top = u32::MAX;
    let mut right = 0u32;
    let mut bottom = 0u32;
    for region in regions {
        left = left.min(region.x);
        top = top.min(region.y);
        right = right.max(region.x + region.width);
        bottom = bottom.max(region.y + region.height);
    }
    DestRect {
        left: left as i32,
        top: top as i32,
        right: right as i32,
        bottom: bottom as i32,
    }
}
