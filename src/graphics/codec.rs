//! Codec Collaborator Interfaces
//!
//! The session orchestrates encoders, it does not implement their
//! transforms. The DWT/RLGR kernels of RemoteFX, the progressive
//! variant used on the graphics pipeline, and the NSCodec subsampling
//! kernels all live behind [`FrameCodec`]; the embedding host supplies
//! a [`CodecFactory`] at session construction.
//!
//! NSCodec contexts are not reentrant across a reset, so the factory is
//! asked for a fresh context per damaged rect on the NSC path.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::graphics::buffer::RdpBuffer;
use crate::graphics::damage::DamageRegion;

/// Codec collaborator errors.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// The codec context could not be allocated.
    #[error("codec allocation failed: {0}")]
    AllocationFailed(String),

    /// The codec rejected the frame.
    #[error("encode failed: {0}")]
    EncodeFailed(String),
}

/// Result alias for codec operations.
pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Default RemoteFX quantization values (ten sub-bands, LL3 first).
pub const RFX_DEFAULT_QUANTIZATION: [u8; 10] = [6, 6, 6, 6, 7, 7, 8, 8, 8, 9];

/// NSCodec color loss level used for sub-sampled chroma.
pub const NSC_COLOR_LOSS_LEVEL: u8 = 3;

/// A read-only view over a captured frame, the unit keyed by the
/// encode-session pending queue.
#[derive(Clone)]
pub struct ImageView {
    id: u64,
    buffer: Arc<RdpBuffer>,
}

impl ImageView {
    /// Wrap a captured frame. `id` must be unique per surface while the
    /// view is pending.
    pub fn new(id: u64, buffer: Arc<RdpBuffer>) -> Self {
        ImageView { id, buffer }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn buffer(&self) -> &RdpBuffer {
        &self.buffer
    }

    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }
}

impl std::fmt::Debug for ImageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageView")
            .field("id", &self.id)
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

/// One codec context bound to a surface geometry.
pub trait FrameCodec: Send + 'static {
    /// Compress the damaged regions of a view into one opaque codec
    /// bitstream (the payload of a surface-bits or wire-to-surface
    /// command).
    fn encode_regions(&mut self, view: &ImageView, regions: &[DamageRegion])
        -> CodecResult<Bytes>;

    /// Reset codec state (after a graphics reset or surface resize).
    fn reset(&mut self, width: u32, height: u32) -> CodecResult<()>;
}

/// Source of codec contexts, supplied by the embedding host.
pub trait CodecFactory: Send + Sync + 'static {
    /// RemoteFX context for the legacy surface-command path.
    fn create_rfx(&self, width: u32, height: u32) -> CodecResult<Box<dyn FrameCodec>>;

    /// RemoteFX progressive context for the graphics pipeline.
    fn create_progressive(&self, width: u32, height: u32) -> CodecResult<Box<dyn FrameCodec>>;

    /// Fresh NSCodec context. Called once per damaged rect.
    fn create_nsc(&self, width: u32, height: u32) -> CodecResult<Box<dyn FrameCodec>>;

    /// Optional hardware encoder for the graphics pipeline; `None` when
    /// the host has no suitable device.
    fn create_hardware(&self, width: u32, height: u32) -> Option<Box<dyn FrameCodec>> {
        let _ = (width, height);
        None
    }
}
