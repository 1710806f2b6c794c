//! Structured PDU Contract
//!
//! Typed representations of every PDU the session exchanges with the
//! peer library. The wire encoding lives in the peer library; this
//! module only fixes the fields the session logic depends on.
//!
//! Ingress PDUs arrive wrapped in [`super::PeerEvent`]; egress PDUs are
//! submitted through [`super::RdpPeer::send`] as [`OutputPdu`].

use bytes::Bytes;

// =============================================================================
// Geometry
// =============================================================================

/// Inclusive monitor rectangle as carried in ResetGraphics monitor
/// definitions (`right`/`bottom` are the last covered pixel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorRect {
    /// Left edge in desktop coordinates.
    pub left: i32,
    /// Top edge in desktop coordinates.
    pub top: i32,
    /// Right edge (inclusive).
    pub right: i32,
    /// Bottom edge (inclusive).
    pub bottom: i32,
    /// Nonzero when this monitor is the primary.
    pub is_primary: bool,
}

/// Exclusive destination rectangle for surface-bits commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl DestRect {
    /// Width of the rectangle in pixels.
    pub fn width(&self) -> u32 {
        (self.right - self.left).max(0) as u32
    }

    /// Height of the rectangle in pixels.
    pub fn height(&self) -> u32 {
        (self.bottom - self.top).max(0) as u32
    }
}

// =============================================================================
// Client capabilities
// =============================================================================

/// Client OS family, from the core data block. Only used to gate audio
/// playback on peers that cannot keep the channel fed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OsMajorType {
    #[default]
    Unspecified,
    Windows,
    Unix,
    Macintosh,
    Ios,
    Android,
    ChromeOs,
}

/// One monitor from the TS_UD_CS_MONITOR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientMonitor {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub is_primary: bool,
    /// Physical size and orientation; only valid when the client sent
    /// monitor attributes.
    pub physical_width: u32,
    pub physical_height: u32,
    pub orientation: u32,
    pub scale: u32,
}

/// Negotiated client capability set, delivered once per connect by the
/// peer library's capabilities callback.
#[derive(Debug, Clone, Default)]
pub struct ClientCapabilities {
    /// Desktop size from the core data block.
    pub desktop_width: u32,
    pub desktop_height: u32,

    /// Requested color depth in bits per pixel.
    pub color_depth: u32,

    /// Physical size, orientation and scale from the core data block.
    pub physical_width: u32,
    pub physical_height: u32,
    pub orientation: u32,
    pub scale: u32,

    /// Client advertised the Graphics Pipeline Extension.
    pub supports_graphics_pipeline: bool,
    /// Client offered the RemoteFX codec.
    pub supports_rfx: bool,
    /// Client offered NSCodec.
    pub supports_nsc: bool,
    /// Client opted into surface frame acknowledgement.
    pub supports_frame_acks: bool,
    /// DesktopResize capability flag.
    pub supports_desktop_resize: bool,

    /// Negotiated pointer cache size (color pointer cache when present,
    /// otherwise the legacy pointer cache).
    pub pointer_cache_size: u32,

    /// Fragmentation budget from the multifragment-update capability.
    pub multifrag_max_request_size: u32,

    /// TS_UD_CS_MONITOR block, empty when the client sent none.
    pub monitors: Vec<ClientMonitor>,
    /// Whether the monitor block carried attribute data.
    pub has_monitor_attributes: bool,

    /// Client OS family.
    pub os_major_type: OsMajorType,
    /// Client supports network autodetection.
    pub network_autodetect: bool,
}

/// DRDYNVC multiplexer state as reported by the peer library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrdynvcState {
    None,
    Initialized,
    Ready,
    Failed,
}

// =============================================================================
// Input PDUs (client → server)
// =============================================================================

/// Pointer event flags ([MS-RDPBCGR] 2.2.8.1.1.3.1.1.3).
pub mod pointer_flags {
    pub const PTR_FLAGS_HWHEEL: u16 = 0x0400;
    pub const PTR_FLAGS_WHEEL: u16 = 0x0200;
    pub const PTR_FLAGS_WHEEL_NEGATIVE: u16 = 0x0100;
    pub const WHEEL_ROTATION_MASK: u16 = 0x01FF;
    pub const PTR_FLAGS_MOVE: u16 = 0x0800;
    pub const PTR_FLAGS_DOWN: u16 = 0x8000;
    pub const PTR_FLAGS_BUTTON1: u16 = 0x1000;
    pub const PTR_FLAGS_BUTTON2: u16 = 0x2000;
    pub const PTR_FLAGS_BUTTON3: u16 = 0x4000;
    pub const PTR_XFLAGS_BUTTON1: u16 = 0x0001;
    pub const PTR_XFLAGS_BUTTON2: u16 = 0x0002;
}

/// Touch contact flags from RDPEI touch frames.
pub mod contact_flags {
    pub const CONTACT_FLAG_DOWN: u32 = 0x0001;
    pub const CONTACT_FLAG_UPDATE: u32 = 0x0002;
    pub const CONTACT_FLAG_UP: u32 = 0x0004;
    pub const CONTACT_FLAG_INRANGE: u32 = 0x0008;
    pub const CONTACT_FLAG_INCONTACT: u32 = 0x0010;
    pub const CONTACT_FLAG_CANCELED: u32 = 0x0020;
}

/// One touch contact inside an RDPEI touch frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchContact {
    /// Contact id assigned by the client, 0..=255.
    pub contact_id: u8,
    /// Absolute position in client desktop coordinates.
    pub x: i32,
    pub y: i32,
    /// Combination of `contact_flags` values.
    pub flags: u32,
}

/// One RDPEI touch frame (a batch of contact mutations).
#[derive(Debug, Clone, Default)]
pub struct TouchFrame {
    pub contacts: Vec<TouchContact>,
}

// =============================================================================
// CLIPRDR PDUs
// =============================================================================

/// A clipboard format as announced in a format list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardFormat {
    /// Format id (CF_* or a client-assigned id for named formats).
    pub format_id: u32,
    /// Format name for ids above the predefined range.
    pub format_name: Option<String>,
}

/// File-contents request operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileContentsOp {
    /// FILECONTENTS_SIZE: the 8-byte file size.
    Size,
    /// FILECONTENTS_RANGE: a byte range of the file.
    Range,
}

/// FileContentsRequest fields shared by both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileContentsRequestPdu {
    pub stream_id: u32,
    pub list_index: u32,
    pub op: FileContentsOp,
    pub position: u64,
    pub requested_size: u32,
    pub clip_data_id: Option<u32>,
}

/// CLIPRDR PDUs received from the client.
#[derive(Debug, Clone)]
pub enum CliprdrClientPdu {
    /// Client capability set.
    Capabilities {
        can_lock_clip_data: bool,
        supports_file_transfer: bool,
        supports_long_format_names: bool,
    },
    /// The client announced its clipboard formats.
    FormatList(Vec<ClipboardFormat>),
    /// Response to a server format list.
    FormatListResponse { ok: bool },
    /// The client wants server clipboard data.
    FormatDataRequest { format_id: u32 },
    /// The client answered a server format-data request.
    FormatDataResponse { ok: bool, data: Bytes },
    /// Lock a clipboard snapshot for deferred file transfer.
    LockClipboardData { clip_data_id: u32 },
    /// Release a previously locked snapshot.
    UnlockClipboardData { clip_data_id: u32 },
    /// The client wants server file data (server → client copy).
    FileContentsRequest(FileContentsRequestPdu),
    /// The client answered a server file-contents request.
    FileContentsResponse {
        stream_id: u32,
        ok: bool,
        data: Bytes,
    },
}

/// CLIPRDR PDUs submitted to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum CliprdrServerPdu {
    Capabilities {
        can_lock_clip_data: bool,
        supports_file_transfer: bool,
    },
    MonitorReady,
    FormatList(Vec<ClipboardFormat>),
    FormatListResponse {
        ok: bool,
    },
    FormatDataRequest {
        format_id: u32,
    },
    FormatDataResponse {
        ok: bool,
        data: Bytes,
    },
    FileContentsRequest(FileContentsRequestPdu),
    FileContentsResponse {
        stream_id: u32,
        ok: bool,
        data: Bytes,
    },
}

// =============================================================================
// Display control (DISP) PDUs
// =============================================================================

/// One monitor from a DISPLAYCONTROL_MONITOR_LAYOUT PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispMonitorLayout {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
    pub is_primary: bool,
    pub physical_width: u32,
    pub physical_height: u32,
    pub orientation: u32,
    pub scale: u32,
}

/// DISP monitor-layout PDU from the client.
#[derive(Debug, Clone, Default)]
pub struct MonitorLayoutPdu {
    pub monitors: Vec<DispMonitorLayout>,
}

// =============================================================================
// Audio playback (RDPSND) PDUs
// =============================================================================

/// Audio codecs negotiated over RDPSND/AUDIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Aac,
    Opus,
    Pcm,
    Alaw,
}

/// An audio format entry in a client or server format list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub codec: AudioCodec,
    pub n_channels: u16,
    pub samples_per_sec: u32,
    pub bits_per_sample: u16,
    /// Codec frame size in bytes; 0 for PCM-family codecs.
    pub block_align: u16,
}

/// RDPSND PDUs from the client.
#[derive(Debug, Clone)]
pub enum RdpsndClientPdu {
    /// Client audio formats and protocol version.
    Formats {
        version: u16,
        formats: Vec<AudioFormat>,
    },
    /// Quality mode selection (v8+).
    QualityMode { mode: u16 },
    /// Training confirm after the server training PDU.
    TrainingConfirm { timestamp: u16, pack_size: u16 },
    /// Wave confirm acknowledging a submitted block.
    WaveConfirm { timestamp: u16, block_no: u8 },
}

/// RDPSND PDUs to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum RdpsndServerPdu {
    /// Server version and offered formats.
    Formats {
        version: u16,
        formats: Vec<AudioFormat>,
    },
    Training {
        timestamp: u16,
        pack_size: u16,
    },
    /// One encoded audio block (WaveInfo + Wave, or Wave2).
    Wave {
        timestamp: u16,
        format_no: u16,
        block_no: u8,
        data: Bytes,
    },
    Close,
}

// =============================================================================
// Audio input (AUDIN) PDUs
// =============================================================================

/// AUDIN PDUs from the client.
#[derive(Debug, Clone)]
pub enum AudinClientPdu {
    Version { version: u32 },
    /// Client format list (response to the server's offer).
    Formats { formats: Vec<AudioFormat> },
    /// Open reply with the result code.
    OpenReply { result: u32 },
    /// Incoming data header carrying the payload size.
    IncomingData { data_size: u32 },
    /// Audio payload in the negotiated format.
    Data { data: Bytes },
    /// The client switched to another offered format.
    FormatChange { new_format: u32 },
}

/// AUDIN PDUs to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum AudinServerPdu {
    Version { version: u32 },
    Formats { formats: Vec<AudioFormat> },
    /// Open with the chosen format index.
    Open { initial_format: u32 },
}

// =============================================================================
// Graphics pipeline (RDPGFX) PDUs
// =============================================================================

/// GFX codecs carried in wire-to-surface commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GfxCodec {
    /// RemoteFX progressive.
    Progressive,
    Uncompressed,
}

/// RDPGFX PDUs to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum GfxServerPdu {
    CapsConfirm {
        version: u32,
    },
    ResetGraphics {
        width: u32,
        height: u32,
        monitors: Vec<MonitorRect>,
    },
    CreateSurface {
        surface_id: u16,
        width: u16,
        height: u16,
    },
    DeleteSurface {
        surface_id: u16,
    },
    MapSurfaceToOutput {
        surface_id: u16,
        origin_x: u32,
        origin_y: u32,
    },
    StartFrame {
        frame_id: u32,
    },
    EndFrame {
        frame_id: u32,
    },
    WireToSurface {
        surface_id: u16,
        codec: GfxCodec,
        dest_rect: DestRect,
        data: Bytes,
    },
}

/// RDPGFX PDUs from the client.
#[derive(Debug, Clone)]
pub enum GfxClientPdu {
    CapsAdvertise { versions: Vec<u32> },
    FrameAcknowledge { frame_id: u32, queue_depth: u32 },
    CacheImportOffer,
}

// =============================================================================
// Server output PDUs (core channel)
// =============================================================================

/// Surface-bits codec selector for the legacy surface command path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceCodec {
    RemoteFx,
    NsCodec,
}

/// Frame marker action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    Begin,
    End,
}

/// System pointer variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemPointerType {
    /// Hide the pointer.
    Null,
    /// Default system pointer.
    Default,
}

/// One compressed tile inside a BitmapUpdate.
#[derive(Debug, Clone, PartialEq)]
pub struct BitmapUpdateRect {
    pub dest_left: u16,
    pub dest_top: u16,
    pub dest_right: u16,
    pub dest_bottom: u16,
    pub width: u16,
    pub height: u16,
    pub bits_per_pixel: u16,
    pub compressed: bool,
    pub data: Bytes,
}

/// Every PDU the session submits through the peer library.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputPdu {
    /// SurfaceFrameMarker bracketing a frame when the client opted into
    /// frame acknowledgement.
    SurfaceFrameMarker { action: FrameAction, frame_id: u32 },
    /// StreamSurfaceBits / SurfaceFrameBits carrying an RFX message.
    StreamSurfaceBits {
        codec: SurfaceCodec,
        dest_rect: DestRect,
        data: Bytes,
    },
    /// SetSurfaceBits carrying one NSC-compressed rect.
    SetSurfaceBits {
        codec: SurfaceCodec,
        dest_rect: DestRect,
        data: Bytes,
    },
    /// Legacy bitmap update carrying as many tiles as fit the budget.
    BitmapUpdate { rects: Vec<BitmapUpdateRect> },

    /// System pointer update (hidden or default).
    PointerSystem { ptr_type: SystemPointerType },
    /// New color pointer, at most 96×96.
    PointerNew {
        cache_index: u16,
        hotspot_x: u16,
        hotspot_y: u16,
        width: u16,
        height: u16,
        xor_bpp: u16,
        xor_mask: Bytes,
        and_mask: Bytes,
    },
    /// Large pointer (up to 384×384).
    PointerLarge {
        cache_index: u16,
        hotspot_x: u16,
        hotspot_y: u16,
        width: u16,
        height: u16,
        xor_bpp: u16,
        xor_mask: Bytes,
        and_mask: Bytes,
    },
    /// Show a previously cached pointer.
    PointerCached { cache_index: u16 },

    /// Graphics-pipeline PDU on the GFX DVC.
    Gfx(GfxServerPdu),
    /// Clipboard PDU on the CLIPRDR channel.
    Cliprdr(CliprdrServerPdu),
    /// Display-control caps on the DISP DVC.
    DisplayControlCaps {
        max_num_monitors: u32,
        max_monitor_area_factor_a: u32,
        max_monitor_area_factor_b: u32,
    },
    /// Audio playback PDU on the RDPSND DVC.
    Rdpsnd(RdpsndServerPdu),
    /// Audio input PDU on the AUDIN DVC.
    Audin(AudinServerPdu),
    /// Telemetry PDU on the telemetry DVC.
    Telemetry { prompt_for_credentials_millis: u64 },
}
