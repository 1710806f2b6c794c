//! Peer Library Contract
//!
//! The RDP wire codec is an external collaborator. This module defines
//! the narrow interface the session consumes: an [`RdpPeer`] that owns
//! the transport, dispatches decoded PDUs as typed [`PeerEvent`]s, and
//! accepts structured [`OutputPdu`]s for encoding.
//!
//! The callback style of the underlying library is flattened into a
//! typed event queue: the socket thread blocks on [`RdpPeer::wait_event`]
//! and dispatches on the session. Everything the session needs to know
//! about the client arrives through this funnel, in channel order.

pub mod pdu;

use std::time::Duration;

pub use pdu::{
    contact_flags, pointer_flags, AudinClientPdu, AudinServerPdu, AudioCodec, AudioFormat,
    BitmapUpdateRect, ClientCapabilities, ClientMonitor, ClipboardFormat, CliprdrClientPdu,
    CliprdrServerPdu, DestRect, DispMonitorLayout, DrdynvcState, FileContentsOp,
    FileContentsRequestPdu, FrameAction, GfxClientPdu, GfxCodec, GfxServerPdu, MonitorLayoutPdu,
    MonitorRect, OsMajorType, OutputPdu, RdpsndClientPdu, RdpsndServerPdu, SurfaceCodec,
    SystemPointerType, TouchContact, TouchFrame,
};

use crate::error::ErrorInfo;
use thiserror::Error;

/// Errors reported by the peer library.
#[derive(Debug, Clone, Error)]
pub enum PeerError {
    /// The transport went away.
    #[error("peer transport closed")]
    TransportClosed,

    /// The requested channel is not joined.
    #[error("channel not available: {0}")]
    ChannelUnavailable(&'static str),

    /// The peer library rejected the PDU.
    #[error("peer rejected pdu: {0}")]
    Rejected(String),
}

/// Result alias for peer operations.
pub type PeerResult<T> = std::result::Result<T, PeerError>;

/// Well-known channel names the session opens or joins.
pub mod channels {
    pub const CLIPRDR: &str = "cliprdr";
    pub const DISP: &str = "Microsoft::Windows::RDS::DisplayControl";
    pub const GFX: &str = "Microsoft::Windows::RDS::Graphics";
    pub const AUDIN: &str = "AUDIO_INPUT";
    pub const RDPSND: &str = "AUDIO_PLAYBACK_DVC";
    pub const INPUT: &str = "Microsoft::Windows::RDS::Input";
    pub const TELEMETRY: &str = "Microsoft::Windows::RDS::Telemetry";
}

/// Every event the peer library dispatches into the session. PDU-bearing
/// variants preserve per-channel arrival order; no cross-channel
/// ordering is implied.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Capability negotiation completed; the gate runs now.
    Capabilities(ClientCapabilities),
    /// The connection sequence finished.
    PostConnect,
    /// The client (re)activated the session.
    Activate,
    /// Suppress-output update. `enable_display_updates == false` stops
    /// all rendering until the next allow.
    SuppressOutput { enable_display_updates: bool },
    /// Frame acknowledged by the client (legacy frame marker path).
    FrameAcknowledge { frame_id: u32 },

    /// Synchronize event carrying lock-key states; all pressed keys
    /// must be released.
    Synchronize {
        caps_lock: bool,
        num_lock: bool,
        scroll_lock: bool,
    },
    /// Keyboard scancode event.
    KeyboardScancode {
        code: u16,
        pressed: bool,
        extended: bool,
        extended1: bool,
    },
    /// Keyboard unicode event (UTF-16 code unit).
    KeyboardUnicode { code_unit: u16, pressed: bool },
    /// Pointer event ([MS-RDPBCGR] mouse event).
    Pointer { flags: u16, x: u16, y: u16 },
    /// Extended pointer event (side/extra buttons).
    PointerExtended { flags: u16, x: u16, y: u16 },
    /// RDPEI touch frame.
    Touch(TouchFrame),

    /// CLIPRDR PDU from the client.
    Cliprdr(CliprdrClientPdu),
    /// DISP monitor layout PDU.
    Disp(MonitorLayoutPdu),
    /// RDPSND PDU from the client.
    Rdpsnd(RdpsndClientPdu),
    /// AUDIN PDU from the client.
    Audin(AudinClientPdu),
    /// RDPGFX PDU from the client.
    Gfx(GfxClientPdu),

    /// DVC creation status for a channel id. May arrive before the
    /// subscriber attaches; the registry buffers it.
    DvcCreationStatus { channel_id: u32, status: i32 },
    /// The DRDYNVC multiplexer reached READY.
    DrdynvcReady,

    /// Round-trip-time measurement from network autodetection.
    RttMeasurement { rtt: Duration },

    /// The transport failed or the client disconnected.
    ClientGone,
}

/// The peer library: owns the client transport and the RDP stack.
///
/// One instance per accepted connection, driven from the socket thread.
/// All methods are callable from any thread unless noted; `wait_event`
/// is the socket thread's blocking point.
pub trait RdpPeer: Send + Sync + 'static {
    /// Complete stack initialization after construction.
    fn initialize(&self) -> PeerResult<()>;

    /// Process pending transport data. Returns `false` when the
    /// transport is gone and the session must tear down.
    fn check_file_descriptor(&self) -> bool;

    /// Block until the next peer event, or `None` on timeout.
    fn wait_event(&self, timeout: Duration) -> Option<PeerEvent>;

    /// Submit a structured PDU for encoding and transmission.
    fn send(&self, pdu: OutputPdu) -> PeerResult<()>;

    /// Record the error-info code reported at disconnect. Later calls
    /// overwrite earlier ones only while no close is in flight.
    fn set_error_info(&self, info: ErrorInfo);

    /// Gracefully close the stack (sends the deactivation sequence).
    fn close(&self);

    /// Drop the transport without the deactivation sequence.
    fn disconnect(&self);

    /// Current DRDYNVC multiplexer state.
    fn drdynvc_state(&self) -> DrdynvcState;

    /// Whether a static channel was joined by the client.
    fn is_channel_joined(&self, name: &str) -> bool;

    /// Open a dynamic virtual channel; returns its channel id. The
    /// creation status arrives later as [`PeerEvent::DvcCreationStatus`].
    fn open_dvc(&self, name: &'static str) -> PeerResult<u32>;

    /// Close a dynamic virtual channel. Idempotent.
    fn close_dvc(&self, channel_id: u32) -> PeerResult<()>;
}
