//! Embedding Host Contract
//!
//! The session drives an embedding host that owns the actual desktop:
//! it supplies capture streams, accepts injected input events, and
//! exposes the system clipboard. PipeWire, portals and compositor
//! plumbing live entirely on the host side of these traits.
//!
//! Frames and stream lifecycle events flow back through a typed
//! [`StreamEvent`] channel handed over at stream creation; everything
//! else is a direct call.

use bytes::Bytes;
use thiserror::Error;

use crate::graphics::buffer::RdpBuffer;
use crate::layout::monitor_config::{MonitorConfig, VirtualMonitor};

/// Errors reported by the embedding host.
#[derive(Debug, Error)]
pub enum HostError {
    /// The remote-desktop session could not be started.
    #[error("host session unavailable: {0}")]
    SessionUnavailable(String),

    /// A capture stream could not be created or resized.
    #[error("capture stream failed: {0}")]
    StreamFailed(String),

    /// The monitor configuration was rejected by the host.
    #[error("monitor config rejected: {0}")]
    ConfigRejected(String),
}

/// Result alias for host operations.
pub type HostResult<T> = std::result::Result<T, HostError>;

/// How the host should treat the cursor in captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorMode {
    /// Cursor excluded from frames; shape/position arrive as
    /// [`StreamEvent`] metadata for the cursor renderer.
    #[default]
    Metadata,
    /// Cursor painted into frames.
    Embedded,
    /// No cursor at all.
    Hidden,
}

/// Key event state for injected keyboard events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Pressed,
    Released,
}

/// Button event state for injected pointer buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonState {
    Pressed,
    Released,
}

/// Axis source flags for injected scroll events.
pub mod axis_flags {
    /// Discrete wheel source.
    pub const SOURCE_WHEEL: u32 = 1 << 0;
    /// Scroll sequence finished.
    pub const FINISH: u32 = 1 << 1;
}

/// Events a capture stream delivers to the session.
#[derive(Debug)]
pub enum StreamEvent {
    /// The stream finished negotiation and will produce frames.
    Ready,
    /// A captured frame, rented from the stream's buffer pool.
    Frame(RdpBuffer),
    /// New cursor shape (metadata cursor mode).
    CursorShape {
        width: u32,
        height: u32,
        hotspot_x: u32,
        hotspot_y: u32,
        /// Premultiplied BGRA pixel data, `width * height * 4` bytes.
        data: Bytes,
    },
    /// The cursor left the stream or was hidden.
    CursorHidden,
    /// The stream was closed on the host side.
    Closed,
    /// Unrecoverable stream error.
    Error(String),
}

/// Sender half handed to the host at stream creation.
pub type StreamEventSender = crossbeam_channel::Sender<StreamEvent>;

/// One host capture stream. Created per render surface; closed by the
/// layout manager on layout changes or teardown.
pub trait CaptureStream: Send {
    /// Stream id assigned by the session at creation.
    fn stream_id(&self) -> u32;

    /// Resize the capture to new dimensions (layout update of an
    /// existing surface).
    fn update_params(&self, width: u32, height: u32) -> HostResult<()>;

    /// Stop the capture. Idempotent; a [`StreamEvent::Closed`] still
    /// follows on the event channel.
    fn close(&self);
}

/// Input injection into the host desktop.
///
/// Callers must not inject pointer events whose transformed position
/// lies outside every surface; the layout transform decides that.
pub trait InputInjector: Send + Sync {
    /// Key event by platform keycode.
    fn notify_keyboard_keycode(&self, keycode: u32, state: KeyState);
    /// Key event by keysym.
    fn notify_keyboard_keysym(&self, keysym: u32, state: KeyState);
    /// Absolute pointer motion in stream-local coordinates.
    fn notify_pointer_motion_absolute(&self, stream_id: u32, x: f64, y: f64);
    /// Pointer button event (Linux button codes).
    fn notify_pointer_button(&self, button: i32, state: ButtonState);
    /// Scroll event; `flags` is a combination of [`axis_flags`].
    fn notify_pointer_axis(&self, dx: f64, dy: f64, flags: u32);
    /// Touch contact down in stream-local coordinates.
    fn notify_touch_down(&self, stream_id: u32, touch_id: u64, x: f64, y: f64);
    /// Touch contact motion.
    fn notify_touch_motion(&self, stream_id: u32, touch_id: u64, x: f64, y: f64);
    /// Touch contact lifted.
    fn notify_touch_up(&self, touch_id: u64);
    /// Touch contact canceled.
    fn notify_touch_cancel(&self, touch_id: u64);
    /// End of a batch of touch mutations.
    fn notify_touch_frame(&self);
    /// Synchronize lock-key states.
    fn synchronize_lock_states(&self, caps_lock: bool, num_lock: bool, scroll_lock: bool);
}

/// Invoked once the host has consumed a client mime-type-list update.
/// The clipboard FSM blocks further client format lists until then.
pub type MimeListConsumed = Box<dyn FnOnce() + Send>;

/// Host-side clipboard surface.
pub trait ClipboardHost: Send + Sync {
    /// The client's clipboard offers changed; `done` must be invoked
    /// once the host main loop has consumed the list.
    fn update_client_mime_type_list(&self, mime_types: Vec<String>, done: MimeListConsumed);

    /// Deliver client clipboard content the host asked for through
    /// `ClipboardRdp::request_client_content_for_mime_type`. `None`
    /// reports failure or timeout.
    fn submit_client_content_for_mime_type(&self, request_id: u32, content: Option<Vec<u8>>);

    /// The client requested server clipboard data; the host answers
    /// through `ClipboardRdp::submit_requested_server_content`.
    fn request_server_content_for_mime_type(&self, mime_type: String, request_id: u32);
}

/// The embedding host session.
///
/// One per RDP session; started in post-connect and stopped during
/// teardown.
pub trait RemoteDesktopHost: Send + Sync + 'static {
    /// Start the host remote-desktop session.
    fn start(&self) -> HostResult<()>;

    /// Stop the host session. Idempotent.
    fn stop(&self);

    /// Apply a validated monitor configuration to the host desktop.
    fn submit_new_monitor_config(&self, config: &MonitorConfig) -> HostResult<()>;

    /// Begin recording a physical monitor by connector name.
    fn record_monitor(
        &self,
        stream_id: u32,
        connector: &str,
        cursor_mode: CursorMode,
        events: StreamEventSender,
    ) -> HostResult<Box<dyn CaptureStream>>;

    /// Begin recording a virtual monitor.
    fn record_virtual(
        &self,
        stream_id: u32,
        monitor: &VirtualMonitor,
        cursor_mode: CursorMode,
        events: StreamEventSender,
    ) -> HostResult<Box<dyn CaptureStream>>;

    /// Input injection surface.
    fn input(&self) -> &dyn InputInjector;

    /// Clipboard surface.
    fn clipboard(&self) -> &dyn ClipboardHost;
}
