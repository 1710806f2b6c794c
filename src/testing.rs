//! Test Doubles
//!
//! Recording fakes for the peer library, the embedding host and the
//! codec factory, used by the unit and scenario tests to exercise the
//! session runtime without a wire stack or a desktop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::error::ErrorInfo;
use crate::graphics::codec::{CodecFactory, CodecResult, FrameCodec, ImageView};
use crate::graphics::damage::DamageRegion;
use crate::host::{
    ButtonState, CaptureStream, ClipboardHost, CursorMode, HostResult, InputInjector, KeyState,
    MimeListConsumed, RemoteDesktopHost, StreamEventSender,
};
use crate::layout::monitor_config::{MonitorConfig, VirtualMonitor};
use crate::peer::{DrdynvcState, OutputPdu, PeerEvent, PeerResult, RdpPeer};

// =============================================================================
// Peer fake
// =============================================================================

struct PeerState {
    events: VecDeque<PeerEvent>,
    sent: Vec<OutputPdu>,
    opened_dvcs: Vec<&'static str>,
    closed_dvcs: Vec<u32>,
    error_info: ErrorInfo,
    closed: bool,
    disconnected: bool,
}

/// Peer fake recording every output PDU and serving queued events.
pub struct RecordingPeer {
    state: Mutex<PeerState>,
    event_cond: Condvar,
    next_channel_id: AtomicU32,
    transport_alive: AtomicBool,
}

impl Default for RecordingPeer {
    fn default() -> Self {
        RecordingPeer {
            state: Mutex::new(PeerState {
                events: VecDeque::new(),
                sent: Vec::new(),
                opened_dvcs: Vec::new(),
                closed_dvcs: Vec::new(),
                error_info: ErrorInfo::None,
                closed: false,
                disconnected: false,
            }),
            event_cond: Condvar::new(),
            next_channel_id: AtomicU32::new(1),
            transport_alive: AtomicBool::new(true),
        }
    }
}

impl RecordingPeer {
    /// Queue an event for the socket loop.
    pub fn push_event(&self, event: PeerEvent) {
        self.state.lock().events.push_back(event);
        self.event_cond.notify_all();
    }

    /// Everything the session submitted so far.
    pub fn sent(&self) -> Vec<OutputPdu> {
        self.state.lock().sent.clone()
    }

    /// Drop the recorded output.
    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    /// Channel names opened through `open_dvc`, in order.
    pub fn opened_dvcs(&self) -> Vec<&'static str> {
        self.state.lock().opened_dvcs.clone()
    }

    /// Channel ids closed through `close_dvc`, in order.
    pub fn closed_dvcs(&self) -> Vec<u32> {
        self.state.lock().closed_dvcs.clone()
    }

    /// Last error-info code the session recorded.
    pub fn error_info(&self) -> ErrorInfo {
        self.state.lock().error_info
    }

    pub fn was_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn was_disconnected(&self) -> bool {
        self.state.lock().disconnected
    }

    /// Simulate transport loss: `check_file_descriptor` starts failing.
    pub fn kill_transport(&self) {
        self.transport_alive.store(false, Ordering::Release);
        self.event_cond.notify_all();
    }
}

impl RdpPeer for RecordingPeer {
    fn initialize(&self) -> PeerResult<()> {
        Ok(())
    }

    fn check_file_descriptor(&self) -> bool {
        self.transport_alive.load(Ordering::Acquire)
    }

    fn wait_event(&self, timeout: Duration) -> Option<PeerEvent> {
        let mut state = self.state.lock();
        loop {
            if let Some(event) = state.events.pop_front() {
                return Some(event);
            }
            if self.event_cond.wait_for(&mut state, timeout).timed_out() {
                return None;
            }
        }
    }

    fn send(&self, pdu: OutputPdu) -> PeerResult<()> {
        self.state.lock().sent.push(pdu);
        Ok(())
    }

    fn set_error_info(&self, info: ErrorInfo) {
        self.state.lock().error_info = info;
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.transport_alive.store(false, Ordering::Release);
        self.event_cond.notify_all();
    }

    fn disconnect(&self) {
        self.state.lock().disconnected = true;
        self.transport_alive.store(false, Ordering::Release);
        self.event_cond.notify_all();
    }

    fn drdynvc_state(&self) -> DrdynvcState {
        DrdynvcState::Ready
    }

    fn is_channel_joined(&self, _name: &str) -> bool {
        true
    }

    fn open_dvc(&self, name: &'static str) -> PeerResult<u32> {
        let id = self.next_channel_id.fetch_add(1, Ordering::SeqCst);
        self.state.lock().opened_dvcs.push(name);
        Ok(id)
    }

    fn close_dvc(&self, channel_id: u32) -> PeerResult<()> {
        self.state.lock().closed_dvcs.push(channel_id);
        Ok(())
    }
}

// =============================================================================
// Host fake
// =============================================================================

/// One recorded host call.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCall {
    Start,
    Stop,
    SubmitMonitorConfig { monitor_count: usize },
    RecordMonitor { stream_id: u32, connector: String },
    RecordVirtual { stream_id: u32 },
    KeyboardKeycode { keycode: u32, state: KeyState },
    KeyboardKeysym { keysym: u32, state: KeyState },
    PointerMotionAbsolute { stream_id: u32, x: f64, y: f64 },
    PointerButton { button: i32, state: ButtonState },
    PointerAxis { dx: f64, dy: f64, flags: u32 },
    TouchDown { stream_id: u32, touch_id: u64, x: f64, y: f64 },
    TouchMotion { stream_id: u32, touch_id: u64, x: f64, y: f64 },
    TouchUp { touch_id: u64 },
    TouchCancel { touch_id: u64 },
    TouchFrame,
    SynchronizeLockStates { caps_lock: bool, num_lock: bool },
    UpdateClientMimeTypeList { mime_types: Vec<String> },
    SubmitClientContent { request_id: u32, content: Option<Vec<u8>> },
    RequestServerContent { mime_type: String, request_id: u32 },
}

struct FakeStream {
    stream_id: u32,
}

impl CaptureStream for FakeStream {
    fn stream_id(&self) -> u32 {
        self.stream_id
    }

    fn update_params(&self, _width: u32, _height: u32) -> HostResult<()> {
        Ok(())
    }

    fn close(&self) {}
}

/// Host fake recording every call, handing out inert capture streams.
#[derive(Default)]
pub struct RecordingHost {
    calls: Mutex<Vec<HostCall>>,
    stream_senders: Mutex<Vec<(u32, StreamEventSender)>>,
    /// When true, `update_client_mime_type_list` consumes immediately.
    pub auto_consume_mime_lists: AtomicBool,
    pending_mime_done: Mutex<Vec<MimeListConsumed>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        let host = RecordingHost::default();
        host.auto_consume_mime_lists.store(true, Ordering::Release);
        host
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: HostCall) {
        self.calls.lock().push(call);
    }

    /// Event sender of the stream created with `stream_id`.
    pub fn stream_sender(&self, stream_id: u32) -> Option<StreamEventSender> {
        self.stream_senders
            .lock()
            .iter()
            .find(|(id, _)| *id == stream_id)
            .map(|(_, tx)| tx.clone())
    }

    /// Run deferred mime-list consumption callbacks.
    pub fn consume_pending_mime_lists(&self) {
        let pending: Vec<_> = self.pending_mime_done.lock().drain(..).collect();
        for done in pending {
            done();
        }
    }
}

impl InputInjector for RecordingHost {
    fn notify_keyboard_keycode(&self, keycode: u32, state: KeyState) {
        self.record(HostCall::KeyboardKeycode { keycode, state });
    }

    fn notify_keyboard_keysym(&self, keysym: u32, state: KeyState) {
        self.record(HostCall::KeyboardKeysym { keysym, state });
    }

    fn notify_pointer_motion_absolute(&self, stream_id: u32, x: f64, y: f64) {
        self.record(HostCall::PointerMotionAbsolute { stream_id, x, y });
    }

    fn notify_pointer_button(&self, button: i32, state: ButtonState) {
        self.record(HostCall::PointerButton { button, state });
    }

    fn notify_pointer_axis(&self, dx: f64, dy: f64, flags: u32) {
        self.record(HostCall::PointerAxis { dx, dy, flags });
    }

    fn notify_touch_down(&self, stream_id: u32, touch_id: u64, x: f64, y: f64) {
        self.record(HostCall::TouchDown {
            stream_id,
            touch_id,
            x,
            y,
        });
    }

    fn notify_touch_motion(&self, stream_id: u32, touch_id: u64, x: f64, y: f64) {
        self.record(HostCall::TouchMotion {
            stream_id,
            touch_id,
            x,
            y,
        });
    }

    fn notify_touch_up(&self, touch_id: u64) {
        self.record(HostCall::TouchUp { touch_id });
    }

    fn notify_touch_cancel(&self, touch_id: u64) {
        self.record(HostCall::TouchCancel { touch_id });
    }

    fn notify_touch_frame(&self) {
        self.record(HostCall::TouchFrame);
    }

    fn synchronize_lock_states(&self, caps_lock: bool, num_lock: bool, _scroll_lock: bool) {
        self.record(HostCall::SynchronizeLockStates {
            caps_lock,
            num_lock,
        });
    }
}

impl ClipboardHost for RecordingHost {
    fn update_client_mime_type_list(&self, mime_types: Vec<String>, done: MimeListConsumed) {
        self.record(HostCall::UpdateClientMimeTypeList { mime_types });
        if self.auto_consume_mime_lists.load(Ordering::Acquire) {
            done();
        } else {
            self.pending_mime_done.lock().push(done);
        }
    }

    fn submit_client_content_for_mime_type(&self, request_id: u32, content: Option<Vec<u8>>) {
        self.record(HostCall::SubmitClientContent {
            request_id,
            content,
        });
    }

    fn request_server_content_for_mime_type(&self, mime_type: String, request_id: u32) {
        self.record(HostCall::RequestServerContent {
            mime_type,
            request_id,
        });
    }
}

impl RemoteDesktopHost for RecordingHost {
    fn start(&self) -> HostResult<()> {
        self.record(HostCall::Start);
        Ok(())
    }

    fn stop(&self) {
        self.record(HostCall::Stop);
    }

    fn submit_new_monitor_config(&self, config: &MonitorConfig) -> HostResult<()> {
        self.record(HostCall::SubmitMonitorConfig {
            monitor_count: config.monitor_count(),
        });
        Ok(())
    }

    fn record_monitor(
        &self,
        stream_id: u32,
        connector: &str,
        _cursor_mode: CursorMode,
        events: StreamEventSender,
    ) -> HostResult<Box<dyn CaptureStream>> {
        self.record(HostCall::RecordMonitor {
            stream_id,
            connector: connector.to_string(),
        });
        self.stream_senders.lock().push((stream_id, events));
        Ok(Box::new(FakeStream { stream_id }))
    }

    fn record_virtual(
        &self,
        stream_id: u32,
        _monitor: &VirtualMonitor,
        _cursor_mode: CursorMode,
        events: StreamEventSender,
    ) -> HostResult<Box<dyn CaptureStream>> {
        self.record(HostCall::RecordVirtual { stream_id });
        self.stream_senders.lock().push((stream_id, events));
        Ok(Box::new(FakeStream { stream_id }))
    }

    fn input(&self) -> &dyn InputInjector {
        self
    }

    fn clipboard(&self) -> &dyn ClipboardHost {
        self
    }
}

// =============================================================================
// Codec fake
// =============================================================================

struct StubCodec {
    label: &'static str,
}

impl FrameCodec for StubCodec {
    fn encode_regions(
        &mut self,
        _view: &ImageView,
        regions: &[DamageRegion],
    ) -> CodecResult<Bytes> {
        let area: u64 = regions.iter().map(|r| r.area()).sum();
        Ok(Bytes::from(format!("{}:{}", self.label, area)))
    }

    fn reset(&mut self, _width: u32, _height: u32) -> CodecResult<()> {
        Ok(())
    }
}

/// Codec factory producing stub encoders with predictable output.
#[derive(Default)]
pub struct StubCodecFactory;

impl CodecFactory for StubCodecFactory {
    fn create_rfx(&self, _width: u32, _height: u32) -> CodecResult<Box<dyn FrameCodec>> {
        Ok(Box::new(StubCodec { label: "rfx" }))
    }

    fn create_progressive(&self, _width: u32, _height: u32) -> CodecResult<Box<dyn FrameCodec>> {
        Ok(Box::new(StubCodec { label: "progressive" }))
    }

    fn create_nsc(&self, _width: u32, _height: u32) -> CodecResult<Box<dyn FrameCodec>> {
        Ok(Box::new(StubCodec { label: "nsc" }))
    }
}
