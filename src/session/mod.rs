//! Session Runtime
//!
//! The per-client state machine: it drives the peer's event loop on
//! the socket thread, owns the session flag word and the per-channel
//! subcomponents, runs rendering on the graphics thread, and
//! coordinates the ordered teardown.
//!
//! Thread layout per session: one socket thread (owns the peer
//! transport and all channel callbacks), one graphics thread (owns the
//! rendering loop, the GFX bridge and the cursor renderer), one main
//! loop (deferred work and timers), plus the encode and FUSE threads
//! owned by their subsystems.

pub mod flags;
pub mod main_loop;
pub mod sam;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Select, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::audio::dsp::AudioDsp;
use crate::audio::input::{AudioInput, PcmSink};
use crate::audio::playback::AudioPlayback;
use crate::clipboard::ClipboardRdp;
use crate::config::ScreenShareMode;
use crate::cursor::CursorRenderer;
use crate::display::DisplayControl;
use crate::dvc::telemetry::TelemetryDvc;
use crate::dvc::{DvcChannel, DvcRegistry};
use crate::error::SessionError;
use crate::graphics::codec::CodecFactory;
use crate::graphics::gfx::GfxPipeline;
use crate::graphics::pipeline::{GraphicsPipeline, RenderCaps};
use crate::graphics::workers::WorkerPool;
use crate::host::{RemoteDesktopHost, StreamEvent};
use crate::input::{
    translate_extended_mouse_event, translate_mouse_event, InputDvc, KeyboardAction,
    KeyboardTranslator, PointerAction, TouchAction, TouchTranslator, UnicodeTranslator,
};
use crate::layout::monitor_config::MonitorConfig;
use crate::layout::surface::SurfaceBacking;
use crate::layout::{LayoutManager, LayoutState};
use crate::peer::pdu::{ClientCapabilities, GfxClientPdu, GfxServerPdu, OsMajorType};
use crate::peer::{channels, DrdynvcState, OutputPdu, PeerEvent, RdpPeer};
use flags::{ACTIVATED, OUTPUT_ENABLED, PENDING_GFX_INIT, PENDING_GFX_RESET};
use main_loop::{MainLoop, MainLoopHandle};
use sam::SamFile;

/// Socket thread wait granularity.
const PEER_WAIT_TIMEOUT: Duration = Duration::from_millis(50);

/// Graphics loop wait granularity.
const RENDER_WAIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Per-session configuration handed over by the embedding host.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub screen_share_mode: ScreenShareMode,
    /// Suppress all input injection.
    pub view_only: bool,
    pub max_monitor_count: u32,
    /// Connectors recorded in mirror mode.
    pub mirror_connectors: Vec<String>,
    /// Credentials for the SAM scratch file, when the embedding host
    /// wants one created.
    pub credentials: Option<(String, String)>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            screen_share_mode: ScreenShareMode::Extend,
            view_only: false,
            max_monitor_count: 16,
            mirror_connectors: vec!["primary".into()],
            credentials: None,
        }
    }
}

/// Commands onto the graphics thread.
enum RenderCommand {
    Configure {
        caps: RenderCaps,
        pointer_cache_size: u32,
    },
    SubmitConfig(MonitorConfig),
    RecreateLayout,
    GfxChannelReady,
    GfxFrameAck {
        frame_id: u32,
        queue_depth: u32,
    },
    RoundTripTime(Duration),
    RefreshAll,
    Stop,
}

struct SessionInner {
    peer: Arc<dyn RdpPeer>,
    host: Arc<dyn RemoteDesktopHost>,
    codec_factory: Arc<dyn CodecFactory>,
    config: SessionConfig,

    flags: flags::SessionFlags,
    stopped: AtomicBool,
    close_scheduled: AtomicBool,
    error: Mutex<Option<SessionError>>,

    main_loop: MainLoopHandle,
    graphics_tx: Sender<RenderCommand>,
    layout: Arc<Mutex<LayoutManager>>,

    client_caps: Mutex<Option<ClientCapabilities>>,
    pending_monitor_config: Mutex<Option<MonitorConfig>>,
    audio_enabled: AtomicBool,
    sam_file: Mutex<Option<SamFile>>,
}

/// Surface the fatal error and schedule the idempotent close. Later
/// calls update the reported error-info code only.
fn notify_error(inner: &Arc<SessionInner>, error: SessionError) {
    warn!("fatal session error: {error}");
    inner.peer.set_error_info(error.error_info());
    {
        let mut slot = inner.error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }
    inner.flags.clear(ACTIVATED);

    if !inner.close_scheduled.swap(true, Ordering::AcqRel) {
        let peer = Arc::clone(&inner.peer);
        inner.main_loop.invoke(move || peer.close());
    }
}

/// One RDP session: created on an accepted connection, destroyed after
/// teardown completes.
pub struct Session {
    inner: Arc<SessionInner>,
    clipboard: Arc<ClipboardRdp>,
    playback: Arc<Mutex<AudioPlayback>>,

    main_loop: Option<MainLoop>,
    socket_thread: Option<thread::JoinHandle<()>>,
    graphics_thread: Option<thread::JoinHandle<()>>,

    /// Channel tear-down closures, run inside the locked section of
    /// the shutdown sequence.
    teardown_fns: Arc<Mutex<Vec<Box<dyn FnMut() + Send>>>>,
}

impl Session {
    /// Build the session and start its threads. The peer begins
    /// dispatching events immediately.
    pub fn new(
        peer: Arc<dyn RdpPeer>,
        host: Arc<dyn RemoteDesktopHost>,
        codec_factory: Arc<dyn CodecFactory>,
        dsp: Arc<dyn AudioDsp>,
        pcm_sink: PcmSink,
        config: SessionConfig,
    ) -> Self {
        let main_loop = MainLoop::new();
        let main_handle = main_loop.handle();
        let (graphics_tx, graphics_rx) = unbounded();

        let sam_file = config.credentials.as_ref().and_then(|(username, password)| {
            match SamFile::create(username, password) {
                Ok(sam) => Some(sam),
                Err(e) => {
                    warn!("failed to create SAM scratch file: {e}");
                    None
                }
            }
        });

        let inner = Arc::new(SessionInner {
            peer: Arc::clone(&peer),
            host: Arc::clone(&host),
            codec_factory,
            config: config.clone(),
            flags: flags::SessionFlags::new(),
            stopped: AtomicBool::new(false),
            close_scheduled: AtomicBool::new(false),
            error: Mutex::new(None),
            main_loop: main_handle.clone(),
            graphics_tx: graphics_tx.clone(),
            layout: Arc::new(Mutex::new(LayoutManager::new(
                Arc::clone(&host),
                main_handle.clone(),
                {
                    let graphics_tx = graphics_tx.clone();
                    Arc::new(move || {
                        let _ = graphics_tx.send(RenderCommand::RecreateLayout);
                    })
                },
                crate::host::CursorMode::Metadata,
            ))),
            client_caps: Mutex::new(None),
            pending_monitor_config: Mutex::new(None),
            audio_enabled: AtomicBool::new(false),
            sam_file: Mutex::new(sam_file),
        });

        let registry = Arc::new(DvcRegistry::new(main_handle.clone()));
        let clipboard = Arc::new(ClipboardRdp::new(
            Arc::clone(&peer),
            Arc::clone(&host),
            main_handle.clone(),
        ));
        let playback = Arc::new(Mutex::new(AudioPlayback::new(
            Arc::clone(&peer),
            Arc::clone(&registry),
            main_handle.clone(),
            Arc::clone(&dsp),
        )));
        let audin = Arc::new(Mutex::new(AudioInput::new(
            Arc::clone(&peer),
            Arc::clone(&registry),
            main_handle.clone(),
            dsp,
            pcm_sink,
        )));
        let display = Arc::new(Mutex::new(DisplayControl::new(
            Arc::clone(&peer),
            Arc::clone(&registry),
            config.max_monitor_count,
            {
                let graphics_tx = graphics_tx.clone();
                Box::new(move |config| {
                    let _ = graphics_tx.send(RenderCommand::SubmitConfig(config));
                })
            },
            {
                let inner = Arc::clone(&inner);
                Box::new(move || notify_error(&inner, SessionError::BadMonitorData))
            },
        )));
        let telemetry = Arc::new(Mutex::new(TelemetryDvc::new(
            Arc::clone(&peer),
            Arc::clone(&registry),
            Instant::now(),
        )));
        let gfx_channel = Arc::new(Mutex::new(GfxChannel {
            inner: Arc::clone(&inner),
            registry: Arc::clone(&registry),
            channel_id: None,
            subscription_id: None,
            initialized: false,
            torn_down: false,
        }));
        let input_dvc = Arc::new(Mutex::new(InputDvc::new(
            Arc::clone(&peer),
            Arc::clone(&registry),
        )));

        let teardown_fns: Arc<Mutex<Vec<Box<dyn FnMut() + Send>>>> = Arc::new(Mutex::new(vec![
            teardown_fn(Arc::clone(&display)),
            teardown_fn(Arc::clone(&telemetry)),
            teardown_fn(Arc::clone(&playback)),
            teardown_fn(Arc::clone(&audin)),
            teardown_fn(Arc::clone(&gfx_channel)),
            teardown_fn(Arc::clone(&input_dvc)),
        ]));

        let graphics_thread = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("session-graphics".into())
                .spawn(move || graphics_thread_main(inner, graphics_rx))
                .expect("spawn graphics thread")
        };

        let socket_thread = {
            let ctx = SocketContext {
                inner: Arc::clone(&inner),
                registry,
                clipboard: Arc::clone(&clipboard),
                playback: Arc::clone(&playback),
                audin,
                display,
                telemetry,
                gfx_channel,
                input_dvc,
            };
            thread::Builder::new()
                .name("session-socket".into())
                .spawn(move || socket_thread_main(ctx))
                .expect("spawn socket thread")
        };

        Session {
            inner,
            clipboard,
            playback,
            main_loop: Some(main_loop),
            socket_thread: Some(socket_thread),
            graphics_thread: Some(graphics_thread),
            teardown_fns,
        }
    }

    /// Path of the SAM scratch file for the peer library.
    pub fn sam_file_path(&self) -> Option<std::path::PathBuf> {
        self.inner.sam_file.lock().as_ref().and_then(|s| s.path())
    }

    /// The clipboard surface the embedding host calls into.
    pub fn clipboard(&self) -> &ClipboardRdp {
        &self.clipboard
    }

    /// Host audio frame submission (playback direction).
    pub fn submit_audio_samples(&self, node_id: u32, samples: &[i16], timestamp_us: i64) {
        self.playback.lock().submit_samples(node_id, samples, timestamp_us);
    }

    /// The fatal error recorded for this session, if any.
    pub fn last_error(&self) -> Option<SessionError> {
        *self.inner.error.lock()
    }

    /// Whether the session is activated and rendering.
    pub fn is_active(&self) -> bool {
        self.inner.flags.is_set(ACTIVATED)
    }

    /// Ordered teardown: stop signal, graphics join, locked channel
    /// teardown, socket join, host stop, peer release.
    pub fn shutdown(&mut self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("session shutting down");
        self.inner.flags.clear(ACTIVATED | OUTPUT_ENABLED);

        let _ = self.inner.graphics_tx.send(RenderCommand::Stop);
        if let Some(thread) = self.graphics_thread.take() {
            let _ = thread.join();
        }

        {
            let mut teardown_fns = self.teardown_fns.lock();
            for teardown in teardown_fns.iter_mut() {
                teardown();
            }
        }
        self.clipboard.stop();

        if let Some(thread) = self.socket_thread.take() {
            let _ = thread.join();
        }

        self.inner.host.stop();
        self.inner.layout.lock().dispose();
        self.inner.sam_file.lock().take();
        self.inner.peer.disconnect();
        self.main_loop.take();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn teardown_fn<C: DvcChannel + 'static>(channel: Arc<Mutex<C>>) -> Box<dyn FnMut() + Send> {
    Box::new(move || channel.lock().queue_channel_tear_down())
}

// =============================================================================
// GFX channel lifecycle
// =============================================================================

/// Opens the graphics-pipeline DVC and flips the pending-init flag
/// once the client confirmed the channel.
struct GfxChannel {
    inner: Arc<SessionInner>,
    registry: Arc<DvcRegistry>,
    channel_id: Option<u32>,
    subscription_id: Option<u32>,
    initialized: bool,
    torn_down: bool,
}

impl DvcChannel for GfxChannel {
    fn maybe_init(&mut self) {
        if self.initialized || self.torn_down {
            return;
        }
        if !self.inner.flags.is_set(PENDING_GFX_INIT) {
            return;
        }
        self.initialized = true;

        let channel_id = match self.inner.peer.open_dvc(channels::GFX) {
            Ok(id) => id,
            Err(e) => {
                warn!("failed to open graphics pipeline channel: {e}");
                notify_error(&self.inner, SessionError::GraphicsSubsystemFailed);
                return;
            }
        };
        self.channel_id = Some(channel_id);

        let inner = Arc::clone(&self.inner);
        let subscription_id = self.registry.subscribe_creation_status(
            channel_id,
            Box::new(move |status| {
                if status < 0 {
                    warn!("graphics pipeline channel creation failed: {status}");
                    notify_error(&inner, SessionError::GraphicsSubsystemFailed);
                    return;
                }
                debug!("graphics pipeline channel ready");
                inner.flags.clear(PENDING_GFX_INIT);
                inner.flags.set(PENDING_GFX_RESET);
                let _ = inner.graphics_tx.send(RenderCommand::GfxChannelReady);
            }),
        );
        self.subscription_id = Some(subscription_id);
    }

    fn queue_channel_tear_down(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let (Some(channel_id), Some(subscription_id)) = (self.channel_id, self.subscription_id)
        {
            self.registry
                .unsubscribe_creation_status(channel_id, subscription_id);
        }
        if let Some(channel_id) = self.channel_id.take() {
            let _ = self.inner.peer.close_dvc(channel_id);
        }
    }
}

// =============================================================================
// Socket thread
// =============================================================================

struct SocketContext {
    inner: Arc<SessionInner>,
    registry: Arc<DvcRegistry>,
    clipboard: Arc<ClipboardRdp>,
    playback: Arc<Mutex<AudioPlayback>>,
    audin: Arc<Mutex<AudioInput>>,
    display: Arc<Mutex<DisplayControl>>,
    telemetry: Arc<Mutex<TelemetryDvc>>,
    gfx_channel: Arc<Mutex<GfxChannel>>,
    input_dvc: Arc<Mutex<InputDvc>>,
}

fn socket_thread_main(ctx: SocketContext) {
    let mut keyboard = KeyboardTranslator::new();
    let mut unicode = UnicodeTranslator::new();
    let mut touch = TouchTranslator::new();
    let mut dvcs_initialized = false;

    debug!("socket thread starting");
    loop {
        if ctx.inner.stopped.load(Ordering::Acquire) {
            break;
        }
        if !ctx.inner.peer.check_file_descriptor() {
            handle_client_gone(&ctx.inner);
            break;
        }

        if !dvcs_initialized && ctx.inner.peer.drdynvc_state() == DrdynvcState::Ready {
            dvcs_initialized = true;
            maybe_init_dvcs(&ctx);
        }

        let Some(event) = ctx.inner.peer.wait_event(PEER_WAIT_TIMEOUT) else {
            continue;
        };
        dispatch_peer_event(&ctx, event, &mut keyboard, &mut unicode, &mut touch);
    }
    debug!("socket thread exiting");
}

/// Exactly once per connect, after DRDYNVC reports READY.
fn maybe_init_dvcs(ctx: &SocketContext) {
    ctx.telemetry.lock().maybe_init();
    ctx.display.lock().maybe_init();
    ctx.input_dvc.lock().maybe_init();
    ctx.gfx_channel.lock().maybe_init();
    if ctx.inner.audio_enabled.load(Ordering::Acquire) {
        ctx.playback.lock().maybe_init();
        ctx.audin.lock().maybe_init();
    }
}

fn handle_client_gone(inner: &Arc<SessionInner>) {
    info!("client transport gone");
    inner.flags.clear(ACTIVATED | OUTPUT_ENABLED);
    if !inner.close_scheduled.swap(true, Ordering::AcqRel) {
        let peer = Arc::clone(&inner.peer);
        inner.main_loop.invoke(move || peer.close());
    }
}

fn dispatch_peer_event(
    ctx: &SocketContext,
    event: PeerEvent,
    keyboard: &mut KeyboardTranslator,
    unicode: &mut UnicodeTranslator,
    touch: &mut TouchTranslator,
) {
    let inner = &ctx.inner;
    match event {
        PeerEvent::Capabilities(caps) => handle_capabilities(inner, caps),
        PeerEvent::PostConnect => handle_post_connect(ctx),
        PeerEvent::Activate => {
            inner.flags.set(ACTIVATED);
        }
        PeerEvent::SuppressOutput {
            enable_display_updates,
        } => handle_suppress_output(inner, enable_display_updates),
        PeerEvent::FrameAcknowledge { .. } => {}

        PeerEvent::Synchronize {
            caps_lock,
            num_lock,
            scroll_lock,
        } => {
            if !input_allowed(inner) {
                return;
            }
            let released = keyboard
                .release_all()
                .into_iter()
                .chain(unicode.release_all());
            for action in released {
                inject_keyboard_action(inner, action);
            }
            inner
                .host
                .input()
                .synchronize_lock_states(caps_lock, num_lock, scroll_lock);
        }
        PeerEvent::KeyboardScancode {
            code,
            pressed,
            extended,
            extended1,
        } => {
            if !input_allowed(inner) {
                return;
            }
            for action in keyboard.handle_scancode(code, pressed, extended, extended1) {
                inject_keyboard_action(inner, action);
            }
        }
        PeerEvent::KeyboardUnicode { code_unit, pressed } => {
            if !input_allowed(inner) {
                return;
            }
            if let Some(action) = unicode.handle_code_unit(code_unit, pressed) {
                inject_keyboard_action(inner, action);
            }
        }
        PeerEvent::Pointer { flags, x, y } => {
            if !input_allowed(inner) {
                return;
            }
            inject_pointer_actions(inner, translate_mouse_event(flags, x, y));
        }
        PeerEvent::PointerExtended { flags, x, y } => {
            if !input_allowed(inner) {
                return;
            }
            inject_pointer_actions(inner, translate_extended_mouse_event(flags, x, y));
        }
        PeerEvent::Touch(frame) => {
            if !inner.flags.is_set(ACTIVATED) {
                return;
            }
            let layout = Arc::clone(&inner.layout);
            let actions = touch.handle_frame(&frame, move |x, y| {
                layout.lock().transform_position(x, y)
            });
            if inner.config.view_only {
                return;
            }
            for action in actions {
                inject_touch_action(inner, action);
            }
        }

        PeerEvent::Cliprdr(pdu) => ctx.clipboard.handle_client_pdu(pdu),
        PeerEvent::Disp(layout_pdu) => ctx.display.lock().handle_monitor_layout(&layout_pdu),
        PeerEvent::Rdpsnd(pdu) => ctx.playback.lock().handle_client_pdu(pdu),
        PeerEvent::Audin(pdu) => {
            let now_us = monotonic_now_us();
            ctx.audin.lock().handle_client_pdu(pdu, now_us);
        }
        PeerEvent::Gfx(pdu) => match pdu {
            GfxClientPdu::CapsAdvertise { versions } => {
                if let Some(&version) = versions.first() {
                    let _ = inner
                        .peer
                        .send(OutputPdu::Gfx(GfxServerPdu::CapsConfirm { version }));
                }
            }
            GfxClientPdu::FrameAcknowledge {
                frame_id,
                queue_depth,
            } => {
                let _ = inner.graphics_tx.send(RenderCommand::GfxFrameAck {
                    frame_id,
                    queue_depth,
                });
            }
            GfxClientPdu::CacheImportOffer => {}
        },

        PeerEvent::DvcCreationStatus { channel_id, status } => {
            ctx.registry.handle_creation_status(channel_id, status);
        }
        PeerEvent::DrdynvcReady => maybe_init_dvcs(ctx),
        PeerEvent::RttMeasurement { rtt } => {
            let _ = inner.graphics_tx.send(RenderCommand::RoundTripTime(rtt));
        }
        PeerEvent::ClientGone => handle_client_gone(inner),
    }
}

fn input_allowed(inner: &Arc<SessionInner>) -> bool {
    inner.flags.is_set(ACTIVATED) && !inner.config.view_only
}

fn inject_keyboard_action(inner: &Arc<SessionInner>, action: KeyboardAction) {
    match action {
        KeyboardAction::Keycode { keycode, state } => {
            inner.host.input().notify_keyboard_keycode(keycode, state)
        }
        KeyboardAction::Keysym { keysym, state } => {
            inner.host.input().notify_keyboard_keysym(keysym, state)
        }
    }
}

fn inject_pointer_actions(inner: &Arc<SessionInner>, actions: Vec<PointerAction>) {
    for action in actions {
        match action {
            PointerAction::Motion { x, y } => {
                // Absolute positions go through the layout transform;
                // points outside every surface are never injected.
                if let Some((stream_id, local_x, local_y)) =
                    inner.layout.lock().transform_position(x, y)
                {
                    inner
                        .host
                        .input()
                        .notify_pointer_motion_absolute(stream_id, local_x, local_y);
                }
            }
            PointerAction::Button { button, state } => {
                inner.host.input().notify_pointer_button(button, state)
            }
            PointerAction::Axis { dx, dy, flags } => {
                inner.host.input().notify_pointer_axis(dx, dy, flags)
            }
        }
    }
}

fn inject_touch_action(inner: &Arc<SessionInner>, action: TouchAction) {
    let input = inner.host.input();
    match action {
        TouchAction::Down {
            contact,
            stream_id,
            x,
            y,
        } => input.notify_touch_down(stream_id, contact, x, y),
        TouchAction::Motion {
            contact,
            stream_id,
            x,
            y,
        } => input.notify_touch_motion(stream_id, contact, x, y),
        TouchAction::Up { contact } => input.notify_touch_up(contact),
        TouchAction::Cancel { contact } => input.notify_touch_cancel(contact),
        TouchAction::DeviceFrame => input.notify_touch_frame(),
    }
}

/// Capability gate ([MS-RDPBCGR] negotiation outcome).
fn handle_capabilities(inner: &Arc<SessionInner>, caps: ClientCapabilities) {
    let extended = inner.config.screen_share_mode == ScreenShareMode::Extend;

    if extended && !caps.supports_graphics_pipeline {
        info!("client lacks graphics pipeline support in extended mode");
        notify_error(inner, SessionError::BadCaps);
        return;
    }
    if !matches!(caps.color_depth, 15 | 16 | 24 | 32) {
        info!("unsupported color depth {}", caps.color_depth);
        notify_error(inner, SessionError::BadCaps);
        return;
    }
    if !caps.supports_desktop_resize {
        info!("client lacks DesktopResize support");
        notify_error(inner, SessionError::BadCaps);
        return;
    }
    if caps.pointer_cache_size == 0 {
        info!("client offers no pointer cache");
        notify_error(inner, SessionError::BadCaps);
        return;
    }

    let monitor_config = if extended {
        match MonitorConfig::from_client_data(&caps, inner.config.max_monitor_count) {
            Ok(config) => config,
            Err(e) => {
                warn!("invalid client monitor data: {e}");
                notify_error(inner, SessionError::BadMonitorData);
                return;
            }
        }
    } else {
        MonitorConfig::from_connectors(inner.config.mirror_connectors.clone())
    };

    info!(
        "capabilities accepted: {}x{} depth {} gfx {}",
        caps.desktop_width, caps.desktop_height, caps.color_depth, caps.supports_graphics_pipeline
    );
    *inner.pending_monitor_config.lock() = Some(monitor_config);
    *inner.client_caps.lock() = Some(caps);
}

/// Post-connect: codec and audio gating, host session start, SAM
/// cleanup, activation.
fn handle_post_connect(ctx: &SocketContext) {
    let inner = &ctx.inner;
    let Some(caps) = inner.client_caps.lock().clone() else {
        warn!("post-connect without capabilities");
        notify_error(inner, SessionError::BadCaps);
        return;
    };

    let render_caps = RenderCaps::from_client(&caps);

    // Audio needs a channel the client can keep fed.
    let audio_ok = caps.supports_graphics_pipeline
        && !matches!(caps.os_major_type, OsMajorType::Ios | OsMajorType::Android)
        && caps.network_autodetect;
    inner.audio_enabled.store(audio_ok, Ordering::Release);
    if !audio_ok {
        info!("audio disabled for this client");
    }

    if caps.supports_graphics_pipeline {
        inner.flags.set(PENDING_GFX_INIT);
    }

    if let Err(e) = inner.host.start() {
        warn!("host session start failed: {e}");
        notify_error(inner, SessionError::CloseStackOnDriverFailure);
        return;
    }

    // Credentials leave the disk as soon as authentication is done.
    if let Some(mut sam) = inner.sam_file.lock().take() {
        sam.unlink();
    }

    let _ = inner.graphics_tx.send(RenderCommand::Configure {
        caps: render_caps,
        pointer_cache_size: caps.pointer_cache_size,
    });
    if let Some(config) = inner.pending_monitor_config.lock().take() {
        let _ = inner.graphics_tx.send(RenderCommand::SubmitConfig(config));
    }

    if inner.peer.is_channel_joined(channels::CLIPRDR) {
        ctx.clipboard.maybe_init();
        ctx.clipboard.mount_file_system();
    }

    // The multiplexer may have reported READY before the pending-init
    // flag existed; the channels are idempotent.
    if inner.peer.drdynvc_state() == DrdynvcState::Ready {
        maybe_init_dvcs(ctx);
    }

    inner.flags.set(OUTPUT_ENABLED | ACTIVATED);
    info!("session activated");
}

fn handle_suppress_output(inner: &Arc<SessionInner>, enable_display_updates: bool) {
    if !inner.flags.is_set(ACTIVATED) {
        return;
    }
    if enable_display_updates {
        inner.flags.set(OUTPUT_ENABLED);
        // Force a full frame so the client catches up.
        let _ = inner.graphics_tx.send(RenderCommand::RefreshAll);
    } else {
        inner.flags.clear(OUTPUT_ENABLED);
    }
}

fn monotonic_now_us() -> i64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as i64
}

// =============================================================================
// Graphics thread
// =============================================================================

fn graphics_thread_main(inner: Arc<SessionInner>, commands: Receiver<RenderCommand>) {
    let workers = Arc::new(WorkerPool::sized_to_host());
    let mut pipeline: Option<GraphicsPipeline> = None;
    let mut gfx: Option<GfxPipeline> = None;
    let mut cursor: Option<CursorRenderer> = None;

    debug!("graphics thread starting");
    'main: loop {
        // Snapshot the surface event receivers; layouts change rarely.
        let receivers: Vec<(u32, Receiver<StreamEvent>)> = {
            let layout = inner.layout.lock();
            layout
                .surfaces()
                .iter()
                .map(|s| (s.stream_id(), s.stream_events().clone()))
                .collect()
        };

        let mut select = Select::new();
        select.recv(&commands);
        for (_, receiver) in &receivers {
            select.recv(receiver);
        }

        let operation = match select.select_timeout(RENDER_WAIT_TIMEOUT) {
            Ok(operation) => operation,
            Err(_) => continue,
        };
        let index = operation.index();

        if index == 0 {
            let command = match operation.recv(&commands) {
                Ok(command) => command,
                Err(_) => break,
            };
            match command {
                RenderCommand::Stop => break 'main,
                RenderCommand::Configure {
                    caps,
                    pointer_cache_size,
                } => {
                    if caps.use_gfx {
                        gfx = Some(GfxPipeline::new(
                            Arc::clone(&inner.peer),
                            Arc::clone(&inner.codec_factory),
                        ));
                    }
                    pipeline = Some(GraphicsPipeline::new(
                        Arc::clone(&inner.peer),
                        Arc::clone(&inner.codec_factory),
                        Arc::clone(&workers),
                        caps,
                    ));
                    cursor = Some(CursorRenderer::new(
                        Arc::clone(&inner.peer),
                        pointer_cache_size,
                    ));
                }
                RenderCommand::SubmitConfig(config) => {
                    let result = inner.layout.lock().submit_config(config);
                    if result.is_err() {
                        notify_error(&inner, SessionError::CloseStackOnDriverFailure);
                        continue;
                    }
                    // A layout change invalidates the GFX output mapping.
                    if gfx.is_some() {
                        inner.flags.set(PENDING_GFX_RESET);
                    }
                    try_gfx_reset(&inner, gfx.as_mut());
                }
                RenderCommand::RecreateLayout => {
                    let result = inner.layout.lock().recreate_layout();
                    if result.is_err() {
                        notify_error(&inner, SessionError::CloseStackOnDriverFailure);
                    }
                }
                RenderCommand::GfxChannelReady => try_gfx_reset(&inner, gfx.as_mut()),
                RenderCommand::GfxFrameAck {
                    frame_id,
                    queue_depth,
                } => {
                    if let Some(gfx) = gfx.as_mut() {
                        gfx.frame_acknowledged(frame_id, queue_depth);
                    }
                }
                RenderCommand::RoundTripTime(rtt) => {
                    if let Some(gfx) = gfx.as_mut() {
                        gfx.update_round_trip_time(rtt);
                    }
                }
                RenderCommand::RefreshAll => {
                    let mut layout = inner.layout.lock();
                    for surface in layout.surfaces_mut() {
                        surface.damage_mut().invalidate();
                    }
                }
            }
        } else {
            let (stream_id, receiver) = &receivers[index - 1];
            match operation.recv(receiver) {
                Ok(event) => handle_stream_event(
                    &inner,
                    *stream_id,
                    event,
                    pipeline.as_mut(),
                    gfx.as_mut(),
                    cursor.as_mut(),
                ),
                Err(_) => {
                    // Sender gone without a Closed event.
                    inner.layout.lock().handle_stream_closed(*stream_id);
                }
            }
        }
    }

    if let Some(cursor) = cursor.as_mut() {
        cursor.clear();
    }
    debug!("graphics thread exiting");
}

/// Emit the pending graphics reset and (re)create the GFX surfaces
/// once the layout is rendering.
fn try_gfx_reset(inner: &Arc<SessionInner>, gfx: Option<&mut GfxPipeline>) {
    let Some(gfx) = gfx else {
        return;
    };
    if !inner.flags.is_set(PENDING_GFX_RESET) {
        return;
    }

    let mut layout = inner.layout.lock();
    if layout.state() != LayoutState::StartRendering {
        return;
    }
    let Some((width, height)) = layout.desktop_size() else {
        return;
    };
    let monitors = layout.monitor_rects();

    if gfx.reset_graphics(width, height, monitors).is_err() {
        return;
    }
    inner.flags.clear(PENDING_GFX_RESET);

    gfx.clear_surfaces();
    for surface in layout.surfaces_mut() {
        let (surface_width, surface_height) = surface.size();
        let (origin_x, origin_y) = surface.origin();
        match gfx.create_surface(
            surface_width,
            surface_height,
            origin_x.max(0) as u32,
            origin_y.max(0) as u32,
        ) {
            Ok(surface_id) => {
                surface.set_backing(SurfaceBacking::Gfx { surface_id });
                surface.damage_mut().invalidate();
            }
            Err(e) => {
                warn!("gfx surface allocation failed: {e}");
                notify_error(inner, SessionError::GraphicsSubsystemFailed);
                return;
            }
        }
    }
}

fn handle_stream_event(
    inner: &Arc<SessionInner>,
    stream_id: u32,
    event: StreamEvent,
    pipeline: Option<&mut GraphicsPipeline>,
    gfx: Option<&mut GfxPipeline>,
    cursor: Option<&mut CursorRenderer>,
) {
    match event {
        StreamEvent::Ready => {
            inner.layout.lock().handle_stream_ready(stream_id);
            try_gfx_reset(inner, gfx);
        }
        StreamEvent::Frame(buffer) => {
            if !inner.flags.rendering_allowed() {
                return;
            }
            let Some(pipeline) = pipeline else {
                return;
            };

            let mut layout = inner.layout.lock();
            let Some(surface) = layout
                .surfaces_mut()
                .iter_mut()
                .find(|s| s.stream_id() == stream_id)
            else {
                return;
            };

            match pipeline.submit_frame(surface, Arc::new(buffer), gfx) {
                Ok(_) => {}
                Err(e) => {
                    warn!("frame submission failed: {e}");
                    drop(layout);
                    notify_error(inner, SessionError::GraphicsSubsystemFailed);
                }
            }
        }
        StreamEvent::CursorShape {
            width,
            height,
            hotspot_x,
            hotspot_y,
            data,
        } => {
            if !inner.flags.is_set(ACTIVATED) {
                return;
            }
            if let Some(cursor) = cursor {
                let _ = cursor.handle_cursor_shape(width, height, hotspot_x, hotspot_y, &data);
            }
        }
        StreamEvent::CursorHidden => {
            if !inner.flags.is_set(ACTIVATED) {
                return;
            }
            if let Some(cursor) = cursor {
                let _ = cursor.handle_cursor_hidden();
            }
        }
        StreamEvent::Closed => {
            inner.layout.lock().handle_stream_closed(stream_id);
        }
        StreamEvent::Error(message) => {
            inner.layout.lock().handle_stream_error(stream_id, &message);
            notify_error(inner, SessionError::CloseStackOnDriverFailure);
        }
    }
}
