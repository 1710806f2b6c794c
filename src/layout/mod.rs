//! Layout Manager
//!
//! Keeps the set of per-monitor render surfaces and host capture
//! streams consistent with the current client monitor configuration.
//!
//! ```text
//!      AWAIT_CONFIG ──submit_config──► PREPARE_SURFACES
//!          ▲                                │
//!          │                       (create/update streams)
//!          │                                ▼
//!      START_RENDERING ◄──all streams ready── AWAIT_STREAMS
//! ```
//!
//! `FATAL_ERROR` is a sink entered on any unrecoverable capture-side
//! error; it detaches the streams and reports up as a driver failure.
//! A non-virtual capture stream closing externally arms a short
//! recreation timer that resubmits the last accepted config unless a
//! new one arrives first.

pub mod monitor_config;
pub mod surface;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::host::{CursorMode, HostError, RemoteDesktopHost};
use crate::peer::pdu::MonitorRect;
use crate::session::main_loop::MainLoopHandle;
use monitor_config::MonitorConfig;
use surface::{Surface, SurfaceMapping};

/// Delay before a lost capture stream is recreated.
pub const STREAM_RECREATION_DELAY: Duration = Duration::from_millis(50);

/// Layout manager states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayoutState {
    #[default]
    AwaitConfig,
    PrepareSurfaces,
    AwaitStreams,
    StartRendering,
    FatalError,
}

/// Layout manager errors; surface/stream failures are fatal for the
/// session stack.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("surface preparation failed: {0}")]
    SurfacePreparation(#[from] HostError),

    #[error("layout manager is in the fatal error state")]
    FatalState,
}

/// Result alias for layout operations.
pub type Result<T> = std::result::Result<T, LayoutError>;

/// Pinged on the session main loop when the recreation timer fires;
/// the graphics loop then resubmits the last accepted config.
pub type RecreateNotify = Arc<dyn Fn() + Send + Sync>;

/// The per-session layout manager. Lives on the graphics thread.
pub struct LayoutManager {
    host: Arc<dyn RemoteDesktopHost>,
    main_loop: MainLoopHandle,
    recreate_notify: RecreateNotify,
    cursor_mode: CursorMode,

    state: LayoutState,
    surfaces: Vec<Surface>,
    current_config: Option<MonitorConfig>,
    next_stream_id: u32,
    recreation_timer: Option<u64>,
}

impl LayoutManager {
    pub fn new(
        host: Arc<dyn RemoteDesktopHost>,
        main_loop: MainLoopHandle,
        recreate_notify: RecreateNotify,
        cursor_mode: CursorMode,
    ) -> Self {
        LayoutManager {
            host,
            main_loop,
            recreate_notify,
            cursor_mode,
            state: LayoutState::AwaitConfig,
            surfaces: Vec::new(),
            current_config: None,
            next_stream_id: 0,
            recreation_timer: None,
        }
    }

    pub fn state(&self) -> LayoutState {
        self.state
    }

    /// The last accepted monitor configuration.
    pub fn current_config(&self) -> Option<&MonitorConfig> {
        self.current_config.as_ref()
    }

    /// Apply a validated monitor configuration: dispose surplus
    /// surfaces, update retained ones, create streams for new ones.
    pub fn submit_config(&mut self, config: MonitorConfig) -> Result<()> {
        if self.state == LayoutState::FatalError {
            return Err(LayoutError::FatalState);
        }

        self.cancel_recreation_timer();
        self.state = LayoutState::PrepareSurfaces;
        info!(
            "submitting monitor config: {} monitors ({})",
            config.monitor_count(),
            if config.is_virtual { "extended" } else { "mirror" }
        );

        if config.is_virtual {
            if let Err(e) = self.host.submit_new_monitor_config(&config) {
                self.enter_fatal_error();
                return Err(LayoutError::SurfacePreparation(e));
            }
        }

        if let Err(e) = self.prepare_surfaces(&config) {
            self.enter_fatal_error();
            return Err(e);
        }

        self.current_config = Some(config);
        self.state = LayoutState::AwaitStreams;
        self.maybe_start_rendering();
        Ok(())
    }

    fn prepare_surfaces(&mut self, config: &MonitorConfig) -> Result<()> {
        let mappings = surface_mappings(config);

        // Dispose surfaces exceeding the new monitor count.
        while self.surfaces.len() > mappings.len() {
            let surface = self.surfaces.pop().expect("length checked");
            debug!("disposing surface for stream {}", surface.stream_id());
            drop(surface);
        }

        for (index, (mapping, origin_x, origin_y, width, height)) in
            mappings.into_iter().enumerate()
        {
            if index < self.surfaces.len() {
                let surface = &mut self.surfaces[index];
                let unchanged = surface.mapping() == &mapping
                    && surface.origin() == (origin_x, origin_y)
                    && surface.size() == (width, height);
                if unchanged {
                    continue;
                }

                let resized = surface.size() != (width, height);
                surface.remap(mapping, origin_x, origin_y, width, height);
                if resized && surface.has_stream() {
                    if let Some(stream) = surface.stream() {
                        stream
                            .update_params(width, height)
                            .map_err(LayoutError::SurfacePreparation)?;
                    }
                    // The stream stays attached; it re-negotiates and
                    // reports ready again.
                } else if !surface.has_stream() {
                    self.create_stream(index)?;
                }
            } else {
                let stream_id = self.next_stream_id;
                self.next_stream_id += 1;

                self.surfaces.push(Surface::new(
                    stream_id,
                    mapping,
                    origin_x,
                    origin_y,
                    width,
                    height,
                ));
                let index = self.surfaces.len() - 1;
                self.create_stream(index)?;
            }
        }

        Ok(())
    }

    /// Register a stream owner with the host and begin recording.
    fn create_stream(&mut self, index: usize) -> Result<()> {
        let surface = &mut self.surfaces[index];
        let stream_id = surface.stream_id();
        let sender = surface.event_sender();

        let stream = match surface.mapping().clone() {
            SurfaceMapping::Connector(connector) => self
                .host
                .record_monitor(stream_id, &connector, self.cursor_mode, sender),
            SurfaceMapping::Virtual(monitor) => {
                self.host
                    .record_virtual(stream_id, &monitor, self.cursor_mode, sender)
            }
        }
        .map_err(LayoutError::SurfacePreparation)?;

        debug!("created capture stream {}", stream_id);
        surface.attach_stream(stream);
        Ok(())
    }

    /// A stream finished negotiation.
    pub fn handle_stream_ready(&mut self, stream_id: u32) {
        if let Some(surface) = self
            .surfaces
            .iter_mut()
            .find(|s| s.stream_id() == stream_id)
        {
            surface.mark_stream_ready();
        }
        self.maybe_start_rendering();
    }

    fn maybe_start_rendering(&mut self) {
        if self.state != LayoutState::AwaitStreams {
            return;
        }
        if self.surfaces.iter().all(|s| s.is_stream_ready()) {
            info!("all {} streams ready, rendering", self.surfaces.len());
            self.state = LayoutState::StartRendering;
        }
    }

    /// A capture stream closed on the host side.
    pub fn handle_stream_closed(&mut self, stream_id: u32) {
        if self.state == LayoutState::FatalError {
            return;
        }

        if let Some(surface) = self
            .surfaces
            .iter_mut()
            .find(|s| s.stream_id() == stream_id)
        {
            surface.detach_stream();
        }

        let is_virtual = self
            .current_config
            .as_ref()
            .map(|c| c.is_virtual)
            .unwrap_or(false);
        let config_in_flight = self.state != LayoutState::StartRendering;

        // A virtual stream closing while a config change is in flight
        // is expected; the pending config drives the recreation.
        if is_virtual && config_in_flight {
            debug!("virtual stream {} closed during config change", stream_id);
            return;
        }

        self.schedule_recreation();
    }

    /// An unrecoverable capture-side error.
    pub fn handle_stream_error(&mut self, stream_id: u32, message: &str) {
        warn!("stream {} failed: {}", stream_id, message);
        self.enter_fatal_error();
    }

    fn enter_fatal_error(&mut self) {
        self.cancel_recreation_timer();
        for surface in &mut self.surfaces {
            surface.detach_stream();
        }
        self.state = LayoutState::FatalError;
    }

    fn schedule_recreation(&mut self) {
        if self.recreation_timer.is_some() || self.current_config.is_none() {
            return;
        }
        debug!("arming layout recreation timer");
        let notify = Arc::clone(&self.recreate_notify);
        let timer = self
            .main_loop
            .add_timeout(STREAM_RECREATION_DELAY, move || notify());
        self.recreation_timer = Some(timer);
    }

    fn cancel_recreation_timer(&mut self) {
        if let Some(timer) = self.recreation_timer.take() {
            self.main_loop.cancel_timeout(timer);
        }
    }

    /// Resubmit the last accepted config (recreation timer fired).
    pub fn recreate_layout(&mut self) -> Result<()> {
        self.recreation_timer = None;
        let Some(config) = self.current_config.clone() else {
            return Ok(());
        };
        info!("recreating layout after stream loss");
        self.submit_config(config)
    }

    /// Map a client desktop position to the owning surface's stream and
    /// stream-local coordinates. `None` means no surface owns the
    /// point; callers must not inject that event.
    pub fn transform_position(&self, x: i32, y: i32) -> Option<(u32, f64, f64)> {
        for surface in &self.surfaces {
            if surface.contains(x, y) {
                let (origin_x, origin_y) = surface.origin();
                return Some((
                    surface.stream_id(),
                    (x - origin_x) as f64,
                    (y - origin_y) as f64,
                ));
            }
        }
        None
    }

    /// Monitor definitions for ResetGraphics, origins translated into
    /// non-negative desktop coordinates.
    pub fn monitor_rects(&self) -> Vec<MonitorRect> {
        let Some(config) = &self.current_config else {
            return Vec::new();
        };
        config
            .virtual_monitors
            .iter()
            .map(|monitor| {
                let left = monitor.pos_x - config.layout_offset_x;
                let top = monitor.pos_y - config.layout_offset_y;
                MonitorRect {
                    left,
                    top,
                    right: left + monitor.width as i32 - 1,
                    bottom: top + monitor.height as i32 - 1,
                    is_primary: monitor.is_primary,
                }
            })
            .collect()
    }

    /// Desktop bounding-box size of the current config.
    pub fn desktop_size(&self) -> Option<(u32, u32)> {
        self.current_config
            .as_ref()
            .map(|c| (c.desktop_width, c.desktop_height))
    }

    pub fn surfaces(&self) -> &[Surface] {
        &self.surfaces
    }

    pub fn surfaces_mut(&mut self) -> &mut [Surface] {
        &mut self.surfaces
    }

    /// Detach every stream and drop all surfaces (teardown).
    pub fn dispose(&mut self) {
        self.cancel_recreation_timer();
        self.surfaces.clear();
        self.state = LayoutState::AwaitConfig;
    }
}

/// Flatten a config into per-surface mappings with translated origins.
fn surface_mappings(config: &MonitorConfig) -> Vec<(SurfaceMapping, i32, i32, u32, u32)> {
    if config.is_virtual {
        config
            .virtual_monitors
            .iter()
            .map(|monitor| {
                (
                    SurfaceMapping::Virtual(*monitor),
                    monitor.pos_x - config.layout_offset_x,
                    monitor.pos_y - config.layout_offset_y,
                    monitor.width,
                    monitor.height,
                )
            })
            .collect()
    } else {
        config
            .connectors
            .iter()
            .map(|connector| (SurfaceMapping::Connector(connector.clone()), 0, 0, 0, 0))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::pdu::{ClientCapabilities, DispMonitorLayout, MonitorLayoutPdu};
    use crate::session::main_loop::MainLoop;
    use crate::testing::RecordingHost;

    fn manager(host: Arc<RecordingHost>) -> (MainLoop, LayoutManager) {
        let main_loop = MainLoop::new();
        let manager = LayoutManager::new(
            host,
            main_loop.handle(),
            Arc::new(|| {}),
            CursorMode::Metadata,
        );
        (main_loop, manager)
    }

    fn single_monitor_config() -> MonitorConfig {
        let caps = ClientCapabilities {
            desktop_width: 1920,
            desktop_height: 1080,
            ..Default::default()
        };
        MonitorConfig::from_client_data(&caps, 16).unwrap()
    }

    fn three_monitor_config() -> MonitorConfig {
        let layout = MonitorLayoutPdu {
            monitors: vec![
                DispMonitorLayout {
                    left: 0,
                    top: 0,
                    width: 1920,
                    height: 1080,
                    is_primary: true,
                    physical_width: 0,
                    physical_height: 0,
                    orientation: 0,
                    scale: 100,
                },
                DispMonitorLayout {
                    left: 1920,
                    top: 0,
                    width: 1280,
                    height: 1024,
                    is_primary: false,
                    physical_width: 0,
                    physical_height: 0,
                    orientation: 0,
                    scale: 100,
                },
                DispMonitorLayout {
                    left: -1280,
                    top: 0,
                    width: 1280,
                    height: 1024,
                    is_primary: false,
                    physical_width: 0,
                    physical_height: 0,
                    orientation: 0,
                    scale: 100,
                },
            ],
        };
        MonitorConfig::from_disp_monitor_layout(&layout, 16).unwrap()
    }

    #[test]
    fn test_submit_config_creates_surfaces_and_streams() {
        let host = Arc::new(RecordingHost::new());
        let (_main_loop, mut manager) = manager(host.clone());

        manager.submit_config(single_monitor_config()).unwrap();
        assert_eq!(manager.state(), LayoutState::AwaitStreams);
        assert_eq!(manager.surfaces().len(), 1);

        manager.handle_stream_ready(0);
        assert_eq!(manager.state(), LayoutState::StartRendering);
    }

    #[test]
    fn test_three_monitor_layout_translation() {
        let host = Arc::new(RecordingHost::new());
        let (_main_loop, mut manager) = manager(host);

        manager.submit_config(three_monitor_config()).unwrap();
        assert_eq!(manager.desktop_size(), Some((4480, 1080)));

        let rects = manager.monitor_rects();
        assert_eq!(rects.len(), 3);
        assert_eq!((rects[0].left, rects[0].top), (1280, 0));
        assert!(rects[0].is_primary);
        assert_eq!((rects[1].left, rects[1].top), (3200, 0));
        assert_eq!((rects[2].left, rects[2].top), (0, 0));
    }

    #[test]
    fn test_position_transform() {
        let host = Arc::new(RecordingHost::new());
        let (_main_loop, mut manager) = manager(host);
        manager.submit_config(three_monitor_config()).unwrap();

        // Inside the primary (translated origin 1280).
        let (stream_id, x, y) = manager.transform_position(1290, 50).unwrap();
        assert_eq!(stream_id, 0);
        assert_eq!((x, y), (10.0, 50.0));

        // Inside the left monitor.
        let (stream_id, x, y) = manager.transform_position(10, 20).unwrap();
        assert_eq!(stream_id, 2);
        assert_eq!((x, y), (10.0, 20.0));

        // Below the shorter monitors: owned by nobody.
        assert!(manager.transform_position(10, 1050).is_none());
    }

    #[test]
    fn test_layout_change_disposes_surplus_surfaces() {
        let host = Arc::new(RecordingHost::new());
        let (_main_loop, mut manager) = manager(host);

        manager.submit_config(three_monitor_config()).unwrap();
        assert_eq!(manager.surfaces().len(), 3);

        manager.submit_config(single_monitor_config()).unwrap();
        assert_eq!(manager.surfaces().len(), 1);
    }

    #[test]
    fn test_stream_loss_schedules_recreation() {
        let host = Arc::new(RecordingHost::new());
        let main_loop = MainLoop::new();
        let (notify_tx, notify_rx) = crossbeam_channel::bounded(1);
        let mut manager = LayoutManager::new(
            host,
            main_loop.handle(),
            Arc::new(move || {
                let _ = notify_tx.send(());
            }),
            CursorMode::Metadata,
        );

        let mut config = single_monitor_config();
        config.is_virtual = false;
        config.connectors = vec!["DP-1".into()];
        config.virtual_monitors.clear();
        manager.submit_config(config).unwrap();
        manager.handle_stream_ready(0);
        assert_eq!(manager.state(), LayoutState::StartRendering);

        manager.handle_stream_closed(0);
        notify_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("recreation timer should fire");
    }

    #[test]
    fn test_virtual_stream_loss_during_config_change_ignored() {
        let host = Arc::new(RecordingHost::new());
        let main_loop = MainLoop::new();
        let (notify_tx, notify_rx) = crossbeam_channel::bounded(1);
        let mut manager = LayoutManager::new(
            host,
            main_loop.handle(),
            Arc::new(move || {
                let _ = notify_tx.send(());
            }),
            CursorMode::Metadata,
        );

        manager.submit_config(single_monitor_config()).unwrap();
        // Streams not ready yet: a config change is in flight.
        manager.handle_stream_closed(0);
        assert!(notify_rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_fatal_error_rejects_configs() {
        let host = Arc::new(RecordingHost::new());
        let (_main_loop, mut manager) = manager(host);

        manager.submit_config(single_monitor_config()).unwrap();
        manager.handle_stream_error(0, "capture backend died");
        assert_eq!(manager.state(), LayoutState::FatalError);

        assert!(matches!(
            manager.submit_config(single_monitor_config()),
            Err(LayoutError::FatalState)
        ));
    }
}
