//! Display Control (DISP) DVC
//!
//! Advertises the monitor-layout capability once the channel is up and
//! turns client monitor-layout PDUs into validated monitor configs for
//! the layout manager. Invalid layouts are fatal for the session
//! (bad monitor data), unlike other channel-local protocol errors.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::dvc::{DvcChannel, DvcRegistry};
use crate::layout::monitor_config::MonitorConfig;
use crate::peer::pdu::MonitorLayoutPdu;
use crate::peer::{channels, OutputPdu, RdpPeer};

/// Monitor area factors advertised in the caps PDU.
pub const MAX_MONITOR_AREA_FACTOR: u32 = 8192;

/// Accepted layouts go here (the session routes them to the layout
/// manager on the graphics thread).
pub type ConfigSink = Box<dyn Fn(MonitorConfig) + Send + Sync>;

/// Invalid layouts surface through here as bad monitor data.
pub type ErrorSink = Box<dyn Fn() + Send + Sync>;

/// The display-control channel component.
pub struct DisplayControl {
    peer: Arc<dyn RdpPeer>,
    registry: Arc<DvcRegistry>,
    max_monitor_count: u32,
    on_config: ConfigSink,
    on_invalid: ErrorSink,

    channel_id: Option<u32>,
    subscription_id: Option<u32>,
    initialized: bool,
    torn_down: bool,
}

impl DisplayControl {
    pub fn new(
        peer: Arc<dyn RdpPeer>,
        registry: Arc<DvcRegistry>,
        max_monitor_count: u32,
        on_config: ConfigSink,
        on_invalid: ErrorSink,
    ) -> Self {
        DisplayControl {
            peer,
            registry,
            max_monitor_count,
            on_config,
            on_invalid,
            channel_id: None,
            subscription_id: None,
            initialized: false,
            torn_down: false,
        }
    }

    /// Handle a client monitor-layout PDU.
    pub fn handle_monitor_layout(&self, layout: &MonitorLayoutPdu) {
        match MonitorConfig::from_disp_monitor_layout(layout, self.max_monitor_count) {
            Ok(config) => {
                debug!(
                    "monitor layout accepted: {} monitors, {}x{}",
                    config.monitor_count(),
                    config.desktop_width,
                    config.desktop_height
                );
                (self.on_config)(config);
            }
            Err(e) => {
                warn!("invalid monitor layout: {e}");
                (self.on_invalid)();
            }
        }
    }
}

impl DvcChannel for DisplayControl {
    fn maybe_init(&mut self) {
        if self.initialized || self.torn_down {
            return;
        }
        self.initialized = true;

        let channel_id = match self.peer.open_dvc(channels::DISP) {
            Ok(id) => id,
            Err(e) => {
                warn!("failed to open display control channel: {e}");
                return;
            }
        };
        self.channel_id = Some(channel_id);

        let peer = Arc::clone(&self.peer);
        let max_monitor_count = self.max_monitor_count;
        let subscription_id = self.registry.subscribe_creation_status(
            channel_id,
            Box::new(move |status| {
                if status < 0 {
                    warn!("display control channel creation failed: {status}");
                    return;
                }
                let _ = peer.send(OutputPdu::DisplayControlCaps {
                    max_num_monitors: max_monitor_count,
                    max_monitor_area_factor_a: MAX_MONITOR_AREA_FACTOR,
                    max_monitor_area_factor_b: MAX_MONITOR_AREA_FACTOR,
                });
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
            let _ = self.peer.close_dvc(channel_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::pdu::DispMonitorLayout;
    use crate::session::main_loop::MainLoop;
    use crate::testing::RecordingPeer;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn monitor(left: i32, top: i32, primary: bool) -> DispMonitorLayout {
        DispMonitorLayout {
            left,
            top,
            width: 1920,
            height: 1080,
            is_primary: primary,
            physical_width: 0,
            physical_height: 0,
            orientation: 0,
            scale: 100,
        }
    }

    #[test]
    fn test_caps_sent_on_creation() {
        let main_loop = MainLoop::new();
        let registry = Arc::new(DvcRegistry::new(main_loop.handle()));
        let peer = Arc::new(RecordingPeer::default());

        let mut disp = DisplayControl::new(
            peer.clone(),
            Arc::clone(&registry),
            16,
            Box::new(|_| {}),
            Box::new(|| {}),
        );
        disp.maybe_init();
        registry.handle_creation_status(1, 0);
        std::thread::sleep(Duration::from_millis(100));

        let sent = peer.sent();
        assert!(matches!(
            sent.first(),
            Some(OutputPdu::DisplayControlCaps {
                max_num_monitors: 16,
                max_monitor_area_factor_a: 8192,
                max_monitor_area_factor_b: 8192,
            })
        ));
    }

    #[test]
    fn test_valid_layout_forwarded() {
        let main_loop = MainLoop::new();
        let registry = Arc::new(DvcRegistry::new(main_loop.handle()));
        let peer = Arc::new(RecordingPeer::default());
        let received = Arc::new(Mutex::new(None));

        let received2 = Arc::clone(&received);
        let disp = DisplayControl::new(
            peer,
            registry,
            16,
            Box::new(move |config| {
                *received2.lock() = Some(config);
            }),
            Box::new(|| panic!("layout should be valid")),
        );

        disp.handle_monitor_layout(&MonitorLayoutPdu {
            monitors: vec![monitor(0, 0, true), monitor(1920, 0, false)],
        });
        assert_eq!(received.lock().as_ref().unwrap().monitor_count(), 2);
    }

    #[test]
    fn test_monitor_count_cap_is_bad_monitor_data() {
        let main_loop = MainLoop::new();
        let registry = Arc::new(DvcRegistry::new(main_loop.handle()));
        let peer = Arc::new(RecordingPeer::default());
        let invalid = Arc::new(Mutex::new(false));

        let invalid2 = Arc::clone(&invalid);
        let disp = DisplayControl::new(
            peer,
            registry,
            1,
            Box::new(|_| panic!("layout should be invalid")),
            Box::new(move || {
                *invalid2.lock() = true;
            }),
        );

        disp.handle_monitor_layout(&MonitorLayoutPdu {
            monitors: vec![monitor(0, 0, true), monitor(1920, 0, false)],
        });
        assert!(*invalid.lock());
    }
}
