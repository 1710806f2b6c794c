//! Telemetry DVC
//!
//! Minimal telemetry channel: opened once per connect, reports the
//! time from connection start to credential prompt, and tears itself
//! down on protocol failure without touching the session.

use std::sync::Arc;
use std::time::Instant;

use tracing::warn;

use crate::dvc::{DvcChannel, DvcRegistry};
use crate::peer::{channels, OutputPdu, RdpPeer};

/// The telemetry channel component.
pub struct TelemetryDvc {
    peer: Arc<dyn RdpPeer>,
    registry: Arc<DvcRegistry>,
    connect_started: Instant,

    channel_id: Option<u32>,
    subscription_id: Option<u32>,
    initialized: bool,
    torn_down: bool,
}

impl TelemetryDvc {
    pub fn new(peer: Arc<dyn RdpPeer>, registry: Arc<DvcRegistry>, connect_started: Instant) -> Self {
        TelemetryDvc {
            peer,
            registry,
            connect_started,
            channel_id: None,
            subscription_id: None,
            initialized: false,
            torn_down: false,
        }
    }

}

impl DvcChannel for TelemetryDvc {
    fn maybe_init(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;

        let channel_id = match self.peer.open_dvc(channels::TELEMETRY) {
            Ok(id) => id,
            Err(e) => {
                warn!("failed to open telemetry channel: {e}");
                return;
            }
        };
        self.channel_id = Some(channel_id);

        let peer = Arc::clone(&self.peer);
        let connect_started = self.connect_started;
        let subscription_id = self.registry.subscribe_creation_status(
            channel_id,
            Box::new(move |status| {
                if status < 0 {
                    warn!("telemetry channel creation failed: {status}");
                    return;
                }
                let elapsed = connect_started.elapsed();
                let _ = peer.send(OutputPdu::Telemetry {
                    prompt_for_credentials_millis: elapsed.as_millis() as u64,
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
    use crate::session::main_loop::MainLoop;
    use crate::testing::RecordingPeer;
    use std::time::Duration;

    #[test]
    fn test_init_opens_channel_and_reports_on_success() {
        let main_loop = MainLoop::new();
        let registry = Arc::new(DvcRegistry::new(main_loop.handle()));
        let peer = Arc::new(RecordingPeer::default());

        let mut telemetry =
            TelemetryDvc::new(peer.clone(), Arc::clone(&registry), Instant::now());
        telemetry.maybe_init();
        telemetry.maybe_init(); // once per connect

        assert_eq!(peer.opened_dvcs(), vec![channels::TELEMETRY]);

        let channel_id = 1;
        registry.handle_creation_status(channel_id, 0);
        std::thread::sleep(Duration::from_millis(100));

        let sent = peer.sent();
        assert!(matches!(sent.first(), Some(OutputPdu::Telemetry { .. })));
    }

    #[test]
    fn test_tear_down_idempotent() {
        let main_loop = MainLoop::new();
        let registry = Arc::new(DvcRegistry::new(main_loop.handle()));
        let peer = Arc::new(RecordingPeer::default());

        let mut telemetry =
            TelemetryDvc::new(peer.clone(), Arc::clone(&registry), Instant::now());
        telemetry.maybe_init();
        telemetry.queue_channel_tear_down();
        telemetry.queue_channel_tear_down();

        assert_eq!(peer.closed_dvcs(), vec![1]);
    }
}
