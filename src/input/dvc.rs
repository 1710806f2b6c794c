//! Input (RDPEI) DVC Lifecycle
//!
//! The touch channel itself: opened once per connect and torn down
//! with the session. Touch frames arrive as decoded peer events; this
//! component only owns the channel id and its creation status, and
//! remembers whether the client ever brought the channel up so stray
//! touch frames on a failed channel can be dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::dvc::{DvcChannel, DvcRegistry};
use crate::peer::{channels, RdpPeer};

/// The RDPEI channel component.
pub struct InputDvc {
    peer: Arc<dyn RdpPeer>,
    registry: Arc<DvcRegistry>,
    ready: Arc<AtomicBool>,

    channel_id: Option<u32>,
    subscription_id: Option<u32>,
    initialized: bool,
    torn_down: bool,
}

impl InputDvc {
    pub fn new(peer: Arc<dyn RdpPeer>, registry: Arc<DvcRegistry>) -> Self {
        InputDvc {
            peer,
            registry,
            ready: Arc::new(AtomicBool::new(false)),
            channel_id: None,
            subscription_id: None,
            initialized: false,
            torn_down: false,
        }
    }

    /// Whether the client confirmed the touch channel.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

impl DvcChannel for InputDvc {
    fn maybe_init(&mut self) {
        if self.initialized || self.torn_down {
            return;
        }
        self.initialized = true;

        let channel_id = match self.peer.open_dvc(channels::INPUT) {
            Ok(id) => id,
            Err(e) => {
                warn!("failed to open input channel: {e}");
                return;
            }
        };
        self.channel_id = Some(channel_id);

        let ready = Arc::clone(&self.ready);
        let subscription_id = self.registry.subscribe_creation_status(
            channel_id,
            Box::new(move |status| {
                if status < 0 {
                    warn!("input channel creation failed: {status}");
                    return;
                }
                debug!("input channel ready");
                ready.store(true, Ordering::Release);
            }),
        );
        self.subscription_id = Some(subscription_id);
    }

    fn queue_channel_tear_down(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.ready.store(false, Ordering::Release);

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
    fn test_ready_after_creation_status() {
        let main_loop = MainLoop::new();
        let registry = Arc::new(DvcRegistry::new(main_loop.handle()));
        let peer = Arc::new(RecordingPeer::default());

        let mut input = InputDvc::new(peer.clone(), Arc::clone(&registry));
        input.maybe_init();
        assert!(!input.is_ready());

        registry.handle_creation_status(1, 0);
        std::thread::sleep(Duration::from_millis(100));
        assert!(input.is_ready());

        input.queue_channel_tear_down();
        assert!(!input.is_ready());
        assert_eq!(peer.closed_dvcs(), vec![1]);
    }
}
