//! Dynamic Virtual Channel Registry
//!
//! Multiplexes channel-id assignment and creation-status callbacks to
//! subscribing subcomponents. The peer library may report a channel's
//! creation status before the subscriber attaches (some channels
//! complete fast); both arrival orders insert into the table, and
//! completion is reported through the session main loop so every
//! callback runs single-threaded.
//!
//! Contract: each subscriber is notified at most once per connect.

pub mod telemetry;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::session::main_loop::MainLoopHandle;

/// Creation-status callback, invoked once on the session main loop.
pub type CreationStatusCallback = Box<dyn FnOnce(i32) + Send + 'static>;

/// The small interface every DVC-backed subcomponent implements.
pub trait DvcChannel: Send {
    /// Open the channel and subscribe to its creation status. Called
    /// exactly once per connect, after DRDYNVC reports READY.
    fn maybe_init(&mut self);

    /// Tear down only this channel; the session lives on. Idempotent.
    fn queue_channel_tear_down(&mut self);
}

struct DvcSubscription {
    notified: bool,
    callback: Option<CreationStatusCallback>,
}

struct DvcNotification {
    creation_status: i32,
    pending_status: bool,
    subscriptions: HashMap<u32, DvcSubscription>,
    next_subscription_id: u32,
}

impl DvcNotification {
    fn new() -> Self {
        DvcNotification {
            creation_status: 0,
            pending_status: true,
            subscriptions: HashMap::new(),
            next_subscription_id: 0,
        }
    }

    fn add_subscription(&mut self, subscription: DvcSubscription) -> u32 {
        let mut subscription_id = self.next_subscription_id;
        while self.subscriptions.contains_key(&subscription_id) {
            subscription_id += 1;
        }
        self.next_subscription_id = subscription_id + 1;
        self.subscriptions.insert(subscription_id, subscription);
        subscription_id
    }
}

/// The per-session registry: channel id → status and subscriptions.
pub struct DvcRegistry {
    table: Arc<Mutex<HashMap<u32, DvcNotification>>>,
    main_loop: MainLoopHandle,
}

impl DvcRegistry {
    pub fn new(main_loop: MainLoopHandle) -> Self {
        DvcRegistry {
            table: Arc::new(Mutex::new(HashMap::new())),
            main_loop,
        }
    }

    /// Subscribe to a channel's creation status. If the status is
    /// already known, the notification is scheduled immediately.
    pub fn subscribe_creation_status(
        &self,
        channel_id: u32,
        callback: CreationStatusCallback,
    ) -> u32 {
        let subscription = DvcSubscription {
            notified: false,
            callback: Some(callback),
        };

        let mut pending_notification = false;
        let subscription_id = {
            let mut table = self.table.lock();
            let notification = table.entry(channel_id).or_insert_with(DvcNotification::new);
            let subscription_id = notification.add_subscription(subscription);
            if !notification.pending_status {
                pending_notification = true;
            }
            subscription_id
        };

        if pending_notification {
            self.schedule_notifications();
        }
        subscription_id
    }

    /// Remove a subscription. Never cancels the underlying channel; an
    /// unknown channel id is a no-op so teardown stays idempotent.
    pub fn unsubscribe_creation_status(&self, channel_id: u32, subscription_id: u32) {
        let mut table = self.table.lock();
        match table.get_mut(&channel_id) {
            Some(notification) => {
                notification.subscriptions.remove(&subscription_id);
            }
            None => {
                debug!("unsubscribe for unknown dvc channel {}", channel_id);
            }
        }
    }

    /// Creation-status callback from the peer library. May run before
    /// or after the subscriber attached.
    pub fn handle_creation_status(&self, channel_id: u32, creation_status: i32) {
        debug!(
            "dvc channel id {} creation status: {}",
            channel_id, creation_status
        );

        let mut pending_notification = false;
        {
            let mut table = self.table.lock();
            match table.get_mut(&channel_id) {
                Some(notification) => {
                    if notification.pending_status {
                        notification.creation_status = creation_status;
                        notification.pending_status = false;
                        if !notification.subscriptions.is_empty() {
                            pending_notification = true;
                        }
                    } else {
                        warn!(
                            "status of dvc channel {} already known, discarding result",
                            channel_id
                        );
                    }
                }
                None => {
                    let mut notification = DvcNotification::new();
                    notification.creation_status = creation_status;
                    notification.pending_status = false;
                    table.insert(channel_id, notification);
                }
            }
        }

        if pending_notification {
            self.schedule_notifications();
        }
    }

    /// Drop all channel state (connect teardown).
    pub fn clear(&self) {
        self.table.lock().clear();
    }

    /// Queue the notification pass onto the session main loop.
    fn schedule_notifications(&self) {
        let table = Arc::clone(&self.table);
        self.main_loop.invoke(move || {
            // Collect due callbacks under the lock, run them outside it
            // (a callback may subscribe or unsubscribe).
            let mut due: Vec<(CreationStatusCallback, i32)> = Vec::new();
            {
                let mut table = table.lock();
                for notification in table.values_mut() {
                    if notification.pending_status {
                        continue;
                    }
                    let creation_status = notification.creation_status;
                    for subscription in notification.subscriptions.values_mut() {
                        if subscription.notified {
                            continue;
                        }
                        subscription.notified = true;
                        if let Some(callback) = subscription.callback.take() {
                            due.push((callback, creation_status));
                        }
                    }
                }
            }
            for (callback, creation_status) in due {
                callback(creation_status);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::main_loop::MainLoop;
    use crossbeam_channel::bounded;
    use std::time::Duration;

    fn registry() -> (MainLoop, DvcRegistry) {
        let main_loop = MainLoop::new();
        let registry = DvcRegistry::new(main_loop.handle());
        (main_loop, registry)
    }

    #[test]
    fn test_subscribe_then_status() {
        let (_main_loop, registry) = registry();
        let (tx, rx) = bounded(1);

        registry.subscribe_creation_status(
            7,
            Box::new(move |status| {
                let _ = tx.send(status);
            }),
        );
        registry.handle_creation_status(7, 0);

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
    }

    #[test]
    fn test_status_then_subscribe() {
        let (_main_loop, registry) = registry();
        let (tx, rx) = bounded(1);

        registry.handle_creation_status(9, -1);
        registry.subscribe_creation_status(
            9,
            Box::new(move |status| {
                let _ = tx.send(status);
            }),
        );

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), -1);
    }

    #[test]
    fn test_notified_at_most_once() {
        let (_main_loop, registry) = registry();
        let (tx, rx) = bounded(4);

        registry.subscribe_creation_status(
            3,
            Box::new(move |status| {
                let _ = tx.send(status);
            }),
        );
        registry.handle_creation_status(3, 0);
        // A duplicate status report is discarded.
        registry.handle_creation_status(3, 1);

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_unsubscribe_before_status() {
        let (_main_loop, registry) = registry();
        let (tx, rx) = bounded(1);

        let sub_id = registry.subscribe_creation_status(
            4,
            Box::new(move |status| {
                let _ = tx.send(status);
            }),
        );
        registry.unsubscribe_creation_status(4, sub_id);
        registry.handle_creation_status(4, 0);

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_unsubscribe_unknown_channel_is_noop() {
        let (_main_loop, registry) = registry();
        registry.unsubscribe_creation_status(999, 0);
    }

    #[test]
    fn test_subscription_ids_monotone_per_channel() {
        let (_main_loop, registry) = registry();
        let a = registry.subscribe_creation_status(5, Box::new(|_| {}));
        let b = registry.subscribe_creation_status(5, Box::new(|_| {}));
        assert!(b > a);
    }

    #[test]
    fn test_multiple_subscribers_all_notified() {
        let (_main_loop, registry) = registry();
        let (tx, rx) = bounded(2);
        let tx2 = tx.clone();

        registry.subscribe_creation_status(
            6,
            Box::new(move |status| {
                let _ = tx.send(status);
            }),
        );
        registry.subscribe_creation_status(
            6,
            Box::new(move |status| {
                let _ = tx2.send(status);
            }),
        );
        registry.handle_creation_status(6, 0);

        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
