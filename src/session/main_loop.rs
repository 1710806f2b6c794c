//! Session Main Loop
//!
//! A single-threaded dispatcher for deferred work and timers. Deferred
//! DVC notifications, clipboard timeouts, the layout recreation timer
//! and the idempotent session close all run here, so their callbacks
//! never race each other.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use tracing::trace;

type Callback = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Invoke(Callback),
    AddTimeout {
        id: u64,
        deadline: Instant,
        callback: Callback,
    },
    CancelTimeout(u64),
    Quit,
}

/// Cloneable handle for queueing work onto the main loop.
#[derive(Clone)]
pub struct MainLoopHandle {
    tx: Sender<Command>,
    next_timer_id: Arc<AtomicU64>,
}

impl MainLoopHandle {
    /// Queue a closure to run on the main loop thread.
    pub fn invoke<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.tx.send(Command::Invoke(Box::new(callback)));
    }

    /// Schedule a one-shot timeout. Returns an id for cancellation.
    pub fn add_timeout<F>(&self, delay: Duration, callback: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(Command::AddTimeout {
            id,
            deadline: Instant::now() + delay,
            callback: Box::new(callback),
        });
        id
    }

    /// Cancel a pending timeout. A no-op when it already fired.
    pub fn cancel_timeout(&self, id: u64) {
        let _ = self.tx.send(Command::CancelTimeout(id));
    }
}

/// The main loop thread and its handle.
pub struct MainLoop {
    handle: MainLoopHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl MainLoop {
    pub fn new() -> Self {
        let (tx, rx) = unbounded::<Command>();
        let thread = thread::Builder::new()
            .name("session-main-loop".into())
            .spawn(move || {
                // Timers keyed by (deadline, id) so BTreeMap iteration
                // order is firing order.
                let mut timers: BTreeMap<(Instant, u64), Callback> = BTreeMap::new();

                loop {
                    let now = Instant::now();

                    // Fire everything due.
                    while let Some((&(deadline, id), _)) = timers.iter().next() {
                        if deadline > now {
                            break;
                        }
                        if let Some(callback) = timers.remove(&(deadline, id)) {
                            trace!("firing timer {}", id);
                            callback();
                        }
                    }

                    let command = match timers.keys().next() {
                        Some(&(deadline, _)) => {
                            let timeout = deadline.saturating_duration_since(Instant::now());
                            match rx.recv_timeout(timeout) {
                                Ok(command) => command,
                                Err(RecvTimeoutError::Timeout) => continue,
                                Err(RecvTimeoutError::Disconnected) => return,
                            }
                        }
                        None => match rx.recv() {
                            Ok(command) => command,
                            Err(_) => return,
                        },
                    };

                    match command {
                        Command::Invoke(callback) => callback(),
                        Command::AddTimeout {
                            id,
                            deadline,
                            callback,
                        } => {
                            timers.insert((deadline, id), callback);
                        }
                        Command::CancelTimeout(id) => {
                            timers.retain(|&(_, timer_id), _| timer_id != id);
                        }
                        Command::Quit => return,
                    }
                }
            })
            .expect("spawn main loop thread");

        MainLoop {
            handle: MainLoopHandle {
                tx,
                next_timer_id: Arc::new(AtomicU64::new(1)),
            },
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> MainLoopHandle {
        self.handle.clone()
    }
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MainLoop {
    fn drop(&mut self) {
        let _ = self.handle.tx.send(Command::Quit);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_invoke_runs_on_loop() {
        let main_loop = MainLoop::new();
        let (tx, rx) = bounded(1);

        main_loop.handle().invoke(move || {
            let _ = tx.send(thread::current().name().map(String::from));
        });

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("session-main-loop"));
    }

    #[test]
    fn test_timeout_fires() {
        let main_loop = MainLoop::new();
        let (tx, rx) = bounded(1);

        let started = Instant::now();
        main_loop
            .handle()
            .add_timeout(Duration::from_millis(30), move || {
                let _ = tx.send(());
            });

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_cancel_timeout() {
        let main_loop = MainLoop::new();
        let (tx, rx) = bounded(1);

        let handle = main_loop.handle();
        let id = handle.add_timeout(Duration::from_millis(100), move || {
            let _ = tx.send(());
        });
        // Give the add command time to land, then cancel.
        thread::sleep(Duration::from_millis(20));
        handle.cancel_timeout(id);

        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn test_timers_fire_in_order() {
        let main_loop = MainLoop::new();
        let (tx, rx) = bounded(2);

        let handle = main_loop.handle();
        let tx2 = tx.clone();
        handle.add_timeout(Duration::from_millis(60), move || {
            let _ = tx2.send(2);
        });
        handle.add_timeout(Duration::from_millis(20), move || {
            let _ = tx.send(1);
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
    }
}
