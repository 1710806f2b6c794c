//! Bounded Tile-Compression Worker Pool
//!
//! Short-lived NSC and raw tile compression jobs run on a pool sized to
//! the host processor count. Jobs are plain closures; completion is
//! signaled through whatever channel the job captures.

use std::thread;

use crossbeam_channel::{unbounded, Sender};
use tracing::trace;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size worker pool for tile compression.
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Pool with an explicit worker count (`>= 1`).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx) = unbounded::<Job>();

        let workers = (0..size)
            .map(|i| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("tile-worker-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                        trace!("tile worker {} exiting", i);
                    })
                    .expect("spawn tile worker")
            })
            .collect();

        WorkerPool {
            tx: Some(tx),
            workers,
        }
    }

    /// Pool sized to the host processor count.
    pub fn sized_to_host() -> Self {
        let size = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(size)
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue a job. Jobs run in submission order per worker but without
    /// cross-worker ordering.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Box::new(job));
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel drains the queue and stops the workers.
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
