//! Encode Sessions
//!
//! One [`EncodeSession`] per surface and codec. The session owns a
//! bounded set of source-surface slots, a pair of encode-stream
//! buffers, and a queue of pending encode tasks keyed by image view.
//! The encode main loop runs on a dedicated thread; requesters suspend
//! in [`EncodeSession::lock_bitstream`] until their view's bitstream is
//! ready.
//!
//! Lock order inside this module: `pending_encodes` before
//! `bitstreams`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::graphics::codec::{CodecError, FrameCodec, ImageView};
use crate::graphics::damage::DamageRegion;

/// Source-surface slots per encode session.
pub const SOURCE_SLOT_COUNT: usize = 4;

/// Encode-stream buffers per encode session.
pub const STREAM_BUFFER_COUNT: usize = 2;

/// Encode session errors.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// All source slots hold pending views.
    #[error("encode session source slots exhausted")]
    SourceSlotsExhausted,

    /// The session was stopped while a caller waited.
    #[error("encode session stopped")]
    Stopped,

    /// The codec collaborator failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Result alias for encode operations.
pub type Result<T> = std::result::Result<T, EncodeError>;

/// A locked, ready-to-submit codec bitstream. Must be returned through
/// [`EncodeSession::unlock_bitstream`] to free its stream buffer.
#[derive(Debug)]
pub struct Bitstream {
    view_id: u64,
    data: Bytes,
}

impl Bitstream {
    pub fn view_id(&self) -> u64 {
        self.view_id
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

struct PendingEncode {
    view: ImageView,
    regions: Vec<DamageRegion>,
}

#[derive(Default)]
struct BitstreamTable {
    /// Completed encodes keyed by view id, until locked by a caller.
    ready: HashMap<u64, std::result::Result<Bytes, CodecError>>,
    /// Free encode-stream buffers.
    free_streams: usize,
}

struct Shared {
    pending_encodes: Mutex<VecDeque<PendingEncode>>,
    bitstreams: Mutex<BitstreamTable>,
    /// Signaled when a bitstream becomes ready or a stream buffer is
    /// returned.
    bitstream_cond: Condvar,
    stopped: AtomicBool,
}

/// Per-surface, per-codec encoder with its own encode thread.
pub struct EncodeSession {
    shared: Arc<Shared>,
    task_tx: Option<Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EncodeSession {
    /// Spawn the encode main loop over the given codec context.
    pub fn new(codec: Box<dyn FrameCodec>, surface_label: u32) -> Self {
        let shared = Arc::new(Shared {
            pending_encodes: Mutex::new(VecDeque::with_capacity(SOURCE_SLOT_COUNT)),
            bitstreams: Mutex::new(BitstreamTable {
                ready: HashMap::new(),
                free_streams: STREAM_BUFFER_COUNT,
            }),
            bitstream_cond: Condvar::new(),
            stopped: AtomicBool::new(false),
        });

        let (task_tx, task_rx) = unbounded::<()>();
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("encode-{surface_label}"))
            .spawn(move || encode_main_loop(thread_shared, task_rx, codec))
            .expect("spawn encode thread");

        EncodeSession {
            shared,
            task_tx: Some(task_tx),
            thread: Some(thread),
        }
    }

    /// Queue a frame for encoding. Fails when all source slots are
    /// occupied by views not yet locked and submitted.
    pub fn encode_frame(&self, view: ImageView, regions: Vec<DamageRegion>) -> Result<()> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(EncodeError::Stopped);
        }

        {
            let mut pending = self.shared.pending_encodes.lock();
            if pending.len() >= SOURCE_SLOT_COUNT {
                return Err(EncodeError::SourceSlotsExhausted);
            }
            trace!("queueing encode for view {}", view.id());
            pending.push_back(PendingEncode { view, regions });
        }

        if let Some(tx) = &self.task_tx {
            let _ = tx.send(());
        }
        Ok(())
    }

    /// Suspend until the bitstream for `view_id` is ready, then lock it.
    pub fn lock_bitstream(&self, view_id: u64) -> Result<Bitstream> {
        let mut bitstreams = self.shared.bitstreams.lock();
        loop {
            if let Some(outcome) = bitstreams.ready.remove(&view_id) {
                return match outcome {
                    Ok(data) => Ok(Bitstream { view_id, data }),
                    Err(e) => {
                        // A failed encode never consumed a stream buffer.
                        Err(EncodeError::Codec(e))
                    }
                };
            }
            if self.shared.stopped.load(Ordering::Acquire) {
                return Err(EncodeError::Stopped);
            }
            self.shared.bitstream_cond.wait(&mut bitstreams);
        }
    }

    /// Return a locked bitstream's stream buffer to the session.
    pub fn unlock_bitstream(&self, bitstream: Bitstream) {
        let mut bitstreams = self.shared.bitstreams.lock();
        bitstreams.free_streams += 1;
        trace!("unlocked bitstream for view {}", bitstream.view_id);
        drop(bitstream);
        self.shared.bitstream_cond.notify_all();
    }

    /// Number of queued encode tasks.
    pub fn pending_encodes(&self) -> usize {
        self.shared.pending_encodes.lock().len()
    }

    /// Stop the encode loop and fail all waiters.
    pub fn stop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.task_tx.take();
        // Bridge the flag store with the bitstream lock so no waiter
        // checks it, misses the notify, and sleeps forever.
        drop(self.shared.bitstreams.lock());
        self.shared.bitstream_cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for EncodeSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn encode_main_loop(shared: Arc<Shared>, task_rx: Receiver<()>, mut codec: Box<dyn FrameCodec>) {
    debug!("encode main loop starting");

    while task_rx.recv().is_ok() {
        if shared.stopped.load(Ordering::Acquire) {
            break;
        }

        // Claim a free encode-stream buffer before taking a task, so a
        // blocked encode keeps its source slot occupied.
        {
            let mut bitstreams = shared.bitstreams.lock();
            while bitstreams.free_streams == 0 && !shared.stopped.load(Ordering::Acquire) {
                shared.bitstream_cond.wait(&mut bitstreams);
            }
            if shared.stopped.load(Ordering::Acquire) {
                break;
            }
            bitstreams.free_streams -= 1;
        }

        let task = shared.pending_encodes.lock().pop_front();
        let Some(task) = task else {
            shared.bitstreams.lock().free_streams += 1;
            continue;
        };

        let outcome = codec.encode_regions(&task.view, &task.regions);
        if let Err(e) = &outcome {
            warn!("encode failed for view {}: {e}", task.view.id());
        }

        let mut bitstreams = shared.bitstreams.lock();
        if outcome.is_err() {
            // Failed encodes release the stream buffer immediately.
            bitstreams.free_streams += 1;
        }
        bitstreams.ready.insert(task.view.id(), outcome);
        shared.bitstream_cond.notify_all();
    }

    debug!("encode main loop exiting");
}
