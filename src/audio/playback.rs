//! Audio Playback (RDPSND over DVC)
//!
//! Negotiation: the server offers its format set, the client answers
//! with the intersection and its protocol version, the server sends a
//! training PDU and waits for the confirm. A client that cannot finish
//! negotiation within the protocol timeout is torn down; so is any
//! protocol violation. The format offer order is AAC, Opus, PCM —
//! first match wins.
//!
//! Sample pacing: host frames queue with a bounded lifetime and are
//! encoded once a full codec packet accumulates. Per-block render
//! latency drives a simple backpressure: when the one-second average
//! exceeds the limit, the queue is dropped. Playback locks to one host
//! node at a time and releases it after a stretch of pure silence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::audio::dsp::{
    AudioDsp, DspEncoder, N_CHANNELS, OPUS_SAMPLES_PER_SEC, PCM_SAMPLES_PER_SEC,
};
use crate::dvc::{DvcChannel, DvcRegistry};
use crate::peer::pdu::{AudioCodec, AudioFormat, RdpsndClientPdu, RdpsndServerPdu};
use crate::peer::{channels, OutputPdu, RdpPeer};
use crate::session::main_loop::MainLoopHandle;

/// Client must finish negotiation within this window.
pub const PROTOCOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Queued host frames older than this are dropped before encoding.
pub const MAX_LOCAL_FRAME_LIFETIME_US: i64 = 50_000;

/// Render-latency ceiling for the one-second sliding average.
pub const MAX_RENDER_LATENCY_MS: u32 = 300;

/// A node producing only silence longer than this is released.
pub const MAX_IDLING_TIME_US: i64 = 5_000_000;
/// Opus keeps the node longer before releasing it.
pub const MAX_IDLING_TIME_US_OPUS: i64 = 10_000_000;

const TRAINING_PACK_SIZE: u16 = 1024;
const TRAINING_TIMESTAMP: u16 = 0;

/// RDPSND protocol version the server speaks.
const SERVER_VERSION: u16 = 8;

/// Negotiation progress, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum NegotiationState {
    AwaitFormats,
    AwaitTrainingConfirm,
    Complete,
    Failed,
}

struct QueuedFrames {
    samples: Vec<i16>,
    timestamp_us: i64,
}

struct BlockInfo {
    sent_at_us: i64,
}

struct PlaybackState {
    negotiation: NegotiationState,
    codec: Option<AudioCodec>,
    format_no: u16,
    encoder: Option<Box<dyn DspEncoder>>,

    pending_frames: Vec<QueuedFrames>,
    next_block_no: u8,
    blocks_in_flight: HashMap<u8, BlockInfo>,
    /// (completion time µs, latency ms) samples of the last second.
    latency_window: Vec<(i64, u32)>,

    /// Host node the playback is locked to.
    locked_node: Option<u32>,
    last_audible_us: i64,

    channel_id: Option<u32>,
    subscription_id: Option<u32>,
    protocol_timer: Option<u64>,
    initialized: bool,
    torn_down: bool,
}

/// The RDPSND playback component.
pub struct AudioPlayback {
    peer: Arc<dyn RdpPeer>,
    registry: Arc<DvcRegistry>,
    main_loop: MainLoopHandle,
    dsp: Arc<dyn AudioDsp>,
    state: Arc<Mutex<PlaybackState>>,
}

impl AudioPlayback {
    pub fn new(
        peer: Arc<dyn RdpPeer>,
        registry: Arc<DvcRegistry>,
        main_loop: MainLoopHandle,
        dsp: Arc<dyn AudioDsp>,
    ) -> Self {
        AudioPlayback {
            peer,
            registry,
            main_loop,
            dsp,
            state: Arc::new(Mutex::new(PlaybackState {
                negotiation: NegotiationState::AwaitFormats,
                codec: None,
                format_no: 0,
                encoder: None,
                pending_frames: Vec::new(),
                next_block_no: 0,
                blocks_in_flight: HashMap::new(),
                latency_window: Vec::new(),
                locked_node: None,
                last_audible_us: 0,
                channel_id: None,
                subscription_id: None,
                protocol_timer: None,
                initialized: false,
                torn_down: false,
            })),
        }
    }

    /// Formats offered to the client, in preference order.
    fn server_formats(&self) -> Vec<AudioFormat> {
        let mut formats = Vec::new();
        if self.dsp.create_encoder(AudioCodec::Aac, PCM_SAMPLES_PER_SEC).is_some() {
            formats.push(AudioFormat {
                codec: AudioCodec::Aac,
                n_channels: N_CHANNELS,
                samples_per_sec: PCM_SAMPLES_PER_SEC,
                bits_per_sample: 16,
                block_align: 4,
            });
        }
        if self.dsp.create_encoder(AudioCodec::Opus, OPUS_SAMPLES_PER_SEC).is_some() {
            formats.push(AudioFormat {
                codec: AudioCodec::Opus,
                n_channels: N_CHANNELS,
                samples_per_sec: OPUS_SAMPLES_PER_SEC,
                bits_per_sample: 16,
                block_align: 4,
            });
        }
        formats.push(AudioFormat {
            codec: AudioCodec::Pcm,
            n_channels: N_CHANNELS,
            samples_per_sec: PCM_SAMPLES_PER_SEC,
            bits_per_sample: 16,
            block_align: 4,
        });
        formats
    }

    /// Dispatch one RDPSND PDU from the client.
    pub fn handle_client_pdu(&self, pdu: RdpsndClientPdu) {
        match pdu {
            RdpsndClientPdu::Formats { version, formats } => {
                self.handle_client_formats(version, formats)
            }
            RdpsndClientPdu::QualityMode { mode } => {
                debug!("client quality mode {}", mode);
            }
            RdpsndClientPdu::TrainingConfirm { .. } => self.handle_training_confirm(),
            RdpsndClientPdu::WaveConfirm {
                timestamp: _,
                block_no,
            } => self.handle_wave_confirm(block_no),
        }
    }

    fn handle_client_formats(&self, version: u16, client_formats: Vec<AudioFormat>) {
        let mut state = self.state.lock();
        if state.negotiation != NegotiationState::AwaitFormats {
            warn!("unexpected client formats in state {:?}", state.negotiation);
            drop(state);
            self.protocol_violation();
            return;
        }

        // First match of the offer order present on both sides.
        let offered = self.server_formats();
        let selected = offered.iter().enumerate().find(|(_, format)| {
            client_formats
                .iter()
                .any(|cf| cf.codec == format.codec && cf.samples_per_sec == format.samples_per_sec)
        });

        let Some((format_no, format)) = selected else {
            info!("no common audio format with client (version {version}), terminating");
            drop(state);
            self.protocol_violation();
            return;
        };

        info!("audio playback codec: {:?}", format.codec);
        state.codec = Some(format.codec);
        state.format_no = format_no as u16;
        state.encoder = self.dsp.create_encoder(format.codec, format.samples_per_sec);
        state.negotiation = NegotiationState::AwaitTrainingConfirm;
        drop(state);

        let _ = self.peer.send(OutputPdu::Rdpsnd(RdpsndServerPdu::Training {
            timestamp: TRAINING_TIMESTAMP,
            pack_size: TRAINING_PACK_SIZE,
        }));
    }

    fn handle_training_confirm(&self) {
        let mut state = self.state.lock();
        if state.negotiation != NegotiationState::AwaitTrainingConfirm {
            warn!("unexpected training confirm");
            drop(state);
            self.protocol_violation();
            return;
        }
        state.negotiation = NegotiationState::Complete;
        if let Some(timer) = state.protocol_timer.take() {
            self.main_loop.cancel_timeout(timer);
        }
        info!("audio playback negotiation complete");
    }

    fn handle_wave_confirm(&self, block_no: u8) {
        let mut state = self.state.lock();
        let Some(block) = state.blocks_in_flight.remove(&block_no) else {
            return;
        };
        let now_us = monotonic_us();
        let latency_ms = ((now_us - block.sent_at_us) / 1000).max(0) as u32;
        state.latency_window.push((now_us, latency_ms));
        state
            .latency_window
            .retain(|(at, _)| now_us - at <= 1_000_000);

        let average: u32 = {
            let window = &state.latency_window;
            window.iter().map(|(_, l)| l).sum::<u32>() / window.len().max(1) as u32
        };
        if average > MAX_RENDER_LATENCY_MS {
            debug!("render latency {}ms, dropping queue", average);
            state.pending_frames.clear();
        }
    }

    /// Host frame submission, tagged by source node.
    pub fn submit_samples(&self, node_id: u32, samples: &[i16], timestamp_us: i64) {
        let mut state = self.state.lock();
        if state.negotiation != NegotiationState::Complete {
            return;
        }

        let audible = samples.iter().any(|&s| s != 0);
        let max_idle = if state.codec == Some(AudioCodec::Opus) {
            MAX_IDLING_TIME_US_OPUS
        } else {
            MAX_IDLING_TIME_US
        };

        match state.locked_node {
            None => {
                if !audible {
                    return;
                }
                debug!("locking playback to node {}", node_id);
                state.locked_node = Some(node_id);
                state.last_audible_us = timestamp_us;
            }
            Some(locked) if locked != node_id => {
                // Other nodes stay paused while locked.
                return;
            }
            Some(_) => {
                if audible {
                    state.last_audible_us = timestamp_us;
                } else if timestamp_us - state.last_audible_us > max_idle {
                    debug!("releasing idle node {}", node_id);
                    state.locked_node = None;
                    state.pending_frames.clear();
                    return;
                }
            }
        }

        state.pending_frames.push(QueuedFrames {
            samples: samples.to_vec(),
            timestamp_us,
        });
        self.encode_pending(&mut state, timestamp_us);
    }

    /// Drop stale frames, then emit full packets. A partially consumed
    /// frame's remainder goes back to the queue head with its original
    /// timestamp.
    fn encode_pending(&self, state: &mut PlaybackState, now_us: i64) {
        state
            .pending_frames
            .retain(|frame| now_us - frame.timestamp_us <= MAX_LOCAL_FRAME_LIFETIME_US);

        let packet_samples = match state.encoder.as_ref() {
            Some(encoder) => (encoder.frames_per_packet() * u32::from(N_CHANNELS)) as usize,
            None => return,
        };

        loop {
            let total: usize = state.pending_frames.iter().map(|f| f.samples.len()).sum();
            if total < packet_samples {
                break;
            }

            let mut packet = Vec::with_capacity(packet_samples);
            while packet.len() < packet_samples {
                let mut frame = state.pending_frames.remove(0);
                let needed = packet_samples - packet.len();
                if frame.samples.len() <= needed {
                    packet.extend_from_slice(&frame.samples);
                } else {
                    packet.extend_from_slice(&frame.samples[..needed]);
                    frame.samples.drain(..needed);
                    state.pending_frames.insert(0, frame);
                }
            }

            let data = match state.encoder.as_mut().and_then(|e| e.encode(&packet)) {
                Some(data) => data,
                None => continue,
            };

            let block_no = state.next_block_no;
            state.next_block_no = state.next_block_no.wrapping_add(1);
            state
                .blocks_in_flight
                .insert(block_no, BlockInfo { sent_at_us: now_us });

            let _ = self.peer.send(OutputPdu::Rdpsnd(RdpsndServerPdu::Wave {
                timestamp: (now_us / 1000) as u16,
                format_no: state.format_no,
                block_no,
                data,
            }));
        }
    }

    fn protocol_violation(&self) {
        warn!("audio playback protocol violation, tearing down channel");
        self.queue_tear_down_inner();
    }

    fn queue_tear_down_inner(&self) {
        let mut state = self.state.lock();
        if state.torn_down {
            return;
        }
        state.torn_down = true;
        state.negotiation = NegotiationState::Failed;
        if let Some(timer) = state.protocol_timer.take() {
            self.main_loop.cancel_timeout(timer);
        }
        if let (Some(channel_id), Some(subscription_id)) =
            (state.channel_id, state.subscription_id)
        {
            self.registry
                .unsubscribe_creation_status(channel_id, subscription_id);
        }
        if let Some(channel_id) = state.channel_id.take() {
            let _ = self.peer.close_dvc(channel_id);
        }
    }

    #[cfg(test)]
    fn force_negotiated(&self, codec: AudioCodec) {
        let mut state = self.state.lock();
        state.negotiation = NegotiationState::Complete;
        state.codec = Some(codec);
        state.encoder = self.dsp.create_encoder(codec, PCM_SAMPLES_PER_SEC);
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.state
            .lock()
            .pending_frames
            .iter()
            .map(|f| f.samples.len())
            .sum()
    }
}

impl DvcChannel for AudioPlayback {
    fn maybe_init(&mut self) {
        {
            let state = self.state.lock();
            if state.initialized || state.torn_down {
                return;
            }
        }

        let channel_id = match self.peer.open_dvc(channels::RDPSND) {
            Ok(id) => id,
            Err(e) => {
                warn!("failed to open audio playback channel: {e}");
                return;
            }
        };

        let peer = Arc::clone(&self.peer);
        let state_arc = Arc::clone(&self.state);
        let formats = self.server_formats();
        let subscription_id = self.registry.subscribe_creation_status(
            channel_id,
            Box::new(move |status| {
                if status < 0 {
                    warn!("audio playback channel creation failed: {status}");
                    return;
                }
                let _ = peer.send(OutputPdu::Rdpsnd(RdpsndServerPdu::Formats {
                    version: SERVER_VERSION,
                    formats,
                }));
                state_arc.lock().negotiation = NegotiationState::AwaitFormats;
            }),
        );

        let state_arc = Arc::clone(&self.state);
        let registry = Arc::clone(&self.registry);
        let peer = Arc::clone(&self.peer);
        let timer = self.main_loop.add_timeout(PROTOCOL_TIMEOUT, move || {
            let mut state = state_arc.lock();
            if state.negotiation < NegotiationState::Complete && !state.torn_down {
                warn!("audio playback negotiation timed out");
                state.torn_down = true;
                state.negotiation = NegotiationState::Failed;
                if let (Some(channel_id), Some(subscription_id)) =
                    (state.channel_id, state.subscription_id)
                {
                    registry.unsubscribe_creation_status(channel_id, subscription_id);
                }
                if let Some(channel_id) = state.channel_id.take() {
                    let _ = peer.close_dvc(channel_id);
                }
            }
        });

        let mut state = self.state.lock();
        state.initialized = true;
        state.channel_id = Some(channel_id);
        state.subscription_id = Some(subscription_id);
        state.protocol_timer = Some(timer);
    }

    fn queue_channel_tear_down(&mut self) {
        self.queue_tear_down_inner();
    }
}

fn monotonic_us() -> i64 {
    use std::time::Instant;
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as i64
}
