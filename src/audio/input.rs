//! Audio Input (AUDIN)
//!
//! Server-side microphone channel. Negotiation walks the fixed chain
//! version → incoming-data → formats → format-change → open-reply →
//! complete; any out-of-order PDU is a protocol violation that tears
//! down only this channel. A client that cannot reach the open reply
//! within the protocol timeout is torn down as well.
//!
//! Data PDUs decode through the negotiated codec into 44.1 kHz stereo
//! PCM for the host source stream; frames older than the staleness
//! limit are discarded before emission.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::audio::dsp::{AudioDsp, DspDecoder, PCM_SAMPLES_PER_SEC};
use crate::dvc::{DvcChannel, DvcRegistry};
use crate::peer::pdu::{AudinClientPdu, AudinServerPdu, AudioCodec, AudioFormat};
use crate::peer::{channels, OutputPdu, RdpPeer};
use crate::session::main_loop::MainLoopHandle;

/// Client must reach the open reply within this window.
pub const PROTOCOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames older than this are discarded before emission.
pub const MAX_FRAME_AGE_US: i64 = 200_000;

/// AUDIN protocol version.
const SERVER_VERSION: u32 = 1;

/// Negotiation progress, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum NegotiationState {
    AwaitVersion,
    AwaitIncomingData,
    AwaitFormats,
    AwaitFormatChange,
    AwaitOpenReply,
    Complete,
    Failed,
}

/// Runtime alternation between headers and payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuntimeState {
    AwaitIncomingData,
    AwaitData,
}

/// Sink for decoded PCM, provided by the embedding host.
pub type PcmSink = Box<dyn Fn(&[i16]) + Send + Sync>;

struct InputState {
    negotiation: NegotiationState,
    runtime: RuntimeState,
    decoder: Option<Box<dyn DspDecoder>>,
    selected_format: u32,
    /// Arrival time of the last incoming-data header.
    incoming_timestamp_us: i64,

    channel_id: Option<u32>,
    subscription_id: Option<u32>,
    protocol_timer: Option<u64>,
    initialized: bool,
    torn_down: bool,
}

/// The AUDIN channel component.
pub struct AudioInput {
    peer: Arc<dyn RdpPeer>,
    registry: Arc<DvcRegistry>,
    main_loop: MainLoopHandle,
    dsp: Arc<dyn AudioDsp>,
    sink: PcmSink,
    state: Arc<Mutex<InputState>>,
}

impl AudioInput {
    pub fn new(
        peer: Arc<dyn RdpPeer>,
        registry: Arc<DvcRegistry>,
        main_loop: MainLoopHandle,
        dsp: Arc<dyn AudioDsp>,
        sink: PcmSink,
    ) -> Self {
        AudioInput {
            peer,
            registry,
            main_loop,
            dsp,
            sink,
            state: Arc::new(Mutex::new(InputState {
                negotiation: NegotiationState::AwaitVersion,
                runtime: RuntimeState::AwaitIncomingData,
                decoder: None,
                selected_format: 0,
                incoming_timestamp_us: 0,
                channel_id: None,
                subscription_id: None,
                protocol_timer: None,
                initialized: false,
                torn_down: false,
            })),
        }
    }

    /// Formats offered to the client: A-law and PCM.
    fn server_formats() -> Vec<AudioFormat> {
        vec![
            AudioFormat {
                codec: AudioCodec::Alaw,
                n_channels: 2,
                samples_per_sec: PCM_SAMPLES_PER_SEC,
                bits_per_sample: 8,
                block_align: 2,
            },
            AudioFormat {
                codec: AudioCodec::Pcm,
                n_channels: 2,
                samples_per_sec: PCM_SAMPLES_PER_SEC,
                bits_per_sample: 16,
                block_align: 4,
            },
        ]
    }

    /// Dispatch one AUDIN PDU from the client.
    pub fn handle_client_pdu(&self, pdu: AudinClientPdu, now_us: i64) {
        match pdu {
            AudinClientPdu::Version { version } => self.handle_version(version),
            AudinClientPdu::IncomingData { data_size } => self.handle_incoming_data(data_size, now_us),
            AudinClientPdu::Formats { formats } => self.handle_formats(formats),
            AudinClientPdu::FormatChange { new_format } => self.handle_format_change(new_format),
            AudinClientPdu::OpenReply { result } => self.handle_open_reply(result),
            AudinClientPdu::Data { data } => self.handle_data(&data, now_us),
        }
    }

    fn handle_version(&self, version: u32) {
        let mut state = self.state.lock();
        if state.negotiation != NegotiationState::AwaitVersion {
            drop(state);
            self.protocol_violation("unexpected version");
            return;
        }
        debug!("client audio input version {}", version);
        state.negotiation = NegotiationState::AwaitIncomingData;
        drop(state);

        let _ = self.peer.send(OutputPdu::Audin(AudinServerPdu::Formats {
            formats: Self::server_formats(),
        }));
    }

    fn handle_incoming_data(&self, _data_size: u32, now_us: i64) {
        let mut state = self.state.lock();
        match state.negotiation {
            NegotiationState::AwaitIncomingData => {
                state.negotiation = NegotiationState::AwaitFormats;
            }
            NegotiationState::Complete => {
                if state.runtime != RuntimeState::AwaitIncomingData {
                    drop(state);
                    self.protocol_violation("unexpected incoming data");
                    return;
                }
                state.runtime = RuntimeState::AwaitData;
                state.incoming_timestamp_us = now_us;
            }
            _ => {
                drop(state);
                self.protocol_violation("incoming data in wrong state");
            }
        }
    }

    fn handle_formats(&self, client_formats: Vec<AudioFormat>) {
        let mut state = self.state.lock();
        if state.negotiation != NegotiationState::AwaitFormats {
            drop(state);
            self.protocol_violation("unexpected formats");
            return;
        }

        let offered = Self::server_formats();
        let selected = offered
            .iter()
            .enumerate()
            .find(|(_, format)| client_formats.iter().any(|cf| cf.codec == format.codec));
        let Some((index, format)) = selected else {
            drop(state);
            self.protocol_violation("no common audio input format");
            return;
        };

        info!("audio input codec: {:?}", format.codec);
        state.selected_format = index as u32;
        state.decoder = self.dsp.create_decoder(format.codec, format.samples_per_sec);
        state.negotiation = NegotiationState::AwaitFormatChange;
        drop(state);

        let _ = self.peer.send(OutputPdu::Audin(AudinServerPdu::Open {
            initial_format: index as u32,
        }));
    }

    fn handle_format_change(&self, new_format: u32) {
        let mut state = self.state.lock();
        if state.negotiation != NegotiationState::AwaitFormatChange {
            drop(state);
            self.protocol_violation("unexpected format change");
            return;
        }
        if new_format != state.selected_format {
            drop(state);
            self.protocol_violation("client changed to an unoffered format");
            return;
        }
        state.negotiation = NegotiationState::AwaitOpenReply;
    }

    fn handle_open_reply(&self, result: u32) {
        let mut state = self.state.lock();
        if state.negotiation != NegotiationState::AwaitOpenReply {
            drop(state);
            self.protocol_violation("unexpected open reply");
            return;
        }
        if result != 0 {
            drop(state);
            self.protocol_violation("client rejected open");
            return;
        }

        state.negotiation = NegotiationState::Complete;
        state.runtime = RuntimeState::AwaitIncomingData;
        if let Some(timer) = state.protocol_timer.take() {
            self.main_loop.cancel_timeout(timer);
        }
        info!("audio input negotiation complete");
    }

    fn handle_data(&self, data: &[u8], now_us: i64) {
        let pcm = {
            let mut state = self.state.lock();
            if state.negotiation != NegotiationState::Complete
                || state.runtime != RuntimeState::AwaitData
            {
                drop(state);
                self.protocol_violation("unexpected data");
                return;
            }
            state.runtime = RuntimeState::AwaitIncomingData;

            if now_us - state.incoming_timestamp_us > MAX_FRAME_AGE_US {
                debug!("discarding stale audio input frame");
                return;
            }

            state.decoder.as_mut().and_then(|d| d.decode(data))
        };

        if let Some(pcm) = pcm {
            (self.sink)(&pcm);
        }
    }

    fn protocol_violation(&self, what: &str) {
        warn!("audio input protocol violation: {what}, tearing down channel");
        self.tear_down_inner();
    }

    fn tear_down_inner(&self) {
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
}

impl DvcChannel for AudioInput {
    fn maybe_init(&mut self) {
        {
            let state = self.state.lock();
            if state.initialized || state.torn_down {
                return;
            }
        }

        let channel_id = match self.peer.open_dvc(channels::AUDIN) {
            Ok(id) => id,
            Err(e) => {
                warn!("failed to open audio input channel: {e}");
                return;
            }
        };

        let peer = Arc::clone(&self.peer);
        let subscription_id = self.registry.subscribe_creation_status(
            channel_id,
            Box::new(move |status| {
                if status < 0 {
                    warn!("audio input channel creation failed: {status}");
                    return;
                }
                let _ = peer.send(OutputPdu::Audin(AudinServerPdu::Version {
                    version: SERVER_VERSION,
                }));
            }),
        );

        let state_arc = Arc::clone(&self.state);
        let registry = Arc::clone(&self.registry);
        let peer = Arc::clone(&self.peer);
        let timer = self.main_loop.add_timeout(PROTOCOL_TIMEOUT, move || {
            let mut state = state_arc.lock();
            if state.negotiation < NegotiationState::Complete && !state.torn_down {
                warn!("audio input negotiation timed out");
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
        self.tear_down_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::dsp::{alaw_compress, BuiltinDsp};
    use crate::session::main_loop::MainLoop;
    use crate::testing::RecordingPeer;
    use bytes::Bytes;
    use crossbeam_channel::unbounded;

    fn audio_input(
        peer: Arc<RecordingPeer>,
    ) -> (MainLoop, AudioInput, crossbeam_channel::Receiver<Vec<i16>>) {
        let main_loop = MainLoop::new();
        let registry = Arc::new(DvcRegistry::new(main_loop.handle()));
        let (tx, rx) = unbounded();
        let input = AudioInput::new(
            peer,
            registry,
            main_loop.handle(),
            Arc::new(BuiltinDsp),
            Box::new(move |pcm| {
                let _ = tx.send(pcm.to_vec());
            }),
        );
        (main_loop, input, rx)
    }

    fn alaw_format() -> AudioFormat {
        AudioFormat {
            codec: AudioCodec::Alaw,
            n_channels: 2,
            samples_per_sec: 44_100,
            bits_per_sample: 8,
            block_align: 2,
        }
    }

    fn negotiate(input: &AudioInput) {
        input.handle_client_pdu(AudinClientPdu::Version { version: 1 }, 0);
        input.handle_client_pdu(AudinClientPdu::IncomingData { data_size: 0 }, 0);
        input.handle_client_pdu(
            AudinClientPdu::Formats {
                formats: vec![alaw_format()],
            },
            0,
        );
        input.handle_client_pdu(AudinClientPdu::FormatChange { new_format: 0 }, 0);
        input.handle_client_pdu(AudinClientPdu::OpenReply { result: 0 }, 0);
    }

    #[test]
    fn test_full_negotiation() {
        let peer = Arc::new(RecordingPeer::default());
        let (_main_loop, input, _rx) = audio_input(peer.clone());

        negotiate(&input);
        assert_eq!(input.state.lock().negotiation, NegotiationState::Complete);

        // Server sent formats then open.
        let sent = peer.sent();
        assert!(sent
            .iter()
            .any(|pdu| matches!(pdu, OutputPdu::Audin(AudinServerPdu::Formats { .. }))));
        assert!(sent
            .iter()
            .any(|pdu| matches!(pdu, OutputPdu::Audin(AudinServerPdu::Open { .. }))));
    }

    #[test]
    fn test_out_of_order_pdu_tears_down() {
        let peer = Arc::new(RecordingPeer::default());
        let (_main_loop, input, _rx) = audio_input(peer);

        input.handle_client_pdu(AudinClientPdu::OpenReply { result: 0 }, 0);
        assert!(input.state.lock().torn_down);
    }

    #[test]
    fn test_data_decodes_to_pcm() {
        let peer = Arc::new(RecordingPeer::default());
        let (_main_loop, input, rx) = audio_input(peer);
        negotiate(&input);

        let payload: Vec<u8> = [1000i16, -1000, 500, -500]
            .iter()
            .map(|&s| alaw_compress(s))
            .collect();

        input.handle_client_pdu(AudinClientPdu::IncomingData { data_size: 4 }, 10_000);
        input.handle_client_pdu(
            AudinClientPdu::Data {
                data: Bytes::from(payload),
            },
            20_000,
        );

        let pcm = rx.try_recv().unwrap();
        assert_eq!(pcm.len(), 4);
        assert!(pcm[0] > 0 && pcm[1] < 0);
    }

    #[test]
    fn test_stale_data_discarded() {
        let peer = Arc::new(RecordingPeer::default());
        let (_main_loop, input, rx) = audio_input(peer);
        negotiate(&input);

        input.handle_client_pdu(AudinClientPdu::IncomingData { data_size: 4 }, 0);
        input.handle_client_pdu(
            AudinClientPdu::Data {
                data: Bytes::from(vec![0x55u8; 4]),
            },
            MAX_FRAME_AGE_US + 1,
        );

        assert!(rx.try_recv().is_err());
        // The channel stays usable.
        assert!(!input.state.lock().torn_down);
    }

    #[test]
    fn test_unoffered_format_change_rejected() {
        let peer = Arc::new(RecordingPeer::default());
        let (_main_loop, input, _rx) = audio_input(peer);

        input.handle_client_pdu(AudinClientPdu::Version { version: 1 }, 0);
        input.handle_client_pdu(AudinClientPdu::IncomingData { data_size: 0 }, 0);
        input.handle_client_pdu(
            AudinClientPdu::Formats {
                formats: vec![alaw_format()],
            },
            0,
        );
        input.handle_client_pdu(AudinClientPdu::FormatChange { new_format: 5 }, 0);
        assert!(input.state.lock().torn_down);
    }
}
