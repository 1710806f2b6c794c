//! Audio DSP Interfaces
//!
//! AAC and Opus live behind the [`AudioDsp`] collaborator trait; this
//! module only carries the G.711 A-law companding math and the PCM
//! pass-through, which need no external codec.

use bytes::Bytes;

use crate::peer::pdu::AudioCodec;

/// Samples per second of the shared PCM representation.
pub const PCM_SAMPLES_PER_SEC: u32 = 44_100;
/// Opus operates at 48 kHz.
pub const OPUS_SAMPLES_PER_SEC: u32 = 48_000;
/// Stereo everywhere.
pub const N_CHANNELS: u16 = 2;
/// PCM frames per encoded packet.
pub const PCM_FRAMES_PER_PACKET: u32 = 1024;

/// One codec encoder instance.
pub trait DspEncoder: Send {
    /// Encode interleaved 16-bit PCM into one codec packet.
    fn encode(&mut self, pcm: &[i16]) -> Option<Bytes>;

    /// Samples (per channel) consumed per packet.
    fn frames_per_packet(&self) -> u32;
}

/// One codec decoder instance.
pub trait DspDecoder: Send {
    /// Decode one packet into interleaved 16-bit PCM.
    fn decode(&mut self, data: &[u8]) -> Option<Vec<i16>>;
}

/// Source of codec instances, supplied by the embedding host. Codecs
/// the host cannot provide are simply not offered to the client.
pub trait AudioDsp: Send + Sync + 'static {
    fn create_encoder(&self, codec: AudioCodec, samples_per_sec: u32) -> Option<Box<dyn DspEncoder>>;
    fn create_decoder(&self, codec: AudioCodec, samples_per_sec: u32) -> Option<Box<dyn DspDecoder>>;
}

// =============================================================================
// Built-in codecs
// =============================================================================

/// DSP with the codecs implementable without external libraries: PCM
/// and G.711 A-law.
#[derive(Default)]
pub struct BuiltinDsp;

impl AudioDsp for BuiltinDsp {
    fn create_encoder(
        &self,
        codec: AudioCodec,
        _samples_per_sec: u32,
    ) -> Option<Box<dyn DspEncoder>> {
        match codec {
            AudioCodec::Pcm => Some(Box::new(PcmEncoder)),
            AudioCodec::Alaw => Some(Box::new(AlawEncoder)),
            AudioCodec::Aac | AudioCodec::Opus => None,
        }
    }

    fn create_decoder(
        &self,
        codec: AudioCodec,
        _samples_per_sec: u32,
    ) -> Option<Box<dyn DspDecoder>> {
        match codec {
            AudioCodec::Pcm => Some(Box::new(PcmDecoder)),
            AudioCodec::Alaw => Some(Box::new(AlawDecoder)),
            AudioCodec::Aac | AudioCodec::Opus => None,
        }
    }
}

struct PcmEncoder;

impl DspEncoder for PcmEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Option<Bytes> {
        let mut out = Vec::with_capacity(pcm.len() * 2);
        for sample in pcm {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        Some(Bytes::from(out))
    }

    fn frames_per_packet(&self) -> u32 {
        PCM_FRAMES_PER_PACKET
    }
}

struct PcmDecoder;

impl DspDecoder for PcmDecoder {
    fn decode(&mut self, data: &[u8]) -> Option<Vec<i16>> {
        Some(
            data.chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect(),
        )
    }
}

struct AlawEncoder;

impl DspEncoder for AlawEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Option<Bytes> {
        Some(Bytes::from(
            pcm.iter().map(|&s| alaw_compress(s)).collect::<Vec<u8>>(),
        ))
    }

    fn frames_per_packet(&self) -> u32 {
        PCM_FRAMES_PER_PACKET
    }
}

struct AlawDecoder;

impl DspDecoder for AlawDecoder {
    fn decode(&mut self, data: &[u8]) -> Option<Vec<i16>> {
        Some(data.iter().map(|&b| alaw_expand(b)).collect())
    }
}

// =============================================================================
// G.711 A-law companding
// =============================================================================

/// Compress one 16-bit sample to A-law (ITU-T G.711).
pub fn alaw_compress(sample: i16) -> u8 {
    let mut pcm = sample;
    let sign = if pcm >= 0 { 0x80u8 } else { 0x00 };
    if pcm < 0 {
        pcm = pcm.saturating_neg();
    }
    let mut value = (pcm >> 3) as u16; // 13-bit magnitude

    let compressed = if value >= 0x20 {
        let mut segment = 1u8;
        while value >= 0x40 && segment < 7 {
            value >>= 1;
            segment += 1;
        }
        (segment << 4) | ((value & 0x0F) as u8)
    } else {
        value as u8
    };

    (compressed ^ 0x55) ^ sign
}

/// Expand one A-law byte to a 16-bit sample.
pub fn alaw_expand(alaw: u8) -> i16 {
    let alaw = alaw ^ 0x55;
    let sign = alaw & 0x80;
    let segment = (alaw & 0x70) >> 4;
    let mantissa = (alaw & 0x0F) as i16;

    let magnitude = if segment == 0 {
        (mantissa << 4) + 8
    } else {
        ((mantissa << 4) + 0x108) << (segment - 1)
    };

    // The sign bit is not part of the 0x55 toggle; set means positive.
    if sign != 0 {
        magnitude
    } else {
        -magnitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alaw_round_trip_monotone() {
        // Companding is lossy; check sign, ordering and rough scale.
        for &sample in &[-32000i16, -1024, -100, 0, 100, 1024, 32000] {
            let expanded = alaw_expand(alaw_compress(sample));
            assert_eq!(expanded.signum(), if sample == 0 { 1 } else { sample.signum() });
            let error = (expanded as i32 - sample as i32).abs();
            assert!(
                error <= (sample as i32).abs() / 8 + 64,
                "sample {sample} expanded to {expanded}"
            );
        }
    }

    #[test]
    fn test_alaw_silence() {
        let byte = alaw_compress(0);
        let expanded = alaw_expand(byte);
        assert!(expanded.abs() <= 8);
    }

    #[test]
    fn test_pcm_round_trip() {
        let samples = vec![0i16, -1, 1, i16::MAX, i16::MIN];
        let mut encoder = PcmEncoder;
        let mut decoder = PcmDecoder;

        let encoded = encoder.encode(&samples).unwrap();
        assert_eq!(encoded.len(), samples.len() * 2);
        assert_eq!(decoder.decode(&encoded).unwrap(), samples);
    }

    #[test]
    fn test_builtin_dsp_codec_support() {
        let dsp = BuiltinDsp;
        assert!(dsp.create_encoder(AudioCodec::Pcm, 44_100).is_some());
        assert!(dsp.create_encoder(AudioCodec::Alaw, 44_100).is_some());
        assert!(dsp.create_encoder(AudioCodec::Aac, 44_100).is_none());
        assert!(dsp.create_encoder(AudioCodec::Opus, 48_000).is_none());
        assert!(dsp.create_decoder(AudioCodec::Alaw, 44_100).is_some());
    }
}
