use crate::VoiceError;
use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler, ResamplerConstructionError};

/// Sample rate of outbound microphone frames.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Outbound frames are mono.
pub const CAPTURE_CHANNELS: u16 = 1;
/// Number of samples per outbound frame.
pub const CAPTURE_BLOCK_SIZE: usize = 4096;
/// Default sample rate assumed for inbound agent audio.
pub const PLAYBACK_SAMPLE_RATE: u32 = 16_000;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>, ResamplerConstructionError> {
    FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )
}

/// A mono resampler that accepts arbitrarily sized input by carrying the
/// remainder over to the next call.
pub struct StreamResampler {
    inner: FastFixedIn<f32>,
    carry: Vec<f32>,
}

impl StreamResampler {
    pub fn new(
        in_sampling_rate: u32,
        out_sampling_rate: u32,
        chunk_size: usize,
    ) -> Result<Self, ResamplerConstructionError> {
        Ok(Self {
            inner: create_resampler(in_sampling_rate as f64, out_sampling_rate as f64, chunk_size)?,
            carry: Vec::with_capacity(chunk_size * 2),
        })
    }

    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        self.carry.extend_from_slice(samples);
        let mut out = Vec::new();
        loop {
            let needed = self.inner.input_frames_next();
            if self.carry.len() < needed {
                break;
            }
            let block: Vec<f32> = self.carry.drain(..needed).collect();
            match self.inner.process(&[block], None) {
                Ok(res) => out.extend_from_slice(&res[0]),
                Err(e) => tracing::warn!(error = %e, "Dropping audio block that failed to resample"),
            }
        }
        out
    }
}

/// Re-blocks variable-sized device callbacks into fixed-size frames.
#[derive(Debug)]
pub struct FrameAssembler {
    block_size: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            pending: Vec::with_capacity(block_size * 2),
        }
    }

    /// Buffers `samples` and returns every complete frame now available.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.block_size {
            frames.push(self.pending.drain(..self.block_size).collect());
        }
        frames
    }

    /// Samples waiting for a full frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Converts one float sample in [-1, 1] to a signed 16-bit value.
///
/// Out-of-range input is clamped and NaN maps to silence.
pub fn f32_to_i16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    let scaled = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
    scaled.round() as i16
}

/// Inverse of [`f32_to_i16`].
pub fn i16_to_f32(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / 32768.0
    } else {
        sample as f32 / 32767.0
    }
}

/// Encodes float samples as a signed 16-bit little-endian PCM byte buffer.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        out.extend_from_slice(&f32_to_i16(sample).to_le_bytes());
    }
    out
}

/// Decodes signed 16-bit little-endian PCM. A trailing odd byte is ignored.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16_to_f32(i16::from_le_bytes([chunk[0], chunk[1]])))
        .collect()
}

/// Decodes unsigned 8-bit PCM (128 is silence).
pub fn decode_u8(bytes: &[u8]) -> Vec<f32> {
    bytes.iter().map(|&b| b as f32 / 128.0 - 1.0).collect()
}

/// Decodes the base64 payload of an `agent_audio_chunk` message.
pub fn decode_base64(data: &str) -> Result<Vec<u8>, VoiceError> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| VoiceError::Protocol(format!("invalid base64 audio payload: {e}")))
}

/// Encodes raw bytes as base64, as the remote agent does for `agent_audio_chunk`.
pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
