//! Agent audio playback.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::{debug, info, warn};
use voicelink_core::{AudioChunk, SampleEncoding, VoiceError, audio};

/// An open output device that accepts decoded samples.
pub trait AudioOutput: Send {
    /// Queues `samples` (mono, `sample_rate` Hz) to play after anything already queued.
    fn schedule(&mut self, samples: &[f32], sample_rate: u32) -> Result<(), VoiceError>;
    fn close(&mut self);
}

/// Opens output devices.
#[cfg_attr(test, mockall::automock)]
pub trait Speaker: Send + Sync {
    fn open(&self) -> Result<Box<dyn AudioOutput>, VoiceError>;
}

/// Decodes a chunk with the routine matching the path it arrived on.
pub fn decode_chunk(chunk: &AudioChunk) -> Vec<f32> {
    match chunk.encoding {
        SampleEncoding::U8 => audio::decode_u8(&chunk.data),
        SampleEncoding::Pcm16 => audio::decode_pcm16(&chunk.data),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Plays inbound chunks in arrival order on one shared output.
///
/// Playback is best effort: chunks that arrive after [`release`](Self::release),
/// or that the device rejects, are logged and dropped.
pub struct PlaybackPipeline {
    output: Mutex<Option<Box<dyn AudioOutput>>>,
    sample_rate: u32,
    played: AtomicU64,
    dropped: AtomicU64,
}

impl PlaybackPipeline {
    /// A speaker that cannot be opened yields a pipeline that drops everything.
    pub fn open(speaker: &dyn Speaker, sample_rate: u32) -> Self {
        let output = match speaker.open() {
            Ok(output) => Some(output),
            Err(e) => {
                warn!(error = %e, "Audio output unavailable; agent audio will not be played");
                None
            }
        };
        Self::with_output(output, sample_rate)
    }

    /// A pipeline with no output device.
    pub fn disabled(sample_rate: u32) -> Self {
        Self::with_output(None, sample_rate)
    }

    fn with_output(output: Option<Box<dyn AudioOutput>>, sample_rate: u32) -> Self {
        Self {
            output: Mutex::new(output),
            sample_rate,
            played: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn play(&self, chunk: &AudioChunk) {
        let samples = decode_chunk(chunk);
        let mut output = lock(&self.output);
        let Some(output) = output.as_mut() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(sequence = ?chunk.sequence, "Playback closed; dropping audio chunk");
            return;
        };
        match output.schedule(&samples, self.sample_rate) {
            Ok(()) => {
                self.played.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, sequence = ?chunk.sequence, "Dropping audio chunk that failed to play");
            }
        }
    }

    pub fn is_live(&self) -> bool {
        lock(&self.output).is_some()
    }

    /// Closes the output. Safe to call repeatedly.
    pub fn release(&self) {
        if let Some(mut output) = lock(&self.output).take() {
            output.close();
            info!(
                played = self.played.load(Ordering::Relaxed),
                dropped = self.dropped.load(Ordering::Relaxed),
                "Audio output released"
            );
        }
    }

    /// Chunks played and dropped so far.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.played.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.release();
    }
}

/// Discards all audio.
pub struct NullSpeaker;

struct NullOutput;

impl AudioOutput for NullOutput {
    fn schedule(&mut self, _samples: &[f32], _sample_rate: u32) -> Result<(), VoiceError> {
        Ok(())
    }

    fn close(&mut self) {}
}

impl Speaker for NullSpeaker {
    fn open(&self) -> Result<Box<dyn AudioOutput>, VoiceError> {
        Ok(Box::new(NullOutput))
    }
}

/// Writes agent audio to a raw signed 16-bit little-endian file.
pub struct PcmFileSpeaker {
    path: PathBuf,
}

impl PcmFileSpeaker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

struct FileOutput {
    writer: Option<BufWriter<File>>,
}

impl AudioOutput for FileOutput {
    fn schedule(&mut self, samples: &[f32], _sample_rate: u32) -> Result<(), VoiceError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| VoiceError::Playback("output file closed".to_string()))?;
        writer
            .write_all(&audio::encode_pcm16(samples))
            .map_err(|e| VoiceError::Playback(e.to_string()))
    }

    fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!(error = %e, "Failed to flush audio output file");
            }
        }
    }
}

impl Speaker for PcmFileSpeaker {
    fn open(&self) -> Result<Box<dyn AudioOutput>, VoiceError> {
        let file = File::create(&self.path).map_err(|e| {
            VoiceError::Playback(format!("cannot create {}: {}", self.path.display(), e))
        })?;
        Ok(Box::new(FileOutput {
            writer: Some(BufWriter::new(file)),
        }))
    }
}
