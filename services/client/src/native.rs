//! System audio devices via cpal.
//!
//! cpal streams are not `Send`, so each open device lives on its own thread
//! and is dropped there when the owning handle stops it.

use crate::{
    capture::{CaptureConstraints, CaptureDevice, CaptureStream, Microphone},
    playback::{AudioOutput, Speaker},
};
use async_trait::async_trait;
use cpal::{
    Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Producer, Split},
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc as std_mpsc,
    },
    thread,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use voicelink_core::{VoiceError, audio::StreamResampler};

const RESAMPLER_CHUNK: usize = 1024;
/// Seconds of agent audio the output buffer can hold ahead of the device.
const OUTPUT_BUFFER_SECONDS: usize = 30;

/// Averages interleaved channels down to mono.
fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    samples
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Converts device samples of any supported format to `f32` in [-1, 1].
fn to_f32<T>(samples: &[T]) -> Vec<f32>
where
    T: Sample,
    f32: FromSample<T>,
{
    samples.iter().map(|&s| f32::from_sample(s)).collect()
}

fn find_device(name: Option<&str>, input: bool) -> Result<Device, String> {
    let host = cpal::default_host();
    let device = match name {
        Some(name) => {
            let mut devices = if input {
                host.input_devices()
            } else {
                host.output_devices()
            }
            .map_err(|e| format!("failed to enumerate devices: {e}"))?;
            devices
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| format!("device not found: {name}"))?
        }
        None if input => host
            .default_input_device()
            .ok_or_else(|| "no default input device available".to_string())?,
        None => host
            .default_output_device()
            .ok_or_else(|| "no default output device available".to_string())?,
    };
    info!(
        device = %device.name().unwrap_or_else(|_| "unknown".into()),
        input,
        "Selected audio device"
    );
    Ok(device)
}

/// The default (or named) input device.
#[derive(Debug, Clone, Default)]
pub struct CpalMicrophone {
    pub device_name: Option<String>,
}

struct ThreadDevice {
    stop: Option<std_mpsc::Sender<()>>,
    live: Arc<AtomicBool>,
}

impl CaptureDevice for ThreadDevice {
    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

fn open_input(
    name: Option<&str>,
    target_rate: u32,
    frames: mpsc::Sender<Vec<f32>>,
) -> Result<Stream, String> {
    let device = find_device(name, true)?;
    let default_config = device
        .default_input_config()
        .map_err(|e| format!("failed to get default input config: {e}"))?;
    let native_rate = default_config.sample_rate().0;
    let channels = default_config.channels();
    let config = StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(native_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let resampler = if native_rate != target_rate {
        info!(native_rate, target_rate, "Resampling microphone input");
        Some(
            StreamResampler::new(native_rate, target_rate, RESAMPLER_CHUNK)
                .map_err(|e| format!("failed to create resampler: {e}"))?,
        )
    } else {
        None
    };

    let stream = match default_config.sample_format() {
        SampleFormat::F32 => build_input::<f32>(&device, &config, resampler, frames),
        SampleFormat::I16 => build_input::<i16>(&device, &config, resampler, frames),
        SampleFormat::U16 => build_input::<u16>(&device, &config, resampler, frames),
        SampleFormat::I32 => build_input::<i32>(&device, &config, resampler, frames),
        other => Err(format!("unsupported input sample format: {other:?}")),
    }?;
    stream
        .play()
        .map_err(|e| format!("failed to start input stream: {e}"))?;
    Ok(stream)
}

fn build_input<T>(
    device: &Device,
    config: &StreamConfig,
    mut resampler: Option<StreamResampler>,
    frames: mpsc::Sender<Vec<f32>>,
) -> Result<Stream, String>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels;
    device
        .build_input_stream(
            config,
            move |data: &[T], _info: &cpal::InputCallbackInfo| {
                let mono = to_mono(&to_f32(data), channels);
                let samples = match resampler.as_mut() {
                    Some(resampler) => resampler.process(&mono),
                    None => mono,
                };
                // Full means the pump is behind; closed means capture was released.
                if !samples.is_empty() {
                    let _ = frames.try_send(samples);
                }
            },
            move |err| error!(error = %err, "Audio input stream error"),
            None,
        )
        .map_err(|e| format!("failed to build input stream: {e}"))
}

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<CaptureStream, VoiceError> {
        debug!(
            echo_cancellation = constraints.echo_cancellation,
            noise_suppression = constraints.noise_suppression,
            auto_gain_control = constraints.auto_gain_control,
            "Input processing is left to the platform"
        );
        let (frames_tx, frames_rx) = mpsc::channel(32);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let live = Arc::new(AtomicBool::new(true));

        let name = self.device_name.clone();
        let target_rate = constraints.sample_rate;
        let thread_live = live.clone();
        thread::Builder::new()
            .name("voicelink-capture".into())
            .spawn(move || {
                let stream = match open_input(name.as_deref(), target_rate, frames_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        thread_live.store(false, Ordering::SeqCst);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Returns on stop or when the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                thread_live.store(false, Ordering::SeqCst);
                debug!("Audio input stream closed");
            })
            .map_err(|e| VoiceError::Permission(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(CaptureStream {
                frames: frames_rx,
                device: Box::new(ThreadDevice {
                    stop: Some(stop_tx),
                    live,
                }),
            }),
            Ok(Err(e)) => Err(VoiceError::Permission(e)),
            Err(_) => Err(VoiceError::Permission(
                "capture thread exited before the device opened".to_string(),
            )),
        }
    }
}

/// The default (or named) output device.
#[derive(Debug, Clone, Default)]
pub struct CpalSpeaker {
    pub device_name: Option<String>,
}

struct CpalOutput {
    producer: HeapProd<f32>,
    device_rate: u32,
    resampler: Option<(u32, StreamResampler)>,
    stop: Option<std_mpsc::Sender<()>>,
}

fn open_output(name: Option<&str>) -> Result<(Stream, HeapProd<f32>, u32), String> {
    let device = find_device(name, false)?;
    let default_config = device
        .default_output_config()
        .map_err(|e| format!("failed to get default output config: {e}"))?;
    let device_rate = default_config.sample_rate().0;
    let channels = default_config.channels() as usize;
    let config = StreamConfig {
        channels: channels as u16,
        sample_rate: cpal::SampleRate(device_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let (producer, consumer) =
        HeapRb::<f32>::new(device_rate as usize * OUTPUT_BUFFER_SECONDS).split();
    let stream = match default_config.sample_format() {
        SampleFormat::F32 => build_output::<f32>(&device, &config, consumer),
        SampleFormat::I16 => build_output::<i16>(&device, &config, consumer),
        SampleFormat::U16 => build_output::<u16>(&device, &config, consumer),
        SampleFormat::I32 => build_output::<i32>(&device, &config, consumer),
        other => Err(format!("unsupported output sample format: {other:?}")),
    }?;
    stream
        .play()
        .map_err(|e| format!("failed to start output stream: {e}"))?;
    Ok((stream, producer, device_rate))
}

fn build_output<T>(
    device: &Device,
    config: &StreamConfig,
    mut consumer: HeapCons<f32>,
) -> Result<Stream, String>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    frame.fill(T::from_sample(consumer.try_pop().unwrap_or(0.0)));
                }
            },
            move |err| error!(error = %err, "Audio output stream error"),
            None,
        )
        .map_err(|e| format!("failed to build output stream: {e}"))
}

// Opening blocks until the device thread reports back; call it from a
// blocking context.
impl Speaker for CpalSpeaker {
    fn open(&self) -> Result<Box<dyn AudioOutput>, VoiceError> {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let name = self.device_name.clone();

        thread::Builder::new()
            .name("voicelink-playback".into())
            .spawn(move || {
                let stream = match open_output(name.as_deref()) {
                    Ok((stream, producer, rate)) => {
                        let _ = ready_tx.send(Ok((producer, rate)));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Audio output stream closed");
            })
            .map_err(|e| VoiceError::Playback(format!("failed to spawn playback thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok((producer, device_rate))) => Ok(Box::new(CpalOutput {
                producer,
                device_rate,
                resampler: None,
                stop: Some(stop_tx),
            })),
            Ok(Err(e)) => Err(VoiceError::Playback(e)),
            Err(_) => Err(VoiceError::Playback(
                "playback thread exited before the device opened".to_string(),
            )),
        }
    }
}

impl AudioOutput for CpalOutput {
    fn schedule(&mut self, samples: &[f32], sample_rate: u32) -> Result<(), VoiceError> {
        if self.stop.is_none() {
            return Err(VoiceError::Playback("output closed".to_string()));
        }
        let resampled;
        let samples = if sample_rate == self.device_rate {
            samples
        } else {
            if self.resampler.as_ref().is_none_or(|(rate, _)| *rate != sample_rate) {
                let resampler = StreamResampler::new(sample_rate, self.device_rate, RESAMPLER_CHUNK)
                    .map_err(|e| VoiceError::Playback(e.to_string()))?;
                self.resampler = Some((sample_rate, resampler));
            }
            resampled = match self.resampler.as_mut() {
                Some((_, resampler)) => resampler.process(samples),
                None => Vec::new(),
            };
            &resampled[..]
        };

        let written = self.producer.push_slice(samples);
        if written < samples.len() {
            warn!(dropped = samples.len() - written, "Audio output buffer full");
            return Err(VoiceError::Playback("output buffer full".to_string()));
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}
