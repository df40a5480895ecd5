//! Microphone capture: turns device audio into outbound PCM16 frames.

use async_trait::async_trait;
use std::{
    future::Future,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use voicelink_core::{
    VoiceError,
    audio::{self, CAPTURE_BLOCK_SIZE, CAPTURE_CHANNELS, CAPTURE_SAMPLE_RATE, FrameAssembler},
};

/// What the client asks of the input device.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub channels: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Samples per outbound frame.
    pub block_size: usize,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            sample_rate: CAPTURE_SAMPLE_RATE,
            channels: CAPTURE_CHANNELS,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            block_size: CAPTURE_BLOCK_SIZE,
        }
    }
}

/// The hardware side of an active capture.
pub trait CaptureDevice: Send {
    /// Stops the device and releases it. Must be safe to call repeatedly.
    fn stop(&mut self);
    fn is_live(&self) -> bool;
}

/// A live microphone: mono `f32` samples at the requested rate, in callbacks
/// of whatever size the device produces.
pub struct CaptureStream {
    pub frames: mpsc::Receiver<Vec<f32>>,
    pub device: Box<dyn CaptureDevice>,
}

/// Grants access to an input device.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Microphone: Send + Sync {
    /// Fails with [`VoiceError::Permission`] when access is denied or no
    /// device exists.
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<CaptureStream, VoiceError>;
}

/// Converts one block of float samples into a wire frame.
pub fn encode_frame(samples: &[f32]) -> Vec<u8> {
    audio::encode_pcm16(samples)
}

/// Owns an acquired microphone and the task that forwards its frames.
///
/// The device is released exactly once, on [`release`](Self::release) or drop.
pub struct CapturePipeline {
    device: Box<dyn CaptureDevice>,
    frames: Option<mpsc::Receiver<Vec<f32>>>,
    pump: Option<JoinHandle<()>>,
    block_size: usize,
    released: bool,
}

impl CapturePipeline {
    pub async fn acquire(
        microphone: &dyn Microphone,
        constraints: &CaptureConstraints,
    ) -> Result<Self, VoiceError> {
        let stream = microphone.acquire(constraints).await?;
        info!(
            sample_rate = constraints.sample_rate,
            block_size = constraints.block_size,
            "Microphone acquired"
        );
        Ok(Self {
            device: stream.device,
            frames: Some(stream.frames),
            pump: None,
            block_size: constraints.block_size,
            released: false,
        })
    }

    pub fn is_live(&self) -> bool {
        !self.released && self.device.is_live()
    }

    /// Starts forwarding encoded frames to `sink`. Only the first call has any effect.
    pub fn start<F, Fut>(&mut self, mut sink: F)
    where
        F: FnMut(Vec<u8>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let Some(mut frames) = self.frames.take() else {
            return;
        };
        let mut assembler = FrameAssembler::new(self.block_size);
        self.pump = Some(tokio::spawn(async move {
            while let Some(samples) = frames.recv().await {
                for block in assembler.push(&samples) {
                    sink(encode_frame(&block)).await;
                }
            }
            debug!(pending = assembler.pending(), "Capture stream ended");
        }));
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.frames = None;
        self.device.stop();
        info!("Microphone released");
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.release();
    }
}

/// A device with nothing behind it, for builds without an audio backend.
pub struct NoMicrophone;

#[async_trait]
impl Microphone for NoMicrophone {
    async fn acquire(&self, _constraints: &CaptureConstraints) -> Result<CaptureStream, VoiceError> {
        Err(VoiceError::Permission(
            "no audio input backend is available in this build".to_string(),
        ))
    }
}

/// Plays a raw signed 16-bit little-endian mono file as if it were a
/// microphone, paced at real time.
pub struct PcmFileMicrophone {
    path: PathBuf,
}

impl PcmFileMicrophone {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

struct TaskDevice {
    task: Option<JoinHandle<()>>,
    live: Arc<AtomicBool>,
}

impl CaptureDevice for TaskDevice {
    fn stop(&mut self) {
        self.live.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Microphone for PcmFileMicrophone {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<CaptureStream, VoiceError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            VoiceError::Permission(format!("cannot open {}: {}", self.path.display(), e))
        })?;
        let samples = audio::decode_pcm16(&bytes);
        if samples.is_empty() {
            warn!(path = %self.path.display(), "Input file holds no audio");
        }
        let block = constraints.block_size.max(1);
        let period = Duration::from_secs_f64(block as f64 / constraints.sample_rate as f64);
        let live = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(8);

        let task_live = live.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            for chunk in samples.chunks(block) {
                ticker.tick().await;
                if tx.send(chunk.to_vec()).await.is_err() {
                    break;
                }
            }
            task_live.store(false, Ordering::SeqCst);
        });

        Ok(CaptureStream {
            frames: rx,
            device: Box::new(TaskDevice {
                task: Some(task),
                live,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FlagDevice {
        stops: Arc<Mutex<u32>>,
    }

    impl CaptureDevice for FlagDevice {
        fn stop(&mut self) {
            *self.stops.lock().unwrap() += 1;
        }

        fn is_live(&self) -> bool {
            *self.stops.lock().unwrap() == 0
        }
    }

    fn mock_microphone(
        tx_slot: Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>,
        stops: Arc<Mutex<u32>>,
    ) -> MockMicrophone {
        let mut mic = MockMicrophone::new();
        mic.expect_acquire().times(1).returning(move |_| {
            let (tx, rx) = mpsc::channel(8);
            *tx_slot.lock().unwrap() = Some(tx);
            Ok(CaptureStream {
                frames: rx,
                device: Box::new(FlagDevice {
                    stops: stops.clone(),
                }),
            })
        });
        mic
    }

    #[test]
    fn test_default_constraints() {
        let c = CaptureConstraints::default();
        assert_eq!(c.sample_rate, 16_000);
        assert_eq!(c.channels, 1);
        assert!(c.echo_cancellation && c.noise_suppression && c.auto_gain_control);
        assert_eq!(c.block_size, 4096);
    }

    #[tokio::test]
    async fn test_pipeline_reblocks_and_encodes() {
        let tx_slot = Arc::new(Mutex::new(None));
        let stops = Arc::new(Mutex::new(0));
        let mic = mock_microphone(tx_slot.clone(), stops.clone());
        let constraints = CaptureConstraints {
            block_size: 4,
            ..Default::default()
        };

        let mut pipeline = CapturePipeline::acquire(&mic, &constraints).await.unwrap();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        pipeline.start(move |frame| {
            let out_tx = out_tx.clone();
            async move {
                let _ = out_tx.send(frame);
            }
        });

        let tx = tx_slot.lock().unwrap().clone().unwrap();
        tx.send(vec![0.5, 0.5, 0.5]).await.unwrap();
        tx.send(vec![0.5, 2.0, -1.0]).await.unwrap();

        let frame = out_rx.recv().await.unwrap();
        assert_eq!(frame.len(), 8);
        assert_eq!(frame, encode_frame(&[0.5, 0.5, 0.5, 0.5]));
        assert!(out_rx.try_recv().is_err());

        pipeline.release();
        assert!(!pipeline.is_live());
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_runs_on_drop() {
        let stops = Arc::new(Mutex::new(0));
        let mic = mock_microphone(Arc::new(Mutex::new(None)), stops.clone());
        let mut pipeline = CapturePipeline::acquire(&mic, &CaptureConstraints::default())
            .await
            .unwrap();
        assert!(pipeline.is_live());

        pipeline.release();
        pipeline.release();
        drop(pipeline);
        assert_eq!(*stops.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_permission_error_is_propagated() {
        let mut mic = MockMicrophone::new();
        mic.expect_acquire()
            .returning(|_| Err(VoiceError::Permission("denied by user".into())));

        let result = CapturePipeline::acquire(&mic, &CaptureConstraints::default()).await;
        assert!(matches!(result, Err(VoiceError::Permission(_))));
    }

    #[tokio::test]
    async fn test_no_microphone_reports_permission_error() {
        let result = NoMicrophone.acquire(&CaptureConstraints::default()).await;
        assert!(matches!(result, Err(VoiceError::Permission(_))));
    }

    #[tokio::test]
    async fn test_pcm_file_microphone() {
        let path = std::env::temp_dir().join(format!("voicelink-mic-{}.raw", std::process::id()));
        std::fs::write(&path, audio::encode_pcm16(&[0.25; 6])).unwrap();

        let constraints = CaptureConstraints {
            sample_rate: 1_000,
            block_size: 4,
            ..Default::default()
        };
        let mut stream = PcmFileMicrophone::new(&path).acquire(&constraints).await.unwrap();
        assert_eq!(stream.frames.recv().await.unwrap().len(), 4);
        assert_eq!(stream.frames.recv().await.unwrap().len(), 2);
        assert!(stream.frames.recv().await.is_none());
        stream.device.stop();
        assert!(!stream.device.is_live());

        let missing = PcmFileMicrophone::new(path.with_extension("missing"))
            .acquire(&constraints)
            .await;
        assert!(matches!(missing, Err(VoiceError::Permission(_))));
        let _ = std::fs::remove_file(&path);
    }
}
