//! Audio capture pipeline: turns a live microphone stream into fixed-cadence
//! PCM16 frames at the wire sample rate, delivered to a caller-supplied sink.
//!
//! The pure frame logic lives in [`FrameChunker`]; [`MicCapture`] owns the
//! cpal input stream on a dedicated worker thread (the stream is not `Send`).

use crate::config::CAPTURE_FRAME_SIZE;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SampleFormat, SizedSample};
use socratic_core::pcm;
use socratic_core::protocol::CAPTURE_SAMPLE_RATE;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("no input device found")]
    NoInputDevice,

    #[error("failed to get default config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build input stream: {0}")]
    BuildStream(cpal::BuildStreamError),

    #[error("failed to play stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("unsupported input sample format: {0}")]
    UnsupportedFormat(String),

    #[error("audio worker startup timeout")]
    WorkerTimeout,

    #[error("internal channel error")]
    Channel,
}

fn map_build_error(err: cpal::BuildStreamError) -> CaptureError {
    match err {
        // The OS reports a denied microphone as an unavailable device.
        cpal::BuildStreamError::DeviceNotAvailable => CaptureError::PermissionDenied,
        other => CaptureError::BuildStream(other),
    }
}

/// Accumulates raw f32 samples at the device's native rate into fixed-size
/// frames, resamples each frame to the wire rate, and emits PCM16 bytes.
/// Frames are emitted in order with no drops; the sink must be fast and
/// non-blocking.
pub struct FrameChunker {
    native_rate: u32,
    frame_size: usize,
    buf: Vec<f32>,
}

impl FrameChunker {
    pub fn new(native_rate: u32) -> Self {
        Self::with_frame_size(native_rate, CAPTURE_FRAME_SIZE)
    }

    pub fn with_frame_size(native_rate: u32, frame_size: usize) -> Self {
        Self {
            native_rate,
            frame_size,
            buf: Vec::with_capacity(frame_size * 2),
        }
    }

    pub fn push(&mut self, samples: &[f32], mut sink: impl FnMut(Vec<u8>)) {
        self.buf.extend_from_slice(samples);
        while self.buf.len() >= self.frame_size {
            let frame: Vec<f32> = self.buf.drain(..self.frame_size).collect();
            let resampled = pcm::resample_linear(&frame, self.native_rate, CAPTURE_SAMPLE_RATE);
            sink(pcm::f32_to_pcm16(&resampled));
        }
    }
}

enum WorkerMsg {
    Ready,
    Failed(CaptureError),
}

/// Live microphone capture. Frames flow to the sink until [`Self::stop`] is
/// called or the handle is dropped.
pub struct MicCapture {
    stop_tx: Option<mpsc::Sender<()>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl MicCapture {
    /// Requests the default input device (mono preferred, ideal rate 16 kHz)
    /// and starts delivering encoded frames to `sink`. On failure nothing is
    /// left running: the worker tears down before the error is returned.
    pub fn start<F>(sink: F) -> Result<Self, CaptureError>
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(CaptureError::NoInputDevice)?;
        let supported = preferred_config(&device)?;
        info!(
            rate = supported.sample_rate().0,
            channels = supported.channels(),
            format = ?supported.sample_format(),
            "opening input device"
        );

        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel();
        let worker = std::thread::spawn(move || {
            let config: cpal::StreamConfig = supported.config();
            let channels = config.channels as usize;
            let native_rate = config.sample_rate.0;
            let mut chunker = FrameChunker::new(native_rate);
            let mut sink = sink;
            let on_samples = move |mono: &[f32]| {
                chunker.push(mono, |frame| sink(frame));
            };

            let stream = match supported.sample_format() {
                SampleFormat::F32 => build_input_stream::<f32, _>(&device, &config, channels, on_samples),
                SampleFormat::I16 => build_input_stream::<i16, _>(&device, &config, channels, on_samples),
                SampleFormat::U16 => build_input_stream::<u16, _>(&device, &config, channels, on_samples),
                other => {
                    let _ = ready_tx.send(WorkerMsg::Failed(CaptureError::UnsupportedFormat(
                        format!("{other:?}"),
                    )));
                    return;
                }
            };
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = ready_tx.send(WorkerMsg::Failed(map_build_error(err)));
                    return;
                }
            };
            if let Err(err) = stream.play() {
                let _ = ready_tx.send(WorkerMsg::Failed(err.into()));
                return;
            }
            let _ = ready_tx.send(WorkerMsg::Ready);

            // Park until stop()/drop; the stream lives as long as this thread.
            let _ = stop_rx.recv();
            drop(stream);
        });

        match ready_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(WorkerMsg::Ready) => Ok(Self {
                stop_tx: Some(stop_tx),
                worker: Some(worker),
            }),
            Ok(WorkerMsg::Failed(err)) => {
                let _ = worker.join();
                Err(err)
            }
            Err(mpsc::RecvTimeoutError::Timeout) => Err(CaptureError::WorkerTimeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(CaptureError::Channel),
        }
    }

    /// Releases the stream and worker thread. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Prefers a mono stream at the wire rate; falls back to the device default.
fn preferred_config(device: &cpal::Device) -> Result<cpal::SupportedStreamConfig, CaptureError> {
    if let Ok(configs) = device.supported_input_configs() {
        for range in configs {
            if range.channels() == 1
                && range.sample_format() == SampleFormat::F32
                && range.min_sample_rate().0 <= CAPTURE_SAMPLE_RATE
                && range.max_sample_rate().0 >= CAPTURE_SAMPLE_RATE
            {
                return Ok(range.with_sample_rate(cpal::SampleRate(CAPTURE_SAMPLE_RATE)));
            }
        }
    }
    Ok(device.default_input_config()?)
}

fn build_input_stream<T, F>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    mut on_samples: F,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: Sample + SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
    F: FnMut(&[f32]) + Send + 'static,
{
    let mut mono: Vec<f32> = Vec::new();
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            mono.clear();
            if channels == 1 {
                mono.extend(data.iter().map(|&s| s.to_sample::<f32>()));
            } else {
                for frame in data.chunks_exact(channels) {
                    let sum: f32 = frame.iter().map(|&s| s.to_sample::<f32>()).sum();
                    mono.push(sum / channels as f32);
                }
            }
            on_samples(&mono);
        },
        |err| warn!(%err, "input stream error"),
        None,
    )
}
