//! Audio playback: serializes arbitrarily-sized arriving PCM chunks into
//! gapless FIFO playback with mid-utterance interruption.
//!
//! The manager owns the queue and the `idle → playing → idle` cycle; the
//! actual output is behind [`OutputSink`], whose contract is that each write
//! is appended to the output timeline immediately after the previous one
//! (no gap, no overlap). A cpal + ring buffer device sink is provided in
//! [`DeviceSink`].

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Producer, Split};
use socratic_core::pcm;
use socratic_core::protocol::PLAYBACK_SAMPLE_RATE;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Lifecycle events of one queue-drain cycle: `Started` fires once for the
/// first chunk of a run, `Ended` once when the queue empties or playback is
/// interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started,
    Ended,
}

/// Destination for decoded samples at the fixed playback rate.
#[async_trait]
pub trait OutputSink: Send + 'static {
    /// Appends samples to the output timeline, directly after whatever was
    /// written before. May suspend for pacing; returns once accepted.
    async fn write(&mut self, samples: &[f32]) -> anyhow::Result<()>;

    /// Drops anything buffered but not yet audible. Default: nothing to drop.
    async fn cancel(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct PlaybackManager {
    shared: Arc<Shared>,
}

struct Shared {
    queue: Mutex<QueueState>,
    /// Interrupt generation. A bump is observable by `changed()` even when it
    /// lands before the drain task registers, unlike a bare notify.
    interrupt: watch::Sender<u64>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    sink: tokio::sync::Mutex<Option<Box<dyn OutputSink>>>,
}

#[derive(Default)]
struct QueueState {
    chunks: VecDeque<Vec<u8>>,
    playing: bool,
    interrupted: bool,
}

impl PlaybackManager {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (interrupt, _) = watch::channel(0u64);
        let manager = Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueState::default()),
                interrupt,
                events,
                sink: tokio::sync::Mutex::new(None),
            }),
        };
        (manager, events_rx)
    }

    /// Installs the output sink. Lazily called after a user gesture on
    /// platforms with autoplay restrictions; idempotent.
    pub async fn initialize(&self, sink: Box<dyn OutputSink>) {
        let mut slot = self.shared.sink.lock().await;
        if slot.is_none() {
            *slot = Some(sink);
            info!("playback output initialized");
        }
    }

    /// Appends a PCM16 chunk to the queue and starts draining when idle.
    /// Never blocks.
    pub fn enqueue(&self, chunk: Vec<u8>) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.chunks.push_back(chunk);
        if !queue.playing {
            queue.playing = true;
            queue.interrupted = false;
            drop(queue);
            let shared = self.shared.clone();
            tokio::spawn(drain(shared));
        }
    }

    /// Empties the queue and force-stops the chunk in flight. Safe to call
    /// at any time, including when nothing is playing; repeated calls are
    /// no-ops.
    pub fn interrupt(&self) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.chunks.clear();
        if queue.playing {
            queue.interrupted = true;
            drop(queue);
            self.shared.interrupt.send_modify(|generation| *generation += 1);
        }
    }

    /// Interrupts and releases the output sink.
    pub async fn dispose(&self) {
        self.interrupt();
        let mut slot = self.shared.sink.lock().await;
        *slot = None;
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().unwrap().chunks.len()
    }

    pub fn is_playing(&self) -> bool {
        self.shared.queue.lock().unwrap().playing
    }
}

async fn drain(shared: Arc<Shared>) {
    let _ = shared.events.send(PlaybackEvent::Started);
    // Bumps older than this subscription are covered by the flag check at
    // the top of the loop; later ones wake `changed()` regardless of when
    // the select registers.
    let mut interrupts = shared.interrupt.subscribe();
    let mut sink = shared.sink.lock().await;
    let mut flush_output = false;
    loop {
        let next = {
            let mut queue = shared.queue.lock().unwrap();
            if queue.interrupted {
                queue.chunks.clear();
                flush_output = true;
            }
            match queue.chunks.pop_front() {
                Some(chunk) => Some(chunk),
                None => {
                    queue.playing = false;
                    queue.interrupted = false;
                    None
                }
            }
        };
        let Some(chunk) = next else { break };
        let samples = pcm::pcm16_to_f32(&chunk);
        let Some(out) = sink.as_mut() else {
            debug!("dropping audio chunk; playback not initialized");
            continue;
        };
        tokio::select! {
            result = out.write(&samples) => {
                if let Err(err) = result {
                    warn!(%err, "output sink write failed");
                    let mut queue = shared.queue.lock().unwrap();
                    queue.chunks.clear();
                    queue.playing = false;
                    queue.interrupted = false;
                    break;
                }
            }
            _ = interrupts.changed() => {
                flush_output = true;
                let mut queue = shared.queue.lock().unwrap();
                queue.chunks.clear();
                queue.playing = false;
                queue.interrupted = false;
                break;
            }
        }
    }
    // Every interrupted exit flushes the sink, including the path where the
    // flag was observed only after a write ran to completion.
    if flush_output {
        if let Some(out) = sink.as_mut() {
            if let Err(err) = out.cancel().await {
                debug!(%err, "output cancel failed");
            }
        }
    }
    let _ = shared.events.send(PlaybackEvent::Ended);
}

/// Speaker output: a lock-free ring buffer feeding a cpal output stream that
/// runs on its own thread. Writes pace themselves against the ring.
pub struct DeviceSink {
    producer: ringbuf::HeapProd<f32>,
    flush: Arc<AtomicBool>,
    native_rate: u32,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl DeviceSink {
    /// Opens the default output device, preferring the playback rate.
    pub fn open() -> anyhow::Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow::anyhow!("no output device found"))?;
        let supported = device.default_output_config()?;
        let config: cpal::StreamConfig = supported.config();
        let native_rate = config.sample_rate.0;
        let channels = config.channels as usize;
        info!(rate = native_rate, channels, "opening output device");

        // Two seconds of headroom at the device rate.
        let ring = HeapRb::<f32>::new(native_rate as usize * 2);
        let (producer, mut consumer) = ring.split();
        let flush = Arc::new(AtomicBool::new(false));
        let flush_cb = flush.clone();

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel();
        let worker = std::thread::spawn(move || {
            let stream = device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if flush_cb.swap(false, Ordering::AcqRel) {
                        while consumer.try_pop().is_some() {}
                    }
                    for frame in data.chunks_mut(channels) {
                        let sample = consumer.try_pop().unwrap_or(0.0);
                        frame.fill(sample);
                    }
                },
                |err| warn!(%err, "output stream error"),
                None,
            );
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = ready_tx.send(Err(anyhow::anyhow!(err)));
                    return;
                }
            };
            if let Err(err) = stream.play() {
                let _ = ready_tx.send(Err(anyhow::anyhow!(err)));
                return;
            }
            let _ = ready_tx.send(Ok(()));
            let _ = stop_rx.recv();
            drop(stream);
        });
        ready_rx
            .recv_timeout(Duration::from_secs(2))
            .map_err(|_| anyhow::anyhow!("output worker startup timeout"))??;

        Ok(Self {
            producer,
            flush,
            native_rate,
            stop_tx: Some(stop_tx),
            worker: Some(worker),
        })
    }
}

#[async_trait]
impl OutputSink for DeviceSink {
    async fn write(&mut self, samples: &[f32]) -> anyhow::Result<()> {
        let resampled;
        let mut pending: &[f32] = if self.native_rate == PLAYBACK_SAMPLE_RATE {
            samples
        } else {
            resampled = pcm::resample_linear(samples, PLAYBACK_SAMPLE_RATE, self.native_rate);
            &resampled
        };
        while !pending.is_empty() {
            let pushed = self.producer.push_slice(pending);
            pending = &pending[pushed..];
            if !pending.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        Ok(())
    }

    async fn cancel(&mut self) -> anyhow::Result<()> {
        self.flush.store(true, Ordering::Release);
        Ok(())
    }
}

impl Drop for DeviceSink {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
