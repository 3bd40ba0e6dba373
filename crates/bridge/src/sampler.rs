//! Throttled screen/webcam frame capture.
//!
//! A sampler polls its [`VideoSource`] once per second, downscales the frame
//! to fit within a square bound, encodes it as JPEG and hands the base64
//! string to the caller's sink. When the source reports end of stream the
//! sampler tears itself down and fires the `on_ended` callback exactly once.

use crate::config::{FRAME_BOUND, FRAME_INTERVAL, JPEG_QUALITY};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage, imageops};
use socratic_core::pcm;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    #[error("video source failed: {0}")]
    Source(String),

    #[error("frame dimensions do not match buffer length")]
    BadFrame,

    #[error("jpeg encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Which kind of track a sampler is attached to. Purely informational; both
/// kinds share the same cadence and encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Screen,
    Webcam,
}

/// One uncompressed RGB frame from a video track.
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

/// Pull-based video track. `Ok(None)` means the track has ended (the user
/// stopped sharing); the sampler stops itself on seeing it.
pub trait VideoSource: Send + 'static {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, SamplerError>;
}

/// A running sampler. Dropping the handle stops the loop.
pub struct FrameSampler {
    kind: SourceKind,
    task: Option<JoinHandle<()>>,
}

impl FrameSampler {
    /// Starts sampling `source` at the fixed cadence, delivering encoded
    /// frames to `sink`. Source errors skip that tick; end of stream stops
    /// the sampler and invokes `on_ended`.
    pub fn start<V, F, E>(kind: SourceKind, mut source: V, mut sink: F, on_ended: E) -> Self
    where
        V: VideoSource,
        F: FnMut(String) + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        info!(?kind, "frame sampler started");
        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(FRAME_INTERVAL);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                match source.next_frame() {
                    Ok(Some(frame)) => match encode_frame(&frame) {
                        Ok(encoded) => sink(encoded),
                        Err(err) => warn!(?kind, %err, "dropping unencodable frame"),
                    },
                    Ok(None) => {
                        info!(?kind, "video track ended; sampler stopping");
                        break;
                    }
                    Err(err) => debug!(?kind, %err, "frame grab failed; skipping tick"),
                }
            }
            on_ended();
        });
        Self {
            kind,
            task: Some(task),
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops the sampling loop. Idempotent; `on_ended` does not fire for an
    /// explicit stop.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!(kind = ?self.kind, "frame sampler stopped");
        }
    }
}

impl Drop for FrameSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Scales `(width, height)` down to fit within `bound`x`bound`, preserving
/// aspect ratio. Frames already inside the bound keep their size.
pub fn fit_within(width: u32, height: u32, bound: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= bound || longest == 0 {
        return (width, height);
    }
    let scale = bound as f64 / longest as f64;
    let w = ((width as f64 * scale).round() as u32).max(1);
    let h = ((height as f64 * scale).round() as u32).max(1);
    (w, h)
}

/// Downscales and JPEG-encodes a raw frame, returning base64.
pub fn encode_frame(frame: &RawFrame) -> Result<String, SamplerError> {
    let image = RgbImage::from_raw(frame.width, frame.height, frame.rgb.clone())
        .ok_or(SamplerError::BadFrame)?;
    let (width, height) = fit_within(frame.width, frame.height, FRAME_BOUND);
    let image = if (width, height) == (frame.width, frame.height) {
        image
    } else {
        imageops::resize(&image, width, height, imageops::FilterType::Triangle)
    };
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY).encode(
        image.as_raw(),
        width,
        height,
        ExtendedColorType::Rgb8,
    )?;
    Ok(pcm::encode_base64(&jpeg))
}
