//! Socratic Bridge
//!
//! Async IO around `socratic-core`: the socket transport with automatic
//! reconnection, the audio capture and playback pipelines, the screen and
//! webcam frame samplers, and the session glue that feeds everything through
//! the event reconciler. It is structured into submodules for clarity:
//!
//! - `config`: environment configuration and the fixed media constants.
//! - `transport`: the persistent duplex socket to the agent backend.
//! - `capture`: microphone audio to fixed-cadence PCM16 frames.
//! - `playback`: gapless FIFO playback with mid-utterance interruption.
//! - `sampler`: throttled screen/webcam frame capture.
//! - `session`: one live bridge session tying the pieces together.

pub mod capture;
pub mod config;
pub mod playback;
pub mod sampler;
pub mod session;
pub mod transport;
