//! Socratic Core
//!
//! Pure protocol and state logic for the realtime BIDI tutoring bridge:
//! PCM codec utilities, the wire protocol types, the transcript model, and
//! the event reconciler that turns raw wire messages into typed state
//! updates and actions. Everything here is IO-free and synchronous; the
//! async plumbing lives in `socratic-bridge`.

pub mod pcm;
pub mod protocol;
pub mod reconciler;
pub mod transcript;
