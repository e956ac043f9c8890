//! # Transcription Module
//!
//! Backends that turn an audio URL into text, and the machinery behind the
//! in-process one.
//!
//! ## Key Components:
//! - **Backend**: the `TranscriptionBackend` trait and the factory that picks one
//! - **Isolated**: in-process Whisper reached across a message-only boundary
//! - **Remote**: hosted inference service over HTTP
//! - **Protocol / Correlator**: READY/REQUEST/RESPONSE messages and id matching
//! - **Host / Model**: the thread that owns the Whisper model and serves requests

pub mod backend;     // Trait + factory
pub mod correlator;  // Request/response matching with deadlines
pub mod host;        // Model host thread
pub mod isolated;    // Backend over the correlator
pub mod model;       // Whisper via candle
pub mod protocol;    // Boundary messages and channels
pub mod remote;      // Backend over HTTP

pub use backend::{BackendFactory, TranscriptionBackend};
