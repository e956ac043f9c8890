//! # Audio Module
//!
//! Everything needed to get from an audio URL to something a backend can
//! consume.
//!
//! ## Key Components:
//! - **Frame**: the canonical mono 16 kHz float frame and down-mix strategies
//! - **Normalizer**: fetch, decode, down-mix and resample
//! - **WAV**: bit-exact 16-bit PCM container encoding
//!
//! ## Audio Format:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Channels**: Mono (1 channel)
//! - **In memory**: 32-bit float in [-1, 1]
//! - **On the wire**: 16-bit little-endian PCM WAV

pub mod frame;       // Canonical frame and down-mix
pub mod normalizer;  // URL → AudioFrame
pub mod wav;         // AudioFrame → WAV bytes

pub use frame::{AudioFrame, DownmixStrategy, TARGET_SAMPLE_RATE};
pub use normalizer::{AudioFetcher, AudioNormalizer, HttpFetcher};
pub use wav::encode_wav;
