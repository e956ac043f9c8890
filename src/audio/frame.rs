//! # Canonical Audio Frames
//!
//! Every backend consumes audio in exactly one shape: mono, 32-bit float
//! samples at 16 kHz. `AudioFrame` is that shape. It is produced once per
//! transcription attempt by the normalizer and never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Sample rate every frame is normalized to.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Channel count every frame is normalized to.
pub const TARGET_CHANNELS: u16 = 1;

/// A normalized block of PCM audio.
///
/// ## Ownership:
/// Fields are private so a frame cannot be edited after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl AudioFrame {
    /// Wrap samples that are already mono 16 kHz.
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples,
            sample_rate: TARGET_SAMPLE_RATE,
            channels: TARGET_CHANNELS,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration of the frame in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// How a stereo source is folded into one channel.
///
/// ## Strategies:
/// - **Average**: `(l + r) / 2`. A plain arithmetic mean; quieter than the
///   source when the channels are uncorrelated.
/// - **ScaledSum**: `√2 · (l + r) / 2`. Keeps the perceived loudness of
///   uncorrelated channels; this is the mix the in-process model path uses.
///
/// Sources with more than two channels are mixed from their first two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownmixStrategy {
    #[default]
    Average,
    ScaledSum,
}

impl DownmixStrategy {
    /// Mix one left/right sample pair.
    pub fn mix(self, left: f32, right: f32) -> f32 {
        match self {
            DownmixStrategy::Average => (left + right) / 2.0,
            DownmixStrategy::ScaledSum => (std::f32::consts::SQRT_2 * (left + right)) / 2.0,
        }
    }

    /// Fold interleaved samples with `channels` channels into mono.
    pub fn downmix_interleaved(self, interleaved: &[f32], channels: usize) -> Vec<f32> {
        match channels {
            0 | 1 => interleaved.to_vec(),
            _ => interleaved
                .chunks_exact(channels)
                .map(|frame| self.mix(frame[0], frame[1]))
                .collect(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DownmixStrategy::Average => "average",
            DownmixStrategy::ScaledSum => "scaled_sum",
        }
    }
}

impl FromStr for DownmixStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "average" | "mean" => Ok(DownmixStrategy::Average),
            "scaled_sum" | "sqrt2" => Ok(DownmixStrategy::ScaledSum),
            _ => Err(anyhow::anyhow!("Unknown downmix strategy: {}", s)),
        }
    }
}

impl std::fmt::Display for DownmixStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
