//! # Audio Normalizer
//!
//! Turns an audio URL into an `AudioFrame`: mono, 16 kHz, 32-bit float.
//!
//! ## Pipeline:
//! 1. **Fetch**: download the resource (`AudioFetcher`), non-success → `Network`
//! 2. **Decode**: probe and decode the container with symphonia → `Decode` on failure
//! 3. **Down-mix**: fold two or more channels with the `DownmixStrategy`
//!    configured at the time of the call
//! 4. **Resample**: convert to 16 kHz with rubato when the source rate differs
//!
//! Decoding and resampling are CPU-bound, so they run on the blocking pool.

use crate::audio::frame::{AudioFrame, DownmixStrategy, TARGET_SAMPLE_RATE};
use crate::config::{read_live, SharedConfig};
use crate::error::DispatchError;
use async_trait::async_trait;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Source of raw audio bytes.
#[async_trait]
pub trait AudioFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, DispatchError>;
}

/// Fetches audio over HTTP(S) with a shared reqwest client.
///
/// The timeout is `audio.fetch_timeout_secs`, read for every request.
pub struct HttpFetcher {
    client: reqwest::Client,
    config: SharedConfig,
}

impl HttpFetcher {
    pub fn new(config: SharedConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, config })
    }

    /// Links extracted from free text may lack a scheme; assume https.
    fn absolute_url(url: &str) -> String {
        if url.contains("://") {
            url.to_string()
        } else {
            format!("https://{}", url.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl AudioFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, DispatchError> {
        let target = Self::absolute_url(url);
        let timeout = Duration::from_secs(read_live(&self.config, |c| c.audio.fetch_timeout_secs));
        tracing::debug!(url = %target, timeout_secs = timeout.as_secs(), "Fetching audio");

        let response = self
            .client
            .get(&target)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| DispatchError::Network(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Network(format!("failed to fetch audio: HTTP {}", status.as_u16())));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| DispatchError::Network(format!("body: {}", e)))?;

        tracing::debug!(url = %target, bytes = bytes.len(), "Audio fetched");
        Ok(bytes.to_vec())
    }
}

/// Produces canonical frames from audio URLs.
pub struct AudioNormalizer {
    fetcher: Arc<dyn AudioFetcher>,
    config: SharedConfig,
}

impl AudioNormalizer {
    pub fn new(fetcher: Arc<dyn AudioFetcher>, config: SharedConfig) -> Self {
        Self { fetcher, config }
    }

    /// Fetch, decode, down-mix and resample one resource.
    pub async fn normalize(&self, url: &str) -> Result<AudioFrame, DispatchError> {
        let bytes = self.fetcher.fetch(url).await?;
        let hint = extension_hint(url).map(str::to_string);
        let downmix = read_live(&self.config, |c| c.audio.downmix);

        let frame = tokio::task::spawn_blocking(move || decode_to_frame(bytes, hint.as_deref(), downmix))
            .await
            .map_err(|e| DispatchError::Decode(format!("decoder task failed: {}", e)))??;

        tracing::debug!(
            url = %url,
            samples = frame.len(),
            duration_secs = frame.duration_secs(),
            downmix = %downmix,
            "Audio normalized to 16kHz mono"
        );
        Ok(frame)
    }
}

/// File extension of the URL path, ignoring query and fragment.
pub fn extension_hint(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 {
        None
    } else {
        Some(ext)
    }
}

/// Decode container bytes into a normalized frame.
pub fn decode_to_frame(
    bytes: Vec<u8>,
    extension: Option<&str>,
    downmix: DownmixStrategy,
) -> Result<AudioFrame, DispatchError> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(&ext.to_lowercase());
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| DispatchError::Decode(format!("probe: {}", e)))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| DispatchError::Decode("no audio track found".to_string()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let source_rate = codec_params
        .sample_rate
        .ok_or_else(|| DispatchError::Decode("unknown sample rate".to_string()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| DispatchError::Decode(format!("codec: {}", e)))?;

    let mut mono: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(DispatchError::Decode(format!("packet: {}", e))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::warn!(error = %e, "Skipping corrupt audio frame");
                continue;
            }
            Err(e) => return Err(DispatchError::Decode(format!("decode: {}", e))),
        };

        let spec = *decoded.spec();
        let frames = decoded.frames();
        if frames == 0 {
            continue;
        }

        let mut sample_buf = SampleBuffer::<f32>::new(frames as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);
        let channels = spec.channels.count();
        mono.extend(downmix.downmix_interleaved(sample_buf.samples(), channels));
    }

    if mono.is_empty() {
        return Err(DispatchError::Decode("no audio samples decoded".to_string()));
    }

    if source_rate != TARGET_SAMPLE_RATE {
        mono = resample(&mono, source_rate, TARGET_SAMPLE_RATE)?;
    }

    Ok(AudioFrame::new(mono))
}

fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, DispatchError> {
    use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = to_rate as f64 / from_rate as f64;
    let chunk_size = 1024;
    let expected = (samples.len() as f64 * ratio).round() as usize;
    let resample_err = |e: rubato::ResampleError| DispatchError::Decode(format!("resample: {}", e));

    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_size, 1)
        .map_err(|e| DispatchError::Decode(format!("resampler init: {}", e)))?;

    // The sinc filter emits this many leading samples before the first real one
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(delay + expected + chunk_size);

    let mut chunks = samples.chunks_exact(chunk_size);
    for chunk in &mut chunks {
        let result = resampler.process(&[chunk], None).map_err(resample_err)?;
        output.extend(result.into_iter().flatten());
    }

    let rest = chunks.remainder();
    if !rest.is_empty() {
        let result = resampler.process_partial(Some(&[rest][..]), None).map_err(resample_err)?;
        output.extend(result.into_iter().flatten());
    }

    // Flush the filter until the tail of the input has come out
    while output.len() < delay + expected {
        let result = resampler.process_partial::<&[f32]>(None, None).map_err(resample_err)?;
        let before = output.len();
        output.extend(result.into_iter().flatten());
        if output.len() == before {
            break;
        }
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected);
    Ok(output)
}

/// In-memory fetcher keyed by URL, for tests.
#[cfg(test)]
pub struct StaticFetcher {
    pub clips: std::collections::HashMap<String, Vec<u8>>,
}

#[cfg(test)]
impl StaticFetcher {
    pub fn with_clip(url: &str, bytes: Vec<u8>) -> Self {
        let mut clips = std::collections::HashMap::new();
        clips.insert(url.to_string(), bytes);
        Self { clips }
    }
}

#[cfg(test)]
#[async_trait]
impl AudioFetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, DispatchError> {
        self.clips
            .get(url)
            .cloned()
            .ok_or_else(|| DispatchError::Network("failed to fetch audio: HTTP 404".to_string()))
    }
}

/// Build a 16-bit PCM WAV with arbitrary rate and channel count, for tests.
#[cfg(test)]
pub fn pcm16_wav(sample_rate: u32, channels: u16, interleaved: &[i16]) -> Vec<u8> {
    let data_len = (interleaved.len() * 2) as u32;
    let mut wav = Vec::with_capacity(44 + data_len as usize);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&(sample_rate * 2 * channels as u32).to_le_bytes());
    wav.extend_from_slice(&(channels * 2).to_le_bytes());
    wav.extend_from_slice(&16u16.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    for sample in interleaved {
        wav.extend_from_slice(&sample.to_le_bytes());
    }
    wav
}
