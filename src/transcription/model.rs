//! # Whisper Speech Model
//!
//! The in-process speech-to-text model served by the model host.
//!
//! ## Model Loading Process:
//! 1. Create a HuggingFace API client (token and cache dir from the environment)
//! 2. Download config, tokenizer, weights and the mel filter bank (cached locally)
//! 3. Initialize the model on the selected device (CPU/GPU)
//!
//! ## Decoding:
//! Audio is cut into 30 second chunks. Each chunk becomes a log-mel
//! spectrogram, runs through the encoder once, and is decoded greedily
//! until end-of-text, the token limit, or a repetition loop. Chunk texts are
//! joined with single spaces.

use crate::audio::AudioFrame;
use anyhow::{anyhow, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use tokenizers::Tokenizer;

/// Repository holding a precomputed 80-bin mel filter bank.
const MEL_FILTERS_REPO: &str = "FL33TW00D-HF/whisper-base";

/// Upper bound on generated tokens per 30 second chunk.
const MAX_TOKENS_PER_CHUNK: usize = 224;

/// Anything that can turn a normalized frame into text.
///
/// Implementations run on a blocking thread and may take `&mut self`;
/// whoever owns the model hands it to exactly one inference at a time.
pub trait SpeechModel: Send {
    fn transcribe(&mut self, frame: &AudioFrame) -> Result<String>;

    /// Short label for logs.
    fn name(&self) -> String {
        "speech-model".to_string()
    }
}

/// Available Whisper model sizes.
///
/// ## Trade-offs:
/// Larger models are more accurate but slower and use more memory.
/// `Tiny` is the default, it loads quickly and is good enough for clips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    #[default]
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    /// HuggingFace repository of the weights.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
        }
    }

    /// Approximate download size in MB.
    pub fn size_mb(&self) -> u32 {
        match self {
            ModelSize::Tiny => 39,
            ModelSize::Base => 74,
            ModelSize::Small => 244,
            ModelSize::Medium => 769,
            ModelSize::Large => 1550,
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        write!(f, "{}", name)
    }
}

/// Special token ids resolved from the tokenizer once at load time.
#[derive(Debug, Clone, Copy)]
struct PromptTokens {
    sot: u32,
    transcribe: u32,
    no_timestamps: u32,
    eot: u32,
}

impl PromptTokens {
    fn resolve(tokenizer: &Tokenizer) -> Result<Self> {
        let id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("token not found in vocabulary: {}", token))
        };

        Ok(Self {
            sot: id(m::SOT_TOKEN)?,
            transcribe: id(m::TRANSCRIBE_TOKEN)?,
            no_timestamps: id(m::NO_TIMESTAMPS_TOKEN)?,
            eot: id(m::EOT_TOKEN)?,
        })
    }

    fn prompt(&self) -> Vec<u32> {
        vec![self.sot, self.transcribe, self.no_timestamps]
    }
}

/// A loaded Whisper model.
///
/// Not shared: the model host owns it and moves it into each blocking
/// inference task, so no lock guards it.
pub struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    device: Device,
    size: ModelSize,
    tokenizer: Tokenizer,
    tokens: PromptTokens,
    mel_filters: Vec<f32>,
}

impl WhisperModel {
    /// Load a Whisper model from HuggingFace.
    ///
    /// ## Parameters:
    /// - **size**: Which model size to load
    /// - **device**: Device to load the model on (CPU/GPU)
    pub async fn load(size: ModelSize, device: Device) -> Result<Self> {
        tracing::info!("Loading Whisper {} model (~{}MB)...", size, size.size_mb());
        let start_time = std::time::Instant::now();

        let api = Self::hub_api()?;

        let repo = api.model(size.repo_name().to_string());
        let config_filename = repo
            .get("config.json")
            .await
            .map_err(|e| anyhow!("Failed to download config.json from {}: {}", size.repo_name(), e))?;
        let tokenizer_filename = repo
            .get("tokenizer.json")
            .await
            .map_err(|e| anyhow!("Failed to download tokenizer.json from {}: {}", size.repo_name(), e))?;
        let model_filename = repo
            .get("model.safetensors")
            .await
            .map_err(|e| anyhow!("Failed to download model weights from {}: {}", size.repo_name(), e))?;

        let mel_filename = api
            .model(MEL_FILTERS_REPO.to_string())
            .get("melfilters.bytes")
            .await
            .map_err(|e| anyhow!("Failed to download mel filters: {}", e))?;

        let config: Config = serde_json::from_reader(std::fs::File::open(config_filename)?)?;
        tracing::debug!(mel_bins = config.num_mel_bins, "Model config loaded");

        let tokenizer =
            Tokenizer::from_file(tokenizer_filename).map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        let tokens = PromptTokens::resolve(&tokenizer)?;

        let mel_filters = read_mel_filters(&std::fs::read(mel_filename)?, config.num_mel_bins)?;

        // SAFETY: the safetensors file is memory-mapped read-only
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[model_filename], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        tracing::info!(
            "Whisper {} model loaded in {:.2}s",
            size,
            start_time.elapsed().as_secs_f64()
        );

        Ok(Self {
            model,
            config,
            device,
            size,
            tokenizer,
            tokens,
            mel_filters,
        })
    }

    fn hub_api() -> Result<hf_hub::api::tokio::Api> {
        use hf_hub::api::tokio::ApiBuilder;

        let mut builder = ApiBuilder::new().with_progress(false);

        if let Ok(token) = std::env::var("HF_TOKEN") {
            tracing::debug!("Using HF token (length: {})", token.len());
            builder = builder.with_token(Some(token));
        }

        if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
            builder = builder.with_cache_dir(cache_dir.into());
        } else if let Ok(hf_home) = std::env::var("HF_HOME") {
            builder = builder.with_cache_dir(std::path::PathBuf::from(hf_home).join("hub"));
        }

        builder
            .build()
            .map_err(|e| anyhow!("Failed to create HuggingFace API client: {}", e))
    }

    /// Greedy decode of one 30 second chunk.
    fn decode_chunk(&mut self, chunk: &[f32]) -> Result<String> {
        let mel = m::audio::pcm_to_mel(&self.config, chunk, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let n_frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, n_frames), &self.device)?;

        let features = self.model.encoder.forward(&mel, true)?;

        let mut tokens = self.tokens.prompt();
        let prompt_len = tokens.len();
        let mut output: Vec<u32> = Vec::new();

        for _ in 0..MAX_TOKENS_PER_CHUNK {
            let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let hidden = self
                .model
                .decoder
                .forward(&input, &features, tokens.len() == prompt_len)?;
            let logits = self.model.decoder.final_linear(&hidden.squeeze(0)?)?;

            let seq_len = logits.dim(0)?;
            let next = logits.get(seq_len - 1)?.argmax(0)?.to_scalar::<u32>()?;

            if next == self.tokens.eot {
                break;
            }
            if is_repetitive(&output, next) {
                tracing::debug!(token = next, "Stopping decode on repetition loop");
                break;
            }

            tokens.push(next);
            output.push(next);
        }

        self.model.reset_kv_cache();
        self.decode_tokens(&output)
    }

    fn decode_tokens(&self, tokens: &[u32]) -> Result<String> {
        let text = self
            .tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;
        Ok(text.trim().to_string())
    }
}

impl SpeechModel for WhisperModel {
    fn transcribe(&mut self, frame: &AudioFrame) -> Result<String> {
        if frame.is_empty() {
            return Err(anyhow!("Audio data is empty"));
        }

        let start_time = std::time::Instant::now();
        let mut segments = Vec::new();

        for (index, chunk) in frame.samples().chunks(m::N_SAMPLES).enumerate() {
            let mut padded = chunk.to_vec();
            padded.resize(m::N_SAMPLES, 0.0);

            let text = self.decode_chunk(&padded)?;
            tracing::trace!(segment = index, chars = text.len(), "Decoded segment");
            if !text.is_empty() {
                segments.push(text);
            }
        }

        let transcript = segments.join(" ");
        tracing::debug!(
            "Transcribed {:.2}s of audio in {:.2}s ({} chars)",
            frame.duration_secs(),
            start_time.elapsed().as_secs_f64(),
            transcript.len()
        );
        Ok(transcript)
    }

    fn name(&self) -> String {
        format!("whisper-{}", self.size)
    }
}

/// Parse the little-endian f32 filter bank, `n_mels × (N_FFT/2 + 1)` values.
fn read_mel_filters(bytes: &[u8], n_mels: usize) -> Result<Vec<f32>> {
    let expected = n_mels * (m::N_FFT / 2 + 1);
    if bytes.len() < expected * 4 {
        return Err(anyhow!(
            "mel filters file too small: {} bytes, expected at least {}",
            bytes.len(),
            expected * 4
        ));
    }

    Ok(bytes
        .chunks_exact(4)
        .take(expected)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// True when `next` would extend an obvious loop: the same token four times
/// running, or the last three tokens repeating the three before them.
fn is_repetitive(tokens: &[u32], next: u32) -> bool {
    let n = tokens.len();
    if n >= 3 && tokens[n - 3..].iter().all(|&t| t == next) {
        return true;
    }
    if n >= 5 {
        let last = [tokens[n - 2], tokens[n - 1], next];
        if tokens[n - 5..n - 2] == last {
            return true;
        }
    }
    false
}
