//! # Remote-Service Backend
//!
//! Sends normalized audio to a hosted inference service (a Gradio-style API).
//!
//! ## Per request:
//! 1. Normalize the URL locally and encode it as 16-bit WAV
//! 2. `POST {base}/upload` as multipart, the reply is a list of server paths
//! 3. `POST {base}/run/{api_name}` with a file reference to that path
//! 4. Pull the transcript out of whatever shape the reply has
//!
//! The client session is created once in `connect` and reused.

use crate::audio::{encode_wav, AudioNormalizer};
use crate::error::DispatchError;
use crate::transcription::backend::TranscriptionBackend;
use async_trait::async_trait;
use reqwest::multipart;
use serde_json::{json, Value};
use std::sync::Arc;

/// How deep `extract_transcript` follows `data` wrappers and nested lists.
const MAX_EXTRACT_DEPTH: usize = 4;

pub struct RemoteServiceBackend {
    client: reqwest::Client,
    base_url: String,
    api_name: String,
    normalizer: Arc<AudioNormalizer>,
}

impl RemoteServiceBackend {
    /// Open the session and check the service answers.
    pub async fn connect(base_url: &str, api_name: &str, normalizer: Arc<AudioNormalizer>) -> anyhow::Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let client = reqwest::Client::builder().build()?;

        let check = client.get(format!("{}/config", base_url)).send().await?;
        if !check.status().is_success() {
            return Err(anyhow::anyhow!(
                "Remote service at {} answered the config request with HTTP {}",
                base_url,
                check.status().as_u16()
            ));
        }

        tracing::info!(base_url = %base_url, api_name = %api_name, "Connected to remote transcription service");
        Ok(Self {
            client,
            base_url,
            api_name: api_name.trim_matches('/').to_string(),
            normalizer,
        })
    }

    async fn upload(&self, wav: Vec<u8>) -> Result<String, DispatchError> {
        let part = multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| DispatchError::Network(format!("mime: {}", e)))?;
        let form = multipart::Form::new().part("files", part);

        let response = self
            .client
            .post(format!("{}/upload", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| DispatchError::Network(format!("upload: {}", e)))?;

        if !response.status().is_success() {
            return Err(DispatchError::Network(format!("upload failed: HTTP {}", response.status().as_u16())));
        }

        let paths: Vec<String> = response
            .json()
            .await
            .map_err(|e| DispatchError::Parse(format!("upload reply: {}", e)))?;

        paths
            .into_iter()
            .next()
            .ok_or_else(|| DispatchError::Parse("upload reply listed no files".to_string()))
    }

    async fn run(&self, path: &str) -> Result<Value, DispatchError> {
        let body = json!({
            "data": [{ "path": path, "meta": { "_type": "gradio.FileData" } }]
        });

        let response = self
            .client
            .post(format!("{}/run/{}", self.base_url, self.api_name))
            .json(&body)
            .send()
            .await
            .map_err(|e| DispatchError::Network(format!("run: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(DispatchError::Network(format!("run failed: HTTP {}: {}", status.as_u16(), detail)));
        }

        response
            .json()
            .await
            .map_err(|e| DispatchError::Parse(format!("run reply: {}", e)))
    }
}

#[async_trait]
impl TranscriptionBackend for RemoteServiceBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn transcribe(&self, audio_url: &str) -> Result<String, DispatchError> {
        let frame = self.normalizer.normalize(audio_url).await?;
        let wav = encode_wav(&frame);

        let path = self.upload(wav).await?;
        tracing::debug!(url = %audio_url, path = %path, "Audio uploaded to remote service");

        let reply = self.run(&path).await?;
        Ok(extract_transcript(&reply))
    }
}

/// Pull a transcript out of a service reply.
///
/// ## Shapes tried, in order:
/// 1. list of `[start, end, text]` segments: texts trimmed and joined with spaces
/// 2. a plain string
/// 3. an object with a string `text` field
/// 4. an object with a `data` field, or a list, whose content matches one of these
///
/// An unrecognized reply is logged and yields an empty transcript.
pub fn extract_transcript(reply: &Value) -> String {
    match find_text(reply, 0) {
        Some(text) => text,
        None => {
            let err = DispatchError::Parse(truncate(&reply.to_string(), 200));
            tracing::warn!(error = %err, "Could not find a transcript in the service reply");
            String::new()
        }
    }
}

fn find_text(value: &Value, depth: usize) -> Option<String> {
    if depth > MAX_EXTRACT_DEPTH {
        return None;
    }
    if let Some(text) = segments_text(value) {
        return Some(text);
    }

    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Object(map) => match map.get("text") {
            Some(Value::String(text)) => Some(text.trim().to_string()),
            _ => map.get("data").and_then(|data| find_text(data, depth + 1)),
        },
        Value::Array(items) => items.first().and_then(|first| find_text(first, depth + 1)),
        _ => None,
    }
}

fn segments_text(value: &Value) -> Option<String> {
    let segments = value.as_array()?;
    if segments.is_empty() {
        return None;
    }

    let mut texts = Vec::with_capacity(segments.len());
    for segment in segments {
        match segment.as_array()?.as_slice() {
            [start, end, text, ..] if start.is_number() && end.is_number() => texts.push(text.as_str()?.trim()),
            _ => return None,
        }
    }

    Some(texts.into_iter().filter(|t| !t.is_empty()).collect::<Vec<_>>().join(" "))
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
