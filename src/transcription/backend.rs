//! # Transcription Backends
//!
//! One trait, two implementations, chosen once at startup from
//! `backend.kind`. The audio pipeline and the correlator keep the shared
//! config handle and read their `audio.*` and `dispatch.*` values per call.
//!
//! - **isolated**: Whisper on a model host thread, reached through the
//!   request correlator
//! - **remote**: an HTTP inference service reached with a persistent client

use crate::audio::{AudioNormalizer, HttpFetcher};
use crate::config::{BackendKind, SharedConfig};
use crate::device::DeviceManager;
use crate::error::DispatchError;
use crate::transcription::correlator::RequestCorrelator;
use crate::transcription::host::ModelHost;
use crate::transcription::isolated::IsolatedContextBackend;
use crate::transcription::model::{SpeechModel, WhisperModel};
use crate::transcription::protocol::context_channel;
use crate::transcription::remote::RemoteServiceBackend;
use async_trait::async_trait;
use std::sync::{Arc, PoisonError};

/// Turns an audio URL into a transcript.
///
/// Implementations must be safe to call concurrently and must not hold a
/// lock across a transcription.
#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the single-shot API may only have one call in flight.
    fn single_request(&self) -> bool {
        false
    }

    /// Whether the backend can currently take requests.
    fn is_ready(&self) -> bool {
        true
    }

    async fn transcribe(&self, audio_url: &str) -> Result<String, DispatchError>;
}

pub struct BackendFactory;

impl BackendFactory {
    /// Build the configured backend.
    pub async fn create(shared: &SharedConfig) -> anyhow::Result<Arc<dyn TranscriptionBackend>> {
        // `backend` is fixed at startup, so a snapshot is enough here
        let config = shared.read().unwrap_or_else(PoisonError::into_inner).clone();

        let fetcher = HttpFetcher::new(shared.clone())?;
        let normalizer = Arc::new(AudioNormalizer::new(Arc::new(fetcher), shared.clone()));

        match config.backend.kind {
            BackendKind::Isolated => {
                let size = config.backend.whisper_model;
                let device_pref = config.backend.device.clone();

                let (caller, host) = context_channel();
                ModelHost::new(normalizer, config.backend.host_backlog).spawn(host, move || async move {
                    let device = DeviceManager::from_config(&device_pref);
                    tracing::info!(device = DeviceManager::describe(&device), "Model host device selected");
                    let model = WhisperModel::load(size, device).await?;
                    Ok(Box::new(model) as Box<dyn SpeechModel>)
                })?;

                tracing::info!(model = %size, "Isolated backend started, model loading in background");
                Ok(Arc::new(IsolatedContextBackend::new(RequestCorrelator::start(caller, shared.clone()))))
            }
            BackendKind::Remote => {
                let base_url = config
                    .backend
                    .remote_url
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("Remote backend requires backend.remote_url"))?;

                let backend =
                    RemoteServiceBackend::connect(&base_url, &config.backend.remote_api_name, normalizer).await?;
                Ok(Arc::new(backend))
            }
        }
    }
}

/// Scripted backend for queue and API tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Answers from a URL → result table and records how it was used.
    #[derive(Default)]
    pub struct ScriptedBackend {
        pub answers: HashMap<String, Result<String, DispatchError>>,
        pub single: bool,
        pub delay: Option<Duration>,
        pub calls: AtomicUsize,
        pub active: AtomicUsize,
        pub peak: AtomicUsize,
        pub seen: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        pub fn with(answers: &[(&str, Result<&str, DispatchError>)]) -> Self {
            Self {
                answers: answers
                    .iter()
                    .map(|(url, result)| (url.to_string(), result.clone().map(str::to_string)))
                    .collect(),
                ..Default::default()
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TranscriptionBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn single_request(&self) -> bool {
            self.single
        }

        async fn transcribe(&self, audio_url: &str) -> Result<String, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.seen.lock().unwrap().push(audio_url.to_string());

            match self.delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => tokio::task::yield_now().await,
            }

            self.active.fetch_sub(1, Ordering::SeqCst);
            self.answers
                .get(audio_url)
                .cloned()
                .unwrap_or_else(|| Err(DispatchError::Network("failed to fetch audio: HTTP 404".into())))
        }
    }
}
