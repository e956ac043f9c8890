//! # Model Host
//!
//! The far side of the context boundary. Runs on its own OS thread with its
//! own single-threaded runtime and shares nothing with the caller except the
//! message channels.
//!
//! ## Lifecycle:
//! 1. Load the speech model; on failure, drop the endpoint so the caller
//!    sees a closed boundary
//! 2. Send `READY`
//! 3. Serve `REQUEST`s one at a time: normalize the audio, run inference on
//!    the blocking pool, answer with `RESPONSE`
//! 4. Exit when the caller side closes
//!
//! ## Backlog:
//! While one request is being served, up to `backlog` more wait in FIFO
//! order. Anything beyond that is answered right away with a busy error.

use crate::audio::AudioNormalizer;
use crate::error::DispatchError;
use crate::transcription::model::SpeechModel;
use crate::transcription::protocol::{ContextEndpoint, ContextMessage, ProtocolError};
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

type ModelSlot = Box<dyn SpeechModel>;

/// Outcome of one served request. The model comes back unless inference panicked.
struct Served {
    request_id: u64,
    model: Option<ModelSlot>,
    result: Result<String, String>,
}

pub struct ModelHost {
    normalizer: Arc<AudioNormalizer>,
    backlog: usize,
}

impl ModelHost {
    pub fn new(normalizer: Arc<AudioNormalizer>, backlog: usize) -> Self {
        Self { normalizer, backlog }
    }

    /// Start the host thread.
    ///
    /// ## Parameters:
    /// - **endpoint**: host side of a `context_channel()`
    /// - **loader**: builds the model inside the host's runtime
    pub fn spawn<F, Fut>(self, endpoint: ContextEndpoint, loader: F) -> std::io::Result<std::thread::JoinHandle<()>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<ModelSlot>>,
    {
        std::thread::Builder::new()
            .name("model-host".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to start model host runtime");
                        return;
                    }
                };
                runtime.block_on(self.serve(endpoint, loader));
                tracing::info!("Model host stopped");
            })
    }

    async fn serve<F, Fut>(self, endpoint: ContextEndpoint, loader: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<ModelSlot>>,
    {
        let ContextEndpoint { outbound, mut inbound } = endpoint;

        let model = match loader().await {
            Ok(model) => model,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load speech model, closing context");
                return;
            }
        };
        tracing::info!(model = %model.name(), backlog = self.backlog, "Speech model loaded, announcing readiness");

        if outbound.send(ContextMessage::Ready.encode()).is_err() {
            return;
        }

        let mut slot: Option<ModelSlot> = Some(model);
        let mut queue: VecDeque<(u64, String)> = VecDeque::new();
        let mut in_flight = FuturesUnordered::new();

        loop {
            if in_flight.is_empty() {
                if let Some((request_id, url)) = queue.pop_front() {
                    match slot.take() {
                        Some(model) => in_flight.push(serve_one(request_id, url, model, self.normalizer.clone())),
                        None => {
                            tracing::error!("Speech model lost, closing context");
                            return;
                        }
                    }
                }
            }

            tokio::select! {
                raw = inbound.recv() => {
                    let Some(raw) = raw else { break };
                    match ContextMessage::decode(&raw) {
                        Ok(ContextMessage::Request { request_id, audio_url }) => {
                            let idle = in_flight.is_empty() && queue.is_empty();
                            if idle || queue.len() < self.backlog {
                                tracing::debug!(request_id, url = %audio_url, queued = queue.len(), "Request accepted");
                                queue.push_back((request_id, audio_url));
                            } else {
                                tracing::warn!(request_id, "Host busy, rejecting request");
                                let busy = ContextMessage::failed(request_id, DispatchError::BackendBusy.to_string());
                                let _ = outbound.send(busy.encode());
                            }
                        }
                        Ok(other) => tracing::debug!(message = ?other, "Ignoring non-request message on the host side"),
                        Err(ProtocolError::UnknownType(tag)) => tracing::debug!(tag = %tag, "Ignoring message with unknown type"),
                        Err(ProtocolError::Malformed(e)) => tracing::warn!(error = %e, "Dropping malformed message"),
                    }
                }
                Some(served) = in_flight.next(), if !in_flight.is_empty() => {
                    let reply = match served.result {
                        Ok(text) => ContextMessage::ok(served.request_id, text),
                        Err(error) => {
                            tracing::warn!(request_id = served.request_id, error = %error, "Transcription failed");
                            ContextMessage::failed(served.request_id, error)
                        }
                    };
                    if outbound.send(reply.encode()).is_err() {
                        break;
                    }
                    slot = served.model;
                }
            }
        }
    }
}

async fn serve_one(request_id: u64, url: String, mut model: ModelSlot, normalizer: Arc<AudioNormalizer>) -> Served {
    let frame = match normalizer.normalize(&url).await {
        Ok(frame) => frame,
        Err(e) => {
            return Served {
                request_id,
                model: Some(model),
                result: Err(e.to_string()),
            }
        }
    };

    let started = std::time::Instant::now();
    let joined = tokio::task::spawn_blocking(move || {
        let result = model.transcribe(&frame);
        (model, result)
    })
    .await;

    match joined {
        Ok((model, result)) => {
            tracing::debug!(request_id, elapsed_ms = started.elapsed().as_millis() as u64, "Inference finished");
            Served {
                request_id,
                model: Some(model),
                result: result.map_err(|e| e.to_string()),
            }
        }
        Err(e) => Served {
            request_id,
            model: None,
            result: Err(format!("inference task failed: {}", e)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::AudioFrame;
    use crate::audio::normalizer::{pcm16_wav, StaticFetcher};
    use crate::config::AppConfig;
    use crate::transcription::protocol::context_channel;
    use std::sync::mpsc;

    /// Reports the sample count; optionally blocks until released.
    struct CountingModel {
        gate: Option<mpsc::Receiver<()>>,
    }

    impl SpeechModel for CountingModel {
        fn transcribe(&mut self, frame: &AudioFrame) -> anyhow::Result<String> {
            if let Some(gate) = &self.gate {
                let _ = gate.recv();
            }
            Ok(format!("{} samples", frame.len()))
        }
    }

    fn normalizer() -> Arc<AudioNormalizer> {
        let fetcher = StaticFetcher::with_clip("https://x/a.wav", pcm16_wav(16_000, 1, &vec![0i16; 800]));
        Arc::new(AudioNormalizer::new(Arc::new(fetcher), AppConfig::default().into_shared()))
    }

    async fn next_message(endpoint: &mut ContextEndpoint) -> ContextMessage {
        let raw = endpoint.inbound.recv().await.expect("host closed");
        ContextMessage::decode(&raw).unwrap()
    }

    fn request(id: u64, url: &str) -> String {
        ContextMessage::Request {
            request_id: id,
            audio_url: url.into(),
        }
        .encode()
    }

    #[tokio::test]
    async fn test_ready_then_serves_requests() {
        let (mut caller, host) = context_channel();
        ModelHost::new(normalizer(), 2)
            .spawn(host, || async { Ok(Box::new(CountingModel { gate: None }) as ModelSlot) })
            .unwrap();

        assert_eq!(next_message(&mut caller).await, ContextMessage::Ready);

        caller.outbound.send(request(1, "https://x/a.wav")).unwrap();
        assert_eq!(next_message(&mut caller).await, ContextMessage::ok(1, "800 samples".into()));

        caller.outbound.send(request(2, "https://x/missing.wav")).unwrap();
        match next_message(&mut caller).await {
            ContextMessage::Response { request_id, success, error, .. } => {
                assert_eq!(request_id, 2);
                assert!(!success);
                assert!(error.unwrap().contains("404"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_overflow_gets_busy_response() {
        let (release, gate) = mpsc::channel();
        let (mut caller, host) = context_channel();
        ModelHost::new(normalizer(), 0)
            .spawn(host, move || async move { Ok(Box::new(CountingModel { gate: Some(gate) }) as ModelSlot) })
            .unwrap();
        assert_eq!(next_message(&mut caller).await, ContextMessage::Ready);

        caller.outbound.send(request(1, "https://x/a.wav")).unwrap();
        caller.outbound.send(request(2, "https://x/a.wav")).unwrap();

        assert_eq!(
            next_message(&mut caller).await,
            ContextMessage::failed(2, DispatchError::BackendBusy.to_string())
        );

        release.send(()).unwrap();
        assert_eq!(next_message(&mut caller).await, ContextMessage::ok(1, "800 samples".into()));
    }

    #[tokio::test]
    async fn test_load_failure_closes_context() {
        let (mut caller, host) = context_channel();
        let handle = ModelHost::new(normalizer(), 1)
            .spawn(host, || async { Err(anyhow::anyhow!("weights missing")) })
            .unwrap();

        assert!(caller.inbound.recv().await.is_none());
        handle.join().unwrap();
    }
}
