//! # Isolated-Context Backend
//!
//! Delegates every call to the request correlator. The model host on the
//! other side of the boundary does the fetching, decoding and inference.

use crate::error::DispatchError;
use crate::transcription::backend::TranscriptionBackend;
use crate::transcription::correlator::RequestCorrelator;
use async_trait::async_trait;
use std::sync::Arc;

pub struct IsolatedContextBackend {
    correlator: Arc<RequestCorrelator>,
}

impl IsolatedContextBackend {
    pub fn new(correlator: Arc<RequestCorrelator>) -> Self {
        Self { correlator }
    }
}

#[async_trait]
impl TranscriptionBackend for IsolatedContextBackend {
    fn name(&self) -> &'static str {
        "isolated"
    }

    /// The host serves one inference at a time.
    fn single_request(&self) -> bool {
        true
    }

    fn is_ready(&self) -> bool {
        self.correlator.is_ready()
    }

    async fn transcribe(&self, audio_url: &str) -> Result<String, DispatchError> {
        self.correlator.send(audio_url).await
    }
}
