//! # Single-Shot API
//!
//! One URL in, one transcript out. Backends that serve one request at a
//! time get a busy flag: a second call while the first is still running
//! fails right away with `BackendBusy`. Every call has a deadline.

use crate::cache::ResultCache;
use crate::error::DispatchError;
use crate::transcription::TranscriptionBackend;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Clears the busy flag however the call ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SingleShot {
    backend: Arc<dyn TranscriptionBackend>,
    cache: Arc<ResultCache>,
    busy: AtomicBool,
}

impl SingleShot {
    pub fn new(backend: Arc<dyn TranscriptionBackend>, cache: Arc<ResultCache>) -> Self {
        Self {
            backend,
            cache,
            busy: AtomicBool::new(false),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Transcribe one URL, failing with `Timeout` after `timeout`.
    pub async fn transcribe(&self, audio_url: &str, timeout: Duration) -> Result<String, DispatchError> {
        let _guard = if self.backend.single_request() {
            if self
                .busy
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                tracing::warn!(url = %audio_url, "Rejecting single-shot request, backend busy");
                return Err(DispatchError::BackendBusy);
            }
            Some(BusyGuard(&self.busy))
        } else {
            None
        };

        if let Some(text) = self.cache.get(audio_url) {
            tracing::debug!(url = %audio_url, "Single-shot served from cache");
            return Ok(text);
        }

        let text = match tokio::time::timeout(timeout, self.backend.transcribe(audio_url)).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(url = %audio_url, timeout_secs = timeout.as_secs(), "Single-shot request timed out");
                return Err(DispatchError::Timeout(timeout.as_secs()));
            }
        };

        if let Err(e) = self.cache.put(audio_url, &text) {
            tracing::warn!(url = %audio_url, error = %e, "Failed to persist transcript");
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::transcription::backend::testing::ScriptedBackend;

    fn cache() -> Arc<ResultCache> {
        Arc::new(ResultCache::open(Box::<MemoryStore>::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_call_is_busy() {
        let backend = Arc::new(ScriptedBackend {
            single: true,
            delay: Some(Duration::from_secs(5)),
            ..ScriptedBackend::with(&[("a.mp3", Ok("first")), ("b.mp3", Ok("second"))])
        });
        let single = SingleShot::new(backend, cache());
        let timeout = Duration::from_secs(300);

        let (first, second) = tokio::join!(single.transcribe("a.mp3", timeout), single.transcribe("b.mp3", timeout));
        assert_eq!(first.unwrap(), "first");
        assert_eq!(second.unwrap_err(), DispatchError::BackendBusy);

        // Released once the first call settled
        assert!(!single.is_busy());
        assert_eq!(single.transcribe("b.mp3", timeout).await.unwrap(), "second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_busy_flag() {
        let backend = Arc::new(ScriptedBackend {
            single: true,
            delay: Some(Duration::from_secs(400)),
            ..ScriptedBackend::with(&[("slow.mp3", Ok("late"))])
        });
        let single = SingleShot::new(backend, cache());

        let started = tokio::time::Instant::now();
        let err = single.transcribe("slow.mp3", Duration::from_secs(300)).await.unwrap_err();
        assert_eq!(err, DispatchError::Timeout(300));
        assert!(started.elapsed() >= Duration::from_secs(300));
        assert!(!single.is_busy());
    }

    #[tokio::test]
    async fn test_concurrent_backends_are_not_gated() {
        let backend = Arc::new(ScriptedBackend::with(&[("a.mp3", Ok("x")), ("b.mp3", Ok("y"))]));
        let single = SingleShot::new(backend, cache());
        let timeout = Duration::from_secs(1);

        let (a, b) = tokio::join!(single.transcribe("a.mp3", timeout), single.transcribe("b.mp3", timeout));
        assert_eq!(a.unwrap(), "x");
        assert_eq!(b.unwrap(), "y");
    }

    #[tokio::test]
    async fn test_result_is_cached() {
        let backend = Arc::new(ScriptedBackend::with(&[("a.mp3", Ok("once"))]));
        let single = SingleShot::new(backend.clone(), cache());

        assert_eq!(single.transcribe("a.mp3", Duration::from_secs(1)).await.unwrap(), "once");
        assert_eq!(single.transcribe("a.mp3", Duration::from_secs(1)).await.unwrap(), "once");
        assert_eq!(backend.calls(), 1);
    }
}
