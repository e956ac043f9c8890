//! # Dispatch Queue
//!
//! Runs a batch of URLs through the backend with at most N in flight.
//!
//! ## Workers:
//! N worker futures share one `DispatchQueueState` and are polled together
//! on the calling task. Each worker repeatedly claims the next job, answers
//! it from the cache if it can, otherwise calls the backend, and records the
//! outcome. A failed or empty result never aborts the other jobs; its URL is
//! recorded as the result instead (the sentinel).
//!
//! ## Cancellation:
//! Cooperative. The token is checked before every claim, so a worker always
//! finishes the job it holds and then stops. Unclaimed jobs stay `Pending`
//! and carry the `cancelled` error code.

use crate::cache::ResultCache;
use crate::error::DispatchError;
use crate::transcription::TranscriptionBackend;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobState {
    /// Forward-only lifecycle; a cache hit goes straight from Pending to Done.
    pub fn can_advance_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Done)
                | (JobState::Running, JobState::Done)
                | (JobState::Running, JobState::Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("job {index}: cannot move from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub index: usize,
    pub from: JobState,
    pub to: JobState,
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub url: String,
    pub sequence_index: usize,
    pub state: JobState,
    /// Answered from the cache without touching the backend
    pub cached: bool,
    /// `DispatchError::code()` of whatever kept this job from a transcript
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    #[serde(skip)]
    text: Option<String>,
}

impl Job {
    pub fn new(url: String, sequence_index: usize) -> Self {
        Self {
            url,
            sequence_index,
            state: JobState::Pending,
            cached: false,
            error: None,
            text: None,
        }
    }

    pub fn advance(&mut self, next: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_advance_to(next) {
            return Err(InvalidTransition {
                index: self.sequence_index,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Transcript if the job succeeded, otherwise the URL itself.
    pub fn result_text(&self) -> &str {
        match (&self.state, &self.text) {
            (JobState::Done, Some(text)) => text,
            _ => &self.url,
        }
    }
}

/// Counters for one batch run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub concurrency: usize,
    pub completed: usize,
    pub failed: usize,
    pub cache_hits: usize,
    /// Jobs never claimed because the run was cancelled
    pub cancelled: usize,
    pub peak_active: usize,
}

struct DispatchQueueState {
    jobs: Vec<Job>,
    cursor: usize,
    active: usize,
    stats: QueueStats,
}

impl DispatchQueueState {
    fn new(urls: Vec<String>, concurrency: usize) -> Self {
        let jobs: Vec<Job> = urls.into_iter().enumerate().map(|(i, url)| Job::new(url, i)).collect();
        Self {
            stats: QueueStats {
                total: jobs.len(),
                concurrency,
                ..Default::default()
            },
            jobs,
            cursor: 0,
            active: 0,
        }
    }

    fn claim(&mut self) -> Option<(usize, String)> {
        let job = self.jobs.get(self.cursor)?;
        let claimed = (self.cursor, job.url.clone());
        self.cursor += 1;
        Some(claimed)
    }

    fn start(&mut self, index: usize) {
        if self.transition(index, JobState::Running) {
            self.active += 1;
            self.stats.peak_active = self.stats.peak_active.max(self.active);
        }
    }

    fn finish_cached(&mut self, index: usize, text: String) {
        if self.transition(index, JobState::Done) {
            self.jobs[index].cached = true;
            self.jobs[index].text = Some(text);
            self.stats.cache_hits += 1;
            self.stats.completed += 1;
        }
    }

    /// Record a backend outcome. `Ok(None)` is an empty transcript.
    fn finish(&mut self, index: usize, outcome: Result<Option<String>, DispatchError>) {
        self.active = self.active.saturating_sub(1);
        match outcome {
            Ok(Some(text)) => {
                if self.transition(index, JobState::Done) {
                    self.jobs[index].text = Some(text);
                    self.stats.completed += 1;
                }
            }
            Ok(None) => {
                if self.transition(index, JobState::Failed) {
                    self.stats.failed += 1;
                }
            }
            Err(e) => {
                if self.transition(index, JobState::Failed) {
                    self.jobs[index].error = Some(e.code());
                    self.stats.failed += 1;
                }
            }
        }
    }

    /// Mark every job nobody claimed; returns how many there were.
    fn close_unclaimed(&mut self) -> usize {
        let mut unclaimed = 0;
        for job in self.jobs.iter_mut().filter(|j| j.state == JobState::Pending) {
            job.error = Some(DispatchError::Cancelled.code());
            unclaimed += 1;
        }
        unclaimed
    }

    fn transition(&mut self, index: usize, next: JobState) -> bool {
        match self.jobs.get_mut(index).map(|job| job.advance(next)) {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                tracing::error!(error = %e, "Rejected job state transition");
                false
            }
            None => false,
        }
    }

    fn settled(&self) -> usize {
        self.stats.completed + self.stats.failed
    }
}

/// Outcome of one batch run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRun {
    /// URL → transcript, or URL → URL for jobs without a usable transcript
    pub results: HashMap<String, String>,
    pub jobs: Vec<Job>,
    pub stats: QueueStats,
}

pub struct DispatchQueue {
    backend: Arc<dyn TranscriptionBackend>,
    cache: Arc<ResultCache>,
}

impl DispatchQueue {
    pub fn new(backend: Arc<dyn TranscriptionBackend>, cache: Arc<ResultCache>) -> Self {
        Self { backend, cache }
    }

    /// Process `urls` with at most `concurrency_limit` backend calls in flight.
    ///
    /// ## Parameters:
    /// - **urls**: jobs in submission order, expected to be de-duplicated
    /// - **concurrency_limit**: clamped to `[1, urls.len()]`
    /// - **cancel**: stops further claims once cancelled
    pub async fn run(&self, urls: Vec<String>, concurrency_limit: usize, cancel: &CancellationToken) -> BatchRun {
        let limit = concurrency_limit.clamp(1, urls.len().max(1));
        let state = Mutex::new(DispatchQueueState::new(urls, limit));

        tracing::info!(
            jobs = lock(&state).stats.total,
            concurrency = limit,
            backend = self.backend.name(),
            "Dispatch queue started"
        );

        join_all((0..limit).map(|worker| self.worker(worker, &state, cancel))).await;

        let mut state = state.into_inner().unwrap_or_else(PoisonError::into_inner);
        state.stats.cancelled = state.close_unclaimed();

        let results = state
            .jobs
            .iter()
            .map(|job| (job.url.clone(), job.result_text().to_string()))
            .collect();

        tracing::info!(
            completed = state.stats.completed,
            failed = state.stats.failed,
            cache_hits = state.stats.cache_hits,
            cancelled = state.stats.cancelled,
            peak_active = state.stats.peak_active,
            "Dispatch queue finished"
        );

        BatchRun {
            results,
            jobs: state.jobs,
            stats: state.stats,
        }
    }

    async fn worker(&self, worker: usize, state: &Mutex<DispatchQueueState>, cancel: &CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                tracing::debug!(worker, "Cancellation observed, worker stopping");
                break;
            }

            let Some((index, url)) = lock(state).claim() else {
                break;
            };

            // Cache strictly before the backend
            if let Some(text) = self.cache.get(&url) {
                tracing::debug!(worker, url = %url, "Cache hit");
                lock(state).finish_cached(index, text);
                continue;
            }

            lock(state).start(index);

            let outcome = match self.backend.transcribe(&url).await {
                Ok(text) if !text.is_empty() => {
                    if let Err(e) = self.cache.put(&url, &text) {
                        tracing::warn!(url = %url, error = %e, "Failed to persist transcript");
                    }
                    Ok(Some(text))
                }
                Ok(_) => {
                    tracing::debug!(worker, url = %url, "Empty transcript, keeping the link");
                    Ok(None)
                }
                Err(e) => {
                    tracing::warn!(worker, url = %url, error = %e, code = e.code(), "Transcription failed, keeping the link");
                    Err(e)
                }
            };

            let (settled, total) = {
                let mut state = lock(state);
                state.finish(index, outcome);
                (state.settled(), state.stats.total)
            };
            tracing::info!(worker, "Transcribed {}/{}", settled, total);
        }
    }
}

fn lock(state: &Mutex<DispatchQueueState>) -> MutexGuard<'_, DispatchQueueState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::transcription::backend::testing::ScriptedBackend;
    use async_trait::async_trait;
    use std::time::Duration;

    fn cache() -> Arc<ResultCache> {
        Arc::new(ResultCache::open(Box::<MemoryStore>::default()))
    }

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_job_transitions_are_forward_only() {
        let mut job = Job::new("a".into(), 0);
        assert!(job.advance(JobState::Running).is_ok());
        assert!(job.advance(JobState::Pending).is_err());
        assert!(job.advance(JobState::Failed).is_ok());
        assert!(job.advance(JobState::Done).is_err());
        assert_eq!(job.result_text(), "a");
    }

    #[tokio::test]
    async fn test_cache_hit_never_calls_backend() {
        let backend = Arc::new(ScriptedBackend::with(&[("https://x/a.mp3", Ok("fresh"))]));
        let cache = cache();
        cache.put("https://x/a.mp3", "cached").unwrap();

        let queue = DispatchQueue::new(backend.clone(), cache);
        let run = queue.run(urls(&["https://x/a.mp3"]), 3, &CancellationToken::new()).await;

        assert_eq!(backend.calls(), 0);
        assert_eq!(run.results["https://x/a.mp3"], "cached");
        assert_eq!(run.stats.cache_hits, 1);
        assert!(run.jobs[0].cached);
        assert_eq!(run.jobs[0].state, JobState::Done);
    }

    #[tokio::test]
    async fn test_single_worker_claims_in_submission_order() {
        let backend = Arc::new(ScriptedBackend::with(&[("c.mp3", Ok("3")), ("a.mp3", Ok("1"))]));
        let cache = cache();
        cache.put("b.wav", "2").unwrap();

        let queue = DispatchQueue::new(backend.clone(), cache);
        queue.run(urls(&["c.mp3", "b.wav", "a.mp3"]), 1, &CancellationToken::new()).await;

        assert_eq!(*backend.seen.lock().unwrap(), vec!["c.mp3", "a.mp3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peak_active_never_exceeds_limit() {
        let list: Vec<String> = (0..10).map(|i| format!("https://x/{}.mp3", i)).collect();
        let answers: Vec<(&str, Result<&str, DispatchError>)> = list.iter().map(|u| (u.as_str(), Ok("text"))).collect();
        let backend = Arc::new(ScriptedBackend {
            delay: Some(Duration::from_millis(50)),
            ..ScriptedBackend::with(&answers)
        });

        let queue = DispatchQueue::new(backend.clone(), cache());
        let run = queue.run(list.clone(), 3, &CancellationToken::new()).await;

        assert_eq!(run.stats.completed, 10);
        assert!(run.stats.peak_active <= 3);
        assert_eq!(run.stats.peak_active, 3);
        assert!(backend.peak.load(std::sync::atomic::Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_empty_or_failed_result_keeps_link() {
        let backend = Arc::new(ScriptedBackend::with(&[
            ("https://x/silent.wav", Ok("")),
            ("https://x/broken.mp3", Err(DispatchError::Decode("bad frame".into()))),
            ("https://x/good.mp3", Ok("words")),
        ]));
        let cache = cache();
        let queue = DispatchQueue::new(backend, cache.clone());

        let run = queue
            .run(
                urls(&["https://x/silent.wav", "https://x/broken.mp3", "https://x/good.mp3"]),
                2,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(run.results["https://x/silent.wav"], "https://x/silent.wav");
        assert_eq!(run.results["https://x/broken.mp3"], "https://x/broken.mp3");
        assert_eq!(run.results["https://x/good.mp3"], "words");
        assert_eq!(run.stats.failed, 2);
        assert_eq!(run.stats.completed, 1);
        assert_eq!(run.jobs[0].error, None);
        assert_eq!(run.jobs[1].error, Some("decode_error"));

        assert!(cache.get("https://x/silent.wav").is_none());
        assert!(cache.get("https://x/broken.mp3").is_none());
        assert_eq!(cache.get("https://x/good.mp3").as_deref(), Some("words"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_claims_nothing() {
        let backend = Arc::new(ScriptedBackend::with(&[("a.mp3", Ok("x"))]));
        let queue = DispatchQueue::new(backend.clone(), cache());
        let token = CancellationToken::new();
        token.cancel();

        let run = queue.run(urls(&["a.mp3", "b.mp3"]), 2, &token).await;
        assert_eq!(backend.calls(), 0);
        assert_eq!(run.stats.cancelled, 2);
        assert_eq!(run.results["a.mp3"], "a.mp3");
        assert!(run.jobs.iter().all(|j| j.state == JobState::Pending));
    }

    /// Cancels the run from inside the first transcription.
    struct CancellingBackend {
        token: CancellationToken,
    }

    #[async_trait]
    impl TranscriptionBackend for CancellingBackend {
        fn name(&self) -> &'static str {
            "cancelling"
        }

        async fn transcribe(&self, _audio_url: &str) -> Result<String, DispatchError> {
            self.token.cancel();
            Ok("finished anyway".to_string())
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_run_finishes_current_job() {
        let token = CancellationToken::new();
        let backend = Arc::new(CancellingBackend { token: token.clone() });
        let queue = DispatchQueue::new(backend, cache());

        let run = queue.run(urls(&["a.mp3", "b.mp3", "c.mp3"]), 1, &token).await;

        assert_eq!(run.results["a.mp3"], "finished anyway");
        assert_eq!(run.results["b.mp3"], "b.mp3");
        assert_eq!(run.stats.completed, 1);
        assert_eq!(run.stats.cancelled, 2);

        assert_eq!(run.jobs[0].error, None);
        assert_eq!(run.jobs[1].error, Some(DispatchError::Cancelled.code()));
        assert_eq!(run.jobs[2].error, Some("cancelled"));
    }

    #[tokio::test]
    async fn test_limit_is_clamped() {
        let backend = Arc::new(ScriptedBackend::with(&[("a.mp3", Ok("1")), ("b.mp3", Ok("2"))]));
        let queue = DispatchQueue::new(backend, cache());

        let run = queue.run(urls(&["a.mp3", "b.mp3"]), 10, &CancellationToken::new()).await;
        assert_eq!(run.stats.concurrency, 2);

        let run = queue.run(urls(&["a.mp3"]), 0, &CancellationToken::new()).await;
        assert_eq!(run.stats.concurrency, 1);

        let run = queue.run(Vec::new(), 3, &CancellationToken::new()).await;
        assert!(run.results.is_empty());
    }
}
