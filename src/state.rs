//! # Application State
//!
//! Everything the HTTP handlers share: runtime configuration, request and
//! dispatch metrics, and the transcription services built at startup.
//!
//! ## Sharing Pattern:
//! - `Arc<RwLock<T>>` for data that changes at runtime (config, metrics)
//! - `Arc<T>` for services with their own interior synchronization
//!
//! Locks here are only held for the duration of a copy or an increment,
//! never across an `.await`.

use crate::cache::ResultCache;
use crate::config::{AppConfig, SharedConfig};
use crate::dispatch::queue::QueueStats;
use crate::dispatch::{DispatchQueue, SingleShot};
use crate::transcription::TranscriptionBackend;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    /// Runtime-updatable configuration, shared with the backend services
    pub config: SharedConfig,

    pub metrics: Arc<RwLock<AppMetrics>>,

    pub start_time: Instant,

    pub backend: Arc<dyn TranscriptionBackend>,
    pub cache: Arc<ResultCache>,
    pub queue: Arc<DispatchQueue>,
    pub single: Arc<SingleShot>,

    /// Token handed to every batch started now. Cancelling swaps in a fresh one.
    batch_token: Arc<RwLock<CancellationToken>>,
}

/// HTTP and dispatch counters since startup.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Keyed by "METHOD /route/pattern"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,

    pub dispatch: DispatchMetrics,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct DispatchMetrics {
    pub single_requests: u64,
    pub single_failures: u64,
    pub batches: u64,
    pub active_batches: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub cache_hits: u64,
}

/// One running batch. Dropping it marks the batch as no longer active,
/// also when the request is abandoned halfway.
pub struct ActiveBatch {
    metrics: Arc<RwLock<AppMetrics>>,
    token: CancellationToken,
}

impl ActiveBatch {
    /// Token the batch should watch for cancellation.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for ActiveBatch {
    fn drop(&mut self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.dispatch.active_batches = metrics.dispatch.active_batches.saturating_sub(1);
    }
}

impl AppState {
    pub fn new(config: SharedConfig, backend: Arc<dyn TranscriptionBackend>, cache: Arc<ResultCache>) -> Self {
        Self {
            config,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            queue: Arc::new(DispatchQueue::new(backend.clone(), cache.clone())),
            single: Arc::new(SingleShot::new(backend.clone(), cache.clone())),
            backend,
            cache,
            batch_token: Arc::new(RwLock::new(CancellationToken::new())),
        }
    }

    /// Copy of the current configuration; the lock is released immediately.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    fn with_metrics(&self, f: impl FnOnce(&mut AppMetrics)) {
        f(&mut self.metrics.write().unwrap_or_else(PoisonError::into_inner));
    }

    pub fn increment_request_count(&self) {
        self.with_metrics(|m| m.request_count += 1);
    }

    pub fn increment_error_count(&self) {
        self.with_metrics(|m| m.error_count += 1);
    }

    /// Record one request against its endpoint.
    ///
    /// ## Parameters:
    /// - **endpoint**: method plus route pattern, e.g. "POST /api/v1/batch"
    /// - **duration_ms**: time spent handling the request
    /// - **is_error**: 4xx/5xx or a handler error
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        self.with_metrics(|m| {
            let metric = m.endpoint_metrics.entry(endpoint.to_string()).or_default();
            metric.request_count += 1;
            metric.total_duration_ms += duration_ms;
            if is_error {
                metric.error_count += 1;
            }
        });
    }

    pub fn record_single(&self, ok: bool) {
        self.with_metrics(|m| {
            m.dispatch.single_requests += 1;
            if !ok {
                m.dispatch.single_failures += 1;
            }
        });
    }

    /// Mark a batch as started. It counts as active until the returned
    /// handle is dropped.
    pub fn begin_batch(&self) -> ActiveBatch {
        self.with_metrics(|m| {
            m.dispatch.batches += 1;
            m.dispatch.active_batches += 1;
        });
        ActiveBatch {
            metrics: self.metrics.clone(),
            token: self.batch_token.read().unwrap_or_else(PoisonError::into_inner).clone(),
        }
    }

    /// Add the job counters of a finished batch.
    pub fn finish_batch(&self, stats: &QueueStats) {
        self.with_metrics(|m| {
            let d = &mut m.dispatch;
            d.jobs_completed += stats.completed as u64;
            d.jobs_failed += stats.failed as u64;
            d.jobs_cancelled += stats.cancelled as u64;
            d.cache_hits += stats.cache_hits as u64;
        });
    }

    /// Cancel every batch running now. Later batches get a fresh token.
    pub fn cancel_batches(&self) -> u64 {
        let previous = std::mem::replace(
            &mut *self.batch_token.write().unwrap_or_else(PoisonError::into_inner),
            CancellationToken::new(),
        );
        previous.cancel();
        self.get_metrics_snapshot().dispatch.active_batches
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Default config, in-memory cache, the given backend.
    #[cfg(test)]
    pub fn for_tests(backend: Arc<dyn TranscriptionBackend>) -> Self {
        let cache = ResultCache::open(Box::<crate::cache::MemoryStore>::default());
        Self::new(AppConfig::default().into_shared(), backend, Arc::new(cache))
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
