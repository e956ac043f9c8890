//! # Request Correlator
//!
//! Turns the fire-and-forget message boundary into request/response calls.
//!
//! ## How a call works:
//! 1. Wait until the far side has sent `READY` (bounded number of poll cycles)
//! 2. Allocate the next correlation id and register a pending entry
//! 3. Send `REQUEST` and wait for the matching `RESPONSE` or the deadline
//!
//! ## Pending Entries:
//! An entry is removed from the map before its oneshot sender is used, so it
//! settles at most once. Whichever comes first wins: the response, the
//! deadline, or the caller dropping the future. Late and duplicate responses
//! find nothing to remove and are ignored.
//!
//! The deadline and the readiness cycle are read from `dispatch.*` at the
//! start of every call, so a config update reaches the next request.

use crate::config::{read_live, SharedConfig};
use crate::error::DispatchError;
use crate::transcription::protocol::{ContextEndpoint, ContextMessage, ProtocolError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};

struct PendingRequest {
    created_at: Instant,
    reply: oneshot::Sender<Result<String, DispatchError>>,
}

pub struct RequestCorrelator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    ready: watch::Sender<bool>,
    outbound: mpsc::UnboundedSender<String>,
    config: SharedConfig,
}

/// Removes a pending entry when the waiting call ends for any reason.
struct PendingGuard<'a> {
    correlator: &'a RequestCorrelator,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.pending().remove(&self.id);
    }
}

impl RequestCorrelator {
    /// Wrap the caller side of a boundary and start pumping inbound messages.
    ///
    /// The pump holds only a weak reference: once the last handle is dropped,
    /// the outbound channel closes and the far side can shut down.
    pub fn start(endpoint: ContextEndpoint, config: SharedConfig) -> Arc<Self> {
        let ContextEndpoint { outbound, inbound } = endpoint;
        let (ready, _) = watch::channel(false);

        let correlator = Arc::new(Self {
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            ready,
            outbound,
            config,
        });

        tokio::spawn(Self::pump(Arc::downgrade(&correlator), inbound));
        correlator
    }

    async fn pump(correlator: Weak<Self>, mut inbound: mpsc::UnboundedReceiver<String>) {
        while let Some(raw) = inbound.recv().await {
            match correlator.upgrade() {
                Some(c) => c.handle_message(&raw),
                None => return,
            }
        }

        if let Some(c) = correlator.upgrade() {
            c.teardown();
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Send one audio URL across the boundary and wait for its transcript.
    pub async fn send(&self, audio_url: &str) -> Result<String, DispatchError> {
        self.wait_until_ready().await?;

        let request_timeout = read_live(&self.config, |c| c.dispatch.request_timeout());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (reply, response) = oneshot::channel();

        self.pending().insert(
            id,
            PendingRequest {
                created_at: Instant::now(),
                reply,
            },
        );
        let _guard = PendingGuard { correlator: self, id };

        let message = ContextMessage::Request {
            request_id: id,
            audio_url: audio_url.to_string(),
        };
        if self.outbound.send(message.encode()).is_err() {
            return Err(DispatchError::BackendUnavailable("context boundary closed".to_string()));
        }
        tracing::debug!(request_id = id, url = %audio_url, "Request sent across context boundary");

        match tokio::time::timeout(request_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DispatchError::BackendUnavailable(
                "context closed before responding".to_string(),
            )),
            Err(_) => {
                let secs = request_timeout.as_secs();
                tracing::warn!(request_id = id, url = %audio_url, timeout_secs = secs, "Transcription timed out");
                Err(DispatchError::Timeout(secs))
            }
        }
    }

    async fn wait_until_ready(&self) -> Result<(), DispatchError> {
        let mut ready = self.ready.subscribe();
        let (interval, max_cycles) = read_live(&self.config, |c| {
            (c.dispatch.ready_poll_interval(), c.dispatch.ready_max_cycles)
        });

        for cycle in 0..=max_cycles {
            if *ready.borrow_and_update() {
                return Ok(());
            }
            if cycle == max_cycles {
                break;
            }
            tracing::debug!(cycle = cycle + 1, "Backend not ready yet, waiting");
            let _ = tokio::time::timeout(interval, ready.changed()).await;
        }

        Err(DispatchError::BackendUnavailable(
            "backend did not announce readiness".to_string(),
        ))
    }

    /// Apply one inbound message.
    pub fn handle_message(&self, raw: &str) {
        match ContextMessage::decode(raw) {
            Ok(ContextMessage::Ready) => {
                if !self.ready.send_replace(true) {
                    tracing::info!("Transcription backend is ready");
                }
            }
            Ok(ContextMessage::Response {
                request_id,
                success,
                text,
                error,
            }) => {
                let Some(entry) = self.pending().remove(&request_id) else {
                    tracing::trace!(request_id, "Ignoring response with no pending request");
                    return;
                };

                let result = if success {
                    Ok(text.unwrap_or_default())
                } else {
                    Err(DispatchError::Backend(
                        error.unwrap_or_else(|| "unknown backend error".to_string()),
                    ))
                };

                tracing::debug!(
                    request_id,
                    success,
                    elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
                    "Response matched"
                );
                // The caller may have gone away; nothing to do then
                let _ = entry.reply.send(result);
            }
            Ok(ContextMessage::Request { request_id, .. }) => {
                tracing::debug!(request_id, "Ignoring REQUEST on the caller side");
            }
            Err(ProtocolError::UnknownType(tag)) => {
                tracing::debug!(tag = %tag, "Ignoring message with unknown type");
            }
            Err(ProtocolError::Malformed(e)) => {
                tracing::warn!(error = %e, "Dropping malformed message");
            }
        }
    }

    /// Fail everything in flight once the far side is gone.
    fn teardown(&self) {
        self.ready.send_replace(false);

        let drained: Vec<(u64, PendingRequest)> = self.pending().drain().collect();
        if !drained.is_empty() {
            tracing::warn!(pending = drained.len(), "Context boundary closed with requests in flight");
        }
        for (_, entry) in drained {
            let _ = entry
                .reply
                .send(Err(DispatchError::BackendUnavailable("context boundary closed".to_string())));
        }
    }
}
