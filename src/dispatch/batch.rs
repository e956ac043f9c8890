//! # Batch API
//!
//! Finds every audio link in a block of text, transcribes each distinct link
//! once through the dispatch queue, and returns the text with every link
//! replaced by its transcript. Links without a usable transcript stay as
//! they were.

use crate::dispatch::queue::{DispatchQueue, QueueStats};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// `.mp3` / `.wav` links, any case, with or without an http(s) scheme.
///
/// Greedy, so a link runs to its last `.mp3`/`.wav` suffix even when the
/// same suffix shows up earlier in the host or path.
static AUDIO_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(?:https?://)?[^\s"'<>()\[\],]+\.(?:mp3|wav)\b"#).expect("audio link pattern is valid")
});

/// Distinct audio links in order of first appearance.
pub fn extract_audio_links(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    AUDIO_LINK
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|link| seen.insert(*link))
        .map(str::to_string)
        .collect()
}

/// Replace every link occurrence with its result, or leave it if there is none.
pub fn substitute_links(text: &str, results: &HashMap<String, String>) -> String {
    AUDIO_LINK
        .replace_all(text, |caps: &Captures| {
            let link = &caps[0];
            results.get(link).cloned().unwrap_or_else(|| link.to_string())
        })
        .into_owned()
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub links: Vec<String>,
    pub results: HashMap<String, String>,
    pub substituted: String,
    pub stats: QueueStats,
}

/// Run one batch end to end.
///
/// ## Parameters:
/// - **text**: free text that may contain audio links
/// - **concurrency**: worker count, already clamped by the caller's policy
/// - **cancel**: cooperative stop for this run
pub async fn process_batch(
    queue: &DispatchQueue,
    text: &str,
    concurrency: usize,
    cancel: &CancellationToken,
) -> BatchReport {
    let batch_id = Uuid::new_v4();
    let links = extract_audio_links(text);
    tracing::info!(%batch_id, links = links.len(), concurrency, "Batch received");

    let run = queue.run(links.clone(), concurrency, cancel).await;
    let substituted = substitute_links(text, &run.results);

    tracing::info!(
        %batch_id,
        completed = run.stats.completed,
        failed = run.stats.failed,
        cancelled = run.stats.cancelled,
        "Batch finished"
    );

    BatchReport {
        batch_id,
        links,
        results: run.results,
        substituted,
        stats: run.stats,
    }
}
