//! # Dispatch Module
//!
//! The two front doors to transcription and the queue behind the batch one.
//!
//! - **Single-shot**: one URL, busy error for single-request backends, deadline
//! - **Batch**: extract links from text, transcribe, substitute
//! - **Queue**: bounded concurrency, cache-first, cooperative cancellation

pub mod batch;
pub mod queue;
pub mod single;

pub use batch::{process_batch, BatchReport};
pub use queue::DispatchQueue;
pub use single::SingleShot;
