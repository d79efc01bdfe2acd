//! Progress-callback trait for per-request conversion events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::ConversionConfigBuilder::progress_callback`] to follow a
//! request through its stages: a CLI spinner, a metrics counter, or a job
//! record in a database. The library knows nothing about the receiver.
//!
//! Callbacks run inline on the converting task, so they should return
//! quickly. They are `Send + Sync` because [`crate::stream::convert_stream`]
//! converts several requests at once and calls into the same callback from
//! each of them.
//!
//! # Example
//!
//! ```rust
//! use edgequake_html2docx::{ConversionConfig, ConversionProgressCallback, Stage};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//! use uuid::Uuid;
//!
//! struct Delivered(AtomicUsize);
//!
//! impl ConversionProgressCallback for Delivered {
//!     fn on_stage(&self, _request_id: Uuid, stage: Stage) {
//!         if stage == Stage::Delivered {
//!             self.0.fetch_add(1, Ordering::SeqCst);
//!         }
//!     }
//! }
//!
//! let config = ConversionConfig::builder()
//!     .progress_callback(Arc::new(Delivered(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::error::Html2DocxError;
use crate::output::ConversionStats;
use crate::stage::Stage;
use std::sync::Arc;
use uuid::Uuid;

/// Called by the pipeline as a request moves through its stages.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called on every stage transition, starting with [`Stage::Received`]
    /// and ending with a terminal stage.
    fn on_stage(&self, request_id: Uuid, stage: Stage) {
        let _ = (request_id, stage);
    }

    /// Called before each engine invocation.
    ///
    /// # Arguments
    /// * `attempt`      — 1-indexed attempt number
    /// * `max_attempts` — 1 + configured retries
    fn on_engine_attempt(&self, request_id: Uuid, attempt: u32, max_attempts: u32) {
        let _ = (request_id, attempt, max_attempts);
    }

    /// Called once when a document has been produced.
    fn on_conversion_complete(&self, request_id: Uuid, stats: &ConversionStats) {
        let _ = (request_id, stats);
    }

    /// Called once when a request ends in a failure stage.
    fn on_conversion_failed(&self, request_id: Uuid, error: &Html2DocxError) {
        let _ = (request_id, error);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ConversionConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;
