//! Request lifecycle: the stage machine and its tracker.
//!
//! ```text
//! Received ──▶ Validated ──▶ Rewritten ──▶ Converted ──▶ Delivered
//!    │                           │             │
//!    ▼                           ▼             ▼
//! Rejected               ConversionFailed  InternalError
//! ```
//!
//! Any non-terminal stage may also fall into `InternalError`. `Delivered`
//! and the three failure stages are terminal: nothing leaves them.

use crate::error::{ErrorClass, Html2DocxError};
use crate::progress::ProgressCallback;
use serde::Serialize;
use std::fmt;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Validated,
    Rewritten,
    Converted,
    Delivered,
    Rejected,
    ConversionFailed,
    InternalError,
}

impl Stage {
    /// The next stage on the success path.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Received => Some(Stage::Validated),
            Stage::Validated => Some(Stage::Rewritten),
            Stage::Rewritten => Some(Stage::Converted),
            Stage::Converted => Some(Stage::Delivered),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Stage::Delivered | Stage::Rejected | Stage::ConversionFailed | Stage::InternalError
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Stage::Rejected | Stage::ConversionFailed | Stage::InternalError
        )
    }

    pub fn can_transition_to(self, to: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            Stage::Rejected => self == Stage::Received,
            // The engine runs between Rewritten and Converted; the output is
            // checked before Delivered.
            Stage::ConversionFailed => matches!(self, Stage::Rewritten | Stage::Converted),
            Stage::InternalError => true,
            _ => self.next() == Some(to),
        }
    }

    /// The failure stage an error of this class leads to.
    pub fn for_error(error: &Html2DocxError) -> Stage {
        match error.class() {
            ErrorClass::InvalidInput => Stage::Rejected,
            ErrorClass::ConversionEngine => Stage::ConversionFailed,
            ErrorClass::Resource | ErrorClass::Internal => Stage::InternalError,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Validated => "validated",
            Stage::Rewritten => "rewritten",
            Stage::Converted => "converted",
            Stage::Delivered => "delivered",
            Stage::Rejected => "rejected",
            Stage::ConversionFailed => "conversion_failed",
            Stage::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Milliseconds spent reaching each stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageTimings {
    pub validate_ms: u64,
    pub rewrite_ms: u64,
    pub convert_ms: u64,
    pub deliver_ms: u64,
}

/// Drives one request through [`Stage`]s, strictly in order.
///
/// Logs each transition and forwards it to the progress callback.
pub struct RequestTracker {
    request_id: Uuid,
    stage: Stage,
    started: Instant,
    stage_started: Instant,
    timings: StageTimings,
    progress: Option<ProgressCallback>,
}

impl RequestTracker {
    pub fn new(request_id: Uuid, progress: Option<ProgressCallback>) -> Self {
        let now = Instant::now();
        debug!(%request_id, stage = %Stage::Received, "Stage");
        if let Some(ref cb) = progress {
            cb.on_stage(request_id, Stage::Received);
        }
        Self {
            request_id,
            stage: Stage::Received,
            started: now,
            stage_started: now,
            timings: StageTimings::default(),
            progress,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn timings(&self) -> StageTimings {
        self.timings
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn progress(&self) -> Option<&ProgressCallback> {
        self.progress.as_ref()
    }

    /// Move to `to` along the success path.
    ///
    /// Skipping or repeating a stage is a bug in the caller and reported as
    /// an internal error.
    pub fn advance(&mut self, to: Stage) -> Result<(), Html2DocxError> {
        if to.is_failure() || !self.stage.can_transition_to(to) {
            return Err(Html2DocxError::internal_for(
                self.request_id,
                format!("illegal stage transition {} -> {}", self.stage, to),
            ));
        }
        let spent = self.stage_started.elapsed().as_millis() as u64;
        match to {
            Stage::Validated => self.timings.validate_ms = spent,
            Stage::Rewritten => self.timings.rewrite_ms = spent,
            Stage::Converted => self.timings.convert_ms = spent,
            Stage::Delivered => self.timings.deliver_ms = spent,
            _ => {}
        }
        self.enter(to);
        Ok(())
    }

    /// Move to the failure stage matching `error` and report it.
    ///
    /// Returns the stage entered. A failure the current stage does not allow
    /// becomes `InternalError`. On an already terminal tracker this only
    /// logs.
    pub fn fail(&mut self, error: &Html2DocxError) -> Stage {
        if self.stage.is_terminal() {
            warn!(request_id = %self.request_id, stage = %self.stage, "Failure after terminal stage: {error}");
            return self.stage;
        }
        let mut target = Stage::for_error(error);
        if !self.stage.can_transition_to(target) {
            target = Stage::InternalError;
        }
        match target {
            Stage::Rejected => info!(request_id = %self.request_id, "Rejected: {error}"),
            Stage::ConversionFailed => {
                warn!(request_id = %self.request_id, "Conversion failed: {error:?}")
            }
            _ => error!(request_id = %self.request_id, "Internal error: {error:?}"),
        }
        self.enter(target);
        if let Some(ref cb) = self.progress {
            cb.on_conversion_failed(self.request_id, error);
        }
        target
    }

    fn enter(&mut self, to: Stage) {
        debug!(
            request_id = %self.request_id,
            from = %self.stage,
            to = %to,
            ms = self.stage_started.elapsed().as_millis() as u64,
            "Stage"
        );
        self.stage = to;
        self.stage_started = Instant::now();
        if let Some(ref cb) = self.progress {
            cb.on_stage(self.request_id, to);
        }
    }
}
