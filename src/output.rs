//! Conversion results.

use crate::artifacts::TempArtifact;
use crate::error::Html2DocxError;
use crate::pipeline::rewrite::RewriteReport;
use crate::stage::StageTimings;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use uuid::Uuid;

/// Media type of a `.docx` document.
pub const DOCX_MEDIA_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Counters and timings for one successful conversion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversionStats {
    /// Size of the upload as received.
    pub input_bytes: usize,
    /// Encoding the upload was decoded from.
    pub charset: String,
    /// Size of the rewritten HTML handed to the engine.
    pub normalized_bytes: usize,
    /// Size of the produced document.
    pub output_bytes: u64,
    pub rewrite: RewriteReport,
    /// Engine invocations, including retries.
    pub engine_attempts: u32,
    pub timings: StageTimings,
    pub total_ms: u64,
}

/// The converted document, held in memory.
///
/// All temporary files are gone by the time this is returned.
#[derive(Clone, Serialize)]
pub struct ConversionOutput {
    #[serde(skip)]
    pub document: Vec<u8>,
    /// Suggested download name, always ending in `.docx`.
    pub filename: String,
    pub request_id: Uuid,
    pub stats: ConversionStats,
}

impl ConversionOutput {
    pub fn media_type(&self) -> &'static str {
        DOCX_MEDIA_TYPE
    }
}

impl fmt::Debug for ConversionOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionOutput")
            .field("document", &format_args!("<{} bytes>", self.document.len()))
            .field("filename", &self.filename)
            .field("request_id", &self.request_id)
            .field("stats", &self.stats)
            .finish()
    }
}

/// A converted document left on disk for the caller to stream out.
///
/// The file is deleted on [`finish`](Self::finish), when this value is
/// dropped, or by the sweeper once the retention window has passed,
/// whichever happens first. Stream from [`path`](Self::path) or
/// [`open`](Self::open) and call `finish` when the transfer is done.
#[derive(Debug)]
pub struct DeliveredDocument {
    artifact: TempArtifact,
    pub filename: String,
    pub request_id: Uuid,
    pub stats: ConversionStats,
}

impl DeliveredDocument {
    pub(crate) fn new(
        artifact: TempArtifact,
        filename: String,
        request_id: Uuid,
        stats: ConversionStats,
    ) -> Self {
        Self {
            artifact,
            filename,
            request_id,
            stats,
        }
    }

    pub fn path(&self) -> &Path {
        self.artifact.path()
    }

    pub fn media_type(&self) -> &'static str {
        DOCX_MEDIA_TYPE
    }

    /// Open the document for streaming.
    pub async fn open(&self) -> Result<tokio::fs::File, Html2DocxError> {
        tokio::fs::File::open(self.path())
            .await
            .map_err(|e| self.unavailable(e))
    }

    pub async fn read_bytes(&self) -> Result<Vec<u8>, Html2DocxError> {
        tokio::fs::read(self.path())
            .await
            .map_err(|e| self.unavailable(e))
    }

    /// Delete the file now.
    pub fn finish(mut self) -> Result<(), Html2DocxError> {
        self.artifact.release().map_err(Html2DocxError::from)
    }

    fn unavailable(&self, e: std::io::Error) -> Html2DocxError {
        // Most likely swept after the retention window.
        Html2DocxError::internal_for(
            self.request_id,
            format!("delivered document {} unavailable: {e}", self.path().display()),
        )
    }
}
