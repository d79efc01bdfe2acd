//! Error types for the edgequake-html2docx library.
//!
//! One top-level error, [`Html2DocxError`], is returned by every `convert*`
//! entry point. Its variants follow the four failure classes a caller has to
//! tell apart:
//!
//! * [`InvalidInput`] — the upload itself is unacceptable (empty, wrong type,
//!   oversized, undecodable). A client error; retrying the same bytes cannot
//!   help. Detected before any file or process is created.
//!
//! * [`EngineError`] — pandoc is missing, crashed, timed out, or produced
//!   something that is not a `.docx`. A server-side failure the caller may
//!   retry as a whole request.
//!
//! * [`ResourceError`] — temporary storage could not be allocated or
//!   cleaned up (disk full, permission denied). Fatal for the request.
//!
//! * [`Html2DocxError::Internal`] — anything unexpected. Its `Display` never
//!   carries internal detail, only a correlation id that matches the log line.
//!
//! Use [`Html2DocxError::class`] to map an error onto a transport status and
//! [`Html2DocxError::public_message`] for text that is safe to show a caller.

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// All errors returned by the edgequake-html2docx library.
#[derive(Debug, Error)]
pub enum Html2DocxError {
    /// The upload failed validation. Returned before any resource allocation.
    #[error(transparent)]
    InvalidInput(#[from] InvalidInput),

    /// The external conversion engine failed.
    #[error(transparent)]
    ConversionEngine(#[from] EngineError),

    /// Temporary storage allocation or cleanup failed.
    #[error("Temporary storage failure: {0}")]
    Resource(#[from] ResourceError),

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected internal error. `detail` is for logs only.
    #[error("Internal error (reference {correlation_id})")]
    Internal { correlation_id: Uuid, detail: String },
}

/// Coarse classification of an [`Html2DocxError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorClass {
    /// Client error: malformed, empty, wrong-type or oversized upload.
    InvalidInput,
    /// Engine missing, crashed, timed out or produced unreadable output.
    ConversionEngine,
    /// Temporary storage failure.
    Resource,
    /// Anything else, including configuration errors.
    Internal,
}

impl Html2DocxError {
    /// Build an internal error with a fresh correlation id.
    pub fn internal(detail: impl Into<String>) -> Self {
        Html2DocxError::Internal {
            correlation_id: Uuid::new_v4(),
            detail: detail.into(),
        }
    }

    /// Build an internal error tagged with an existing request id.
    pub fn internal_for(correlation_id: Uuid, detail: impl Into<String>) -> Self {
        Html2DocxError::Internal {
            correlation_id,
            detail: detail.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Html2DocxError::InvalidInput(_) => ErrorClass::InvalidInput,
            Html2DocxError::ConversionEngine(_) => ErrorClass::ConversionEngine,
            Html2DocxError::Resource(_) => ErrorClass::Resource,
            Html2DocxError::InvalidConfig(_) | Html2DocxError::Internal { .. } => {
                ErrorClass::Internal
            }
        }
    }

    /// `true` when the caller sent something unacceptable.
    pub fn is_client_error(&self) -> bool {
        self.class() == ErrorClass::InvalidInput
    }

    /// Text that is safe to return to an untrusted caller.
    ///
    /// Validation messages are returned verbatim. Engine failures are
    /// summarised without pandoc's stderr. Storage and internal failures are
    /// reduced to a generic sentence; internal ones keep the correlation id.
    pub fn public_message(&self) -> String {
        match self {
            Html2DocxError::InvalidInput(e) => e.to_string(),
            Html2DocxError::ConversionEngine(e) => e.public_message(),
            Html2DocxError::Resource(_) => {
                "Temporary storage is unavailable; please retry later.".to_string()
            }
            Html2DocxError::InvalidConfig(_) => "Converter is misconfigured.".to_string(),
            Html2DocxError::Internal { correlation_id, .. } => {
                format!("Internal error (reference {correlation_id})")
            }
        }
    }
}

/// Reasons an upload is rejected by the input validator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvalidInput {
    /// Content is empty or whitespace-only.
    #[error("Uploaded content is empty")]
    EmptyContent,

    /// Content is larger than the configured maximum.
    #[error("File too large: {size} bytes (maximum {limit} bytes)")]
    TooLarge { size: usize, limit: usize },

    /// Filename does not end in an accepted extension.
    #[error("Unsupported file name '{filename}': expected a .html or .htm file")]
    UnsupportedExtension { filename: String },

    /// Declared media type is not an accepted HTML type.
    #[error("Unsupported media type '{media_type}': expected text/html or application/xhtml+xml")]
    UnsupportedMediaType { media_type: String },

    /// Bytes are not valid in the detected character encoding.
    #[error("Content is not valid {charset}: {detail}")]
    Undecodable { charset: String, detail: String },
}

/// Failures of the external conversion engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine is not installed or could not be started. Reported at
    /// startup or first use, separately from per-request failures.
    #[error("Conversion engine '{program}' is unavailable: {reason}\nInstall pandoc and make sure it is on PATH, or set PANDOC_PATH.")]
    Unavailable { program: String, reason: String },

    /// The engine exited with a non-zero status.
    #[error("Conversion engine exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    /// The engine did not finish within the configured limit and was killed.
    #[error("Conversion engine timed out after {elapsed_ms}ms and was terminated")]
    Timeout { elapsed_ms: u64 },

    /// The engine reported success but produced no output.
    #[error("Conversion engine reported success but produced no document")]
    EmptyOutput,

    /// The output exists but is not a DOCX (ZIP) container.
    #[error("Conversion engine produced an unreadable document (first bytes: {magic:?})")]
    CorruptOutput { magic: Vec<u8> },

    /// The output could not be read back.
    #[error("Failed to read converted document: {0}")]
    OutputUnreadable(String),

    /// Process plumbing failed (pipes, wait).
    #[error("Conversion engine I/O error: {0}")]
    Io(String),
}

impl EngineError {
    /// Only non-zero exits are worth another attempt; a timeout or missing
    /// binary will not change on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Failed { .. })
    }

    fn public_message(&self) -> String {
        match self {
            EngineError::Unavailable { .. } => "Conversion engine is not available.".to_string(),
            EngineError::Failed { .. } => "Conversion engine failed to convert the document.".to_string(),
            EngineError::Timeout { .. } => "Conversion timed out.".to_string(),
            EngineError::EmptyOutput
            | EngineError::CorruptOutput { .. }
            | EngineError::OutputUnreadable(_) => {
                "Conversion engine produced an unreadable document.".to_string()
            }
            EngineError::Io(_) => "Conversion engine failed to run.".to_string(),
        }
    }
}

/// Temporary storage failures.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// Could not create the temporary root directory.
    #[error("cannot create temporary root '{path}': {source}")]
    CreateRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not write an artifact.
    #[error("cannot write artifact '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An artifact path already existed; request ids must be unique.
    #[error("artifact '{path}' already exists")]
    Collision { path: PathBuf },

    /// Could not delete an artifact.
    #[error("cannot release artifact '{path}': {source}")]
    Release {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not list the temporary root while sweeping.
    #[error("cannot sweep '{path}': {source}")]
    Sweep {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_large_display() {
        let e = InvalidInput::TooLarge {
            size: 6_000_000,
            limit: 5_242_880,
        };
        let msg = e.to_string();
        assert!(msg.contains("6000000"), "got: {msg}");
        assert!(msg.contains("5242880"), "got: {msg}");
    }

    #[test]
    fn invalid_input_is_client_error() {
        let e: Html2DocxError = InvalidInput::EmptyContent.into();
        assert_eq!(e.class(), ErrorClass::InvalidInput);
        assert!(e.is_client_error());
        assert_eq!(e.public_message(), "Uploaded content is empty");
    }

    #[test]
    fn engine_timeout_display() {
        let e = EngineError::Timeout { elapsed_ms: 5000 };
        assert!(e.to_string().contains("5000ms"));
        assert!(!e.is_retryable());
    }

    #[test]
    fn only_nonzero_exit_is_retryable() {
        let failed = EngineError::Failed {
            status: "exit status: 1".into(),
            stderr: "boom".into(),
        };
        assert!(failed.is_retryable());
        assert!(!EngineError::EmptyOutput.is_retryable());
        assert!(!EngineError::Unavailable {
            program: "pandoc".into(),
            reason: "not found".into()
        }
        .is_retryable());
    }

    #[test]
    fn engine_public_message_hides_stderr() {
        let e: Html2DocxError = EngineError::Failed {
            status: "exit status: 64".into(),
            stderr: "/srv/tmp/secret-path: parse error".into(),
        }
        .into();
        assert_eq!(e.class(), ErrorClass::ConversionEngine);
        assert!(!e.public_message().contains("secret-path"));
    }

    #[test]
    fn internal_error_hides_detail() {
        let id = Uuid::new_v4();
        let e = Html2DocxError::internal_for(id, "panic in /home/app/src/convert.rs");
        let shown = e.to_string();
        assert!(shown.contains(&id.to_string()));
        assert!(!shown.contains("/home/app"));
        assert_eq!(shown, e.public_message());
    }

    #[test]
    fn resource_error_public_message_is_generic() {
        let e: Html2DocxError = ResourceError::Collision {
            path: PathBuf::from("/var/tmp/html2docx/x-input.html"),
        }
        .into();
        assert_eq!(e.class(), ErrorClass::Resource);
        assert!(!e.public_message().contains("/var/tmp"));
    }
}
