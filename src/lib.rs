//! # edgequake-html2docx
//!
//! Convert uploaded HTML documents containing mathematical notation into
//! Word (`.docx`) documents with native equations.
//!
//! ## Why this crate?
//!
//! Rich-text editors mark formulas with a container element such as
//! `<span class="math-tex">\frac{a}{b}</span>`. pandoc turns TeX math into
//! Word equations, but only when it sees TeX delimiters it understands. This
//! crate rewrites those containers into `\(…\)` / `\[…\]` spans, leaves every
//! other byte of the upload untouched, hands the result to pandoc under a
//! timeout, and guarantees the temporary files it needed are gone afterwards.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload (bytes, filename, media type)
//!  │
//!  ├─ 1. Validate  size, emptiness, extension, media type, charset decode
//!  ├─ 2. Rewrite   math markers → TeX delimiters, optional bare-TeX wrapping
//!  ├─ 3. Convert   pandoc --to docx, timeout + kill, ZIP signature check
//!  └─ 4. Deliver   bytes in memory or a file handle; artifacts released
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_html2docx::{convert, ConversionConfig, ConversionRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let request = ConversionRequest::from_path("lesson.html").await?;
//!     let output = convert(request, &ConversionConfig::default()).await?;
//!     std::fs::write(&output.filename, &output.document)?;
//!     eprintln!(
//!         "{} math spans rewritten, {} skipped",
//!         output.stats.rewrite.rewrites(),
//!         output.stats.rewrite.skipped.len()
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature    | Default | Description |
//! |------------|---------|-------------|
//! | `cli`      | on      | Enables the `html2docx` binary (clap + anyhow + tracing-subscriber) |
//! | `download` | off     | Lets `pandoc-auto` fetch a pinned pandoc release when none is installed |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! edgequake-html2docx = { version = "0.2", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod artifacts;
pub mod config;
pub mod convert;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod request;
pub mod stage;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use artifacts::{ArtifactManager, SweepStats};
pub use config::{ConversionConfig, ConversionConfigBuilder};
pub use convert::{
    check_engine, convert, convert_for_delivery, convert_sync, convert_to_file, resolve_engine,
};
pub use error::{EngineError, ErrorClass, Html2DocxError, InvalidInput, ResourceError};
pub use output::{ConversionOutput, ConversionStats, DeliveredDocument, DOCX_MEDIA_TYPE};
pub use pipeline::engine::{ConversionEngine, EngineInfo, EngineJob, PandocEngine};
pub use pipeline::cleanup::CleanupReport;
pub use pipeline::rewrite::{rewrite, NormalizedDocument, RewriteOptions, RewriteReport};
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use request::ConversionRequest;
pub use stage::{RequestTracker, Stage, StageTimings};
pub use stream::{convert_stream, BatchItem, ConversionStream};
