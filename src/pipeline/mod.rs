//! Pipeline stages for HTML-to-DOCX conversion.
//!
//! Each submodule implements exactly one transformation step, so each can be
//! tested without the others and the engine can be swapped for a test double.
//!
//! ## Data Flow
//!
//! ```text
//! validate ──▶ rewrite ──▶ engine
//! (bytes→text)  (math spans)  (pandoc → .docx)
//! ```
//!
//! 1. [`validate`] — size, type and extension checks, then charset decoding
//!    via [`charset`]. Pure; allocates no files.
//! 2. [`rewrite`]  — replace math marker elements with TeX delimiters, using
//!    the byte-range [`scan`]ner so untouched markup is copied verbatim, and
//!    optionally [`bare_tex`] detection. Opt-in [`cleanup`] passes for Word
//!    exports and escaped markup run first.
//! 3. [`engine`]   — run pandoc on the rewritten document under a timeout
//!    and check that what comes back is a DOCX container. The only stage that
//!    touches processes and the filesystem.

pub mod bare_tex;
pub mod charset;
pub mod cleanup;
pub mod engine;
pub mod rewrite;
pub mod scan;
pub mod validate;
