//! Configuration types for HTML-to-DOCX conversion.
//!
//! All conversion behaviour is controlled through [`ConversionConfig`], built
//! via its [`ConversionConfigBuilder`]. One struct carries validation limits,
//! math-marker conventions, engine invocation and temporary-storage policy so
//! a single value can be shared across concurrent requests.

use crate::error::Html2DocxError;
use crate::pipeline::engine::ConversionEngine;
use crate::pipeline::rewrite::RewriteOptions;
use crate::progress::ProgressCallback;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// pandoc reader: HTML plus both TeX math delimiter conventions, so that
/// `\( … \)`, `\[ … \]`, `$ … $` and `$$ … $$` become native equations.
pub const DEFAULT_INPUT_FORMAT: &str = "html+tex_math_dollars+tex_math_single_backslash";

/// Class token that marks an inline math container (CKEditor convention).
pub const DEFAULT_INLINE_MATH_CLASS: &str = "math-tex";

/// Class token that marks a display (block) math container.
pub const DEFAULT_DISPLAY_MATH_CLASS: &str = "math-display";

/// Media types accepted by default.
pub const DEFAULT_MEDIA_TYPES: &[&str] = &["text/html", "application/xhtml+xml"];

/// Configuration for an HTML-to-DOCX conversion.
///
/// Built via [`ConversionConfig::builder()`] or using
/// [`ConversionConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_html2docx::ConversionConfig;
///
/// let config = ConversionConfig::builder()
///     .max_input_bytes(2 * 1024 * 1024)
///     .engine_timeout_secs(30)
///     .detect_bare_tex(true)
///     .build()
///     .unwrap();
/// assert_eq!(config.engine_timeout().as_secs(), 30);
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Largest accepted upload in bytes. Default: 5 MiB.
    pub max_input_bytes: usize,

    /// Accepted media type essences (parameters such as `charset` are
    /// ignored when comparing). Default: `text/html`, `application/xhtml+xml`.
    pub accepted_media_types: Vec<String>,

    /// Directory that holds every temporary artifact. Created on first use.
    /// Default: `$TMPDIR/html2docx`.
    pub temp_root: PathBuf,

    /// How long a deferred (still-streaming) output may stay on disk before
    /// the sweeper reclaims it. Default: 300 s.
    pub retention_secs: u64,

    /// Minimum spacing between on-completion sweeps. Default: 60 s.
    pub sweep_interval_secs: u64,

    /// Wall-clock limit for one engine invocation, in milliseconds.
    /// Default: 60 000.
    ///
    /// pandoc normally converts a few hundred kilobytes of HTML in well under
    /// a second; a run that takes a minute is stuck, and is killed so it
    /// cannot hold a worker slot indefinitely.
    pub engine_timeout_ms: u64,

    /// Extra attempts after a non-zero engine exit. Default: 0.
    ///
    /// Retrying doubles load on an engine that may already be overloaded, so
    /// the default is off. Timeouts and a missing engine are never retried.
    pub engine_max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    pub retry_backoff_ms: u64,

    /// Explicit pandoc executable. If `None`, discovered via `pandoc-auto`.
    pub pandoc_path: Option<PathBuf>,

    /// Download a pinned pandoc release when none is installed (requires the
    /// `download` feature). Default: false.
    pub auto_install_engine: bool,

    /// pandoc `--from` value. Default: [`DEFAULT_INPUT_FORMAT`].
    pub input_format: String,

    /// Extra pandoc arguments placed before the input path. Default: `--mathjax`.
    pub engine_args: Vec<String>,

    /// Class token of inline math containers. Default: `math-tex`.
    pub inline_math_class: String,

    /// Class token of display math containers. Default: `math-display`.
    /// `None` disables display-math rewriting.
    pub display_math_class: Option<String>,

    /// Wrap bare TeX commands found in plain text (e.g. `\frac{1}{2}`) in
    /// inline delimiters. Default: false.
    pub detect_bare_tex: bool,

    /// Replace the upload with an HTML document pasted into it as escaped
    /// text. Default: false.
    pub extract_embedded_html: bool,

    /// Drop Word export wrappers (`Mso*` classes, unmarked spans, paragraphs
    /// around blocks). Default: false.
    pub simplify_word_export: bool,

    /// Turn escaped structural tags in text (`&lt;p&gt;`) into markup.
    /// Default: false.
    pub promote_escaped_tags: bool,

    /// Remove `<style>` blocks and doctypes that follow content. Default: false.
    pub strip_boilerplate: bool,

    /// Maximum requests in flight for [`crate::stream::convert_stream`]. Default: 4.
    pub concurrency: usize,

    /// Pre-constructed engine. Takes precedence over `pandoc_path`.
    ///
    /// Share one engine across requests to check pandoc once per process
    /// instead of once per request, or inject a test double.
    pub engine: Option<Arc<dyn ConversionEngine>>,

    /// Receives stage transitions for each request.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            max_input_bytes: 5 * 1024 * 1024,
            accepted_media_types: DEFAULT_MEDIA_TYPES.iter().map(|s| s.to_string()).collect(),
            temp_root: std::env::temp_dir().join("html2docx"),
            retention_secs: 300,
            sweep_interval_secs: 60,
            engine_timeout_ms: 60_000,
            engine_max_retries: 0,
            retry_backoff_ms: 500,
            pandoc_path: None,
            auto_install_engine: false,
            input_format: DEFAULT_INPUT_FORMAT.to_string(),
            engine_args: vec!["--mathjax".to_string()],
            inline_math_class: DEFAULT_INLINE_MATH_CLASS.to_string(),
            display_math_class: Some(DEFAULT_DISPLAY_MATH_CLASS.to_string()),
            detect_bare_tex: false,
            extract_embedded_html: false,
            simplify_word_export: false,
            promote_escaped_tags: false,
            strip_boilerplate: false,
            concurrency: 4,
            engine: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("max_input_bytes", &self.max_input_bytes)
            .field("accepted_media_types", &self.accepted_media_types)
            .field("temp_root", &self.temp_root)
            .field("retention_secs", &self.retention_secs)
            .field("sweep_interval_secs", &self.sweep_interval_secs)
            .field("engine_timeout_ms", &self.engine_timeout_ms)
            .field("engine_max_retries", &self.engine_max_retries)
            .field("pandoc_path", &self.pandoc_path)
            .field("auto_install_engine", &self.auto_install_engine)
            .field("input_format", &self.input_format)
            .field("engine_args", &self.engine_args)
            .field("inline_math_class", &self.inline_math_class)
            .field("display_math_class", &self.display_math_class)
            .field("detect_bare_tex", &self.detect_bare_tex)
            .field("extract_embedded_html", &self.extract_embedded_html)
            .field("simplify_word_export", &self.simplify_word_export)
            .field("promote_escaped_tags", &self.promote_escaped_tags)
            .field("strip_boilerplate", &self.strip_boilerplate)
            .field("concurrency", &self.concurrency)
            .field("engine", &self.engine.as_ref().map(|e| e.name().to_string()))
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ConversionProgressCallback>"),
            )
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_millis(self.engine_timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Options for the math span rewriter derived from this config.
    pub fn rewrite_options(&self) -> RewriteOptions {
        RewriteOptions {
            inline_class: self.inline_math_class.clone(),
            display_class: self.display_math_class.clone(),
            detect_bare_tex: self.detect_bare_tex,
            extract_embedded_html: self.extract_embedded_html,
            simplify_word_export: self.simplify_word_export,
            promote_escaped_tags: self.promote_escaped_tags,
            strip_boilerplate: self.strip_boilerplate,
        }
    }
}

/// Builder for [`ConversionConfig`].
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl fmt::Debug for ConversionConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl ConversionConfigBuilder {
    pub fn max_input_bytes(mut self, n: usize) -> Self {
        self.config.max_input_bytes = n;
        self
    }

    pub fn accepted_media_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.accepted_media_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn temp_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.temp_root = dir.into();
        self
    }

    pub fn retention_secs(mut self, secs: u64) -> Self {
        self.config.retention_secs = secs.max(1);
        self
    }

    pub fn sweep_interval_secs(mut self, secs: u64) -> Self {
        self.config.sweep_interval_secs = secs.max(1);
        self
    }

    pub fn engine_timeout_secs(mut self, secs: u64) -> Self {
        self.config.engine_timeout_ms = secs.saturating_mul(1000);
        self
    }

    pub fn engine_timeout_ms(mut self, ms: u64) -> Self {
        self.config.engine_timeout_ms = ms;
        self
    }

    pub fn engine_max_retries(mut self, n: u32) -> Self {
        self.config.engine_max_retries = n.min(5);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn pandoc_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pandoc_path = Some(path.into());
        self
    }

    pub fn auto_install_engine(mut self, v: bool) -> Self {
        self.config.auto_install_engine = v;
        self
    }

    pub fn input_format(mut self, format: impl Into<String>) -> Self {
        self.config.input_format = format.into();
        self
    }

    pub fn engine_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.engine_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn inline_math_class(mut self, class: impl Into<String>) -> Self {
        self.config.inline_math_class = class.into();
        self
    }

    pub fn display_math_class(mut self, class: Option<String>) -> Self {
        self.config.display_math_class = class;
        self
    }

    pub fn detect_bare_tex(mut self, v: bool) -> Self {
        self.config.detect_bare_tex = v;
        self
    }

    pub fn extract_embedded_html(mut self, v: bool) -> Self {
        self.config.extract_embedded_html = v;
        self
    }

    pub fn simplify_word_export(mut self, v: bool) -> Self {
        self.config.simplify_word_export = v;
        self
    }

    pub fn promote_escaped_tags(mut self, v: bool) -> Self {
        self.config.promote_escaped_tags = v;
        self
    }

    pub fn strip_boilerplate(mut self, v: bool) -> Self {
        self.config.strip_boilerplate = v;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn ConversionEngine>) -> Self {
        self.config.engine = Some(engine);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, Html2DocxError> {
        let c = &self.config;
        if c.max_input_bytes == 0 {
            return Err(Html2DocxError::InvalidConfig(
                "max_input_bytes must be ≥ 1".into(),
            ));
        }
        if c.engine_timeout_ms == 0 {
            return Err(Html2DocxError::InvalidConfig(
                "engine timeout must be > 0".into(),
            ));
        }
        if c.accepted_media_types.is_empty() {
            return Err(Html2DocxError::InvalidConfig(
                "at least one accepted media type is required".into(),
            ));
        }
        if !is_class_token(&c.inline_math_class) {
            return Err(Html2DocxError::InvalidConfig(format!(
                "inline math class must be a single class token, got {:?}",
                c.inline_math_class
            )));
        }
        if let Some(ref display) = c.display_math_class {
            if !is_class_token(display) {
                return Err(Html2DocxError::InvalidConfig(format!(
                    "display math class must be a single class token, got {:?}",
                    display
                )));
            }
            if display == &c.inline_math_class {
                return Err(Html2DocxError::InvalidConfig(
                    "inline and display math classes must differ".into(),
                ));
            }
        }
        if !c.input_format.starts_with("html") {
            return Err(Html2DocxError::InvalidConfig(format!(
                "input format must be an html reader, got {:?}",
                c.input_format
            )));
        }
        Ok(self.config)
    }
}

fn is_class_token(s: &str) -> bool {
    !s.is_empty() && !s.chars().any(char::is_whitespace)
}
