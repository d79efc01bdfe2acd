//! Main conversion entry points.
//!
//! Every entry point drives one request through the same stages:
//!
//! 1. validate the upload (no disk or process work before this passes)
//! 2. rewrite math markers into pandoc-readable delimiters
//! 3. write the input artifact and run the engine
//! 4. read back or hand over the `.docx`, then release the artifacts
//!
//! Temporary files are released on every exit path. After each request a
//! rate-limited sweep reclaims anything older than the retention window.

use crate::artifacts::{ArtifactManager, ArtifactScope};
use crate::config::ConversionConfig;
use crate::error::{EngineError, Html2DocxError, ResourceError};
use crate::output::{ConversionOutput, ConversionStats, DeliveredDocument};
use crate::pipeline::engine::{run_engine, ConversionEngine, EngineInfo, EngineRun, PandocEngine};
use crate::pipeline::rewrite::{rewrite, RewriteReport};
use crate::pipeline::validate::validate;
use crate::request::ConversionRequest;
use crate::stage::{RequestTracker, Stage};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Convert an HTML upload to a `.docx` held in memory.
///
/// Every temporary file of the request is deleted before this returns,
/// whether it succeeds or fails.
///
/// # Example
/// ```rust,no_run
/// use edgequake_html2docx::{convert, ConversionConfig, ConversionRequest};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let request = ConversionRequest::new(
///         r#"<p>Area: <span class="math-tex">\pi r^2</span></p>"#,
///         "circle.html",
///         "text/html",
///     );
///     let output = convert(request, &ConversionConfig::default()).await?;
///     std::fs::write(&output.filename, &output.document)?;
///     Ok(())
/// }
/// ```
pub async fn convert(
    request: ConversionRequest,
    config: &ConversionConfig,
) -> Result<ConversionOutput, Html2DocxError> {
    let manager = ArtifactManager::from_config(config);
    let mut scope = manager.scope();
    let mut tracker = RequestTracker::new(scope.request_id(), config.progress_callback.clone());
    log_start(&tracker, &request);

    let produced = produce(&request, config, &mut scope, &mut tracker).await;

    // ── Read back, then release everything ──────────────────────────────
    let read = match produced {
        Ok(p) => tokio::fs::read(&p.run.output)
            .await
            .map(|document| (p, document))
            .map_err(|e| Html2DocxError::from(EngineError::OutputUnreadable(e.to_string()))),
        Err(e) => Err(e),
    };
    release_scope(&mut scope);

    let result = read.and_then(|(p, document)| {
        tracker.advance(Stage::Delivered)?;
        Ok(ConversionOutput {
            document,
            filename: p.output_filename.clone(),
            request_id: tracker.request_id(),
            stats: p.stats(&tracker),
        })
    });

    match &result {
        Ok(output) => report_success(&tracker, &output.stats),
        Err(e) => {
            tracker.fail(e);
        }
    }
    manager.sweep_if_due().await;
    result
}

/// Convert an HTML upload and leave the `.docx` on disk for streaming.
///
/// The input artifact is released before this returns. The output is owned
/// by the returned [`DeliveredDocument`]: it is deleted when that value is
/// finished or dropped, or by the sweeper after the retention window.
pub async fn convert_for_delivery(
    request: ConversionRequest,
    config: &ConversionConfig,
) -> Result<DeliveredDocument, Html2DocxError> {
    let manager = ArtifactManager::from_config(config);
    let mut scope = manager.scope();
    let mut tracker = RequestTracker::new(scope.request_id(), config.progress_callback.clone());
    log_start(&tracker, &request);

    let result = match produce(&request, config, &mut scope, &mut tracker).await {
        Ok(p) => match scope.detach_output() {
            Some(artifact) => {
                release_scope(&mut scope);
                tracker.advance(Stage::Delivered).map(|()| {
                    let stats = p.stats(&tracker);
                    DeliveredDocument::new(
                        artifact,
                        p.output_filename.clone(),
                        tracker.request_id(),
                        stats,
                    )
                })
            }
            None => Err(Html2DocxError::internal_for(
                tracker.request_id(),
                "engine output missing from artifact scope",
            )),
        },
        Err(e) => Err(e),
    };
    // Releases the output too when it was never detached.
    release_scope(&mut scope);

    match &result {
        Ok(delivered) => report_success(&tracker, &delivered.stats),
        Err(e) => {
            tracker.fail(e);
        }
    }
    manager.sweep_if_due().await;
    result
}

/// Convert and write the `.docx` to `output_path`.
///
/// Writes to a temporary file beside the target and persists it into
/// place, so a failed conversion never leaves a truncated document behind.
pub async fn convert_to_file(
    request: ConversionRequest,
    output_path: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<ConversionStats, Html2DocxError> {
    let ConversionOutput {
        document,
        request_id,
        stats,
        ..
    } = convert(request, config).await?;
    let path = output_path.as_ref().to_path_buf();
    let write_err = |source: std::io::Error| ResourceError::Write {
        path: path.clone(),
        source,
    };

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&dir).await.map_err(write_err)?;

    let target = path.clone();
    let bytes = document.len();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".html2docx-")
            .suffix(".tmp")
            .tempfile_in(&dir)?;
        tmp.write_all(&document)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| Html2DocxError::internal_for(request_id, format!("write task failed: {e}")))?
    .map_err(write_err)?;

    info!(
        request_id = %request_id,
        path = %path.display(),
        bytes,
        "Wrote document"
    );
    Ok(stats)
}

/// Synchronous wrapper around [`convert`] for callers without a runtime.
pub fn convert_sync(
    request: ConversionRequest,
    config: &ConversionConfig,
) -> Result<ConversionOutput, Html2DocxError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| Html2DocxError::internal(format!("Failed to create tokio runtime: {e}")))?
        .block_on(convert(request, config))
}

/// Check the engine `config` resolves to.
///
/// Meant for startup: fails with [`EngineError::Unavailable`] when pandoc
/// cannot be found or started, before any request is accepted.
pub async fn check_engine(config: &ConversionConfig) -> Result<EngineInfo, Html2DocxError> {
    let engine = resolve_engine(config).await?;
    let info = engine.check_available().await?;
    info!(
        engine = engine.name(),
        program = %info.program,
        version = %info.version,
        "Conversion engine available"
    );
    Ok(info)
}

/// Resolve the engine for `config`.
///
/// Order: `config.engine`, then `config.pandoc_path`, then discovery via
/// `PANDOC_PATH`, `PATH` and the download cache, then (only with
/// `auto_install_engine`) a download. pandoc engines are shared per
/// program and arguments so the version check runs once per process.
pub async fn resolve_engine(
    config: &ConversionConfig,
) -> Result<Arc<dyn ConversionEngine>, Html2DocxError> {
    if let Some(ref engine) = config.engine {
        return Ok(Arc::clone(engine));
    }

    let program = match config.pandoc_path {
        Some(ref path) => path.clone(),
        None => discover_pandoc(config.auto_install_engine).await?,
    };
    Ok(shared_pandoc(program, config))
}

// ── Internal helpers ─────────────────────────────────────────────────────

type EngineKey = (PathBuf, String, Vec<String>);

static PANDOC_ENGINES: Lazy<Mutex<HashMap<EngineKey, Arc<PandocEngine>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn shared_pandoc(program: PathBuf, config: &ConversionConfig) -> Arc<dyn ConversionEngine> {
    let key = (
        program.clone(),
        config.input_format.clone(),
        config.engine_args.clone(),
    );
    let mut engines = PANDOC_ENGINES.lock().unwrap_or_else(|e| e.into_inner());
    let engine = engines
        .entry(key)
        .or_insert_with(|| Arc::new(PandocEngine::from_config(program, config)));
    Arc::clone(engine) as Arc<dyn ConversionEngine>
}

async fn discover_pandoc(auto_install: bool) -> Result<PathBuf, EngineError> {
    if let Some(path) = pandoc_auto::locate_pandoc() {
        debug!(path = %path.display(), "Found pandoc");
        return Ok(path);
    }
    if !auto_install {
        return Err(EngineError::Unavailable {
            program: "pandoc".to_string(),
            reason: "not found in PANDOC_PATH, PATH or the download cache".to_string(),
        });
    }

    info!(
        "pandoc not found; installing pandoc {} into {}",
        pandoc_auto::PANDOC_VERSION,
        pandoc_auto::pandoc_cache_dir().display()
    );
    tokio::task::spawn_blocking(|| pandoc_auto::ensure_pandoc(None))
        .await
        .map_err(|e| EngineError::Io(format!("pandoc install task failed: {e}")))?
        .map_err(|e| EngineError::Unavailable {
            program: "pandoc".to_string(),
            reason: e.to_string(),
        })
}

/// What the request produced up to [`Stage::Converted`].
struct Produced {
    input_bytes: usize,
    charset: &'static str,
    output_filename: String,
    normalized_bytes: usize,
    report: RewriteReport,
    run: EngineRun,
}

impl Produced {
    fn stats(&self, tracker: &RequestTracker) -> ConversionStats {
        ConversionStats {
            input_bytes: self.input_bytes,
            charset: self.charset.to_string(),
            normalized_bytes: self.normalized_bytes,
            output_bytes: self.run.output_bytes,
            rewrite: self.report.clone(),
            engine_attempts: self.run.attempts,
            timings: tracker.timings(),
            total_ms: tracker.elapsed_ms(),
        }
    }
}

async fn produce(
    request: &ConversionRequest,
    config: &ConversionConfig,
    scope: &mut ArtifactScope,
    tracker: &mut RequestTracker,
) -> Result<Produced, Html2DocxError> {
    // ── Step 1: Validate ─────────────────────────────────────────────────
    let validated = validate(request, config)?;
    tracker.advance(Stage::Validated)?;

    // ── Step 2: Rewrite math markers ─────────────────────────────────────
    let document = rewrite(&validated.html, &config.rewrite_options());
    tracker.advance(Stage::Rewritten)?;

    // ── Step 3: Run the engine ───────────────────────────────────────────
    let engine = resolve_engine(config).await?;
    let run = run_engine(engine.as_ref(), &document, scope, config, tracker.progress()).await?;
    tracker.advance(Stage::Converted)?;

    Ok(Produced {
        input_bytes: validated.input_bytes,
        charset: validated.charset,
        output_filename: validated.output_filename,
        normalized_bytes: document.html.len(),
        report: document.report,
        run,
    })
}

fn log_start(tracker: &RequestTracker, request: &ConversionRequest) {
    info!(
        request_id = %tracker.request_id(),
        filename = %request.filename,
        media_type = %request.media_type,
        bytes = request.content.len(),
        "Starting conversion"
    );
}

/// Release failures leave a file for the sweeper; they do not fail the request.
fn release_scope(scope: &mut ArtifactScope) {
    if let Err(e) = scope.release_all() {
        warn!(request_id = %scope.request_id(), "{e}");
    }
}

fn report_success(tracker: &RequestTracker, stats: &ConversionStats) {
    info!(
        request_id = %tracker.request_id(),
        input_bytes = stats.input_bytes,
        output_bytes = stats.output_bytes,
        rewrites = stats.rewrite.rewrites(),
        skipped = stats.rewrite.skipped.len(),
        attempts = stats.engine_attempts,
        total_ms = stats.total_ms,
        "Conversion complete"
    );
    if let Some(cb) = tracker.progress() {
        cb.on_conversion_complete(tracker.request_id(), stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::engine::EngineJob;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct CopyEngine;

    #[async_trait]
    impl ConversionEngine for CopyEngine {
        fn name(&self) -> &str {
            "copy"
        }

        async fn check_available(&self) -> Result<EngineInfo, EngineError> {
            Ok(EngineInfo {
                program: "copy".into(),
                version: "1".into(),
            })
        }

        /// Writes a ZIP signature followed by the normalized HTML.
        async fn convert(&self, job: &EngineJob) -> Result<(), EngineError> {
            let html = tokio::fs::read(&job.input).await.unwrap();
            let mut out = b"PK\x03\x04".to_vec();
            out.extend_from_slice(&html);
            tokio::fs::write(&job.output, out).await.unwrap();
            Ok(())
        }
    }

    fn config(dir: &TempDir) -> ConversionConfig {
        ConversionConfig::builder()
            .temp_root(dir.path().join("tmp"))
            .engine(Arc::new(CopyEngine))
            .build()
            .unwrap()
    }

    fn leftover(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path().join("tmp"))
            .map(|d| d.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn convert_returns_document_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let request = ConversionRequest::new(
            r#"<p><span class="math-tex">x^2</span></p>"#,
            "square.html",
            "text/html",
        );
        let out = convert(request, &config(&dir)).await.unwrap();
        assert_eq!(out.filename, "square.docx");
        assert!(out.document.starts_with(b"PK\x03\x04"));
        let html = String::from_utf8_lossy(&out.document[4..]).into_owned();
        assert!(html.contains(r"\( x^2 \)"));
        assert_eq!(out.stats.rewrite.inline_rewrites, 1);
        assert_eq!(out.stats.engine_attempts, 1);
        assert_eq!(leftover(&dir), 0);
    }

    #[tokio::test]
    async fn rejected_upload_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let request = ConversionRequest::new("<p>hi</p>", "notes.txt", "text/plain");
        let err = convert(request, &config(&dir)).await.unwrap_err();
        assert!(err.is_client_error());
        assert!(!dir.path().join("tmp").exists());
    }

    #[tokio::test]
    async fn delivery_keeps_output_until_finished() {
        let dir = TempDir::new().unwrap();
        let request = ConversionRequest::new("<p>hi</p>", "a.htm", "text/html");
        let delivered = convert_for_delivery(request, &config(&dir)).await.unwrap();
        assert_eq!(leftover(&dir), 1);
        assert!(delivered.read_bytes().await.unwrap().starts_with(b"PK"));
        delivered.finish().unwrap();
        assert_eq!(leftover(&dir), 0);
    }

    #[tokio::test]
    async fn convert_to_file_writes_atomically() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out").join("doc.docx");
        let request = ConversionRequest::new("<p>hi</p>", "doc.html", "text/html");
        let stats = convert_to_file(request, &target, &config(&dir))
            .await
            .unwrap();
        let written = std::fs::read(&target).unwrap();
        assert_eq!(written.len() as u64, stats.output_bytes);
        let names: Vec<_> = std::fs::read_dir(target.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("doc.docx")]);
    }

    #[tokio::test]
    async fn injected_engine_takes_precedence() {
        let dir = TempDir::new().unwrap();
        let config = ConversionConfig::builder()
            .temp_root(dir.path())
            .pandoc_path("/nonexistent/pandoc")
            .engine(Arc::new(CopyEngine))
            .build()
            .unwrap();
        let info = check_engine(&config).await.unwrap();
        assert_eq!(info.program, "copy");
    }

    #[tokio::test]
    async fn missing_pandoc_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let config = ConversionConfig::builder()
            .temp_root(dir.path())
            .pandoc_path(dir.path().join("no-such-pandoc"))
            .build()
            .unwrap();
        let err = check_engine(&config).await.unwrap_err();
        assert!(matches!(
            err,
            Html2DocxError::ConversionEngine(EngineError::Unavailable { .. })
        ));
    }

    #[test]
    fn shared_pandoc_reuses_engines() {
        let config = ConversionConfig::default();
        let a = shared_pandoc(PathBuf::from("/opt/pandoc-a"), &config);
        let b = shared_pandoc(PathBuf::from("/opt/pandoc-a"), &config);
        let c = shared_pandoc(PathBuf::from("/opt/pandoc-c"), &config);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
