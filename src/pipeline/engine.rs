//! The external conversion engine and the adapter that drives it.
//!
//! [`ConversionEngine`] is the seam between this crate and whatever actually
//! produces the `.docx`. Production uses [`PandocEngine`]; tests inject
//! doubles through [`crate::config::ConversionConfigBuilder::engine`].
//!
//! ## Process handling
//!
//! pandoc runs as a child process with stdin closed and stderr captured (the
//! first [`STDERR_LIMIT`] bytes). Every child is spawned with
//! `kill_on_drop(true)`, so a cancelled conversion never leaves a process
//! behind. On timeout the child is killed and reaped before the error is
//! returned.
//!
//! ## Retry Strategy
//!
//! Only a non-zero exit is retried, with exponential backoff
//! (`retry_backoff_ms * 2^attempt`). A timeout will time out again, and a
//! missing binary stays missing, so neither is retried.

use crate::artifacts::ArtifactScope;
use crate::config::ConversionConfig;
use crate::error::{EngineError, Html2DocxError};
use crate::pipeline::rewrite::NormalizedDocument;
use crate::progress::ProgressCallback;
use async_trait::async_trait;
use serde::Serialize;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, Command};
use tokio::sync::OnceCell;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Leading bytes of every ZIP container, and so of every `.docx`.
pub const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";

/// Most stderr kept from one engine run.
pub const STDERR_LIMIT: usize = 16 * 1024;

/// Slack on top of the engine's own timeout before the adapter gives up on
/// the future altogether.
const OUTER_GRACE: Duration = Duration::from_secs(1);

/// Limit for the `--version` check.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for stderr to drain once the process has exited.
const STDERR_DRAIN: Duration = Duration::from_secs(1);

/// Identity of an available engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineInfo {
    pub program: String,
    pub version: String,
}

/// One conversion for the engine to perform.
#[derive(Debug, Clone)]
pub struct EngineJob {
    pub request_id: Uuid,
    /// Rewritten HTML to read.
    pub input: PathBuf,
    /// Where the `.docx` must be written.
    pub output: PathBuf,
    /// Wall-clock limit for this run.
    pub timeout: Duration,
}

/// Something that turns an HTML file into a `.docx` file.
#[async_trait]
pub trait ConversionEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Report whether the engine can run at all. Distinct from a failed
    /// conversion: an `Err` here means every request will fail.
    async fn check_available(&self) -> Result<EngineInfo, EngineError>;

    /// Convert `job.input` into `job.output` within `job.timeout`.
    async fn convert(&self, job: &EngineJob) -> Result<(), EngineError>;
}

/// pandoc as a child process.
pub struct PandocEngine {
    program: PathBuf,
    input_format: String,
    extra_args: Vec<String>,
    version: OnceCell<EngineInfo>,
}

impl PandocEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            input_format: crate::config::DEFAULT_INPUT_FORMAT.to_string(),
            extra_args: vec!["--mathjax".to_string()],
            version: OnceCell::new(),
        }
    }

    /// Engine for `program` using the reader and arguments from `config`.
    pub fn from_config(program: impl Into<PathBuf>, config: &ConversionConfig) -> Self {
        Self::new(program)
            .with_input_format(config.input_format.clone())
            .with_args(config.engine_args.clone())
    }

    pub fn with_input_format(mut self, format: impl Into<String>) -> Self {
        self.input_format = format.into();
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// `--from <fmt> --to docx --output <out> [extra] <in>`
    pub fn command_args(&self, job: &EngineJob) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--from".into(),
            self.input_format.clone().into(),
            "--to".into(),
            "docx".into(),
            "--output".into(),
            job.output.clone().into(),
        ];
        args.extend(self.extra_args.iter().map(OsString::from));
        args.push(job.input.clone().into());
        args
    }

    fn unavailable(&self, reason: impl Into<String>) -> EngineError {
        EngineError::Unavailable {
            program: self.program.display().to_string(),
            reason: reason.into(),
        }
    }

    async fn query_version(&self) -> Result<EngineInfo, EngineError> {
        let run = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = timeout(PROBE_TIMEOUT, run)
            .await
            .map_err(|_| self.unavailable("`--version` did not answer"))?
            .map_err(|e| self.unavailable(e.to_string()))?;
        if !output.status.success() {
            return Err(self.unavailable(format!("`--version` exited with {}", output.status)));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = parse_version(&stdout).unwrap_or("unknown").to_string();
        info!(program = %self.program.display(), %version, "Conversion engine available");
        Ok(EngineInfo {
            program: self.program.display().to_string(),
            version,
        })
    }
}

#[async_trait]
impl ConversionEngine for PandocEngine {
    fn name(&self) -> &str {
        "pandoc"
    }

    /// Queried once per engine; only success is cached, so an engine
    /// installed after a failed check is picked up.
    async fn check_available(&self) -> Result<EngineInfo, EngineError> {
        self.version
            .get_or_try_init(|| self.query_version())
            .await
            .cloned()
    }

    async fn convert(&self, job: &EngineJob) -> Result<(), EngineError> {
        self.check_available().await?;

        let args = self.command_args(job);
        debug!(request_id = %job.request_id, program = %self.program.display(), ?args, "Running engine");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => self.unavailable(e.to_string()),
                _ => EngineError::Io(format!("spawn failed: {e}")),
            })?;

        let stderr = tokio::spawn(read_capped(child.stderr.take()));
        let started = Instant::now();

        let waited = timeout(job.timeout, child.wait()).await;
        match waited {
            Ok(Ok(status)) => {
                let stderr = timeout(STDERR_DRAIN, stderr)
                    .await
                    .ok()
                    .and_then(Result::ok)
                    .unwrap_or_default();
                if status.success() {
                    if !stderr.is_empty() {
                        debug!(request_id = %job.request_id, "Engine warnings: {stderr}");
                    }
                    Ok(())
                } else {
                    Err(EngineError::Failed {
                        status: status.to_string(),
                        stderr,
                    })
                }
            }
            Ok(Err(e)) => Err(EngineError::Io(format!("wait failed: {e}"))),
            Err(_) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                warn!(request_id = %job.request_id, pid = ?child.id(), elapsed_ms, "Engine timed out, killing");
                // kill() also waits, so the process is reaped here.
                if let Err(e) = child.kill().await {
                    warn!(request_id = %job.request_id, "Failed to kill engine: {e}");
                }
                stderr.abort();
                Err(EngineError::Timeout { elapsed_ms })
            }
        }
    }
}

/// Read a pipe to the end, keeping at most [`STDERR_LIMIT`] bytes.
///
/// The whole stream is drained so the child never blocks on a full pipe.
async fn read_capped(pipe: Option<ChildStderr>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut kept = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = STDERR_LIMIT.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&kept).trim().to_string()
}

/// `pandoc 3.5\nFeatures: …` → `3.5`
fn parse_version(stdout: &str) -> Option<&str> {
    stdout.lines().next()?.split_whitespace().nth(1)
}

/// Outcome of [`run_engine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineRun {
    /// Validated `.docx` on disk, owned by the scope.
    pub output: PathBuf,
    pub output_bytes: u64,
    pub attempts: u32,
}

/// Write `document` to the scope, run `engine` with retries, and check the
/// result is a non-empty ZIP container.
pub async fn run_engine(
    engine: &dyn ConversionEngine,
    document: &NormalizedDocument,
    scope: &mut ArtifactScope,
    config: &ConversionConfig,
    progress: Option<&ProgressCallback>,
) -> Result<EngineRun, Html2DocxError> {
    let job = EngineJob {
        request_id: scope.request_id(),
        input: scope.create_input(&document.html).await?,
        output: scope.reserve_output().await?,
        timeout: config.engine_timeout(),
    };
    let max_attempts = config.engine_max_retries + 1;

    let mut attempt = 0;
    loop {
        attempt += 1;
        if attempt > 1 {
            let backoff = config.retry_backoff_ms * 2u64.pow(attempt - 2);
            warn!(
                request_id = %job.request_id,
                "Engine retry {}/{} after {}ms",
                attempt - 1,
                config.engine_max_retries,
                backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }
        if let Some(cb) = progress {
            cb.on_engine_attempt(job.request_id, attempt, max_attempts);
        }

        let started = Instant::now();
        let result = match timeout(job.timeout + OUTER_GRACE, engine.convert(&job)).await {
            Ok(result) => result,
            // Dropping the future drops the child, and kill_on_drop ends it.
            Err(_) => Err(EngineError::Timeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        };

        match result {
            Ok(()) => {
                let output_bytes = check_output(&job.output).await?;
                debug!(
                    request_id = %job.request_id,
                    attempt,
                    output_bytes,
                    ms = started.elapsed().as_millis() as u64,
                    "Engine finished"
                );
                return Ok(EngineRun {
                    output: job.output,
                    output_bytes,
                    attempts: attempt,
                });
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                warn!(request_id = %job.request_id, "Engine attempt {attempt} failed: {e}");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Non-empty and starting with the ZIP signature. Returns the file size.
async fn check_output(path: &Path) -> Result<u64, EngineError> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(EngineError::EmptyOutput),
        Err(e) => return Err(EngineError::OutputUnreadable(e.to_string())),
    };
    let len = file
        .metadata()
        .await
        .map_err(|e| EngineError::OutputUnreadable(e.to_string()))?
        .len();
    if len == 0 {
        return Err(EngineError::EmptyOutput);
    }

    let mut magic = Vec::with_capacity(ZIP_MAGIC.len());
    (&mut file)
        .take(ZIP_MAGIC.len() as u64)
        .read_to_end(&mut magic)
        .await
        .map_err(|e| EngineError::OutputUnreadable(e.to_string()))?;
    if magic != ZIP_MAGIC {
        return Err(EngineError::CorruptOutput { magic });
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactManager;
    use crate::pipeline::rewrite::{rewrite, RewriteOptions};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Writes `outputs[n]` on the n-th call; a `None` entry fails with exit 1.
    struct Scripted {
        outputs: Vec<Option<Vec<u8>>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ConversionEngine for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn check_available(&self) -> Result<EngineInfo, EngineError> {
            Ok(EngineInfo {
                program: "scripted".into(),
                version: "0".into(),
            })
        }

        async fn convert(&self, job: &EngineJob) -> Result<(), EngineError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.outputs.get(n).cloned().flatten() {
                Some(bytes) => {
                    tokio::fs::write(&job.output, bytes).await.unwrap();
                    Ok(())
                }
                None => Err(EngineError::Failed {
                    status: "exit status: 1".into(),
                    stderr: "boom".into(),
                }),
            }
        }
    }

    fn scripted(outputs: Vec<Option<&[u8]>>) -> Scripted {
        Scripted {
            outputs: outputs.into_iter().map(|o| o.map(<[u8]>::to_vec)).collect(),
            calls: AtomicU32::new(0),
        }
    }

    fn setup(dir: &TempDir, retries: u32) -> (ConversionConfig, ArtifactManager, NormalizedDocument) {
        let config = ConversionConfig::builder()
            .temp_root(dir.path())
            .engine_max_retries(retries)
            .retry_backoff_ms(1)
            .build()
            .unwrap();
        let manager = ArtifactManager::from_config(&config);
        let doc = rewrite("<p>x</p>", &RewriteOptions::default());
        (config, manager, doc)
    }

    #[test]
    fn pandoc_command_line() {
        let engine = PandocEngine::new("/usr/bin/pandoc");
        let job = EngineJob {
            request_id: Uuid::nil(),
            input: "/tmp/in.html".into(),
            output: "/tmp/out.docx".into(),
            timeout: Duration::from_secs(1),
        };
        let args: Vec<String> = engine
            .command_args(&job)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "--from",
                "html+tex_math_dollars+tex_math_single_backslash",
                "--to",
                "docx",
                "--output",
                "/tmp/out.docx",
                "--mathjax",
                "/tmp/in.html"
            ]
        );
    }

    #[test]
    fn version_line_is_parsed() {
        assert_eq!(parse_version("pandoc 3.5\nFeatures: +server\n"), Some("3.5"));
        assert_eq!(parse_version("pandoc.exe 2.19.2"), Some("2.19.2"));
        assert_eq!(parse_version(""), None);
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let engine = PandocEngine::new("/nonexistent/pandoc-html2docx-test");
        let err = engine.check_available().await.unwrap_err();
        assert!(matches!(err, EngineError::Unavailable { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn success_returns_checked_output() {
        let dir = TempDir::new().unwrap();
        let (config, manager, doc) = setup(&dir, 0);
        let engine = scripted(vec![Some(&b"PK\x03\x04rest"[..])]);
        let mut scope = manager.scope();
        let run = run_engine(&engine, &doc, &mut scope, &config, None)
            .await
            .unwrap();
        assert_eq!(run.attempts, 1);
        assert_eq!(run.output_bytes, 8);
        let written = std::fs::read_to_string(scope.input_path().unwrap()).unwrap();
        assert_eq!(written, doc.html);
    }

    #[tokio::test]
    async fn nonzero_exit_is_retried_with_limit() {
        let dir = TempDir::new().unwrap();
        let (config, manager, doc) = setup(&dir, 2);
        let engine = scripted(vec![None, None, Some(&b"PK\x03\x04"[..])]);
        let run = run_engine(&engine, &doc, &mut manager.scope(), &config, None)
            .await
            .unwrap();
        assert_eq!(run.attempts, 3);

        let engine = scripted(vec![None, None, None, Some(&b"PK\x03\x04"[..])]);
        let err = run_engine(&engine, &doc, &mut manager.scope(), &config, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Html2DocxError::ConversionEngine(EngineError::Failed { .. })
        ));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn no_retry_by_default() {
        let dir = TempDir::new().unwrap();
        let (config, manager, doc) = setup(&dir, 0);
        let engine = scripted(vec![None, Some(&b"PK\x03\x04"[..])]);
        assert!(run_engine(&engine, &doc, &mut manager.scope(), &config, None)
            .await
            .is_err());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_and_corrupt_outputs_are_rejected() {
        let dir = TempDir::new().unwrap();
        let (config, manager, doc) = setup(&dir, 3);

        let engine = scripted(vec![Some(&b""[..])]);
        let err = run_engine(&engine, &doc, &mut manager.scope(), &config, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Html2DocxError::ConversionEngine(EngineError::EmptyOutput)
        ));
        // Not retried.
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);

        let engine = scripted(vec![Some(&b"<html>oops</html>"[..])]);
        let err = run_engine(&engine, &doc, &mut manager.scope(), &config, None)
            .await
            .unwrap_err();
        match err {
            Html2DocxError::ConversionEngine(EngineError::CorruptOutput { magic }) => {
                assert_eq!(magic, b"<htm")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn engine_that_writes_nothing_is_empty_output() {
        struct Silent;

        #[async_trait]
        impl ConversionEngine for Silent {
            fn name(&self) -> &str {
                "silent"
            }
            async fn check_available(&self) -> Result<EngineInfo, EngineError> {
                unreachable!()
            }
            async fn convert(&self, _job: &EngineJob) -> Result<(), EngineError> {
                Ok(())
            }
        }

        let dir = TempDir::new().unwrap();
        let (config, manager, doc) = setup(&dir, 0);
        let err = run_engine(&Silent, &doc, &mut manager.scope(), &config, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Html2DocxError::ConversionEngine(EngineError::EmptyOutput)
        ));
    }
}
