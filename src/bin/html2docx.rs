//! CLI binary for edgequake-html2docx.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ConversionConfig` and writes the resulting documents.

use anyhow::{bail, Context, Result};
use clap::Parser;
use edgequake_html2docx::{
    check_engine, convert_stream, convert_to_file, ConversionConfig, ConversionProgressCallback,
    ConversionRequest, ConversionStats, Html2DocxError, ProgressCallback, Stage,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner that follows requests through their stages. With several inputs
/// in flight it shows the most recent transition and a done/total counter.
struct CliProgressCallback {
    bar: ProgressBar,
    total: usize,
    finished: AtomicUsize,
}

impl CliProgressCallback {
    fn new(total: usize) -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix(format!("0/{total}"));
        bar.set_message("Starting…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            total,
            finished: AtomicUsize::new(0),
        })
    }

    fn mark_finished(&self) {
        let done = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
        self.bar.set_prefix(format!("{done}/{}", self.total));
        if done == self.total {
            self.bar.finish_and_clear();
        }
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_stage(&self, request_id: Uuid, stage: Stage) {
        let msg = match stage {
            Stage::Received => "received",
            Stage::Validated => "rewriting math",
            Stage::Rewritten => "running pandoc",
            Stage::Converted => "collecting document",
            _ => return,
        };
        self.bar
            .set_message(format!("{} {}", dim(&short_id(request_id)), msg));
    }

    fn on_engine_attempt(&self, request_id: Uuid, attempt: u32, max_attempts: u32) {
        if attempt > 1 {
            self.bar.println(format!(
                "  {} {} pandoc retry {}/{}",
                red("↻"),
                dim(&short_id(request_id)),
                attempt - 1,
                max_attempts - 1
            ));
        }
    }

    fn on_conversion_complete(&self, _request_id: Uuid, _stats: &ConversionStats) {
        self.mark_finished();
    }

    fn on_conversion_failed(&self, _request_id: Uuid, _error: &Html2DocxError) {
        self.mark_finished();
    }
}

fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert one file (writes lesson.docx next to it)
  html2docx lesson.html

  # Choose the output path
  html2docx lesson.html -o /tmp/lesson.docx

  # Convert a folder's worth of files, four at a time
  html2docx chapters/*.html --out-dir build/ -c 4

  # Editor uses different marker classes
  html2docx --inline-class katex-inline --display-class katex-block page.html

  # Wrap stray \frac{..}{..} text that was never marked up
  html2docx --detect-bare-tex notes.html

  # Verify pandoc is installed (exit status 0 when usable)
  html2docx --check-engine

  # Machine-readable per-document statistics
  html2docx --json lesson.html

MATH MARKERS:
  <span class="math-tex">x^2</span>        →  \(x^2\)   inline equation
  <div class="math-display">E=mc^2</div>   →  \[E=mc^2\]  display equation
  Markers that are nested, unclosed or empty are left untouched and reported.

ENVIRONMENT VARIABLES:
  PANDOC_PATH              Path to a pandoc executable (skips PATH lookup)
  PANDOC_AUTO_CACHE_DIR    Override the pandoc download cache directory
  HTML2DOCX_*              Every flag below can also be set from the environment
  RUST_LOG                 Log filter, e.g. RUST_LOG=edgequake_html2docx=debug

SETUP:
  Install pandoc (https://pandoc.org/installing.html) or run
  `html2docx --install-pandoc` (requires the `download` feature).
"#;

/// Convert HTML files with TeX math markers to Word documents.
#[derive(Parser, Debug)]
#[command(
    name = "html2docx",
    version,
    about = "Convert HTML files with TeX math markers to Word (.docx) documents",
    long_about = "Convert HTML documents to Word (.docx) files. Formulas marked up by rich-text \
editors (e.g. <span class=\"math-tex\">) are rewritten into TeX delimiters so pandoc emits \
native Word equations; everything else in the document passes through untouched.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// HTML files to convert (.html or .htm).
    inputs: Vec<PathBuf>,

    /// Output file (single input only). Default: <input stem>.docx.
    #[arg(short, long, env = "HTML2DOCX_OUTPUT", conflicts_with = "out_dir")]
    output: Option<PathBuf>,

    /// Output directory for one or more inputs.
    #[arg(long, env = "HTML2DOCX_OUT_DIR")]
    out_dir: Option<PathBuf>,

    /// Explicit pandoc executable.
    #[arg(long, env = "HTML2DOCX_PANDOC")]
    pandoc: Option<PathBuf>,

    /// Engine timeout per document, in seconds.
    #[arg(long, env = "HTML2DOCX_TIMEOUT", default_value_t = 60,
          value_parser = clap::value_parser!(u64).range(1..))]
    timeout: u64,

    /// Largest accepted input, in bytes.
    #[arg(long, env = "HTML2DOCX_MAX_SIZE", default_value_t = 5 * 1024 * 1024)]
    max_size: usize,

    /// Directory for temporary artifacts. Default: $TMPDIR/html2docx.
    #[arg(long, env = "HTML2DOCX_TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    /// Class token marking inline math.
    #[arg(long, env = "HTML2DOCX_INLINE_CLASS", default_value = "math-tex")]
    inline_class: String,

    /// Class token marking display math; "none" disables display rewriting.
    #[arg(long, env = "HTML2DOCX_DISPLAY_CLASS", default_value = "math-display")]
    display_class: String,

    /// Wrap bare TeX (e.g. \frac{1}{2}) found in plain text.
    #[arg(long, env = "HTML2DOCX_DETECT_BARE_TEX")]
    detect_bare_tex: bool,

    /// Convert an HTML document pasted into the upload as escaped text.
    #[arg(long, env = "HTML2DOCX_EXTRACT_EMBEDDED")]
    extract_embedded: bool,

    /// Strip Word export wrappers and Mso* classes.
    #[arg(long, env = "HTML2DOCX_SIMPLIFY_WORD")]
    simplify_word: bool,

    /// Turn escaped tags such as &lt;p&gt; in text into markup.
    #[arg(long, env = "HTML2DOCX_PROMOTE_ESCAPED")]
    promote_escaped: bool,

    /// Remove <style> blocks and stray doctypes.
    #[arg(long, env = "HTML2DOCX_STRIP_BOILERPLATE")]
    strip_boilerplate: bool,

    /// Extra engine attempts after a non-zero exit.
    #[arg(long, env = "HTML2DOCX_RETRIES", default_value_t = 0)]
    retries: u32,

    /// Documents converted concurrently.
    #[arg(short, long, env = "HTML2DOCX_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Download pandoc if it is not installed (requires the `download` feature).
    #[arg(long, env = "HTML2DOCX_INSTALL_PANDOC")]
    install_pandoc: bool,

    /// Check that the engine is usable, print its version, and exit.
    #[arg(long)]
    check_engine: bool,

    /// Print per-document results as JSON lines on stdout.
    #[arg(long, env = "HTML2DOCX_JSON")]
    json: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "HTML2DOCX_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "HTML2DOCX_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner gives the interactive feedback; library INFO logs would
    // only tear it, so they are hidden unless asked for.
    let show_progress = !cli.quiet && !cli.json && !cli.verbose && !cli.check_engine;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Engine check ─────────────────────────────────────────────────────
    if cli.check_engine {
        let config = build_config(&cli, None)?;
        let info = check_engine(&config)
            .await
            .context("Conversion engine is not usable")?;
        if cli.json {
            println!("{}", serde_json::to_string(&info)?);
        } else {
            println!("{} {} {}", green("✔"), info.program, info.version);
        }
        return Ok(());
    }

    if cli.inputs.is_empty() {
        bail!("no input files given");
    }
    if cli.output.is_some() && cli.inputs.len() > 1 {
        bail!("-o/--output takes a single input; use --out-dir for several");
    }

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new(cli.inputs.len()) as Arc<dyn ConversionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress)?;

    // ── Single input ─────────────────────────────────────────────────────
    if cli.inputs.len() == 1 && cli.out_dir.is_none() {
        let input = &cli.inputs[0];
        let request = read_request(input).await?;
        let target = cli
            .output
            .clone()
            .unwrap_or_else(|| input.with_extension("docx"));
        let stats = convert_to_file(request, &target, &config)
            .await
            .with_context(|| format!("Failed to convert {}", input.display()))?;
        report(&cli, input, Ok((target.as_path(), &stats)))?;
        return Ok(());
    }

    // ── Batch ────────────────────────────────────────────────────────────
    let out_dir = cli.out_dir.clone().unwrap_or_else(|| PathBuf::from("."));
    tokio::fs::create_dir_all(&out_dir)
        .await
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let mut requests = Vec::with_capacity(cli.inputs.len());
    for input in &cli.inputs {
        requests.push(read_request(input).await?);
    }

    let mut failures = 0usize;
    let mut results = convert_stream(requests, &config);
    while let Some(item) = results.next().await {
        let input = &cli.inputs[item.index];
        match item.result {
            Ok(output) => {
                let target = out_dir.join(&output.filename);
                tokio::fs::write(&target, &output.document)
                    .await
                    .with_context(|| format!("Failed to write {}", target.display()))?;
                report(&cli, input, Ok((target.as_path(), &output.stats)))?;
            }
            Err(e) => {
                failures += 1;
                report(&cli, input, Err(&e))?;
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {} documents failed", cli.inputs.len());
    }
    Ok(())
}

/// Map CLI args to `ConversionConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ConversionConfig> {
    let display_class = match cli.display_class.as_str() {
        "none" | "" => None,
        class => Some(class.to_string()),
    };

    let mut builder = ConversionConfig::builder()
        .max_input_bytes(cli.max_size)
        .engine_timeout_secs(cli.timeout)
        .engine_max_retries(cli.retries)
        .inline_math_class(cli.inline_class.clone())
        .display_math_class(display_class)
        .detect_bare_tex(cli.detect_bare_tex)
        .extract_embedded_html(cli.extract_embedded)
        .simplify_word_export(cli.simplify_word)
        .promote_escaped_tags(cli.promote_escaped)
        .strip_boilerplate(cli.strip_boilerplate)
        .concurrency(cli.concurrency)
        .auto_install_engine(cli.install_pandoc);

    if let Some(ref path) = cli.pandoc {
        builder = builder.pandoc_path(path);
    }
    if let Some(ref dir) = cli.temp_dir {
        builder = builder.temp_root(dir);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

async fn read_request(path: &Path) -> Result<ConversionRequest> {
    ConversionRequest::from_path(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

/// One line per document: human-readable on stderr, or JSON on stdout.
fn report(
    cli: &Cli,
    input: &Path,
    outcome: std::result::Result<(&Path, &ConversionStats), &Html2DocxError>,
) -> Result<()> {
    if cli.json {
        let line = match outcome {
            Ok((target, stats)) => serde_json::json!({
                "input": input,
                "output": target,
                "stats": stats,
            }),
            Err(e) => serde_json::json!({
                "input": input,
                "error": e.public_message(),
                "class": e.class(),
            }),
        };
        println!("{}", serde_json::to_string(&line)?);
        return Ok(());
    }
    if cli.quiet {
        if let Err(e) = outcome {
            eprintln!("{} {}: {e}", red("✘"), input.display());
        }
        return Ok(());
    }

    match outcome {
        Ok((target, stats)) => {
            let skipped = stats.rewrite.skipped.len();
            eprintln!(
                "{} {}  →  {}  {}",
                green("✔"),
                input.display(),
                bold(&target.display().to_string()),
                dim(&format!(
                    "{} math, {} skipped, {} bytes, {}ms",
                    stats.rewrite.rewrites() + stats.rewrite.bare_tex_wraps,
                    skipped,
                    stats.output_bytes,
                    stats.total_ms
                )),
            );
            for span in &stats.rewrite.skipped {
                eprintln!(
                    "    {} {:?} marker at byte {} left as-is ({:?})",
                    dim("·"),
                    span.kind,
                    span.offset,
                    span.reason
                );
            }
        }
        Err(e) => eprintln!("{} {}: {e}", red("✘"), input.display()),
    }
    Ok(())
}
