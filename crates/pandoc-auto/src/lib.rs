//! # pandoc-auto
//!
//! Locate a [pandoc](https://pandoc.org) executable, and optionally download
//! and cache a pinned release, so that callers of a pandoc-driven converter
//! never have to hard-code `/usr/bin/pandoc` or ask users to edit `PATH`.
//!
//! ## How it works
//!
//! On a call to [`locate_pandoc`] or [`ensure_pandoc`]:
//!
//! 1. `PANDOC_PATH` — an explicit path to an existing pandoc binary wins.
//! 2. `PATH` — the first `pandoc` found by a `which`-style search.
//! 3. Cache — `~/.cache/html2docx/pandoc-{VERSION}/pandoc` from an earlier
//!    download.
//! 4. *(feature `download`, [`ensure_pandoc`] only)* — fetch the release
//!    tarball from [jgm/pandoc](https://github.com/jgm/pandoc/releases),
//!    extract `bin/pandoc` into the cache directory and use it.
//!
//! Subsequent calls in the same process return the resolved path instantly.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pandoc_auto::{ensure_pandoc, locate_pandoc};
//!
//! // Option A: only use what is already installed
//! if let Some(path) = locate_pandoc() {
//!     println!("pandoc at {}", path.display());
//! }
//!
//! // Option B: install on first use (download requires the `download` feature)
//! let path = ensure_pandoc(Some(&|downloaded, total| {
//!     if let Some(t) = total {
//!         eprint!("\rDownloading pandoc: {}/{} bytes", downloaded, t);
//!     }
//! })).expect("pandoc unavailable");
//! ```
//!
//! ## Download platform support
//!
//! | OS    | Arch    | Release asset                          |
//! |-------|---------|----------------------------------------|
//! | Linux | x86_64  | `pandoc-{VERSION}-linux-amd64.tar.gz`  |
//! | Linux | aarch64 | `pandoc-{VERSION}-linux-arm64.tar.gz`  |
//!
//! macOS and Windows releases ship as installers or zip files; on those
//! platforms install pandoc with the system package manager and it will be
//! found on `PATH`.
//!
//! ## Environment variable overrides
//!
//! - `PANDOC_PATH` — path to an existing pandoc executable.
//! - `PANDOC_AUTO_CACHE_DIR` — override the default cache directory.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use thiserror::Error;

// ── Public constants ─────────────────────────────────────────────────────────

/// The pandoc release used for downloads.
pub const PANDOC_VERSION: &str = "3.5";

/// GitHub release base URL.
#[cfg_attr(not(feature = "download"), allow(dead_code))]
const BASE_URL: &str = "https://github.com/jgm/pandoc/releases/download";

// ── Error type ───────────────────────────────────────────────────────────────

/// Errors returned by pandoc-auto operations.
#[derive(Error, Debug)]
pub enum PandocAutoError {
    /// No pandoc binary was found and downloading is not possible.
    #[error("pandoc not found (searched PANDOC_PATH, PATH and {cache})")]
    NotFound { cache: PathBuf },

    /// The current OS/architecture combination has no downloadable release.
    #[error("No downloadable pandoc release for platform: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    /// Could not create or navigate the local cache directory.
    #[error("Cache directory error: {0}")]
    CacheDir(#[source] std::io::Error),

    /// Network download failed.
    #[error("Download failed: {0}")]
    Download(String),

    /// gzip/tar extraction failed.
    #[error("Archive extraction failed: {0}")]
    Extract(String),
}

// ── Internal: platform metadata ──────────────────────────────────────────────

#[cfg_attr(not(feature = "download"), allow(dead_code))]
struct PlatformInfo {
    /// Asset suffix in the GitHub release, e.g. `linux-amd64.tar.gz`.
    archive_suffix: &'static str,
    /// Filename written on disk.
    exe_name: &'static str,
}

#[cfg_attr(not(feature = "download"), allow(dead_code))]
impl PlatformInfo {
    fn archive_name(&self) -> String {
        format!("pandoc-{PANDOC_VERSION}-{}", self.archive_suffix)
    }

    /// Relative path inside the archive, e.g. `pandoc-3.5/bin/pandoc`.
    fn exe_path_in_archive(&self) -> String {
        format!("pandoc-{PANDOC_VERSION}/bin/{}", self.exe_name)
    }
}

#[cfg_attr(not(feature = "download"), allow(dead_code))]
fn detect_platform() -> Result<PlatformInfo, PandocAutoError> {
    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;

    match (os, arch) {
        ("linux", "x86_64") => Ok(PlatformInfo {
            archive_suffix: "linux-amd64.tar.gz",
            exe_name: "pandoc",
        }),
        ("linux", "aarch64") => Ok(PlatformInfo {
            archive_suffix: "linux-arm64.tar.gz",
            exe_name: "pandoc",
        }),
        (os, arch) => Err(PandocAutoError::UnsupportedPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
        }),
    }
}

fn cached_exe_name() -> &'static str {
    if cfg!(windows) {
        "pandoc.exe"
    } else {
        "pandoc"
    }
}

// ── Cache directory resolution ───────────────────────────────────────────────

/// Returns the per-version cache directory for a downloaded pandoc.
///
/// Default locations:
/// - **Linux**: `~/.cache/html2docx/pandoc-{VERSION}/`
/// - **macOS**: `~/Library/Caches/html2docx/pandoc-{VERSION}/`
/// - **Windows**: `%LOCALAPPDATA%\html2docx\pandoc-{VERSION}\`
///
/// Override by setting `PANDOC_AUTO_CACHE_DIR`.
pub fn pandoc_cache_dir() -> PathBuf {
    if let Ok(override_dir) = std::env::var("PANDOC_AUTO_CACHE_DIR") {
        return PathBuf::from(override_dir).join(format!("pandoc-{PANDOC_VERSION}"));
    }

    let base = dirs::cache_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".cache")))
        .unwrap_or_else(std::env::temp_dir);

    base.join("html2docx").join(format!("pandoc-{PANDOC_VERSION}"))
}

// ── Thread-safe singleton path cache ─────────────────────────────────────────

static RESOLVED_PATH: OnceLock<PathBuf> = OnceLock::new();

// ── Public API ───────────────────────────────────────────────────────────────

/// Returns the path of an already-installed pandoc, or `None`.
///
/// Never touches the network. Lookup order: `PANDOC_PATH`, `PATH`, cache.
pub fn locate_pandoc() -> Option<PathBuf> {
    if let Some(path) = RESOLVED_PATH.get() {
        return Some(path.clone());
    }

    if let Ok(p) = std::env::var("PANDOC_PATH") {
        let pb = PathBuf::from(p);
        if pb.is_file() {
            return Some(pb);
        }
    }

    if let Ok(found) = which::which("pandoc") {
        return Some(found);
    }

    let cached = pandoc_cache_dir().join(cached_exe_name());
    if cached.is_file() {
        return Some(cached);
    }

    None
}

/// Returns `true` if a downloaded pandoc is present in the cache directory.
pub fn is_pandoc_cached() -> bool {
    pandoc_cache_dir().join(cached_exe_name()).is_file()
}

/// Ensures a pandoc executable is available and returns its path.
///
/// Resolves through [`locate_pandoc`] first. With the `download` feature
/// enabled a missing pandoc is fetched into [`pandoc_cache_dir`]; without it
/// a missing pandoc is reported as [`PandocAutoError::NotFound`].
///
/// `on_progress` receives `(bytes_downloaded, total_size_option)` during
/// the download. Pass `None` to suppress progress callbacks.
///
/// # Thread safety
///
/// Safe to call from multiple threads simultaneously; the resolved path is
/// memoised for the process lifetime.
pub fn ensure_pandoc(
    on_progress: Option<&dyn Fn(u64, Option<u64>)>,
) -> Result<PathBuf, PandocAutoError> {
    // Fast path: already resolved in this process.
    if let Some(path) = RESOLVED_PATH.get() {
        return Ok(path.clone());
    }

    let path = match locate_pandoc() {
        Some(path) => path,
        None => install(on_progress)?,
    };

    // Best-effort cache in the OnceLock (ignore race; both will succeed).
    let _ = RESOLVED_PATH.set(path.clone());

    Ok(path)
}

// ── Internal helpers ─────────────────────────────────────────────────────────

#[cfg(not(feature = "download"))]
fn install(_on_progress: Option<&dyn Fn(u64, Option<u64>)>) -> Result<PathBuf, PandocAutoError> {
    Err(PandocAutoError::NotFound {
        cache: pandoc_cache_dir(),
    })
}

#[cfg(feature = "download")]
fn install(on_progress: Option<&dyn Fn(u64, Option<u64>)>) -> Result<PathBuf, PandocAutoError> {
    let info = detect_platform()?;
    let cache_dir = pandoc_cache_dir();
    let exe_path = cache_dir.join(cached_exe_name());

    let url = format!(
        "{}/{}/{}",
        BASE_URL,
        PANDOC_VERSION,
        info.archive_name()
    );

    std::fs::create_dir_all(&cache_dir).map_err(PandocAutoError::CacheDir)?;

    let archive_bytes = download_bytes(&url, on_progress)?;
    extract_executable(&archive_bytes, &info.exe_path_in_archive(), &exe_path)?;

    Ok(exe_path)
}

/// Streams a URL into a `Vec<u8>`, calling `on_progress` every 64 KiB.
#[cfg(feature = "download")]
fn download_bytes(
    url: &str,
    on_progress: Option<&dyn Fn(u64, Option<u64>)>,
) -> Result<Vec<u8>, PandocAutoError> {
    use std::io::Read;

    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("pandoc-auto/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(|e| PandocAutoError::Download(e.to_string()))?;

    let response = client
        .get(url)
        .send()
        .map_err(|e| PandocAutoError::Download(format!("GET {url}: {e}")))?;

    if !response.status().is_success() {
        return Err(PandocAutoError::Download(format!(
            "HTTP {} for {url}",
            response.status()
        )));
    }

    let total = response.content_length();
    let capacity = total.unwrap_or(40 * 1024 * 1024) as usize;
    let mut buf = Vec::with_capacity(capacity);

    let mut stream = response;
    let mut chunk = vec![0u8; 64 * 1024]; // 64 KiB
    let mut downloaded: u64 = 0;

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                downloaded += n as u64;
                if let Some(cb) = on_progress {
                    cb(downloaded, total);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(PandocAutoError::Download(format!("Read error: {e}")));
            }
        }
    }

    Ok(buf)
}

/// Extracts a single file from a gzipped tar archive into `dest_path` and
/// marks it executable.
#[cfg(feature = "download")]
fn extract_executable(
    archive_bytes: &[u8],
    path_in_archive: &str,
    dest_path: &Path,
) -> Result<(), PandocAutoError> {
    use flate2::read::GzDecoder;
    use tar::Archive;

    let gz = GzDecoder::new(archive_bytes);
    let mut archive = Archive::new(gz);

    for entry in archive
        .entries()
        .map_err(|e| PandocAutoError::Extract(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| PandocAutoError::Extract(e.to_string()))?;
        let entry_path = entry
            .path()
            .map_err(|e| PandocAutoError::Extract(e.to_string()))?;

        if entry_path.to_string_lossy() == path_in_archive {
            entry
                .unpack(dest_path)
                .map_err(|e| PandocAutoError::Extract(format!("Unpack failed: {e}")))?;
            mark_executable(dest_path)?;
            return Ok(());
        }
    }

    Err(PandocAutoError::Extract(format!(
        "Executable '{}' not found in archive",
        path_in_archive
    )))
}

#[cfg(all(feature = "download", unix))]
fn mark_executable(path: &Path) -> Result<(), PandocAutoError> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| PandocAutoError::Extract(format!("chmod failed: {e}")))
}

#[cfg(all(feature = "download", not(unix)))]
fn mark_executable(_path: &Path) -> Result<(), PandocAutoError> {
    Ok(())
}

/// Returns `true` when `path` names an existing regular file.
///
/// Used by callers that accept a user-supplied pandoc path and want to fail
/// early with a clear message instead of at spawn time.
pub fn is_executable_file(path: &Path) -> bool {
    match std::fs::metadata(path) {
        #[cfg(unix)]
        Ok(meta) => {
            use std::os::unix::fs::PermissionsExt;
            meta.is_file() && meta.permissions().mode() & 0o111 != 0
        }
        #[cfg(not(unix))]
        Ok(meta) => meta.is_file(),
        Err(_) => false,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
