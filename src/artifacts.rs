//! Temporary files for one conversion, and their cleanup.
//!
//! pandoc reads and writes files, so every request needs an input `.html`
//! and an output `.docx` on disk. These live flat in one root directory and
//! are named after the request id:
//!
//! ```text
//! <temp_root>/html2docx-<uuid>-input.html
//! <temp_root>/html2docx-<uuid>-output.docx
//! ```
//!
//! Each file is owned by a [`TempArtifact`] which deletes it exactly once:
//! on [`TempArtifact::release`], on drop, or via the sweeper, whichever comes
//! first. A file that is already gone counts as released.
//!
//! The sweeper catches what ownership cannot: outputs held for deferred
//! delivery by clients that never finish reading, and leftovers from a
//! process that was killed. It only touches names that match the scheme
//! above, only once they are older than the retention window, and never the
//! files of a request whose [`ArtifactScope`] is still alive in this process.

use crate::config::ConversionConfig;
use crate::error::ResourceError;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Every artifact name starts with this.
pub const ARTIFACT_PREFIX: &str = "html2docx-";

/// Per-root state shared by every manager of that root in this process, so
/// `sweep_if_due` is rate-limited globally and sweeps see every live request.
static ROOTS: Lazy<Mutex<HashMap<PathBuf, Arc<RootState>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Default)]
struct RootState {
    last_sweep_ms: AtomicU64,
    /// Request ids with a live scope, and how many scopes hold each.
    live: Mutex<HashMap<Uuid, usize>>,
}

impl RootState {
    fn enter(&self, request_id: Uuid) {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        *live.entry(request_id).or_default() += 1;
    }

    fn leave(&self, request_id: Uuid) {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = live.get_mut(&request_id) {
            *count -= 1;
            if *count == 0 {
                live.remove(&request_id);
            }
        }
    }

    fn live_ids(&self) -> HashSet<Uuid> {
        let live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        live.keys().copied().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Input,
    Output,
}

impl ArtifactKind {
    fn suffix(self) -> &'static str {
        match self {
            ArtifactKind::Input => "-input.html",
            ArtifactKind::Output => "-output.docx",
        }
    }

    fn file_name(self, request_id: Uuid) -> String {
        format!("{ARTIFACT_PREFIX}{request_id}{}", self.suffix())
    }
}

/// One temporary file, deleted exactly once.
#[derive(Debug)]
pub struct TempArtifact {
    path: PathBuf,
    kind: ArtifactKind,
    created_at: SystemTime,
    released: bool,
}

impl TempArtifact {
    fn new(path: PathBuf, kind: ArtifactKind) -> Self {
        Self {
            path,
            kind,
            created_at: SystemTime::now(),
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Delete the file. Later calls, and a file that is already gone, are
    /// no-ops. A failed delete is not retried; the sweeper picks it up.
    pub fn release(&mut self) -> Result<(), ResourceError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), kind = ?self.kind, "Released artifact");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ResourceError::Release {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("{e}");
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub scanned: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Owns the temporary root and its retention policy.
///
/// Cheap to clone; clones share the sweep clock and the live-request set.
#[derive(Debug, Clone)]
pub struct ArtifactManager {
    root: PathBuf,
    retention: Duration,
    sweep_interval: Duration,
    state: Arc<RootState>,
}

impl ArtifactManager {
    pub fn new(root: impl Into<PathBuf>, retention: Duration, sweep_interval: Duration) -> Self {
        let root = root.into();
        let state = {
            let mut roots = ROOTS.lock().unwrap_or_else(|e| e.into_inner());
            roots.entry(root.clone()).or_default().clone()
        };
        Self {
            root,
            retention,
            sweep_interval,
            state,
        }
    }

    pub fn from_config(config: &ConversionConfig) -> Self {
        Self::new(
            config.temp_root.clone(),
            config.retention(),
            config.sweep_interval(),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// A new scope with a fresh request id. Allocates nothing on disk.
    pub fn scope(&self) -> ArtifactScope {
        self.scope_with_id(Uuid::new_v4())
    }

    /// A scope for `request_id`. Its files are exempt from sweeps until the
    /// scope is dropped.
    pub fn scope_with_id(&self, request_id: Uuid) -> ArtifactScope {
        self.state.enter(request_id);
        ArtifactScope {
            root: self.root.clone(),
            request_id,
            state: self.state.clone(),
            input: None,
            output: None,
        }
    }

    /// `true` while a scope for `request_id` exists in this process.
    pub fn is_live(&self, request_id: Uuid) -> bool {
        self.state.live_ids().contains(&request_id)
    }

    /// Delete artifacts in the root older than the retention window.
    ///
    /// Files of requests that are still in flight are skipped whatever their
    /// age. A missing root is an empty sweep. Individual delete failures are
    /// logged and counted, not returned.
    pub async fn sweep(&self) -> Result<SweepStats, ResourceError> {
        self.sweep_older_than(self.retention).await
    }

    async fn sweep_older_than(&self, max_age: Duration) -> Result<SweepStats, ResourceError> {
        self.state.last_sweep_ms.store(now_ms(), Ordering::Relaxed);
        let mut stats = SweepStats::default();

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(stats),
            Err(source) => {
                return Err(ResourceError::Sweep {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        let now = SystemTime::now();
        let live = self.state.live_ids();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(ResourceError::Sweep {
                        path: self.root.clone(),
                        source,
                    })
                }
            };
            let name = entry.file_name();
            let Some(request_id) = name.to_str().and_then(artifact_request_id) else {
                continue;
            };
            stats.scanned += 1;
            if live.contains(&request_id) {
                continue;
            }

            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(_) => continue,
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age < max_age {
                continue;
            }

            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => stats.removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    stats.failed += 1;
                    warn!(path = %entry.path().display(), "Sweep could not delete artifact: {e}");
                }
            }
        }

        if stats.removed > 0 || stats.failed > 0 {
            info!(
                root = %self.root.display(),
                removed = stats.removed,
                failed = stats.failed,
                "Swept expired artifacts"
            );
        }
        Ok(stats)
    }

    /// Run [`sweep`](Self::sweep) unless one ran within the sweep interval.
    /// Returns `None` when skipped. Meant to be called after each request.
    pub async fn sweep_if_due(&self) -> Option<SweepStats> {
        let now = now_ms();
        let last = self.state.last_sweep_ms.load(Ordering::Relaxed);
        let interval = self.sweep_interval.as_millis() as u64;
        if last != 0 && now.saturating_sub(last) < interval {
            return None;
        }
        // Only the caller that moves the clock runs the sweep.
        if self
            .state
            .last_sweep_ms
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        match self.sweep().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("{e}");
                None
            }
        }
    }

    /// Sweep every `sweep_interval` on a background task until aborted.
    /// Must be called from within a tokio runtime.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = manager.sweep().await {
                    warn!("{e}");
                }
            }
        })
    }

    /// Delete every artifact of a finished request regardless of age. For
    /// shutdown and tests.
    pub async fn purge(&self) -> Result<SweepStats, ResourceError> {
        self.sweep_older_than(Duration::ZERO).await
    }
}

/// The artifacts of a single request.
///
/// Dropping the scope releases whatever it still owns, which covers early
/// returns, panics and a cancelled future alike.
#[derive(Debug)]
pub struct ArtifactScope {
    root: PathBuf,
    request_id: Uuid,
    state: Arc<RootState>,
    input: Option<TempArtifact>,
    output: Option<TempArtifact>,
}

impl Drop for ArtifactScope {
    fn drop(&mut self) {
        self.state.leave(self.request_id);
    }
}

impl ArtifactScope {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn input_path(&self) -> Option<&Path> {
        self.input.as_ref().map(TempArtifact::path)
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output.as_ref().map(TempArtifact::path)
    }

    async fn ensure_root(&self) -> Result<(), ResourceError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| ResourceError::CreateRoot {
                path: self.root.clone(),
                source,
            })
    }

    /// Write the engine input. Fails with `Collision` if the file exists.
    pub async fn create_input(&mut self, html: &str) -> Result<PathBuf, ResourceError> {
        self.ensure_root().await?;
        let path = self.root.join(ArtifactKind::Input.file_name(self.request_id));

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|source| match source.kind() {
                ErrorKind::AlreadyExists => ResourceError::Collision { path: path.clone() },
                _ => ResourceError::Write {
                    path: path.clone(),
                    source,
                },
            })?;
        // Owned from here on, so a failed write is still cleaned up.
        self.input = Some(TempArtifact::new(path.clone(), ArtifactKind::Input));

        let write_err = |source: std::io::Error| ResourceError::Write {
            path: path.clone(),
            source,
        };
        file.write_all(html.as_bytes()).await.map_err(write_err)?;
        file.flush().await.map_err(write_err)?;
        debug!(path = %path.display(), bytes = html.len(), "Wrote input artifact");
        Ok(path)
    }

    /// Claim the output path. The engine creates the file.
    pub async fn reserve_output(&mut self) -> Result<PathBuf, ResourceError> {
        self.ensure_root().await?;
        let path = self.root.join(ArtifactKind::Output.file_name(self.request_id));
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(ResourceError::Collision { path });
        }
        self.output = Some(TempArtifact::new(path.clone(), ArtifactKind::Output));
        Ok(path)
    }

    /// Release input and output. Both are attempted; the first failure is
    /// returned and any further one is logged.
    pub fn release_all(&mut self) -> Result<(), ResourceError> {
        let mut first_err = None;
        for artifact in [self.input.as_mut(), self.output.as_mut()].into_iter().flatten() {
            if let Err(e) = artifact.release() {
                if first_err.is_none() {
                    first_err = Some(e);
                } else {
                    warn!("{e}");
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Take the output out of the scope so it outlives the request.
    ///
    /// The caller becomes responsible for releasing it; the sweeper is the
    /// backstop if it never does.
    pub fn detach_output(&mut self) -> Option<TempArtifact> {
        self.output.take()
    }
}

/// The request id encoded in an artifact file name.
fn artifact_request_id(name: &str) -> Option<Uuid> {
    let rest = name.strip_prefix(ARTIFACT_PREFIX)?;
    let id = rest
        .strip_suffix(ArtifactKind::Input.suffix())
        .or_else(|| rest.strip_suffix(ArtifactKind::Output.suffix()))?;
    Uuid::parse_str(id).ok()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
