//! Directory watcher with debounced stability gating.

use crate::error::{Result, WatchError};
use dashmap::DashMap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Watcher tuning knobs.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// File extensions considered eligible (without the dot).
    pub extensions: Vec<String>,
    /// How long a file must sit still before the first identity check.
    pub stability_wait: Duration,
    /// Delay before the confirming second read.
    pub confirm_delay: Duration,
    /// Interval of the full rescan that catches missed events.
    pub rescan_interval: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            extensions: vec!["gpk".to_string()],
            stability_wait: Duration::from_millis(500),
            confirm_delay: Duration::from_millis(200),
            rescan_interval: Duration::from_secs(30),
        }
    }
}

impl WatchOptions {
    /// Replace the eligible extension set.
    #[must_use]
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Set the stability wait.
    #[must_use]
    pub const fn with_stability_wait(mut self, wait: Duration) -> Self {
        self.stability_wait = wait;
        self
    }

    /// Set the confirm delay.
    #[must_use]
    pub const fn with_confirm_delay(mut self, delay: Duration) -> Self {
        self.confirm_delay = delay;
        self
    }

    /// Set the rescan interval.
    #[must_use]
    pub const fn with_rescan_interval(mut self, interval: Duration) -> Self {
        self.rescan_interval = interval;
        self
    }
}

/// A stable change observed by the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The file settled at a new identity.
    Changed(PathBuf),
    /// The file disappeared.
    Removed(PathBuf),
}

/// Change callback.
pub type WatchCallback = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// Watcher counters for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct WatcherStats {
    /// Files with a recorded identity.
    pub tracked: usize,
    /// Stability checks currently pending.
    pub pending: usize,
    /// Callbacks delivered so far.
    pub delivered: u64,
}

/// Lightweight file identity used for change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    size: u64,
    mtime_millis: u64,
}

fn read_identity(path: &Path) -> Option<FileIdentity> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime_millis = meta
        .modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    Some(FileIdentity {
        size: meta.len(),
        mtime_millis,
    })
}

struct PendingCheck {
    seq: u64,
    token: CancellationToken,
}

struct WatcherInner {
    dir: PathBuf,
    options: WatchOptions,
    callback: WatchCallback,
    known: DashMap<PathBuf, FileIdentity>,
    pending: DashMap<PathBuf, PendingCheck>,
    seq: AtomicU64,
    delivered: AtomicU64,
    shutdown: CancellationToken,
}

impl WatcherInner {
    fn eligible(&self, path: &Path) -> bool {
        path.extension().is_some_and(|ext| {
            self.options
                .extensions
                .iter()
                .any(|e| ext.eq_ignore_ascii_case(e.as_str()))
        })
    }

    fn list_eligible(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && self.eligible(p))
            .collect()
    }

    fn deliver(&self, event: WatchEvent) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        (self.callback)(event);
    }

    /// Clear state for a vanished file. Deletions are not debounced.
    fn removal(&self, path: &Path) {
        if let Some((_, check)) = self.pending.remove(path) {
            check.token.cancel();
        }
        if self.known.remove(path).is_some() {
            debug!(path = %path.display(), "watched file removed");
            self.deliver(WatchEvent::Removed(path.to_path_buf()));
        }
    }
}

/// Arm (or re-arm) the stability check for a path.
///
/// Cancel-and-replace is atomic per path: the insert into the pending
/// map happens under the map's key guard, and the previous check's
/// token is cancelled as it is displaced.
fn arm(inner: &Arc<WatcherInner>, path: PathBuf) {
    let token = inner.shutdown.child_token();
    let seq = inner.seq.fetch_add(1, Ordering::Relaxed);
    if let Some(previous) = inner.pending.insert(
        path.clone(),
        PendingCheck {
            seq,
            token: token.clone(),
        },
    ) {
        previous.token.cancel();
    }
    let inner = Arc::clone(inner);
    tokio::spawn(stability_check(inner, path, token, seq));
}

async fn stability_check(
    inner: Arc<WatcherInner>,
    path: PathBuf,
    token: CancellationToken,
    seq: u64,
) {
    tokio::select! {
        () = token.cancelled() => return,
        () = tokio::time::sleep(inner.options.stability_wait) => {}
    }

    let Some(current) = read_identity(&path) else {
        inner.pending.remove_if(&path, |_, check| check.seq == seq);
        inner.removal(&path);
        return;
    };

    // No drift versus the recorded identity: spurious event, drop.
    if inner.known.get(&path).is_some_and(|known| *known == current) {
        inner.pending.remove_if(&path, |_, check| check.seq == seq);
        return;
    }

    tokio::select! {
        () = token.cancelled() => return,
        () = tokio::time::sleep(inner.options.confirm_delay) => {}
    }

    if read_identity(&path) != Some(current) {
        // Still being written; start over.
        trace!(path = %path.display(), "file still changing, re-arming");
        if !token.is_cancelled() {
            arm(&inner, path);
        }
        return;
    }

    inner.known.insert(path.clone(), current);
    inner.pending.remove_if(&path, |_, check| check.seq == seq);
    debug!(path = %path.display(), size = current.size, "stable change detected");
    inner.deliver(WatchEvent::Changed(path));
}

/// Directory watcher handle. Dropping it (or calling
/// [`shutdown`](FileWatcher::shutdown)) stops all background work.
pub struct FileWatcher {
    inner: Arc<WatcherInner>,
    backend: Mutex<Option<RecommendedWatcher>>,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher")
            .field("dir", &self.inner.dir)
            .field("tracked", &self.inner.known.len())
            .finish()
    }
}

impl FileWatcher {
    /// Start watching `dir`. Must be called from within a Tokio runtime.
    ///
    /// Existing eligible files are recorded silently; only subsequent
    /// changes fire the callback.
    pub fn start(dir: impl Into<PathBuf>, options: WatchOptions, callback: WatchCallback) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| WatchError::Io {
            path: dir.clone(),
            source: e,
        })?;

        let inner = Arc::new(WatcherInner {
            dir: dir.clone(),
            options,
            callback,
            known: DashMap::new(),
            pending: DashMap::new(),
            seq: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        for path in inner.list_eligible() {
            if let Some(identity) = read_identity(&path) {
                inner.known.insert(path, identity);
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut backend = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => warn!(error = %e, "filesystem watch error"),
            }
        })?;
        backend.watch(&dir, RecursiveMode::NonRecursive)?;

        tokio::spawn(event_loop(Arc::clone(&inner), rx));
        tokio::spawn(rescan_loop(Arc::clone(&inner)));

        debug!(dir = %dir.display(), tracked = inner.known.len(), "file watcher started");
        Ok(Self {
            inner,
            backend: Mutex::new(Some(backend)),
        })
    }

    /// Watcher counters.
    #[must_use]
    pub fn stats(&self) -> WatcherStats {
        WatcherStats {
            tracked: self.inner.known.len(),
            pending: self.inner.pending.len(),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
        }
    }

    /// Stop watching and cancel pending stability checks.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.backend.lock().take();
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn event_loop(
    inner: Arc<WatcherInner>,
    mut rx: mpsc::UnboundedReceiver<notify::Event>,
) {
    loop {
        let event = tokio::select! {
            () = inner.shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        if event.kind.is_access() {
            continue;
        }
        for path in event.paths {
            if !inner.eligible(&path) {
                continue;
            }
            if event.kind.is_remove() || !path.exists() {
                inner.removal(&path);
            } else {
                arm(&inner, path);
            }
        }
    }
}

/// Periodic full rescan: catches renames and kernel-buffer overflows the
/// event channel missed.
async fn rescan_loop(inner: Arc<WatcherInner>) {
    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            () = tokio::time::sleep(inner.options.rescan_interval) => {}
        }

        let present = inner.list_eligible();
        let missing: Vec<PathBuf> = inner
            .known
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|known| !present.contains(known))
            .collect();
        for path in missing {
            inner.removal(&path);
        }

        for path in present {
            let drifted = match (read_identity(&path), inner.known.get(&path)) {
                (Some(current), Some(known)) => current != *known,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if drifted {
                trace!(path = %path.display(), "rescan found drift");
                arm(&inner, path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    fn fast_options() -> WatchOptions {
        WatchOptions::default()
            .with_stability_wait(Duration::from_millis(80))
            .with_confirm_delay(Duration::from_millis(40))
            .with_rescan_interval(Duration::from_secs(60))
    }

    fn collector() -> (WatchCallback, Arc<StdMutex<Vec<WatchEvent>>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: WatchCallback = Arc::new(move |event| sink.lock().unwrap().push(event));
        (callback, events)
    }

    #[test]
    fn identity_tracks_size_and_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.gpk");
        std::fs::write(&path, b"one").unwrap();
        let first = read_identity(&path).unwrap();
        assert_eq!(first.size, 3);
        std::fs::write(&path, b"three!").unwrap();
        let second = read_identity(&path).unwrap();
        assert_ne!(first, second);
        assert!(read_identity(&dir.path().join("absent")).is_none());
    }

    #[tokio::test]
    async fn single_callback_per_stable_change() {
        let dir = TempDir::new().unwrap();
        let (callback, events) = collector();
        let watcher = FileWatcher::start(dir.path(), fast_options(), callback).unwrap();

        let path = dir.path().join("p.gpk");
        // Three write bursts, then quiet.
        for chunk in [&b"aa"[..], &b"bbbb"[..], &b"cccccc"[..]] {
            std::fs::write(&path, chunk).unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        let seen = events.lock().unwrap().clone();
        assert_eq!(seen, vec![WatchEvent::Changed(path.clone())]);
        watcher.shutdown();
    }

    #[tokio::test]
    async fn ignores_ineligible_extensions() {
        let dir = TempDir::new().unwrap();
        let (callback, events) = collector();
        let watcher = FileWatcher::start(dir.path(), fast_options(), callback).unwrap();

        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(events.lock().unwrap().is_empty());
        watcher.shutdown();
    }

    #[tokio::test]
    async fn removal_fires_undebounced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.gpk");
        std::fs::write(&path, b"payload").unwrap();

        let (callback, events) = collector();
        let watcher = FileWatcher::start(dir.path(), fast_options(), callback).unwrap();
        assert_eq!(watcher.stats().tracked, 1);

        std::fs::remove_file(&path).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let seen = events.lock().unwrap().clone();
        assert_eq!(seen, vec![WatchEvent::Removed(path)]);
        assert_eq!(watcher.stats().tracked, 0);
        watcher.shutdown();
    }

    #[tokio::test]
    async fn preexisting_files_do_not_fire() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("old.gpk"), b"old").unwrap();

        let (callback, events) = collector();
        let watcher = FileWatcher::start(dir.path(), fast_options(), callback).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(events.lock().unwrap().is_empty());
        watcher.shutdown();
    }
}
