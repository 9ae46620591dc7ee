//! Directory Cache
//!
//! Bounded map from physical path to [`MuxDirectory`], with aggregate
//! counters fed by directory events.
//!
//! ## Architecture
//! ```text
//!   get_writeable_instance(path)
//!            │
//!            ▼
//!   ┌──────────────────────────────┐     events      ┌──────────────────┐
//!   │ dirs: path → MuxDirectory    │ ◄────────────── │ MuxDirectory ... │
//!   │ evictions / overflows        │  WRITE_REPORTED │                  │
//!   │ bytes_written / streams      │  STREAMS_REP.   │                  │
//!   └──────────────┬───────────────┘  LOG_COMPACT    └──────────────────┘
//!                  │                        │
//!      sweeper (cache_timer)       release after release_delay
//!      evict idle LRU while over   (compact, then evict if idle)
//!      dir/stream limits
//! ```
//!
//! Capacity is a soft target: when every resident directory has open
//! writes, a new directory is still created and `capacity_overflows`
//! increments. The sweeper brings the count back down once writes close.
//!
//! Directories are opened and closed with the map unlocked. While that
//! happens their path is marked busy, and other callers wanting the same
//! path wait for it to settle.

mod lru;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::config::CacheConfig;
use crate::directory::scheduler::CloseScheduler;
use crate::directory::MuxDirectory;
use crate::error::{MuxError, Result};
use crate::event::{EventSink, MuxEvent};

use lru::Pressure;

/// Resident directories plus paths being opened or closed
///
/// A path is never resident and busy at once.
#[derive(Default)]
pub(crate) struct CacheTable {
    pub resident: HashMap<PathBuf, MuxDirectory>,
    pub busy: HashSet<PathBuf>,
}

pub(crate) struct CacheInner {
    config: CacheConfig,
    scheduler: Arc<CloseScheduler>,
    dirs: Mutex<CacheTable>,
    /// Signalled when a busy path settles
    settled: Condvar,

    // Counters
    evictions: AtomicU64,
    capacity_overflows: AtomicU64,
    bytes_written: AtomicU64,
    streams_reported: AtomicU64,

    self_ref: Weak<CacheInner>,
}

/// Process-wide cache of writable directories
pub struct DirectoryCache {
    inner: Arc<CacheInner>,
    shutdown: Option<Sender<()>>,
    sweeper: Option<JoinHandle<()>>,
}

impl DirectoryCache {
    /// Create a cache and start its close scheduler and sweeper
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let scheduler = Arc::new(CloseScheduler::start("mux-cache-close")?);
        let inner = Arc::new_cyclic(|self_ref| CacheInner {
            config,
            scheduler,
            dirs: Mutex::new(CacheTable::default()),
            settled: Condvar::new(),
            evictions: AtomicU64::new(0),
            capacity_overflows: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            streams_reported: AtomicU64::new(0),
            self_ref: self_ref.clone(),
        });

        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(1);
        let weak = Arc::downgrade(&inner);
        let interval = inner.config.cache_timer;
        let sweeper = thread::Builder::new()
            .name("mux-cache-sweep".to_string())
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(cache) = weak.upgrade() else {
                            break;
                        };
                        cache.sweep();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        info!(
            dir_max = inner.config.cache_dir_max,
            stream_max = inner.config.cache_stream_max,
            "directory cache started"
        );

        Ok(Self {
            inner,
            shutdown: Some(shutdown_tx),
            sweeper: Some(sweeper),
        })
    }

    /// Config in effect
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    // =========================================================================
    // Instances
    // =========================================================================

    /// Cached writable directory for `path`, constructed on a miss
    ///
    /// At capacity the least-recently-used idle directory is evicted first.
    /// If none is idle the directory is created anyway and
    /// `capacity_overflows` increments.
    pub fn get_writeable_instance(&self, path: impl AsRef<Path>) -> Result<MuxDirectory> {
        let path = path.as_ref();

        let (victims, full) = {
            let mut table = self.inner.dirs.lock();
            loop {
                if table.busy.contains(path) {
                    self.inner.settled.wait(&mut table);
                    continue;
                }
                match table.resident.get(path) {
                    Some(dir) if !dir.is_closed() => {
                        dir.touch();
                        return Ok(dir.clone());
                    }
                    Some(_) => {
                        table.resident.remove(path);
                    }
                    None => {}
                }
                break;
            }

            table.busy.insert(path.to_path_buf());
            let full = table.resident.len() >= self.inner.config.cache_dir_max;
            let victims = if full {
                let pressure = Pressure {
                    dir_max: self.inner.config.cache_dir_max - 1,
                    stream_max: usize::MAX,
                    budget: 1,
                };
                self.inner.take_victims(&mut table, &pressure)
            } else {
                Vec::new()
            };
            (victims, full)
        };

        if full && self.inner.close_victims(victims) == 0 {
            self.inner.capacity_overflows.fetch_add(1, Ordering::SeqCst);
            debug!(path = %path.display(), "cache over capacity; no idle directory to evict");
        }

        let opened = MuxDirectory::open_shared(
            path,
            self.inner.config.directory.clone(),
            self.inner.event_sink(path),
            self.inner.scheduler.clone(),
        );

        {
            let mut table = self.inner.dirs.lock();
            table.busy.remove(path);
            if let Ok(dir) = &opened {
                table.resident.insert(path.to_path_buf(), dir.clone());
            }
        }
        self.inner.settled.notify_all();
        opened
    }

    /// Uncached read-only view of `path`
    pub fn get_instance(&self, path: impl AsRef<Path>) -> Result<MuxDirectory> {
        MuxDirectory::open_read_only(path)
    }

    /// Whether `path` is resident
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.inner.dirs.lock().resident.contains_key(path.as_ref())
    }

    // =========================================================================
    // Closure and Eviction
    // =========================================================================

    /// Block until every cached directory's write sessions are CLOSED and
    /// its append handles released
    ///
    /// Each directory applies its own exit-closure timeout and force mode.
    /// Returns the first failure after visiting all directories.
    pub fn wait_for_write_closure(&self) -> Result<()> {
        let dirs: Vec<MuxDirectory> = self.inner.dirs.lock().resident.values().cloned().collect();

        let mut first_error = None;
        for dir in dirs {
            match dir.wait_for_write_closure() {
                Ok(()) | Err(MuxError::DirectoryClosed(_)) => {}
                Err(e) => {
                    warn!(path = %dir.path().display(), error = %e, "write closure incomplete");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Evict `dir` now if it has no open writes
    ///
    /// Returns false, leaving everything untouched, when it has open writes
    /// or is not this cache's instance.
    pub fn try_evict(&self, dir: &MuxDirectory) -> Result<bool> {
        self.inner.evict_one(dir)
    }

    /// `try_evict` on every cached directory; true only if all succeeded
    pub fn try_clear(&self) -> Result<bool> {
        let all: Vec<MuxDirectory> = self.inner.dirs.lock().resident.values().cloned().collect();

        let mut cleared = true;
        for dir in all {
            if !self.inner.evict_one(&dir)? {
                cleared = false;
            }
        }
        Ok(cleared)
    }

    /// Run one maintenance sweep now. Returns the number evicted.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    // =========================================================================
    // Counters
    // =========================================================================

    /// Resident directories
    pub fn cache_dir_size(&self) -> usize {
        self.inner.dirs.lock().resident.len()
    }

    /// Files across resident directories
    pub fn cache_file_size(&self) -> usize {
        self.inner.dirs.lock().resident.values().map(|d| d.file_count()).sum()
    }

    /// Streams across resident directories
    pub fn cache_stream_size(&self) -> usize {
        self.inner.dirs.lock().resident.values().map(|d| d.stream_count()).sum()
    }

    /// Evictions since the previous call; resets to zero
    pub fn get_and_clear_cache_evictions(&self) -> u64 {
        self.inner.evictions.swap(0, Ordering::SeqCst)
    }

    /// Directories created while the cache was full of busy directories
    pub fn capacity_overflows(&self) -> u64 {
        self.inner.capacity_overflows.load(Ordering::SeqCst)
    }

    /// Bytes committed across all directories
    pub fn bytes_written(&self) -> u64 {
        self.inner.bytes_written.load(Ordering::SeqCst)
    }

    /// Streams allocated across all directories
    pub fn streams_reported(&self) -> u64 {
        self.inner.streams_reported.load(Ordering::SeqCst)
    }
}

impl Drop for DirectoryCache {
    fn drop(&mut self) {
        self.shutdown.take();
        if let Some(handle) = self.sweeper.take() {
            if handle.join().is_err() {
                warn!("cache sweeper thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for DirectoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryCache")
            .field("resident", &self.cache_dir_size())
            .field("config", &self.inner.config)
            .finish()
    }
}

// =============================================================================
// Cache Internals
// =============================================================================

impl CacheInner {
    /// Sink wired into a directory constructed for `path`
    fn event_sink(&self, path: &Path) -> EventSink {
        let cache = self.self_ref.clone();
        let path = path.to_path_buf();
        EventSink::callback(move |event| {
            if let Some(cache) = cache.upgrade() {
                cache.on_event(&path, event);
            }
        })
    }

    fn on_event(&self, path: &Path, event: MuxEvent) {
        match event {
            MuxEvent::WriteReported { bytes } => {
                self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
            }
            MuxEvent::StreamsReported { streams } => {
                self.streams_reported.fetch_add(streams, Ordering::Relaxed);
            }
            MuxEvent::LogCompact { .. } => {
                let cache = self.self_ref.clone();
                let path = path.to_path_buf();
                debug!(path = %path.display(), delay_ms = self.config.release_delay.as_millis() as u64, "release scheduled");
                self.scheduler.schedule_after(self.config.release_delay, move || {
                    if let Some(cache) = cache.upgrade() {
                        cache.release_compacted(&path);
                    }
                });
            }
            MuxEvent::FileRead { file, .. } => {
                trace!(path = %path.display(), file = %file, "file read");
            }
        }
    }

    /// Compact a directory after LOG_COMPACT, then evict it if idle
    fn release_compacted(&self, path: &Path) {
        let Some(dir) = self.dirs.lock().resident.get(path).cloned() else {
            return;
        };

        match dir.compact() {
            Ok(stats) => {
                info!(
                    path = %path.display(),
                    removed = stats.files_removed,
                    rewritten = stats.files_rewritten,
                    reclaimed = stats.bytes_reclaimed,
                    "compacted released directory"
                );
            }
            Err(MuxError::DirectoryClosed(_)) => return,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "compaction of released directory failed");
            }
        }

        if let Err(e) = self.evict_one(&dir) {
            warn!(path = %path.display(), error = %e, "release eviction failed");
        }
    }

    /// Evict `dir` if it is this cache's resident instance and idle
    fn evict_one(&self, dir: &MuxDirectory) -> Result<bool> {
        let path = dir.path().to_path_buf();
        {
            let mut table = self.dirs.lock();
            let resident = table.resident.get(&path).map_or(false, |d| d.ptr_eq(dir));
            if !resident || !dir.is_idle() {
                return Ok(false);
            }
            table.resident.remove(&path);
            table.busy.insert(path.clone());
        }

        let closed = dir.try_close();
        self.settle(vec![(path, dir.clone())]);

        if !closed? {
            return Ok(false);
        }
        self.evictions.fetch_add(1, Ordering::SeqCst);
        debug!(path = %dir.path().display(), "directory evicted");
        Ok(true)
    }

    /// Clear the busy mark of each path, keeping directories that stayed open
    pub(crate) fn settle(&self, outcomes: Vec<(PathBuf, MuxDirectory)>) {
        {
            let mut table = self.dirs.lock();
            for (path, dir) in outcomes {
                table.busy.remove(&path);
                if !dir.is_closed() {
                    table.resident.insert(path, dir);
                }
            }
        }
        self.settled.notify_all();
    }
}
