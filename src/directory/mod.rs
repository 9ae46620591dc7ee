//! Mux File Directory
//!
//! Per-physical-directory context: the file table, the stream manager, the
//! open write sessions and their grace timers.
//!
//! ## Architecture
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        MuxDirectory                          │
//! │                                                              │
//! │  ┌────────────────────┐        ┌──────────────────────────┐  │
//! │  │ FileTable          │        │ tracked sessions/handles │  │
//! │  │ name → FileEntry   │        │ OPEN / IDLE / PENDING    │  │
//! │  │ id   → FileEntry   │        └────────────┬─────────────┘  │
//! │  └─────────┬──────────┘                     │ grace timers   │
//! │            │ stream_ids                     ▼                │
//! │            ▼                        ┌───────────────┐        │
//! │  ┌────────────────────┐             │CloseScheduler │        │
//! │  │ StreamManager      │             └───────────────┘        │
//! │  │ mux-NNNNNN.data    │                                      │
//! │  └────────────────────┘        EventSink ──► cache / metrics │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Durability
//! Metadata (`mux.streams`, then `mux.files`) is persisted when a session
//! closes, after a delete, after compaction, and on close.

mod persist;
pub(crate) mod scheduler;
mod session;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::DirectoryConfig;
use crate::error::{MuxError, Result};
use crate::event::{EventSink, MuxEvent};
use crate::file::{FileEntry, MuxFile, MuxFileReader, WriteState};
use crate::stream::{CompactionStats, StreamManager};

use persist::FileTable;
use scheduler::CloseScheduler;

pub use persist::FILE_TABLE_FILENAME;

/// Shared state behind every handle to one directory
pub(crate) struct DirectoryInner {
    pub(crate) path: PathBuf,
    pub(crate) config: DirectoryConfig,
    writable: bool,

    pub(crate) streams: StreamManager,
    files: RwLock<FileTable>,

    tracked: Mutex<Tracked>,
    /// Signalled whenever a session or handle leaves `tracked`
    released: Condvar,

    events: EventSink,
    /// Events raised under a lock, published once it is released
    outbox: Mutex<Vec<MuxEvent>>,
    scheduler: Option<Arc<CloseScheduler>>,
    self_ref: Weak<DirectoryInner>,

    closed: AtomicBool,
    last_activity: Mutex<Instant>,
    garbage_bytes: AtomicU64,
    persist_lock: Mutex<()>,
}

/// Files with a live write session or an attached append handle
///
/// `closed` only flips while this is locked, so nothing new is tracked
/// once a close has begun.
#[derive(Default)]
pub(crate) struct Tracked {
    pub sessions: HashMap<u32, Arc<FileEntry>>,
    pub writers: HashMap<u32, Arc<FileEntry>>,
}

impl Tracked {
    fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.writers.is_empty()
    }

    /// Files holding either a session or a handle
    fn open_count(&self) -> usize {
        let handles_only = self
            .writers
            .keys()
            .filter(|id| !self.sessions.contains_key(id))
            .count();
        self.sessions.len() + handles_only
    }
}

/// A multiplexed directory
///
/// Cheap to clone; clones share one context.
#[derive(Clone)]
pub struct MuxDirectory {
    inner: Arc<DirectoryInner>,
}

impl MuxDirectory {
    /// Open (or create) a writable directory with its own close scheduler
    pub fn open(path: impl AsRef<Path>, config: DirectoryConfig) -> Result<Self> {
        Self::open_with(path, config, EventSink::discard())
    }

    /// Open a writable directory publishing events to `events`
    pub fn open_with(path: impl AsRef<Path>, config: DirectoryConfig, events: EventSink) -> Result<Self> {
        let scheduler = Arc::new(CloseScheduler::start("mux-close")?);
        Self::open_shared(path.as_ref(), config, events, scheduler)
    }

    /// Open a writable directory on a scheduler shared with other directories
    pub(crate) fn open_shared(
        path: &Path,
        config: DirectoryConfig,
        events: EventSink,
        scheduler: Arc<CloseScheduler>,
    ) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(path)?;

        let streams = StreamManager::open(path, config.max_data_file_size, true)?;
        let files = persist::load_file_table(path, &streams)?;
        persist::release_orphans(path, &streams, &files)?;

        info!(
            path = %path.display(),
            files = files.len(),
            streams = streams.stream_count(),
            "directory opened"
        );

        Ok(Self::assemble(path, config, true, streams, files, events, Some(scheduler)))
    }

    /// Open an existing directory for reading only
    ///
    /// `append`, `delete` and `compact` fail with `ReadOnly`. No timers run
    /// and nothing is written back.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(MuxError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is not a directory", path.display()),
            )));
        }

        let config = DirectoryConfig::default();
        let streams = StreamManager::open(path, config.max_data_file_size, false)?;
        let files = persist::load_file_table(path, &streams)?;

        debug!(path = %path.display(), files = files.len(), "directory opened read-only");
        Ok(Self::assemble(path, config, false, streams, files, EventSink::discard(), None))
    }

    fn assemble(
        path: &Path,
        config: DirectoryConfig,
        writable: bool,
        streams: StreamManager,
        files: FileTable,
        events: EventSink,
        scheduler: Option<Arc<CloseScheduler>>,
    ) -> Self {
        let inner = Arc::new_cyclic(|self_ref| DirectoryInner {
            path: path.to_path_buf(),
            config,
            writable,
            streams,
            files: RwLock::new(files),
            tracked: Mutex::new(Tracked::default()),
            released: Condvar::new(),
            events,
            outbox: Mutex::new(Vec::new()),
            scheduler,
            self_ref: self_ref.clone(),
            closed: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            garbage_bytes: AtomicU64::new(0),
            persist_lock: Mutex::new(()),
        });
        Self { inner }
    }

    // =========================================================================
    // Files
    // =========================================================================

    /// Open a file by name, creating it when `create` is set
    ///
    /// A name freed by `delete()` gets a new identity on create: new file ID,
    /// empty stream list.
    pub fn open_file(&self, name: &str, create: bool) -> Result<MuxFile> {
        self.inner.check_open()?;

        if let Some(entry) = self.inner.files.read().by_name.get(name) {
            self.inner.touch();
            return Ok(MuxFile::new(self.inner.clone(), entry.clone()));
        }
        if !create {
            return Err(MuxError::FileNotFound(name.to_string()));
        }
        self.inner.check_writable()?;

        let entry = {
            let mut files = self.inner.files.write();
            match files.by_name.get(name) {
                Some(existing) => existing.clone(),
                None => {
                    let file_id = files.next_file_id;
                    files.next_file_id = file_id.checked_add(1).ok_or_else(|| {
                        MuxError::Corruption("file id space exhausted".to_string())
                    })?;
                    let entry = Arc::new(FileEntry::new(file_id, name.to_string()));
                    files.insert(entry.clone());
                    debug!(path = %self.inner.path.display(), file = name, file_id, "file created");
                    entry
                }
            }
        };

        self.inner.touch();
        Ok(MuxFile::new(self.inner.clone(), entry))
    }

    /// All files, ordered by file ID
    pub fn list_files(&self) -> Result<Vec<MuxFile>> {
        self.inner.check_open()?;
        let files = self.inner.files.read();
        Ok(files
            .by_id
            .values()
            .map(|e| MuxFile::new(self.inner.clone(), e.clone()))
            .collect())
    }

    /// Number of files
    pub fn file_count(&self) -> usize {
        self.inner.files.read().len()
    }

    /// Number of live streams
    pub fn stream_count(&self) -> usize {
        self.inner.streams.stream_count()
    }

    /// Write sessions not yet closed
    pub fn open_write_count(&self) -> usize {
        self.inner.tracked.lock().sessions.len()
    }

    /// Append handles currently attached
    pub fn attached_writer_count(&self) -> usize {
        self.inner.tracked.lock().writers.len()
    }

    /// Session state of a file, `None` if the name is unknown
    pub fn write_state(&self, name: &str) -> Option<WriteState> {
        let entry = self.inner.files.read().by_name.get(name).cloned()?;
        let state = entry.session.lock().as_ref().map(|s| s.state);
        Some(state.unwrap_or(WriteState::Closed))
    }

    /// The directory's stream manager
    pub fn stream_manager(&self) -> &StreamManager {
        &self.inner.streams
    }

    /// Physical path
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Config in effect
    pub fn config(&self) -> &DirectoryConfig {
        &self.inner.config
    }

    pub fn is_writable(&self) -> bool {
        self.inner.writable
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Time of the last open, read, append or delete
    pub fn last_activity(&self) -> Instant {
        *self.inner.last_activity.lock()
    }

    /// True when both handles refer to the same context
    pub fn ptr_eq(&self, other: &MuxDirectory) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Block until every write session is CLOSED and no append handle is
    /// attached
    ///
    /// A held handle is released when the grace timer closes its segment.
    /// Waits at most `exit_closure_timeout`. Past it, forced mode closes the
    /// remaining sessions and handles and returns Ok; unforced mode returns
    /// `CloseTimeout` and leaves them open. Once this returns Ok the
    /// directory can be closed by the cache.
    pub fn wait_for_write_closure(&self) -> Result<()> {
        self.inner.wait_for_write_closure()
    }

    /// Reclaim data files left behind by deletes
    pub fn compact(&self) -> Result<CompactionStats> {
        self.inner.compact()
    }

    /// Close every session now, persist metadata and refuse further use
    pub fn close(&self) -> Result<()> {
        self.inner.shutdown()
    }

    /// Close only if no session is live and no append handle is attached
    pub(crate) fn try_close(&self) -> Result<bool> {
        self.inner.try_close()
    }

    pub(crate) fn touch(&self) {
        self.inner.touch();
    }

    /// Idle: no live session and no attached handle
    pub(crate) fn is_idle(&self) -> bool {
        self.inner.tracked.lock().is_empty()
    }
}

impl std::fmt::Debug for MuxDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxDirectory")
            .field("path", &self.inner.path)
            .field("writable", &self.inner.writable)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// =============================================================================
// Directory Internals
// =============================================================================

impl DirectoryInner {
    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MuxError::DirectoryClosed(self.path.clone()))
        } else {
            Ok(())
        }
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(MuxError::ReadOnly(self.path.clone()))
        }
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Build a reader over a snapshot of the file's committed segments
    pub(crate) fn open_reader(
        &self,
        entry: &Arc<FileEntry>,
        offset: u64,
        decompress: bool,
    ) -> Result<MuxFileReader> {
        self.check_open()?;

        let (stream_ids, length) = {
            let meta = entry.meta.read();
            if meta.deleted {
                return Err(MuxError::FileNotFound(entry.name.clone()));
            }
            (meta.stream_ids.clone(), meta.length)
        };

        let pinned = self.streams.pin_blocks(&stream_ids).map_err(|e| match e {
            // Deleted between the two snapshots
            MuxError::StreamNotFound(_) if entry.meta.read().deleted => {
                MuxError::FileNotFound(entry.name.clone())
            }
            other => other,
        })?;

        self.events.publish(MuxEvent::FileRead {
            dir: self.path.clone(),
            file: entry.name.clone(),
        });
        self.touch();

        Ok(MuxFileReader::new(pinned, length, offset, decompress))
    }

    /// Delete a file: free its name now, turn its segments into garbage
    pub(crate) fn delete_file(&self, entry: &Arc<FileEntry>) -> Result<()> {
        self.check_open()?;
        self.check_writable()?;
        if !entry.claim_writer() {
            return Err(MuxError::FileBusy(entry.name.clone()));
        }

        let result = self.delete_claimed(entry);
        entry.release_writer();
        result
    }

    fn delete_claimed(&self, entry: &Arc<FileEntry>) -> Result<()> {
        if entry.meta.read().deleted {
            return Err(MuxError::FileNotFound(entry.name.clone()));
        }

        let lingering = {
            let mut slot = entry.session.lock();
            self.close_session_locked(entry, &mut slot)
        };
        self.publish_pending();
        lingering?;

        let stream_ids = {
            let mut files = self.files.write();
            files.remove(entry);
            let mut meta = entry.meta.write();
            meta.deleted = true;
            std::mem::take(&mut meta.stream_ids)
        };

        // The stream table written here still holds the released streams, so
        // the on-disk stream table stays a superset of what files reference
        self.persist()?;
        let freed = self.streams.release(&stream_ids);
        self.streams.save()?;
        self.touch();

        debug!(
            path = %self.path.display(),
            file = %entry.name,
            streams = stream_ids.len(),
            bytes = freed,
            "file deleted"
        );

        let garbage = self.garbage_bytes.fetch_add(freed, Ordering::SeqCst) + freed;
        if garbage >= self.config.compact_threshold_bytes {
            self.garbage_bytes.store(0, Ordering::SeqCst);
            info!(path = %self.path.display(), garbage, "garbage threshold reached; requesting compaction");
            self.events.publish(MuxEvent::LogCompact {
                dir: self.path.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn compact(&self) -> Result<CompactionStats> {
        self.check_open()?;
        self.check_writable()?;

        let stats = self.streams.compact(self.config.compact_live_ratio)?;
        self.garbage_bytes.store(0, Ordering::SeqCst);
        self.persist()?;
        Ok(stats)
    }

    fn wait_for_write_closure(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.exit_closure_timeout;

        let open = {
            let mut tracked = self.tracked.lock();
            while !tracked.is_empty() {
                if self.released.wait_until(&mut tracked, deadline).timed_out() {
                    break;
                }
            }
            tracked.open_count()
        };

        if open == 0 {
            return Ok(());
        }

        if self.config.exit_closure_force {
            warn!(
                path = %self.path.display(),
                open,
                timeout_ms = self.config.exit_closure_timeout.as_millis() as u64,
                "exit closure timeout exceeded; forcing sessions closed"
            );
            self.force_close_all();
            self.persist()
        } else {
            Err(MuxError::CloseTimeout {
                path: self.path.clone(),
                open,
            })
        }
    }

    fn try_close(&self) -> Result<bool> {
        {
            let tracked = self.tracked.lock();
            if !tracked.is_empty() {
                return Ok(false);
            }
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(true);
            }
        }

        self.persist_now()?;
        debug!(path = %self.path.display(), "directory closed");
        Ok(true)
    }

    fn shutdown(&self) -> Result<()> {
        {
            let _tracked = self.tracked.lock();
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
        }

        let forced = self.force_close_all();
        self.persist_now()?;
        info!(path = %self.path.display(), sessions = forced, "directory closed");
        Ok(())
    }

    /// Persist metadata unless the directory is closed
    pub(crate) fn persist(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.persist_now()
    }

    fn persist_now(&self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }

        let _guard = self.persist_lock.lock();
        // Held across both writes: a delete cannot release streams of a file
        // that is still in the records being written
        let files = self.files.read();
        let records = files.records();
        self.streams.save()?;
        persist::save_file_table(&self.path, files.next_file_id, &records)
    }
}

impl Drop for DirectoryInner {
    fn drop(&mut self) {
        if self.writable && !self.closed.load(Ordering::SeqCst) {
            if let Err(e) = self.shutdown() {
                warn!(path = %self.path.display(), error = %e, "directory dropped without clean close");
            }
        }
    }
}
