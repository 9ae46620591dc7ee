//! Mux File
//!
//! A logical file: metadata plus the ordered stream IDs holding its bytes.

use std::fmt;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BufMut;
use parking_lot::{Mutex, RwLock};

use crate::codec::FileRecord;
use crate::directory::DirectoryInner;
use crate::error::{MuxError, Result};
use crate::stream::StreamManager;

use super::reader::MuxFileReader;
use super::writer::{MuxWriter, WriteSession, WriteState};

/// Mutable metadata of a logical file
#[derive(Debug, Clone, Default)]
pub(crate) struct FileMeta {
    pub length: u64,
    pub last_modified: u64,
    pub stream_ids: Vec<u32>,
    pub deleted: bool,
}

/// Shared state of one logical file inside a directory
///
/// ## Locks
/// - `session`: the open write segment, taken before `meta`
/// - `meta`: committed metadata, readers snapshot it
/// - `writer_claimed`: at most one append handle (or delete) at a time
///
/// `handle_epoch` moves on whenever an append handle ends, so a handle
/// closed along with its segment can tell it no longer owns the file.
pub(crate) struct FileEntry {
    pub file_id: u32,
    pub name: String,
    pub meta: RwLock<FileMeta>,
    pub writer_claimed: AtomicBool,
    pub handle_epoch: AtomicU64,
    pub session: Mutex<Option<WriteSession>>,
}

impl FileEntry {
    pub fn new(file_id: u32, name: String) -> Self {
        Self {
            file_id,
            name,
            meta: RwLock::new(FileMeta::default()),
            writer_claimed: AtomicBool::new(false),
            handle_epoch: AtomicU64::new(0),
            session: Mutex::new(None),
        }
    }

    /// Rebuild an entry from its persisted record
    ///
    /// Every referenced stream must exist in `streams`.
    pub fn from_record(record: FileRecord, streams: &StreamManager) -> Result<Self> {
        for stream_id in &record.stream_ids {
            streams.find_stream(*stream_id).map_err(|_| {
                MuxError::Corruption(format!(
                    "file {} references unknown stream {}",
                    record.name, stream_id
                ))
            })?;
        }

        let entry = Self::new(record.file_id, record.name);
        *entry.meta.write() = FileMeta {
            length: record.length,
            last_modified: record.last_modified,
            stream_ids: record.stream_ids,
            deleted: false,
        };
        Ok(entry)
    }

    /// Persistable snapshot of this entry
    pub fn to_record(&self) -> FileRecord {
        let meta = self.meta.read();
        FileRecord {
            file_id: self.file_id,
            name: self.name.clone(),
            length: meta.length,
            last_modified: meta.last_modified,
            stream_ids: meta.stream_ids.clone(),
        }
    }

    /// Try to become the single writer
    pub fn claim_writer(&self) -> bool {
        self.writer_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_writer(&self) {
        self.writer_claimed.store(false, Ordering::Release);
    }
}

/// Handle to a logical file
///
/// Cheap to clone; every clone refers to the same file identity. A handle
/// outlives a `delete()` but all later operations on it fail with
/// `FileNotFound`.
#[derive(Clone)]
pub struct MuxFile {
    pub(crate) dir: Arc<DirectoryInner>,
    pub(crate) entry: Arc<FileEntry>,
}

impl MuxFile {
    pub(crate) fn new(dir: Arc<DirectoryInner>, entry: Arc<FileEntry>) -> Self {
        Self { dir, entry }
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Directory-unique file ID
    pub fn file_id(&self) -> u32 {
        self.entry.file_id
    }

    /// File name
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// Committed length in bytes
    pub fn length(&self) -> u64 {
        self.entry.meta.read().length
    }

    /// Last commit time (unix millis)
    pub fn last_modified(&self) -> u64 {
        self.entry.meta.read().last_modified
    }

    /// Stream IDs holding this file's bytes, in write order
    pub fn stream_ids(&self) -> Vec<u32> {
        self.entry.meta.read().stream_ids.clone()
    }

    /// True once the file was deleted
    pub fn is_deleted(&self) -> bool {
        self.entry.meta.read().deleted
    }

    /// State of the file's open write segment
    pub fn write_state(&self) -> WriteState {
        self.entry
            .session
            .lock()
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(WriteState::Closed)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Open the single append handle for this file
    ///
    /// Fails with `AppendConflict` while another handle is open. The handle
    /// continues the file's current segment when one is still open.
    ///
    /// If the grace timer closes the segment while the handle is held, the
    /// handle is released with it; its next write claims the file again and
    /// opens a new segment.
    pub fn append(&self) -> Result<MuxWriter> {
        let epoch = self.dir.attach_writer(&self.entry, false)?;
        Ok(MuxWriter::plain(self.dir.clone(), self.entry.clone(), epoch))
    }

    /// Open an append handle that writes one LZ4 frame into a fresh segment
    ///
    /// Read it back with `read(offset, true)`. Once a forced closure ends its
    /// segment, further writes fail with `HandleClosed`.
    pub fn append_compressed(&self) -> Result<MuxWriter> {
        let epoch = self.dir.attach_writer(&self.entry, true)?;
        Ok(MuxWriter::lz4(self.dir.clone(), self.entry.clone(), epoch))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read the file from `offset`, optionally decompressing each segment
    ///
    /// The stream list and length are snapshotted here; appends committed
    /// after this call are not visible to the returned reader.
    pub fn read(&self, offset: u64, decompress: bool) -> Result<MuxFileReader> {
        self.dir.open_reader(&self.entry, offset, decompress)
    }

    /// Read from `offset`, decompressing each segment
    pub fn read_decompressed(&self, offset: u64) -> Result<MuxFileReader> {
        self.read(offset, true)
    }

    /// Read the whole file into memory
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut reader = self.read(0, false)?;
        let mut out = Vec::with_capacity(self.length() as usize);
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Delete the file
    ///
    /// The name becomes free immediately. Its segments turn into garbage
    /// reclaimed by compaction.
    pub fn delete(&self) -> Result<()> {
        self.dir.delete_file(&self.entry)
    }

    // =========================================================================
    // Records
    // =========================================================================

    /// Persistable metadata record
    pub fn to_record(&self) -> FileRecord {
        self.entry.to_record()
    }

    /// Encode this file's record
    pub fn write_record(&self, buf: &mut impl BufMut) {
        self.to_record().write_to(buf);
    }
}

impl fmt::Debug for MuxFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = self.entry.meta.read();
        f.debug_struct("MuxFile")
            .field("file_id", &self.entry.file_id)
            .field("name", &self.entry.name)
            .field("length", &meta.length)
            .field("last_modified", &meta.last_modified)
            .field("streams", &meta.stream_ids.len())
            .finish()
    }
}

/// Current time in unix millis
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
