//! File table persistence (`mux.files`)
//!
//! ```text
//! ┌───────────┬─────────────┬──────────────────┬───────────┬──────────────┬─────────┐
//! │ "MUXF"(4) │ Version (2) │ next_file_id (v) │ count (v) │ FileRecord × │ CRC (4) │
//! └───────────┴─────────────┴──────────────────┴───────────┴──────────────┴─────────┘
//!                                  (v) = varint length
//! ```
//!
//! Written after the stream table, so the stream table on disk always
//! covers every stream a persisted file references.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, info};

use crate::codec::{read_length, write_length, FileRecord};
use crate::error::{MuxError, Result};
use crate::file::FileEntry;
use crate::stream::{read_snapshot, write_atomically, StreamManager};

/// File table file name
pub const FILE_TABLE_FILENAME: &str = "mux.files";

const FILE_TABLE_MAGIC: &[u8; 4] = b"MUXF";
const FILE_TABLE_VERSION: u16 = 1;

/// In-memory file table of one directory
pub(crate) struct FileTable {
    pub by_name: HashMap<String, Arc<FileEntry>>,
    pub by_id: BTreeMap<u32, Arc<FileEntry>>,
    pub next_file_id: u32,
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
            by_id: BTreeMap::new(),
            next_file_id: 1,
        }
    }

    pub fn insert(&mut self, entry: Arc<FileEntry>) {
        self.by_name.insert(entry.name.clone(), entry.clone());
        self.by_id.insert(entry.file_id, entry);
    }

    /// Remove `entry` if it is still the live identity for its name
    pub fn remove(&mut self, entry: &FileEntry) -> bool {
        let current = self
            .by_name
            .get(&entry.name)
            .map_or(false, |e| e.file_id == entry.file_id);
        if current {
            self.by_name.remove(&entry.name);
        }
        self.by_id.remove(&entry.file_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Persistable records, in file ID order
    pub fn records(&self) -> Vec<FileRecord> {
        self.by_id.values().map(|e| e.to_record()).collect()
    }
}

/// Encode and atomically write the file table
pub(crate) fn save_file_table(dir: &Path, next_file_id: u32, records: &[FileRecord]) -> Result<()> {
    let mut body = BytesMut::with_capacity(64 + records.len() * 32);
    write_length(next_file_id as u64, &mut body);
    write_length(records.len() as u64, &mut body);
    for record in records {
        record.write_to(&mut body);
    }

    let mut bytes = Vec::with_capacity(body.len() + 10);
    bytes.extend_from_slice(FILE_TABLE_MAGIC);
    bytes.extend_from_slice(&FILE_TABLE_VERSION.to_be_bytes());
    bytes.extend_from_slice(&body);
    bytes.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());

    write_atomically(&dir.join(FILE_TABLE_FILENAME), &bytes)?;
    debug!(dir = %dir.display(), files = records.len(), "file table saved");
    Ok(())
}

/// Load the file table, validating every stream reference
pub(crate) fn load_file_table(dir: &Path, streams: &StreamManager) -> Result<FileTable> {
    let mut table = FileTable::new();
    let path = dir.join(FILE_TABLE_FILENAME);
    if !path.exists() {
        return Ok(table);
    }

    let body = read_snapshot(&path, FILE_TABLE_MAGIC, FILE_TABLE_VERSION)?;
    let mut buf = &body[..];

    let next_file_id = u32::try_from(read_length(&mut buf)?)
        .map_err(|_| MuxError::Codec("next_file_id out of range".to_string()))?;
    let count = read_length(&mut buf)?;

    let mut max_id = 0u32;
    for _ in 0..count {
        let record = FileRecord::read_from(&mut buf)?;
        if table.by_name.contains_key(&record.name) || table.by_id.contains_key(&record.file_id) {
            return Err(MuxError::Corruption(format!(
                "duplicate file {} (id {}) in {}",
                record.name,
                record.file_id,
                path.display()
            )));
        }
        max_id = max_id.max(record.file_id);
        table.insert(Arc::new(FileEntry::from_record(record, streams)?));
    }

    if !buf.is_empty() {
        return Err(MuxError::Codec(format!(
            "{} trailing bytes after file table",
            buf.len()
        )));
    }

    table.next_file_id = next_file_id.max(max_id.saturating_add(1));
    Ok(table)
}

/// Release streams no file references
///
/// These are segments of deleted files and sessions that never committed.
/// Returns the number of streams released.
pub(crate) fn release_orphans(dir: &Path, streams: &StreamManager, table: &FileTable) -> Result<usize> {
    let referenced: HashSet<u32> = table
        .by_id
        .values()
        .flat_map(|e| e.meta.read().stream_ids.clone())
        .collect();

    let orphans: Vec<u32> = streams
        .stream_ids()
        .into_iter()
        .filter(|id| !referenced.contains(id))
        .collect();

    if orphans.is_empty() {
        return Ok(0);
    }

    let freed = streams.release(&orphans);
    streams.save()?;
    info!(
        dir = %dir.display(),
        streams = orphans.len(),
        bytes = freed,
        "released unreferenced streams"
    );
    Ok(orphans.len())
}
