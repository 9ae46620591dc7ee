//! Stream Manager
//!
//! Owns the stream namespace of one directory and the data files holding
//! stream bytes.
//!
//! ## Responsibilities
//! - Allocate monotonically increasing stream IDs (never reused)
//! - Append stream bytes as blocks into the current data file
//! - Roll data files over at the configured size
//! - Track which streams are open and which data files are live
//! - Persist the stream table (`mux.streams`)

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MuxError, Result};

use super::segment::{
    data_file_path, parse_data_file_id, read_block, BlockRef, DataFileWriter, MuxStream,
    MAX_BLOCK_SIZE,
};

/// Stream table file name
pub const STREAM_TABLE_FILENAME: &str = "mux.streams";

const STREAM_TABLE_MAGIC: &[u8; 4] = b"MUXS";
const STREAM_TABLE_VERSION: u16 = 1;

/// Block lists of some streams plus open handles on their data files
pub struct PinnedBlocks {
    /// `(stream_id, blocks)` in the requested order
    pub blocks: Vec<(u32, Vec<BlockRef>)>,
    /// Open handle per data file referenced by `blocks`
    pub files: HashMap<u32, File>,
}

/// Size accounting for one data file
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DataFileInfo {
    /// Physical bytes in the file
    pub total_bytes: u64,
    /// Physical bytes of blocks still referenced by a stream
    pub live_bytes: u64,
}

/// Persisted form of the stream table
#[derive(Serialize, Deserialize)]
struct StreamTable {
    next_stream_id: u32,
    next_data_file: u32,
    streams: Vec<MuxStream>,
}

pub(crate) struct StreamState {
    pub next_stream_id: u32,
    pub next_data_file: u32,
    pub streams: BTreeMap<u32, MuxStream>,
    pub data_files: BTreeMap<u32, DataFileInfo>,
    pub writer: Option<DataFileWriter>,
}

/// Manages the streams of one directory
///
/// ## Concurrency:
/// - All state sits behind one directory-scoped Mutex
/// - Block payloads are read outside the lock, from block snapshots
pub struct StreamManager {
    /// Directory holding data files and the stream table
    dir: PathBuf,

    /// Roll-over size for data files
    max_data_file_size: u64,

    /// False for read-only directories
    writable: bool,

    pub(crate) state: Mutex<StreamState>,
}

impl StreamManager {
    /// Open the stream manager for `dir`
    ///
    /// On startup:
    /// 1. Load `mux.streams` if present
    /// 2. Seal streams left open by a previous process
    /// 3. Discover data files and rebuild live/total accounting
    pub fn open(dir: &Path, max_data_file_size: u64, writable: bool) -> Result<Self> {
        let table_path = dir.join(STREAM_TABLE_FILENAME);
        let table = if table_path.exists() {
            load_stream_table(&table_path)?
        } else {
            StreamTable {
                next_stream_id: 1,
                next_data_file: 1,
                streams: Vec::new(),
            }
        };

        // Discover data files on disk
        let mut data_files: BTreeMap<u32, DataFileInfo> = BTreeMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if let Some(id) = parse_data_file_id(&path) {
                let info = data_files.entry(id).or_default();
                info.total_bytes = entry.metadata()?.len();
            }
        }

        let mut streams = BTreeMap::new();
        let mut reopened = 0usize;
        for mut stream in table.streams {
            if stream.open {
                stream.open = false;
                reopened += 1;
            }
            for block in &stream.blocks {
                let info = data_files.get_mut(&block.data_file).ok_or_else(|| {
                    MuxError::Corruption(format!(
                        "stream {} references missing data file {}",
                        stream.stream_id, block.data_file
                    ))
                })?;
                info.live_bytes += block.physical_len();
            }
            streams.insert(stream.stream_id, stream);
        }

        if reopened > 0 {
            warn!(dir = %dir.display(), streams = reopened, "sealed streams left open by a previous process");
        }

        let max_on_disk = data_files.keys().next_back().copied().unwrap_or(0);
        let next_data_file = table.next_data_file.max(max_on_disk + 1);
        let max_stream = streams.keys().next_back().copied().unwrap_or(0);
        let next_stream_id = table.next_stream_id.max(max_stream + 1);

        debug!(
            dir = %dir.display(),
            streams = streams.len(),
            data_files = data_files.len(),
            "stream table loaded"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            max_data_file_size,
            writable,
            state: Mutex::new(StreamState {
                next_stream_id,
                next_data_file,
                streams,
                data_files,
                writer: None,
            }),
        })
    }

    // =========================================================================
    // Stream Namespace
    // =========================================================================

    /// Allocate a fresh stream, open for writing
    pub fn allocate_stream(&self) -> Result<u32> {
        self.check_writable()?;
        let mut state = self.state.lock();

        let stream_id = state.next_stream_id;
        state.next_stream_id = stream_id
            .checked_add(1)
            .ok_or_else(|| MuxError::Corruption("stream id space exhausted".to_string()))?;
        state.streams.insert(stream_id, MuxStream::new(stream_id));

        Ok(stream_id)
    }

    /// Look up a stream
    ///
    /// An unknown ID means a file record references a stream this directory
    /// never had: an invariant violation, not a recoverable miss.
    pub fn find_stream(&self, stream_id: u32) -> Result<MuxStream> {
        self.state
            .lock()
            .streams
            .get(&stream_id)
            .cloned()
            .ok_or(MuxError::StreamNotFound(stream_id))
    }

    /// Check whether a stream ID is known
    pub fn contains(&self, stream_id: u32) -> bool {
        self.state.lock().streams.contains_key(&stream_id)
    }

    /// IDs of all live streams, ascending
    pub fn stream_ids(&self) -> Vec<u32> {
        self.state.lock().streams.keys().copied().collect()
    }

    /// IDs of streams currently open for writing
    pub fn open_streams(&self) -> Vec<u32> {
        self.state
            .lock()
            .streams
            .values()
            .filter(|s| s.open)
            .map(|s| s.stream_id)
            .collect()
    }

    /// Number of live streams
    pub fn stream_count(&self) -> usize {
        self.state.lock().streams.len()
    }

    /// Number of data files on disk
    pub fn data_file_count(&self) -> usize {
        self.state.lock().data_files.len()
    }

    /// Data files referenced by at least one live stream
    ///
    /// These must not be deleted or compacted away.
    pub fn get_active_files(&self) -> BTreeSet<PathBuf> {
        let state = self.state.lock();
        state
            .data_files
            .iter()
            .filter(|(_, info)| info.live_bytes > 0)
            .map(|(id, _)| data_file_path(&self.dir, *id))
            .collect()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Append bytes to an open stream
    ///
    /// Large payloads are split into blocks of at most `MAX_BLOCK_SIZE`.
    pub fn write(&self, stream_id: u32, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        if data.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock();
        match state.streams.get(&stream_id) {
            Some(stream) if stream.open => {}
            Some(_) => {
                return Err(MuxError::Corruption(format!(
                    "write to sealed stream {}",
                    stream_id
                )))
            }
            None => return Err(MuxError::StreamNotFound(stream_id)),
        }

        for chunk in data.chunks(MAX_BLOCK_SIZE) {
            let block = self.append_block_locked(&mut state, stream_id, chunk)?;
            if let Some(stream) = state.streams.get_mut(&stream_id) {
                stream.blocks.push(block);
                stream.length += chunk.len() as u64;
            }
        }

        Ok(())
    }

    /// Seal a stream: no further writes, buffered blocks pushed to the OS
    pub fn seal(&self, stream_id: u32) -> Result<()> {
        let mut state = self.state.lock();
        let stream = state
            .streams
            .get_mut(&stream_id)
            .ok_or(MuxError::StreamNotFound(stream_id))?;
        stream.open = false;

        if let Some(writer) = state.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Forget streams whose file was deleted
    ///
    /// Returns the physical bytes that became garbage. The blocks stay on
    /// disk until compaction.
    pub fn release(&self, stream_ids: &[u32]) -> u64 {
        let mut state = self.state.lock();
        let mut freed = 0u64;

        for id in stream_ids {
            let Some(stream) = state.streams.remove(id) else {
                continue;
            };
            for block in &stream.blocks {
                if let Some(info) = state.data_files.get_mut(&block.data_file) {
                    info.live_bytes = info.live_bytes.saturating_sub(block.physical_len());
                }
                freed += block.physical_len();
            }
        }

        freed
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Snapshot the block lists of several streams, in the given order
    ///
    /// Flushes the current data file so every listed block is readable.
    pub fn snapshot_blocks(&self, stream_ids: &[u32]) -> Result<Vec<(u32, Vec<BlockRef>)>> {
        let mut state = self.state.lock();
        self.snapshot_locked(&mut state, stream_ids)
    }

    /// Snapshot block lists and open every data file they touch
    ///
    /// Files are opened under the state lock, which compaction also holds
    /// while unlinking, so the returned handles stay readable after a
    /// later compaction removes the files from the directory.
    pub fn pin_blocks(&self, stream_ids: &[u32]) -> Result<PinnedBlocks> {
        let mut state = self.state.lock();
        let blocks = self.snapshot_locked(&mut state, stream_ids)?;

        let mut files = HashMap::new();
        for block in blocks.iter().flat_map(|(_, b)| b.iter()) {
            if !files.contains_key(&block.data_file) {
                let file = File::open(self.data_file_path(block.data_file))?;
                files.insert(block.data_file, file);
            }
        }

        Ok(PinnedBlocks { blocks, files })
    }

    fn snapshot_locked(
        &self,
        state: &mut StreamState,
        stream_ids: &[u32],
    ) -> Result<Vec<(u32, Vec<BlockRef>)>> {
        let mut out = Vec::with_capacity(stream_ids.len());
        for id in stream_ids {
            let stream = state.streams.get(id).ok_or(MuxError::StreamNotFound(*id))?;
            out.push((*id, stream.blocks.clone()));
        }

        if let Some(writer) = state.writer.as_mut() {
            writer.flush()?;
        }

        Ok(out)
    }

    /// Read a whole stream into memory
    pub fn read_stream(&self, stream_id: u32) -> Result<Vec<u8>> {
        let PinnedBlocks { blocks, mut files } = self.pin_blocks(&[stream_id])?;
        let mut out = Vec::new();

        for (id, blocks) in blocks {
            for block in blocks {
                let file = files.get_mut(&block.data_file).ok_or_else(|| {
                    MuxError::Corruption(format!("data file {} not pinned", block.data_file))
                })?;
                out.extend_from_slice(&read_block(file, id, &block)?);
            }
        }

        Ok(out)
    }

    /// Path of data file `id` in this directory
    pub fn data_file_path(&self, id: u32) -> PathBuf {
        data_file_path(&self.dir, id)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Flush data files and write the stream table
    pub fn save(&self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        let mut state = self.state.lock();
        self.save_locked(&mut state)
    }

    pub(crate) fn save_locked(&self, state: &mut MutexGuard<'_, StreamState>) -> Result<()> {
        // Blocks must be durable before the table that references them
        if let Some(writer) = state.writer.as_mut() {
            writer.sync()?;
        }

        let table = StreamTable {
            next_stream_id: state.next_stream_id,
            next_data_file: state.next_data_file,
            streams: state.streams.values().cloned().collect(),
        };
        let body = bincode::serialize(&table)
            .map_err(|e| MuxError::Codec(format!("stream table encode failed: {}", e)))?;

        let mut bytes = Vec::with_capacity(body.len() + 10);
        bytes.extend_from_slice(STREAM_TABLE_MAGIC);
        bytes.extend_from_slice(&STREAM_TABLE_VERSION.to_be_bytes());
        bytes.extend_from_slice(&body);
        bytes.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());

        write_atomically(&self.dir.join(STREAM_TABLE_FILENAME), &bytes)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(MuxError::ReadOnly(self.dir.clone()))
        }
    }

    /// Append one block to the current data file, rolling it over when full
    pub(crate) fn append_block_locked(
        &self,
        state: &mut StreamState,
        stream_id: u32,
        payload: &[u8],
    ) -> Result<BlockRef> {
        let needs_roll = match &state.writer {
            Some(writer) => writer.len() >= self.max_data_file_size,
            None => true,
        };

        if needs_roll {
            if let Some(mut old) = state.writer.take() {
                old.sync()?;
                debug!(dir = %self.dir.display(), data_file = old.id(), "data file rolled over");
            }
            let id = state.next_data_file;
            state.next_data_file += 1;
            state.writer = Some(DataFileWriter::create(&self.dir, id)?);
            state.data_files.insert(id, DataFileInfo::default());
        }

        let writer = state
            .writer
            .as_mut()
            .ok_or_else(|| MuxError::Corruption("no current data file".to_string()))?;
        let block = writer.append_block(stream_id, payload)?;

        let info = state.data_files.entry(block.data_file).or_default();
        info.total_bytes += block.physical_len();
        info.live_bytes += block.physical_len();

        Ok(block)
    }
}

/// Write `bytes` to `path` via a temp file and rename
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    // Per-target temp name: both tables live in one directory
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read and verify a `[magic][version][body][crc]` snapshot, returning the body
pub(crate) fn read_snapshot(path: &Path, magic: &[u8; 4], version: u16) -> Result<Vec<u8>> {
    let bytes = fs::read(path)?;
    if bytes.len() < 10 {
        return Err(MuxError::Corruption(format!(
            "{} is truncated ({} bytes)",
            path.display(),
            bytes.len()
        )));
    }

    if &bytes[0..4] != magic {
        return Err(MuxError::Corruption(format!(
            "invalid magic in {}: {:?}",
            path.display(),
            &bytes[0..4]
        )));
    }

    let stored_version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if stored_version != version {
        return Err(MuxError::Corruption(format!(
            "unsupported version {} in {}",
            stored_version,
            path.display()
        )));
    }

    let crc_at = bytes.len() - 4;
    let body = &bytes[6..crc_at];
    let stored_crc = u32::from_be_bytes([
        bytes[crc_at],
        bytes[crc_at + 1],
        bytes[crc_at + 2],
        bytes[crc_at + 3],
    ]);
    if crc32fast::hash(body) != stored_crc {
        return Err(MuxError::Corruption(format!(
            "checksum mismatch in {}",
            path.display()
        )));
    }

    Ok(body.to_vec())
}

fn load_stream_table(path: &Path) -> Result<StreamTable> {
    let body = read_snapshot(path, STREAM_TABLE_MAGIC, STREAM_TABLE_VERSION)?;
    bincode::deserialize(&body)
        .map_err(|e| MuxError::Codec(format!("stream table decode failed: {}", e)))
}
