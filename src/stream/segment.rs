//! Stream segments and the data files that hold them
//!
//! A stream is an append-only byte sequence. Its bytes live as blocks inside
//! shared data files, so thousands of streams cost a handful of file handles.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MuxError, Result};

/// Block header: StreamId (4) + Len (4) + CRC (4)
pub const BLOCK_HEADER_SIZE: u64 = 12;

/// Largest payload stored in a single block
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

const DATA_FILE_PREFIX: &str = "mux-";
const DATA_FILE_SUFFIX: &str = ".data";

// =============================================================================
// Stream Metadata
// =============================================================================

/// Location of one block inside a data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    /// Data file holding the block
    pub data_file: u32,
    /// Offset of the block header
    pub offset: u64,
    /// Payload length
    pub len: u32,
}

impl BlockRef {
    /// Physical size including the header
    pub fn physical_len(&self) -> u64 {
        BLOCK_HEADER_SIZE + self.len as u64
    }
}

/// One stream segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxStream {
    /// Directory-unique stream ID
    pub stream_id: u32,
    /// Blocks in write order
    pub blocks: Vec<BlockRef>,
    /// Payload bytes written so far
    pub length: u64,
    /// Still accepting writes
    pub open: bool,
}

impl MuxStream {
    pub(crate) fn new(stream_id: u32) -> Self {
        Self {
            stream_id,
            blocks: Vec::new(),
            length: 0,
            open: true,
        }
    }
}

// =============================================================================
// Data File Naming
// =============================================================================

/// Path of data file `id` in `dir`
/// 7 → "mux-000007.data"
pub fn data_file_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{}{:06}{}", DATA_FILE_PREFIX, id, DATA_FILE_SUFFIX))
}

/// Parse a data file ID from its path
/// "mux-000042.data" → Some(42)
pub fn parse_data_file_id(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let id = name
        .strip_prefix(DATA_FILE_PREFIX)?
        .strip_suffix(DATA_FILE_SUFFIX)?;
    id.parse().ok()
}

// =============================================================================
// Data File Writer
// =============================================================================

/// Appends blocks to the current data file
pub(crate) struct DataFileWriter {
    id: u32,
    writer: BufWriter<File>,
    len: u64,
}

impl DataFileWriter {
    /// Create a new, empty data file
    pub fn create(dir: &Path, id: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(data_file_path(dir, id))?;

        Ok(Self {
            id,
            writer: BufWriter::new(file),
            len: 0,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    /// Append one block: [stream_id][len][crc][payload]
    pub fn append_block(&mut self, stream_id: u32, payload: &[u8]) -> Result<BlockRef> {
        let offset = self.len;
        let len = payload.len() as u32;
        let crc = crc32fast::hash(payload);

        self.writer.write_all(&stream_id.to_be_bytes())?;
        self.writer.write_all(&len.to_be_bytes())?;
        self.writer.write_all(&crc.to_be_bytes())?;
        self.writer.write_all(payload)?;

        let block = BlockRef {
            data_file: self.id,
            offset,
            len,
        };
        self.len += block.physical_len();
        Ok(block)
    }

    /// Push buffered blocks to the OS
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flush and fsync
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

// =============================================================================
// Block Reads
// =============================================================================

/// Read and verify one block's payload from an open data file
pub(crate) fn read_block(file: &mut File, stream_id: u32, block: &BlockRef) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(block.offset))?;

    let mut header = [0u8; BLOCK_HEADER_SIZE as usize];
    file.read_exact(&mut header)?;

    let stored_stream = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let stored_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let stored_crc = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);

    if stored_stream != stream_id || stored_len != block.len {
        return Err(MuxError::Corruption(format!(
            "block at {}:{} belongs to stream {} ({} bytes), expected stream {} ({} bytes)",
            block.data_file, block.offset, stored_stream, stored_len, stream_id, block.len
        )));
    }

    let mut payload = vec![0u8; block.len as usize];
    file.read_exact(&mut payload)?;

    if crc32fast::hash(&payload) != stored_crc {
        return Err(MuxError::Corruption(format!(
            "checksum mismatch in block at {}:{}",
            block.data_file, block.offset
        )));
    }

    Ok(payload)
}
