//! Mux File record
//!
//! The persisted form of one logical file's metadata.

use bytes::{Buf, BufMut};

use crate::error::{MuxError, Result};

use super::primitives::{read_int, read_length, read_string, write_int, write_length, write_string};

/// Metadata of one logical file, as stored in the file table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Directory-unique file ID
    pub file_id: u32,
    /// Directory-unique file name
    pub name: String,
    /// Committed byte length
    pub length: u64,
    /// Last commit time (unix millis)
    pub last_modified: u64,
    /// Stream IDs holding the file's bytes, in write order
    pub stream_ids: Vec<u32>,
}

impl FileRecord {
    /// Encode the record
    ///
    /// Both reserved fields (format flag, mode) are written as zero.
    pub fn write_to(&self, buf: &mut impl BufMut) {
        write_length(0, buf); // reserved format flag
        write_int(self.file_id as i32, buf);
        write_string(&self.name, buf);
        buf.put_u8(0); // reserved mode
        write_length(self.length, buf);
        write_length(self.last_modified, buf);
        write_length(self.stream_ids.len() as u64, buf);
        for stream_id in &self.stream_ids {
            write_length(*stream_id as u64, buf);
        }
    }

    /// Decode a record
    ///
    /// Reserved fields are consumed whatever their stored value.
    pub fn read_from(buf: &mut impl Buf) -> Result<Self> {
        let _flag = read_length(buf)?;
        let file_id = read_int(buf)? as u32;
        let name = read_string(buf)?;

        if !buf.has_remaining() {
            return Err(MuxError::Codec("truncated record: missing mode byte".to_string()));
        }
        let _mode = buf.get_u8();

        let length = read_length(buf)?;
        let last_modified = read_length(buf)?;
        let count = read_length(buf)?;

        // Each stream ID takes at least one byte
        if count > buf.remaining() as u64 {
            return Err(MuxError::Codec(format!(
                "record for {} claims {} streams with {} bytes left",
                name,
                count,
                buf.remaining()
            )));
        }

        let mut stream_ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = read_length(buf)?;
            let id = u32::try_from(id)
                .map_err(|_| MuxError::Codec(format!("stream id {} out of range", id)))?;
            stream_ids.push(id);
        }

        Ok(Self {
            file_id,
            name,
            length,
            last_modified,
            stream_ids,
        })
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.name.len() + self.stream_ids.len() * 2);
        self.write_to(&mut out);
        out
    }
}
