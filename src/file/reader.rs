//! Mux File Reader
//!
//! Concatenates a file's segments into one logical byte stream.
//!
//! Segments are loaded one at a time. With decompression on, each segment
//! gets its own LZ4 frame decoder: segments are compressed independently
//! at write time, so the filter never spans a segment boundary.
//!
//! Data files are opened when the reader is built, so a compaction that
//! later rewrites and unlinks them does not affect it.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{self, Cursor, Read};

use lz4_flex::frame::FrameDecoder;

use crate::stream::{read_block, BlockRef, PinnedBlocks};

use super::writer::into_io;

/// One segment as seen by the reader: its blocks, cut to the committed length
struct SegmentPlan {
    stream_id: u32,
    blocks: Vec<BlockRef>,
    /// Bytes of the last block to keep
    tail_len: usize,
}

/// Logical byte stream over a file's segments
pub struct MuxFileReader {
    segments: VecDeque<SegmentPlan>,
    decompress: bool,
    current: Option<Box<dyn Read + Send>>,
    /// Logical bytes still to discard before the first yielded byte
    skip: u64,
    files: HashMap<u32, File>,
}

impl MuxFileReader {
    /// Build a reader from a pinned snapshot, cut at `length` raw bytes
    pub(crate) fn new(pinned: PinnedBlocks, length: u64, offset: u64, decompress: bool) -> Self {
        let PinnedBlocks { blocks: snapshot, files } = pinned;
        let mut budget = length;
        let mut segments = VecDeque::with_capacity(snapshot.len());

        for (stream_id, blocks) in snapshot {
            if budget == 0 {
                break;
            }

            let mut kept = Vec::with_capacity(blocks.len());
            let mut tail_len = 0usize;
            for block in blocks {
                if budget == 0 {
                    break;
                }
                let take = budget.min(block.len as u64);
                budget -= take;
                tail_len = take as usize;
                kept.push(block);
            }

            if !kept.is_empty() {
                segments.push_back(SegmentPlan {
                    stream_id,
                    blocks: kept,
                    tail_len,
                });
            }
        }

        Self {
            segments,
            decompress,
            current: None,
            skip: offset,
            files,
        }
    }

    /// Number of segments not yet started
    pub fn remaining_segments(&self) -> usize {
        self.segments.len()
    }

    fn load_segment(&mut self, plan: SegmentPlan) -> io::Result<Vec<u8>> {
        let mut raw = Vec::new();
        let last = plan.blocks.len().saturating_sub(1);

        for (idx, block) in plan.blocks.iter().enumerate() {
            let file = self.files.get_mut(&block.data_file).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("data file {} was not pinned", block.data_file),
                )
            })?;

            let payload = read_block(file, plan.stream_id, block).map_err(into_io)?;
            if idx == last {
                raw.extend_from_slice(&payload[..plan.tail_len.min(payload.len())]);
            } else {
                raw.extend_from_slice(&payload);
            }
        }

        Ok(raw)
    }

    fn read_inner(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(current) = self.current.as_mut() {
                let n = current.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                self.current = None;
            }

            let Some(plan) = self.segments.pop_front() else {
                return Ok(0);
            };
            let raw = self.load_segment(plan)?;
            self.current = Some(if self.decompress {
                Box::new(FrameDecoder::new(Cursor::new(raw)))
            } else {
                Box::new(Cursor::new(raw))
            });
        }
    }
}

impl Read for MuxFileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut scratch = [0u8; 8192];
        while self.skip > 0 {
            let want = self.skip.min(scratch.len() as u64) as usize;
            let n = self.read_inner(&mut scratch[..want])?;
            if n == 0 {
                self.skip = 0;
                return Ok(0);
            }
            self.skip -= n as u64;
        }

        self.read_inner(buf)
    }
}
