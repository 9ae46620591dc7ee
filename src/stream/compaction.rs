//! Stream compaction
//!
//! Reclaims space left behind by deleted files.
//!
//! ## Pass
//! 1. Drop the current data file if nothing live remains in it
//! 2. For every other data file:
//!    - no live blocks → delete it
//!    - live ratio below threshold and no open stream inside → move its live
//!      blocks into the current data file, then delete it
//! 3. Persist the stream table before unlinking anything, so a crash never
//!    leaves the table pointing at a removed file

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io;

use tracing::{debug, info};

use crate::error::Result;

use super::manager::StreamManager;
use super::segment::read_block;

/// Outcome of one compaction pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Data files deleted because nothing referenced them
    pub files_removed: usize,
    /// Data files whose live blocks were moved before deletion
    pub files_rewritten: usize,
    /// Blocks relocated
    pub blocks_moved: usize,
    /// Physical bytes freed on disk
    pub bytes_reclaimed: u64,
}

impl StreamManager {
    /// Run one compaction pass
    ///
    /// `live_ratio` is the live/total fraction under which a sealed data file
    /// gets rewritten. Data files holding blocks of open streams are never
    /// rewritten.
    pub fn compact(&self, live_ratio: f64) -> Result<CompactionStats> {
        let mut state = self.state.lock();
        let mut stats = CompactionStats::default();
        let mut doomed: Vec<(u32, u64)> = Vec::new();

        // Files holding blocks of open streams
        let pinned: BTreeSet<u32> = state
            .streams
            .values()
            .filter(|s| s.open)
            .flat_map(|s| s.blocks.iter().map(|b| b.data_file))
            .collect();

        // Step 1: an empty current file can go too
        let current = state.writer.as_ref().map(|w| w.id());
        if let Some(id) = current {
            let dead = state
                .data_files
                .get(&id)
                .map(|info| info.live_bytes == 0)
                .unwrap_or(false);
            if dead && !pinned.contains(&id) {
                state.writer = None;
            }
        }
        let current = state.writer.as_ref().map(|w| w.id());

        // Step 2: classify sealed files
        let mut rewrite: Vec<u32> = Vec::new();
        for (id, info) in state.data_files.iter() {
            if Some(*id) == current {
                continue;
            }
            if info.live_bytes == 0 {
                doomed.push((*id, info.total_bytes));
                stats.files_removed += 1;
            } else if !pinned.contains(id)
                && info.total_bytes > 0
                && (info.live_bytes as f64 / info.total_bytes as f64) < live_ratio
            {
                rewrite.push(*id);
            }
        }

        for id in rewrite {
            // Collect every live block in this file, per stream, in order
            let mut moves: Vec<(u32, usize)> = Vec::new();
            for stream in state.streams.values() {
                for (idx, block) in stream.blocks.iter().enumerate() {
                    if block.data_file == id {
                        moves.push((stream.stream_id, idx));
                    }
                }
            }

            let mut file = File::open(self.data_file_path(id))?;
            let mut relocated: HashMap<(u32, usize), _> = HashMap::with_capacity(moves.len());
            for (stream_id, idx) in &moves {
                let block = state.streams[stream_id].blocks[*idx];
                let payload = read_block(&mut file, *stream_id, &block)?;
                let new_block = self.append_block_locked(&mut state, *stream_id, &payload)?;
                relocated.insert((*stream_id, *idx), new_block);
            }

            for ((stream_id, idx), new_block) in relocated {
                if let Some(stream) = state.streams.get_mut(&stream_id) {
                    stream.blocks[idx] = new_block;
                }
            }

            let total = state.data_files.get(&id).map(|i| i.total_bytes).unwrap_or(0);
            stats.blocks_moved += moves.len();
            stats.files_rewritten += 1;
            doomed.push((id, total));
            debug!(data_file = id, blocks = moves.len(), "data file rewritten");
        }

        if doomed.is_empty() && stats.files_rewritten == 0 {
            return Ok(stats);
        }

        // Step 3: table first, then unlink
        for (id, _) in &doomed {
            state.data_files.remove(id);
        }
        self.save_locked(&mut state)?;

        for (id, total) in doomed {
            match fs::remove_file(self.data_file_path(id)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            stats.bytes_reclaimed += total;
        }

        info!(
            removed = stats.files_removed,
            rewritten = stats.files_rewritten,
            blocks_moved = stats.blocks_moved,
            bytes_reclaimed = stats.bytes_reclaimed,
            "compaction finished"
        );

        Ok(stats)
    }
}
