//! Stream Module
//!
//! Physical layer: stream segments multiplexed into shared data files.
//!
//! ## Responsibilities
//! - Allocate stream IDs within a directory
//! - Append stream bytes as checksummed blocks
//! - Answer which data files are still in use
//! - Compact away data files left behind by deletes
//!
//! ## Data File Format
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │ Block 1                                          │
//! │ ┌──────────────┬─────────┬─────────┬───────────┐ │
//! │ │ StreamId (4) │ Len (4) │ CRC (4) │ Payload   │ │
//! │ └──────────────┴─────────┴─────────┴───────────┘ │
//! ├──────────────────────────────────────────────────┤
//! │ Block 2 (any stream)                             │
//! │ ...                                              │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Stream Table (`mux.streams`)
//! ```text
//! ┌───────────┬─────────────┬──────────────────┬─────────┐
//! │ "MUXS"(4) │ Version (2) │ bincode body     │ CRC (4) │
//! └───────────┴─────────────┴──────────────────┴─────────┘
//! ```

mod compaction;
mod manager;
mod segment;

pub use compaction::CompactionStats;
pub use manager::{PinnedBlocks, StreamManager, STREAM_TABLE_FILENAME};
pub use segment::{data_file_path, parse_data_file_id, BlockRef, MuxStream, BLOCK_HEADER_SIZE, MAX_BLOCK_SIZE};

pub(crate) use manager::{read_snapshot, write_atomically};
pub(crate) use segment::read_block;
