//! # muxstore
//!
//! Multiplexes millions of small logical files onto a handful of
//! append-only data files per directory:
//! - Logical files mapped onto ordered stream segments
//! - Single append handle per file, closed after a grace interval
//! - Compaction of segments left behind by deletes
//! - Bounded, process-wide cache of directory contexts
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     DirectoryCache                          │
//! │        (LRU eviction, write-closure barrier, counters)      │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ path → context
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                     MuxDirectory                            │
//! │     (file table, write sessions, grace timers, events)      │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌───────────────┐
//!   │   MuxFile   │ streams  │ StreamManager │
//!   │  (records)  │ ───────► │ (data files)  │
//!   └─────────────┘          └───────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod codec;
pub mod stream;
pub mod event;
pub mod file;
pub mod directory;
pub mod cache;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use cache::DirectoryCache;
pub use codec::FileRecord;
pub use config::{CacheConfig, DirectoryConfig};
pub use directory::MuxDirectory;
pub use error::{MuxError, Result};
pub use event::{EventSink, MuxEvent};
pub use file::{MuxFile, MuxFileReader, MuxWriter, WriteState};
pub use stream::{CompactionStats, StreamManager};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of muxstore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
