//! File Module
//!
//! Logical files multiplexed onto stream segments.
//!
//! ## Responsibilities
//! - Logical metadata: id, name, length, modification time, stream list
//! - Single append handle per file, feeding a write session
//! - Readers that concatenate segments in write order
//!
//! ## Read/append visibility
//! A reader snapshots the stream list and committed length when it is
//! built. Bytes committed afterwards are not visible to it; open a new
//! reader to see them.

mod mux_file;
mod reader;
mod writer;

pub use mux_file::MuxFile;
pub use reader::MuxFileReader;
pub use writer::{MuxWriter, WriteState, WRITE_BUFFER_SIZE};

pub(crate) use mux_file::{now_millis, FileEntry};
pub(crate) use writer::WriteSession;
