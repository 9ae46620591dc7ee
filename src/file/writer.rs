//! Append handles and write sessions
//!
//! A write session is a file's open segment. The append handle
//! ([`MuxWriter`]) feeds it; the directory's close scheduler ends it.
//!
//! ## Session States
//! ```text
//!            write                 flush / close handle
//!   (none) ───────► OPEN ◄──────────────────────────────┐
//!                    │  ▲                               │
//!       flush/close  │  │ write                         │
//!                    ▼  │                               │
//!                   IDLE ───────────────────────────────┘
//!                    │
//!                    │ no write for the grace interval
//!                    ▼
//!             CLOSE_PENDING ──► CLOSED   (segment sealed, metadata persisted)
//! ```
//! OPEN also turns IDLE when the timer sees no write for half the grace
//! interval. Closing a segment releases a handle still attached to it. A
//! later write on a plain handle claims the file again and starts a new
//! session on a fresh stream.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Instant;

use lz4_flex::frame::FrameEncoder;
use tracing::warn;

use crate::directory::DirectoryInner;
use crate::error::{MuxError, Result};

use super::mux_file::FileEntry;

/// Buffered bytes pushed to the stream once a session holds this much
pub const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Lifecycle state of a file's write session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// Accepting bytes
    Open,
    /// Handle flushed or closed; closure timer running
    Idle,
    /// Grace interval elapsed; segment being finalized
    ClosePending,
    /// Segment finalized (or no segment open)
    Closed,
}

/// One open segment of a file
#[derive(Debug)]
pub(crate) struct WriteSession {
    pub stream_id: u32,
    pub state: WriteState,
    pub last_write: Instant,
    /// Bytes not yet handed to the stream manager
    pub buffer: Vec<u8>,
    /// Bytes in the stream but not yet in the file's length
    pub uncommitted: u64,
    /// Stream ID already in the file's stream list
    pub listed: bool,
    pub timer_armed: bool,
    /// A handle is attached
    pub attached: bool,
    /// Holds an LZ4 frame; never continued by another handle
    pub compressed: bool,
}

impl WriteSession {
    pub fn new(stream_id: u32, compressed: bool) -> Self {
        Self {
            stream_id,
            state: WriteState::Open,
            last_write: Instant::now(),
            buffer: Vec::new(),
            uncommitted: 0,
            listed: false,
            timer_armed: false,
            attached: true,
            compressed,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state != WriteState::Closed
    }
}

// =============================================================================
// Segment Sink
// =============================================================================

/// Forwards handle writes into the file's session
pub(crate) struct SegmentSink {
    dir: Arc<DirectoryInner>,
    entry: Arc<FileEntry>,
    compressed: bool,
    /// Handle epoch this sink writes under
    epoch: u64,
}

impl Write for SegmentSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.dir
            .session_write(&self.entry, buf, self.compressed, &mut self.epoch)
            .map_err(into_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // A partial LZ4 frame is not a readable segment, so compressed
        // sessions only commit on close
        self.dir
            .session_flush(&self.entry, !self.compressed, self.epoch)
            .map_err(into_io)
    }
}

enum Sink {
    Plain(SegmentSink),
    Lz4(FrameEncoder<SegmentSink>),
}

// =============================================================================
// Append Handle
// =============================================================================

/// The single append handle of a logical file
///
/// Bytes become part of the file's committed length on `flush()` and on
/// close. Dropping the handle closes it; use [`MuxWriter::close`] to see
/// errors.
pub struct MuxWriter {
    sink: Option<Sink>,
    dir: Arc<DirectoryInner>,
    entry: Arc<FileEntry>,
}

impl std::fmt::Debug for MuxWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxWriter")
            .field("file_id", &self.entry.file_id)
            .field("name", &self.entry.name)
            .field("open", &self.sink.is_some())
            .finish()
    }
}

impl MuxWriter {
    pub(crate) fn plain(dir: Arc<DirectoryInner>, entry: Arc<FileEntry>, epoch: u64) -> Self {
        let sink = SegmentSink {
            dir: dir.clone(),
            entry: entry.clone(),
            compressed: false,
            epoch,
        };
        Self {
            sink: Some(Sink::Plain(sink)),
            dir,
            entry,
        }
    }

    pub(crate) fn lz4(dir: Arc<DirectoryInner>, entry: Arc<FileEntry>, epoch: u64) -> Self {
        let sink = SegmentSink {
            dir: dir.clone(),
            entry: entry.clone(),
            compressed: true,
            epoch,
        };
        Self {
            sink: Some(Sink::Lz4(FrameEncoder::new(sink))),
            dir,
            entry,
        }
    }

    /// Name of the file being appended to
    pub fn file_name(&self) -> &str {
        &self.entry.name
    }

    /// State of the underlying write session
    pub fn state(&self) -> WriteState {
        self.entry
            .session
            .lock()
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(WriteState::Closed)
    }

    /// Stream currently receiving this handle's bytes, if any
    pub fn stream_id(&self) -> Option<u32> {
        self.entry
            .session
            .lock()
            .as_ref()
            .filter(|s| s.is_live())
            .map(|s| s.stream_id)
    }

    /// Commit buffered bytes and release the handle
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        let Some(sink) = self.sink.take() else {
            return Ok(());
        };

        let (compressed, epoch, pushed) = match sink {
            Sink::Plain(sink) => (false, sink.epoch, Ok(())),
            Sink::Lz4(encoder) => {
                let epoch = encoder.get_ref().epoch;
                let pushed = encoder
                    .finish()
                    .map(|_| ())
                    .map_err(|e| MuxError::Io(io::Error::new(io::ErrorKind::Other, e)));
                (true, epoch, pushed)
            }
        };

        // Detach even when the frame failed, so the claim is never leaked
        let detached = self.dir.detach_writer(&self.entry, compressed, epoch);
        pushed.and(detached)
    }
}

impl Write for MuxWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.sink.as_mut() {
            Some(Sink::Plain(sink)) => sink.write(buf),
            Some(Sink::Lz4(encoder)) => encoder.write(buf),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "append handle is closed",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.sink.as_mut() {
            Some(Sink::Plain(sink)) => sink.flush(),
            Some(Sink::Lz4(encoder)) => encoder.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for MuxWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(file = %self.entry.name, error = %e, "append handle failed to close cleanly");
        }
    }
}

/// Convert a crate error into an io::Error for `Read`/`Write` impls
pub(crate) fn into_io(err: MuxError) -> io::Error {
    match err {
        MuxError::Io(e) => e,
        MuxError::FileNotFound(_) | MuxError::StreamNotFound(_) => {
            io::Error::new(io::ErrorKind::NotFound, err)
        }
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}
