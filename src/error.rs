//! Error types for muxstore
//!
//! Provides a unified error type for all operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using MuxError
pub type Result<T> = std::result::Result<T, MuxError>;

/// Unified error type for muxstore operations
#[derive(Debug, Error)]
pub enum MuxError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Codec Errors
    // -------------------------------------------------------------------------
    #[error("Codec error: {0}")]
    Codec(String),

    // -------------------------------------------------------------------------
    // Corruption / Invariant Errors
    // -------------------------------------------------------------------------
    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Stream {0} is not known to this directory")]
    StreamNotFound(u32),

    // -------------------------------------------------------------------------
    // File Errors
    // -------------------------------------------------------------------------
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File {0} already has an open append handle")]
    AppendConflict(String),

    #[error("File {0} is busy (append handle open)")]
    FileBusy(String),

    #[error("Append handle of {0} was closed with its segment")]
    HandleClosed(String),

    // -------------------------------------------------------------------------
    // Directory Errors
    // -------------------------------------------------------------------------
    #[error("Directory is read-only: {0}")]
    ReadOnly(PathBuf),

    #[error("Directory is closed: {0}")]
    DirectoryClosed(PathBuf),

    #[error("Timed out waiting for {open} write handle(s) to close in {path}")]
    CloseTimeout { path: PathBuf, open: usize },

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl MuxError {
    /// True for errors that indicate damaged metadata or a broken invariant.
    /// These are never retried.
    pub fn is_corruption(&self) -> bool {
        matches!(self, MuxError::Corruption(_) | MuxError::StreamNotFound(_))
    }

    /// True for typed not-found failures
    pub fn is_not_found(&self) -> bool {
        matches!(self, MuxError::FileNotFound(_))
    }
}
