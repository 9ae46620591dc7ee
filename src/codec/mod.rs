//! Record Codec Module
//!
//! Binary encoding for logical-file metadata.
//!
//! ## Primitives
//! - length: unsigned LEB128 varint (1-10 bytes)
//! - int:    4-byte big-endian signed integer
//! - string: length + UTF-8 bytes
//! - bytes:  length + raw bytes
//!
//! ## Mux File Record
//! ```text
//! ┌──────────┬────────────┬──────────┬─────────┬──────────┬──────────────┬───────────┬──────────────┐
//! │ Flag (L) │ FileId (4) │ Name (S) │ Mode(1) │ Len (L)  │ Modified (L) │ Count (L) │ StreamId (L) │
//! │ reserved │            │          │reserved │          │              │           │ × Count      │
//! └──────────┴────────────┴──────────┴─────────┴──────────┴──────────────┴───────────┴──────────────┘
//! ```
//! Reserved fields are always written as zero and ignored on read.

mod primitives;
mod record;

pub use primitives::{
    read_bytes, read_int, read_length, read_string, write_bytes, write_int, write_length,
    write_string, MAX_VARINT_LEN,
};
pub use record::FileRecord;
