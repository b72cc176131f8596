//! Error types for bundle parsing, extraction and re-packing.

use std::io;
use thiserror::Error;

use crate::codec::CodecError;

/// Result type for bundle operations
pub type Result<T> = std::result::Result<T, BundleError>;

/// Structural problems with the container itself.
#[derive(Error, Debug)]
pub enum FormatError {
    /// Input ended while reading a fixed field.
    #[error("truncated input while reading {field} at offset {offset}")]
    Truncated { field: &'static str, offset: u64 },

    #[error("invalid {table} count {count}")]
    InvalidCount { table: &'static str, count: i32 },

    #[error(
        "entry {index} ({path}) range {offset}+{size} exceeds logical stream length {stream_len}"
    )]
    EntryOutOfBounds {
        index: usize,
        path: String,
        offset: u64,
        size: u64,
        stream_len: u64,
    },

    #[error("logical stream is {actual} bytes, block table declares {expected}")]
    StreamLengthMismatch { expected: u64, actual: u64 },

    #[error("BlocksInfo at end needs {size} bytes but archive is only {archive_len} bytes")]
    BlocksInfoOutOfBounds { size: u32, archive_len: u64 },

    #[error("archives with signature {0:?} are read-only")]
    ReadOnlyFormat(String),

    #[error("{supplied} entry streams supplied for {expected} directory entries")]
    EntryCountMismatch { expected: usize, supplied: usize },

    #[error("entry name {0:?} cannot be used as a file name")]
    InvalidEntryName(String),

    /// Two spilled entries would share one file under the unpack directory.
    #[error("entry name {0:?} is already used by another spilled entry")]
    DuplicateEntryName(String),

    #[error("{field} does not fit in {bits} bits: {value}")]
    FieldOverflow { field: &'static str, bits: u8, value: u64 },
}

/// Crate-wide error.
#[derive(Error, Debug)]
pub enum BundleError {
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// An entry must spill to disk but no unpack directory was configured.
    #[error("entry {name:?} ({size} bytes) needs an unpack directory")]
    NoUnpackDir { name: String, size: u64 },
}

impl BundleError {
    /// Map an `UnexpectedEof` from a fixed-field read to [`FormatError::Truncated`].
    pub(crate) fn truncated_or_io(err: io::Error, field: &'static str, offset: u64) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            BundleError::Format(FormatError::Truncated { field, offset })
        } else {
            BundleError::Io(err)
        }
    }
}
