//! Logical stream assembly.
//!
//! # Backing store
//! The decoded blocks of an archive form one contiguous logical stream.  When
//! the declared size reaches [`SpillPolicy::threshold`] (2^31 − 1 bytes by
//! default) the stream is backed by an anonymous temporary file instead of a
//! `Vec`.  The file is opened read/write by this process only and is removed
//! by the OS when the [`LogicalStream`] is dropped, on success and error
//! paths alike.
//!
//! # Assembly
//! [`assemble`] decodes the block table in order; [`assemble_legacy`] does
//! the same for the single payload block of a `UnityRaw` / `UnityWeb`
//! archive.  Both verify that the stream length equals the declared
//! uncompressed total and return the stream rewound to offset 0.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use tracing::debug;

use crate::block::decode_block;
use crate::blocks_info::{logical_len, StorageBlock};
use crate::codec::{self, CodecError};
use crate::error::{FormatError, Result};

/// Default spill threshold: `i32::MAX` bytes.
pub const DEFAULT_MEMORY_THRESHOLD: u64 = i32::MAX as u64;

/// Upper bound on up-front `Vec` reservation; declared sizes come from the
/// archive and are not trusted for allocation.
const PREALLOC_LIMIT: u64 = 64 * 1024 * 1024;

// ── SpillPolicy ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    Memory,
    Disk,
}

/// Chooses between in-memory and on-disk backing for a region of known size.
#[derive(Debug, Clone)]
pub struct SpillPolicy {
    /// Regions of this many bytes or more go to disk.
    pub threshold: u64,
    /// Directory for temporary files; the system default when `None`.
    pub temp_dir:  Option<PathBuf>,
}

impl Default for SpillPolicy {
    fn default() -> Self {
        Self { threshold: DEFAULT_MEMORY_THRESHOLD, temp_dir: None }
    }
}

impl SpillPolicy {
    #[inline]
    pub fn backing_for(&self, size: u64) -> Backing {
        if size >= self.threshold { Backing::Disk } else { Backing::Memory }
    }
}

// ── LogicalStream ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum LogicalStream {
    Memory(Cursor<Vec<u8>>),
    /// Anonymous temporary file, deleted on drop.
    Disk(File),
}

impl LogicalStream {
    /// Create an empty stream whose backing suits `size` bytes.
    pub fn for_size(size: u64, policy: &SpillPolicy) -> io::Result<Self> {
        match policy.backing_for(size) {
            Backing::Memory => {
                let cap = size.min(PREALLOC_LIMIT) as usize;
                Ok(LogicalStream::Memory(Cursor::new(Vec::with_capacity(cap))))
            }
            Backing::Disk => {
                let file = match &policy.temp_dir {
                    Some(dir) => tempfile::tempfile_in(dir)?,
                    None      => tempfile::tempfile()?,
                };
                debug!("Logical stream of {size} bytes spills to a temporary file");
                Ok(LogicalStream::Disk(file))
            }
        }
    }

    pub fn backing(&self) -> Backing {
        match self {
            LogicalStream::Memory(_) => Backing::Memory,
            LogicalStream::Disk(_)   => Backing::Disk,
        }
    }

    /// Total bytes written so far.
    pub fn byte_len(&self) -> io::Result<u64> {
        match self {
            LogicalStream::Memory(c) => Ok(c.get_ref().len() as u64),
            LogicalStream::Disk(f)   => Ok(f.metadata()?.len()),
        }
    }
}

impl Read for LogicalStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            LogicalStream::Memory(c) => c.read(buf),
            LogicalStream::Disk(f)   => f.read(buf),
        }
    }
}

impl Write for LogicalStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LogicalStream::Memory(c) => c.write(buf),
            LogicalStream::Disk(f)   => f.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LogicalStream::Memory(c) => c.flush(),
            LogicalStream::Disk(f)   => f.flush(),
        }
    }
}

impl Seek for LogicalStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            LogicalStream::Memory(c) => c.seek(pos),
            LogicalStream::Disk(f)   => f.seek(pos),
        }
    }
}

// ── Assembly ──────────────────────────────────────────────────────────────────

/// Decode `blocks` from `reader` (positioned at `data_offset`, the first
/// payload byte) into one logical stream.
pub fn assemble<R: Read>(
    reader:      &mut R,
    blocks:      &[StorageBlock],
    data_offset: u64,
    policy:      &SpillPolicy,
) -> Result<LogicalStream> {
    let expected = logical_len(blocks);
    let mut stream = LogicalStream::for_size(expected, policy)?;
    debug!(
        "Assembling {} block(s), {expected} bytes, {:?} backing",
        blocks.len(),
        stream.backing()
    );

    let mut offset = data_offset;
    for block in blocks {
        let data = decode_block(&mut *reader, block, offset)?;
        stream.write_all(&data)?;
        offset += block.compressed_size as u64;
    }

    finish(stream, expected)
}

/// Decode the single payload block of a legacy archive.  `UnityWeb` payloads
/// (block flags 1) are classic `.lzma` streams; `UnityRaw` payloads are
/// stored as-is.
pub fn assemble_legacy<R: Read>(
    reader:      &mut R,
    block:       &StorageBlock,
    data_offset: u64,
    policy:      &SpillPolicy,
) -> Result<LogicalStream> {
    let expected = block.uncompressed_size as u64;
    let mut stream = LogicalStream::for_size(expected, policy)?;

    let compressed = block.compressed_size as u64;
    let mut payload = BufReader::new((&mut *reader).take(compressed));
    if block.flags == 1 {
        codec::decode_lzma_alone_into(&mut payload, &mut stream)?;
    } else {
        let copied = io::copy(&mut payload, &mut stream)?;
        if copied < compressed {
            return Err(FormatError::Truncated { field: "legacy payload", offset: data_offset + copied }.into());
        }
    }
    let actual = stream.byte_len()?;
    if actual != expected {
        return Err(CodecError::SizeMismatch { expected, actual }.into());
    }
    debug!("Legacy payload: {compressed} -> {expected} bytes, {:?} backing", stream.backing());

    finish(stream, expected)
}

fn finish(mut stream: LogicalStream, expected: u64) -> Result<LogicalStream> {
    stream.flush()?;
    let actual = stream.byte_len()?;
    if actual != expected {
        return Err(FormatError::StreamLengthMismatch { expected, actual }.into());
    }
    stream.seek(SeekFrom::Start(0))?;
    Ok(stream)
}
