//! Entry extraction: slicing the logical stream into named payload streams.
//!
//! Each directory entry becomes an [`Entry`] holding its own seekable
//! stream.  Entries whose size reaches the spill threshold are written to
//! `<unpack_dir>/<name>` instead of memory; those files are regular outputs
//! and stay on disk after the archive is dropped.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::blocks_info::DirectoryEntry;
use crate::error::{BundleError, FormatError, Result};
use crate::io_stream::{Backing, SpillPolicy};

// ── EntryStream ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum EntryStream {
    Memory(Cursor<Vec<u8>>),
    File { path: PathBuf, file: File },
}

impl EntryStream {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        EntryStream::Memory(Cursor::new(bytes))
    }

    /// Open an existing file read/write as replacement content.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        let file = File::options().read(true).write(true).open(&path)?;
        Ok(EntryStream::File { path, file })
    }

    pub fn backing(&self) -> Backing {
        match self {
            EntryStream::Memory(_)   => Backing::Memory,
            EntryStream::File { .. } => Backing::Disk,
        }
    }

    /// On-disk location of a spilled entry.
    pub fn path(&self) -> Option<&Path> {
        match self {
            EntryStream::Memory(_)         => None,
            EntryStream::File { path, .. } => Some(path),
        }
    }

    pub fn byte_len(&self) -> io::Result<u64> {
        match self {
            EntryStream::Memory(c)         => Ok(c.get_ref().len() as u64),
            EntryStream::File { file, .. } => Ok(file.metadata()?.len()),
        }
    }

    /// Whole content, read from offset 0.  The position is left at the end.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        self.seek(SeekFrom::Start(0))?;
        let mut out = Vec::new();
        self.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl From<Vec<u8>> for EntryStream {
    fn from(bytes: Vec<u8>) -> Self {
        EntryStream::from_bytes(bytes)
    }
}

impl Read for EntryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            EntryStream::Memory(c)         => c.read(buf),
            EntryStream::File { file, .. } => file.read(buf),
        }
    }
}

impl Write for EntryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            EntryStream::Memory(c)         => c.write(buf),
            EntryStream::File { file, .. } => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            EntryStream::Memory(c)         => c.flush(),
            EntryStream::File { file, .. } => file.flush(),
        }
    }
}

impl Seek for EntryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            EntryStream::Memory(c)         => c.seek(pos),
            EntryStream::File { file, .. } => file.seek(pos),
        }
    }
}

// ── Entry ─────────────────────────────────────────────────────────────────────

/// One named payload handed to the object layer.
#[derive(Debug)]
pub struct Entry {
    pub name:   String,
    pub stream: EntryStream,
}

impl Entry {
    pub fn new(name: impl Into<String>, stream: impl Into<EntryStream>) -> Self {
        Self { name: name.into(), stream: stream.into() }
    }
}

// ── Extraction ────────────────────────────────────────────────────────────────

/// Verify every entry lies inside a stream of `stream_len` bytes.
pub fn check_bounds(directory: &[DirectoryEntry], stream_len: u64) -> Result<()> {
    for (index, entry) in directory.iter().enumerate() {
        let in_bounds = entry
            .offset
            .checked_add(entry.size)
            .is_some_and(|end| end <= stream_len);
        if !in_bounds {
            return Err(FormatError::EntryOutOfBounds {
                index,
                path: entry.path.clone(),
                offset: entry.offset,
                size: entry.size,
                stream_len,
            }
            .into());
        }
    }
    Ok(())
}

/// Copy each directory entry out of `stream`, in table order.
///
/// Entries of `policy.threshold` bytes or more are written to files under
/// `unpack_dir`, which is created on first use.  Spilled entries are named
/// by their final path segment, so two of them ending in the same segment
/// fail with [`FormatError::DuplicateEntryName`].
pub fn materialize<S: Read + Seek>(
    stream:     &mut S,
    directory:  &[DirectoryEntry],
    policy:     &SpillPolicy,
    unpack_dir: Option<&Path>,
) -> Result<Vec<Entry>> {
    let stream_len = stream.seek(SeekFrom::End(0))?;
    check_bounds(directory, stream_len)?;

    let mut entries = Vec::with_capacity(directory.len());
    let mut spilled = HashSet::new();
    for node in directory {
        let name = node.name().to_owned();
        stream.seek(SeekFrom::Start(node.offset))?;
        let mut source = (&mut *stream).take(node.size);

        let mut sink = match policy.backing_for(node.size) {
            Backing::Memory => {
                let mut buf = Vec::with_capacity(node.size.min(policy.threshold) as usize);
                source.read_to_end(&mut buf)?;
                EntryStream::from_bytes(buf)
            }
            Backing::Disk => {
                let dir = unpack_dir.ok_or_else(|| BundleError::NoUnpackDir {
                    name: name.clone(),
                    size: node.size,
                })?;
                let path = spill_path(dir, &name)?;
                if !spilled.insert(path.clone()) {
                    return Err(FormatError::DuplicateEntryName(name).into());
                }
                debug!("Entry {name} ({} bytes) spills to {}", node.size, path.display());
                let mut file = File::options()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)?;
                io::copy(&mut source, &mut file)?;
                file.flush()?;
                EntryStream::File { path, file }
            }
        };

        let copied = sink.seek(SeekFrom::End(0))?;
        if copied != node.size {
            return Err(FormatError::StreamLengthMismatch { expected: node.size, actual: copied }.into());
        }
        sink.seek(SeekFrom::Start(0))?;
        trace!("Entry {name}: offset {} size {}", node.offset, node.size);
        entries.push(Entry { name, stream: sink });
    }
    Ok(entries)
}

fn spill_path(dir: &Path, name: &str) -> Result<PathBuf> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(FormatError::InvalidEntryName(name.to_owned()).into());
    }
    fs::create_dir_all(dir)?;
    Ok(dir.join(name))
}
