//! High-level [`Archive`] API: load, inspect, edit and re-pack a bundle.
//!
//! ```no_run
//! use bundlefs::archive::Archive;
//! use bundlefs::writer::WriteOptions;
//!
//! let mut ar = Archive::open("level0.bundle")?;
//! for entry in ar.entries_mut() {
//!     let bytes = entry.stream.read_all()?;
//!     println!("{} {} bytes", entry.name, bytes.len());
//! }
//! ar.write_to_path("level0.repacked.bundle", &WriteOptions::default())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Load pipeline
//! Loading runs four stages, each consuming the previous one by value:
//!
//! ```text
//! HeaderStage ──► InfoStage ──► AssembledStage ──► Archive
//!   header         + tables       + logical stream   + entries
//! ```
//!
//! A stage that fails returns its error and the state it consumed is
//! dropped; temporary files behind the logical stream are removed with it.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::blocks_info::{self, read_located, DirectoryEntry, StorageBlock};
use crate::crypto::HASH_LEN;
use crate::entry::{self, Entry};
use crate::error::{FormatError, Result};
use crate::header::{Header, Signature};
use crate::io_stream::{self, LogicalStream, SpillPolicy, DEFAULT_MEMORY_THRESHOLD};
use crate::writer::{write_bundle, BundleParts, WriteOptions};

// ── ReadOptions ───────────────────────────────────────────────────────────────

/// Configuration for loading an archive.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Logical streams and entries of this many bytes or more go to disk.
    pub memory_threshold: u64,
    /// Directory for the logical-stream temporary file.
    pub temp_dir:         Option<PathBuf>,
    /// Directory receiving oversized entries.
    pub unpack_dir:       Option<PathBuf>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            temp_dir:         None,
            unpack_dir:       None,
        }
    }
}

impl ReadOptions {
    /// Defaults for the archive at `path`: oversized entries land in
    /// `<path>_unpacked/`.
    pub fn for_archive<P: AsRef<Path>>(path: P) -> Self {
        Self { unpack_dir: Some(unpack_dir_for(path.as_ref())), ..Self::default() }
    }

    pub fn spill_policy(&self) -> SpillPolicy {
        SpillPolicy { threshold: self.memory_threshold, temp_dir: self.temp_dir.clone() }
    }
}

/// `<archive>_unpacked`, next to the archive.
pub fn unpack_dir_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push("_unpacked");
    PathBuf::from(s)
}

// ── Pipeline stages ───────────────────────────────────────────────────────────

struct HeaderStage<R> {
    reader: R,
    header: Header,
}

struct InfoStage<R> {
    reader:         R,
    header:         Header,
    hash:           [u8; HASH_LEN],
    blocks:         Vec<StorageBlock>,
    /// Empty for legacy archives until the stream is assembled.
    directory:      Vec<DirectoryEntry>,
    header_padding: Vec<u8>,
    data_offset:    u64,
}

struct AssembledStage {
    header:         Header,
    hash:           [u8; HASH_LEN],
    blocks:         Vec<StorageBlock>,
    directory:      Vec<DirectoryEntry>,
    header_padding: Vec<u8>,
    stream:         LogicalStream,
}

impl<R: Read + Seek> HeaderStage<R> {
    fn read(mut reader: R) -> Result<Self> {
        let header = Header::read(&mut reader)?;
        Ok(Self { reader, header })
    }

    fn load_blocks_info(mut self) -> Result<InfoStage<R>> {
        let (hash, blocks, directory, header_padding) = match &self.header.signature {
            Signature::Modern => {
                let located = read_located(&mut self.reader, &self.header)?;
                let info = located.info;
                (info.hash, info.blocks, info.directory, located.header_padding)
            }
            Signature::LegacyRaw | Signature::LegacyWeb => {
                let block = self.header.legacy.as_ref().map(|l| l.block).unwrap_or_default();
                ([0u8; HASH_LEN], vec![block], Vec::new(), Vec::new())
            }
            Signature::Unknown(_) => ([0u8; HASH_LEN], Vec::new(), Vec::new(), Vec::new()),
        };
        let data_offset = self.reader.stream_position()?;
        Ok(InfoStage {
            reader: self.reader,
            header: self.header,
            hash,
            blocks,
            directory,
            header_padding,
            data_offset,
        })
    }
}

impl<R: Read + Seek> InfoStage<R> {
    fn assemble(mut self, policy: &SpillPolicy) -> Result<AssembledStage> {
        let mut stream = match &self.header.signature {
            Signature::LegacyRaw | Signature::LegacyWeb => {
                let mut stream =
                    io_stream::assemble_legacy(&mut self.reader, &self.blocks[0], self.data_offset, policy)?;
                self.directory = blocks_info::read_legacy_directory(&mut stream)?;
                stream
            }
            Signature::Modern | Signature::Unknown(_) => {
                io_stream::assemble(&mut self.reader, &self.blocks, self.data_offset, policy)?
            }
        };
        stream.rewind()?;
        Ok(AssembledStage {
            header:         self.header,
            hash:           self.hash,
            blocks:         self.blocks,
            directory:      self.directory,
            header_padding: self.header_padding,
            stream,
        })
    }
}

impl AssembledStage {
    fn materialize(mut self, policy: &SpillPolicy, unpack_dir: Option<&Path>) -> Result<Archive> {
        let entries = entry::materialize(&mut self.stream, &self.directory, policy, unpack_dir)?;
        debug!("Materialized {} entr(ies)", entries.len());
        Ok(Archive {
            header:         self.header,
            hash:           self.hash,
            blocks:         self.blocks,
            directory:      self.directory,
            header_padding: self.header_padding,
            entries,
        })
    }
}

// ── Archive ───────────────────────────────────────────────────────────────────

/// A fully loaded bundle: tables plus one stream per directory entry.
#[derive(Debug)]
pub struct Archive {
    header:         Header,
    hash:           [u8; HASH_LEN],
    blocks:         Vec<StorageBlock>,
    directory:      Vec<DirectoryEntry>,
    header_padding: Vec<u8>,
    entries:        Vec<Entry>,
}

impl Archive {
    // ── Constructors ─────────────────────────────────────────────────────────

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let opts = ReadOptions::for_archive(&path);
        Self::open_with_options(path, &opts)
    }

    pub fn open_with_options<P: AsRef<Path>>(path: P, opts: &ReadOptions) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::from_reader(BufReader::new(file), opts)
    }

    /// Run the full load pipeline over `reader`, which must start at the
    /// signature.
    pub fn from_reader<R: Read + Seek>(reader: R, opts: &ReadOptions) -> Result<Self> {
        let policy = opts.spill_policy();
        HeaderStage::read(reader)?
            .load_blocks_info()?
            .assemble(&policy)?
            .materialize(&policy, opts.unpack_dir.as_deref())
    }

    // ── Tables ───────────────────────────────────────────────────────────────

    pub fn header(&self) -> &Header { &self.header }

    pub fn header_mut(&mut self) -> &mut Header { &mut self.header }

    pub fn signature(&self) -> &Signature { &self.header.signature }

    pub fn hash(&self) -> &[u8; HASH_LEN] { &self.hash }

    pub fn blocks(&self) -> &[StorageBlock] { &self.blocks }

    pub fn directory(&self) -> &[DirectoryEntry] { &self.directory }

    /// Directory paths and flags may be edited; offsets and sizes are
    /// recomputed on write.
    pub fn directory_mut(&mut self) -> &mut [DirectoryEntry] { &mut self.directory }

    /// Length of the logical stream the block table describes.
    pub fn logical_len(&self) -> u64 { blocks_info::logical_len(&self.blocks) }

    pub fn header_padding(&self) -> &[u8] { &self.header_padding }

    // ── Entries ──────────────────────────────────────────────────────────────

    pub fn entries(&self) -> &[Entry] { &self.entries }

    pub fn entries_mut(&mut self) -> &mut [Entry] { &mut self.entries }

    pub fn entry(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn entry_mut(&mut self, name: &str) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.name == name)
    }

    /// Hand the entry streams to the caller, leaving the archive without
    /// entries until [`replace_entries`](Self::replace_entries).
    pub fn take_entries(&mut self) -> Vec<Entry> {
        std::mem::take(&mut self.entries)
    }

    /// Install replacement streams: same count and order as the directory.
    pub fn replace_entries(&mut self, entries: Vec<Entry>) -> Result<()> {
        if entries.len() != self.directory.len() {
            return Err(FormatError::EntryCountMismatch {
                expected: self.directory.len(),
                supplied: entries.len(),
            }
            .into());
        }
        self.entries = entries;
        Ok(())
    }

    /// Extract every entry into `dest/<name>`, creating `dest` if necessary.
    ///
    /// Entries are streamed, never buffered whole.  An entry that already
    /// spilled to `dest/<name>` is left in place.  Two entries with the same
    /// name fail with [`FormatError::DuplicateEntryName`].  Returns the number
    /// of entries written or kept.
    pub fn extract_all<P: AsRef<Path>>(&mut self, dest: P) -> Result<usize> {
        let dest = dest.as_ref();
        fs::create_dir_all(dest)?;
        let mut written = HashSet::new();
        for entry in &mut self.entries {
            if entry.name.is_empty() || entry.name == "." || entry.name == ".." {
                warn!("Skipping entry with unusable name {:?}", entry.name);
                continue;
            }
            let target = dest.join(&entry.name);
            if !written.insert(target.clone()) {
                return Err(FormatError::DuplicateEntryName(entry.name.clone()).into());
            }
            if entry.stream.path() != Some(target.as_path()) {
                entry.stream.seek(SeekFrom::Start(0))?;
                let mut out = BufWriter::new(File::create(&target)?);
                io::copy(&mut entry.stream, &mut out)?;
                out.flush()?;
                entry.stream.seek(SeekFrom::Start(0))?;
            }
        }
        debug!("Extracted {} entr(ies) to {}", written.len(), dest.display());
        Ok(written.len())
    }

    // ── Write ────────────────────────────────────────────────────────────────

    /// Re-pack the current entries.  On success the archive's tables are
    /// replaced by the ones just written.
    pub fn write<W: std::io::Write>(&mut self, writer: W, opts: &WriteOptions) -> Result<()> {
        let parts = BundleParts {
            header:         &self.header,
            hash:           self.hash,
            blocks:         &self.blocks,
            directory:      &self.directory,
            header_padding: &self.header_padding,
        };
        let written = write_bundle(writer, parts, &mut self.entries, opts)?;
        self.header = written.header;
        self.hash = written.info.hash;
        if self.header.signature == Signature::Modern {
            self.blocks = written.info.blocks;
            self.directory = written.info.directory;
            self.header_padding = written.header_padding;
        }
        Ok(())
    }

    pub fn write_to_path<P: AsRef<Path>>(&mut self, path: P, opts: &WriteOptions) -> Result<()> {
        let file = File::create(path.as_ref())?;
        self.write(BufWriter::new(file), opts)
    }
}
