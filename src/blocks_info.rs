//! BlocksInfo: the compressed metadata blob of a modern bundle.
//!
//! # Layout (uncompressed, big-endian)
//! ```text
//! hash:[u8;16]
//! block_count:i32   { uncompressed:u32 compressed:u32 flags:u16 } * block_count
//! entry_count:i32   { offset:i64 size:i64 flags:u32 path\0 }     * entry_count
//! ```
//!
//! # Location
//! With [`FLAG_BLOCKS_INFO_AT_END`](crate::header::FLAG_BLOCKS_INFO_AT_END)
//! the blob occupies the last `compressed_blocks_info_size` bytes of the
//! archive.  Otherwise it follows the header directly; from format version 7
//! an inline blob is first aligned to 16 bytes and the skipped bytes are kept
//! so a rewrite can replay them.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, WriteBytesExt};
use serde::Serialize;
use tracing::debug;

use crate::binary::{padding_for, write_cstring, FieldReader};
use crate::codec::{self, CodecError, CompressionKind};
use crate::crypto::{self, HASH_LEN};
use crate::error::{BundleError, FormatError, Result};
use crate::header::{Header, ALIGNED_INFO_VERSION};

/// On-disk size of one block record.
const BLOCK_RECORD_LEN: usize = 4 + 4 + 2;
/// Minimum on-disk size of one directory record (empty path).
const ENTRY_RECORD_MIN_LEN: usize = 8 + 8 + 4 + 1;

// ── StorageBlock ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StorageBlock {
    pub compressed_size:   u32,
    pub uncompressed_size: u32,
    pub flags:             u16,
}

impl StorageBlock {
    pub fn compression(&self) -> std::result::Result<CompressionKind, CodecError> {
        CompressionKind::from_flags(self.flags as u32)
    }
}

// ── DirectoryEntry ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DirectoryEntry {
    pub offset: u64,
    pub size:   u64,
    pub flags:  u32,
    pub path:   String,
}

impl DirectoryEntry {
    /// Final path segment; either separator counts.
    pub fn name(&self) -> &str {
        self.path.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(&self.path)
    }

    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }
}

// ── BlocksInfo ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlocksInfo {
    pub hash:      [u8; HASH_LEN],
    pub blocks:    Vec<StorageBlock>,
    pub directory: Vec<DirectoryEntry>,
}

impl BlocksInfo {
    /// Sum of the declared uncompressed block sizes.
    pub fn logical_len(&self) -> u64 {
        logical_len(&self.blocks)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = FieldReader::new(Cursor::new(bytes), 0);
        let hash = r.array::<HASH_LEN>("blocks info hash")?;

        let block_count = read_count(&mut r, "block count", "block")?;
        let mut blocks = Vec::with_capacity(block_count.min(bytes.len() / BLOCK_RECORD_LEN));
        for _ in 0..block_count {
            blocks.push(StorageBlock {
                uncompressed_size: r.u32("block uncompressed size")?,
                compressed_size:   r.u32("block compressed size")?,
                flags:             r.u16("block flags")?,
            });
        }

        let entry_count = read_count(&mut r, "entry count", "directory")?;
        let mut directory = Vec::with_capacity(entry_count.min(bytes.len() / ENTRY_RECORD_MIN_LEN));
        for _ in 0..entry_count {
            directory.push(DirectoryEntry {
                offset: r.i64("entry offset")? as u64,
                size:   r.i64("entry size")? as u64,
                flags:  r.u32("entry flags")?,
                path:   r.cstring("entry path")?,
            });
        }

        Ok(Self { hash, blocks, directory })
    }

    /// Serialize the tables.  The hash field is refreshed only when the
    /// current hash is non-zero; an all-zero hash is written as zero.
    ///
    /// Returns the blob and the hash it carries.
    pub fn to_bytes(&self) -> Result<(Vec<u8>, [u8; HASH_LEN])> {
        let mut buf = Vec::with_capacity(
            HASH_LEN
                + 8
                + self.blocks.len() * BLOCK_RECORD_LEN
                + self.directory.iter().map(|e| ENTRY_RECORD_MIN_LEN + e.path.len()).sum::<usize>(),
        );
        buf.write_all(&[0u8; HASH_LEN])?;

        buf.write_i32::<BigEndian>(count_field("block count", self.blocks.len())?)?;
        for block in &self.blocks {
            buf.write_u32::<BigEndian>(block.uncompressed_size)?;
            buf.write_u32::<BigEndian>(block.compressed_size)?;
            buf.write_u16::<BigEndian>(block.flags)?;
        }

        buf.write_i32::<BigEndian>(count_field("entry count", self.directory.len())?)?;
        for entry in &self.directory {
            buf.write_i64::<BigEndian>(i64_field("entry offset", entry.offset)?)?;
            buf.write_i64::<BigEndian>(i64_field("entry size", entry.size)?)?;
            buf.write_u32::<BigEndian>(entry.flags)?;
            write_cstring(&mut buf, &entry.path)?;
        }

        let hash = if crypto::is_computed(&self.hash) {
            let fresh = crypto::blocks_info_hash(&buf[HASH_LEN..]);
            buf[..HASH_LEN].copy_from_slice(&fresh);
            fresh
        } else {
            [0u8; HASH_LEN]
        };
        Ok((buf, hash))
    }
}

pub fn logical_len(blocks: &[StorageBlock]) -> u64 {
    blocks.iter().map(|b| b.uncompressed_size as u64).sum()
}

fn read_count<R: Read>(
    r: &mut FieldReader<R>,
    field: &'static str,
    table: &'static str,
) -> Result<usize> {
    let count = r.i32(field)?;
    if count < 0 {
        return Err(FormatError::InvalidCount { table, count }.into());
    }
    Ok(count as usize)
}

fn count_field(field: &'static str, len: usize) -> Result<i32> {
    i32::try_from(len)
        .map_err(|_| BundleError::from(FormatError::FieldOverflow { field, bits: 31, value: len as u64 }))
}

fn i64_field(field: &'static str, value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| BundleError::from(FormatError::FieldOverflow { field, bits: 63, value }))
}

// ── Locating and decoding the blob ───────────────────────────────────────────

/// BlocksInfo as found in an archive, plus the alignment bytes skipped
/// before an inline blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedBlocksInfo {
    pub info:           BlocksInfo,
    pub header_padding: Vec<u8>,
}

/// Read, decompress and parse the BlocksInfo of a modern archive.
///
/// `reader` must be positioned right after the header.  On return it is at
/// the first byte of block data.
pub fn read_located<R: Read + Seek>(reader: &mut R, header: &Header) -> Result<LocatedBlocksInfo> {
    let compressed_size = header.compressed_blocks_info_size;
    let mut header_padding = Vec::new();

    let raw = if header.flags.info_at_end() {
        let resume = reader.stream_position()?;
        let archive_len = reader.seek(SeekFrom::End(0))?;
        let start = archive_len
            .checked_sub(compressed_size as u64)
            .ok_or(FormatError::BlocksInfoOutOfBounds { size: compressed_size, archive_len })?;
        debug!("BlocksInfo at end: offset {start}, {compressed_size} bytes");
        reader.seek(SeekFrom::Start(start))?;
        let raw = FieldReader::new(&mut *reader, start).bytes("blocks info", compressed_size as usize)?;
        reader.seek(SeekFrom::Start(resume))?;
        raw
    } else {
        let mut pos = reader.stream_position()?;
        if header.version >= ALIGNED_INFO_VERSION {
            let pad = padding_for(pos, 16) as usize;
            header_padding = FieldReader::new(&mut *reader, pos).bytes("header alignment", pad)?;
            pos += pad as u64;
        }
        debug!("BlocksInfo inline: offset {pos}, {compressed_size} bytes");
        FieldReader::new(&mut *reader, pos).bytes("blocks info", compressed_size as usize)?
    };

    let kind = header.flags.compression()?;
    let bytes = codec::decode(kind, &raw, header.uncompressed_blocks_info_size as usize)?;
    let info = BlocksInfo::from_bytes(&bytes)?;
    debug!(
        "BlocksInfo ({}): {} block(s), {} entr(ies)",
        kind.name(),
        info.blocks.len(),
        info.directory.len()
    );
    Ok(LocatedBlocksInfo { info, header_padding })
}

/// Parse the directory that opens a legacy logical stream:
/// `count:i32 { path\0 offset:u32 size:u32 } * count`.
pub fn read_legacy_directory<R: Read>(reader: R) -> Result<Vec<DirectoryEntry>> {
    let mut r = FieldReader::new(reader, 0);
    let count = read_count(&mut r, "entry count", "directory")?;
    let mut directory = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let path = r.cstring("entry path")?;
        directory.push(DirectoryEntry {
            offset: r.u32("entry offset")? as u64,
            size:   r.u32("entry size")? as u64,
            flags:  0,
            path,
        });
    }
    Ok(directory)
}
