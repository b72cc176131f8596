//! Bundle header: signature dispatch and the per-generation field layouts.
//!
//! # Layouts (all integers big-endian)
//!
//! Modern (`UnityFS`):
//! ```text
//! signature\0 version:u32 engine_version\0 engine_revision\0
//! size:i64 compressed_info:u32 uncompressed_info:u32 flags:u32
//! ```
//!
//! Legacy (`UnityRaw`, `UnityWeb`):
//! ```text
//! signature\0 version:u32 engine_version\0 engine_revision\0
//! [v>=4: hash:16 crc:u32] min_streamed:u32 header_size:u32
//! streamed_levels:u32 level_count:i32 (compressed:u32 uncompressed:u32)*
//! [v>=2: complete_file_size:u32] [v>=3: file_info_header_size:u32]
//! ```
//! The legacy reader then jumps to `header_size` no matter how many bytes the
//! fields above occupied.

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, WriteBytesExt};
use serde::Serialize;
use tracing::debug;

use crate::binary::{write_cstring, FieldReader};
use crate::blocks_info::StorageBlock;
use crate::codec::{CodecError, CompressionKind};
use crate::error::{FormatError, Result};

pub const SIGNATURE_FS:      &str = "UnityFS";
pub const SIGNATURE_RAW:     &str = "UnityRaw";
pub const SIGNATURE_WEB:     &str = "UnityWeb";
pub const SIGNATURE_ARCHIVE: &str = "UnityArchive";

/// Blocks and directory share one BlocksInfo blob.
pub const FLAG_BLOCKS_AND_DIRECTORY_COMBINED: u32 = 0x40;
/// BlocksInfo blob is stored at the end of the archive.
pub const FLAG_BLOCKS_INFO_AT_END: u32 = 0x80;

/// First format version whose inline BlocksInfo is 16-byte aligned.
pub const ALIGNED_INFO_VERSION: u32 = 7;

// ── Signature ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Signature {
    LegacyRaw,
    LegacyWeb,
    Modern,
    /// `UnityArchive` or any future token; the archive is inert.
    Unknown(String),
}

impl Signature {
    pub fn from_token(token: &str) -> Self {
        match token {
            SIGNATURE_FS  => Signature::Modern,
            SIGNATURE_RAW => Signature::LegacyRaw,
            SIGNATURE_WEB => Signature::LegacyWeb,
            other         => Signature::Unknown(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Signature::Modern     => SIGNATURE_FS,
            Signature::LegacyRaw  => SIGNATURE_RAW,
            Signature::LegacyWeb  => SIGNATURE_WEB,
            Signature::Unknown(s) => s,
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Signature::LegacyRaw | Signature::LegacyWeb)
    }
}

// ── ArchiveFlags ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ArchiveFlags(pub u32);

impl ArchiveFlags {
    pub fn compression(self) -> std::result::Result<CompressionKind, CodecError> {
        CompressionKind::from_flags(self.0)
    }

    pub fn info_at_end(self) -> bool {
        self.0 & FLAG_BLOCKS_INFO_AT_END != 0
    }

    pub fn combined(self) -> bool {
        self.0 & FLAG_BLOCKS_AND_DIRECTORY_COMBINED != 0
    }

    pub fn with_compression(self, kind: CompressionKind) -> Self {
        ArchiveFlags(kind.apply_to(self.0))
    }
}

// ── LegacyLayout ─────────────────────────────────────────────────────────────

/// Fields only the legacy generation carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegacyLayout {
    pub minimum_streamed_bytes: u32,
    /// Absolute offset where the payload begins.
    pub header_size:            u32,
    pub streamed_levels:        u32,
    pub level_count:            i32,
    /// The last level's sizes; earlier levels are read and dropped.
    pub block:                  StorageBlock,
}

// ── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Header {
    pub signature:                     Signature,
    pub version:                       u32,
    pub engine_version:                String,
    pub engine_revision:               String,
    /// Total archive size in bytes (modern only).
    pub size:                          u64,
    pub compressed_blocks_info_size:   u32,
    pub uncompressed_blocks_info_size: u32,
    pub flags:                         ArchiveFlags,
    pub legacy:                        Option<LegacyLayout>,
}

impl Header {
    /// Header of an inert archive whose signature this build does not know.
    pub fn inert(token: String) -> Self {
        Self {
            signature:                     Signature::Unknown(token),
            version:                       0,
            engine_version:                String::new(),
            engine_revision:               String::new(),
            size:                          0,
            compressed_blocks_info_size:   0,
            uncompressed_blocks_info_size: 0,
            flags:                         ArchiveFlags::default(),
            legacy:                        None,
        }
    }

    /// Parse the header from the start of `reader`.
    ///
    /// On return the reader is positioned at the first byte after the header
    /// (modern), at the declared header size (legacy), or just after the
    /// signature token (unknown).
    pub fn read<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let start = reader.stream_position()?;
        let mut r = FieldReader::new(&mut *reader, start);
        let token = r.cstring("signature")?;
        let signature = Signature::from_token(&token);
        debug!("Bundle signature: {token:?}");

        let header = match signature {
            Signature::Unknown(_) => Header::inert(token),
            Signature::Modern => {
                let version         = r.u32("version")?;
                let engine_version  = r.cstring("engine version")?;
                let engine_revision = r.cstring("engine revision")?;
                let size            = r.i64("archive size")? as u64;
                let compressed      = r.u32("compressed blocks info size")?;
                let uncompressed    = r.u32("uncompressed blocks info size")?;
                let flags           = ArchiveFlags(r.u32("flags")?);
                Header {
                    signature,
                    version,
                    engine_version,
                    engine_revision,
                    size,
                    compressed_blocks_info_size:   compressed,
                    uncompressed_blocks_info_size: uncompressed,
                    flags,
                    legacy: None,
                }
            }
            Signature::LegacyRaw | Signature::LegacyWeb => {
                let version         = r.u32("version")?;
                let engine_version  = r.cstring("engine version")?;
                let engine_revision = r.cstring("engine revision")?;
                if version >= 4 {
                    r.array::<16>("legacy hash")?;
                    r.u32("legacy crc")?;
                }
                let minimum_streamed_bytes = r.u32("minimum streamed bytes")?;
                let header_size            = r.u32("header size")?;
                let streamed_levels        = r.u32("streamed levels")?;
                let level_count            = r.i32("level count")?;

                let block_flags = if signature == Signature::LegacyWeb { 1 } else { 0 };
                let mut block = StorageBlock::default();
                for _ in 0..level_count.max(0) {
                    block = StorageBlock {
                        compressed_size:   r.u32("level compressed size")?,
                        uncompressed_size: r.u32("level uncompressed size")?,
                        flags:             block_flags,
                    };
                }
                if version >= 2 {
                    r.u32("complete file size")?;
                }
                if version >= 3 {
                    r.u32("file info header size")?;
                }
                debug!(
                    "Legacy header v{version}: {level_count} level(s), header size {header_size}"
                );
                Header {
                    signature,
                    version,
                    engine_version,
                    engine_revision,
                    size: 0,
                    compressed_blocks_info_size:   0,
                    uncompressed_blocks_info_size: 0,
                    flags: ArchiveFlags::default(),
                    legacy: Some(LegacyLayout {
                        minimum_streamed_bytes,
                        header_size,
                        streamed_levels,
                        level_count,
                        block,
                    }),
                }
            }
        };
        drop(r);

        if let Some(legacy) = &header.legacy {
            reader.seek(SeekFrom::Start(start + legacy.header_size as u64))?;
        }
        Ok(header)
    }

    /// Serialize the header.  Only the modern family has a write path; an
    /// unknown signature writes its token and nothing else.
    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        match &self.signature {
            Signature::LegacyRaw | Signature::LegacyWeb => {
                return Err(FormatError::ReadOnlyFormat(self.signature.as_str().to_owned()).into());
            }
            Signature::Unknown(token) => {
                write_cstring(&mut writer, token)?;
            }
            Signature::Modern => {
                write_cstring(&mut writer, SIGNATURE_FS)?;
                writer.write_u32::<BigEndian>(self.version)?;
                write_cstring(&mut writer, &self.engine_version)?;
                write_cstring(&mut writer, &self.engine_revision)?;
                writer.write_i64::<BigEndian>(self.size as i64)?;
                writer.write_u32::<BigEndian>(self.compressed_blocks_info_size)?;
                writer.write_u32::<BigEndian>(self.uncompressed_blocks_info_size)?;
                writer.write_u32::<BigEndian>(self.flags.0)?;
            }
        }
        Ok(())
    }

    /// Serialized length of a modern header.
    pub fn encoded_len(&self) -> u64 {
        let strings = self.signature.as_str().len()
            + self.engine_version.len()
            + self.engine_revision.len()
            + 3;
        match self.signature {
            Signature::Modern => (strings + 4 + 8 + 4 + 4 + 4) as u64,
            _                 => (self.signature.as_str().len() + 1) as u64,
        }
    }
}
