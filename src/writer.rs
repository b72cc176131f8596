//! Archive writer: re-packs entry streams into a modern (`UnityFS`) bundle.
//!
//! # Pipeline
//! 1. Concatenate entry content in directory order into a staging stream,
//!    recording each entry's new offset and size.
//! 2. Cut the staging stream at the original block boundaries and compress
//!    each chunk with its block's codec (or the override).
//! 3. Rebuild BlocksInfo from the new tables; the hash is refreshed only if
//!    the original was non-zero.
//! 4. Emit header, then BlocksInfo and blocks in the order the archive flags
//!    dictate.
//!
//! The compressed size of the output is not expected to match the input;
//! only the decoded content is.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use tracing::debug;

use crate::binary::padding_for;
use crate::block::encode_block;
use crate::blocks_info::{BlocksInfo, DirectoryEntry, StorageBlock};
use crate::codec::{self, CompressionKind, COMPRESSION_MASK};
use crate::crypto::HASH_LEN;
use crate::entry::Entry;
use crate::error::{BundleError, FormatError, Result};
use crate::header::{Header, Signature, ALIGNED_INFO_VERSION};
use crate::io_stream::{LogicalStream, SpillPolicy, DEFAULT_MEMORY_THRESHOLD};

/// Chunk size for surplus data when there is no original block to copy.
pub const DEFAULT_BLOCK_SIZE: u32 = 128 * 1024;

// ── WriteOptions ─────────────────────────────────────────────────────────────

/// Configuration for [`write_bundle`].
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Replace the compression kind of every block and of the BlocksInfo blob.
    pub compression:      Option<CompressionKind>,
    /// Staging streams of this many bytes or more use temporary files.
    pub memory_threshold: u64,
    pub temp_dir:         Option<PathBuf>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            compression:      None,
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            temp_dir:         None,
        }
    }
}

impl WriteOptions {
    /// Options that store every block and the BlocksInfo uncompressed.
    pub fn uncompressed() -> Self {
        Self { compression: Some(CompressionKind::None), ..Self::default() }
    }

    pub fn spill_policy(&self) -> SpillPolicy {
        SpillPolicy { threshold: self.memory_threshold, temp_dir: self.temp_dir.clone() }
    }
}

// ── Inputs / outputs ─────────────────────────────────────────────────────────

/// The tables a rewrite starts from, as read from the original archive and
/// possibly edited by the caller.
#[derive(Debug, Clone, Copy)]
pub struct BundleParts<'a> {
    pub header:         &'a Header,
    pub hash:           [u8; HASH_LEN],
    pub blocks:         &'a [StorageBlock],
    pub directory:      &'a [DirectoryEntry],
    /// Alignment bytes captured between header and inline BlocksInfo.
    pub header_padding: &'a [u8],
}

/// What was actually written.
#[derive(Debug, Clone)]
pub struct WrittenLayout {
    pub header:         Header,
    pub info:           BlocksInfo,
    pub header_padding: Vec<u8>,
}

// ── Writer ───────────────────────────────────────────────────────────────────

pub fn write_bundle<W: Write>(
    mut writer: W,
    parts:      BundleParts<'_>,
    entries:    &mut [Entry],
    opts:       &WriteOptions,
) -> Result<WrittenLayout> {
    let header = parts.header;
    match &header.signature {
        Signature::Modern => {}
        Signature::LegacyRaw | Signature::LegacyWeb => {
            return Err(FormatError::ReadOnlyFormat(header.signature.as_str().to_owned()).into());
        }
        Signature::Unknown(_) => {
            // Inert archive: the signature token is all there is.
            header.write(&mut writer)?;
            writer.flush()?;
            return Ok(WrittenLayout {
                header:         header.clone(),
                info:           BlocksInfo::default(),
                header_padding: Vec::new(),
            });
        }
    }
    if entries.len() != parts.directory.len() {
        return Err(FormatError::EntryCountMismatch {
            expected: parts.directory.len(),
            supplied: entries.len(),
        }
        .into());
    }

    let policy = opts.spill_policy();
    let flags = match opts.compression {
        Some(kind) => header.flags.with_compression(kind),
        None       => header.flags,
    };

    // 1. Stage entry content.
    let (mut staging, directory) = stage_entries(parts.directory, entries, &policy)?;
    let staged_len = staging.byte_len()?;

    // 2. Re-chunk and compress.
    let fallback_flags = (flags.0 & COMPRESSION_MASK) as u16;
    let layout = rechunk(parts.blocks, staged_len, fallback_flags);
    let mut payload = LogicalStream::for_size(staged_len, &policy)?;
    let mut blocks = Vec::with_capacity(layout.len());
    let mut chunk = Vec::new();
    for (size, block_flags) in layout {
        let block_flags = match opts.compression {
            Some(kind) => kind.apply_to(block_flags as u32) as u16,
            None       => block_flags,
        };
        chunk.resize(size as usize, 0);
        staging.read_exact(&mut chunk)?;
        let (block, bytes) = encode_block(&chunk, block_flags)?;
        payload.write_all(&bytes)?;
        blocks.push(block);
    }
    drop(staging);

    // 3. BlocksInfo.
    let mut info = BlocksInfo { hash: parts.hash, blocks, directory };
    let (info_bytes, hash) = info.to_bytes()?;
    info.hash = hash;
    let info_packed = codec::encode(flags.compression()?, &info_bytes)?;

    // 4. Header.
    let mut out_header = header.clone();
    out_header.flags = flags;
    out_header.compressed_blocks_info_size = u32_len("compressed blocks info size", info_packed.len())?;
    out_header.uncompressed_blocks_info_size = u32_len("uncompressed blocks info size", info_bytes.len())?;

    let header_len = out_header.encoded_len();
    let at_end = flags.info_at_end();
    let header_padding = if !at_end && out_header.version >= ALIGNED_INFO_VERSION {
        let need = padding_for(header_len, 16) as usize;
        if parts.header_padding.len() == need {
            parts.header_padding.to_vec()
        } else {
            vec![0u8; need]
        }
    } else {
        Vec::new()
    };
    let payload_len = payload.byte_len()?;
    out_header.size = header_len + header_padding.len() as u64 + info_packed.len() as u64 + payload_len;

    // 5. Emit.
    out_header.write(&mut writer)?;
    payload.seek(SeekFrom::Start(0))?;
    if at_end {
        io::copy(&mut payload, &mut writer)?;
        writer.write_all(&info_packed)?;
    } else {
        writer.write_all(&header_padding)?;
        writer.write_all(&info_packed)?;
        io::copy(&mut payload, &mut writer)?;
    }
    writer.flush()?;

    debug!(
        "Wrote bundle: {} bytes, {} block(s), {} entr(ies), BlocksInfo {} -> {} bytes",
        out_header.size,
        info.blocks.len(),
        info.directory.len(),
        info_bytes.len(),
        info_packed.len()
    );
    Ok(WrittenLayout { header: out_header, info, header_padding })
}

/// Concatenate every entry stream, from its start, in directory order.
fn stage_entries(
    directory: &[DirectoryEntry],
    entries:   &mut [Entry],
    policy:    &SpillPolicy,
) -> Result<(LogicalStream, Vec<DirectoryEntry>)> {
    let mut total = 0u64;
    for entry in entries.iter() {
        total += entry.stream.byte_len()?;
    }

    let mut staging = LogicalStream::for_size(total, policy)?;
    let mut out = Vec::with_capacity(directory.len());
    for (node, entry) in directory.iter().zip(entries.iter_mut()) {
        let offset = staging.stream_position()?;
        entry.stream.seek(SeekFrom::Start(0))?;
        let size = io::copy(&mut entry.stream, &mut staging)?;
        entry.stream.seek(SeekFrom::Start(0))?;
        out.push(DirectoryEntry { offset, size, flags: node.flags, path: node.path.clone() });
    }
    staging.flush()?;
    staging.seek(SeekFrom::Start(0))?;
    Ok((staging, out))
}

/// Block boundaries for `total` staged bytes.
///
/// Original uncompressed sizes are reused in order.  If the content shrank
/// the trailing boundaries are cut; if it grew, the surplus is split into
/// extra blocks the size of the last original block (or
/// [`DEFAULT_BLOCK_SIZE`] with `fallback_flags` when there is none).
pub fn rechunk(original: &[StorageBlock], total: u64, fallback_flags: u16) -> Vec<(u32, u16)> {
    let mut out = Vec::with_capacity(original.len());
    let mut remaining = total;
    for block in original.iter().filter(|b| b.uncompressed_size > 0) {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(block.uncompressed_size as u64);
        out.push((take as u32, block.flags));
        remaining -= take;
    }

    let (size, flags) = original
        .iter()
        .rev()
        .find(|b| b.uncompressed_size > 0)
        .map(|b| (b.uncompressed_size, b.flags))
        .unwrap_or((DEFAULT_BLOCK_SIZE, fallback_flags));
    while remaining > 0 {
        let take = remaining.min(size as u64);
        out.push((take as u32, flags));
        remaining -= take;
    }
    out
}

fn u32_len(field: &'static str, len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| BundleError::from(FormatError::FieldOverflow { field, bits: 32, value: len as u64 }))
}
