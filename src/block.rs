use std::io::Read;

use tracing::trace;

use crate::binary::FieldReader;
use crate::blocks_info::StorageBlock;
use crate::codec::{self, CompressionKind};
use crate::error::{BundleError, FormatError, Result};

/// Read one storage block's payload from `reader` and decode it.
///
/// `offset` is the absolute archive offset of the payload, used only for
/// error context.
pub fn decode_block<R: Read>(reader: R, block: &StorageBlock, offset: u64) -> Result<Vec<u8>> {
    let kind = block.compression()?;
    let payload = FieldReader::new(reader, offset).bytes("block payload", block.compressed_size as usize)?;
    trace!(
        "Block @{offset}: {} {} -> {} bytes",
        kind.name(),
        block.compressed_size,
        block.uncompressed_size
    );
    Ok(codec::decode(kind, &payload, block.uncompressed_size as usize)?)
}

/// Compress `data` as a block carrying `flags`, whose low 6 bits select the codec.
pub fn encode_block(data: &[u8], flags: u16) -> Result<(StorageBlock, Vec<u8>)> {
    let kind = CompressionKind::from_flags(flags as u32)?;
    let payload = codec::encode(kind, data)?;
    let block = StorageBlock {
        compressed_size:   u32_field("block compressed size", payload.len())?,
        uncompressed_size: u32_field("block uncompressed size", data.len())?,
        flags,
    };
    Ok((block, payload))
}

fn u32_field(field: &'static str, len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| BundleError::from(FormatError::FieldOverflow { field, bits: 32, value: len as u64 }))
}
