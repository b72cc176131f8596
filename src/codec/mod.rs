//! Codec dispatcher: the four compression kinds a bundle can declare.
//!
//! # Identity rules
//! A compression kind is the low 6 bits of either a storage block's `flags`
//! (u16) or the archive-level `flags` (u32).  Values 0..=3 are defined; the
//! rest of the 6-bit range is reserved and rejected with
//! [`CodecError::Unsupported`].
//!
//! # Payload formats
//! - `None`: payload stored verbatim.
//! - `Lzma`: 5-byte properties header followed by a raw LZMA stream.  The
//!   64-bit size field of the classic `.lzma` header is *absent*; the size
//!   comes from the block table.
//! - `Lz4` / `Lz4Hc`: one raw LZ4 block (no frame, no size prefix).  Both
//!   flags decode identically, and both encode through the same path.
//!
//! Every decode is checked against the declared uncompressed size.

use std::io::{self, BufRead, Cursor, Write};
use thiserror::Error;
use tracing::trace;

/// Mask selecting the compression kind from a block or archive flag word.
pub const COMPRESSION_MASK: u32 = 0x3F;

// ── CompressionKind ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionKind {
    None  = 0,
    Lzma  = 1,
    Lz4   = 2,
    Lz4Hc = 3,
}

impl CompressionKind {
    pub const ALL: [CompressionKind; 4] = [
        CompressionKind::None,
        CompressionKind::Lzma,
        CompressionKind::Lz4,
        CompressionKind::Lz4Hc,
    ];

    /// Extract the kind from the low 6 bits of a flag word.
    pub fn from_flags(flags: u32) -> Result<Self, CodecError> {
        match flags & COMPRESSION_MASK {
            0 => Ok(CompressionKind::None),
            1 => Ok(CompressionKind::Lzma),
            2 => Ok(CompressionKind::Lz4),
            3 => Ok(CompressionKind::Lz4Hc),
            other => Err(CodecError::Unsupported(other)),
        }
    }

    /// Replace the compression bits of `flags` with this kind.
    #[inline]
    pub fn apply_to(self, flags: u32) -> u32 {
        (flags & !COMPRESSION_MASK) | self as u32
    }

    /// Lower-case name used by the CLI and in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            CompressionKind::None  => "none",
            CompressionKind::Lzma  => "lzma",
            CompressionKind::Lz4   => "lz4",
            CompressionKind::Lz4Hc => "lz4hc",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none"  => Some(CompressionKind::None),
            "lzma"  => Some(CompressionKind::Lzma),
            "lz4"   => Some(CompressionKind::Lz4),
            "lz4hc" => Some(CompressionKind::Lz4Hc),
            _       => None,
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("{kind:?} compression failed: {reason}")]
    Compression { kind: CompressionKind, reason: String },
    #[error("{kind:?} decompression failed: {reason}")]
    Decompression { kind: CompressionKind, reason: String },
    #[error("decoded length mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("unsupported compression kind {0}")]
    Unsupported(u32),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn kind(&self) -> CompressionKind;
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
    /// `uncompressed_size` is the size declared by the container; codecs use
    /// it to pre-size output but the length check lives in [`decode`].
    fn decompress(&self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, CodecError>;
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn kind(&self) -> CompressionKind { CompressionKind::None }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress(&self, data: &[u8], _: usize) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
}

pub struct LzmaCodec;
impl Codec for LzmaCodec {
    fn kind(&self) -> CompressionKind { CompressionKind::Lzma }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let opts = lzma_rs::compress::Options {
            unpacked_size: lzma_rs::compress::UnpackedSize::SkipWritingToHeader,
        };
        let mut out = Vec::new();
        lzma_rs::lzma_compress_with_options(&mut Cursor::new(data), &mut out, &opts)
            .map_err(|e| CodecError::Compression { kind: self.kind(), reason: e.to_string() })?;
        Ok(out)
    }
    fn decompress(&self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, CodecError> {
        let opts = lzma_rs::decompress::Options {
            unpacked_size: lzma_rs::decompress::UnpackedSize::UseProvided(Some(uncompressed_size as u64)),
            ..Default::default()
        };
        let mut out = Vec::with_capacity(uncompressed_size.min(1 << 26));
        lzma_rs::lzma_decompress_with_options(&mut Cursor::new(data), &mut out, &opts)
            .map_err(|e| CodecError::Decompression { kind: self.kind(), reason: e.to_string() })?;
        Ok(out)
    }
}

/// Serves both `Lz4` and `Lz4Hc`: the wire format is the same raw block.
/// lz4_flex has no high-compression mode, so `Lz4Hc` blocks are written with
/// the fast compressor; they decode the same but come out somewhat larger.
pub struct Lz4Codec(pub CompressionKind);
impl Codec for Lz4Codec {
    fn kind(&self) -> CompressionKind { self.0 }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::block::compress(data))
    }
    fn decompress(&self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, CodecError> {
        lz4_flex::block::decompress(data, uncompressed_size)
            .map_err(|e| CodecError::Decompression { kind: self.kind(), reason: e.to_string() })
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve a kind to its built-in codec.
pub fn get_codec(kind: CompressionKind) -> Box<dyn Codec> {
    match kind {
        CompressionKind::None  => Box::new(NoneCodec),
        CompressionKind::Lzma  => Box::new(LzmaCodec),
        CompressionKind::Lz4   => Box::new(Lz4Codec(CompressionKind::Lz4)),
        CompressionKind::Lz4Hc => Box::new(Lz4Codec(CompressionKind::Lz4Hc)),
    }
}

/// Decode `data` and verify the result is exactly `uncompressed_size` bytes.
pub fn decode(kind: CompressionKind, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, CodecError> {
    let out = get_codec(kind).decompress(data, uncompressed_size)?;
    if out.len() != uncompressed_size {
        return Err(CodecError::SizeMismatch {
            expected: uncompressed_size as u64,
            actual:   out.len() as u64,
        });
    }
    trace!("{}: {} bytes -> {} bytes", kind.name(), data.len(), out.len());
    Ok(out)
}

pub fn encode(kind: CompressionKind, data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let out = get_codec(kind).compress(data)?;
    trace!("{}: {} bytes -> {} bytes", kind.name(), data.len(), out.len());
    Ok(out)
}

/// Decode a classic `.lzma` stream (properties + 64-bit size header), the
/// layout used by the single payload block of `UnityWeb` archives.
pub fn decode_lzma_alone(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    decode_lzma_alone_into(&mut Cursor::new(data), &mut out)?;
    Ok(out)
}

/// Streaming form of [`decode_lzma_alone`].
pub fn decode_lzma_alone_into<R: BufRead, W: Write>(reader: &mut R, writer: &mut W) -> Result<(), CodecError> {
    lzma_rs::lzma_decompress(reader, writer)
        .map_err(|e| CodecError::Decompression { kind: CompressionKind::Lzma, reason: e.to_string() })
}
