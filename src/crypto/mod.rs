//! BlocksInfo integrity hash.
//!
//! The BlocksInfo blob opens with a 16-byte hash field.  When a writer
//! refreshes it, the value is the first 16 bytes of SHA-256 over the blob
//! *after* the hash field:
//!
//! ```text
//! hash = SHA-256(blob[16..])[..16]
//! ```
//!
//! An all-zero hash means "not computed" and is never replaced.

use sha2::{Digest, Sha256};

/// Byte length of the BlocksInfo hash field.
pub const HASH_LEN: usize = 16;

/// Hash over the serialized tables that follow the hash field.
pub fn blocks_info_hash(tables: &[u8]) -> [u8; HASH_LEN] {
    let digest = Sha256::digest(tables);
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&digest[..HASH_LEN]);
    out
}

/// `true` when the hash field carries a value that must be kept current.
#[inline]
pub fn is_computed(hash: &[u8; HASH_LEN]) -> bool {
    hash.iter().any(|&b| b != 0)
}
