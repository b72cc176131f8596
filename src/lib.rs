pub mod error;
pub mod binary;
pub mod codec;
pub mod crypto;
pub mod header;
pub mod blocks_info;
pub mod block;
pub mod io_stream;
pub mod entry;
pub mod writer;
pub mod archive;

pub use error::{BundleError, FormatError, Result};
pub use codec::{CodecError, CompressionKind, decode, encode};
pub use header::{ArchiveFlags, Header, Signature};
pub use blocks_info::{BlocksInfo, DirectoryEntry, StorageBlock};
pub use io_stream::{LogicalStream, SpillPolicy, DEFAULT_MEMORY_THRESHOLD};
pub use entry::{Entry, EntryStream};
pub use writer::{write_bundle, WriteOptions};
pub use archive::{Archive, ReadOptions};
