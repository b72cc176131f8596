use bundlefs::binary::{padding_for, write_cstring};
use bundlefs::crypto::blocks_info_hash;
use bundlefs::entry::EntryStream;
use bundlefs::header::{FLAG_BLOCKS_AND_DIRECTORY_COMBINED, FLAG_BLOCKS_INFO_AT_END};
use bundlefs::io_stream::Backing;
use bundlefs::{
    encode, Archive, ArchiveFlags, BlocksInfo, BundleError, CompressionKind, DirectoryEntry,
    FormatError, Header, ReadOptions, Signature, StorageBlock, WriteOptions,
};
use byteorder::{BigEndian, WriteBytesExt};
use sha2::{Digest, Sha256};
use std::io::Cursor;

// ── Fixture builder ──────────────────────────────────────────────────────────

/// Hand-assembled `UnityFS` archive.
struct Fixture {
    version:   u32,
    flags:     u32,
    hash:      [u8; 16],
    padding:   u8,
    /// Logical-stream chunks and the codec each is stored with.
    chunks:    Vec<(Vec<u8>, CompressionKind)>,
    directory: Vec<DirectoryEntry>,
}

impl Fixture {
    fn new(flags: u32, chunks: Vec<(Vec<u8>, CompressionKind)>, directory: Vec<DirectoryEntry>) -> Self {
        Self { version: 6, flags, hash: [0u8; 16], padding: 0, chunks, directory }
    }

    fn header(&self) -> Header {
        Header {
            signature:                     Signature::Modern,
            version:                       self.version,
            engine_version:                "5.x.x".into(),
            engine_revision:               "2020.3.1f1".into(),
            size:                          0,
            compressed_blocks_info_size:   0,
            uncompressed_blocks_info_size: 0,
            flags:                         ArchiveFlags(self.flags),
            legacy:                        None,
        }
    }

    fn build(&self) -> Vec<u8> {
        let mut blocks = Vec::new();
        let mut payload = Vec::new();
        for (data, kind) in &self.chunks {
            let packed = encode(*kind, data).unwrap();
            blocks.push(StorageBlock {
                compressed_size:   packed.len() as u32,
                uncompressed_size: data.len() as u32,
                flags:             kind.apply_to(0) as u16,
            });
            payload.extend_from_slice(&packed);
        }

        let info = BlocksInfo { hash: self.hash, blocks, directory: self.directory.clone() };
        let (mut blob, _) = info.to_bytes().unwrap();
        // Store the fixture hash as-is, stale or not.
        blob[..16].copy_from_slice(&self.hash);
        let info_kind = CompressionKind::from_flags(self.flags).unwrap();
        let packed_info = encode(info_kind, &blob).unwrap();

        let mut header = self.header();
        header.compressed_blocks_info_size = packed_info.len() as u32;
        header.uncompressed_blocks_info_size = blob.len() as u32;
        let at_end = self.flags & FLAG_BLOCKS_INFO_AT_END != 0;
        let pad = if !at_end && self.version >= 7 {
            padding_for(header.encoded_len(), 16) as usize
        } else {
            0
        };
        header.size = header.encoded_len() + (pad + packed_info.len() + payload.len()) as u64;

        let mut out = Vec::new();
        header.write(&mut out).unwrap();
        if at_end {
            out.extend_from_slice(&payload);
            out.extend_from_slice(&packed_info);
        } else {
            out.extend(std::iter::repeat(self.padding).take(pad));
            out.extend_from_slice(&packed_info);
            out.extend_from_slice(&payload);
        }
        out
    }
}

fn node(path: &str, offset: u64, size: u64) -> DirectoryEntry {
    DirectoryEntry { offset, size, flags: 4, path: path.into() }
}

fn cab(len: usize) -> Vec<u8> {
    b"CAB-3f1e0c9a".iter().cycle().take(len).copied().collect()
}

fn open(bytes: Vec<u8>) -> Archive {
    Archive::from_reader(Cursor::new(bytes), &ReadOptions::default()).unwrap()
}

fn rewrite(ar: &mut Archive, opts: &WriteOptions) -> Vec<u8> {
    let mut out = Vec::new();
    ar.write(&mut out, opts).unwrap();
    out
}

fn contents(ar: &mut Archive) -> Vec<(String, Vec<u8>)> {
    ar.entries_mut()
        .iter_mut()
        .map(|e| (e.name.clone(), e.stream.read_all().unwrap()))
        .collect()
}

// ── Reading ──────────────────────────────────────────────────────────────────

#[test]
fn single_uncompressed_block() {
    let data = cab(64);
    let fx = Fixture::new(
        FLAG_BLOCKS_AND_DIRECTORY_COMBINED,
        vec![(data.clone(), CompressionKind::None)],
        vec![node("CAB-3f1e0c9a", 0, 64)],
    );
    let mut ar = open(fx.build());

    assert_eq!(ar.signature(), &Signature::Modern);
    assert_eq!(ar.blocks().len(), 1);
    assert_eq!(ar.logical_len(), 64);
    assert_eq!(ar.entries().len(), 1);
    let entry = ar.entry_mut("CAB-3f1e0c9a").unwrap();
    assert_eq!(entry.stream.backing(), Backing::Memory);
    assert_eq!(entry.stream.read_all().unwrap(), data);
}

#[test]
fn lz4hc_block_and_info() {
    let data = cab(5000);
    let fx = Fixture::new(
        FLAG_BLOCKS_AND_DIRECTORY_COMBINED | 3,
        vec![(data.clone(), CompressionKind::Lz4Hc)],
        vec![node("archive:/CAB-3f1e0c9a/CAB-3f1e0c9a", 0, 4000), node("CAB-3f1e0c9a.resS", 4000, 1000)],
    );
    let mut ar = open(fx.build());

    assert!(ar.blocks()[0].compressed_size < 5000);
    assert_eq!(ar.blocks()[0].compression().unwrap(), CompressionKind::Lz4Hc);
    let got = contents(&mut ar);
    assert_eq!(got[0].0, "CAB-3f1e0c9a");
    assert_eq!(got[0].1, data[..4000]);
    assert_eq!(got[1].1, data[4000..]);
}

#[test]
fn info_location_does_not_change_tables() {
    let chunks = vec![(cab(300), CompressionKind::Lz4), (cab(200), CompressionKind::Lzma)];
    let directory = vec![node("a", 0, 120), node("b", 120, 380)];
    let inline = Fixture::new(FLAG_BLOCKS_AND_DIRECTORY_COMBINED | 2, chunks.clone(), directory.clone());
    let at_end = Fixture::new(
        FLAG_BLOCKS_AND_DIRECTORY_COMBINED | FLAG_BLOCKS_INFO_AT_END | 2,
        chunks,
        directory,
    );

    let mut a = open(inline.build());
    let mut b = open(at_end.build());
    assert_eq!(a.blocks(), b.blocks());
    assert_eq!(a.directory(), b.directory());
    assert_eq!(contents(&mut a), contents(&mut b));
}

#[test]
fn aligned_info_replays_padding() {
    let mut fx = Fixture::new(
        FLAG_BLOCKS_AND_DIRECTORY_COMBINED | 3,
        vec![(cab(256), CompressionKind::Lz4Hc)],
        vec![node("CAB-aligned", 0, 256)],
    );
    fx.version = 7;
    fx.padding = 0xCD;
    let header_len = fx.header().encoded_len() as usize;
    let pad = padding_for(header_len as u64, 16) as usize;
    assert!(pad > 0);

    let mut ar = open(fx.build());
    assert_eq!(ar.header_padding(), vec![0xCD; pad].as_slice());
    let out = rewrite(&mut ar, &WriteOptions::default());
    assert_eq!(&out[header_len..header_len + pad], vec![0xCD; pad].as_slice());
    assert_eq!(contents(&mut open(out)), contents(&mut ar));
}

#[test]
fn legacy_raw_keeps_last_level() {
    // Logical stream: directory, then entry data.
    let body = cab(40);
    let mut dir = Vec::new();
    dir.write_i32::<BigEndian>(1).unwrap();
    write_cstring(&mut dir, "CAB-legacy").unwrap();
    let data_offset = dir.len() as u32 + 8;
    dir.write_u32::<BigEndian>(data_offset).unwrap();
    dir.write_u32::<BigEndian>(body.len() as u32).unwrap();
    let mut payload = dir;
    payload.extend_from_slice(&body);

    let legacy_header = |header_size: u32| {
        let mut buf = Vec::new();
        write_cstring(&mut buf, "UnityRaw").unwrap();
        buf.write_u32::<BigEndian>(3).unwrap();
        write_cstring(&mut buf, "3.x.x").unwrap();
        write_cstring(&mut buf, "4.7.2f1").unwrap();
        buf.write_u32::<BigEndian>(0).unwrap();
        buf.write_u32::<BigEndian>(header_size).unwrap();
        buf.write_u32::<BigEndian>(1).unwrap();
        buf.write_i32::<BigEndian>(3).unwrap();
        for (c, u) in [(7u32, 9u32), (1000, 2000), (payload.len() as u32, payload.len() as u32)] {
            buf.write_u32::<BigEndian>(c).unwrap();
            buf.write_u32::<BigEndian>(u).unwrap();
        }
        buf.write_u32::<BigEndian>(0).unwrap();
        buf.write_u32::<BigEndian>(0).unwrap();
        buf
    };
    let header_size = legacy_header(0).len() as u32 + 4;
    let mut bytes = legacy_header(header_size);
    bytes.resize(header_size as usize, 0);
    bytes.extend_from_slice(&payload);

    let mut ar = open(bytes);
    assert_eq!(ar.signature(), &Signature::LegacyRaw);
    assert_eq!(ar.blocks(), &[StorageBlock {
        compressed_size:   payload.len() as u32,
        uncompressed_size: payload.len() as u32,
        flags:             0,
    }]);
    assert_eq!(ar.directory()[0].path, "CAB-legacy");
    assert_eq!(contents(&mut ar), vec![("CAB-legacy".to_string(), body)]);

    let err = ar.write(Vec::new(), &WriteOptions::default()).unwrap_err();
    assert!(matches!(err, BundleError::Format(FormatError::ReadOnlyFormat(_))));
}

#[test]
fn legacy_web_v5_archive() {
    let body = cab(300);
    let mut logical = Vec::new();
    logical.write_i32::<BigEndian>(1).unwrap();
    write_cstring(&mut logical, "CAB-web").unwrap();
    let data_offset = logical.len() as u32 + 8;
    logical.write_u32::<BigEndian>(data_offset).unwrap();
    logical.write_u32::<BigEndian>(body.len() as u32).unwrap();
    logical.extend_from_slice(&body);
    let mut payload = Vec::new();
    lzma_rs::lzma_compress(&mut Cursor::new(&logical[..]), &mut payload).unwrap();

    let web_header = |header_size: u32| {
        let mut buf = Vec::new();
        write_cstring(&mut buf, "UnityWeb").unwrap();
        buf.write_u32::<BigEndian>(5).unwrap();
        write_cstring(&mut buf, "5.x.x").unwrap();
        write_cstring(&mut buf, "5.6.7f1").unwrap();
        buf.extend_from_slice(&[0x3C; 16]);
        buf.write_u32::<BigEndian>(0x1234_5678).unwrap();
        buf.write_u32::<BigEndian>(0).unwrap();
        buf.write_u32::<BigEndian>(header_size).unwrap();
        buf.write_u32::<BigEndian>(1).unwrap();
        buf.write_i32::<BigEndian>(2).unwrap();
        for (c, u) in [(11u32, 22u32), (payload.len() as u32, logical.len() as u32)] {
            buf.write_u32::<BigEndian>(c).unwrap();
            buf.write_u32::<BigEndian>(u).unwrap();
        }
        buf.write_u32::<BigEndian>(0).unwrap();
        buf.write_u32::<BigEndian>(0).unwrap();
        buf
    };
    let header_size = web_header(0).len() as u32;
    let mut bytes = web_header(header_size);
    bytes.extend_from_slice(&payload);

    let mut ar = open(bytes);
    assert_eq!(ar.signature(), &Signature::LegacyWeb);
    assert_eq!(ar.header().version, 5);
    assert_eq!(ar.blocks()[0].flags, 1);
    assert_eq!(ar.logical_len(), logical.len() as u64);
    assert_eq!(contents(&mut ar), vec![("CAB-web".to_string(), body)]);
}

#[test]
fn unity_archive_is_inert() {
    let mut ar = open(b"UnityArchive\0\x00\x01\x02".to_vec());
    assert_eq!(ar.signature(), &Signature::Unknown("UnityArchive".into()));
    assert!(ar.blocks().is_empty());
    assert!(ar.entries().is_empty());
    assert_eq!(rewrite(&mut ar, &WriteOptions::default()), b"UnityArchive\0");
}

#[test]
fn truncated_archive_never_panics() {
    let fx = Fixture::new(
        FLAG_BLOCKS_AND_DIRECTORY_COMBINED | 2,
        vec![(cab(200), CompressionKind::Lz4), (cab(100), CompressionKind::None)],
        vec![node("CAB-cut", 0, 300)],
    );
    let bytes = fx.build();
    for len in 0..bytes.len() {
        let result = Archive::from_reader(Cursor::new(bytes[..len].to_vec()), &ReadOptions::default());
        assert!(result.is_err(), "prefix of {len} bytes loaded");
    }
    let err = Archive::from_reader(Cursor::new(bytes[..10].to_vec()), &ReadOptions::default())
        .unwrap_err();
    assert!(matches!(err, BundleError::Format(FormatError::Truncated { .. })));
}

#[test]
fn entry_out_of_bounds_is_rejected() {
    let fx = Fixture::new(
        FLAG_BLOCKS_AND_DIRECTORY_COMBINED,
        vec![(cab(64), CompressionKind::None)],
        vec![node("CAB-oob", 60, 8)],
    );
    let err = Archive::from_reader(Cursor::new(fx.build()), &ReadOptions::default()).unwrap_err();
    assert!(matches!(err, BundleError::Format(FormatError::EntryOutOfBounds { index: 0, .. })));
}

#[test]
fn large_entries_spill_next_to_archive() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("level0.bundle");
    let fx = Fixture::new(
        FLAG_BLOCKS_AND_DIRECTORY_COMBINED | 2,
        vec![(cab(96), CompressionKind::Lz4)],
        vec![node("CAB-big", 0, 64), node("CAB-small", 64, 32)],
    );
    std::fs::write(&path, fx.build()).unwrap();

    let opts = ReadOptions { memory_threshold: 64, ..ReadOptions::for_archive(&path) };
    let mut ar = Archive::open_with_options(&path, &opts).unwrap();
    let spilled = dir.path().join("level0.bundle_unpacked").join("CAB-big");
    assert_eq!(ar.entries()[0].stream.path(), Some(spilled.as_path()));
    assert_eq!(ar.entries()[1].stream.backing(), Backing::Memory);
    assert_eq!(std::fs::read(&spilled).unwrap(), cab(96)[..64]);

    // Spilled entries are regular outputs and repack like any other.
    let out = rewrite(&mut ar, &WriteOptions::default());
    assert_eq!(contents(&mut open(out))[0].1, cab(96)[..64]);
    drop(ar);
    assert!(spilled.exists());
}

// ── Writing ──────────────────────────────────────────────────────────────────

#[test]
fn every_codec_round_trips() {
    for kind in CompressionKind::ALL {
        let fx = Fixture::new(
            FLAG_BLOCKS_AND_DIRECTORY_COMBINED | kind.apply_to(0),
            vec![(cab(1000), kind), (cab(700), kind)],
            vec![node("CAB-0", 0, 900), node("CAB-1", 900, 800)],
        );
        let mut ar = open(fx.build());
        let before = contents(&mut ar);
        let out = rewrite(&mut ar, &WriteOptions::default());

        let mut again = open(out);
        assert_eq!(contents(&mut again), before, "{}", kind.name());
        assert_eq!(again.directory(), ar.directory());
        let sizes: Vec<_> = again.blocks().iter().map(|b| b.uncompressed_size).collect();
        assert_eq!(sizes, vec![1000, 700]);
        assert!(again.blocks().iter().all(|b| b.compression().unwrap() == kind));
    }
}

#[test]
fn rewrite_keeps_info_at_end() {
    let fx = Fixture::new(
        FLAG_BLOCKS_AND_DIRECTORY_COMBINED | FLAG_BLOCKS_INFO_AT_END | 1,
        vec![(cab(512), CompressionKind::Lzma)],
        vec![node("CAB-end", 0, 512)],
    );
    let mut ar = open(fx.build());
    let out = rewrite(&mut ar, &WriteOptions::default());
    assert!(ar.header().flags.info_at_end());
    assert_eq!(ar.header().size, out.len() as u64);
    assert_eq!(contents(&mut open(out))[0].1, cab(512));
}

#[test]
fn nonzero_hash_is_recomputed() {
    let mut fx = Fixture::new(
        FLAG_BLOCKS_AND_DIRECTORY_COMBINED,
        vec![(cab(128), CompressionKind::None)],
        vec![node("CAB-hash", 0, 128)],
    );
    fx.hash = [0x5A; 16];
    let mut ar = open(fx.build());
    assert_eq!(ar.hash(), &[0x5A; 16]);
    let out = rewrite(&mut ar, &WriteOptions::default());

    let again = open(out);
    let tables = BlocksInfo {
        hash:      [0u8; 16],
        blocks:    again.blocks().to_vec(),
        directory: again.directory().to_vec(),
    };
    let (blob, _) = tables.to_bytes().unwrap();
    let digest = Sha256::digest(&blob[16..]);
    assert_eq!(again.hash()[..], digest[..16]);
    assert_eq!(again.hash(), &blocks_info_hash(&blob[16..]));
    assert_eq!(ar.hash(), again.hash());
}

#[test]
fn zero_hash_is_preserved() {
    let fx = Fixture::new(
        FLAG_BLOCKS_AND_DIRECTORY_COMBINED,
        vec![(cab(128), CompressionKind::None)],
        vec![node("CAB-zero", 0, 128)],
    );
    let mut ar = open(fx.build());
    let out = rewrite(&mut ar, &WriteOptions::default());
    assert_eq!(open(out).hash(), &[0u8; 16]);
}

#[test]
fn override_to_uncompressed() {
    let fx = Fixture::new(
        FLAG_BLOCKS_AND_DIRECTORY_COMBINED | 3,
        vec![(cab(2048), CompressionKind::Lz4Hc), (cab(1024), CompressionKind::Lzma)],
        vec![node("CAB-o", 0, 3072)],
    );
    let mut ar = open(fx.build());
    let before = contents(&mut ar);
    let out = rewrite(&mut ar, &WriteOptions::uncompressed());

    let mut again = open(out);
    assert_eq!(again.header().flags.compression().unwrap(), CompressionKind::None);
    assert!(again.header().flags.combined());
    for b in again.blocks() {
        assert_eq!(b.compression().unwrap(), CompressionKind::None);
        assert_eq!(b.compressed_size, b.uncompressed_size);
    }
    assert_eq!(contents(&mut again), before);
}

#[test]
fn grown_entry_adds_blocks() {
    let fx = Fixture::new(
        FLAG_BLOCKS_AND_DIRECTORY_COMBINED | 2,
        vec![(cab(100), CompressionKind::Lz4), (cab(50), CompressionKind::Lz4)],
        vec![node("CAB-a", 0, 100), node("CAB-b", 100, 50)],
    );
    let mut ar = open(fx.build());
    ar.entry_mut("CAB-a").unwrap().stream = EntryStream::from_bytes(cab(180));
    let out = rewrite(&mut ar, &WriteOptions::default());

    let mut again = open(out);
    let sizes: Vec<_> = again.blocks().iter().map(|b| b.uncompressed_size).collect();
    assert_eq!(sizes, vec![100, 50, 50, 30]);
    assert_eq!(again.directory()[1].offset, 180);
    assert_eq!(again.directory()[1].size, 50);
    assert_eq!(contents(&mut again)[0].1, cab(180));
}

#[test]
fn replacement_count_must_match() {
    let fx = Fixture::new(
        FLAG_BLOCKS_AND_DIRECTORY_COMBINED,
        vec![(cab(10), CompressionKind::None)],
        vec![node("CAB-only", 0, 10)],
    );
    let mut ar = open(fx.build());
    let err = ar.replace_entries(Vec::new()).unwrap_err();
    assert!(matches!(
        err,
        BundleError::Format(FormatError::EntryCountMismatch { expected: 1, supplied: 0 })
    ));

    let mut entries = ar.take_entries();
    assert!(ar.entries().is_empty());
    entries[0].stream = EntryStream::from_bytes(b"swapped".to_vec());
    ar.replace_entries(entries).unwrap();
    let out = rewrite(&mut ar, &WriteOptions::default());
    assert_eq!(contents(&mut open(out))[0].1, b"swapped");
}
