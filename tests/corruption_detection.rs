//! Corruption detection tests
//!
//! Damaged bundles must fail with a corrupt-class error, never hand a
//! handler bad data and never panic.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use resbundle::core::header::{ChunkHeader, DirectoryEntry, HEADER_SIZE};
use resbundle::{
    AddressWidth, BundleError, BundleReader, BundleWriter, ChunkInfo, ChunkSource, ChunkType,
    CompressionConfig, ErrorCode, Handlers, ResourceBlock, WriterConfig,
};
use std::io::Cursor;

const BLOB: u32 = 9;

fn accept_blobs<'h>() -> Handlers<'h> {
    Handlers::new().with(BLOB, |_: &ChunkInfo<'_>, _: &mut ResourceBlock| true)
}

fn sample(compression: CompressionConfig) -> Vec<u8> {
    let mut writer = BundleWriter::new(WriterConfig {
        address_width: AddressWidth::host(),
        compression,
    });
    writer
        .add_raw_binary_chunk("a", ChunkType::new(BLOB), &vec![0xAB; 3000])
        .unwrap();
    writer
        .add_chunk("b", ChunkType::new(BLOB), |b| {
            b.pointer("end").string("tail text").label("end").u32(1);
            Ok(())
        })
        .unwrap();
    writer.build_to_vec(0).unwrap()
}

fn read_all(bytes: Vec<u8>) -> resbundle::Result<usize> {
    let mut reader = BundleReader::new(Cursor::new(bytes))?;
    Ok(reader.read("", &accept_blobs())?.chunks.len())
}

/// Byte ranges holding stored chunk payloads
fn chunk_ranges(bytes: &[u8]) -> Vec<std::ops::Range<usize>> {
    let mut reader = BundleReader::new(Cursor::new(bytes.to_vec())).unwrap();
    let header = reader.peek_header().unwrap();
    let area = header.chunk_area_offset(header.address_width().unwrap());
    reader
        .directory()
        .unwrap()
        .iter()
        .map(|entry| {
            let start = area + entry.stored_offset as usize;
            start..start + entry.stored_size as usize
        })
        .collect()
}

#[test]
fn test_flipped_payload_bytes_are_detected() {
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    for compression in [CompressionConfig::none(), CompressionConfig::default()] {
        let clean = sample(compression);
        assert_eq!(read_all(clean.clone()).unwrap(), 2);

        for range in chunk_ranges(&clean) {
            for _ in 0..16 {
                let mut bytes = clean.clone();
                let at = rng.gen_range(range.clone());
                bytes[at] ^= 1 << rng.gen_range(0..8);

                let err = read_all(bytes).unwrap_err();
                assert!(
                    matches!(err, BundleError::ChecksumMismatch { .. }),
                    "unexpected error {:?}",
                    err
                );
                assert_eq!(err.code(), ErrorCode::CorruptError);
            }
        }
    }
}

#[test]
fn test_bad_magic() {
    let mut bytes = sample(CompressionConfig::default());
    bytes[0] = b'X';
    let err = read_all(bytes).unwrap_err();
    assert!(matches!(err, BundleError::InvalidMagic(_)));
    assert_eq!(err.code(), ErrorCode::CorruptError);
}

#[test]
fn test_newer_major_version_is_refused() {
    let mut bytes = sample(CompressionConfig::default());
    bytes[8..10].copy_from_slice(&2u16.to_le_bytes());
    assert!(matches!(
        read_all(bytes),
        Err(BundleError::UnsupportedVersion { major: 2, .. })
    ));
}

#[test]
fn test_missing_width_flag_is_refused() {
    let mut bytes = sample(CompressionConfig::default());
    bytes[4..8].copy_from_slice(&0u32.to_le_bytes());
    assert!(read_all(bytes).is_err());
}

#[test]
fn test_truncated_bundles_fail_cleanly() {
    let clean = sample(CompressionConfig::default());
    for len in [0, 7, HEADER_SIZE - 1, HEADER_SIZE + 3, clean.len() / 2, clean.len() - 1] {
        let err = read_all(clean[..len].to_vec()).unwrap_err();
        assert_ne!(err.code(), ErrorCode::Okay);
        assert_ne!(err.code(), ErrorCode::NotFound, "length {}", len);
    }
}

#[test]
fn test_fixup_pointing_outside_data_is_refused() {
    let width = AddressWidth::host();
    let mut bytes = sample(CompressionConfig::none());

    let mut reader = BundleReader::new(Cursor::new(bytes.clone())).unwrap();
    let header = reader.peek_header().unwrap();
    let area = header.chunk_area_offset(width);
    let index = reader
        .directory()
        .unwrap()
        .iter()
        .position(|entry| entry.name == "b")
        .unwrap();

    let entry_at = HEADER_SIZE + index * DirectoryEntry::size(width);
    let mut entry = DirectoryEntry::from_bytes(&bytes[entry_at..], width).unwrap();
    let chunk_start = area + entry.stored_offset as usize;
    let chunk_end = chunk_start + entry.stored_size as usize;
    let chunk = ChunkHeader::from_bytes(&bytes[chunk_start..chunk_end], width).unwrap();

    // Point the first relocated slot past the end of the data region
    let fixup_at = chunk_start + chunk.fixup_offset as usize;
    let slot = width.read(&bytes, fixup_at).unwrap() as usize;
    let slot_at = chunk_start + chunk.data_offset as usize + slot;
    width
        .write_into(&mut bytes, slot_at, chunk.data_size + 64)
        .unwrap();

    // Re-seal the checksums so only the fixup check can catch it
    let crc = crc32fast::hash(&bytes[chunk_start..chunk_end]);
    entry.stored_crc = crc;
    entry.uncompressed_crc = crc;
    let mut encoded = Vec::new();
    entry.write_to(&mut encoded, width).unwrap();
    bytes[entry_at..entry_at + encoded.len()].copy_from_slice(&encoded);

    let mut reader = BundleReader::new(Cursor::new(bytes)).unwrap();
    let err = reader.read("b", &accept_blobs()).unwrap_err();
    assert!(
        matches!(err, BundleError::FixupOutOfBounds { .. }),
        "unexpected error {:?}",
        err
    );
    assert_eq!(err.code(), ErrorCode::CorruptError);
}

#[test]
fn test_oversized_chunk_is_refused_before_reading() {
    let bytes = sample(CompressionConfig::none());
    let mut reader = BundleReader::new(Cursor::new(bytes))
        .unwrap()
        .with_max_chunk_size(1024);
    let err = reader.read("a", &accept_blobs()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::MemoryError);
}

#[test]
fn test_random_garbage_never_panics() {
    let mut rng = StdRng::seed_from_u64(1);
    for _ in 0..200 {
        let len = rng.gen_range(0..512);
        let mut bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        if bytes.len() >= 4 && rng.gen_bool(0.5) {
            bytes[..4].copy_from_slice(b"RBDL");
        }
        assert!(read_all(bytes).is_err());
    }
}
