//! Encrypted-file invariants: random access, persistence, stamps.

use std::path::PathBuf;
use std::sync::Arc;

use keel_crypt::{CipherSuite, EncryptedFile, FileError, FileMode, SymmetricKey};

fn master() -> SymmetricKey {
    SymmetricKey::from_bytes(&[0x33; 32])
}

fn new_file(chunk_size: u32) -> EncryptedFile {
    let mut f = EncryptedFile::new(master(), Arc::new(CipherSuite::aes256_gcm()));
    if chunk_size > 0 {
        f.processor_mut().set_chunk_max_size(chunk_size);
    }
    f
}

fn temp_path(tag: &str) -> PathBuf {
    tempfile::Builder::new()
        .prefix(tag)
        .tempdir()
        .unwrap()
        .into_path()
        .join("data.kelc")
}

#[test]
fn random_writes_read_back_across_cache_capacities() {
    // Positions spanning chunk boundaries; every cache capacity ≥ 1
    // must produce identical results.
    let writes: &[(u64, &[u8])] = &[
        (0, b"alpha"),
        (60, b"boundary-crossing-write"),
        (200, b"tail"),
        (64, b"exact-boundary"),
        (10, b"overwrite"),
    ];

    for capacity in [1usize, 2, 8] {
        let path = temp_path("rand");
        let mut f = new_file(64);
        f.set_max_cached_chunks(capacity);
        f.open(&path, FileMode::WriteNew).unwrap();
        for (pos, data) in writes {
            f.seek(*pos).unwrap();
            f.write(data).unwrap();
        }
        f.close().unwrap();

        let mut r = new_file(0);
        r.set_max_cached_chunks(capacity);
        r.open(&path, FileMode::Read).unwrap();

        // Later writes overlap earlier ones; a shadow buffer models
        // the expected content.
        let mut shadow = vec![0u8; 204];
        for (pos, data) in writes {
            let pos = *pos as usize;
            if shadow.len() < pos + data.len() {
                shadow.resize(pos + data.len(), 0);
            }
            shadow[pos..pos + data.len()].copy_from_slice(data);
        }
        assert_eq!(r.size(), shadow.len() as u64, "capacity {capacity}");
        let mut back = vec![0u8; shadow.len()];
        r.seek(0).unwrap();
        assert_eq!(r.read(&mut back).unwrap(), shadow.len());
        assert_eq!(back, shadow, "capacity {capacity}");
    }
}

#[test]
fn interleaved_write_then_read_at_offsets() {
    // Write a 1000-byte pattern, patch three bytes at 300, then read
    // around the patch — before close and again after reopen.
    let path = temp_path("scenario");
    let pattern: Vec<u8> = (0..1000).map(|i| (i % 256) as u8).collect();

    let mut f = new_file(64);
    f.open(&path, FileMode::WriteNew).unwrap();
    f.write(&pattern).unwrap();
    f.seek(300).unwrap();
    f.write(&[0x10, 0x20, 0x30]).unwrap();

    // The patch touches only 300..302.
    f.seek(302).unwrap();
    let mut two = [0u8; 2];
    assert_eq!(f.read(&mut two).unwrap(), 2);
    assert_eq!(two, [0x30, pattern[303]]);
    f.close().unwrap();

    let mut r = new_file(0);
    r.open(&path, FileMode::Read).unwrap();
    r.seek(302).unwrap();
    let mut two = [0u8; 2];
    assert_eq!(r.read(&mut two).unwrap(), 2);
    assert_eq!(two, [0x30, pattern[303]]);

    r.seek(299).unwrap();
    let mut four = [0u8; 4];
    assert_eq!(r.read(&mut four).unwrap(), 4);
    assert_eq!(four, [pattern[299], 0x10, 0x20, 0x30]);
}

#[test]
fn stamp_digest_detects_any_raw_byte_change() {
    let path = temp_path("stampint");
    let mut f = new_file(64);
    f.open(&path, FileMode::WriteNew).unwrap();
    f.write(&vec![0x5c; 500]).unwrap();
    f.close().unwrap();

    let mut s = new_file(0);
    s.stamp_digest(&path).unwrap();

    // Untouched file verifies.
    let mut v = new_file(0);
    v.check_stamp_digest(&path).unwrap();

    // Any single byte of header || descriptor ciphertext region
    // breaks it. Flip one in the last chunk.
    let mut raw = std::fs::read(&path).unwrap();
    let mid = raw.len() - 100;
    raw[mid] ^= 0x01;
    std::fs::write(&path, &raw).unwrap();

    let mut v = new_file(0);
    assert!(matches!(
        v.check_stamp_digest(&path),
        Err(FileError::StampMismatch)
    ));

    // Restoring the byte restores the verdict.
    raw[mid] ^= 0x01;
    std::fs::write(&path, &raw).unwrap();
    let mut v = new_file(0);
    v.check_stamp_digest(&path).unwrap();
}

#[test]
fn mac_stamp_binds_to_the_master_key() {
    let path = temp_path("stampkey");
    let mut f = new_file(64);
    f.open(&path, FileMode::WriteNew).unwrap();
    f.write(b"keyed integrity").unwrap();
    f.close().unwrap();

    let mut s = new_file(0);
    s.stamp_mac(&path).unwrap();
    let mut v = new_file(0);
    v.verify_stamp_mac(&path).unwrap();

    let mut wrong = EncryptedFile::new(
        SymmetricKey::from_bytes(&[0xEE; 32]),
        Arc::new(CipherSuite::aes256_gcm()),
    );
    assert!(matches!(
        wrong.verify_stamp_mac(&path),
        Err(FileError::StampMismatch)
    ));
}

#[test]
fn truncate_then_extend_keeps_geometry_consistent() {
    let path = temp_path("truncgeom");
    let pattern: Vec<u8> = (0..500).map(|i| (i % 251) as u8).collect();

    let mut f = new_file(64);
    f.open(&path, FileMode::WriteNew).unwrap();
    f.write(&pattern).unwrap();
    f.truncate(130, false).unwrap();
    f.seek(130).unwrap();
    f.write(b"appended-after-truncate").unwrap();
    f.close().unwrap();

    let mut r = new_file(0);
    r.open(&path, FileMode::Read).unwrap();
    assert_eq!(r.size(), 130 + 23);
    let mut back = vec![0u8; r.size() as usize];
    r.read(&mut back).unwrap();
    assert_eq!(&back[..130], &pattern[..130]);
    assert_eq!(&back[130..], b"appended-after-truncate");
}

#[test]
fn corrupt_chunk_fails_at_its_offset_only() {
    let path = temp_path("partial");
    let mut f = new_file(64);
    f.open(&path, FileMode::WriteNew).unwrap();
    f.write(&vec![0xAB; 256]).unwrap();
    f.close().unwrap();

    // Corrupt the third chunk's region on disk. 256 bytes in 64-byte
    // windows pack as four full chunks of width 4 + 64 + 28.
    let mut raw = std::fs::read(&path).unwrap();
    let full_width = 4 + 64 + 28;
    let data_offset = raw.len() - 4 * full_width;
    let third = data_offset + 2 * full_width + 30;
    raw[third] ^= 0xff;
    std::fs::write(&path, &raw).unwrap();

    let mut r = new_file(0);
    r.open(&path, FileMode::Read).unwrap();

    // Chunks 0 and 1 still read.
    let mut head = vec![0u8; 128];
    assert_eq!(r.read(&mut head).unwrap(), 128);
    assert_eq!(head, vec![0xAB; 128]);

    // The corrupted chunk reports an error; the file stays open.
    let mut tail = vec![0u8; 64];
    assert!(r.read(&mut tail).is_err());

    // Earlier offsets remain readable after the failure.
    r.seek(0).unwrap();
    let mut again = vec![0u8; 64];
    assert_eq!(r.read(&mut again).unwrap(), 64);
}
