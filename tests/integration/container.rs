//! Container-level invariants: round trips and chunk geometry.

use std::sync::Arc;

use keel_crypt::chunk::CHUNK_PREFIX_SIZE;
use keel_crypt::container::ContainerHeader;
use keel_crypt::{CipherSuite, CryptContainer, SuiteRegistry, SymmetricKey};

fn container(suite: CipherSuite, chunk_size: u32) -> CryptContainer {
    let mut c = CryptContainer::new(SymmetricKey::from_bytes(&[0x42; 32]), Arc::new(suite));
    c.set_chunk_max_size(chunk_size);
    c
}

#[test]
fn round_trip_preserves_bytes_and_declared_size() {
    // A spread of payload sizes around the chunk boundary, both suites.
    for suite in [CipherSuite::aes256_gcm(), CipherSuite::chacha20_poly1305()] {
        for len in [0usize, 1, 63, 64, 65, 128, 1000] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
            let mut writer = container(suite.clone(), 64);
            let packed = writer.pack(&plaintext).unwrap();

            let header = ContainerHeader::from_bytes(&packed).unwrap();
            assert_eq!(header.plaintext_size, len as u64, "len {len}");

            let mut reader = container(suite.clone(), 0);
            let registry = SuiteRegistry::with_defaults();
            assert_eq!(
                reader.unpack(&packed, Some(&registry)).unwrap(),
                plaintext,
                "suite {} len {len}",
                suite.id
            );
        }
    }
}

#[test]
fn full_chunks_have_constant_width_and_tail_stays_compact() {
    let chunk = 64u32;
    let mut c = container(CipherSuite::aes256_gcm(), chunk);
    let extra = c.packed_extra_size() as u64;

    // Two full chunks plus a 10-byte tail.
    let packed = c.pack(&vec![7u8; 2 * 64 + 10]).unwrap();
    let header = ContainerHeader::from_bytes(&packed).unwrap();

    let full_width = CHUNK_PREFIX_SIZE as u64 + chunk as u64 + extra;
    let tail_width = CHUNK_PREFIX_SIZE as u64 + 10 + extra;
    assert_eq!(header.ciphertext_size, 2 * full_width + tail_width);

    // Exactly full payload: every chunk at the fixed width.
    let mut c = container(CipherSuite::aes256_gcm(), chunk);
    let packed = c.pack(&vec![7u8; 3 * 64]).unwrap();
    let header = ContainerHeader::from_bytes(&packed).unwrap();
    assert_eq!(header.ciphertext_size, 3 * full_width);
}

#[test]
fn first_chunk_window_shifts_the_geometry() {
    let mut c = container(CipherSuite::aes256_gcm(), 64);
    c.set_first_chunk_max_size(16);
    let extra = c.packed_extra_size() as u64;

    // 16 + 64 + 4: first window, one normal chunk, a tail.
    let packed = c.pack(&vec![1u8; 84]).unwrap();
    let header = ContainerHeader::from_bytes(&packed).unwrap();
    let expected = (CHUNK_PREFIX_SIZE as u64 + 16 + extra)
        + (CHUNK_PREFIX_SIZE as u64 + 64 + extra)
        + (CHUNK_PREFIX_SIZE as u64 + 4 + extra);
    assert_eq!(header.ciphertext_size, expected);

    let mut reader = container(CipherSuite::aes256_gcm(), 0);
    assert_eq!(reader.unpack(&packed, None).unwrap(), vec![1u8; 84]);
}

#[test]
fn corrupted_chunk_reports_decryption_failure() {
    let mut c = container(CipherSuite::aes256_gcm(), 64);
    let mut packed = c.pack(&vec![9u8; 200]).unwrap();

    // Flip a byte in the middle of the second chunk's ciphertext.
    let header = ContainerHeader::from_bytes(&packed).unwrap();
    let data_offset = packed.len() - header.ciphertext_size as usize;
    let second_chunk = data_offset + (CHUNK_PREFIX_SIZE + 64 + c.packed_extra_size() as usize) + 40;
    packed[second_chunk] ^= 0x80;

    let mut reader = container(CipherSuite::aes256_gcm(), 0);
    assert!(reader.unpack(&packed, None).is_err());
}
