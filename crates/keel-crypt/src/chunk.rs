//! AEAD chunk codec.
//!
//! One chunk encrypts one window of plaintext under its own derived
//! key. On-disk layout:
//!
//!   [u32 length LE] [iv] [tag] [ciphertext]
//!
//! `length` counts iv + tag + ciphertext. Chunks whose plaintext is
//! exactly the configured maximum are zero-padded to a fixed packed
//! width so every full chunk occupies the same number of bytes on
//! disk — that constant width is what makes random access possible.
//!
//! Key derivation: HKDF(master, salt, info) where `info` is the
//! little-endian chunk seqnum (or caller-supplied bytes). The AEAD
//! associated data is `salt || info`, binding each chunk to both its
//! container and its position.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;

use crate::error::CryptError;
use crate::keys::{derive_key, SymmetricKey};
use crate::suite::{AeadAlgorithm, CipherSuite};

/// Bytes reserved for the chunk length prefix.
pub const CHUNK_PREFIX_SIZE: usize = 4;

/// Fixed per-chunk overhead past the prefix: iv + tag.
pub fn packed_extra_size(aead: AeadAlgorithm) -> usize {
    aead.iv_size() + aead.tag_size()
}

/// The `info` bytes for a sequence-numbered chunk. The first chunk
/// uses seqnum 0.
pub fn seqnum_info(seqnum: u32) -> [u8; 4] {
    seqnum.to_le_bytes()
}

/// Encode one chunk into `out` (replacing its contents).
///
/// `max_plain_size` of zero means unbounded: no padding is applied.
pub fn encode_chunk(
    suite: &CipherSuite,
    master: &SymmetricKey,
    salt: &[u8],
    info: &[u8],
    plaintext: &[u8],
    max_plain_size: u32,
    out: &mut Vec<u8>,
) -> Result<(), CryptError> {
    let mut iv = vec![0u8; suite.aead.iv_size()];
    rand::thread_rng().fill_bytes(&mut iv);
    encode_chunk_with_iv(suite, master, salt, info, &iv, plaintext, max_plain_size, out)
}

/// Encode with a caller-supplied IV. Exposed for deterministic tests;
/// production paths go through [`encode_chunk`].
#[allow(clippy::too_many_arguments)]
pub fn encode_chunk_with_iv(
    suite: &CipherSuite,
    master: &SymmetricKey,
    salt: &[u8],
    info: &[u8],
    iv: &[u8],
    plaintext: &[u8],
    max_plain_size: u32,
    out: &mut Vec<u8>,
) -> Result<(), CryptError> {
    if iv.len() != suite.aead.iv_size() {
        return Err(CryptError::BadIvLength {
            expected: suite.aead.iv_size(),
            got: iv.len(),
        });
    }

    let key = derive_key(master, salt, info, suite.aead.key_size())?;
    let aad = auth_data(salt, info);

    let mut ciphertext = plaintext.to_vec();
    let tag = aead_encrypt(suite.aead, &key, iv, &aad, &mut ciphertext)?;

    let body_len = iv.len() + tag.len() + ciphertext.len();
    out.clear();
    out.reserve(CHUNK_PREFIX_SIZE + body_len);
    out.extend_from_slice(&(body_len as u32).to_le_bytes());
    out.extend_from_slice(iv);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&ciphertext);

    // A full chunk is padded to the fixed packed width so all full
    // chunks land at computable offsets. The final short chunk stays
    // compact.
    if max_plain_size > 0 && plaintext.len() as u32 == max_plain_size {
        let target =
            CHUNK_PREFIX_SIZE + max_plain_size as usize + packed_extra_size(suite.aead);
        if out.len() < target {
            out.resize(target, 0);
        }
    }
    Ok(())
}

/// Decode one chunk from `packed` into `out` (replacing its contents).
///
/// `packed` may carry padding past the declared length; only the
/// declared bytes are consumed. A zero length prefix decodes to empty.
pub fn decode_chunk(
    suite: &CipherSuite,
    master: &SymmetricKey,
    salt: &[u8],
    info: &[u8],
    packed: &[u8],
    out: &mut Vec<u8>,
) -> Result<(), CryptError> {
    if packed.len() < CHUNK_PREFIX_SIZE {
        return Err(CryptError::ChunkTooShort(packed.len()));
    }
    let declared = u32::from_le_bytes(packed[..CHUNK_PREFIX_SIZE].try_into().expect("4 bytes"));
    if declared == 0 {
        out.clear();
        return Ok(());
    }
    let available = packed.len() - CHUNK_PREFIX_SIZE;
    if declared as usize > available {
        return Err(CryptError::ChunkLengthOverrun { declared, available });
    }
    let body = &packed[CHUNK_PREFIX_SIZE..CHUNK_PREFIX_SIZE + declared as usize];

    let iv_size = suite.aead.iv_size();
    let tag_size = suite.aead.tag_size();
    if body.len() < iv_size + tag_size {
        return Err(CryptError::ChunkTooShort(body.len()));
    }
    let (iv, rest) = body.split_at(iv_size);
    let (tag, ciphertext) = rest.split_at(tag_size);

    let key = derive_key(master, salt, info, suite.aead.key_size())?;
    let aad = auth_data(salt, info);

    out.clear();
    out.extend_from_slice(ciphertext);
    aead_decrypt(suite.aead, &key, iv, &aad, out, tag)?;
    Ok(())
}

fn auth_data(salt: &[u8], info: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(salt.len() + info.len());
    aad.extend_from_slice(salt);
    aad.extend_from_slice(info);
    aad
}

// ── AEAD dispatch ─────────────────────────────────────────────────────────────

fn aead_encrypt(
    alg: AeadAlgorithm,
    key: &SymmetricKey,
    iv: &[u8],
    aad: &[u8],
    buf: &mut Vec<u8>,
) -> Result<Vec<u8>, CryptError> {
    let nonce = GenericArray::from_slice(iv);
    match alg {
        AeadAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| {
                CryptError::BadKeyLength {
                    expected: alg.key_size(),
                    got: key.len(),
                }
            })?;
            let tag = cipher
                .encrypt_in_place_detached(nonce, aad, buf)
                .map_err(|_| CryptError::BadTag)?;
            Ok(tag.to_vec())
        }
        AeadAlgorithm::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes()).map_err(|_| {
                CryptError::BadKeyLength {
                    expected: alg.key_size(),
                    got: key.len(),
                }
            })?;
            let tag = cipher
                .encrypt_in_place_detached(nonce, aad, buf)
                .map_err(|_| CryptError::BadTag)?;
            Ok(tag.to_vec())
        }
    }
}

fn aead_decrypt(
    alg: AeadAlgorithm,
    key: &SymmetricKey,
    iv: &[u8],
    aad: &[u8],
    buf: &mut Vec<u8>,
    tag: &[u8],
) -> Result<(), CryptError> {
    let nonce = GenericArray::from_slice(iv);
    let tag = GenericArray::from_slice(tag);
    match alg {
        AeadAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| {
                CryptError::BadKeyLength {
                    expected: alg.key_size(),
                    got: key.len(),
                }
            })?;
            cipher
                .decrypt_in_place_detached(nonce, aad, buf, tag)
                .map_err(|_| CryptError::BadTag)
        }
        AeadAlgorithm::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes()).map_err(|_| {
                CryptError::BadKeyLength {
                    expected: alg.key_size(),
                    got: key.len(),
                }
            })?;
            cipher
                .decrypt_in_place_detached(nonce, aad, buf, tag)
                .map_err(|_| CryptError::BadTag)
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
