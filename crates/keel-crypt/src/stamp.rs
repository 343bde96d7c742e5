//! File stamps — a trailing integrity record over the raw file bytes.
//!
//! A stamp covers `header || descriptor || ciphertext` exactly as
//! stored on disk (no decryption). Layout, appended after the
//! ciphertext:
//!
//!   [bincode FileStamp] [u32 total_size LE] [magic "KSTP"]
//!
//! `total_size` counts the whole stamp including the 8-byte trailer,
//! so a reader locates the stamp from the end of the file without
//! walking the chunks. Digest and MAC fields are independent: stamping
//! one preserves the other.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::FileError;
use crate::keys::SymmetricKey;
use crate::suite::{DigestAlgorithm, MacAlgorithm};

pub const STAMP_MAGIC: &[u8; 4] = b"KSTP";
pub const STAMP_TRAILER_SIZE: usize = 8;

/// HKDF info for deriving the stamp MAC key from the master key.
pub const STAMP_MAC_INFO: &[u8] = b"file-stamp-mac";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
    pub digest: Option<Vec<u8>>,
    pub mac: Option<Vec<u8>>,
}

impl FileStamp {
    /// Serialize with the locator trailer appended.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FileError> {
        let mut out = bincode::serialize(self).map_err(|e| {
            FileError::Container(crate::error::ContainerError::DescriptorSerialize(
                e.to_string(),
            ))
        })?;
        let total = (out.len() + STAMP_TRAILER_SIZE) as u32;
        out.extend_from_slice(&total.to_le_bytes());
        out.extend_from_slice(STAMP_MAGIC);
        Ok(out)
    }

    /// Locate and parse a stamp at the tail of `file_bytes_end`, the
    /// last bytes of the file (at least the trailer). Returns the
    /// stamp and its total on-disk size, or None when no stamp is
    /// present.
    pub fn from_tail(tail: &[u8]) -> Option<(FileStamp, usize)> {
        if tail.len() < STAMP_TRAILER_SIZE {
            return None;
        }
        let magic_at = tail.len() - 4;
        if &tail[magic_at..] != STAMP_MAGIC {
            return None;
        }
        let total =
            u32::from_le_bytes(tail[magic_at - 4..magic_at].try_into().expect("4 bytes")) as usize;
        if total < STAMP_TRAILER_SIZE || total > tail.len() {
            return None;
        }
        let body = &tail[tail.len() - total..tail.len() - STAMP_TRAILER_SIZE];
        let stamp: FileStamp = bincode::deserialize(body).ok()?;
        Some((stamp, total))
    }
}

// ── Incremental processors ────────────────────────────────────────────────────

/// Incremental digest over the raw file bytes.
pub enum StampDigest {
    Blake3(Box<blake3::Hasher>),
    Sha256(Sha256),
}

impl StampDigest {
    pub fn new(alg: DigestAlgorithm) -> Self {
        match alg {
            DigestAlgorithm::Blake3 => StampDigest::Blake3(Box::new(blake3::Hasher::new())),
            DigestAlgorithm::Sha256 => StampDigest::Sha256(Sha256::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            StampDigest::Blake3(h) => {
                h.update(data);
            }
            StampDigest::Sha256(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            StampDigest::Blake3(h) => h.finalize().as_bytes().to_vec(),
            StampDigest::Sha256(h) => h.finalize().to_vec(),
        }
    }
}

/// Incremental MAC over the raw file bytes.
pub struct StampMac(Hmac<Sha256>);

impl StampMac {
    pub fn new(alg: MacAlgorithm, key: &SymmetricKey) -> Result<Self, FileError> {
        match alg {
            MacAlgorithm::HmacSha256 => {
                let mac = <Hmac<Sha256> as Mac>::new_from_slice(key.as_bytes()).map_err(|_| {
                    FileError::Crypt(crate::error::CryptError::BadKeyLength {
                        expected: 32,
                        got: key.len(),
                    })
                })?;
                Ok(Self(mac))
            }
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        Mac::update(&mut self.0, data);
    }

    pub fn finalize(self) -> Vec<u8> {
        self.0.finalize().into_bytes().to_vec()
    }

    /// Constant-time verification.
    pub fn verify(self, expected: &[u8]) -> Result<(), FileError> {
        self.0
            .verify_slice(expected)
            .map_err(|_| FileError::StampMismatch)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
