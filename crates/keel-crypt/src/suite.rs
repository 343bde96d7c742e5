//! Cipher suites — named bundles of algorithm choices.
//!
//! A suite pins the AEAD cipher, the KDF, the digest and the MAC used
//! by a container. Containers normally reference a suite by id and the
//! reader resolves it through a [`SuiteRegistry`]; a container can also
//! embed its full suite descriptor for self-contained files.
//!
//! The registry is an owned object constructed at bootstrap and passed
//! where needed. Configure it at start; reads after bootstrap are
//! lock-free.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::CryptError;

// ── Algorithms ────────────────────────────────────────────────────────────────

/// AEAD (Authenticated Encryption with Associated Data) algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AeadAlgorithm {
    Aes256Gcm = 1,
    ChaCha20Poly1305 = 2,
    // Reserve 3-127 for standard algorithms
    // Reserve 128-255 for experimental/custom algorithms
}

impl AeadAlgorithm {
    pub fn iv_size(self) -> usize {
        12
    }

    pub fn tag_size(self) -> usize {
        16
    }

    pub fn key_size(self) -> usize {
        32
    }
}

impl TryFrom<u8> for AeadAlgorithm {
    type Error = CryptError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AeadAlgorithm::Aes256Gcm),
            2 => Ok(AeadAlgorithm::ChaCha20Poly1305),
            other => Err(CryptError::UnsupportedAead(other)),
        }
    }
}

/// Key Derivation Function algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum KdfAlgorithm {
    Hkdf = 1,
    Pbkdf2Sha256 = 2,
}

impl TryFrom<u8> for KdfAlgorithm {
    type Error = CryptError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(KdfAlgorithm::Hkdf),
            2 => Ok(KdfAlgorithm::Pbkdf2Sha256),
            other => Err(CryptError::UnsupportedKdf(other)),
        }
    }
}

/// Digest algorithms for file stamps and integrity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DigestAlgorithm {
    Blake3 = 1,
    Sha256 = 2,
}

impl DigestAlgorithm {
    pub fn digest_size(self) -> usize {
        32
    }
}

impl TryFrom<u8> for DigestAlgorithm {
    type Error = CryptError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(DigestAlgorithm::Blake3),
            2 => Ok(DigestAlgorithm::Sha256),
            other => Err(CryptError::UnsupportedDigest(other)),
        }
    }
}

/// MAC algorithms for keyed file stamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MacAlgorithm {
    HmacSha256 = 1,
}

impl MacAlgorithm {
    pub fn mac_size(self) -> usize {
        32
    }
}

impl TryFrom<u8> for MacAlgorithm {
    type Error = CryptError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MacAlgorithm::HmacSha256),
            other => Err(CryptError::UnsupportedMac(other)),
        }
    }
}

// ── Suite ─────────────────────────────────────────────────────────────────────

/// A named bundle of algorithm choices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherSuite {
    pub id: String,
    pub aead: AeadAlgorithm,
    pub kdf: KdfAlgorithm,
    pub digest: DigestAlgorithm,
    pub mac: MacAlgorithm,
}

impl CipherSuite {
    /// The default suite: AES-256-GCM with HKDF-derived chunk keys.
    pub fn aes256_gcm() -> Self {
        Self {
            id: "aes256gcm-hkdf-v1".into(),
            aead: AeadAlgorithm::Aes256Gcm,
            kdf: KdfAlgorithm::Hkdf,
            digest: DigestAlgorithm::Blake3,
            mac: MacAlgorithm::HmacSha256,
        }
    }

    /// ChaCha20-Poly1305 variant for platforms without AES hardware.
    pub fn chacha20_poly1305() -> Self {
        Self {
            id: "chacha20poly1305-hkdf-v1".into(),
            aead: AeadAlgorithm::ChaCha20Poly1305,
            kdf: KdfAlgorithm::Hkdf,
            digest: DigestAlgorithm::Blake3,
            mac: MacAlgorithm::HmacSha256,
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Suite lookup by id. Constructed at bootstrap, passed explicitly.
#[derive(Default)]
pub struct SuiteRegistry {
    suites: DashMap<String, Arc<CipherSuite>>,
}

impl SuiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the built-in suites.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(CipherSuite::aes256_gcm());
        registry.register(CipherSuite::chacha20_poly1305());
        registry
    }

    pub fn register(&self, suite: CipherSuite) {
        self.suites.insert(suite.id.clone(), Arc::new(suite));
    }

    pub fn find(&self, id: &str) -> Option<Arc<CipherSuite>> {
        self.suites.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.suites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suites.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
