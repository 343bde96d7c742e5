//! Symmetric keys and key derivation.
//!
//! Key material is wiped from memory on drop. Chunk keys are derived
//! with HKDF-SHA256 from the container's master key; passphrase keys
//! with PBKDF2-HMAC-SHA256.

use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptError;

/// Default PBKDF2 iteration count for passphrase-derived keys.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 100_000;

/// A symmetric key. Bytes are zeroized on drop and never exposed
/// through Debug.
pub struct SymmetricKey(Zeroizing<Vec<u8>>);

impl SymmetricKey {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(Zeroizing::new(bytes.to_vec()))
    }

    /// Generate a random key of `len` bytes.
    pub fn random(len: usize) -> Self {
        let mut bytes = Zeroizing::new(vec![0u8; len]);
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Clone for SymmetricKey {
    fn clone(&self) -> Self {
        Self::from_bytes(&self.0)
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey({} bytes)", self.0.len())
    }
}

/// Derive a key with HKDF-SHA256 from (master, salt, info).
pub fn derive_key(
    master: &SymmetricKey,
    salt: &[u8],
    info: &[u8],
    out_len: usize,
) -> Result<SymmetricKey, CryptError> {
    let salt_opt = if salt.is_empty() { None } else { Some(salt) };
    let hk = Hkdf::<Sha256>::new(salt_opt, master.as_bytes());
    let mut okm = Zeroizing::new(vec![0u8; out_len]);
    hk.expand(info, &mut okm)
        .map_err(|e| CryptError::Kdf(e.to_string()))?;
    Ok(SymmetricKey(okm))
}

/// Derive a key from a passphrase with PBKDF2-HMAC-SHA256.
pub fn passphrase_key(
    passphrase: &str,
    salt: &[u8],
    iterations: u32,
    out_len: usize,
) -> SymmetricKey {
    let mut okm = Zeroizing::new(vec![0u8; out_len]);
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut okm);
    SymmetricKey(okm)
}

/// Generate a random salt of `len` bytes.
pub fn random_salt(len: usize) -> Vec<u8> {
    let mut salt = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}
