//! Keel crypt — encrypted containers and files on an AEAD cipher suite.
//!
//! The layer stack, bottom up:
//!   1. [`suite`]     — algorithm enums and the cipher-suite registry
//!   2. [`keys`]      — symmetric keys and KDFs (HKDF, PBKDF2)
//!   3. [`chunk`]     — the AEAD chunk codec, one window at a time
//!   4. [`container`] — header + descriptor + chunk sequence
//!   5. [`file`]      — seekable random-access view with an LRU chunk cache
//!
//! Every chunk is independently keyed via HKDF from the container's
//! master key, so random access never re-keys more than one window.

pub mod cache;
pub mod chunk;
pub mod container;
pub mod error;
pub mod file;
pub mod keys;
pub mod stamp;
pub mod suite;

pub use container::{ContainerDescriptor, ContainerHeader, CryptContainer, SuiteRef};
pub use error::{ContainerError, CryptError, FileError};
pub use file::{EncryptedFile, FileMode};
pub use keys::SymmetricKey;
pub use suite::{AeadAlgorithm, CipherSuite, DigestAlgorithm, KdfAlgorithm, MacAlgorithm, SuiteRegistry};
