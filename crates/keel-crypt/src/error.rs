//! Error types for the crypt layer, one enum per sub-layer.

use std::path::PathBuf;

/// Errors from the cipher-suite and chunk codec layers.
#[derive(Debug, thiserror::Error)]
pub enum CryptError {
    #[error("unsupported AEAD algorithm: {0}")]
    UnsupportedAead(u8),

    #[error("unsupported KDF algorithm: {0}")]
    UnsupportedKdf(u8),

    #[error("unsupported digest algorithm: {0}")]
    UnsupportedDigest(u8),

    #[error("unsupported MAC algorithm: {0}")]
    UnsupportedMac(u8),

    #[error("bad key length: expected {expected}, got {got}")]
    BadKeyLength { expected: usize, got: usize },

    #[error("IV length {got} does not match the cipher's IV size {expected}")]
    BadIvLength { expected: usize, got: usize },

    #[error("AEAD tag verification failed")]
    BadTag,

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("chunk too short: {0} bytes")]
    ChunkTooShort(usize),

    #[error("chunk length prefix {declared} exceeds the available {available} bytes")]
    ChunkLengthOverrun { declared: u32, available: usize },
}

/// Errors from the container (header/descriptor/pack/unpack) layer.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("invalid container prefix")]
    InvalidPrefix,

    #[error("unsupported container version {0}")]
    UnsupportedVersion(u8),

    #[error("container truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("declared size is invalid: {0}")]
    InvalidSize(String),

    #[error("descriptor parse failed: {0}")]
    DescriptorParse(String),

    #[error("descriptor serialize failed: {0}")]
    DescriptorSerialize(String),

    #[error("cipher suite '{0}' not found in the registry")]
    UnknownSuite(String),

    #[error("decoded plaintext size {got} does not match the declared {declared}")]
    PlaintextSizeMismatch { declared: u64, got: u64 },

    #[error(transparent)]
    Crypt(#[from] CryptError),
}

/// Errors from the encrypted-file layer.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("file is not open")]
    NotOpen,

    #[error("file is already open")]
    AlreadyOpen,

    #[error("file is not open for writing")]
    NotWritable,

    #[error("seek position {pos} is out of range (size {size})")]
    SeekOutOfRange { pos: u64, size: u64 },

    #[error("read failed at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("write failed at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("file has no stamp")]
    NoStamp,

    #[error("stamp has no {0} field")]
    StampFieldMissing(&'static str),

    #[error("stamp verification failed")]
    StampMismatch,

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Crypt(#[from] CryptError),
}
