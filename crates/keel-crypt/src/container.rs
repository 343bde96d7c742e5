//! Encrypted container — header, descriptor and the chunk sequence.
//!
//! On-disk layout:
//!
//!   [23-byte header] [descriptor] [chunk 0] [chunk 1] ...
//!
//! Header (all integers little-endian):
//!
//!   | offset | size | field           |
//!   |--------|------|-----------------|
//!   | 0      | 4    | magic "KELC"    |
//!   | 4      | 1    | version         |
//!   | 5      | 2    | descriptor size |
//!   | 7      | 8    | plaintext size  |
//!   | 15     | 8    | ciphertext size |
//!
//! The descriptor is a bincode record carrying the KDF type, salt,
//! chunk window sizes and the cipher suite — by id (resolved through a
//! registry on unpack) or embedded in full for self-contained files.
//!
//! Streaming mode replaces the chunk sequence with a single unchunked
//! encrypted body; it is opt-in at creation and recorded in the
//! descriptor so readers need no out-of-band signal.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::chunk::{self, CHUNK_PREFIX_SIZE};
use crate::error::ContainerError;
use crate::keys::{self, SymmetricKey};
use crate::suite::{CipherSuite, KdfAlgorithm, SuiteRegistry};

pub const CONTAINER_MAGIC: &[u8; 4] = b"KELC";
pub const CONTAINER_VERSION: u8 = 1;
pub const CONTAINER_HEADER_SIZE: usize = 23;

/// Byte offset of the plaintext-size field within the header.
pub const PLAINTEXT_SIZE_OFFSET: usize = 7;
/// Byte offset of the ciphertext-size field within the header.
pub const CIPHERTEXT_SIZE_OFFSET: usize = 15;

/// Salt length generated when auto-salt is enabled.
const AUTO_SALT_LEN: usize = 16;

// ── Header ────────────────────────────────────────────────────────────────────

/// The fixed 23-byte container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub version: u8,
    pub descriptor_size: u16,
    /// Total plaintext across all chunks. Informational.
    pub plaintext_size: u64,
    /// Total size of all chunks following the descriptor.
    pub ciphertext_size: u64,
}

impl ContainerHeader {
    pub fn to_bytes(&self) -> [u8; CONTAINER_HEADER_SIZE] {
        let mut out = [0u8; CONTAINER_HEADER_SIZE];
        out[0..4].copy_from_slice(CONTAINER_MAGIC);
        out[4] = self.version;
        out[5..7].copy_from_slice(&self.descriptor_size.to_le_bytes());
        out[PLAINTEXT_SIZE_OFFSET..PLAINTEXT_SIZE_OFFSET + 8]
            .copy_from_slice(&self.plaintext_size.to_le_bytes());
        out[CIPHERTEXT_SIZE_OFFSET..CIPHERTEXT_SIZE_OFFSET + 8]
            .copy_from_slice(&self.ciphertext_size.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ContainerError> {
        if bytes.len() < CONTAINER_HEADER_SIZE {
            return Err(ContainerError::Truncated {
                need: CONTAINER_HEADER_SIZE,
                have: bytes.len(),
            });
        }
        if &bytes[0..4] != CONTAINER_MAGIC {
            return Err(ContainerError::InvalidPrefix);
        }
        let version = bytes[4];
        if version > CONTAINER_VERSION {
            return Err(ContainerError::UnsupportedVersion(version));
        }
        Ok(Self {
            version,
            descriptor_size: u16::from_le_bytes(bytes[5..7].try_into().expect("2 bytes")),
            plaintext_size: u64::from_le_bytes(
                bytes[PLAINTEXT_SIZE_OFFSET..PLAINTEXT_SIZE_OFFSET + 8]
                    .try_into()
                    .expect("8 bytes"),
            ),
            ciphertext_size: u64::from_le_bytes(
                bytes[CIPHERTEXT_SIZE_OFFSET..CIPHERTEXT_SIZE_OFFSET + 8]
                    .try_into()
                    .expect("8 bytes"),
            ),
        })
    }
}

/// Patch the size fields of an already-serialized header in place.
pub fn write_header_sizes(header: &mut [u8], plaintext_size: u64, ciphertext_size: u64) {
    header[PLAINTEXT_SIZE_OFFSET..PLAINTEXT_SIZE_OFFSET + 8]
        .copy_from_slice(&plaintext_size.to_le_bytes());
    header[CIPHERTEXT_SIZE_OFFSET..CIPHERTEXT_SIZE_OFFSET + 8]
        .copy_from_slice(&ciphertext_size.to_le_bytes());
}

// ── Descriptor ────────────────────────────────────────────────────────────────

/// Cipher-suite reference inside a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuiteRef {
    /// Resolved through a [`SuiteRegistry`] on unpack.
    Id(String),
    /// Full suite carried with the container.
    Embedded(CipherSuite),
}

/// Self-describing record between the header and the first chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    pub kdf: KdfAlgorithm,
    pub salt: Vec<u8>,
    pub chunk_max_size: u32,
    pub first_chunk_max_size: u32,
    pub streaming: bool,
    pub suite: SuiteRef,
}

// ── Container processor ───────────────────────────────────────────────────────

/// Encryptor/decryptor of encrypted containers.
///
/// Owns the master key and the packing parameters. `pack` and `unpack`
/// process whole buffers; `pack_chunk`/`unpack_chunk` process one
/// window for callers that manage their own layout (the encrypted
/// file does).
pub struct CryptContainer {
    master_key: SymmetricKey,
    suite: Arc<CipherSuite>,
    kdf: KdfAlgorithm,
    salt: Vec<u8>,
    chunk_max_size: u32,
    first_chunk_max_size: u32,
    attach_suite: bool,
    auto_salt: bool,
    streaming: bool,
}

impl CryptContainer {
    pub fn new(master_key: SymmetricKey, suite: Arc<CipherSuite>) -> Self {
        let kdf = suite.kdf;
        Self {
            master_key,
            suite,
            kdf,
            salt: Vec::new(),
            chunk_max_size: 0,
            first_chunk_max_size: 0,
            attach_suite: false,
            auto_salt: true,
            streaming: false,
        }
    }

    pub fn master_key(&self) -> &SymmetricKey {
        &self.master_key
    }

    pub fn suite(&self) -> &Arc<CipherSuite> {
        &self.suite
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn set_salt(&mut self, salt: Vec<u8>) {
        self.salt = salt;
    }

    /// Max plaintext per normal chunk. Zero = unbounded (single chunk).
    pub fn set_chunk_max_size(&mut self, size: u32) {
        self.chunk_max_size = size;
    }

    pub fn chunk_max_size(&self) -> u32 {
        self.chunk_max_size
    }

    /// Max plaintext of chunk 0. Zero = same as a normal chunk.
    pub fn set_first_chunk_max_size(&mut self, size: u32) {
        self.first_chunk_max_size = size;
    }

    pub fn first_chunk_max_size(&self) -> u32 {
        self.first_chunk_max_size
    }

    /// Serialize the whole suite into the descriptor instead of its id.
    pub fn set_attach_suite(&mut self, enable: bool) {
        self.attach_suite = enable;
    }

    pub fn set_auto_salt(&mut self, enable: bool) {
        self.auto_salt = enable;
    }

    pub fn set_streaming_mode(&mut self, enable: bool) {
        self.streaming = enable;
    }

    pub fn is_streaming_mode(&self) -> bool {
        self.streaming
    }

    // ── Size algebra ──────────────────────────────────────────────────────────

    /// Max plaintext of the given chunk.
    pub fn max_plain_chunk_size(&self, seqnum: u32) -> u32 {
        if seqnum == 0 && self.first_chunk_max_size > 0 {
            self.first_chunk_max_size
        } else {
            self.chunk_max_size
        }
    }

    /// iv + tag overhead per chunk.
    pub fn packed_extra_size(&self) -> u32 {
        chunk::packed_extra_size(self.suite.aead) as u32
    }

    /// Fixed on-disk width of a full chunk, or None when unbounded.
    pub fn max_packed_chunk_size(&self, seqnum: u32) -> Option<u32> {
        let plain = self.max_plain_chunk_size(seqnum);
        if plain == 0 {
            None
        } else {
            Some(CHUNK_PREFIX_SIZE as u32 + plain + self.packed_extra_size())
        }
    }

    // ── Descriptor ────────────────────────────────────────────────────────────

    pub fn descriptor(&self) -> ContainerDescriptor {
        ContainerDescriptor {
            kdf: self.kdf,
            salt: self.salt.clone(),
            chunk_max_size: self.chunk_max_size,
            first_chunk_max_size: self.first_chunk_max_size,
            streaming: self.streaming,
            suite: if self.attach_suite {
                SuiteRef::Embedded((*self.suite).clone())
            } else {
                SuiteRef::Id(self.suite.id.clone())
            },
        }
    }

    /// Adopt an unpacked descriptor, resolving the suite by id through
    /// the registry (or against the already-configured suite).
    pub fn apply_descriptor(
        &mut self,
        descriptor: ContainerDescriptor,
        registry: Option<&SuiteRegistry>,
    ) -> Result<(), ContainerError> {
        match descriptor.suite {
            SuiteRef::Embedded(suite) => {
                self.suite = Arc::new(suite);
            }
            SuiteRef::Id(id) => {
                if self.suite.id != id {
                    let found = registry.and_then(|r| r.find(&id));
                    match found {
                        Some(suite) => self.suite = suite,
                        None => return Err(ContainerError::UnknownSuite(id)),
                    }
                }
            }
        }
        self.kdf = descriptor.kdf;
        self.salt = descriptor.salt;
        self.chunk_max_size = descriptor.chunk_max_size;
        self.first_chunk_max_size = descriptor.first_chunk_max_size;
        self.streaming = descriptor.streaming;
        Ok(())
    }

    /// Serialize header + descriptor, generating a salt first when
    /// auto-salt is on and none was set. Size fields start at the given
    /// values and are patched after the chunks are known.
    pub fn pack_header_and_descriptor(
        &mut self,
        plaintext_size: u64,
        ciphertext_size: u64,
    ) -> Result<Vec<u8>, ContainerError> {
        if self.auto_salt && self.salt.is_empty() {
            self.salt = keys::random_salt(AUTO_SALT_LEN);
        }
        let descriptor = bincode::serialize(&self.descriptor())
            .map_err(|e| ContainerError::DescriptorSerialize(e.to_string()))?;
        if descriptor.len() > u16::MAX as usize {
            return Err(ContainerError::InvalidSize(format!(
                "descriptor size {} exceeds u16",
                descriptor.len()
            )));
        }
        let header = ContainerHeader {
            version: CONTAINER_VERSION,
            descriptor_size: descriptor.len() as u16,
            plaintext_size,
            ciphertext_size,
        };
        let mut out = Vec::with_capacity(CONTAINER_HEADER_SIZE + descriptor.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&descriptor);
        Ok(out)
    }

    /// Parse header + descriptor and adopt the descriptor. Returns the
    /// header and the number of bytes consumed (the data offset).
    pub fn unpack_header_and_descriptor(
        &mut self,
        input: &[u8],
        registry: Option<&SuiteRegistry>,
    ) -> Result<(ContainerHeader, usize), ContainerError> {
        let header = ContainerHeader::from_bytes(input)?;
        let descriptor_end = CONTAINER_HEADER_SIZE + header.descriptor_size as usize;
        if input.len() < descriptor_end {
            return Err(ContainerError::Truncated {
                need: descriptor_end,
                have: input.len(),
            });
        }
        let descriptor: ContainerDescriptor =
            bincode::deserialize(&input[CONTAINER_HEADER_SIZE..descriptor_end])
                .map_err(|e| ContainerError::DescriptorParse(e.to_string()))?;
        self.apply_descriptor(descriptor, registry)?;
        Ok((header, descriptor_end))
    }

    // ── Chunk passthrough ─────────────────────────────────────────────────────

    /// Pack one sequence-numbered chunk.
    pub fn pack_chunk(
        &self,
        plaintext: &[u8],
        seqnum: u32,
        out: &mut Vec<u8>,
    ) -> Result<(), ContainerError> {
        chunk::encode_chunk(
            &self.suite,
            &self.master_key,
            &self.salt,
            &chunk::seqnum_info(seqnum),
            plaintext,
            self.max_plain_chunk_size(seqnum),
            out,
        )?;
        Ok(())
    }

    /// Unpack one sequence-numbered chunk.
    pub fn unpack_chunk(
        &self,
        packed: &[u8],
        seqnum: u32,
        out: &mut Vec<u8>,
    ) -> Result<(), ContainerError> {
        chunk::decode_chunk(
            &self.suite,
            &self.master_key,
            &self.salt,
            &chunk::seqnum_info(seqnum),
            packed,
            out,
        )?;
        Ok(())
    }

    // ── Whole-buffer pack/unpack ──────────────────────────────────────────────

    /// Pack (encrypt) a whole plaintext into a container.
    pub fn pack(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ContainerError> {
        let mut out = self.pack_header_and_descriptor(plaintext.len() as u64, 0)?;
        let data_offset = out.len();

        if self.streaming {
            self.encrypt_stream(plaintext, &mut out)?;
        } else {
            let mut packed = Vec::new();
            let mut offset = 0usize;
            let mut seqnum = 0u32;
            while offset < plaintext.len() {
                let window = self.max_plain_chunk_size(seqnum) as usize;
                let remaining = plaintext.len() - offset;
                let take = if window == 0 {
                    remaining
                } else {
                    remaining.min(window)
                };
                self.pack_chunk(&plaintext[offset..offset + take], seqnum, &mut packed)?;
                out.extend_from_slice(&packed);
                offset += take;
                seqnum += 1;
            }
        }

        let ciphertext_size = (out.len() - data_offset) as u64;
        write_header_sizes(
            &mut out[..CONTAINER_HEADER_SIZE],
            plaintext.len() as u64,
            ciphertext_size,
        );
        Ok(out)
    }

    /// Unpack (decrypt) a whole container.
    pub fn unpack(
        &mut self,
        input: &[u8],
        registry: Option<&SuiteRegistry>,
    ) -> Result<Vec<u8>, ContainerError> {
        let (header, data_offset) = self.unpack_header_and_descriptor(input, registry)?;
        let data_end = data_offset + header.ciphertext_size as usize;
        if input.len() < data_end {
            return Err(ContainerError::Truncated {
                need: data_end,
                have: input.len(),
            });
        }
        let body = &input[data_offset..data_end];

        let mut plain = Vec::with_capacity(header.plaintext_size as usize);
        if self.streaming {
            self.decrypt_stream(body, &mut plain)?;
        } else {
            let mut consumed = 0usize;
            let mut seqnum = 0u32;
            let mut window = Vec::new();
            while consumed < body.len() {
                let remaining = body.len() - consumed;
                let width = match self.max_packed_chunk_size(seqnum) {
                    Some(max_packed) => remaining.min(max_packed as usize),
                    None => remaining,
                };
                self.unpack_chunk(&body[consumed..consumed + width], seqnum, &mut window)?;
                plain.extend_from_slice(&window);
                consumed += width;
                seqnum += 1;
            }
        }

        if plain.len() as u64 != header.plaintext_size {
            return Err(ContainerError::PlaintextSizeMismatch {
                declared: header.plaintext_size,
                got: plain.len() as u64,
            });
        }
        Ok(plain)
    }

    // ── Streaming mode ────────────────────────────────────────────────────────

    /// Streaming body: iv || tag || ciphertext, no chunking, no
    /// padding, keyed like chunk 0.
    fn encrypt_stream(&self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), ContainerError> {
        let mut packed = Vec::new();
        chunk::encode_chunk(
            &self.suite,
            &self.master_key,
            &self.salt,
            &chunk::seqnum_info(0),
            plaintext,
            0,
            &mut packed,
        )?;
        // Strip the length prefix; the header's ciphertext size is the
        // authority in streaming mode.
        out.extend_from_slice(&packed[CHUNK_PREFIX_SIZE..]);
        Ok(())
    }

    fn decrypt_stream(&self, body: &[u8], out: &mut Vec<u8>) -> Result<(), ContainerError> {
        let mut packed = Vec::with_capacity(CHUNK_PREFIX_SIZE + body.len());
        packed.extend_from_slice(&(body.len() as u32).to_le_bytes());
        packed.extend_from_slice(body);
        chunk::decode_chunk(
            &self.suite,
            &self.master_key,
            &self.salt,
            &chunk::seqnum_info(0),
            &packed,
            out,
        )?;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
