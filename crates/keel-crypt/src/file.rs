//! Encrypted file — a seekable random-access view over an encrypted
//! container stored on disk.
//!
//! The file body is the container layout of [`crate::container`]: a
//! 23-byte header, the descriptor, then fixed-width AEAD chunks. All
//! full chunks occupy the same packed width, so a plaintext position
//! maps to a chunk seqnum and a raw file offset with plain arithmetic;
//! only the final chunk may be shorter. Decrypted chunks live in a
//! bounded LRU cache; a dirty chunk is re-encrypted and written back
//! when evicted or flushed.
//!
//! Digest/MAC stamps cover the raw on-disk bytes (header, descriptor,
//! ciphertext — nothing is decrypted) and are stored as a trailing
//! record after the ciphertext.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::LruCache;
use crate::chunk::CHUNK_PREFIX_SIZE;
use crate::container::{
    ContainerHeader, CryptContainer, CONTAINER_HEADER_SIZE, PLAINTEXT_SIZE_OFFSET,
};
use crate::error::{ContainerError, FileError};
use crate::keys::{derive_key, SymmetricKey};
use crate::stamp::{FileStamp, StampDigest, StampMac, STAMP_MAC_INFO, STAMP_TRAILER_SIZE};
use crate::suite::{CipherSuite, SuiteRegistry};

/// Default bound of the decrypted-chunk cache.
pub const MAX_CACHED_CHUNKS: usize = 8;

/// Default block size for whole-file digest/MAC passes.
pub const MAX_PROCESSING_SIZE: usize = 0x100000;

/// Chunk window applied when a new file is created without one.
pub const DEFAULT_CHUNK_MAX_SIZE: u32 = 0x40000;

/// Open modes. Each maps to the underlying open pattern it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Existing file, read only.
    Read,
    /// Create or truncate, then write.
    WriteNew,
    /// Existing file, read/write.
    WriteExisting,
    /// Existing file, cursor starts at EOF.
    Append,
    /// Existing file, random writes anywhere.
    WriteOverwrite,
    /// Sequential read, tolerant of files that were not closed
    /// cleanly (stale header sizes are recomputed from storage).
    Scan,
}

impl FileMode {
    fn writable(self) -> bool {
        matches!(
            self,
            FileMode::WriteNew | FileMode::WriteExisting | FileMode::Append | FileMode::WriteOverwrite
        )
    }
}

/// One decrypted chunk held in memory.
struct Chunk {
    seqnum: u32,
    dirty: bool,
    data: Vec<u8>,
}

/// Seekable encrypted file.
pub struct EncryptedFile {
    container: CryptContainer,
    registry: Option<Arc<SuiteRegistry>>,
    file: Option<File>,
    path: PathBuf,
    mode: FileMode,
    /// Plaintext cursor.
    cursor: u64,
    /// Logical plaintext size.
    size: u64,
    /// Header size + descriptor size, computed once per open.
    data_offset: u64,
    ciphertext_size: u64,
    size_dirty: bool,
    cache: LruCache<u32, Chunk>,
    cache_enabled: bool,
    /// Inlined slot used when the cache is disabled.
    single_chunk: Option<Chunk>,
    max_processing_size: usize,
}

impl EncryptedFile {
    pub fn new(master_key: SymmetricKey, suite: Arc<CipherSuite>) -> Self {
        Self {
            container: CryptContainer::new(master_key, suite),
            registry: None,
            file: None,
            path: PathBuf::new(),
            mode: FileMode::Read,
            cursor: 0,
            size: 0,
            data_offset: 0,
            ciphertext_size: 0,
            size_dirty: false,
            cache: LruCache::new(MAX_CACHED_CHUNKS),
            cache_enabled: true,
            single_chunk: None,
            max_processing_size: MAX_PROCESSING_SIZE,
        }
    }

    /// Resolve by-id suite references through this registry on open.
    pub fn with_registry(mut self, registry: Arc<SuiteRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// The container processor, for configuring chunk sizes and salt
    /// before creating a file.
    pub fn processor_mut(&mut self) -> &mut CryptContainer {
        &mut self.container
    }

    pub fn processor(&self) -> &CryptContainer {
        &self.container
    }

    pub fn set_max_cached_chunks(&mut self, capacity: usize) {
        self.cache = LruCache::new(capacity);
    }

    pub fn set_cache_enabled(&mut self, enable: bool) {
        self.cache_enabled = enable;
    }

    pub fn set_max_processing_size(&mut self, size: usize) {
        self.max_processing_size = size;
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    // ── Open / close ──────────────────────────────────────────────────────────

    pub fn open(&mut self, path: impl AsRef<Path>, mode: FileMode) -> Result<(), FileError> {
        if self.is_open() {
            return Err(FileError::AlreadyOpen);
        }
        let path = path.as_ref().to_path_buf();

        if mode == FileMode::WriteNew {
            if self.container.chunk_max_size() == 0 {
                self.container.set_chunk_max_size(DEFAULT_CHUNK_MAX_SIZE);
            }
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .map_err(|e| FileError::Write {
                    path: path.clone(),
                    source: e,
                })?;
            let head = self.container.pack_header_and_descriptor(0, 0)?;
            file.write_all(&head).map_err(|e| FileError::Write {
                path: path.clone(),
                source: e,
            })?;
            self.data_offset = head.len() as u64;
            self.size = 0;
            self.ciphertext_size = 0;
            self.file = Some(file);
            self.path = path;
            self.mode = mode;
            self.cursor = 0;
            self.size_dirty = true;
            tracing::debug!(path = %self.path.display(), "encrypted file created");
            Ok(())
        } else {
            let mut file = OpenOptions::new()
                .read(true)
                .write(mode.writable())
                .open(&path)
                .map_err(|e| FileError::Read {
                    path: path.clone(),
                    source: e,
                })?;
            let header = self.read_header(&mut file, &path)?;
            if self.container.is_streaming_mode() || self.container.chunk_max_size() == 0 {
                return Err(FileError::Container(ContainerError::InvalidSize(
                    "random access requires a chunked, nonzero-window container".into(),
                )));
            }
            self.data_offset = CONTAINER_HEADER_SIZE as u64 + header.descriptor_size as u64;
            self.size = header.plaintext_size;
            self.ciphertext_size = header.ciphertext_size;

            if mode == FileMode::Scan {
                self.recover_stale_sizes(&mut file, &path)?;
            }
            self.file = Some(file);
            self.path = path;
            self.mode = mode;
            self.cursor = if mode == FileMode::Append { self.size } else { 0 };
            self.size_dirty = false;
            tracing::debug!(
                path = %self.path.display(),
                ?mode,
                size = self.size,
                "encrypted file opened"
            );
            Ok(())
        }
    }

    /// Flush and close. Safe to call on a closed file.
    pub fn close(&mut self) -> Result<(), FileError> {
        if self.file.is_some() {
            if self.mode.writable() {
                self.flush(true)?;
            }
            self.file = None;
        }
        self.cache = LruCache::new(self.cache.capacity());
        self.single_chunk = None;
        self.cursor = 0;
        Ok(())
    }

    /// Discard every cached chunk without writing it back.
    pub fn invalidate_cache(&mut self) {
        self.cache = LruCache::new(self.cache.capacity());
        self.single_chunk = None;
    }

    // ── Size & position ───────────────────────────────────────────────────────

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn pos(&self) -> u64 {
        self.cursor
    }

    /// Header + descriptor + packed ciphertext. Excludes any stamp.
    pub fn used_size(&self) -> u64 {
        self.data_offset + self.ciphertext_size
    }

    /// Bytes the file occupies on disk.
    pub fn storage_size(&self) -> Result<u64, FileError> {
        let file = self.file.as_ref().ok_or(FileError::NotOpen)?;
        let meta = file.metadata().map_err(|e| FileError::Read {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(meta.len())
    }

    pub fn seek(&mut self, pos: u64) -> Result<(), FileError> {
        if !self.is_open() {
            return Err(FileError::NotOpen);
        }
        if !self.mode.writable() && pos > self.size {
            return Err(FileError::SeekOutOfRange {
                pos,
                size: self.size,
            });
        }
        self.cursor = pos;
        Ok(())
    }

    // ── Position algebra ──────────────────────────────────────────────────────

    fn max_plain(&self, seqnum: u32) -> u64 {
        self.container.max_plain_chunk_size(seqnum) as u64
    }

    fn full_width(&self, seqnum: u32) -> u64 {
        self.container
            .max_packed_chunk_size(seqnum)
            .expect("open() enforces a nonzero chunk size") as u64
    }

    fn pos_to_seqnum(&self, pos: u64) -> u32 {
        let first = self.max_plain(0);
        if pos < first {
            0
        } else {
            (1 + (pos - first) / self.max_plain(1)) as u32
        }
    }

    fn chunk_begin(&self, seqnum: u32) -> u64 {
        if seqnum == 0 {
            0
        } else {
            self.max_plain(0) + (seqnum as u64 - 1) * self.max_plain(1)
        }
    }

    fn chunk_offset(&self, pos: u64) -> u64 {
        pos - self.chunk_begin(self.pos_to_seqnum(pos))
    }

    fn seqnum_to_raw_pos(&self, seqnum: u32) -> u64 {
        if seqnum == 0 {
            self.data_offset
        } else {
            self.data_offset + self.full_width(0) + (seqnum as u64 - 1) * self.full_width(1)
        }
    }

    /// Packed ciphertext size for a given plaintext size.
    fn cts_for_plain(&self, plain: u64) -> u64 {
        if plain == 0 {
            return 0;
        }
        let eof = self.pos_to_seqnum(plain - 1);
        let mut total = 0u64;
        for s in 0..eof {
            total += self.full_width(s);
        }
        let last_len = plain - self.chunk_begin(eof);
        total + CHUNK_PREFIX_SIZE as u64 + self.container.packed_extra_size() as u64 + last_len
    }

    /// Plaintext size recovered from a packed ciphertext size.
    fn plain_for_cts(&self, cts: u64) -> u64 {
        if cts == 0 {
            return 0;
        }
        let overhead = CHUNK_PREFIX_SIZE as u64 + self.container.packed_extra_size() as u64;
        let full0 = self.full_width(0);
        if cts <= full0 {
            return cts.saturating_sub(overhead);
        }
        let rest = cts - full0;
        let full1 = self.full_width(1);
        let n = rest / full1;
        let rem = rest % full1;
        let mut plain = self.max_plain(0) + n * self.max_plain(1);
        if rem > 0 {
            plain += rem.saturating_sub(overhead);
        }
        plain
    }

    fn eof_raw_pos(&self) -> u64 {
        self.data_offset + self.ciphertext_size
    }

    // ── Read / write ──────────────────────────────────────────────────────────

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, FileError> {
        if !self.is_open() {
            return Err(FileError::NotOpen);
        }
        let mut done = 0usize;
        while done < buf.len() && self.cursor < self.size {
            let seqnum = self.pos_to_seqnum(self.cursor);
            let offset = self.chunk_offset(self.cursor) as usize;
            let remaining_file = (self.size - self.cursor) as usize;
            let chunk = self.get_chunk(seqnum)?;
            if offset >= chunk.data.len() {
                break;
            }
            let n = (buf.len() - done)
                .min(chunk.data.len() - offset)
                .min(remaining_file);
            buf[done..done + n].copy_from_slice(&chunk.data[offset..offset + n]);
            done += n;
            self.cursor += n as u64;
        }
        Ok(done)
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize, FileError> {
        if !self.is_open() {
            return Err(FileError::NotOpen);
        }
        if !self.mode.writable() {
            return Err(FileError::NotWritable);
        }
        // A seek past EOF leaves a gap; materialize it as zeros so
        // every intermediate chunk exists on disk.
        if self.cursor > self.size {
            let target = self.cursor;
            self.cursor = self.size;
            let gap = target - self.cursor;
            self.fill_zeros(gap)?;
        }
        self.write_inner(data)
    }

    fn fill_zeros(&mut self, mut remaining: u64) -> Result<(), FileError> {
        let zeros = vec![0u8; (self.max_plain(1) as usize).min(64 * 1024).max(1)];
        while remaining > 0 {
            let n = remaining.min(zeros.len() as u64) as usize;
            self.write_inner(&zeros[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }

    fn write_inner(&mut self, data: &[u8]) -> Result<usize, FileError> {
        let mut done = 0usize;
        while done < data.len() {
            let seqnum = self.pos_to_seqnum(self.cursor);
            let offset = self.chunk_offset(self.cursor) as usize;
            let window = self.max_plain(seqnum) as usize;
            let n = (data.len() - done).min(window - offset);

            let chunk = self.get_chunk(seqnum)?;
            if chunk.data.len() < offset {
                chunk.data.resize(offset, 0);
            }
            let overlap = (chunk.data.len() - offset).min(n);
            chunk.data[offset..offset + overlap].copy_from_slice(&data[done..done + overlap]);
            chunk
                .data
                .extend_from_slice(&data[done + overlap..done + n]);
            chunk.dirty = true;

            done += n;
            self.cursor += n as u64;
            if self.cursor > self.size {
                self.size = self.cursor;
                self.ciphertext_size = self.cts_for_plain(self.size);
                self.size_dirty = true;
            }
        }
        Ok(done)
    }

    // ── Chunk cache ───────────────────────────────────────────────────────────

    fn get_chunk(&mut self, seqnum: u32) -> Result<&mut Chunk, FileError> {
        if self.cache_enabled {
            if !self.cache.contains(&seqnum) {
                let chunk = self.load_chunk(seqnum)?;
                if let Some((_, old)) = self.cache.insert(seqnum, chunk) {
                    if old.dirty {
                        self.write_packed(old.seqnum, &old.data)?;
                    }
                }
            }
            Ok(self.cache.get_mut(&seqnum).expect("chunk just inserted"))
        } else {
            let cached = self.single_chunk.as_ref().map(|c| c.seqnum);
            if cached != Some(seqnum) {
                if let Some(old) = self.single_chunk.take() {
                    if old.dirty {
                        self.write_packed(old.seqnum, &old.data)?;
                    }
                }
                let chunk = self.load_chunk(seqnum)?;
                self.single_chunk = Some(chunk);
            }
            Ok(self.single_chunk.as_mut().expect("chunk just loaded"))
        }
    }

    fn load_chunk(&mut self, seqnum: u32) -> Result<Chunk, FileError> {
        let raw = self.seqnum_to_raw_pos(seqnum);
        let end = self.eof_raw_pos();
        if raw >= end {
            // Beyond the last chunk on disk: a fresh chunk for writing.
            return Ok(Chunk {
                seqnum,
                dirty: false,
                data: Vec::new(),
            });
        }
        let width = self.full_width(seqnum).min(end - raw) as usize;
        let mut packed = vec![0u8; width];
        let file = self.file.as_mut().ok_or(FileError::NotOpen)?;
        file.seek(SeekFrom::Start(raw)).map_err(|e| FileError::Read {
            path: self.path.clone(),
            source: e,
        })?;
        file.read_exact(&mut packed).map_err(|e| FileError::Read {
            path: self.path.clone(),
            source: e,
        })?;

        let mut data = Vec::new();
        self.container.unpack_chunk(&packed, seqnum, &mut data)?;
        Ok(Chunk {
            seqnum,
            dirty: false,
            data,
        })
    }

    /// Re-encrypt a chunk and write it back at its raw position.
    fn write_packed(&mut self, seqnum: u32, data: &[u8]) -> Result<(), FileError> {
        let mut packed = Vec::new();
        self.container.pack_chunk(data, seqnum, &mut packed)?;
        let raw = self.seqnum_to_raw_pos(seqnum);
        let file = self.file.as_mut().ok_or(FileError::NotOpen)?;
        file.seek(SeekFrom::Start(raw)).map_err(|e| FileError::Write {
            path: self.path.clone(),
            source: e,
        })?;
        file.write_all(&packed).map_err(|e| FileError::Write {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(())
    }

    // ── Flush / sync ──────────────────────────────────────────────────────────

    /// Encode and write every dirty chunk in ascending seqnum order,
    /// then update the header sizes. `deep` also syncs the backend.
    pub fn flush(&mut self, deep: bool) -> Result<(), FileError> {
        if !self.is_open() {
            return Err(FileError::NotOpen);
        }
        let mut dirty: Vec<(u32, Vec<u8>)> = Vec::new();
        for seqnum in self.cache.keys() {
            if let Some(chunk) = self.cache.get_mut(&seqnum) {
                if chunk.dirty {
                    dirty.push((seqnum, chunk.data.clone()));
                }
            }
        }
        if let Some(chunk) = &self.single_chunk {
            if chunk.dirty {
                dirty.push((chunk.seqnum, chunk.data.clone()));
            }
        }
        dirty.sort_by_key(|(seqnum, _)| *seqnum);

        for (seqnum, data) in &dirty {
            self.write_packed(*seqnum, data)?;
        }
        for (seqnum, _) in &dirty {
            if let Some(chunk) = self.cache.get_mut(seqnum) {
                chunk.dirty = false;
            }
            if let Some(chunk) = self.single_chunk.as_mut() {
                if chunk.seqnum == *seqnum {
                    chunk.dirty = false;
                }
            }
        }

        if self.size_dirty {
            self.write_sizes()?;
        }
        if deep {
            if let Some(file) = self.file.as_mut() {
                file.sync_data().map_err(|e| FileError::Write {
                    path: self.path.clone(),
                    source: e,
                })?;
            }
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), FileError> {
        let file = self.file.as_mut().ok_or(FileError::NotOpen)?;
        file.sync_data().map_err(|e| FileError::Write {
            path: self.path.clone(),
            source: e,
        })
    }

    pub fn fsync(&mut self) -> Result<(), FileError> {
        let file = self.file.as_mut().ok_or(FileError::NotOpen)?;
        file.sync_all().map_err(|e| FileError::Write {
            path: self.path.clone(),
            source: e,
        })
    }

    fn write_sizes(&mut self) -> Result<(), FileError> {
        let mut sizes = [0u8; 16];
        sizes[..8].copy_from_slice(&self.size.to_le_bytes());
        sizes[8..].copy_from_slice(&self.ciphertext_size.to_le_bytes());
        let file = self.file.as_mut().ok_or(FileError::NotOpen)?;
        file.seek(SeekFrom::Start(PLAINTEXT_SIZE_OFFSET as u64))
            .map_err(|e| FileError::Write {
                path: self.path.clone(),
                source: e,
            })?;
        file.write_all(&sizes).map_err(|e| FileError::Write {
            path: self.path.clone(),
            source: e,
        })?;
        self.size_dirty = false;
        Ok(())
    }

    // ── Truncate ──────────────────────────────────────────────────────────────

    /// Shrink the file to `new_size` plaintext bytes. Growing is a
    /// noop. With `backup_copy` the file is copied aside first and
    /// restored on error. Any stamp is removed.
    pub fn truncate(&mut self, new_size: u64, backup_copy: bool) -> Result<(), FileError> {
        if !self.is_open() {
            return Err(FileError::NotOpen);
        }
        if !self.mode.writable() {
            return Err(FileError::NotWritable);
        }
        if new_size >= self.size {
            return Ok(());
        }

        if backup_copy {
            let backup = self.path.with_extension("kbak");
            std::fs::copy(&self.path, &backup).map_err(|e| FileError::Write {
                path: backup.clone(),
                source: e,
            })?;
            let result = self.truncate_inner(new_size);
            if result.is_err() {
                let _ = std::fs::copy(&backup, &self.path);
            }
            let _ = std::fs::remove_file(&backup);
            result
        } else {
            self.truncate_inner(new_size)
        }
    }

    fn truncate_inner(&mut self, new_size: u64) -> Result<(), FileError> {
        let new_eof = if new_size == 0 {
            None
        } else {
            Some(self.pos_to_seqnum(new_size - 1))
        };

        // Drop cached chunks past the new end.
        for seqnum in self.cache.keys() {
            if new_eof.map_or(true, |eof| seqnum > eof) {
                self.cache.remove(&seqnum);
            }
        }
        let drop_single = self
            .single_chunk
            .as_ref()
            .map_or(false, |chunk| new_eof.map_or(true, |eof| chunk.seqnum > eof));
        if drop_single {
            self.single_chunk = None;
        }

        // Shrink the new final chunk if the cut lands mid-chunk.
        if let Some(eof) = new_eof {
            let keep = (new_size - self.chunk_begin(eof)) as usize;
            let chunk = self.get_chunk(eof)?;
            if chunk.data.len() > keep {
                chunk.data.truncate(keep);
                chunk.dirty = true;
            }
        }

        self.size = new_size;
        self.ciphertext_size = self.cts_for_plain(new_size);
        self.size_dirty = true;
        self.cursor = self.cursor.min(new_size);
        self.flush(false)?;

        let end = self.eof_raw_pos();
        let file = self.file.as_mut().ok_or(FileError::NotOpen)?;
        file.set_len(end).map_err(|e| FileError::Write {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(())
    }

    // ── Header parsing ────────────────────────────────────────────────────────

    fn read_header(&mut self, file: &mut File, path: &Path) -> Result<ContainerHeader, FileError> {
        let mut head = [0u8; CONTAINER_HEADER_SIZE];
        file.seek(SeekFrom::Start(0)).map_err(|e| FileError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        file.read_exact(&mut head).map_err(|e| FileError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let header = ContainerHeader::from_bytes(&head)?;

        let mut combined = head.to_vec();
        let mut descriptor = vec![0u8; header.descriptor_size as usize];
        file.read_exact(&mut descriptor).map_err(|e| FileError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        combined.extend_from_slice(&descriptor);

        let (header, _) = self
            .container
            .unpack_header_and_descriptor(&combined, self.registry.as_deref())?;
        Ok(header)
    }

    /// Scan-mode recovery: a file that was never flushed carries stale
    /// zero sizes in its header. Recompute them from storage.
    fn recover_stale_sizes(&mut self, file: &mut File, path: &Path) -> Result<(), FileError> {
        let storage = file
            .metadata()
            .map_err(|e| FileError::Read {
                path: path.to_path_buf(),
                source: e,
            })?
            .len();
        if self.ciphertext_size == 0 && storage > self.data_offset {
            let mut body = storage - self.data_offset;
            // Ignore a trailing stamp if one is present.
            if let Some((_, stamp_size)) = self.read_stamp_tail(file, path, storage)? {
                body = body.saturating_sub(stamp_size as u64);
            }
            self.ciphertext_size = body;
            self.size = self.plain_for_cts(body);
        }
        Ok(())
    }

    fn read_stamp_tail(
        &self,
        file: &mut File,
        path: &Path,
        storage: u64,
    ) -> Result<Option<(FileStamp, usize)>, FileError> {
        if storage < STAMP_TRAILER_SIZE as u64 {
            return Ok(None);
        }
        // Read a bounded tail; stamps are tiny.
        let tail_len = storage.min(4096);
        let mut tail = vec![0u8; tail_len as usize];
        file.seek(SeekFrom::Start(storage - tail_len))
            .map_err(|e| FileError::Read {
                path: path.to_path_buf(),
                source: e,
            })?;
        file.read_exact(&mut tail).map_err(|e| FileError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(FileStamp::from_tail(&tail))
    }

    // ── Stamps ────────────────────────────────────────────────────────────────

    /// Compute the suite digest over the raw file bytes and store it in
    /// the trailing stamp. The file must be closed.
    pub fn stamp_digest(&mut self, path: impl AsRef<Path>) -> Result<(), FileError> {
        let alg = self.container.suite().digest;
        self.apply_stamp(path.as_ref(), |stamp, digest_bytes| {
            stamp.digest = Some(digest_bytes);
            Ok(())
        }, StampKind::Digest(alg))
    }

    /// Verify the digest stamp against the current raw file bytes.
    pub fn check_stamp_digest(&mut self, path: impl AsRef<Path>) -> Result<(), FileError> {
        let alg = self.container.suite().digest;
        let (stamp, computed) = self.process_for_stamp(path.as_ref(), StampKind::Digest(alg))?;
        let stored = stamp
            .ok_or(FileError::NoStamp)?
            .digest
            .ok_or(FileError::StampFieldMissing("digest"))?;
        if stored != computed {
            return Err(FileError::StampMismatch);
        }
        Ok(())
    }

    /// Compute the suite MAC (keyed from the master key) over the raw
    /// file bytes and store it in the trailing stamp.
    pub fn stamp_mac(&mut self, path: impl AsRef<Path>) -> Result<(), FileError> {
        let alg = self.container.suite().mac;
        self.apply_stamp(path.as_ref(), |stamp, mac_bytes| {
            stamp.mac = Some(mac_bytes);
            Ok(())
        }, StampKind::Mac(alg))
    }

    /// Verify the MAC stamp against the current raw file bytes.
    pub fn verify_stamp_mac(&mut self, path: impl AsRef<Path>) -> Result<(), FileError> {
        let alg = self.container.suite().mac;
        let (stamp, computed) = self.process_for_stamp(path.as_ref(), StampKind::Mac(alg))?;
        let stored = stamp
            .ok_or(FileError::NoStamp)?
            .mac
            .ok_or(FileError::StampFieldMissing("mac"))?;
        // Constant-time compare via a fresh MAC of the computed value
        // would be circular; computed is already keyed, so equality on
        // the tag is the verification.
        if stored != computed {
            return Err(FileError::StampMismatch);
        }
        Ok(())
    }

    fn apply_stamp(
        &mut self,
        path: &Path,
        set: impl FnOnce(&mut FileStamp, Vec<u8>) -> Result<(), FileError>,
        kind: StampKind,
    ) -> Result<(), FileError> {
        let (existing, computed) = self.process_for_stamp(path, kind)?;
        let mut stamp = existing.unwrap_or_default();
        set(&mut stamp, computed)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| FileError::Write {
                path: path.to_path_buf(),
                source: e,
            })?;
        let end = self.eof_raw_pos();
        file.set_len(end).map_err(|e| FileError::Write {
            path: path.to_path_buf(),
            source: e,
        })?;
        file.seek(SeekFrom::Start(end)).map_err(|e| FileError::Write {
            path: path.to_path_buf(),
            source: e,
        })?;
        file.write_all(&stamp.to_bytes()?).map_err(|e| FileError::Write {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }

    /// Open in scan layout, stream `header || descriptor || ciphertext`
    /// through the digest/MAC, and return any existing stamp alongside
    /// the computed value.
    fn process_for_stamp(
        &mut self,
        path: &Path,
        kind: StampKind,
    ) -> Result<(Option<FileStamp>, Vec<u8>), FileError> {
        if self.is_open() {
            return Err(FileError::AlreadyOpen);
        }
        let mut file = OpenOptions::new().read(true).open(path).map_err(|e| {
            FileError::Read {
                path: path.to_path_buf(),
                source: e,
            }
        })?;
        let header = self.read_header(&mut file, path)?;
        self.data_offset = CONTAINER_HEADER_SIZE as u64 + header.descriptor_size as u64;
        self.ciphertext_size = header.ciphertext_size;
        self.size = header.plaintext_size;

        let storage = file
            .metadata()
            .map_err(|e| FileError::Read {
                path: path.to_path_buf(),
                source: e,
            })?
            .len();
        let existing = self.read_stamp_tail(&mut file, path, storage)?.map(|(s, _)| s);

        let mut processor = match kind {
            StampKind::Digest(alg) => StampProcessor::Digest(StampDigest::new(alg)),
            StampKind::Mac(alg) => {
                let key = derive_key(
                    self.container.master_key(),
                    self.container.salt(),
                    STAMP_MAC_INFO,
                    32,
                )?;
                StampProcessor::Mac(StampMac::new(alg, &key)?)
            }
        };

        file.seek(SeekFrom::Start(0)).map_err(|e| FileError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut remaining = self.eof_raw_pos();
        let block = self.max_processing_size.max(1);
        let mut buf = vec![0u8; block];
        while remaining > 0 {
            let n = remaining.min(block as u64) as usize;
            file.read_exact(&mut buf[..n]).map_err(|e| FileError::Read {
                path: path.to_path_buf(),
                source: e,
            })?;
            match &mut processor {
                StampProcessor::Digest(d) => d.update(&buf[..n]),
                StampProcessor::Mac(m) => m.update(&buf[..n]),
            }
            remaining -= n as u64;
        }
        let computed = match processor {
            StampProcessor::Digest(d) => d.finalize(),
            StampProcessor::Mac(m) => m.finalize(),
        };
        Ok((existing, computed))
    }
}

enum StampKind {
    Digest(crate::suite::DigestAlgorithm),
    Mac(crate::suite::MacAlgorithm),
}

enum StampProcessor {
    Digest(StampDigest),
    Mac(StampMac),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
