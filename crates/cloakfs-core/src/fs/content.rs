//! Block-structured AEAD framing of file contents.
//!
//! On disk a file is an 18-byte header (version + random file ID) followed by
//! ciphertext blocks of `nonce ‖ ciphertext ‖ tag`. Each block authenticates
//! its block number and the file ID as associated data, so blocks cannot be
//! reordered within a file or swapped between files.
//!
//! This module owns the offset algebra between plaintext and ciphertext
//! ranges and the per-block crypto; actual file descriptors are handled by
//! the volume layer.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use tracing::warn;
use zeroize::Zeroize;

use crate::crypto::{CryptoCore, AUTH_TAG_LEN};

/// Plaintext bytes per block.
pub const DEFAULT_PLAIN_BS: u64 = 4096;

/// File header: 2-byte big-endian version followed by the 16-byte file ID.
pub const HEADER_LEN: usize = 18;

/// The only header version this engine reads or writes.
pub const HEADER_VERSION: u16 = 2;

/// Length of the random per-file ID in the header.
pub const FILE_ID_LEN: usize = 16;

/// Upper bound on a single read/write request, keeping the buffer pools at a
/// fixed size. Larger requests are rejected with zero bytes transferred and
/// the host is expected to split them.
pub const MAX_KERNEL_WRITE: usize = 128 * 1024;

#[derive(Error, Debug)]
pub enum ContentError {
    /// Header is malformed (wrong length, unknown version, all-zero ID).
    #[error("invalid file header: {reason}")]
    InvalidHeader { reason: &'static str },

    /// A ciphertext block failed AEAD authentication.
    ///
    /// The block is corrupt, was truncated, or was copied from another
    /// position or file. The whole read fails.
    #[error("ciphertext block {block_no} failed authentication")]
    BlockAuth { block_no: u64 },

    /// A ciphertext block is shorter than nonce + tag.
    #[error("ciphertext block {block_no} is truncated: {len} bytes")]
    TruncatedBlock { block_no: u64, len: usize },

    /// The block nonce is all zeros, which a correctly written volume never
    /// produces (but zero-filled file holes do).
    #[error("ciphertext block {block_no} carries an all-zero nonce")]
    ZeroNonce { block_no: u64 },
}

/// The random per-file ID from the header, zeroized when the handle closes.
#[derive(Clone, PartialEq, Eq, Zeroize)]
pub struct FileId(pub [u8; FILE_ID_LEN]);

impl std::fmt::Debug for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FileId(..)")
    }
}

/// Parsed file header.
#[derive(Debug, Clone)]
pub struct FileHeader {
    pub id: FileId,
}

impl FileHeader {
    /// Create a header with a fresh random ID.
    pub fn random() -> Self {
        let mut id = [0u8; FILE_ID_LEN];
        OsRng.fill_bytes(&mut id);
        Self { id: FileId(id) }
    }

    /// Serialize to the 18-byte on-disk form.
    pub fn pack(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..2].copy_from_slice(&HEADER_VERSION.to_be_bytes());
        buf[2..].copy_from_slice(&self.id.0);
        buf
    }

    /// Parse the 18-byte on-disk form.
    pub fn parse(buf: &[u8]) -> Result<Self, ContentError> {
        if buf.len() != HEADER_LEN {
            return Err(ContentError::InvalidHeader {
                reason: "wrong length",
            });
        }
        let version = u16::from_be_bytes([buf[0], buf[1]]);
        if version != HEADER_VERSION {
            return Err(ContentError::InvalidHeader {
                reason: "unknown version",
            });
        }
        let mut id = [0u8; FILE_ID_LEN];
        id.copy_from_slice(&buf[2..]);
        if id.iter().all(|&b| b == 0) {
            return Err(ContentError::InvalidHeader {
                reason: "all-zero file ID",
            });
        }
        Ok(Self { id: FileId(id) })
    }
}

/// One plaintext block touched by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntraBlock {
    /// Zero-based block number.
    pub block_no: u64,
    /// Bytes to skip at the start of the block.
    pub skip: u64,
    /// Bytes of payload in this block, in [1, plain_bs].
    pub length: u64,
}

/// Content encrypter/decrypter for one volume.
pub struct ContentEnc {
    core: Arc<CryptoCore>,
    plain_bs: u64,
    cipher_bs: u64,
    creq_pool: BufferPool,
    preq_pool: BufferPool,
}

impl ContentEnc {
    pub fn new(core: Arc<CryptoCore>) -> Self {
        let plain_bs = DEFAULT_PLAIN_BS;
        let cipher_bs = plain_bs + core.nonce_len() as u64 + AUTH_TAG_LEN as u64;
        // Largest joint ciphertext range a MAX_KERNEL_WRITE request can touch
        // (one extra block for the unaligned case), and its plaintext peer.
        let creq_size = (MAX_KERNEL_WRITE as u64 / plain_bs + 1) * cipher_bs;
        let preq_size = MAX_KERNEL_WRITE as u64 + plain_bs;
        Self {
            core,
            plain_bs,
            cipher_bs,
            creq_pool: BufferPool::new(creq_size as usize),
            preq_pool: BufferPool::new(preq_size as usize),
        }
    }

    pub fn plain_bs(&self) -> u64 {
        self.plain_bs
    }

    pub fn cipher_bs(&self) -> u64 {
        self.cipher_bs
    }

    /// Per-block overhead: nonce plus auth tag.
    pub fn block_overhead(&self) -> u64 {
        self.cipher_bs - self.plain_bs
    }

    pub(crate) fn get_ciphertext_buf(&self) -> Vec<u8> {
        self.creq_pool.get()
    }

    pub(crate) fn put_ciphertext_buf(&self, buf: Vec<u8>) {
        self.creq_pool.put(buf)
    }

    pub(crate) fn put_plaintext_buf(&self, mut buf: Vec<u8>) {
        buf.zeroize();
        self.preq_pool.put(buf)
    }

    // ---- offset algebra -------------------------------------------------

    pub fn plain_off_to_block_no(&self, off: u64) -> u64 {
        off / self.plain_bs
    }

    pub fn cipher_off_to_block_no(&self, off: u64) -> u64 {
        (off - HEADER_LEN as u64) / self.cipher_bs
    }

    pub fn block_no_to_plain_off(&self, block_no: u64) -> u64 {
        block_no * self.plain_bs
    }

    pub fn block_no_to_cipher_off(&self, block_no: u64) -> u64 {
        HEADER_LEN as u64 + block_no * self.cipher_bs
    }

    /// Ciphertext size for a plaintext size. Zero maps to zero; anything
    /// else gains the header plus per-block overhead.
    pub fn plain_size_to_cipher_size(&self, plain_size: u64) -> u64 {
        if plain_size == 0 {
            return 0;
        }
        self.block_no_to_cipher_off(self.plain_off_to_block_no(plain_size - 1))
            + self.block_overhead()
            + (plain_size - 1) % self.plain_bs
            + 1
    }

    /// Plaintext size for a ciphertext size. Sizes at or below the header
    /// length are empty files; corrupt sizes saturate to zero.
    pub fn cipher_size_to_plain_size(&self, cipher_size: u64) -> u64 {
        if cipher_size <= HEADER_LEN as u64 {
            if cipher_size != 0 && cipher_size != HEADER_LEN as u64 {
                warn!(cipher_size, "ciphertext file smaller than the header");
            }
            return 0;
        }
        let block_count = self.cipher_off_to_block_no(cipher_size - 1) + 1;
        let overhead = self.block_overhead() * block_count + HEADER_LEN as u64;
        if overhead > cipher_size {
            warn!(cipher_size, "ciphertext size has an invalid final block");
            return 0;
        }
        cipher_size - overhead
    }

    /// Split the plaintext range `[offset, offset+length)` into the touched
    /// blocks.
    pub fn explode_plain_range(&self, mut offset: u64, mut length: u64) -> Vec<IntraBlock> {
        let mut blocks = Vec::with_capacity((length / self.plain_bs + 2) as usize);
        while length > 0 {
            let block_no = self.plain_off_to_block_no(offset);
            let skip = offset - self.block_no_to_plain_off(block_no);
            let len = (self.plain_bs - skip).min(length);
            blocks.push(IntraBlock {
                block_no,
                skip,
                length: len,
            });
            offset += len;
            length -= len;
        }
        blocks
    }

    pub fn is_partial(&self, b: &IntraBlock) -> bool {
        b.skip > 0 || b.length < self.plain_bs
    }

    /// Aligned ciphertext range covering all of `blocks` in one I/O.
    pub fn joint_ciphertext_range(&self, blocks: &[IntraBlock]) -> (u64, u64) {
        let first = blocks.first().expect("at least one block");
        let last = blocks.last().expect("at least one block");
        let offset = self.block_no_to_cipher_off(first.block_no);
        let len = (last.block_no - first.block_no + 1) * self.cipher_bs;
        (offset, len)
    }

    // ---- block crypto ---------------------------------------------------

    fn aad(block_no: u64, file_id: Option<&FileId>) -> Vec<u8> {
        let mut aad = Vec::with_capacity(8 + FILE_ID_LEN);
        aad.extend_from_slice(&block_no.to_be_bytes());
        if let Some(id) = file_id {
            aad.extend_from_slice(&id.0);
        }
        aad
    }

    /// Encrypt one plaintext block: fresh random nonce, AAD binds block
    /// number and file ID.
    pub fn encrypt_block(
        &self,
        plaintext: &[u8],
        block_no: u64,
        file_id: Option<&FileId>,
    ) -> Vec<u8> {
        if plaintext.is_empty() {
            return Vec::new();
        }
        let mut nonce = vec![0u8; self.core.nonce_len()];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .core
            .aead_seal(&nonce, plaintext, &Self::aad(block_no, file_id))
            .expect("AEAD encryption of a block-sized message cannot fail");
        let mut out = Vec::with_capacity(nonce.len() + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        out
    }

    /// Decrypt one ciphertext block. Empty input stays empty.
    pub fn decrypt_block(
        &self,
        ciphertext: &[u8],
        block_no: u64,
        file_id: Option<&FileId>,
    ) -> Result<Vec<u8>, ContentError> {
        if ciphertext.is_empty() {
            return Ok(Vec::new());
        }
        let nonce_len = self.core.nonce_len();
        if ciphertext.len() < nonce_len + AUTH_TAG_LEN + 1 {
            return Err(ContentError::TruncatedBlock {
                block_no,
                len: ciphertext.len(),
            });
        }
        let (nonce, msg) = ciphertext.split_at(nonce_len);
        if nonce.iter().all(|&b| b == 0) {
            // An entirely zero full-size block is a file hole (sparse file);
            // a zero nonce with other content is corruption.
            if ciphertext.len() == self.cipher_bs as usize
                && ciphertext.iter().all(|&b| b == 0)
            {
                return Ok(vec![0u8; self.plain_bs as usize]);
            }
            return Err(ContentError::ZeroNonce { block_no });
        }
        self.core
            .aead_open(nonce, msg, &Self::aad(block_no, file_id))
            .map_err(|_| ContentError::BlockAuth { block_no })
    }

    /// Encrypt consecutive plaintext blocks starting at `first_block_no`
    /// into one contiguous ciphertext buffer (drawn from the pool; return it
    /// with [`Self::put_ciphertext_buf`]).
    pub fn encrypt_blocks(
        &self,
        blocks: &[Vec<u8>],
        first_block_no: u64,
        file_id: &FileId,
    ) -> Vec<u8> {
        let mut out = self.creq_pool.get();
        for (i, block) in blocks.iter().enumerate() {
            out.extend_from_slice(&self.encrypt_block(
                block,
                first_block_no + i as u64,
                Some(file_id),
            ));
        }
        out
    }

    /// Decrypt a contiguous run of ciphertext blocks. The last block may be
    /// partial (short final block of the file).
    pub fn decrypt_blocks(
        &self,
        ciphertext: &[u8],
        first_block_no: u64,
        file_id: &FileId,
    ) -> Result<Vec<u8>, ContentError> {
        let mut out = self.preq_pool.get();
        let mut block_no = first_block_no;
        for chunk in ciphertext.chunks(self.cipher_bs as usize) {
            match self.decrypt_block(chunk, block_no, Some(file_id)) {
                Ok(plain) => out.extend_from_slice(&plain),
                Err(e) => {
                    self.put_plaintext_buf(out);
                    return Err(e);
                }
            }
            block_no += 1;
        }
        Ok(out)
    }

    /// Read-modify-write merge: splice `new_data` into `old_data` at
    /// `offset` within one plaintext block.
    pub fn merge_blocks(&self, old_data: &[u8], new_data: &[u8], offset: usize) -> Vec<u8> {
        let mut out = vec![0u8; self.plain_bs as usize];
        out[..old_data.len()].copy_from_slice(old_data);
        out[offset..offset + new_data.len()].copy_from_slice(new_data);
        let len = old_data.len().max(offset + new_data.len());
        out.truncate(len);
        out
    }
}

impl std::fmt::Debug for ContentEnc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentEnc")
            .field("plain_bs", &self.plain_bs)
            .field("cipher_bs", &self.cipher_bs)
            .finish_non_exhaustive()
    }
}

/// Fixed-capacity free list of fixed-size byte buffers.
///
/// Request sizes are capped at [`MAX_KERNEL_WRITE`], so every buffer has the
/// same capacity and per-operation memory stays bounded. Never sized from
/// user input.
struct BufferPool {
    bufs: Mutex<Vec<Vec<u8>>>,
    buf_size: usize,
}

/// Buffers kept around per pool once returned.
const POOL_SLOTS: usize = 4;

impl BufferPool {
    fn new(buf_size: usize) -> Self {
        Self {
            bufs: Mutex::new(Vec::with_capacity(POOL_SLOTS)),
            buf_size,
        }
    }

    /// An empty buffer with the pool's fixed capacity.
    fn get(&self) -> Vec<u8> {
        if let Some(buf) = self.bufs.lock().pop() {
            return buf;
        }
        Vec::with_capacity(self.buf_size)
    }

    fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() < self.buf_size {
            return;
        }
        buf.clear();
        let mut bufs = self.bufs.lock();
        if bufs.len() < POOL_SLOTS {
            bufs.push(buf);
        }
    }
}
