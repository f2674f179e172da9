//! Filename encryption and the long-name escape hatch.
//!
//! Plaintext names are PKCS-style padded to 16 bytes, encrypted with EME
//! under the parent directory's IV, and base64-encoded (URL-safe, padded or
//! raw depending on the `Raw64` flag). Encrypted names longer than 255 bytes
//! are replaced on disk by `gocryptfs.longname.<base64(sha256(cipherName))>`
//! with a `.name` sidecar holding the full encrypted name.

use std::fs::File;
use std::io::Write;
use std::os::fd::AsFd;
use std::sync::Arc;

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::crypto::CryptoCore;
use crate::fs::diriv::{io_to_errno, read_diriv_at, DirIv, DIRIV_FILENAME};
use crate::sys;

/// Maximum filename length, as on ext4.
pub const NAME_MAX: usize = 255;

/// Prefix of long-name payload and sidecar files.
pub const LONGNAME_PREFIX: &str = "gocryptfs.longname.";

/// Suffix of the sidecar carrying the full encrypted name.
pub const LONGNAME_SUFFIX: &str = ".name";

/// Sidecar files are created read-only, like the DirIV.
const NAME_PERMS: u32 = 0o400;

/// Upper bound when reading a sidecar: a 255-byte plaintext name encrypts to
/// at most 344 base64 bytes.
const MAX_SIDECAR_LEN: usize = 1024;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NameError {
    /// Malformed base64, wrong ciphertext size, failed unpadding, or a
    /// decrypted name that is not a valid filename. Deliberately generic.
    #[error("invalid encrypted name")]
    BadCipherName,

    /// Empty, `.`, `..`, over-long, or containing `/` or NUL.
    #[error("invalid plaintext name")]
    InvalidName,

    /// Plaintext name exceeds 255 bytes.
    #[error("name too long")]
    TooLong,
}

/// What a ciphertext leaf name is, structurally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameType {
    /// Ordinary encrypted (or plaintext-mode) name.
    Normal,
    /// The `gocryptfs.diriv` file itself.
    DirIv,
    /// `gocryptfs.longname.<hash>` payload file.
    LongContent,
    /// `gocryptfs.longname.<hash>.name` sidecar.
    LongSidecar,
}

/// Classify a ciphertext leaf name. readdir uses this to filter sidecars and
/// DirIV files from listings.
pub fn name_type(cname: &str) -> NameType {
    if cname == DIRIV_FILENAME {
        return NameType::DirIv;
    }
    if cname.starts_with(LONGNAME_PREFIX) {
        if cname.ends_with(LONGNAME_SUFFIX) {
            return NameType::LongSidecar;
        }
        return NameType::LongContent;
    }
    NameType::Normal
}

/// True for `gocryptfs.longname.<hash>` payload names.
pub fn is_long_content(cname: &str) -> bool {
    name_type(cname) == NameType::LongContent
}

/// Reject names no filesystem (or this format) can represent.
pub fn is_valid_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(NameError::InvalidName);
    }
    if name.len() > NAME_MAX {
        return Err(NameError::InvalidName);
    }
    if name.contains('/') || name.contains('\0') {
        return Err(NameError::InvalidName);
    }
    Ok(())
}

/// Pad to the next 16-byte boundary; always adds at least one byte.
fn pad16(data: &[u8]) -> Vec<u8> {
    let pad_len = 16 - data.len() % 16;
    let mut out = Vec::with_capacity(data.len() + pad_len);
    out.extend_from_slice(data);
    out.resize(data.len() + pad_len, pad_len as u8);
    out
}

fn unpad16(data: &[u8]) -> Result<&[u8], NameError> {
    if data.is_empty() || data.len() % 16 != 0 {
        return Err(NameError::BadCipherName);
    }
    let pad_len = data[data.len() - 1] as usize;
    if pad_len == 0 || pad_len > 16 {
        return Err(NameError::BadCipherName);
    }
    let new_len = data.len() - pad_len;
    if data[new_len..].iter().any(|&b| b as usize != pad_len) {
        return Err(NameError::BadCipherName);
    }
    Ok(&data[..new_len])
}

#[derive(Debug, Clone, Copy)]
enum B64Variant {
    /// URL-safe with `=` padding (legacy volumes).
    Padded,
    /// URL-safe without padding (`Raw64` flag).
    Raw,
}

/// Bijective plaintext filename ↔ ciphertext filename transform for one
/// volume.
pub struct NameTransform {
    core: Arc<CryptoCore>,
    long_names: bool,
    b64: B64Variant,
}

impl NameTransform {
    pub fn new(core: Arc<CryptoCore>, long_names: bool, raw64: bool) -> Self {
        Self {
            core,
            long_names,
            b64: if raw64 {
                B64Variant::Raw
            } else {
                B64Variant::Padded
            },
        }
    }

    pub fn b64_encode(&self, data: &[u8]) -> String {
        match self.b64 {
            B64Variant::Padded => URL_SAFE.encode(data),
            B64Variant::Raw => URL_SAFE_NO_PAD.encode(data),
        }
    }

    pub fn b64_decode(&self, s: &str) -> Result<Vec<u8>, NameError> {
        match self.b64 {
            B64Variant::Padded => URL_SAFE.decode(s),
            B64Variant::Raw => URL_SAFE_NO_PAD.decode(s),
        }
        .map_err(|_| NameError::BadCipherName)
    }

    /// Encrypt a plaintext name under the directory IV.
    pub fn encrypt_name(&self, plain_name: &str, iv: &DirIv) -> Result<String, NameError> {
        is_valid_name(plain_name)?;
        let padded = pad16(plain_name.as_bytes());
        let cipher = self
            .core
            .eme()
            .encrypt(iv, &padded)
            .map_err(|_| NameError::InvalidName)?;
        Ok(self.b64_encode(&cipher))
    }

    /// Decrypt a base64 ciphertext name under the directory IV.
    pub fn decrypt_name(&self, cipher_name: &str, iv: &DirIv) -> Result<String, NameError> {
        let bin = self.b64_decode(cipher_name)?;
        if bin.is_empty() || bin.len() % 16 != 0 {
            return Err(NameError::BadCipherName);
        }
        let plain = self
            .core
            .eme()
            .decrypt(iv, &bin)
            .map_err(|_| NameError::BadCipherName)?;
        let unpadded = unpad16(&plain)?;
        let name =
            String::from_utf8(unpadded.to_vec()).map_err(|_| NameError::BadCipherName)?;
        is_valid_name(&name).map_err(|_| NameError::BadCipherName)?;
        Ok(name)
    }

    /// Encrypt a name, replacing it by its long-name hash when the
    /// ciphertext exceeds 255 bytes. Rejects plaintext names over 255 bytes.
    pub fn encrypt_and_hash_name(&self, name: &str, iv: &DirIv) -> Result<String, NameError> {
        if name.len() > NAME_MAX {
            return Err(NameError::TooLong);
        }
        let cname = self.encrypt_name(name, iv)?;
        if self.long_names && cname.len() > NAME_MAX {
            return Ok(self.hash_long_name(&cname));
        }
        Ok(cname)
    }

    /// `gocryptfs.longname.<base64(sha256(cipherName))>`
    pub fn hash_long_name(&self, cname: &str) -> String {
        let digest = Sha256::digest(cname.as_bytes());
        format!("{LONGNAME_PREFIX}{}", self.b64_encode(&digest))
    }

    // ---- sidecar I/O ----------------------------------------------------

    /// Create the `.name` sidecar for `hash_name` inside `dirfd`, holding
    /// the full encrypted form of `plain_path`'s base name.
    ///
    /// Returns `EEXIST` untouched: the caller decides whether a pre-existing
    /// sidecar is a benign collision.
    pub fn write_long_name_at<Fd: AsFd>(
        &self,
        dirfd: &Fd,
        hash_name: &str,
        plain_path: &str,
    ) -> nix::Result<()> {
        let plain_name = base_name(plain_path);
        let iv = read_diriv_at(dirfd)?;
        let cname = self.encrypt_name(plain_name, &iv).map_err(|e| {
            warn!(error = %e, "cannot encrypt name for sidecar");
            Errno::EBADMSG
        })?;
        let sidecar = format!("{hash_name}{LONGNAME_SUFFIX}");
        let fd = sys::openat(
            dirfd,
            &sidecar,
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_EXCL,
            Mode::from_bits_truncate(NAME_PERMS),
        )?;
        let mut file = File::from(fd);
        file.write_all(cname.as_bytes()).map_err(io_to_errno)
    }

    /// Read the full encrypted name for the `gocryptfs.longname.<hash>`
    /// payload `content_name` from its sidecar.
    pub fn read_long_name_at<Fd: AsFd>(
        &self,
        dirfd: &Fd,
        content_name: &str,
    ) -> nix::Result<String> {
        let sidecar = format!("{content_name}{LONGNAME_SUFFIX}");
        let fd = sys::openat(
            dirfd,
            &sidecar,
            OFlag::O_RDONLY | OFlag::O_NOFOLLOW,
            Mode::empty(),
        )?;
        let file = File::from(fd);
        let mut buf = vec![0u8; MAX_SIDECAR_LEN + 1];
        let n = sys::pread_full(&file, &mut buf, 0).map_err(io_to_errno)?;
        if n == 0 || n > MAX_SIDECAR_LEN {
            warn!(content_name, len = n, "sidecar has implausible size");
            return Err(Errno::EBADMSG);
        }
        buf.truncate(n);
        String::from_utf8(buf).map_err(|_| Errno::EBADMSG)
    }

    /// Remove the `.name` sidecar of `content_name`.
    pub fn delete_long_name_at<Fd: AsFd>(
        &self,
        dirfd: &Fd,
        content_name: &str,
    ) -> nix::Result<()> {
        let sidecar = format!("{content_name}{LONGNAME_SUFFIX}");
        sys::unlinkat(dirfd, &sidecar, false)
    }
}

impl std::fmt::Debug for NameTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameTransform")
            .field("long_names", &self.long_names)
            .field("b64", &self.b64)
            .finish_non_exhaustive()
    }
}

/// Like `filepath.Base`: the final path component, `"."` for the empty path.
pub(crate) fn base_name(path: &str) -> &str {
    match path.rsplit('/').next() {
        Some("") | None => ".",
        Some(base) => base,
    }
}

/// Like `filepath.Dir` but returns `""` instead of `"."`.
pub(crate) fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}
