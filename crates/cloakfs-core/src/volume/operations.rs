//! Filesystem operations: the composition of path resolution, name
//! transformation, and content encryption into POSIX-like calls.
//!
//! The per-file locking discipline is fixed: every I/O path takes the fd
//! lock shared, reads take the content lock shared, writes and truncates
//! take it exclusive, and close takes the fd lock exclusive. Lock order is
//! always fd lock before content lock.

use std::fs::File;
use std::os::fd::AsFd;
use std::os::unix::ffi::OsStringExt;
use std::sync::Arc;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use thiserror::Error;
use tracing::{debug, warn};

use crate::fs::content::{ContentError, FileHeader, FileId, HEADER_LEN, MAX_KERNEL_WRITE};
use crate::fs::diriv::{create_diriv_at, DIRIV_FILENAME};
use crate::fs::name::{is_long_content, name_type, NameType};
use crate::sys;
use crate::volume::handles::{FileHandle, HandleId};
use crate::volume::path::normalize_path;
use crate::volume::{Volume, CONF_FILENAME};

#[derive(Error, Debug)]
pub enum OpError {
    /// Error from the underlying syscall, carrying the errno.
    #[error("syscall failed: {0}")]
    Sys(#[from] Errno),

    /// Content-layer failure: bad header or failed block authentication.
    #[error(transparent)]
    Content(#[from] ContentError),

    /// Plain I/O error from positioned reads/writes.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The handle id is not (or no longer) registered.
    #[error("unknown file handle {0}")]
    BadHandle(HandleId),
}

impl OpError {
    /// The errno a POSIX host would report for this failure.
    pub fn errno(&self) -> Errno {
        match self {
            OpError::Sys(e) => *e,
            OpError::Content(_) => Errno::EBADMSG,
            OpError::Io(e) => e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO),
            OpError::BadHandle(_) => Errno::EBADF,
        }
    }
}

/// Attributes of a path, sizes translated to plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attrs {
    pub size: u64,
    pub mtime: i64,
}

/// One readdir result: plaintext name plus the file-type mode bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub mode: u32,
}

/// Convert the open flags a caller wants into the flags used for the
/// backing file: read access is always needed (RMW), append and O_DIRECT
/// cannot work on top of the crypto framing, and O_NOFOLLOW guards against
/// symlink races.
fn mangle_open_flags(requested: OFlag) -> OFlag {
    let mut flags = requested;
    if flags & OFlag::O_ACCMODE == OFlag::O_WRONLY {
        flags = (flags - OFlag::O_WRONLY) | OFlag::O_RDWR;
    }
    flags -= OFlag::O_APPEND;
    flags -= OFlag::O_DIRECT;
    flags -= OFlag::O_CREAT;
    flags | OFlag::O_NOFOLLOW
}

impl Volume {
    fn handle(&self, id: HandleId) -> Result<Arc<FileHandle>, OpError> {
        self.handles.get(id).ok_or(OpError::BadHandle(id))
    }

    // ---- file handles ---------------------------------------------------

    /// Open an existing file for reading.
    pub fn open_read_mode(&self, path: &str) -> Result<HandleId, OpError> {
        let path = normalize_path(path)?;
        let (dirfd, cname) = self.prepare_at(&path)?;
        let fd = sys::openat(
            &dirfd,
            &cname,
            mangle_open_flags(OFlag::O_RDONLY),
            Mode::empty(),
        )?;
        Ok(self.handles.register(File::from(fd), path))
    }

    /// Open (creating if needed) a file for writing. For long names the
    /// `.name` sidecar is created first so concurrent readers can resolve
    /// the entry; a pre-existing sidecar is a benign hash collision.
    pub fn open_write_mode(&self, path: &str, mode: u32) -> Result<HandleId, OpError> {
        let path = normalize_path(path)?;
        let (dirfd, cname) = self.prepare_at(&path)?;
        let flags = mangle_open_flags(OFlag::O_RDWR) | OFlag::O_CREAT;
        let mode = Mode::from_bits_truncate(mode);

        let fd = if !self.flags.plaintext_names && is_long_content(&cname) {
            let created_sidecar =
                match self.name_transform.write_long_name_at(&dirfd, &cname, &path) {
                    Ok(()) => true,
                    Err(Errno::EEXIST) => false,
                    Err(e) => return Err(e.into()),
                };
            match sys::openat(&dirfd, &cname, flags, mode) {
                Ok(fd) => fd,
                Err(e) => {
                    if created_sidecar {
                        let _ = self.name_transform.delete_long_name_at(&dirfd, &cname);
                    }
                    return Err(e.into());
                }
            }
        } else {
            sys::openat(&dirfd, &cname, flags, mode)?
        };
        Ok(self.handles.register(File::from(fd), path))
    }

    /// Close a handle, waiting for in-flight I/O on it.
    pub fn close_file(&self, id: HandleId) -> Result<(), OpError> {
        if self.handles.close(id) {
            Ok(())
        } else {
            Err(OpError::BadHandle(id))
        }
    }

    // ---- content I/O ----------------------------------------------------

    /// Read up to `length` plaintext bytes at `offset`. Short reads happen
    /// at EOF; an empty file reads as empty. Requests over the 128 KiB cap
    /// transfer zero bytes.
    pub fn read_file(
        &self,
        id: HandleId,
        offset: u64,
        length: usize,
    ) -> Result<Vec<u8>, OpError> {
        if length > MAX_KERNEL_WRITE {
            warn!(length, "read request exceeds the request cap");
            return Ok(Vec::new());
        }
        let h = self.handle(id)?;
        let _fd_guard = h.fd_lock().read();
        let _content_guard = h.content_lock().read();
        self.do_read(&h, offset, length as u64)
    }

    /// Write `data` at plaintext `offset`. Requests over the 128 KiB cap
    /// transfer zero bytes.
    pub fn write_file(&self, id: HandleId, data: &[u8], offset: u64) -> Result<usize, OpError> {
        if data.len() > MAX_KERNEL_WRITE {
            warn!(length = data.len(), "write request exceeds the request cap");
            return Ok(0);
        }
        let h = self.handle(id)?;
        let _fd_guard = h.fd_lock().read();
        let _content_guard = h.content_lock().write();
        self.do_write(&h, id, data, offset)
    }

    /// Truncate the file behind `id` to `new_size` plaintext bytes.
    pub fn truncate(&self, id: HandleId, new_size: u64) -> Result<(), OpError> {
        let h = self.handle(id)?;
        let _fd_guard = h.fd_lock().read();
        let _content_guard = h.content_lock().write();

        if new_size == 0 {
            sys::ftruncate(h.file(), 0)?;
            // The next write must lay down a fresh header
            h.clear_cached_id();
            return Ok(());
        }
        let old_size = self.get_attrs(h.path())?.size;
        if new_size == old_size {
            return Ok(());
        }
        if new_size > old_size {
            return self.truncate_grow(&h, id, old_size, new_size);
        }

        // Shrink: re-write the partial final block after cutting at the
        // containing block boundary.
        let block_no = self.content_enc.plain_off_to_block_no(new_size);
        let cipher_off = self.content_enc.block_no_to_cipher_off(block_no);
        let plain_off = self.content_enc.block_no_to_plain_off(block_no);
        let last_block_len = new_size - plain_off;
        let data = if last_block_len > 0 {
            self.do_read(&h, plain_off, last_block_len)?
        } else {
            Vec::new()
        };
        sys::ftruncate(h.file(), cipher_off)?;
        if last_block_len > 0 {
            self.do_write(&h, id, &data, plain_off)?;
        }
        Ok(())
    }

    /// Load the file ID from the handle cache or the on-disk header.
    /// `None` means the file is empty (header-only files count as empty,
    /// which keeps file-ID poisoning out of reach).
    fn load_file_id(&self, h: &FileHandle) -> Result<Option<FileId>, OpError> {
        if let Some(id) = h.cached_id() {
            return Ok(Some(id));
        }
        let mut buf = [0u8; HEADER_LEN + 1];
        let n = sys::pread_full(h.file(), &mut buf, 0)?;
        if n < HEADER_LEN + 1 {
            return Ok(None);
        }
        let header = FileHeader::parse(&buf[..HEADER_LEN])?;
        h.set_cached_id(header.id.clone());
        Ok(Some(header.id))
    }

    /// Write a fresh random header, preallocating its space first.
    fn create_header(&self, h: &FileHandle) -> Result<FileId, OpError> {
        let header = FileHeader::random();
        sys::enospc_prealloc(h.file(), 0, HEADER_LEN as u64)?;
        sys::pwrite_full(h.file(), &header.pack(), 0)?;
        h.set_cached_id(header.id.clone());
        Ok(header.id)
    }

    /// Decrypt the plaintext range `[offset, offset+length)`. Caller holds
    /// the fd lock and at least a shared content lock.
    fn do_read(&self, h: &FileHandle, offset: u64, length: u64) -> Result<Vec<u8>, OpError> {
        let Some(file_id) = self.load_file_id(h)? else {
            return Ok(Vec::new());
        };
        let blocks = self.content_enc.explode_plain_range(offset, length);
        if blocks.is_empty() {
            return Ok(Vec::new());
        }
        let (c_off, c_len) = self.content_enc.joint_ciphertext_range(&blocks);

        let mut ciphertext = self.content_enc.get_ciphertext_buf();
        ciphertext.resize(c_len as usize, 0);
        let n = sys::pread_full(h.file(), &mut ciphertext, c_off)?;
        if n == 0 {
            self.content_enc.put_ciphertext_buf(ciphertext);
            return Ok(Vec::new());
        }
        ciphertext.truncate(n);

        let plain = match self
            .content_enc
            .decrypt_blocks(&ciphertext, blocks[0].block_no, &file_id)
        {
            Ok(plain) => plain,
            Err(e) => {
                self.content_enc.put_ciphertext_buf(ciphertext);
                return Err(e.into());
            }
        };
        self.content_enc.put_ciphertext_buf(ciphertext);

        // Crop to the requested window
        let skip = blocks[0].skip as usize;
        let want = skip + length as usize;
        let out = if plain.len() > skip {
            plain[skip..plain.len().min(want)].to_vec()
        } else {
            Vec::new()
        };
        self.content_enc.put_plaintext_buf(plain);
        Ok(out)
    }

    /// Encrypt and write `data` at plaintext `offset`, read-modify-writing
    /// partial blocks. Caller holds the fd lock and the content lock
    /// exclusively.
    fn do_write(
        &self,
        h: &FileHandle,
        id: HandleId,
        data: &[u8],
        offset: u64,
    ) -> Result<usize, OpError> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut file_was_empty = false;
        let file_id = match self.load_file_id(h)? {
            Some(file_id) => file_id,
            None => {
                file_was_empty = true;
                self.create_header(h)?
            }
        };

        let blocks = self
            .content_enc
            .explode_plain_range(offset, data.len() as u64);
        let mut to_encrypt = Vec::with_capacity(blocks.len());
        let mut consumed = 0usize;
        for b in &blocks {
            let chunk = &data[consumed..consumed + b.length as usize];
            consumed += b.length as usize;
            if self.content_enc.is_partial(b) {
                let old = self.do_read(
                    h,
                    self.content_enc.block_no_to_plain_off(b.block_no),
                    self.content_enc.plain_bs(),
                )?;
                to_encrypt
                    .push(self.content_enc.merge_blocks(&old, chunk, b.skip as usize));
            } else {
                to_encrypt.push(chunk.to_vec());
            }
        }

        let ciphertext = self
            .content_enc
            .encrypt_blocks(&to_encrypt, blocks[0].block_no, &file_id);
        let c_off = self.content_enc.block_no_to_cipher_off(blocks[0].block_no);

        // Preallocate so the write cannot tear a block on ENOSPC
        if let Err(e) = sys::enospc_prealloc(h.file(), c_off, ciphertext.len() as u64) {
            self.content_enc.put_ciphertext_buf(ciphertext);
            if file_was_empty {
                // Kill the header again: a header-only file must not remain
                let _ = sys::ftruncate(h.file(), 0);
                self.handles.evict(id);
            }
            return Err(e.into());
        }
        let res = sys::pwrite_full(h.file(), &ciphertext, c_off);
        self.content_enc.put_ciphertext_buf(ciphertext);
        res?;
        Ok(data.len())
    }

    /// Grow a file, padding the old final block and punching holes for
    /// skipped blocks.
    fn truncate_grow(
        &self,
        h: &FileHandle,
        id: HandleId,
        old_size: u64,
        new_size: u64,
    ) -> Result<(), OpError> {
        let bs = self.content_enc.plain_bs();
        let new_eof = new_size - 1;
        if old_size > 0
            && self.content_enc.plain_off_to_block_no(old_size - 1)
                == self.content_enc.plain_off_to_block_no(new_eof)
        {
            // Grown within one block: a single zero at the new EOF and the
            // write path's RMW fills the gap.
            self.do_write(h, id, &[0], new_eof)?;
            return Ok(());
        }
        // Pad the old final block up to the boundary
        let last_block_len = old_size % bs;
        if last_block_len > 0 {
            let pad = vec![0u8; (bs - last_block_len) as usize];
            self.do_write(h, id, &pad, old_size)?;
        }
        if new_size % bs == 0 {
            // Block-aligned target: everything in between becomes a hole
            if old_size == 0 {
                self.create_header(h)?;
            }
            let c_size = self.content_enc.plain_size_to_cipher_size(new_size);
            sys::ftruncate(h.file(), c_size)?;
            return Ok(());
        }
        self.do_write(h, id, &[0], new_eof)?;
        Ok(())
    }

    // ---- metadata -------------------------------------------------------

    /// Stat a path; sizes are translated to plaintext, symlink size is the
    /// decrypted target length.
    pub fn get_attrs(&self, path: &str) -> Result<Attrs, OpError> {
        let path = normalize_path(path)?;
        let (dirfd, cname) = self.prepare_at(&path)?;
        let st = sys::fstatat(&dirfd, &cname)?;
        let size = if sys::is_regular(st.st_mode) {
            self.content_enc.cipher_size_to_plain_size(st.st_size as u64)
        } else if sys::is_symlink(st.st_mode) {
            match self.readlink_at(&dirfd, &cname) {
                Ok(target) => target.len() as u64,
                Err(e) => {
                    warn!(path = %path, error = %e, "cannot size symlink target");
                    0
                }
            }
        } else {
            st.st_size as u64
        };
        Ok(Attrs {
            size,
            mtime: st.st_mtime,
        })
    }

    /// Read and decrypt a symlink target.
    pub fn readlink(&self, path: &str) -> Result<Vec<u8>, OpError> {
        let path = normalize_path(path)?;
        let (dirfd, cname) = self.prepare_at(&path)?;
        self.readlink_at(&dirfd, &cname)
    }

    fn readlink_at<Fd: AsFd>(&self, dirfd: &Fd, cname: &str) -> Result<Vec<u8>, OpError> {
        let c_target = sys::readlinkat(dirfd, cname)?;
        if self.flags.plaintext_names {
            return Ok(c_target.into_vec());
        }
        let c_target = c_target.into_string().map_err(|_| Errno::EBADMSG)?;
        // Symlink targets are encrypted like file contents: a single AEAD
        // block, number 0, no file ID, base64-encoded.
        if c_target.is_empty() {
            return Ok(Vec::new());
        }
        let c_data = self
            .name_transform
            .b64_decode(&c_target)
            .map_err(|_| Errno::EBADMSG)?;
        Ok(self.content_enc.decrypt_block(&c_data, 0, None)?)
    }

    /// List a directory: DirIV and sidecar files are dropped, long names
    /// dereferenced, everything decrypted. Entries that fail to decrypt are
    /// skipped, not fatal.
    pub fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, OpError> {
        let path = normalize_path(path)?;
        let is_root = path.is_empty();
        let (parent_fd, c_dir_name) = self.prepare_at(&path)?;
        let dirfd = sys::openat(
            &parent_fd,
            &c_dir_name,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW,
            Mode::empty(),
        )?;

        // Listing must observe the directory and its DirIV as a pair
        let (raw_entries, iv) = {
            let _guard = self.dir_iv_lock.read();
            let raw = sys::getdents(&dirfd, ".", OFlag::O_RDONLY)?;
            let iv = self.read_dir_iv(&dirfd)?;
            (raw, iv)
        };

        let mut entries = Vec::with_capacity(raw_entries.len());
        for entry in raw_entries {
            if is_root && entry.name == CONF_FILENAME {
                continue;
            }
            if self.flags.plaintext_names {
                entries.push(DirEntry {
                    name: entry.name,
                    mode: entry.mode,
                });
                continue;
            }
            let cname = match name_type(&entry.name) {
                NameType::DirIv | NameType::LongSidecar => continue,
                NameType::LongContent => {
                    match self.name_transform.read_long_name_at(&dirfd, &entry.name) {
                        Ok(full) => full,
                        Err(e) => {
                            warn!(name = %entry.name, error = %e, "skipping unresolvable long name");
                            continue;
                        }
                    }
                }
                NameType::Normal => entry.name.clone(),
            };
            let iv = iv.as_ref().expect("encrypted volumes always have an IV");
            match self.name_transform.decrypt_name(&cname, iv) {
                Ok(name) => entries.push(DirEntry {
                    name,
                    mode: entry.mode,
                }),
                Err(e) => {
                    debug!(name = %entry.name, error = %e, "skipping undecryptable entry");
                }
            }
        }
        Ok(entries)
    }

    // ---- directories ----------------------------------------------------

    /// Create a directory together with its DirIV.
    pub fn mkdir(&self, path: &str, mode: u32) -> Result<(), OpError> {
        let path = normalize_path(path)?;
        let (dirfd, cname) = self.prepare_at(&path)?;

        if self.flags.plaintext_names {
            sys::mkdirat(&dirfd, &cname, Mode::from_bits_truncate(mode))?;
            sys::fstatat(&dirfd, &cname)?;
            return Ok(());
        }

        // Owner rwx is needed to create the DirIV and re-open the directory
        let orig_mode = mode;
        let mode = mode | 0o700;

        let created_sidecar = if is_long_content(&cname) {
            match self.name_transform.write_long_name_at(&dirfd, &cname, &path) {
                Ok(()) => true,
                Err(Errno::EEXIST) => false,
                Err(e) => return Err(e.into()),
            }
        } else {
            false
        };
        if let Err(e) = self.mkdir_with_iv(&dirfd, &cname, mode) {
            if created_sidecar {
                let _ = self.name_transform.delete_long_name_at(&dirfd, &cname);
            }
            return Err(e.into());
        }

        if orig_mode != mode {
            // Restore the requested permissions, keeping an inherited SGID
            let fd = sys::openat(
                &dirfd,
                &cname,
                OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW,
                Mode::empty(),
            )?;
            let st = sys::fstat(&fd)?;
            let final_mode = (st.st_mode & !0o777) | orig_mode;
            sys::fchmod(&fd, Mode::from_bits_truncate(final_mode))?;
        }
        Ok(())
    }

    /// `mkdirat` plus DirIV creation under the DirIV lock; rolled back if
    /// the IV cannot be written (a directory without its IV must not be
    /// observable).
    fn mkdir_with_iv<Fd: AsFd>(&self, dirfd: &Fd, cname: &str, mode: u32) -> Result<(), Errno> {
        if !self.flags.dir_iv {
            return sys::mkdirat(dirfd, cname, Mode::from_bits_truncate(mode));
        }
        let _guard = self.dir_iv_lock.write();
        sys::mkdirat(dirfd, cname, Mode::from_bits_truncate(mode))?;
        let res = sys::openat(
            dirfd,
            cname,
            OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_PATH,
            Mode::empty(),
        )
        .and_then(|new_dir| create_diriv_at(&new_dir));
        if let Err(e) = res {
            let _ = sys::unlinkat(dirfd, cname, true);
            return Err(e);
        }
        Ok(())
    }

    /// Remove an empty directory. "Empty" tolerates exactly the DirIV file,
    /// which is renamed out to the parent under a unique temporary name so
    /// the rmdir can proceed; a failed rmdir renames it back.
    pub fn rmdir(&self, path: &str) -> Result<(), OpError> {
        let path = normalize_path(path)?;
        let (parent_fd, cname) = self.prepare_at(&path)?;

        if self.flags.plaintext_names {
            sys::unlinkat(&parent_fd, &cname, true)?;
            return Ok(());
        }

        let dirfd = sys::openat(
            &parent_fd,
            &cname,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW,
            Mode::empty(),
        )?;
        let children = sys::getdents(&dirfd, ".", OFlag::O_RDONLY)?;
        if children.is_empty() {
            sys::unlinkat(&parent_fd, &cname, true)?;
        } else {
            if children.iter().any(|c| c.name != DIRIV_FILENAME) {
                return Err(Errno::ENOTEMPTY.into());
            }
            let tmp_name = format!("{DIRIV_FILENAME}.rmdir.{}", rand::random::<u64>());
            // Between the rename and the rmdir the directory has no DirIV
            let _guard = self.dir_iv_lock.write();
            sys::renameat(&dirfd, DIRIV_FILENAME, &parent_fd, &tmp_name)?;
            if let Err(e) = sys::unlinkat(&parent_fd, &cname, true) {
                // A concurrent create beat us to it: restore the DirIV
                let _ = sys::renameat(&parent_fd, &tmp_name, &dirfd, DIRIV_FILENAME);
                return Err(e.into());
            }
            let _ = sys::unlinkat(&parent_fd, &tmp_name, false);
        }

        if is_long_content(&cname) {
            let _ = self.name_transform.delete_long_name_at(&parent_fd, &cname);
        }
        self.dir_cache.delete(&path);
        Ok(())
    }

    // ---- rename / unlink ------------------------------------------------

    /// Rename `old_path` to `new_path`. A directory target that is empty
    /// except for its DirIV makes the kernel report ENOTEMPTY/EEXIST; that
    /// target is rmdir'ed and the rename retried once.
    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<(), OpError> {
        let old_path = normalize_path(old_path)?;
        let new_path = normalize_path(new_path)?;
        let (old_dirfd, old_cname) = self.prepare_at(&old_path)?;
        let (new_dirfd, new_cname) = self.prepare_at(&new_path)?;

        if self.flags.plaintext_names {
            sys::renameat(&old_dirfd, &old_cname, &new_dirfd, &new_cname)?;
            return Ok(());
        }

        // Long destination: pre-create the sidecar; EEXIST means the hash
        // already identifies an equivalent name and must not be rolled back.
        let mut name_file_already_there = false;
        if is_long_content(&new_cname) {
            match self
                .name_transform
                .write_long_name_at(&new_dirfd, &new_cname, &new_path)
            {
                Ok(()) => {}
                Err(Errno::EEXIST) => name_file_already_there = true,
                Err(e) => return Err(e.into()),
            }
        }

        let mut res = sys::renameat(&old_dirfd, &old_cname, &new_dirfd, &new_cname);
        if matches!(res, Err(Errno::ENOTEMPTY) | Err(Errno::EEXIST)) {
            // An "empty" directory target still contains its DirIV (ext4
            // says ENOTEMPTY, xfs says EEXIST). Remove it and retry once.
            if self.rmdir(&new_path).is_ok() {
                res = sys::renameat(&old_dirfd, &old_cname, &new_dirfd, &new_cname);
            }
        }
        if let Err(e) = res {
            if is_long_content(&new_cname) && !name_file_already_there {
                let _ = self
                    .name_transform
                    .delete_long_name_at(&new_dirfd, &new_cname);
            }
            return Err(e.into());
        }

        if is_long_content(&old_cname) {
            let _ = self
                .name_transform
                .delete_long_name_at(&old_dirfd, &old_cname);
        }
        self.dir_cache.delete(&old_path);
        self.dir_cache.delete(&new_path);
        Ok(())
    }

    /// Unlink a file and, for long names, its sidecar.
    pub fn remove_file(&self, path: &str) -> Result<(), OpError> {
        let path = normalize_path(path)?;
        let (dirfd, cname) = self.prepare_at(&path)?;
        sys::unlinkat(&dirfd, &cname, false)?;
        if !self.flags.plaintext_names && is_long_content(&cname) {
            self.name_transform.delete_long_name_at(&dirfd, &cname)?;
        }
        Ok(())
    }
}
