//! Path resolution: plaintext path to `(parent dirfd, ciphertext leaf)`.
//!
//! The walk never follows symlinks inside the ciphertext tree: every
//! intermediate open uses `O_NOFOLLOW | O_DIRECTORY | O_PATH` and all name
//! operations go through the `*at` family on the returned fd. Resolved
//! parents land in the DirCache together with their DirIV.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tracing::trace;

use crate::fs::diriv::{read_diriv_at, DirIv};
use crate::fs::name::{base_name, parent_path, NameError};
use crate::sys;
use crate::volume::{Volume, CONF_FILENAME};

/// A resolved parent directory: either freshly opened (the volume root) or
/// shared out of the DirCache.
pub(crate) enum ParentFd {
    Owned(OwnedFd),
    Shared(Arc<OwnedFd>),
}

impl AsFd for ParentFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            ParentFd::Owned(fd) => fd.as_fd(),
            ParentFd::Shared(fd) => fd.as_fd(),
        }
    }
}

pub(crate) fn name_error_to_errno(e: NameError) -> Errno {
    match e {
        NameError::TooLong => Errno::ENAMETOOLONG,
        NameError::BadCipherName | NameError::InvalidName => Errno::EBADMSG,
    }
}

/// Canonicalize a caller path: strip slashes at both ends, collapse empty
/// components, reject `.` and `..`.
pub(crate) fn normalize_path(path: &str) -> Result<String, Errno> {
    let mut out = String::with_capacity(path.len());
    for comp in path.split('/') {
        if comp.is_empty() {
            continue;
        }
        if comp == "." || comp == ".." {
            return Err(Errno::EINVAL);
        }
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(comp);
    }
    Ok(out)
}

impl Volume {
    /// Forbidden plaintext names: with unencrypted names, `gocryptfs.conf`
    /// at the root would shadow the volume config.
    fn is_filtered(&self, path: &str) -> bool {
        self.flags.plaintext_names && path == CONF_FILENAME
    }

    fn encrypt_child(&self, child: &str, iv: Option<&DirIv>) -> Result<String, Errno> {
        if self.flags.plaintext_names {
            return Ok(child.to_owned());
        }
        let iv = iv.expect("encrypted volumes always resolve an IV");
        self.name_transform
            .encrypt_and_hash_name(child, iv)
            .map_err(name_error_to_errno)
    }

    /// Resolve a normalized plaintext path to the fd of its parent
    /// directory plus the ciphertext leaf name, suitable for `*at` calls.
    ///
    /// The root resolves to `(root_dirfd, ".")`. Parents are served from the
    /// DirCache where possible; misses resolve recursively and populate it.
    pub(crate) fn prepare_at(&self, path: &str) -> Result<(ParentFd, String), Errno> {
        if path.is_empty() {
            // Opening the root itself may follow symlinks; everything below
            // it may not.
            let fd = sys::open(
                &self.root,
                OFlag::O_DIRECTORY | OFlag::O_PATH,
                Mode::empty(),
            )?;
            return Ok((ParentFd::Owned(fd), ".".to_owned()));
        }
        if self.is_filtered(path) {
            return Err(Errno::EPERM);
        }
        let parent = parent_path(path);
        let child = base_name(path);

        if let Some((fd, iv)) = self.dir_cache.lookup(parent) {
            let cname = self.encrypt_child(child, iv.as_ref())?;
            return Ok((ParentFd::Shared(fd), cname));
        }

        // Miss: resolve the parent to its own parent, open it, learn its IV.
        let (grandparent, parent_cname) = self.prepare_at(parent)?;
        let dirfd = sys::openat(
            &grandparent,
            &parent_cname,
            OFlag::O_NOFOLLOW | OFlag::O_DIRECTORY | OFlag::O_PATH,
            Mode::empty(),
        )?;
        let iv = self.read_dir_iv(&dirfd)?;
        let dirfd = Arc::new(dirfd);
        self.dir_cache.store(parent, Arc::clone(&dirfd), iv);
        trace!(parent, "resolved and cached");
        let cname = self.encrypt_child(child, iv.as_ref())?;
        Ok((ParentFd::Shared(dirfd), cname))
    }

    /// The IV used for names inside the directory `dirfd` refers to: the
    /// on-disk DirIV normally, a zero IV for volumes without the DirIV flag,
    /// nothing in plaintextnames mode.
    pub(crate) fn read_dir_iv<Fd: AsFd>(&self, dirfd: &Fd) -> Result<Option<DirIv>, Errno> {
        if self.flags.plaintext_names {
            return Ok(None);
        }
        if !self.flags.dir_iv {
            return Ok(Some([0u8; 16]));
        }
        Ok(Some(read_diriv_at(dirfd)?))
    }
}
