//! The per-directory IV sidecar `gocryptfs.diriv`.
//!
//! Every ciphertext directory (root included) carries exactly 16 random
//! bytes in `gocryptfs.diriv`, used as the EME tweak for the names of its
//! children. Creation and removal must stay atomically consistent with the
//! directory itself; the volume layer serializes that with its DirIV lock.

use std::fs::File;
use std::io::Write;
use std::os::fd::AsFd;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use rand::{rngs::OsRng, RngCore};

use crate::sys;

/// Name of the per-directory IV file.
pub const DIRIV_FILENAME: &str = "gocryptfs.diriv";

/// Length of the IV payload.
pub const DIRIV_LEN: usize = 16;

pub type DirIv = [u8; DIRIV_LEN];

pub(crate) fn io_to_errno(e: std::io::Error) -> Errno {
    e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

/// Create `gocryptfs.diriv` with fresh random content inside the directory
/// `dirfd` refers to. The 16-byte write is atomic (well below the pipe
/// buffer, no partial writes).
pub fn create_diriv_at<Fd: AsFd>(dirfd: &Fd) -> nix::Result<()> {
    let mut iv: DirIv = [0u8; DIRIV_LEN];
    OsRng.fill_bytes(&mut iv);
    let fd = sys::openat(
        dirfd,
        DIRIV_FILENAME,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_EXCL,
        Mode::from_bits_truncate(0o400),
    )?;
    let mut file = File::from(fd);
    file.write_all(&iv).map_err(io_to_errno)
}

/// Read the 16-byte IV of the directory `dirfd` refers to.
pub fn read_diriv_at<Fd: AsFd>(dirfd: &Fd) -> nix::Result<DirIv> {
    let fd = sys::openat(
        dirfd,
        DIRIV_FILENAME,
        OFlag::O_RDONLY | OFlag::O_NOFOLLOW,
        Mode::empty(),
    )?;
    let file = File::from(fd);
    // One extra byte so an oversized file is detected.
    let mut buf = [0u8; DIRIV_LEN + 1];
    let n = sys::pread_full(&file, &mut buf, 0).map_err(io_to_errno)?;
    if n != DIRIV_LEN {
        return Err(Errno::EINVAL);
    }
    let mut iv: DirIv = [0u8; DIRIV_LEN];
    iv.copy_from_slice(&buf[..DIRIV_LEN]);
    Ok(iv)
}
