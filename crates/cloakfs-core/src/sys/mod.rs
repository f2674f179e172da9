//! Thin wrappers around the `*at` syscall family.
//!
//! Everything that touches the ciphertext tree goes through these wrappers:
//! they force `O_NOFOLLOW` on non-creating opens, retry `EINTR` for the
//! syscalls where a retry is safe (openat, renameat, fstatat, fallocate),
//! and provide the keep-size preallocation that makes content writes
//! ENOSPC-safe. read/write are never retried since partial progress may have
//! occurred.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::FileExt;

use nix::dir::Dir;
use nix::errno::Errno;
use nix::fcntl::{self, FallocateFlags, OFlag};
use nix::sys::stat::{self, FileStat, Mode};
use nix::unistd::UnlinkatFlags;

/// A raw ciphertext directory entry: name plus the file-type bits recovered
/// from `d_type` (`S_IFMT` positions; permission bits are not populated).
#[derive(Debug, Clone)]
pub struct RawDirEntry {
    pub name: String,
    pub mode: u32,
}

fn retry_eintr<T>(mut f: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match f() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// Open a path relative to the current directory (used only for the volume
/// root, where following symlinks is allowed).
pub fn open(path: &std::path::Path, flags: OFlag, mode: Mode) -> nix::Result<OwnedFd> {
    retry_eintr(|| fcntl::open(path, flags, mode))
        .map(|raw| unsafe { OwnedFd::from_raw_fd(raw) })
}

/// `openat` with `O_NOFOLLOW` forced on every non-creating open.
pub fn openat<Fd: AsFd>(
    dirfd: &Fd,
    name: &str,
    mut flags: OFlag,
    mode: Mode,
) -> nix::Result<OwnedFd> {
    if !flags.contains(OFlag::O_CREAT) {
        flags |= OFlag::O_NOFOLLOW;
    }
    let dirfd = Some(dirfd.as_fd().as_raw_fd());
    retry_eintr(|| fcntl::openat(dirfd, name, flags, mode))
        .map(|raw| unsafe { OwnedFd::from_raw_fd(raw) })
}

pub fn mkdirat<Fd: AsFd>(dirfd: &Fd, name: &str, mode: Mode) -> nix::Result<()> {
    stat::mkdirat(Some(dirfd.as_fd().as_raw_fd()), name, mode)
}

pub fn unlinkat<Fd: AsFd>(dirfd: &Fd, name: &str, remove_dir: bool) -> nix::Result<()> {
    let flag = if remove_dir {
        UnlinkatFlags::RemoveDir
    } else {
        UnlinkatFlags::NoRemoveDir
    };
    nix::unistd::unlinkat(Some(dirfd.as_fd().as_raw_fd()), name, flag)
}

pub fn renameat<Fd1: AsFd, Fd2: AsFd>(
    old_dirfd: &Fd1,
    old_name: &str,
    new_dirfd: &Fd2,
    new_name: &str,
) -> nix::Result<()> {
    let old_dirfd = Some(old_dirfd.as_fd().as_raw_fd());
    let new_dirfd = Some(new_dirfd.as_fd().as_raw_fd());
    retry_eintr(|| fcntl::renameat(old_dirfd, old_name, new_dirfd, new_name))
}

/// `fstatat` with `AT_SYMLINK_NOFOLLOW` always set.
pub fn fstatat<Fd: AsFd>(dirfd: &Fd, name: &str) -> nix::Result<FileStat> {
    let dirfd = Some(dirfd.as_fd().as_raw_fd());
    retry_eintr(|| stat::fstatat(dirfd, name, fcntl::AtFlags::AT_SYMLINK_NOFOLLOW))
}

pub fn fstat<Fd: AsFd>(fd: &Fd) -> nix::Result<FileStat> {
    stat::fstat(fd.as_fd().as_raw_fd())
}

pub fn fchmod<Fd: AsFd>(fd: &Fd, mode: Mode) -> nix::Result<()> {
    stat::fchmod(fd.as_fd().as_raw_fd(), mode)
}

pub fn readlinkat<Fd: AsFd>(dirfd: &Fd, name: &str) -> nix::Result<std::ffi::OsString> {
    fcntl::readlinkat(Some(dirfd.as_fd().as_raw_fd()), name)
}

pub fn ftruncate(file: &File, len: u64) -> nix::Result<()> {
    nix::unistd::ftruncate(file, len as libc::off_t)
}

/// Preallocate ciphertext space without changing the file size, so a
/// subsequent write cannot run out of space halfway through a block.
///
/// `EOPNOTSUPP` (filesystems without fallocate) is swallowed; the write then
/// proceeds without the torn-block guarantee, same as the original.
pub fn enospc_prealloc(file: &File, off: u64, len: u64) -> nix::Result<()> {
    match retry_eintr(|| {
        fcntl::fallocate(
            file.as_raw_fd(),
            FallocateFlags::FALLOC_FL_KEEP_SIZE,
            off as libc::off_t,
            len as libc::off_t,
        )
    }) {
        Err(Errno::EOPNOTSUPP) => Ok(()),
        other => other,
    }
}

/// Read the entries of the directory `name` under `dirfd`, with `.` and `..`
/// filtered out. Entries whose names are not valid UTF-8 are skipped; the
/// encrypted names this engine writes are always base64 or `gocryptfs.*`.
pub fn getdents<Fd: AsFd>(dirfd: &Fd, name: &str, flags: OFlag) -> nix::Result<Vec<RawDirEntry>> {
    let mut dir = Dir::openat(
        Some(dirfd.as_fd().as_raw_fd()),
        name,
        flags | OFlag::O_DIRECTORY,
        Mode::empty(),
    )?;
    let mut entries = Vec::new();
    for entry in dir.iter() {
        let entry = entry?;
        let bytes = entry.file_name().to_bytes();
        if bytes == b"." || bytes == b".." {
            continue;
        }
        let Ok(name) = std::str::from_utf8(bytes) else {
            continue;
        };
        entries.push(RawDirEntry {
            name: name.to_owned(),
            mode: file_type_mode(entry.file_type()),
        });
    }
    Ok(entries)
}

fn file_type_mode(t: Option<nix::dir::Type>) -> u32 {
    use nix::dir::Type;
    (match t {
        Some(Type::Fifo) => libc::S_IFIFO,
        Some(Type::CharacterDevice) => libc::S_IFCHR,
        Some(Type::Directory) => libc::S_IFDIR,
        Some(Type::BlockDevice) => libc::S_IFBLK,
        Some(Type::File) => libc::S_IFREG,
        Some(Type::Symlink) => libc::S_IFLNK,
        Some(Type::Socket) => libc::S_IFSOCK,
        None => 0,
    }) as u32
}

/// Positioned read that loops until `buf` is full or EOF; returns the number
/// of bytes read. `File::read_at` may return short reads, the callers always
/// want the whole range.
pub fn pread_full(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// Positioned write of the whole buffer.
pub fn pwrite_full(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    file.write_all_at(buf, offset)
}

pub fn is_regular(mode: u32) -> bool {
    mode & libc::S_IFMT as u32 == libc::S_IFREG as u32
}

pub fn is_symlink(mode: u32) -> bool {
    mode & libc::S_IFMT as u32 == libc::S_IFLNK as u32
}
