//! Bounded cache of open directory handles and their DirIVs.
//!
//! Path resolution hits the same parent directories over and over; a handful
//! of slots captures most of that locality (20 entries work well for
//! `git status` over sshfs) while keeping fd consumption negligible. The
//! cache is a fixed-size round-robin array protected by one mutex, flushed
//! completely every 60 seconds by a background thread.

use std::os::fd::OwnedFd;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::fs::diriv::DirIv;

/// Number of cache slots.
const DIR_CACHE_SIZE: usize = 20;

/// Interval of the periodic full flush.
const EXPIRY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Slot {
    path: String,
    /// `O_PATH` fd of the directory; `None` marks an empty slot.
    fd: Option<Arc<OwnedFd>>,
    /// DirIV of the directory; `None` in plaintextnames mode.
    iv: Option<DirIv>,
}

impl Slot {
    fn clear(&mut self) {
        self.fd = None;
        self.path.clear();
        self.iv = None;
    }
}

#[derive(Default)]
struct Inner {
    slots: [Slot; DIR_CACHE_SIZE],
    /// Round-robin replacement cursor.
    next_index: usize,
    expire_thread_running: bool,
    // Hit rate stats, advisory only.
    lookups: u64,
    hits: u64,
}

/// Advisory cache statistics.
#[derive(Debug, Clone, Copy)]
pub struct DirCacheStats {
    pub lookups: u64,
    pub hits: u64,
}

/// Cache of `parent plaintext path -> (dirfd, DirIV)`.
pub struct DirCache {
    /// Whether stored entries must carry an IV (false in plaintextnames
    /// mode). Mismatches are program invariant violations and abort.
    expect_iv: bool,
    inner: Arc<Mutex<Inner>>,
}

impl DirCache {
    pub fn new(expect_iv: bool) -> Self {
        Self {
            expect_iv,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Store an entry, evicting round-robin. The caller keeps its own
    /// reference to `fd`; the cache holds a shared one.
    pub fn store(&self, path: &str, fd: Arc<OwnedFd>, iv: Option<DirIv>) {
        // A mismatched IV cannot come from external input; it means a caller
        // bypassed the feature-flag wiring.
        assert!(
            iv.is_some() == self.expect_iv,
            "DirCache store sanity check failed: iv present = {}",
            iv.is_some()
        );
        let mut inner = self.inner.lock();
        let index = inner.next_index;
        inner.next_index = (index + 1) % DIR_CACHE_SIZE;
        let slot = &mut inner.slots[index];
        slot.clear();
        slot.path = path.to_owned();
        slot.fd = Some(fd);
        slot.iv = iv;
        trace!(path, index, "dircache store");
        if !inner.expire_thread_running {
            inner.expire_thread_running = true;
            self.spawn_expire_thread();
        }
    }

    /// Look up a path; returns a shared fd and the cached IV.
    pub fn lookup(&self, path: &str) -> Option<(Arc<OwnedFd>, Option<DirIv>)> {
        let mut inner = self.inner.lock();
        inner.lookups += 1;
        let hit = inner
            .slots
            .iter()
            .find(|s| s.fd.is_some() && s.path == path)
            .map(|s| (Arc::clone(s.fd.as_ref().expect("checked above")), s.iv));
        if let Some((_, iv)) = &hit {
            assert!(
                iv.is_some() == self.expect_iv,
                "DirCache lookup sanity check failed: iv present = {}",
                iv.is_some()
            );
            inner.hits += 1;
            trace!(path, "dircache hit");
        }
        hit
    }

    /// Drop the entry for `path`, if cached. Called on rmdir and rename.
    pub fn delete(&self, path: &str) {
        let mut inner = self.inner.lock();
        for slot in inner.slots.iter_mut() {
            if slot.fd.is_some() && slot.path == path {
                slot.clear();
                debug!(path, "dircache delete");
                break;
            }
        }
    }

    /// Drop all entries.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for slot in inner.slots.iter_mut() {
            slot.clear();
        }
    }

    pub fn stats(&self) -> DirCacheStats {
        let inner = self.inner.lock();
        DirCacheStats {
            lookups: inner.lookups,
            hits: inner.hits,
        }
    }

    /// Periodic flush; one long-lived thread per volume, started on the
    /// first store, exiting when the cache is dropped.
    fn spawn_expire_thread(&self) {
        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        let _ = std::thread::Builder::new()
            .name("dircache-expire".into())
            .spawn(move || loop {
                std::thread::sleep(EXPIRY_INTERVAL);
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let mut inner = inner.lock();
                for slot in inner.slots.iter_mut() {
                    slot.clear();
                }
                trace!("dircache expired");
            });
    }
}

impl std::fmt::Debug for DirCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirCache")
            .field("expect_iv", &self.expect_iv)
            .finish_non_exhaustive()
    }
}
