//! Per-volume table of open file handles.
//!
//! Every handle owns the ciphertext fd, the plaintext path (for the re-stat
//! during truncate), the cached 16-byte file ID once the header has been
//! read, and two reader/writer locks: the fd lock (read-shared by all I/O,
//! write-exclusive in close) and the content lock (read-shared by reads,
//! write-exclusive by writes and truncates). Lock order is fd lock first,
//! then content lock.

use std::fs::File;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use zeroize::Zeroize;

use crate::fs::content::FileId;

pub type HandleId = i32;

/// One open file.
pub struct FileHandle {
    file: File,
    path: String,
    id: Mutex<Option<FileId>>,
    fd_lock: RwLock<()>,
    content_lock: RwLock<()>,
}

impl FileHandle {
    fn new(file: File, path: String) -> Self {
        Self {
            file,
            path,
            id: Mutex::new(None),
            fd_lock: RwLock::new(()),
            content_lock: RwLock::new(()),
        }
    }

    /// The ciphertext fd. I/O through it must hold the fd lock (read).
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Plaintext path the handle was opened with.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn cached_id(&self) -> Option<FileId> {
        self.id.lock().clone()
    }

    pub fn set_cached_id(&self, id: FileId) {
        *self.id.lock() = Some(id);
    }

    /// Zeroize and drop the cached file ID.
    pub fn clear_cached_id(&self) {
        if let Some(mut id) = self.id.lock().take() {
            id.0.zeroize();
        }
    }

    pub fn fd_lock(&self) -> &RwLock<()> {
        &self.fd_lock
    }

    pub fn content_lock(&self) -> &RwLock<()> {
        &self.content_lock
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Concurrent map of handle id to open file, with lowest-free-id
/// allocation.
#[derive(Debug, Default)]
pub struct HandleTable {
    handles: DashMap<HandleId, Arc<FileHandle>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an open ciphertext fd under the lowest unused id.
    pub fn register(&self, file: File, path: String) -> HandleId {
        let handle = Arc::new(FileHandle::new(file, path));
        // The entry API makes the check-and-insert atomic per id; concurrent
        // registrations simply move on to the next candidate.
        for id in 0.. {
            if let Entry::Vacant(slot) = self.handles.entry(id) {
                slot.insert(Arc::clone(&handle));
                return id;
            }
        }
        unreachable!("handle id space exhausted");
    }

    pub fn get(&self, id: HandleId) -> Option<Arc<FileHandle>> {
        self.handles.get(&id).map(|h| Arc::clone(&h))
    }

    /// Remove and close one handle: waits for in-flight I/O (fd lock,
    /// write), zeroizes the cached file ID, and closes the fd when the last
    /// reference drops.
    pub fn close(&self, id: HandleId) -> bool {
        let Some((_, handle)) = self.handles.remove(&id) else {
            return false;
        };
        let _guard = handle.fd_lock().write();
        handle.clear_cached_id();
        true
    }

    /// Remove a handle without waiting for in-flight I/O. Used by the write
    /// path's ENOSPC rollback, where the caller itself still holds the fd
    /// lock (read).
    pub fn evict(&self, id: HandleId) {
        if let Some((_, handle)) = self.handles.remove(&id) {
            handle.clear_cached_id();
        }
    }

    /// Close every handle; used by volume close.
    pub fn close_all(&self) {
        let ids: Vec<HandleId> = self.handles.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.close(id);
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tmp_handle_file(dir: &tempfile::TempDir, name: &str) -> File {
        File::create(dir.path().join(name)).unwrap()
    }

    #[test]
    fn test_register_allocates_lowest_free_id() {
        let dir = tempdir().unwrap();
        let table = HandleTable::new();
        let a = table.register(tmp_handle_file(&dir, "a"), "a".into());
        let b = table.register(tmp_handle_file(&dir, "b"), "b".into());
        let c = table.register(tmp_handle_file(&dir, "c"), "c".into());
        assert_eq!((a, b, c), (0, 1, 2));

        // Freed ids are reused, lowest first
        assert!(table.close(b));
        let d = table.register(tmp_handle_file(&dir, "d"), "d".into());
        assert_eq!(d, 1);
    }

    #[test]
    fn test_get_and_close() {
        let dir = tempdir().unwrap();
        let table = HandleTable::new();
        let id = table.register(tmp_handle_file(&dir, "f"), "f".into());
        assert!(table.get(id).is_some());
        assert_eq!(table.get(id).unwrap().path(), "f");

        assert!(table.close(id));
        assert!(table.get(id).is_none());
        // Double close reports failure instead of panicking
        assert!(!table.close(id));
    }

    #[test]
    fn test_cached_id_lifecycle() {
        let dir = tempdir().unwrap();
        let table = HandleTable::new();
        let id = table.register(tmp_handle_file(&dir, "f"), "f".into());
        let handle = table.get(id).unwrap();

        assert!(handle.cached_id().is_none());
        handle.set_cached_id(FileId([7u8; 16]));
        assert_eq!(handle.cached_id().unwrap().0, [7u8; 16]);
        handle.clear_cached_id();
        assert!(handle.cached_id().is_none());
    }

    #[test]
    fn test_close_all() {
        let dir = tempdir().unwrap();
        let table = HandleTable::new();
        for i in 0..5 {
            table.register(tmp_handle_file(&dir, &format!("f{i}")), format!("f{i}"));
        }
        assert_eq!(table.len(), 5);
        table.close_all();
        assert!(table.is_empty());
    }

    #[test]
    fn test_concurrent_register_unique_ids() {
        use std::sync::Arc;
        let dir = tempdir().unwrap();
        let table = Arc::new(HandleTable::new());
        let mut threads = Vec::new();
        for t in 0..8 {
            let table = Arc::clone(&table);
            let path = dir.path().to_path_buf();
            threads.push(std::thread::spawn(move || {
                (0..16)
                    .map(|i| {
                        let file = File::create(path.join(format!("t{t}-{i}"))).unwrap();
                        table.register(file, format!("t{t}-{i}"))
                    })
                    .collect::<Vec<_>>()
            }));
        }
        let mut ids: Vec<HandleId> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8 * 16);
    }
}
