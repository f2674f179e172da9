//! Registry of opened volumes.
//!
//! The host addresses volumes by small integer ids; ids are allocated lowest
//! free first and become reusable after close. Closing a volume waits for
//! in-flight I/O on each handle, releases every fd, and drops the working
//! keys.

use std::path::Path;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::crypto::keys::MasterKey;
use crate::volume::{FeatureFlags, Volume, VolumeError};

pub type VolumeId = i32;

/// Concurrent map of volume id to opened volume.
#[derive(Debug, Default)]
pub struct VolumeRegistry {
    volumes: DashMap<VolumeId, Arc<Volume>>,
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a volume and register it under the lowest unused id.
    pub fn open_volume(
        &self,
        root: &Path,
        master_key: &MasterKey,
        flags: FeatureFlags,
    ) -> Result<VolumeId, VolumeError> {
        let volume = Arc::new(Volume::new(root, master_key, flags)?);
        for id in 0.. {
            if let Entry::Vacant(slot) = self.volumes.entry(id) {
                slot.insert(Arc::clone(&volume));
                info!(id, root = %root.display(), "volume opened");
                return Ok(id);
            }
        }
        unreachable!("volume id space exhausted");
    }

    /// Fetch a volume for an operation. `None` once the id is closed.
    pub fn get(&self, id: VolumeId) -> Option<Arc<Volume>> {
        self.volumes.get(&id).map(|v| Arc::clone(&v))
    }

    /// Close a volume: all handles are closed, caches cleared, the id freed.
    /// Closing an unknown id is a no-op.
    pub fn close_volume(&self, id: VolumeId) {
        if let Some((_, volume)) = self.volumes.remove(&id) {
            volume.release();
            info!(id, "volume closed");
        }
    }

    pub fn is_closed(&self, id: VolumeId) -> bool {
        !self.volumes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::init_cipher_root;

    fn setup_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        init_cipher_root(dir.path(), &FeatureFlags::default()).unwrap();
        dir
    }

    #[test]
    fn test_ids_are_lowest_free() {
        let registry = VolumeRegistry::new();
        let key = MasterKey::new([3u8; 32]);
        let (r0, r1, r2) = (setup_root(), setup_root(), setup_root());

        let a = registry
            .open_volume(r0.path(), &key, FeatureFlags::default())
            .unwrap();
        let b = registry
            .open_volume(r1.path(), &key, FeatureFlags::default())
            .unwrap();
        assert_eq!((a, b), (0, 1));

        registry.close_volume(a);
        assert!(registry.is_closed(a));
        let c = registry
            .open_volume(r2.path(), &key, FeatureFlags::default())
            .unwrap();
        assert_eq!(c, 0);
    }

    #[test]
    fn test_operations_on_closed_id_fail_cleanly() {
        let registry = VolumeRegistry::new();
        assert!(registry.get(7).is_none());
        assert!(registry.is_closed(7));
        registry.close_volume(7); // no-op
    }

    #[test]
    fn test_close_releases_handles() {
        let registry = VolumeRegistry::new();
        let key = MasterKey::new([3u8; 32]);
        let root = setup_root();
        let id = registry
            .open_volume(root.path(), &key, FeatureFlags::default())
            .unwrap();
        let volume = registry.get(id).unwrap();
        let h = volume.open_write_mode("f.txt", 0o600).unwrap();
        assert_eq!(volume.open_handle_count(), 1);

        registry.close_volume(id);
        assert!(registry.is_closed(id));
        assert_eq!(volume.open_handle_count(), 0);
        // The stale handle id is rejected
        assert!(volume.read_file(h, 0, 16).is_err());
    }
}
