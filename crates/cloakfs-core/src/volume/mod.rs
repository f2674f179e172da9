//! Volumes: an opened ciphertext root plus its crypto state and caches.

pub mod dircache;
pub mod handles;
pub mod operations;
pub mod path;
pub mod registry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use crate::crypto::keys::MasterKey;
use crate::crypto::{AeadBackend, CryptoCore, CryptoError};
use crate::fs::content::ContentEnc;
use crate::fs::diriv::create_diriv_at;
use crate::fs::name::NameTransform;
use crate::sys;

use dircache::DirCache;
use handles::HandleTable;

/// Name of the volume config file; the engine never parses it but must keep
/// it out of plaintext listings and resolution.
pub const CONF_FILENAME: &str = "gocryptfs.conf";

/// Parsed feature-flag set of a volume, handed over by the host together
/// with the unlocked master key.
#[derive(Debug, Clone, Copy)]
pub struct FeatureFlags {
    /// Filenames are stored unencrypted (`PlaintextNames`).
    pub plaintext_names: bool,
    /// Per-directory IVs are present (`DirIV`).
    pub dir_iv: bool,
    /// Over-long encrypted names are hashed with sidecars (`LongNames`).
    pub long_names: bool,
    /// Unpadded base64 alphabet (`Raw64`).
    pub raw64: bool,
    /// Working keys are HKDF-derived (`HKDF`).
    pub hkdf: bool,
    /// Content AEAD family (`AESSIV` / `XChaCha20Poly1305` / default GCM).
    pub aead: AeadBackend,
}

impl Default for FeatureFlags {
    /// The flag set gocryptfs v2 writes for new volumes.
    fn default() -> Self {
        Self {
            plaintext_names: false,
            dir_iv: true,
            long_names: true,
            raw64: true,
            hkdf: true,
            aead: AeadBackend::Aes256Gcm,
        }
    }
}

impl FeatureFlags {
    pub fn plaintext() -> Self {
        Self {
            plaintext_names: true,
            dir_iv: false,
            long_names: false,
            ..Self::default()
        }
    }
}

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("crypto setup failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("cannot open volume root: {0}")]
    Root(nix::errno::Errno),
}

/// An opened encrypted root.
pub struct Volume {
    pub(crate) root: PathBuf,
    pub(crate) flags: FeatureFlags,
    pub(crate) content_enc: ContentEnc,
    pub(crate) name_transform: NameTransform,
    pub(crate) dir_cache: DirCache,
    pub(crate) handles: HandleTable,
    /// Held (write) while a directory and its DirIV are transiently
    /// inconsistent: mkdir-with-IV and the rmdir rename-out dance. Readers
    /// that depend on the pair coexisting hold it shared.
    pub(crate) dir_iv_lock: RwLock<()>,
}

impl Volume {
    /// Assemble a volume from an unlocked master key and its flag set.
    ///
    /// The ciphertext root must exist; the key is consumed to derive the
    /// working keys and is wiped when the caller drops it.
    pub fn new(
        root: impl Into<PathBuf>,
        master_key: &MasterKey,
        flags: FeatureFlags,
    ) -> Result<Self, VolumeError> {
        let root = root.into();
        // Fail now, not on the first operation
        sys::open(&root, OFlag::O_DIRECTORY | OFlag::O_PATH, Mode::empty())
            .map_err(VolumeError::Root)?;
        let core = Arc::new(CryptoCore::new(master_key, flags.aead, flags.hkdf)?);
        let volume = Self {
            root,
            content_enc: ContentEnc::new(Arc::clone(&core)),
            name_transform: NameTransform::new(core, flags.long_names, flags.raw64),
            dir_cache: DirCache::new(!flags.plaintext_names),
            handles: HandleTable::new(),
            dir_iv_lock: RwLock::new(()),
            flags,
        };
        debug!(root = %volume.root.display(), ?flags, "volume assembled");
        Ok(volume)
    }

    pub fn flags(&self) -> &FeatureFlags {
        &self.flags
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn open_handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Release everything the volume holds: every open handle (waiting for
    /// in-flight I/O) and all cached directory fds. Key material is wiped
    /// when the owning registry drops the volume.
    pub(crate) fn release(&self) {
        self.handles.close_all();
        self.dir_cache.clear();
        info!(root = %self.root.display(), "volume released");
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("root", &self.root)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// Engine-side half of volume creation: write the root `gocryptfs.diriv`.
/// The host writes `gocryptfs.conf` itself. No-op for plaintext names.
pub fn init_cipher_root(root: &Path, flags: &FeatureFlags) -> Result<(), nix::errno::Errno> {
    if flags.plaintext_names || !flags.dir_iv {
        return Ok(());
    }
    let dirfd = sys::open(root, OFlag::O_DIRECTORY | OFlag::O_PATH, Mode::empty())?;
    create_diriv_at(&dirfd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::diriv::DIRIV_FILENAME;

    #[test]
    fn test_init_cipher_root_writes_diriv() {
        let dir = tempfile::tempdir().unwrap();
        init_cipher_root(dir.path(), &FeatureFlags::default()).unwrap();
        let iv = std::fs::read(dir.path().join(DIRIV_FILENAME)).unwrap();
        assert_eq!(iv.len(), 16);
    }

    #[test]
    fn test_init_cipher_root_plaintext_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        init_cipher_root(dir.path(), &FeatureFlags::plaintext()).unwrap();
        assert!(!dir.path().join(DIRIV_FILENAME).exists());
    }

    #[test]
    fn test_volume_new_rejects_missing_root() {
        let err = Volume::new(
            "/nonexistent/cloakfs/root",
            &MasterKey::new([1u8; 32]),
            FeatureFlags::default(),
        )
        .unwrap_err();
        assert!(matches!(err, VolumeError::Root(_)));
    }

    #[test]
    fn test_volume_new_succeeds_on_existing_root() {
        let dir = tempfile::tempdir().unwrap();
        init_cipher_root(dir.path(), &FeatureFlags::default()).unwrap();
        let volume = Volume::new(
            dir.path(),
            &MasterKey::new([1u8; 32]),
            FeatureFlags::default(),
        )
        .unwrap();
        assert_eq!(volume.open_handle_count(), 0);
    }
}
