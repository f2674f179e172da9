//! Master key handling and subkey derivation.
//!
//! A volume is unlocked by its host (scrypt, config parsing) and hands the
//! raw 256-bit master key to the engine. All working keys (content AEAD,
//! filename EME) are derived from it with HKDF-SHA256 using the gocryptfs
//! info strings, so two implementations unlocking the same volume arrive at
//! the same working keys.

use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of the raw master key in bytes.
pub const KEY_LEN: usize = 32;

/// HKDF info string for the filename encryption (EME) subkey.
pub(crate) const HKDF_INFO_EME_NAMES: &str = "EME filename encryption";
/// HKDF info string for the AES-GCM content subkey.
pub(crate) const HKDF_INFO_GCM_CONTENT: &str = "AES-GCM file content encryption";
/// HKDF info string for the AES-SIV content subkey.
pub(crate) const HKDF_INFO_SIV_CONTENT: &str = "AES-SIV file content encryption";
/// HKDF info string for the XChaCha20-Poly1305 content subkey.
pub(crate) const HKDF_INFO_XCHACHA_CONTENT: &str =
    "XChaCha20-Poly1305 file content encryption";

/// The unlocked 256-bit master key of a volume.
///
/// The key bytes are zeroized on drop. Subkeys are handed out in
/// [`Zeroizing`] buffers so intermediate copies do not outlive their use.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    /// Wrap raw key bytes handed over by the host.
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random master key.
    ///
    /// Used by hosts creating a new volume; existing volumes carry their key
    /// in `gocryptfs.conf`.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive `len` bytes of subkey material for the given info string.
    ///
    /// Matches gocryptfs: HKDF-SHA256, no salt, info string as-is.
    pub(crate) fn derive(&self, info: &str, len: usize) -> Zeroizing<Vec<u8>> {
        let hk = Hkdf::<Sha256>::new(None, &self.0);
        let mut out = Zeroizing::new(vec![0u8; len]);
        hk.expand(info.as_bytes(), &mut out)
            .expect("HKDF output length is a small constant");
        out
    }

    /// The raw key bytes, for volumes created without the HKDF feature flag.
    pub(crate) fn raw(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never leak key material through Debug output
        f.write_str("MasterKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let key = MasterKey::new([7u8; KEY_LEN]);
        let a = key.derive(HKDF_INFO_GCM_CONTENT, 32);
        let b = key.derive(HKDF_INFO_GCM_CONTENT, 32);
        assert_eq!(*a, *b);
    }

    #[test]
    fn test_derive_differs_by_info() {
        let key = MasterKey::new([7u8; KEY_LEN]);
        let content = key.derive(HKDF_INFO_GCM_CONTENT, 32);
        let names = key.derive(HKDF_INFO_EME_NAMES, 32);
        assert_ne!(*content, *names);
    }

    #[test]
    fn test_derive_differs_by_key() {
        let a = MasterKey::new([1u8; KEY_LEN]);
        let b = MasterKey::new([2u8; KEY_LEN]);
        assert_ne!(
            *a.derive(HKDF_INFO_EME_NAMES, 32),
            *b.derive(HKDF_INFO_EME_NAMES, 32)
        );
    }

    #[test]
    fn test_random_keys_are_unique() {
        let a = MasterKey::random();
        let b = MasterKey::random();
        assert_ne!(a.raw(), b.raw());
    }

    #[test]
    fn test_debug_does_not_leak() {
        let key = MasterKey::new([0x42u8; KEY_LEN]);
        let s = format!("{key:?}");
        assert!(!s.contains("42"));
    }
}
