//! Cryptographic core: AEAD backend selection and working-key schedule.
//!
//! A volume carries one AEAD family for file contents (and symlink targets)
//! plus an EME cipher for filenames. The engine treats the primitives as
//! black boxes; this module only wires keys and nonce sizes so the on-disk
//! bytes match gocryptfs for every feature-flag combination.

pub mod eme;
pub mod keys;

use aes::Aes256;
use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::AesGcm;
use aes_siv::Aes256SivAead;
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use thiserror::Error;
use zeroize::Zeroizing;

use keys::MasterKey;

pub use eme::EmeCipher;

/// AES-256-GCM with the 128-bit nonces the gocryptfs format uses.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Poly1305/GCM/SIV authentication tag length in bytes.
pub const AUTH_TAG_LEN: usize = 16;

/// Errors from crypto-core construction and AEAD operations.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// AEAD tag verification failed: the block is corrupt or was moved.
    ///
    /// This is an integrity violation, not a user error; callers must fail
    /// the whole read.
    #[error("AEAD authentication failed - ciphertext corrupt or tampered")]
    AuthenticationFailed,

    /// AEAD encryption failed. With valid keys and nonce sizes this cannot
    /// happen; surfaced instead of panicking.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// The XChaCha20-Poly1305 backend is only defined together with HKDF.
    #[error("backend {0:?} requires the HKDF feature flag")]
    HkdfRequired(AeadBackend),
}

/// The AEAD family a volume was created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadBackend {
    /// AES-256-GCM, 16-byte nonces (flag set: default).
    Aes256Gcm,
    /// AES-SIV (RFC 5297), 512-bit key, 16-byte nonces (`AESSIV`).
    Aes256Siv,
    /// XChaCha20-Poly1305, 24-byte nonces (`XChaCha20Poly1305`).
    XChaCha20Poly1305,
}

impl AeadBackend {
    /// Per-block nonce length on disk.
    pub fn nonce_len(self) -> usize {
        match self {
            AeadBackend::Aes256Gcm | AeadBackend::Aes256Siv => 16,
            AeadBackend::XChaCha20Poly1305 => 24,
        }
    }
}

enum AeadCipher {
    Gcm(Box<Aes256Gcm16>),
    Siv(Box<Aes256SivAead>),
    XChaCha(Box<XChaCha20Poly1305>),
}

/// Working keys of one volume: the content AEAD and the filename EME cipher.
pub struct CryptoCore {
    backend: AeadBackend,
    cipher: AeadCipher,
    eme: EmeCipher,
}

impl CryptoCore {
    /// Build the working ciphers from the master key.
    ///
    /// With `use_hkdf` set, subkeys are derived per the gocryptfs info
    /// strings; otherwise the master key is used directly (doubled for
    /// AES-SIV), matching pre-HKDF volumes.
    pub fn new(
        master_key: &MasterKey,
        backend: AeadBackend,
        use_hkdf: bool,
    ) -> Result<Self, CryptoError> {
        let cipher = match backend {
            AeadBackend::Aes256Gcm => {
                let key = if use_hkdf {
                    master_key.derive(keys::HKDF_INFO_GCM_CONTENT, 32)
                } else {
                    Zeroizing::new(master_key.raw().to_vec())
                };
                AeadCipher::Gcm(Box::new(
                    Aes256Gcm16::new_from_slice(&key).expect("key length is fixed"),
                ))
            }
            AeadBackend::Aes256Siv => {
                let key = if use_hkdf {
                    master_key.derive(keys::HKDF_INFO_SIV_CONTENT, 64)
                } else {
                    let mut doubled = Zeroizing::new(Vec::with_capacity(64));
                    doubled.extend_from_slice(master_key.raw());
                    doubled.extend_from_slice(master_key.raw());
                    doubled
                };
                AeadCipher::Siv(Box::new(
                    Aes256SivAead::new_from_slice(&key).expect("key length is fixed"),
                ))
            }
            AeadBackend::XChaCha20Poly1305 => {
                if !use_hkdf {
                    return Err(CryptoError::HkdfRequired(backend));
                }
                let key = master_key.derive(keys::HKDF_INFO_XCHACHA_CONTENT, 32);
                AeadCipher::XChaCha(Box::new(
                    XChaCha20Poly1305::new_from_slice(&key).expect("key length is fixed"),
                ))
            }
        };

        let eme_key: Zeroizing<Vec<u8>> = if use_hkdf {
            master_key.derive(keys::HKDF_INFO_EME_NAMES, 32)
        } else {
            Zeroizing::new(master_key.raw().to_vec())
        };
        let eme = EmeCipher::new(
            eme_key
                .as_slice()
                .try_into()
                .expect("EME key length is fixed"),
        );

        Ok(Self {
            backend,
            cipher,
            eme,
        })
    }

    pub fn backend(&self) -> AeadBackend {
        self.backend
    }

    pub fn nonce_len(&self) -> usize {
        self.backend.nonce_len()
    }

    pub fn eme(&self) -> &EmeCipher {
        &self.eme
    }

    /// AEAD-seal `msg` with `aad`; returns ciphertext followed by the tag.
    pub(crate) fn aead_seal(
        &self,
        nonce: &[u8],
        msg: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        debug_assert_eq!(nonce.len(), self.nonce_len());
        let payload = Payload { msg, aad };
        match &self.cipher {
            AeadCipher::Gcm(c) => c.encrypt(GenericArray::from_slice(nonce), payload),
            AeadCipher::Siv(c) => c.encrypt(GenericArray::from_slice(nonce), payload),
            AeadCipher::XChaCha(c) => c.encrypt(XNonce::from_slice(nonce), payload),
        }
        .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// AEAD-open `ciphertext ‖ tag` with `aad`.
    pub(crate) fn aead_open(
        &self,
        nonce: &[u8],
        msg: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        debug_assert_eq!(nonce.len(), self.nonce_len());
        let payload = Payload { msg, aad };
        match &self.cipher {
            AeadCipher::Gcm(c) => c.decrypt(GenericArray::from_slice(nonce), payload),
            AeadCipher::Siv(c) => c.decrypt(GenericArray::from_slice(nonce), payload),
            AeadCipher::XChaCha(c) => c.decrypt(XNonce::from_slice(nonce), payload),
        }
        .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

impl std::fmt::Debug for CryptoCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoCore")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}
