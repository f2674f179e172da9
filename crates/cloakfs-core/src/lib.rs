//! Encrypted overlay filesystem engine.
//!
//! `cloakfs-core` mounts a directory tree of ciphertext artifacts and exposes
//! POSIX-like operations (open, read, write, truncate, readdir, mkdir, rmdir,
//! rename, unlink) that are transparently encrypted and decrypted. The
//! on-disk format is compatible with gocryptfs v2.x: a tree written by
//! gocryptfs is readable here and vice versa.
//!
//! The engine consumes an already-unlocked master key plus a parsed feature
//! flag set; password derivation and `gocryptfs.conf` parsing belong to the
//! host application.

pub mod crypto;
pub mod fs;
pub mod sys;
pub mod volume;

pub use crypto::keys::MasterKey;
pub use crypto::AeadBackend;
pub use volume::handles::HandleId;
pub use volume::operations::{Attrs, DirEntry, OpError};
pub use volume::registry::{VolumeId, VolumeRegistry};
pub use volume::{init_cipher_root, FeatureFlags, Volume, VolumeError};
