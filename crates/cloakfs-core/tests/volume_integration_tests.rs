//! End-to-end tests against a real ciphertext directory tree.

use std::path::{Path, PathBuf};

use cloakfs_core::{
    init_cipher_root, FeatureFlags, MasterKey, VolumeId, VolumeRegistry,
};

const DIRIV: &str = "gocryptfs.diriv";

struct TestVolume {
    _dir: tempfile::TempDir,
    registry: VolumeRegistry,
    id: VolumeId,
    root: PathBuf,
}

impl TestVolume {
    fn new_with_flags(flags: FeatureFlags) -> Self {
        let dir = tempfile::tempdir().unwrap();
        init_cipher_root(dir.path(), &flags).unwrap();
        let registry = VolumeRegistry::new();
        let id = registry
            .open_volume(dir.path(), &MasterKey::random(), flags)
            .unwrap();
        let root = dir.path().to_path_buf();
        Self {
            _dir: dir,
            registry,
            id,
            root,
        }
    }

    fn new() -> Self {
        Self::new_with_flags(FeatureFlags::default())
    }

    fn volume(&self) -> std::sync::Arc<cloakfs_core::Volume> {
        self.registry.get(self.id).unwrap()
    }
}

/// Ciphertext names of the entries of a directory, `gocryptfs.diriv`
/// excluded.
fn cipher_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .filter(|n| n != DIRIV)
        .collect();
    names.sort();
    names
}

/// The single non-DirIV entry of a directory.
fn single_cipher_entry(dir: &Path) -> PathBuf {
    let names = cipher_entries(dir);
    assert_eq!(names.len(), 1, "expected one entry, got {names:?}");
    dir.join(&names[0])
}

#[test]
fn test_write_read_small_file() {
    // Scenario: write "hello" at offset 0, read it back, check the exact
    // ciphertext size: header + nonce + payload + tag.
    let tv = TestVolume::new();
    let volume = tv.volume();

    let h = volume.open_write_mode("a.txt", 0o600).unwrap();
    assert_eq!(volume.write_file(h, b"hello", 0).unwrap(), 5);
    assert_eq!(volume.read_file(h, 0, 5).unwrap(), b"hello");
    volume.close_file(h).unwrap();

    let cipher_file = single_cipher_entry(&tv.root);
    assert_eq!(std::fs::metadata(&cipher_file).unwrap().len(), 55);
    assert_eq!(volume.get_attrs("a.txt").unwrap().size, 5);

    // A fresh read-only handle decrypts the same bytes
    let h = volume.open_read_mode("a.txt").unwrap();
    assert_eq!(volume.read_file(h, 0, 5).unwrap(), b"hello");
    assert_eq!(volume.read_file(h, 1, 3).unwrap(), b"ell");
    volume.close_file(h).unwrap();
}

#[test]
fn test_write_read_across_block_boundary() {
    let tv = TestVolume::new();
    let volume = tv.volume();

    let h = volume.open_write_mode("two-blocks", 0o600).unwrap();
    let data = vec![0x41u8; 8192];
    assert_eq!(volume.write_file(h, &data, 0).unwrap(), 8192);

    // [4090, 4106) straddles the block boundary: 6 + 10 bytes
    let read = volume.read_file(h, 4090, 16).unwrap();
    assert_eq!(read, vec![0x41u8; 16]);

    let cipher_file = single_cipher_entry(&tv.root);
    assert_eq!(std::fs::metadata(&cipher_file).unwrap().len(), 8274);
    volume.close_file(h).unwrap();
}

#[test]
fn test_partial_block_read_modify_write() {
    let tv = TestVolume::new();
    let volume = tv.volume();

    let h = volume.open_write_mode("rmw", 0o600).unwrap();
    volume.write_file(h, &vec![b'a'; 5000], 0).unwrap();
    // Overwrite a window crossing the block boundary
    volume.write_file(h, &vec![b'B'; 200], 4000).unwrap();

    let read = volume.read_file(h, 0, 5000).unwrap();
    assert_eq!(&read[..4000], &vec![b'a'; 4000][..]);
    assert_eq!(&read[4000..4200], &vec![b'B'; 200][..]);
    assert_eq!(&read[4200..], &vec![b'a'; 800][..]);
    volume.close_file(h).unwrap();
}

#[test]
fn test_truncate_shrink() {
    let tv = TestVolume::new();
    let volume = tv.volume();

    let h = volume.open_write_mode("shrink", 0o600).unwrap();
    let data: Vec<u8> = (0..10000u32).map(|i| (i % 251) as u8).collect();
    volume.write_file(h, &data, 0).unwrap();

    volume.truncate(h, 3000).unwrap();
    assert_eq!(volume.get_attrs("shrink").unwrap().size, 3000);

    let cipher_file = single_cipher_entry(&tv.root);
    assert_eq!(std::fs::metadata(&cipher_file).unwrap().len(), 3050);

    // The byte just inside the new size survives, past-EOF reads are empty
    assert_eq!(volume.read_file(h, 2999, 1).unwrap(), &data[2999..3000]);
    assert!(volume.read_file(h, 3000, 1).unwrap().is_empty());
    volume.close_file(h).unwrap();
}

#[test]
fn test_truncate_grow_within_block() {
    let tv = TestVolume::new();
    let volume = tv.volume();

    let h = volume.open_write_mode("grow-small", 0o600).unwrap();
    volume.write_file(h, b"ab", 0).unwrap();
    volume.truncate(h, 100).unwrap();

    assert_eq!(volume.get_attrs("grow-small").unwrap().size, 100);
    let read = volume.read_file(h, 0, 100).unwrap();
    assert_eq!(read.len(), 100);
    assert_eq!(&read[..2], b"ab");
    assert!(read[2..].iter().all(|&b| b == 0));

    // The zero write went through full-block RMW: one complete block
    let cipher_file = single_cipher_entry(&tv.root);
    assert_eq!(std::fs::metadata(&cipher_file).unwrap().len(), 18 + 32 + 100);
    volume.close_file(h).unwrap();
}

#[test]
fn test_truncate_grow_to_block_aligned_size_creates_hole() {
    let tv = TestVolume::new();
    let volume = tv.volume();

    let h = volume.open_write_mode("grow-hole", 0o600).unwrap();
    volume.write_file(h, b"0123456789", 0).unwrap();
    volume.truncate(h, 8192).unwrap();

    assert_eq!(volume.get_attrs("grow-hole").unwrap().size, 8192);
    let read = volume.read_file(h, 0, 8192).unwrap();
    assert_eq!(read.len(), 8192);
    assert_eq!(&read[..10], b"0123456789");
    assert!(read[10..].iter().all(|&b| b == 0));
    volume.close_file(h).unwrap();
}

#[test]
fn test_truncate_empty_file_to_nonzero() {
    let tv = TestVolume::new();
    let volume = tv.volume();

    let h = volume.open_write_mode("sparse", 0o600).unwrap();
    volume.truncate(h, 5000).unwrap();
    assert_eq!(volume.get_attrs("sparse").unwrap().size, 5000);
    let read = volume.read_file(h, 0, 5000).unwrap();
    assert_eq!(read, vec![0u8; 5000]);
    volume.close_file(h).unwrap();
}

#[test]
fn test_truncate_to_zero_then_rewrite() {
    let tv = TestVolume::new();
    let volume = tv.volume();

    let h = volume.open_write_mode("reset", 0o600).unwrap();
    volume.write_file(h, b"first", 0).unwrap();
    volume.truncate(h, 0).unwrap();
    assert_eq!(volume.get_attrs("reset").unwrap().size, 0);

    // The rewrite lays down a fresh header and stays readable
    volume.write_file(h, b"second", 0).unwrap();
    assert_eq!(volume.read_file(h, 0, 6).unwrap(), b"second");
    volume.close_file(h).unwrap();
}

#[test]
fn test_empty_file_reads_empty() {
    let tv = TestVolume::new();
    let volume = tv.volume();

    let h = volume.open_write_mode("empty", 0o600).unwrap();
    assert!(volume.read_file(h, 0, 100).unwrap().is_empty());
    assert_eq!(volume.get_attrs("empty").unwrap().size, 0);
    volume.close_file(h).unwrap();
}

#[test]
fn test_oversized_requests_transfer_nothing() {
    let tv = TestVolume::new();
    let volume = tv.volume();

    let h = volume.open_write_mode("capped", 0o600).unwrap();
    let big = vec![1u8; 128 * 1024 + 1];
    assert_eq!(volume.write_file(h, &big, 0).unwrap(), 0);
    assert!(volume.read_file(h, 0, 128 * 1024 + 1).unwrap().is_empty());
    // At the cap itself the request goes through
    assert_eq!(
        volume.write_file(h, &big[..128 * 1024], 0).unwrap(),
        128 * 1024
    );
    volume.close_file(h).unwrap();
}

#[test]
fn test_long_name_file_layout() {
    // A 250-byte plaintext name encrypts past 255 bytes and must spill into
    // a hashed payload name plus a `.name` sidecar.
    let tv = TestVolume::new();
    let volume = tv.volume();

    let long_name = "n".repeat(250);
    let h = volume.open_write_mode(&long_name, 0o600).unwrap();
    volume.write_file(h, b"payload", 0).unwrap();
    volume.close_file(h).unwrap();

    let names = cipher_entries(&tv.root);
    assert_eq!(names.len(), 2, "payload + sidecar, got {names:?}");
    let content = names
        .iter()
        .find(|n| n.starts_with("gocryptfs.longname.") && !n.ends_with(".name"))
        .expect("payload file");
    let sidecar = format!("{content}.name");
    assert!(names.contains(&sidecar), "sidecar for {content}");

    // readdir dereferences the sidecar back to the plaintext name
    let listing = volume.list_dir("").unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, long_name);

    // get_attrs resolves it too
    assert_eq!(volume.get_attrs(&long_name).unwrap().size, 7);

    // unlink drops payload and sidecar
    volume.remove_file(&long_name).unwrap();
    assert!(cipher_entries(&tv.root).is_empty());
}

#[test]
fn test_mkdir_rmdir_diriv_lifecycle() {
    let tv = TestVolume::new();
    let volume = tv.volume();

    volume.mkdir("x", 0o755).unwrap();
    let cipher_dir = single_cipher_entry(&tv.root);
    assert!(cipher_dir.is_dir());
    let iv = std::fs::read(cipher_dir.join(DIRIV)).unwrap();
    assert_eq!(iv.len(), 16);

    volume.rmdir("x").unwrap();
    assert!(cipher_entries(&tv.root).is_empty());
    // No gocryptfs.diriv.rmdir.* temporary leaks into the parent
    let leftovers: Vec<String> = std::fs::read_dir(&tv.root)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .filter(|n| n.starts_with("gocryptfs.diriv.rmdir."))
        .collect();
    assert!(leftovers.is_empty(), "leaked {leftovers:?}");
}

#[test]
fn test_rmdir_refuses_non_empty_directory() {
    let tv = TestVolume::new();
    let volume = tv.volume();

    volume.mkdir("d", 0o755).unwrap();
    let h = volume.open_write_mode("d/file", 0o600).unwrap();
    volume.write_file(h, b"x", 0).unwrap();
    volume.close_file(h).unwrap();

    assert!(volume.rmdir("d").is_err());
    // Directory and DirIV still intact
    assert_eq!(volume.list_dir("d").unwrap().len(), 1);

    volume.remove_file("d/file").unwrap();
    volume.rmdir("d").unwrap();
}

#[test]
fn test_mkdir_with_restrictive_mode() {
    let tv = TestVolume::new();
    let volume = tv.volume();

    // No owner-write: the DirIV must still be created, the final mode
    // restored.
    volume.mkdir("ro", 0o500).unwrap();
    let cipher_dir = single_cipher_entry(&tv.root);
    assert!(cipher_dir.join(DIRIV).exists());
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(&cipher_dir).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o500);
    // Cleanup needs write permission back
    std::fs::set_permissions(&cipher_dir, std::fs::Permissions::from_mode(0o700)).unwrap();
}

#[test]
fn test_nested_directories_and_listing() {
    let tv = TestVolume::new();
    let volume = tv.volume();

    volume.mkdir("a", 0o755).unwrap();
    volume.mkdir("a/b", 0o755).unwrap();
    let h = volume.open_write_mode("a/b/deep.txt", 0o600).unwrap();
    volume.write_file(h, b"deep", 0).unwrap();
    volume.close_file(h).unwrap();

    let root_listing = volume.list_dir("").unwrap();
    assert_eq!(root_listing.len(), 1);
    assert_eq!(root_listing[0].name, "a");

    let deep_listing = volume.list_dir("a/b").unwrap();
    assert_eq!(deep_listing.len(), 1);
    assert_eq!(deep_listing[0].name, "deep.txt");
    assert_eq!(volume.get_attrs("a/b/deep.txt").unwrap().size, 4);

    // Repeated resolution exercises the DirCache
    for _ in 0..3 {
        assert_eq!(volume.get_attrs("a/b/deep.txt").unwrap().size, 4);
    }
}

#[test]
fn test_rename_file() {
    let tv = TestVolume::new();
    let volume = tv.volume();

    let h = volume.open_write_mode("old", 0o600).unwrap();
    volume.write_file(h, b"content", 0).unwrap();
    volume.close_file(h).unwrap();

    volume.rename("old", "new").unwrap();
    assert!(volume.get_attrs("old").is_err());
    let h = volume.open_read_mode("new").unwrap();
    assert_eq!(volume.read_file(h, 0, 7).unwrap(), b"content");
    volume.close_file(h).unwrap();
}

#[test]
fn test_rename_onto_empty_directory_retries_after_rmdir() {
    // The destination directory is "empty" but still holds its DirIV; the
    // kernel reports ENOTEMPTY and the engine must rmdir + retry.
    let tv = TestVolume::new();
    let volume = tv.volume();

    volume.mkdir("src", 0o755).unwrap();
    let h = volume.open_write_mode("src/f", 0o600).unwrap();
    volume.write_file(h, b"1", 0).unwrap();
    volume.close_file(h).unwrap();
    volume.mkdir("dst", 0o755).unwrap();

    volume.rename("src", "dst").unwrap();
    assert!(volume.get_attrs("src").is_err());
    assert_eq!(volume.list_dir("dst").unwrap().len(), 1);
    assert_eq!(volume.get_attrs("dst/f").unwrap().size, 1);
}

#[test]
fn test_rename_long_names_moves_sidecars() {
    let tv = TestVolume::new();
    let volume = tv.volume();

    let long_a = "a".repeat(250);
    let long_b = "b".repeat(250);
    let h = volume.open_write_mode(&long_a, 0o600).unwrap();
    volume.write_file(h, b"data", 0).unwrap();
    volume.close_file(h).unwrap();

    volume.rename(&long_a, &long_b).unwrap();

    // Exactly one payload/sidecar pair remains, resolving to the new name
    let names = cipher_entries(&tv.root);
    assert_eq!(names.len(), 2, "{names:?}");
    let listing = volume.list_dir("").unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, long_b);
    assert_eq!(volume.get_attrs(&long_b).unwrap().size, 4);
}

#[test]
fn test_listing_skips_foreign_garbage() {
    let tv = TestVolume::new();
    let volume = tv.volume();

    let h = volume.open_write_mode("good", 0o600).unwrap();
    volume.close_file(h).unwrap();
    // An entry that is not valid base64/EME ciphertext must be skipped
    std::fs::write(tv.root.join("not-base64!"), b"junk").unwrap();

    let listing = volume.list_dir("").unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "good");
}

#[test]
fn test_volume_lifecycle_and_stale_handles() {
    let tv = TestVolume::new();
    let volume = tv.volume();
    let h = volume.open_write_mode("f", 0o600).unwrap();

    assert!(!tv.registry.is_closed(tv.id));
    tv.registry.close_volume(tv.id);
    assert!(tv.registry.is_closed(tv.id));
    assert!(tv.registry.get(tv.id).is_none());

    // Handles were force-closed; the id no longer resolves
    assert!(volume.read_file(h, 0, 1).is_err());
}

#[test]
fn test_plaintext_names_mode() {
    let tv = TestVolume::new_with_flags(FeatureFlags::plaintext());
    let volume = tv.volume();

    let h = volume.open_write_mode("visible.txt", 0o600).unwrap();
    volume.write_file(h, b"secret body", 0).unwrap();
    volume.close_file(h).unwrap();

    // Names are stored as-is; content is still encrypted
    assert!(tv.root.join("visible.txt").exists());
    let on_disk = std::fs::read(tv.root.join("visible.txt")).unwrap();
    assert_eq!(on_disk.len(), 18 + 16 + 11 + 16);
    assert!(!on_disk.windows(6).any(|w| w == b"secret"));

    volume.mkdir("sub", 0o755).unwrap();
    assert!(tv.root.join("sub").exists());
    assert!(!tv.root.join("sub").join(DIRIV).exists());

    let mut names: Vec<String> = volume
        .list_dir("")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    assert_eq!(names, ["sub", "visible.txt"]);

    // gocryptfs.conf at the root must not be creatable or listable
    std::fs::write(tv.root.join("gocryptfs.conf"), b"{}").unwrap();
    assert!(volume.open_write_mode("gocryptfs.conf", 0o600).is_err());
    let listing = volume.list_dir("").unwrap();
    assert!(listing.iter().all(|e| e.name != "gocryptfs.conf"));
}

#[test]
fn test_plaintext_symlink_readlink() {
    let tv = TestVolume::new_with_flags(FeatureFlags::plaintext());
    let volume = tv.volume();

    std::os::unix::fs::symlink("/some/target", tv.root.join("link")).unwrap();
    assert_eq!(volume.readlink("link").unwrap(), b"/some/target");
    assert_eq!(
        volume.get_attrs("link").unwrap().size,
        "/some/target".len() as u64
    );
}

#[test]
fn test_gocryptfs_reader_compatibility_shape() {
    // Sanity-check the raw tree shape a gocryptfs reader expects: DirIV at
    // every directory level, base64 names, 4128-byte block granularity.
    let tv = TestVolume::new();
    let volume = tv.volume();

    volume.mkdir("d", 0o755).unwrap();
    let h = volume.open_write_mode("d/f", 0o600).unwrap();
    volume.write_file(h, &vec![7u8; 5000], 0).unwrap();
    volume.close_file(h).unwrap();

    assert_eq!(std::fs::read(tv.root.join(DIRIV)).unwrap().len(), 16);
    let cipher_dir = single_cipher_entry(&tv.root);
    assert_eq!(std::fs::read(cipher_dir.join(DIRIV)).unwrap().len(), 16);
    let cipher_file = single_cipher_entry(&cipher_dir);
    // 5000 bytes: one full block + 904-byte tail
    assert_eq!(
        std::fs::metadata(cipher_file).unwrap().len(),
        18 + 4128 + 904 + 32
    );
}
