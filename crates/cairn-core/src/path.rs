//! Key → on-disk path derivation.
//!
//! The CAS transform hashes a key with SHA-1, hex-encodes the 20-byte digest
//! and slices the 40 hex characters into eight 5-character directory
//! segments. The file name is the full digest, so two keys only share a file
//! if their digests collide.

use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

/// Number of hex characters per shard directory segment.
pub const SHARD_BLOCK_SIZE: usize = 5;

/// Function mapping a logical key to its location below the store root.
pub type PathTransform = fn(&str) -> PathKey;

/// Location of a key's content relative to the store root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathKey {
    /// `/`-separated shard directories, e.g. `ab0d8/e0ce5/...`.
    pub directory: String,
    pub file_name: String,
}

impl PathKey {
    /// Directory that holds the file, resolved against `root`.
    pub fn dir_path(&self, root: &Path) -> PathBuf {
        self.directory
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(root.to_path_buf(), |acc, seg| acc.join(seg))
    }

    /// Absolute location of the file below `root`.
    pub fn full_path(&self, root: &Path) -> PathBuf {
        self.dir_path(root).join(&self.file_name)
    }
}

/// Compute the SHA-1 hex digest of a key.
pub fn key_digest(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Content-addressed transform: SHA-1 digest split into 5-char shards.
pub fn cas_path_transform(key: &str) -> PathKey {
    let digest = key_digest(key);
    let segments: Vec<&str> = digest
        .as_bytes()
        .chunks(SHARD_BLOCK_SIZE)
        .filter(|c| c.len() == SHARD_BLOCK_SIZE)
        // hex output is ASCII, so every chunk is valid UTF-8
        .filter_map(|c| std::str::from_utf8(c).ok())
        .collect();

    PathKey {
        directory: segments.join("/"),
        file_name: digest,
    }
}

/// Uses the key verbatim as both directory and file name.
///
/// Only suitable for debugging with trusted, path-safe keys.
pub fn identity_path_transform(key: &str) -> PathKey {
    PathKey {
        directory: key.to_string(),
        file_name: key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cas_fixture_some_key() {
        let pk = cas_path_transform("some key");
        assert_eq!(pk.directory, "ab0d8/e0ce5/8e6fa/9d1b2/30d25/f2ea0/b44a5/1ebd4");
        assert_eq!(pk.file_name, "ab0d8e0ce58e6fa9d1b230d25f2ea0b44a51ebd4");
    }

    #[test]
    fn test_cas_is_deterministic() {
        for key in ["", "My Data", "some key", "a/b/c", "ünïcödé"] {
            assert_eq!(cas_path_transform(key), cas_path_transform(key));
        }
    }

    #[test]
    fn test_cas_distinct_keys_distinct_paths() {
        assert_ne!(cas_path_transform("alpha"), cas_path_transform("bravo"));
    }

    #[test]
    fn test_cas_shape() {
        let pk = cas_path_transform("My Data");
        assert_eq!(pk.file_name.len(), 40);
        let segments: Vec<&str> = pk.directory.split('/').collect();
        assert_eq!(segments.len(), 8);
        assert!(segments.iter().all(|s| s.len() == SHARD_BLOCK_SIZE));
        assert_eq!(segments.concat(), pk.file_name);
    }

    #[test]
    fn test_key_digest_known_vector() {
        // SHA-1("abc"), FIPS 180-4
        assert_eq!(key_digest("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_full_path_layout() {
        let pk = cas_path_transform("some key");
        let full = pk.full_path(Path::new("/tmp/root"));
        assert_eq!(
            full,
            PathBuf::from(
                "/tmp/root/ab0d8/e0ce5/8e6fa/9d1b2/30d25/f2ea0/b44a5/1ebd4/ab0d8e0ce58e6fa9d1b230d25f2ea0b44a51ebd4"
            )
        );
    }

    #[test]
    fn test_identity_transform() {
        let pk = identity_path_transform("notes");
        assert_eq!(pk.directory, "notes");
        assert_eq!(pk.file_name, "notes");
        assert_eq!(
            pk.full_path(Path::new("root")),
            PathBuf::from("root/notes/notes")
        );
    }
}
