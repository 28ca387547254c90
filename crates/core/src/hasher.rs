//! Content fingerprints.
//!
//! Every change decision in shadowsync is made on content digests, never on
//! timestamps or file sizes.

use std::io;
use std::path::Path;

use sha2::{Digest as _, Sha256};

use crate::models::Digest;

/// SHA-256 of `bytes`, hex encoded.
pub fn fingerprint(bytes: &[u8]) -> Digest {
    hex::encode(Sha256::digest(bytes))
}

/// Fingerprint the file at `path`. A missing file is `None`, not an error.
pub fn fingerprint_file(path: &Path) -> io::Result<Option<Digest>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(fingerprint(&bytes))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// `true` if the two files differ in content (or exactly one is missing).
pub fn has_changed(path_a: &Path, path_b: &Path) -> io::Result<bool> {
    Ok(fingerprint_file(path_a)? != fingerprint_file(path_b)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_sha256() {
        assert_eq!(
            fingerprint(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(fingerprint(b"hello"), fingerprint(b"hello"));
        assert_ne!(fingerprint(b"hello"), fingerprint(b"hello\n"));
    }

    #[test]
    fn test_fingerprint_file_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(fingerprint_file(&dir.path().join("nope.txt")).unwrap(), None);
    }

    #[test]
    fn test_has_changed_ignores_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "same").unwrap();
        std::fs::write(&b, "same").unwrap();
        assert!(!has_changed(&a, &b).unwrap());

        std::fs::write(&b, "different").unwrap();
        assert!(has_changed(&a, &b).unwrap());

        std::fs::remove_file(&b).unwrap();
        assert!(has_changed(&a, &b).unwrap());
    }
}
