//! Content fingerprints used for upload deduplication.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Generated text artifacts are hashed on their text, not on a file.
pub fn fingerprint_text(text: &str) -> String {
    fingerprint_bytes(text.as_bytes())
}

/// Hash a file on disk without loading it into memory at once.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            fingerprint_text("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_file_matches_bytes() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let payload = vec![7u8; 200_000];
        std::fs::write(tmp.path(), &payload).unwrap();
        assert_eq!(fingerprint_file(tmp.path()).unwrap(), fingerprint_bytes(&payload));
    }
}
