//! Checksums in the textual forms the catalog stores.
//!
//! SHA-256 digests are written `sha2:<base64>`; MD5 digests are plain hex.

use std::io::Read;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use md5::Md5;
use sha2::{Digest, Sha256};

use crate::TransferError;

const SHA256_PREFIX: &str = "sha2:";

/// Digest algorithm of a stored checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
    Md5,
}

impl ChecksumAlgorithm {
    /// Infers the algorithm from a stored checksum string.
    pub fn detect(checksum: &str) -> Self {
        if checksum.starts_with(SHA256_PREFIX) {
            ChecksumAlgorithm::Sha256
        } else {
            ChecksumAlgorithm::Md5
        }
    }
}

/// Computes a checksum of `data` in catalog form.
pub fn checksum_bytes(data: &[u8], algorithm: ChecksumAlgorithm) -> String {
    match algorithm {
        ChecksumAlgorithm::Sha256 => encode_sha256(&Sha256::digest(data)),
        ChecksumAlgorithm::Md5 => hex::encode(Md5::digest(data)),
    }
}

/// Computes a checksum of an entire file in catalog form.
pub fn file_checksum(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String, TransferError> {
    match algorithm {
        ChecksumAlgorithm::Sha256 => {
            let digest = hash_file::<Sha256>(path)?;
            Ok(encode_sha256(&digest))
        }
        ChecksumAlgorithm::Md5 => Ok(hex::encode(hash_file::<Md5>(path)?)),
    }
}

/// Checks `path` against a stored checksum.
///
/// An empty `expected` is treated as "nothing to verify".
pub fn verify_file(path: &Path, expected: &str) -> Result<(), TransferError> {
    if expected.is_empty() {
        return Ok(());
    }

    let actual = file_checksum(path, ChecksumAlgorithm::detect(expected))?;
    if actual != expected {
        return Err(TransferError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    tracing::debug!(path = %path.display(), checksum = expected, "checksum verified");
    Ok(())
}

fn encode_sha256(digest: &[u8]) -> String {
    format!("{SHA256_PREFIX}{}", STANDARD.encode(digest))
}

fn hash_file<D: Digest>(path: &Path) -> Result<Vec<u8>, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_form() {
        // SHA-256("abc"), base64 encoded.
        assert_eq!(
            checksum_bytes(b"abc", ChecksumAlgorithm::Sha256),
            "sha2:ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0="
        );
    }

    #[test]
    fn md5_form() {
        assert_eq!(
            checksum_bytes(b"abc", ChecksumAlgorithm::Md5),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn detect_algorithm() {
        assert_eq!(ChecksumAlgorithm::detect("sha2:AAAA"), ChecksumAlgorithm::Sha256);
        assert_eq!(
            ChecksumAlgorithm::detect("900150983cd24fb0d6963f7d28e17f72"),
            ChecksumAlgorithm::Md5
        );
    }

    #[test]
    fn file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 7) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        for alg in [ChecksumAlgorithm::Sha256, ChecksumAlgorithm::Md5] {
            assert_eq!(file_checksum(&path, alg).unwrap(), checksum_bytes(&data, alg));
        }
    }

    #[test]
    fn verify_detects_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"abc").unwrap();

        verify_file(&path, "sha2:ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=").unwrap();
        verify_file(&path, "900150983cd24fb0d6963f7d28e17f72").unwrap();
        verify_file(&path, "").unwrap();

        let err = verify_file(&path, "sha2:AAAA").unwrap_err();
        assert!(matches!(err, TransferError::ChecksumMismatch { .. }));
    }
}
