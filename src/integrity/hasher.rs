//! Streaming SHA-256 over files.

use crate::error::{Result, ResultExt as _};
use sha2::{Digest as _, Sha256};
use std::fs::File;
use std::io::{BufReader, Read as _};
use std::path::Path;

/// Read buffer for hashing (8 KB).
const BUFFER_SIZE: usize = 8192;

/// Hash algorithm identifier recorded next to every digest.
pub const HASH_ALGORITHM: &str = "SHA-256";

/// Compute the SHA-256 of a file without loading it into memory.
///
/// Returns the digest as 64 lowercase hex characters.
///
/// # Errors
///
/// Returns `Io` if the file cannot be opened or read.
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let file = File::open(path).at_path(path)?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer).at_path(path)?;
        let Some(filled) = buffer.get(..bytes_read).filter(|b| !b.is_empty()) else {
            break;
        };
        hasher.update(filled);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    #[test]
    fn test_compute_file_hash_empty() {
        let temp_file = NamedTempFile::new().unwrap();
        let hash = compute_file_hash(temp_file.path()).unwrap();
        assert_eq!(
            hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_compute_file_hash_known_value() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"hello world").unwrap();
        temp_file.flush().unwrap();

        let hash = compute_file_hash(temp_file.path()).unwrap();
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_hash_spans_several_buffers() {
        let mut small = NamedTempFile::new().unwrap();
        let mut large = NamedTempFile::new().unwrap();
        small.write_all(&[7u8; 10]).unwrap();
        large.write_all(&vec![7u8; BUFFER_SIZE * 3 + 10]).unwrap();

        let small_hash = compute_file_hash(small.path()).unwrap();
        let large_hash = compute_file_hash(large.path()).unwrap();
        assert_eq!(large_hash.len(), 64);
        assert!(large_hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(small_hash, large_hash);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = compute_file_hash(Path::new("/nonexistent/mlprep/file.csv")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
