//! SHA-256 helpers for payload and partition hashing.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Buffer size for reading files during hashing (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Calculate the SHA-256 checksum of a whole file.
///
/// # Returns
///
/// The lowercase hexadecimal SHA-256 hash of the file contents.
pub fn calculate_file_checksum(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Feed the first `len` bytes of `path` into `hasher`.
///
/// Fails with `UnexpectedEof` if the file holds fewer than `len` bytes.
pub fn hash_file_prefix(path: &Path, len: u64, hasher: &mut Sha256) -> io::Result<()> {
    let file = File::open(path)?;
    let mut reader = file.take(len);
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut remaining = len;

    while remaining > 0 {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} is shorter than {} bytes", path.display(), len),
            ));
        }
        hasher.update(&buffer[..bytes_read]);
        remaining -= bytes_read as u64;
    }
    Ok(())
}

/// Compare two hex digests, ignoring case.
pub fn hex_digest_matches(actual: &str, expected: &str) -> bool {
    actual.eq_ignore_ascii_case(expected.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const HELLO_WORLD_SHA256: &str =
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_calculate_file_checksum() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("test.txt");

        let mut file = File::create(&file_path).unwrap();
        file.write_all(b"hello world").unwrap();

        let checksum = calculate_file_checksum(&file_path).unwrap();
        assert_eq!(checksum, HELLO_WORLD_SHA256);
    }

    #[test]
    fn test_calculate_nonexistent_file() {
        let result = calculate_file_checksum(Path::new("/nonexistent/file.txt"));
        assert!(result.is_err());
    }

    #[test]
    fn test_hash_prefix_matches_partial_hash() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("payload.bin");
        std::fs::write(&file_path, b"hello world, and then some").unwrap();

        let mut hasher = Sha256::new();
        hash_file_prefix(&file_path, 11, &mut hasher).unwrap();
        assert_eq!(format!("{:x}", hasher.finalize()), HELLO_WORLD_SHA256);
    }

    #[test]
    fn test_hash_prefix_larger_than_buffer() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("large.bin");
        let data = vec![0xABu8; 200_000];
        std::fs::write(&file_path, &data).unwrap();

        let mut hasher = Sha256::new();
        hash_file_prefix(&file_path, 150_000, &mut hasher).unwrap();

        let mut expected = Sha256::new();
        expected.update(&data[..150_000]);
        assert_eq!(hasher.finalize(), expected.finalize());
    }

    #[test]
    fn test_hash_prefix_short_file() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("short.bin");
        std::fs::write(&file_path, b"abc").unwrap();

        let mut hasher = Sha256::new();
        let err = hash_file_prefix(&file_path, 10, &mut hasher).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_hex_digest_matches_ignores_case() {
        assert!(hex_digest_matches("abcdef", "ABCDEF"));
        assert!(!hex_digest_matches("abcdef", "abcdee"));
    }
}
