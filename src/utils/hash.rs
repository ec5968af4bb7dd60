use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use sha2::{Sha256, Digest};

const BUFFER_SIZE: usize = 1024 * 1024; // 1MB buffer

/// Calculate SHA-256 hash of a file
///
/// Returns None if:
/// - The file is larger than max_size_mb
/// - The path is not a regular file
pub fn calculate_sha256(path: &Path, max_size_mb: u64) -> io::Result<Option<String>> {
    let metadata = std::fs::metadata(path)?;

    if !metadata.is_file() {
        return Ok(None);
    }

    let file = File::open(path)?;
    sha256_reader(BufReader::new(file), metadata.len(), max_size_mb)
}

/// Calculate SHA-256 hash of a stream of known size, None above max_size_mb
pub fn sha256_reader<R: Read>(mut reader: R, size: u64, max_size_mb: u64) -> io::Result<Option<String>> {
    if size > max_size_mb * 1024 * 1024 {
        return Ok(None);
    }

    let mut hasher = Sha256::new();
    let mut buffer = vec![0; BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(Some(format!("{:x}", hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_sha256_reader() {
        let hash = sha256_reader(Cursor::new(b"abc"), 3, 1).unwrap();
        assert_eq!(
            hash.as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn test_size_limit_skips_hash() {
        let data = vec![0u8; 16];
        assert_eq!(sha256_reader(Cursor::new(&data), 2 * 1024 * 1024, 1).unwrap(), None);
    }

    #[test]
    fn test_calculate_sha256_skips_directories() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        assert_eq!(calculate_sha256(temp_dir.path(), 1).unwrap(), None);
    }
}
