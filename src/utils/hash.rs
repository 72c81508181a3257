use std::path::Path;

use md5::{Digest, Md5};
use tokio::io::AsyncReadExt;
use xxhash_rust::xxh64::Xxh64;

use crate::errors::Result;
use crate::models::{HashAlgorithm, HashValue};

/// Incremental hasher over the manifest's tagged algorithm.
pub enum StreamingHasher {
    Md5(Box<Md5>),
    Xxh(Xxh64),
}

impl StreamingHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Md5 => Self::Md5(Box::new(Md5::new())),
            HashAlgorithm::Xxh => Self::Xxh(Xxh64::new(0)),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(h) => h.update(data),
            Self::Xxh(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> HashValue {
        match self {
            Self::Md5(h) => {
                let digest = h.finalize();
                HashValue::Md5(digest.into())
            }
            Self::Xxh(h) => HashValue::Xxh(h.digest()),
        }
    }
}

/// Hash a file in 256 KiB reads. The async reads double as yield points so
/// a wide hashing fan-out cannot monopolize the executor.
pub async fn hash_file(algorithm: HashAlgorithm, path: &Path) -> Result<HashValue> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = StreamingHasher::new(algorithm);
    let mut buffer = vec![0u8; 256 * 1024];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize())
}

pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> HashValue {
    let mut hasher = StreamingHasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_known_vector() {
        let value = hash_bytes(HashAlgorithm::Md5, b"abc");
        assert_eq!(value.to_hex(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn xxh64_known_vector() {
        let value = hash_bytes(HashAlgorithm::Xxh, b"");
        assert_eq!(value.to_hex(), "ef46db3751d8e999");
    }

    #[test]
    fn incremental_matches_oneshot() {
        let mut hasher = StreamingHasher::new(HashAlgorithm::Xxh);
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(
            hasher.finalize(),
            hash_bytes(HashAlgorithm::Xxh, b"hello world")
        );
    }

    #[tokio::test]
    async fn file_hash_matches_bytes_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        let from_file = hash_file(HashAlgorithm::Md5, &path).await.unwrap();
        assert_eq!(from_file, hash_bytes(HashAlgorithm::Md5, &data));
    }
}
