use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Running SHA-256 over the raw image bytes committed to flash.
#[derive(Clone, Default)]
pub struct ImageDigest {
    hasher: Sha256,
}

impl ImageDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn hex(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }
}

impl std::fmt::Debug for ImageDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ImageDigest").field(&self.hex()).finish()
    }
}

pub fn digests_match(expected: &str, computed: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(computed)
}

/// SHA-256 of the first `len` bytes of a file.
pub async fn calculate_hash(filepath: &Path, len: Option<u64>) -> std::io::Result<String> {
    let mut file = File::open(filepath).await?;
    let mut hasher = Sha256::new();
    let mut buffer = [0; 8192];
    let mut remaining = len.unwrap_or(u64::MAX);

    while remaining > 0 {
        let want = buffer.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = file.read(&mut buffer[..want]).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        remaining -= n as u64;
    }

    Ok(hex::encode(hasher.finalize()))
}
