use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// What survives a process restart between resume attempts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub url: String,
    /// Always a multiple of the block size.
    pub bytes_written: u64,
    pub total_size: u64,
    /// Written by older builds without this field.
    #[serde(default)]
    pub size_known: bool,
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub async fn load(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).await.ok()?;
        serde_json::from_str(&content).ok()
    }

    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).await
    }

    pub async fn clear(path: &Path) -> std::io::Result<()> {
        match fs::remove_file(path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.img.session.json");
        assert!(SessionSnapshot::load(&path).await.is_none());

        let snapshot = SessionSnapshot {
            url: "https://x/fw.bin".into(),
            bytes_written: 8192,
            total_size: 12288,
            size_known: true,
            updated_at: Utc::now(),
        };
        snapshot.save(&path).await.unwrap();
        assert_eq!(SessionSnapshot::load(&path).await, Some(snapshot));

        SessionSnapshot::clear(&path).await.unwrap();
        SessionSnapshot::clear(&path).await.unwrap();
        assert!(SessionSnapshot::load(&path).await.is_none());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        fs::write(&path, "{not json").await.unwrap();
        assert!(SessionSnapshot::load(&path).await.is_none());
    }
}
