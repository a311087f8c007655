use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::info;

use crate::error::PartitionError;

/// A raw block-addressed update partition.
#[async_trait]
pub trait Partition: Send {
    fn block_size(&self) -> usize;

    /// `data` must be exactly one block.
    async fn write_block(&mut self, index: u32, data: &[u8]) -> Result<(), PartitionError>;

    async fn read_block(&mut self, index: u32) -> Result<Vec<u8>, PartitionError>;

    /// Make this partition the boot target and restart. On real hardware this
    /// does not return.
    async fn mark_bootable_and_restart(&mut self) -> Result<(), PartitionError>;

    /// Where a resume snapshot for this partition can be kept, if anywhere.
    fn snapshot_path(&self) -> Option<PathBuf> {
        None
    }
}

fn check_len(index: u32, data: &[u8], block_size: usize) -> Result<(), PartitionError> {
    if data.len() != block_size {
        return Err(PartitionError::BlockSize {
            index,
            len: data.len(),
            expected: block_size,
        });
    }
    Ok(())
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BootMarker {
    pub image: PathBuf,
    pub marked_at: chrono::DateTime<chrono::Utc>,
}

/// Partition backed by an image file on the host, for simulation and tooling.
pub struct FilePartition {
    path: PathBuf,
    block_size: usize,
    max_blocks: Option<u32>,
}

impl FilePartition {
    pub fn new(path: impl Into<PathBuf>, block_size: usize) -> Self {
        Self {
            path: path.into(),
            block_size,
            max_blocks: None,
        }
    }

    pub fn with_capacity(mut self, blocks: u32) -> Self {
        self.max_blocks = Some(blocks);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn boot_marker_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".boot.json");
        PathBuf::from(name)
    }

    fn bounds(&self, index: u32) -> Result<(), PartitionError> {
        match self.max_blocks {
            Some(blocks) if index >= blocks => Err(PartitionError::OutOfBounds { index, blocks }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Partition for FilePartition {
    fn block_size(&self) -> usize {
        self.block_size
    }

    async fn write_block(&mut self, index: u32, data: &[u8]) -> Result<(), PartitionError> {
        check_len(index, data, self.block_size)?;
        self.bounds(index)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .await?;
        file.seek(SeekFrom::Start(index as u64 * self.block_size as u64))
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_block(&mut self, index: u32) -> Result<Vec<u8>, PartitionError> {
        self.bounds(index)?;
        let mut file = fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(index as u64 * self.block_size as u64))
            .await?;
        let mut block = vec![0u8; self.block_size];
        file.read_exact(&mut block).await?;
        Ok(block)
    }

    async fn mark_bootable_and_restart(&mut self) -> Result<(), PartitionError> {
        let marker = BootMarker {
            image: self.path.clone(),
            marked_at: chrono::Utc::now(),
        };
        let content = serde_json::to_string_pretty(&marker)
            .map_err(|e| PartitionError::BootSwap(e.to_string()))?;
        fs::write(self.boot_marker_path(), content).await?;
        info!(image = ?self.path, "Boot partition set, restart requested");
        Ok(())
    }

    fn snapshot_path(&self) -> Option<PathBuf> {
        let mut name = self.path.clone().into_os_string();
        name.push(".session.json");
        Some(PathBuf::from(name))
    }
}

#[derive(Debug, Default)]
pub struct MemoryImage {
    pub data: Vec<u8>,
    pub writes: Vec<u32>,
    pub bootable: bool,
}

/// In-memory partition. Clones share the same image, so a test can keep a
/// handle while the writer owns another.
#[derive(Clone)]
pub struct MemoryPartition {
    block_size: usize,
    image: Arc<Mutex<MemoryImage>>,
}

impl MemoryPartition {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            image: Arc::new(Mutex::new(MemoryImage::default())),
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    pub fn written_blocks(&self) -> Vec<u32> {
        self.lock().writes.clone()
    }

    pub fn is_bootable(&self) -> bool {
        self.lock().bootable
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryImage> {
        // a poisoned lock still holds a usable image
        self.image.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Partition for MemoryPartition {
    fn block_size(&self) -> usize {
        self.block_size
    }

    async fn write_block(&mut self, index: u32, data: &[u8]) -> Result<(), PartitionError> {
        check_len(index, data, self.block_size)?;
        let start = index as usize * self.block_size;
        let mut image = self.lock();
        if image.data.len() < start + self.block_size {
            image.data.resize(start + self.block_size, 0);
        }
        image.data[start..start + self.block_size].copy_from_slice(data);
        image.writes.push(index);
        Ok(())
    }

    async fn read_block(&mut self, index: u32) -> Result<Vec<u8>, PartitionError> {
        let start = index as usize * self.block_size;
        let image = self.lock();
        let blocks = (image.data.len() / self.block_size) as u32;
        image
            .data
            .get(start..start + self.block_size)
            .map(<[u8]>::to_vec)
            .ok_or(PartitionError::OutOfBounds { index, blocks })
    }

    async fn mark_bootable_and_restart(&mut self) -> Result<(), PartitionError> {
        self.lock().bootable = true;
        Ok(())
    }
}
