//! Streams a firmware image into a block partition, one whole block at a time.
//!
//! Only complete blocks are ever written while the transfer is running. When
//! the link drops, whatever is left over is thrown away, so the committed
//! byte count always sits on a block boundary and the next attempt asks the
//! server for exactly that offset.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::downloader::{
    ChunkSink, DownloadObserver, DownloadRequest, Downloader, SizeSource, TransferInfo,
};
use crate::error::{DownloadError, FailureKind, PartitionError};
use crate::hashing::ImageDigest;
use crate::partition::Partition;
use crate::state::SessionSnapshot;
use crate::utils::round_up_to_multiple;

/// Resume state carried between attempts.
#[derive(Debug, Clone, Default)]
pub struct FlashSession {
    pub url: Option<String>,
    pub bytes_written: u64,
    pub total_size: u64,
    /// False while `total_size` is only the fallback guess.
    pub size_known: bool,
    digest: ImageDigest,
}

impl FlashSession {
    pub fn next_block(&self, block_size: usize) -> u32 {
        (self.bytes_written / block_size as u64) as u32
    }

    /// Record one written block. `raw` excludes any padding.
    fn commit(&mut self, raw: &[u8], block_size: usize) {
        self.digest.update(raw);
        self.bytes_written += block_size as u64;
    }

    /// Every block of a known-size image is on flash.
    pub fn is_complete(&self) -> bool {
        self.size_known && self.total_size > 0 && self.bytes_written >= self.total_size
    }

    fn restart(&mut self) {
        self.bytes_written = 0;
        self.digest = ImageDigest::new();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed {
        bytes_written: u64,
        /// SHA-256 of the image as served, without padding.
        digest: String,
    },
    Paused {
        bytes_written: u64,
        total_size: u64,
    },
    Cancelled {
        bytes_written: u64,
        total_size: u64,
    },
    Failed {
        error: String,
        bytes_written: u64,
        total_size: u64,
    },
}

impl InstallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, InstallOutcome::Installed { .. })
    }

    pub fn bytes_written(&self) -> u64 {
        match self {
            InstallOutcome::Installed { bytes_written, .. }
            | InstallOutcome::Paused { bytes_written, .. }
            | InstallOutcome::Cancelled { bytes_written, .. }
            | InstallOutcome::Failed { bytes_written, .. } => *bytes_written,
        }
    }

    pub fn total_size(&self) -> u64 {
        match self {
            InstallOutcome::Installed { bytes_written, .. } => *bytes_written,
            InstallOutcome::Paused { total_size, .. }
            | InstallOutcome::Cancelled { total_size, .. }
            | InstallOutcome::Failed { total_size, .. } => *total_size,
        }
    }
}

struct BlockSink<'a, P: Partition> {
    partition: &'a mut P,
    session: &'a mut FlashSession,
    connectivity: &'a ConnectivityMonitor,
    cancel: &'a CancellationToken,
    block_size: usize,
    fill_byte: u8,
    pending: Vec<u8>,
}

impl<P: Partition> BlockSink<'_, P> {
    async fn write_block(&mut self, raw_len: usize) -> Result<(), DownloadError> {
        let index = self.session.next_block(self.block_size);
        self.partition
            .write_block(index, &self.pending[..self.block_size])
            .await?;
        self.session.commit(&self.pending[..raw_len], self.block_size);
        self.pending.drain(..self.block_size);
        debug!(index, bytes_written = self.session.bytes_written, "Block written");
        Ok(())
    }

    /// Pad the tail to a full block and write it.
    async fn finish(&mut self) -> Result<(), DownloadError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let raw_len = self.pending.len();
        info!(
            block = self.session.next_block(self.block_size),
            raw_len, "Padding final block"
        );
        self.pending.resize(self.block_size, self.fill_byte);
        self.write_block(raw_len).await
    }
}

#[async_trait]
impl<'a, P: Partition> ChunkSink for BlockSink<'a, P> {
    async fn on_start(&mut self, info: &TransferInfo) -> Result<(), DownloadError> {
        let expected = self.session.bytes_written;
        if info.resume_offset != expected {
            // A plain 200 is the whole image again, anything else must start where we asked.
            if info.status != 200 {
                return Err(DownloadError::RangeMismatch {
                    expected,
                    actual: info.resume_offset,
                });
            }
            warn!(expected, "Server ignored the range request, rewriting from block 0");
            self.session.restart();
        }
        let known = info.size_source != SizeSource::Fallback;
        if known || self.session.total_size == 0 {
            self.session.total_size = round_up_to_multiple(info.total_size, self.block_size as u64);
            self.session.size_known = known;
        }
        info!(total_size = self.session.total_size, "Download target");
        Ok(())
    }

    async fn on_chunk(&mut self, chunk: &[u8]) -> Result<(), DownloadError> {
        if self.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        if !self.connectivity.is_online() {
            return Err(DownloadError::Offline);
        }
        self.pending.extend_from_slice(chunk);
        while self.pending.len() >= self.block_size {
            self.write_block(self.block_size).await?;
        }
        Ok(())
    }
}

pub struct FlashWriter<P: Partition> {
    downloader: Arc<Downloader>,
    partition: P,
    connectivity: Arc<ConnectivityMonitor>,
    fill_byte: u8,
    session: FlashSession,
}

impl<P: Partition> FlashWriter<P> {
    pub fn new(
        downloader: Arc<Downloader>,
        partition: P,
        connectivity: Arc<ConnectivityMonitor>,
        fill_byte: u8,
    ) -> Self {
        Self {
            downloader,
            partition,
            connectivity,
            fill_byte,
            session: FlashSession::default(),
        }
    }

    pub fn session(&self) -> &FlashSession {
        &self.session
    }

    pub fn block_size(&self) -> usize {
        self.partition.block_size()
    }

    /// Pick up a resume snapshot left by an earlier process, re-hashing the
    /// blocks it already wrote. Returns true if a session was restored.
    pub async fn restore(&mut self) -> bool {
        let Some(path) = self.partition.snapshot_path() else {
            return false;
        };
        let Some(snapshot) = SessionSnapshot::load(&path).await else {
            return false;
        };
        let block_size = self.block_size();
        if snapshot.bytes_written % block_size as u64 != 0 {
            warn!(?path, "Ignoring snapshot that is not block aligned");
            return false;
        }

        let mut session = FlashSession {
            url: Some(snapshot.url.clone()),
            total_size: snapshot.total_size,
            size_known: snapshot.size_known,
            ..FlashSession::default()
        };
        let blocks = (snapshot.bytes_written / block_size as u64) as u32;
        for index in 0..blocks {
            match self.partition.read_block(index).await {
                Ok(block) => session.commit(&block, block_size),
                Err(e) => {
                    warn!(index, "Cannot re-read written block, starting over: {}", e);
                    return false;
                }
            }
        }
        info!(url = %snapshot.url, bytes_written = session.bytes_written, "Restored resume state");
        self.session = session;
        true
    }

    /// Download `url` into the partition, resuming from the last whole block
    /// of a previous attempt at the same URL.
    pub async fn download_and_install(
        &mut self,
        url: &str,
        cancel: &CancellationToken,
        observer: &dyn DownloadObserver,
    ) -> InstallOutcome {
        if self.session.url.as_deref() != Some(url) && self.session.bytes_written > 0 {
            warn!(
                previous = ?self.session.url,
                "Different image requested, discarding resume state"
            );
            self.session = FlashSession::default();
        }
        self.session.url = Some(url.to_string());

        let block_size = self.partition.block_size();
        let result = if self.session.is_complete() {
            // The link dropped after the last block but before end of stream.
            info!(
                bytes_written = self.session.bytes_written,
                "All blocks already written, finishing without a request"
            );
            Ok(())
        } else {
            if self.session.bytes_written > 0 {
                info!(offset = self.session.bytes_written, "Resuming download");
            }
            let request = DownloadRequest::new(url).resume_from(self.session.bytes_written);

            let mut sink = BlockSink {
                partition: &mut self.partition,
                session: &mut self.session,
                connectivity: &self.connectivity,
                cancel,
                block_size,
                fill_byte: self.fill_byte,
                pending: Vec::with_capacity(block_size * 2),
            };
            let result = match self
                .downloader
                .download(&request, Some(&mut sink as &mut dyn ChunkSink), observer)
                .await
            {
                Ok(_) => sink.finish().await,
                Err(e) => Err(e),
            };
            // Leftover bytes in `sink.pending` die here with the sink.
            drop(sink);
            result
        };

        let bytes_written = self.session.bytes_written;
        let total_size = self.session.total_size;
        let outcome = match result {
            Ok(()) => {
                observer.on_progress(100.0);
                info!(bytes_written, "Download complete");
                let digest = self.session.digest.hex();
                self.session = FlashSession::default();
                InstallOutcome::Installed {
                    bytes_written,
                    digest,
                }
            }
            Err(e) => match e.kind() {
                FailureKind::Transient => {
                    info!(bytes_written, total_size, "Network error ({}), pausing download", e);
                    InstallOutcome::Paused {
                        bytes_written,
                        total_size,
                    }
                }
                FailureKind::Cancelled => {
                    info!(bytes_written, "Download cancelled");
                    InstallOutcome::Cancelled {
                        bytes_written,
                        total_size,
                    }
                }
                FailureKind::Other => {
                    warn!(bytes_written, "Error during download: {}", e);
                    InstallOutcome::Failed {
                        error: e.to_string(),
                        bytes_written,
                        total_size,
                    }
                }
            },
        };
        self.persist().await;
        outcome
    }

    /// Mark the freshly written partition bootable and restart into it.
    pub async fn boot_swap(&mut self) -> Result<(), PartitionError> {
        info!("Setting boot partition and restarting");
        self.partition.mark_bootable_and_restart().await
    }

    async fn persist(&self) {
        let Some(path) = self.partition.snapshot_path() else {
            return;
        };
        let result = match (&self.session.url, self.session.bytes_written) {
            (Some(url), n) if n > 0 => {
                SessionSnapshot {
                    url: url.clone(),
                    bytes_written: n,
                    total_size: self.session.total_size,
                    size_known: self.session.size_known,
                    updated_at: chrono::Utc::now(),
                }
                .save(&path)
                .await
            }
            _ => SessionSnapshot::clear(&path).await,
        };
        if let Err(e) = result {
            warn!(?path, "Failed to persist resume state: {}", e);
        }
    }
}
