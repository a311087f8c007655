use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::Fuse;
use futures::StreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::header::{self, HeaderMap, HeaderValue};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::transport::{BodyStream, Transport, TransportResponse};
use crate::utils::round2;

/// Receives the body of a streamed download, one chunk at a time.
#[async_trait]
pub trait ChunkSink: Send {
    /// Called once, after the response headers are known and before the first chunk.
    async fn on_start(&mut self, _info: &TransferInfo) -> Result<(), DownloadError> {
        Ok(())
    }

    async fn on_chunk(&mut self, chunk: &[u8]) -> Result<(), DownloadError>;
}

/// Progress and speed notifications. Both are rate-limited by the engine.
pub trait DownloadObserver: Send + Sync {
    fn on_progress(&self, _percent: f64) {}
    fn on_speed(&self, _bytes_per_sec: f64) {}
}

pub struct NoopObserver;

impl DownloadObserver for NoopObserver {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeSource {
    Caller,
    ContentRange,
    ContentLength,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferInfo {
    pub status: u16,
    /// First byte of the body within the whole resource.
    pub resume_offset: u64,
    pub total_size: u64,
    pub size_source: SizeSource,
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub headers: HeaderMap,
    /// Offset asked for with `Range`, 0 for the whole resource.
    pub resume_offset: u64,
    pub total_size: Option<u64>,
    pub outfile: Option<PathBuf>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HeaderMap::new(),
            resume_offset: 0,
            total_size: None,
            outfile: None,
        }
    }

    /// Ask the server for everything from `offset` on.
    pub fn resume_from(mut self, offset: u64) -> Self {
        if offset > 0 {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes={}-", offset)) {
                self.headers.insert(header::RANGE, value);
                self.resume_offset = offset;
            }
        }
        self
    }

    pub fn total_size(mut self, size: u64) -> Self {
        self.total_size = Some(size);
        self
    }

    pub fn outfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.outfile = Some(path.into());
        self
    }

    pub fn header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Downloaded {
    Bytes(Vec<u8>),
    File { path: PathBuf, bytes: u64 },
    Streamed { bytes: u64 },
}

impl Downloaded {
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Downloaded::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// Byte counters for one transfer.
#[derive(Debug)]
pub struct TransferProgress {
    pub transferred: u64,
    pub total: u64,
    last_percent: Option<f64>,
    speed_bytes: u64,
    speed_tick: Instant,
}

impl TransferProgress {
    pub fn new(start: u64, total: u64) -> Self {
        Self {
            transferred: start,
            total,
            last_percent: None,
            speed_bytes: 0,
            speed_tick: Instant::now(),
        }
    }

    /// Count `n` more bytes. Returns the new percentage only if it changed.
    pub fn advance(&mut self, n: u64) -> Option<f64> {
        self.transferred += n;
        self.speed_bytes += n;
        let percent = if self.total == 0 {
            100.0
        } else {
            round2((self.transferred as f64 * 100.0 / self.total as f64).min(100.0))
        };
        if self.last_percent == Some(percent) {
            return None;
        }
        self.last_percent = Some(percent);
        Some(percent)
    }

    /// Bytes per second since the previous report, once `interval` has passed.
    pub fn tick_speed(&mut self, interval: Duration) -> Option<f64> {
        let elapsed = self.speed_tick.elapsed();
        if elapsed < interval || elapsed.is_zero() {
            return None;
        }
        let speed = self.speed_bytes as f64 / elapsed.as_secs_f64();
        self.speed_bytes = 0;
        self.speed_tick = Instant::now();
        Some(speed)
    }
}

enum Output<'a> {
    Memory(Vec<u8>),
    File { file: File, path: PathBuf, bytes: u64 },
    Sink { sink: &'a mut dyn ChunkSink, bytes: u64 },
}

impl Output<'_> {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), DownloadError> {
        match self {
            Output::Memory(buf) => buf.extend_from_slice(chunk),
            Output::File { file, bytes, .. } => {
                file.write_all(chunk).await?;
                *bytes += chunk.len() as u64;
            }
            Output::Sink { sink, bytes } => {
                sink.on_chunk(chunk).await?;
                *bytes += chunk.len() as u64;
            }
        }
        Ok(())
    }

    async fn finish(self) -> Result<Downloaded, DownloadError> {
        Ok(match self {
            Output::Memory(buf) => Downloaded::Bytes(buf),
            Output::File {
                mut file,
                path,
                bytes,
            } => {
                file.flush().await?;
                Downloaded::File { path, bytes }
            }
            Output::Sink { bytes, .. } => Downloaded::Streamed { bytes },
        })
    }

    async fn abandon(self) {
        if let Output::File { mut file, path, .. } = self {
            if let Err(e) = file.flush().await {
                warn!(?path, "Failed to flush partial file: {}", e);
            }
        }
    }
}

/// Re-slices the response body into fixed-size chunks, each read under a
/// timeout and retried a bounded number of times.
struct ChunkReader {
    body: Fuse<BodyStream>,
    buffer: BytesMut,
    chunk_size: usize,
    timeout: Duration,
    max_retries: u32,
    eof: bool,
    failed: bool,
    offset: u64,
}

impl ChunkReader {
    fn new(body: BodyStream, config: &DownloadConfig, offset: u64) -> Self {
        Self {
            body: body.fuse(),
            buffer: BytesMut::with_capacity(config.chunk_size * 2),
            chunk_size: config.chunk_size,
            timeout: config.chunk_timeout(),
            max_retries: config.max_retries.max(1),
            eof: false,
            failed: false,
            offset,
        }
    }

    async fn fill(&mut self) -> Result<(), DownloadError> {
        while self.buffer.len() < self.chunk_size && !self.eof {
            match self.body.next().await {
                Some(Ok(bytes)) => self.buffer.extend_from_slice(&bytes),
                Some(Err(e)) => return Err(e),
                // A body that ends right after a failed read was cut, not finished.
                None if self.failed => {
                    return Err(DownloadError::Network("stream ended after a failed read".into()))
                }
                None => self.eof = true,
            }
        }
        Ok(())
    }

    /// `Ok(None)` is end of stream.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, DownloadError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let last = match tokio::time::timeout(self.timeout, self.fill()).await {
                Ok(Ok(())) => break,
                Ok(Err(e)) => {
                    self.failed = true;
                    e.to_string()
                }
                Err(_) => format!("read timed out after {:?}", self.timeout),
            };
            warn!(attempt = attempts, offset = self.offset, "Chunk read error: {}", last);
            if attempts >= self.max_retries {
                return Err(DownloadError::ChunkReadExhausted {
                    attempts,
                    offset: self.offset,
                    last,
                });
            }
        }
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let n = self.buffer.len().min(self.chunk_size);
        self.offset += n as u64;
        Ok(Some(self.buffer.split_to(n).freeze()))
    }
}

pub struct Downloader {
    transport: Arc<dyn Transport>,
    config: DownloadConfig,
    rate_limiter: Option<Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>>,
}

impl Downloader {
    pub fn new(transport: Arc<dyn Transport>, config: DownloadConfig) -> Self {
        let rate_limiter = config
            .rate_limit
            .and_then(NonZeroU32::new)
            .map(|limit| Arc::new(RateLimiter::direct(Quota::per_second(limit))));
        Self {
            transport,
            config,
            rate_limiter,
        }
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Fetch `url` into memory.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        let downloaded = self
            .download(&DownloadRequest::new(url), None, &NoopObserver)
            .await?;
        Ok(downloaded.into_bytes().unwrap_or_default())
    }

    /// Stream `request.url` into its outfile, into `sink`, or into memory when neither is given.
    pub async fn download(
        &self,
        request: &DownloadRequest,
        sink: Option<&mut dyn ChunkSink>,
        observer: &dyn DownloadObserver,
    ) -> Result<Downloaded, DownloadError> {
        if request.outfile.is_some() && sink.is_some() {
            return Err(DownloadError::InvalidDestination);
        }

        info!(url = %request.url, "Downloading");
        let response = self
            .transport
            .get(&request.url, request.headers.clone())
            .await?;
        if !(200..300).contains(&response.status) {
            warn!(status = response.status, url = %request.url, "HTTP error");
            return Err(DownloadError::HttpStatus {
                status: response.status,
                url: request.url.clone(),
            });
        }

        let info = self.transfer_info(request, &response)?;
        debug!(?info, "Response headers: {:?}", response.headers);

        let mut output = match (&request.outfile, sink) {
            (Some(path), None) => {
                let file = if info.resume_offset > 0 {
                    OpenOptions::new().create(true).append(true).open(path).await?
                } else {
                    File::create(path).await?
                };
                Output::File {
                    file,
                    path: path.clone(),
                    bytes: 0,
                }
            }
            (None, Some(sink)) => {
                sink.on_start(&info).await?;
                Output::Sink { sink, bytes: 0 }
            }
            _ => Output::Memory(Vec::new()),
        };

        info!(
            total = info.total_size,
            from = info.resume_offset,
            chunk = self.config.chunk_size,
            "Transferring"
        );

        let mut reader = ChunkReader::new(response.body, &self.config, info.resume_offset);
        let mut progress = TransferProgress::new(info.resume_offset, info.total_size);
        match self
            .pump(&mut reader, &mut output, &mut progress, observer)
            .await
        {
            Ok(()) => {
                info!(url = %request.url, bytes = progress.transferred, "Finished downloading");
                output.finish().await
            }
            Err(e) => {
                output.abandon().await;
                Err(e)
            }
        }
    }

    /// Only a 206 body starts anywhere but 0, and only where its
    /// `Content-Range` says it does.
    fn transfer_info(
        &self,
        request: &DownloadRequest,
        response: &TransportResponse,
    ) -> Result<TransferInfo, DownloadError> {
        let range = if response.status == 206 {
            match response.content_range() {
                Some(range) => Some(range),
                None => {
                    warn!(
                        url = %request.url,
                        "Partial response without a usable Content-Range: {:?}",
                        response.headers.get(header::CONTENT_RANGE)
                    );
                    return Err(DownloadError::MissingContentRange {
                        expected: request.resume_offset,
                    });
                }
            }
        } else {
            None
        };
        let resume_offset = range.map(|r| r.start).unwrap_or(0);
        let (total_size, size_source) = if let Some(total) = request.total_size {
            (total, SizeSource::Caller)
        } else if let Some(total) = range.and_then(|r| r.total) {
            (total, SizeSource::ContentRange)
        } else if let Some(len) = response.content_length() {
            (resume_offset + len, SizeSource::ContentLength)
        } else {
            warn!(
                "Unable to determine total size, assuming {} bytes",
                self.config.fallback_total_size
            );
            (self.config.fallback_total_size, SizeSource::Fallback)
        };
        Ok(TransferInfo {
            status: response.status,
            resume_offset,
            total_size,
            size_source,
        })
    }

    async fn pump(
        &self,
        reader: &mut ChunkReader,
        output: &mut Output<'_>,
        progress: &mut TransferProgress,
        observer: &dyn DownloadObserver,
    ) -> Result<(), DownloadError> {
        let speed_interval = self.config.speed_interval();
        while let Some(chunk) = reader.next_chunk().await? {
            if let Some(limiter) = &self.rate_limiter {
                let cells = u32::try_from(chunk.len()).unwrap_or(u32::MAX);
                let cap = self.config.rate_limit.unwrap_or(u32::MAX);
                if let Some(n) = NonZeroU32::new(cells.min(cap)) {
                    if let Err(e) = limiter.until_n_ready(n).await {
                        warn!("Rate limiter rejected chunk: {}", e);
                    }
                }
            }

            output.write(&chunk).await?;

            if let Some(percent) = progress.advance(chunk.len() as u64) {
                observer.on_progress(percent);
            }
            if let Some(speed) = progress.tick_speed(speed_interval) {
                observer.on_speed(speed);
            }
        }
        Ok(())
    }
}
