use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{self, HeaderMap};
use reqwest::Client;

use crate::config::DownloadConfig;
use crate::error::DownloadError;

pub type BodyStream = BoxStream<'static, Result<Bytes, DownloadError>>;

pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl TransportResponse {
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    pub fn content_range(&self) -> Option<ContentRange> {
        let value = self.headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
        ContentRange::parse(value)
    }
}

/// A parsed `Content-Range: bytes START-END/TOTAL` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    /// `None` when the server sent `*` for the complete length.
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes")?.trim_start();
        let (range, total) = rest.split_once('/')?;
        let (start, end) = range.split_once('-')?;
        let start = start.trim().parse().ok()?;
        let end = end.trim().parse().ok()?;
        let total = match total.trim() {
            "*" => None,
            total => Some(total.parse().ok()?),
        };
        let fits = total.map_or(true, |total| end < total);
        (start <= end && fits).then_some(Self { start, end, total })
    }
}

/// Streamed GET. Implementations must not buffer the whole body.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, headers: HeaderMap) -> Result<TransportResponse, DownloadError>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(config: &DownloadConfig) -> Self {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str, headers: HeaderMap) -> Result<TransportResponse, DownloadError> {
        let response = self.client.get(url).headers(headers).send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes_stream().map_err(DownloadError::from).boxed();
        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
