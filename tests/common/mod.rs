#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{self, HeaderMap, HeaderValue};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rota::config::{DownloadConfig, FlashConfig, OtaConfig, ResumeConfig};
use rota::downloader::DownloadObserver;
use rota::error::DownloadError;
use rota::transport::{Transport, TransportResponse};

enum Piece {
    Data(Bytes),
    Delay(Duration),
    Fail(String),
}

/// One canned response: status, headers and a body that can stall or break.
pub struct Scripted {
    status: u16,
    headers: HeaderMap,
    pieces: Vec<Piece>,
}

impl Scripted {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            pieces: Vec::new(),
        }
    }

    /// 200 with Content-Length, body delivered in `chunk` sized pieces.
    pub fn ok(body: &[u8], chunk: usize) -> Self {
        Self::status(200)
            .header(header::CONTENT_LENGTH, &body.len().to_string())
            .body(body, chunk)
    }

    /// 206 for `body` starting at `start` of a `total` byte resource.
    pub fn partial(start: u64, total: u64, body: &[u8], chunk: usize) -> Self {
        let end = start + body.len() as u64 - 1;
        Self::status(206)
            .header(header::CONTENT_RANGE, &format!("bytes {}-{}/{}", start, end, total))
            .header(header::CONTENT_LENGTH, &body.len().to_string())
            .body(body, chunk)
    }

    pub fn header(mut self, name: header::HeaderName, value: &str) -> Self {
        self.headers.insert(name, HeaderValue::from_str(value).unwrap());
        self
    }

    pub fn body(mut self, body: &[u8], chunk: usize) -> Self {
        for piece in body.chunks(chunk.max(1)) {
            self.pieces.push(Piece::Data(Bytes::copy_from_slice(piece)));
        }
        self
    }

    pub fn stall(mut self, duration: Duration) -> Self {
        self.pieces.push(Piece::Delay(duration));
        self
    }

    pub fn fail(mut self, message: &str) -> Self {
        self.pieces.push(Piece::Fail(message.to_string()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub url: String,
    pub headers: HeaderMap,
}

impl Recorded {
    pub fn range(&self) -> Option<&str> {
        self.headers.get(header::RANGE)?.to_str().ok()
    }
}

/// Serves queued responses in order and remembers every request.
/// An empty queue behaves like an unreachable host.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<Recorded>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, response: Scripted) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, url: &str, headers: HeaderMap) -> Result<TransportResponse, DownloadError> {
        self.requests.lock().unwrap().push(Recorded {
            url: url.to_string(),
            headers,
        });
        let Some(scripted) = self.responses.lock().unwrap().pop_front() else {
            return Err(DownloadError::Network("connection refused".into()));
        };
        let body = futures::stream::iter(scripted.pieces)
            .then(|piece| async move {
                match piece {
                    Piece::Data(bytes) => Ok(bytes),
                    Piece::Delay(duration) => {
                        tokio::time::sleep(duration).await;
                        Ok(Bytes::new())
                    }
                    Piece::Fail(message) => Err(DownloadError::Network(message)),
                }
            })
            .boxed();
        Ok(TransportResponse {
            status: scripted.status,
            headers: scripted.headers,
            body,
        })
    }
}

/// Records every progress report and optionally reacts to it.
#[derive(Default)]
pub struct Recorder {
    pub progress: Mutex<Vec<f64>>,
    pub speeds: Mutex<Vec<f64>>,
    on_progress: Option<Box<dyn Fn(f64) + Send + Sync>>,
}

impl Recorder {
    pub fn reacting(f: impl Fn(f64) + Send + Sync + 'static) -> Self {
        Self {
            on_progress: Some(Box::new(f)),
            ..Self::default()
        }
    }

    pub fn progress(&self) -> Vec<f64> {
        self.progress.lock().unwrap().clone()
    }
}

impl DownloadObserver for Recorder {
    fn on_progress(&self, percent: f64) {
        self.progress.lock().unwrap().push(percent);
        if let Some(f) = &self.on_progress {
            f(percent);
        }
    }

    fn on_speed(&self, bytes_per_sec: f64) {
        self.speeds.lock().unwrap().push(bytes_per_sec);
    }
}

/// Deterministic non-repeating test image.
pub fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn download_config() -> DownloadConfig {
    DownloadConfig {
        chunk_timeout_secs: 2,
        speed_interval_ms: 10,
        ..DownloadConfig::default()
    }
}

pub fn test_config(server_url: &str) -> OtaConfig {
    OtaConfig {
        server_url: server_url.to_string(),
        reference_device: "reference_board".to_string(),
        metadata_stem: "osupdate".to_string(),
        download: download_config(),
        flash: FlashConfig::default(),
        resume: ResumeConfig {
            poll_interval_ms: 10,
            max_wait_secs: 1,
            stabilization_ms: 10,
        },
    }
}
