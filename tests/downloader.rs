mod common;

use async_trait::async_trait;
use common::*;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use rota::config::DownloadConfig;
use rota::downloader::{
    ChunkSink, DownloadRequest, Downloaded, Downloader, NoopObserver, SizeSource, TransferInfo,
};
use rota::error::DownloadError;
use rota::transport::ReqwestTransport;

#[derive(Default)]
struct Capture {
    info: Option<TransferInfo>,
    data: Vec<u8>,
    chunks: usize,
}

#[async_trait]
impl ChunkSink for Capture {
    async fn on_start(&mut self, info: &TransferInfo) -> Result<(), DownloadError> {
        self.info = Some(*info);
        Ok(())
    }

    async fn on_chunk(&mut self, chunk: &[u8]) -> Result<(), DownloadError> {
        self.data.extend_from_slice(chunk);
        self.chunks += 1;
        Ok(())
    }
}

fn http_downloader() -> Downloader {
    let config = download_config();
    Downloader::new(Arc::new(ReqwestTransport::new(&config)), config)
}

#[tokio::test]
async fn downloads_into_memory() {
    let server = MockServer::start().await;
    let body = image(10_000);
    Mock::given(method("GET"))
        .and(path("/fw.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;
    let recorder = Recorder::default();

    let downloaded = http_downloader()
        .download(
            &DownloadRequest::new(format!("{}/fw.bin", server.uri())),
            None,
            &recorder,
        )
        .await
        .unwrap();

    assert_eq!(downloaded, Downloaded::Bytes(body));
    let progress = recorder.progress();
    assert_eq!(progress.last(), Some(&100.0));
    assert!(progress.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn sink_gets_fixed_size_chunks_and_content_length() {
    let server = MockServer::start().await;
    let body = image(10_000);
    Mock::given(method("GET"))
        .and(path("/fw.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;
    let mut sink = Capture::default();

    let downloaded = http_downloader()
        .download(
            &DownloadRequest::new(format!("{}/fw.bin", server.uri())),
            Some(&mut sink as &mut dyn ChunkSink),
            &NoopObserver,
        )
        .await
        .unwrap();

    assert_eq!(downloaded, Downloaded::Streamed { bytes: 10_000 });
    assert_eq!(sink.data, body);
    // 4096 + 4096 + 1808
    assert_eq!(sink.chunks, 3);
    let info = sink.info.unwrap();
    assert_eq!(info.total_size, 10_000);
    assert_eq!(info.size_source, SizeSource::ContentLength);
    assert_eq!(info.resume_offset, 0);
}

#[tokio::test]
async fn resumed_file_download_appends() {
    let server = MockServer::start().await;
    let body = image(8192);
    Mock::given(method("GET"))
        .and(path("/fw.bin"))
        .and(wiremock::matchers::header("Range", "bytes=4096-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 4096-8191/8192")
                .set_body_bytes(body[4096..].to_vec()),
        )
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("fw.bin");
    std::fs::write(&target, &body[..4096]).unwrap();
    let mut sink = Capture::default();

    let downloaded = http_downloader()
        .download(
            &DownloadRequest::new(format!("{}/fw.bin", server.uri()))
                .resume_from(4096)
                .outfile(&target),
            None,
            &NoopObserver,
        )
        .await
        .unwrap();

    assert_eq!(
        downloaded,
        Downloaded::File {
            path: target.clone(),
            bytes: 4096
        }
    );
    assert_eq!(std::fs::read(&target).unwrap(), body);

    // the same response seen through a sink reports where it starts
    http_downloader()
        .download(
            &DownloadRequest::new(format!("{}/fw.bin", server.uri())).resume_from(4096),
            Some(&mut sink as &mut dyn ChunkSink),
            &NoopObserver,
        )
        .await
        .unwrap();
    let info = sink.info.unwrap();
    assert_eq!(info.status, 206);
    assert_eq!(info.resume_offset, 4096);
    assert_eq!(info.total_size, 8192);
    assert_eq!(info.size_source, SizeSource::ContentRange);
}

#[tokio::test]
async fn http_errors_are_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = http_downloader()
        .fetch_bytes(&format!("{}/missing.json", server.uri()))
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::HttpStatus { status: 404, .. }));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn file_and_sink_together_are_rejected() {
    let transport = ScriptedTransport::new(vec![]);
    let downloader = Downloader::new(transport.clone(), download_config());
    let mut sink = Capture::default();

    let err = downloader
        .download(
            &DownloadRequest::new("http://ota.test/fw.bin").outfile("/tmp/never-written.bin"),
            Some(&mut sink as &mut dyn ChunkSink),
            &NoopObserver,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::InvalidDestination));
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn unknown_size_falls_back() {
    let body = image(3000);
    let transport = ScriptedTransport::new(vec![Scripted::status(200).body(&body, 1000)]);
    let downloader = Downloader::new(transport, download_config());
    let mut sink = Capture::default();

    downloader
        .download(
            &DownloadRequest::new("http://ota.test/fw.bin"),
            Some(&mut sink as &mut dyn ChunkSink),
            &NoopObserver,
        )
        .await
        .unwrap();

    let info = sink.info.unwrap();
    assert_eq!(info.size_source, SizeSource::Fallback);
    assert_eq!(info.total_size, 100 * 1024);
    assert_eq!(sink.data, body);
}

#[tokio::test]
async fn caller_size_wins() {
    let body = image(3000);
    let transport = ScriptedTransport::new(vec![Scripted::ok(&body, 1000)]);
    let downloader = Downloader::new(transport, download_config());
    let mut sink = Capture::default();

    downloader
        .download(
            &DownloadRequest::new("http://ota.test/fw.bin").total_size(6000),
            Some(&mut sink as &mut dyn ChunkSink),
            &NoopObserver,
        )
        .await
        .unwrap();

    let info = sink.info.unwrap();
    assert_eq!(info.size_source, SizeSource::Caller);
    assert_eq!(info.total_size, 6000);
}

fn impatient() -> DownloadConfig {
    DownloadConfig {
        chunk_timeout_secs: 1,
        max_retries: 2,
        ..download_config()
    }
}

#[tokio::test]
async fn stalled_read_is_retried() {
    let body = image(4096);
    let transport = ScriptedTransport::new(vec![Scripted::ok(&body[..1000], 1000)
        .stall(Duration::from_millis(1500))
        .body(&body[1000..], 1000)
        .header(reqwest::header::CONTENT_LENGTH, "4096")]);
    let downloader = Downloader::new(transport, impatient());

    let bytes = downloader.fetch_bytes("http://ota.test/fw.bin").await.unwrap();

    assert_eq!(bytes, body);
}

#[tokio::test]
async fn retries_are_bounded() {
    let transport = ScriptedTransport::new(vec![Scripted::ok(&image(1000), 1000).stall(Duration::from_secs(5))]);
    let downloader = Downloader::new(transport, impatient());

    let err = downloader.fetch_bytes("http://ota.test/fw.bin").await.unwrap_err();

    assert!(err.to_string().contains("failed to download chunk after retries"), "{}", err);
    assert!(matches!(err, DownloadError::ChunkReadExhausted { attempts: 2, .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn error_then_eof_is_not_success() {
    let transport = ScriptedTransport::new(vec![Scripted::ok(&image(1000), 1000).fail("connection reset")]);
    let downloader = Downloader::new(transport, download_config());

    let err = downloader.fetch_bytes("http://ota.test/fw.bin").await.unwrap_err();

    assert!(matches!(err, DownloadError::ChunkReadExhausted { attempts: 3, .. }));
}
