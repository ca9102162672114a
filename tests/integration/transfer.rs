use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use stream_scribe::downloader::retry::RetryPolicy;
use stream_scribe::downloader::transfer::ChunkedTransfer;
use stream_scribe::errors::Disposition;
use stream_scribe::{AppConfig, AppError, ErrorKind};

use super::common::*;

const CHUNK: u64 = 8 * 1024;

/// Non-uniform bytes so a restarted or misplaced range shows up in the file.
fn patterned_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn transfer_for(config: &AppConfig) -> ChunkedTransfer {
    ChunkedTransfer::new(
        reqwest::Client::new(),
        &config.network,
        RetryPolicy::from_config(&config.retry),
        CancellationToken::new(),
    )
    .with_chunk_size(CHUNK)
}

fn ignore_progress(_done: u64, _total: Option<u64>) {}

async fn range_headers(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter_map(|r| r.headers.get("range").and_then(|v| v.to_str().ok()).map(str::to_string))
        .collect()
}

#[tokio::test]
async fn test_transient_error_resumes_at_current_offset() {
    let server = MockServer::start().await;
    let body = patterned_body(VIDEO_LEN);
    // The second range fails once with a 503, then the CDN recovers.
    Mock::given(method("GET"))
        .and(path("/file"))
        .and(header("range", "bytes=8192-16383"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/file"))
        .respond_with(RangeResponder::new(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server, dir.path());
    let part = dir.path().join("file.part");
    let last_reported = AtomicU64::new(0);
    let on_progress = |done: u64, _total: Option<u64>| {
        assert!(done >= last_reported.swap(done, Ordering::SeqCst));
    };

    let written = transfer_for(&config)
        .run(&format!("{}/file", server.uri()), &part, None, &on_progress)
        .await
        .unwrap();
    assert_eq!(written, VIDEO_LEN as u64);
    assert_eq!(std::fs::read(&part).unwrap(), body);

    let ranges = range_headers(&server).await;
    assert_eq!(ranges.len(), VIDEO_LEN / CHUNK as usize + 1, "{:?}", ranges);
    assert_eq!(ranges[1], "bytes=8192-16383");
    assert_eq!(ranges[2], "bytes=8192-16383");
    // Only the very first request starts at zero.
    assert_eq!(ranges.iter().filter(|r| r.starts_with("bytes=0-")).count(), 1);
}

#[tokio::test]
async fn test_idle_server_is_a_retryable_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/file"))
        .respond_with(RangeResponder::new(video_body()).delayed(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&server, dir.path());
    config.network.idle_timeout_ms = 100;
    config.retry.max_attempts = 2;

    let err = transfer_for(&config)
        .run(&format!("{}/file", server.uri()), &dir.path().join("file.part"), None, &ignore_progress)
        .await
        .unwrap_err();

    match &err {
        AppError::Exhausted { attempts, last } => {
            assert_eq!(*attempts, 2);
            assert!(matches!(**last, AppError::NetworkTransient(_)), "{:?}", last);
            assert_eq!(last.disposition(), Disposition::Retryable);
        }
        other => panic!("expected exhausted retries, got {:?}", other),
    }
    assert_eq!(err.kind(), ErrorKind::NetworkTransient);
    assert_eq!(range_headers(&server).await.len(), 2);
}

#[tokio::test]
async fn test_range_ignoring_server_is_one_whole_body() {
    let server = MockServer::start().await;
    let body = patterned_body(VIDEO_LEN);
    Mock::given(method("GET"))
        .and(path("/file"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server, dir.path());
    let part = dir.path().join("file.part");

    let written = transfer_for(&config)
        .run(&format!("{}/file", server.uri()), &part, None, &ignore_progress)
        .await
        .unwrap();
    assert_eq!(written, VIDEO_LEN as u64);
    assert_eq!(std::fs::read(&part).unwrap(), body);
    assert_eq!(range_headers(&server).await.len(), 1);
}

/// Announces a full chunk but closes the socket after 100 bytes.
async fn spawn_truncating_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let head = format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Length: {len}\r\nContent-Range: bytes 0-{last}/{len}\r\nConnection: close\r\n\r\n",
                len = CHUNK,
                last = CHUNK - 1
            );
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(&[b'x'; 100]).await;
            let _ = socket.shutdown().await;
        }
    });
    format!("http://{}/file", addr)
}

#[tokio::test]
async fn test_short_body_is_an_interrupted_transfer() {
    let url = spawn_truncating_server().await;
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&server, dir.path());
    config.retry.max_attempts = 2;

    let err = transfer_for(&config)
        .run(&url, &dir.path().join("file.part"), None, &ignore_progress)
        .await
        .unwrap_err();

    match &err {
        AppError::Exhausted { last, .. } => {
            assert!(matches!(**last, AppError::TransferInterrupted(_)), "{:?}", last)
        }
        other => panic!("expected exhausted retries, got {:?}", other),
    }
    assert_eq!(err.kind(), ErrorKind::TransferInterrupted);
}

#[tokio::test]
async fn test_cancelled_transfer_stops_before_next_chunk() {
    let server = MockServer::start().await;
    mount_media(&server).await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&server, dir.path());
    let token = CancellationToken::new();
    token.cancel();

    let transfer = ChunkedTransfer::new(
        reqwest::Client::new(),
        &config.network,
        RetryPolicy::from_config(&config.retry),
        token,
    );
    let err = transfer
        .run(
            &format!("{}/media/{}/video", server.uri(), VIDEO_ID),
            &dir.path().join("file.part"),
            None,
            &ignore_progress,
        )
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(range_headers(&server).await.is_empty());
}
