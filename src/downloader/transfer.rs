use std::path::Path;
use std::time::Duration;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::NetworkConfig;
use crate::downloader::retry::{RetryController, RetryPolicy};
use crate::errors::{AppError, Result};

/// Progress sink: bytes written so far and the total when known.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// Streams one remote file into a local part file as a series of ranged
/// requests. Each range is its own retry unit, so a dropped connection
/// resumes at the current offset instead of restarting the file.
pub struct ChunkedTransfer {
    client: Client,
    chunk_size: u64,
    idle_timeout: Duration,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct Cursor {
    file: File,
    offset: u64,
    total: Option<u64>,
}

impl Cursor {
    fn is_done(&self) -> bool {
        self.total.map_or(false, |total| self.offset >= total)
    }
}

impl ChunkedTransfer {
    pub fn new(client: Client, config: &NetworkConfig, retry: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            client,
            chunk_size: config.chunk_size,
            idle_timeout: config.idle_timeout(),
            retry,
            cancel,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Downloads `url` into `part_path`, returning the number of bytes written.
    pub async fn run(
        &self,
        url: &str,
        part_path: &Path,
        expected_size: Option<u64>,
        on_progress: ProgressFn<'_>,
    ) -> Result<u64> {
        let file = File::create(part_path).await?;
        let cursor = Mutex::new(Cursor {
            file,
            offset: 0,
            total: expected_size,
        });
        let controller = RetryController::new(self.retry).with_cancellation(self.cancel.clone());

        let mut chunk_index = 0u64;
        loop {
            if self.cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            if cursor.lock().await.is_done() {
                break;
            }

            chunk_index += 1;
            let label = format!("chunk {} of {:?}", chunk_index, part_path.file_name().unwrap_or_default());
            let cursor_ref = &cursor;
            let finished = controller
                .execute(&label, move || async move {
                    let mut cursor = cursor_ref.lock().await;
                    self.fetch_chunk(url, &mut cursor, on_progress).await
                })
                .await?;

            if finished {
                break;
            }
        }

        let mut cursor = cursor.into_inner();
        cursor.file.flush().await?;
        cursor.file.sync_all().await?;
        log::debug!(
            "📦 [TRANSFER] {:?} complete: {} bytes in {} request(s)",
            part_path, cursor.offset, chunk_index
        );
        Ok(cursor.offset)
    }

    /// One ranged request. `Ok(true)` means the file is complete.
    async fn fetch_chunk(&self, url: &str, cursor: &mut Cursor, on_progress: ProgressFn<'_>) -> Result<bool> {
        let start = cursor.offset;
        let end = match cursor.total {
            Some(total) => (start + self.chunk_size).min(total).saturating_sub(1),
            None => start + self.chunk_size - 1,
        };

        let request = self.client.get(url).header(RANGE, format!("bytes={}-{}", start, end));
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(AppError::Cancelled),
            sent = tokio::time::timeout(self.idle_timeout, request.send()) => sent
                .map_err(|_| AppError::NetworkTransient(format!("no response within {:?}", self.idle_timeout)))??,
        };

        let status = response.status();
        let whole_body = match status {
            StatusCode::PARTIAL_CONTENT => {
                if let Some(total) = content_range_total(response.headers().get(CONTENT_RANGE)) {
                    cursor.total = Some(total);
                }
                false
            }
            StatusCode::OK => {
                // Range ignored: the body is the entire file from byte zero.
                if start > 0 {
                    log::warn!("⚠️ [TRANSFER] Server ignored range at offset {}, restarting file", start);
                    cursor.file.set_len(0).await?;
                    cursor.file.seek(std::io::SeekFrom::Start(0)).await?;
                    cursor.offset = 0;
                }
                if let Some(length) = response.content_length() {
                    cursor.total = Some(length);
                }
                true
            }
            StatusCode::RANGE_NOT_SATISFIABLE if start > 0 || cursor.total.is_none() => {
                // Nothing left past the offset.
                cursor.total = Some(start);
                return Ok(true);
            }
            _ => return Err(AppError::from_status(status, "transfer")),
        };

        let requested = end - start + 1;
        let announced = response.content_length();
        let mut received = 0u64;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(AppError::Cancelled),
                next = tokio::time::timeout(self.idle_timeout, stream.next()) => next,
            };

            match next {
                Err(_) => {
                    return Err(AppError::NetworkTransient(format!(
                        "no bytes received for {:?} at offset {}",
                        self.idle_timeout, cursor.offset
                    )))
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(AppError::TransferInterrupted(e.to_string())),
                Ok(Some(Ok(bytes))) => {
                    cursor.file.write_all(&bytes).await?;
                    cursor.offset += bytes.len() as u64;
                    received += bytes.len() as u64;
                    on_progress(cursor.offset, cursor.total);
                }
            }
        }

        if let Some(expected) = announced {
            if received < expected {
                return Err(AppError::TransferInterrupted(format!(
                    "body ended after {} of {} bytes",
                    received, expected
                )));
            }
        }

        if whole_body {
            cursor.total = Some(cursor.offset);
            return Ok(true);
        }
        if let Some(total) = cursor.total {
            if cursor.offset < total && received == 0 {
                return Err(AppError::TransferInterrupted(format!("empty range at offset {}", start)));
            }
        } else if received < requested {
            // Unknown size and a short range: that was the tail.
            cursor.total = Some(cursor.offset);
        }

        Ok(cursor.is_done())
    }
}

/// Total size from `Content-Range: bytes a-b/total`.
fn content_range_total(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?;
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}
