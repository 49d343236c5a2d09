//! Resumable chunked transfer engine
//!
//! Downloads stream into a `<destination>.part` file and are renamed into
//! place only after the full body has arrived and verified, so the presence
//! of the destination file is itself the completion marker. A surviving
//! `.part` file is resumed with an HTTP Range request on the next attempt.

use crate::config::{DownloadConfig, RetryConfig};
use crate::error::TransferError;
use crate::retry::with_retry;
use crate::utils;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Minimum interval between progress callbacks
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// One transfer to perform
#[derive(Clone, Debug)]
pub struct TransferRequest {
    /// Remote URL to fetch
    pub url: String,
    /// Final local path for the completed file
    pub destination: PathBuf,
    /// Expected total size, if the caller knows it (e.g. from an index)
    pub expected_size: Option<u64>,
    /// Expected SHA-256 hex digest, verified after completion if present
    pub checksum: Option<String>,
}

/// How a transfer ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The body was fetched (possibly resumed) and the file renamed into place
    Completed {
        /// Final on-disk size in bytes
        bytes: u64,
    },
    /// The destination already existed with the expected size; nothing was fetched
    AlreadyComplete,
}

/// Progress observation for one transfer session
#[derive(Clone, Copy, Debug)]
pub struct TransferProgress {
    /// Bytes present locally, including any resumed prefix
    pub bytes_done: u64,
    /// Total size if the server (or caller) reported one
    pub bytes_total: Option<u64>,
    /// Current session speed in bytes per second
    pub speed_bps: u64,
}

/// Callback invoked with throttled progress updates
pub type ProgressFn = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// What a probe learned about the remote resource
#[derive(Clone, Debug)]
pub struct RemoteInfo {
    /// Total size from Content-Length, if reported
    pub total_size: Option<u64>,
    /// Whether the server advertises byte-range support
    pub accepts_ranges: bool,
}

/// An open response body ready to stream
pub struct FetchBody {
    /// Offset the server actually honored. Zero when a requested range was
    /// ignored, in which case the caller must discard its partial file.
    pub resumed_at: u64,
    /// Total size of the complete resource, if known
    pub total_size: Option<u64>,
    /// Chunked body bytes
    pub stream: Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransferError>> + Send>>,
}

/// Seam between the transfer engine and the network
///
/// Production uses [`HttpTransport`]; tests substitute scripted transports
/// to exercise resume and failure paths without a server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Learn the resource's size and range support without fetching the body
    async fn probe(&self, url: &str) -> Result<RemoteInfo, TransferError>;

    /// Open the body starting at `offset` (zero for a fresh fetch)
    async fn fetch(&self, url: &str, offset: u64) -> Result<FetchBody, TransferError>;
}

/// HTTP transport backed by a shared reqwest client
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport with the configured user agent
    pub fn new(config: &DownloadConfig) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn probe(&self, url: &str) -> Result<RemoteInfo, TransferError> {
        let response = self.client.head(url).send().await?.error_for_status()?;
        let total_size = response.content_length();
        let accepts_ranges = response
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        Ok(RemoteInfo {
            total_size,
            accepts_ranges,
        })
    }

    async fn fetch(&self, url: &str, offset: u64) -> Result<FetchBody, TransferError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }
        let mut response = request.send().await?;

        // 416 means the requested suffix starts at or past the end of the
        // resource, so the partial is no prefix of what the server has now.
        // Fetch the whole body and let the caller restart from zero.
        if offset > 0 && response.status() == reqwest::StatusCode::RANGE_NOT_SATISFIABLE {
            tracing::debug!(url = %url, offset, "range not satisfiable, refetching in full");
            response = self.client.get(url).send().await?;
        }
        let response = response.error_for_status()?;

        // A 200 to a ranged request means the server ignored the range and
        // is sending the whole body from the start.
        let resumed_at = if offset > 0 && response.status() == reqwest::StatusCode::PARTIAL_CONTENT
        {
            offset
        } else {
            0
        };

        let total_size = response.content_length().map(|len| len + resumed_at);

        let stream = response
            .bytes_stream()
            .map(|item| item.map(|b| b.to_vec()).map_err(TransferError::Network));

        Ok(FetchBody {
            resumed_at,
            total_size,
            stream: Box::pin(stream),
        })
    }
}

/// The transfer engine: retries, resume, verification
pub struct TransferEngine {
    transport: Arc<dyn Transport>,
    download: DownloadConfig,
    retry: RetryConfig,
}

impl TransferEngine {
    /// Create an engine over an arbitrary transport
    pub fn new(
        transport: Arc<dyn Transport>,
        download: DownloadConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            transport,
            download,
            retry,
        }
    }

    /// Execute a transfer to completion, retrying transient failures
    ///
    /// Each retry attempt re-reads the partial file's length and resumes
    /// from there, so bytes fetched before a transient failure are never
    /// fetched twice. Cancellation returns [`TransferError::Cancelled`]
    /// promptly and always leaves the partial file on disk.
    pub async fn download(
        &self,
        request: &TransferRequest,
        cancel: &CancellationToken,
        progress: Option<ProgressFn>,
    ) -> Result<TransferOutcome, TransferError> {
        with_retry(&self.retry, cancel, || {
            self.attempt(request, cancel, progress.clone())
        })
        .await
    }

    async fn attempt(
        &self,
        request: &TransferRequest,
        cancel: &CancellationToken,
        progress: Option<ProgressFn>,
    ) -> Result<TransferOutcome, TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        if let Some(outcome) = self.check_already_complete(request).await? {
            return Ok(outcome);
        }

        let part = utils::part_path(&request.destination);
        let mut offset = match tokio::fs::metadata(&part).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        if offset > 0 {
            match self.reconcile_partial(request, offset).await {
                PartialState::Complete => {
                    // The earlier session had every byte and only missed the
                    // rename; asking for the empty suffix would draw a 416
                    return self.promote(request, &part, offset, progress.as_ref()).await;
                }
                PartialState::Stale => {
                    tracing::warn!(
                        path = %part.display(),
                        on_disk = offset,
                        "partial is larger than the remote resource, restarting"
                    );
                    tokio::fs::remove_file(&part)
                        .await
                        .map_err(|e| io_error(&part, e))?;
                    offset = 0;
                }
                PartialState::Resumable => {}
            }
        }

        let mut expected = request.expected_size;
        let mut body = self.transport.fetch(&request.url, offset).await?;

        // A resumed body whose total disagrees with the recorded size means
        // the remote resource changed under us; the prefix on disk belongs
        // to the old one and must not be extended.
        if body.resumed_at > 0
            && let Some(size) = expected
            && body.total_size.is_some_and(|t| t != size)
        {
            tracing::warn!(
                url = %request.url,
                recorded = size,
                server = ?body.total_size,
                "remote size changed, discarding the partial and restarting"
            );
            body = self.transport.fetch(&request.url, 0).await?;
            expected = None;
        }

        let resumed_at = body.resumed_at;
        let total = expected.or(body.total_size);

        if offset > 0 && resumed_at == 0 {
            tracing::debug!(
                path = %part.display(),
                discarded = offset,
                "server ignored range request, restarting from the beginning"
            );
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(resumed_at > 0)
            .truncate(resumed_at == 0)
            .write(true)
            .open(&part)
            .await
            .map_err(|e| io_error(&part, e))?;

        let mut bytes_done = resumed_at;
        let mut stream = body.stream;

        // Session speed is measured over a sliding one-second window
        let mut window_start = Instant::now();
        let mut window_bytes: u64 = 0;
        let mut speed_bps: u64 = 0;
        let mut last_report: Option<Instant> = None;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    file.flush().await.map_err(|e| io_error(&part, e))?;
                    tracing::debug!(
                        path = %part.display(),
                        bytes = bytes_done,
                        "transfer cancelled, partial file retained"
                    );
                    return Err(TransferError::Cancelled);
                }
                chunk = stream.next() => chunk,
            };

            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            file.write_all(&chunk)
                .await
                .map_err(|e| io_error(&part, e))?;
            bytes_done += chunk.len() as u64;
            window_bytes += chunk.len() as u64;

            let elapsed = window_start.elapsed();
            if elapsed >= Duration::from_secs(1) {
                speed_bps = (window_bytes as f64 / elapsed.as_secs_f64()) as u64;
                window_start = Instant::now();
                window_bytes = 0;
            }

            if let Some(report) = &progress
                && last_report.is_none_or(|at| at.elapsed() >= PROGRESS_INTERVAL)
            {
                report(TransferProgress {
                    bytes_done,
                    bytes_total: total,
                    speed_bps,
                });
                last_report = Some(Instant::now());
            }
        }

        file.flush().await.map_err(|e| io_error(&part, e))?;
        drop(file);

        if self.download.verify_size
            && let Some(expected) = total
            && bytes_done != expected
        {
            return Err(TransferError::Incomplete {
                expected,
                actual: bytes_done,
            });
        }

        tokio::fs::rename(&part, &request.destination)
            .await
            .map_err(|e| io_error(&part, e))?;

        if let Some(expected) = &request.checksum {
            verify_checksum(&request.destination, expected).await?;
        }

        if let Some(report) = &progress {
            report(TransferProgress {
                bytes_done,
                bytes_total: total,
                speed_bps,
            });
        }

        tracing::info!(
            url = %request.url,
            path = %request.destination.display(),
            bytes = bytes_done,
            resumed_from = resumed_at,
            "transfer complete"
        );

        Ok(TransferOutcome::Completed { bytes: bytes_done })
    }

    /// Classify an existing partial against the best known total
    ///
    /// With no expected size the remote is probed; a probe that fails or
    /// reports no size leaves the classification to the fetch itself.
    async fn reconcile_partial(&self, request: &TransferRequest, offset: u64) -> PartialState {
        let total = match request.expected_size {
            Some(size) => Some(size),
            None => self
                .transport
                .probe(&request.url)
                .await
                .ok()
                .and_then(|info| info.total_size),
        };
        match total {
            Some(total) if offset == total => PartialState::Complete,
            Some(total) if offset > total => PartialState::Stale,
            _ => PartialState::Resumable,
        }
    }

    /// Rename a finished partial into place and verify it
    async fn promote(
        &self,
        request: &TransferRequest,
        part: &std::path::Path,
        bytes: u64,
        progress: Option<&ProgressFn>,
    ) -> Result<TransferOutcome, TransferError> {
        tokio::fs::rename(part, &request.destination)
            .await
            .map_err(|e| io_error(part, e))?;

        if let Some(expected) = &request.checksum {
            verify_checksum(&request.destination, expected).await?;
        }

        if let Some(report) = progress {
            report(TransferProgress {
                bytes_done: bytes,
                bytes_total: Some(bytes),
                speed_bps: 0,
            });
        }

        tracing::info!(
            url = %request.url,
            path = %request.destination.display(),
            bytes,
            "partial already held the whole resource, promoted"
        );
        Ok(TransferOutcome::Completed { bytes })
    }

    /// Skip the network entirely when the destination is already complete
    async fn check_already_complete(
        &self,
        request: &TransferRequest,
    ) -> Result<Option<TransferOutcome>, TransferError> {
        let Ok(meta) = tokio::fs::metadata(&request.destination).await else {
            return Ok(None);
        };

        let expected = match request.expected_size {
            Some(size) => Some(size),
            None => self.transport.probe(&request.url).await?.total_size,
        };

        match expected {
            Some(size) if meta.len() == size => Ok(Some(TransferOutcome::AlreadyComplete)),
            Some(size) => {
                // A wrong-sized destination is stale; remove it and refetch
                tracing::warn!(
                    path = %request.destination.display(),
                    on_disk = meta.len(),
                    expected = size,
                    "existing file has the wrong size, refetching"
                );
                tokio::fs::remove_file(&request.destination)
                    .await
                    .map_err(|e| io_error(&request.destination, e))?;
                Ok(None)
            }
            // The file only reaches its destination name after a verified
            // transfer, so with no size to compare we trust it.
            None => Ok(Some(TransferOutcome::AlreadyComplete)),
        }
    }
}

/// What an on-disk partial means relative to the remote resource
enum PartialState {
    /// A true prefix; resume from its length
    Resumable,
    /// Already the whole resource; promote without fetching
    Complete,
    /// Longer than the resource; discard and restart
    Stale,
}

fn io_error(path: &std::path::Path, source: std::io::Error) -> TransferError {
    TransferError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Compare a file's SHA-256 digest against an expected hex string
async fn verify_checksum(
    path: &std::path::Path,
    expected: &str,
) -> Result<(), TransferError> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| io_error(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await.map_err(|e| io_error(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let actual = format!("{:x}", hasher.finalize());
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(TransferError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}
