//! All-or-nothing batch orchestration.
//!
//! [`BatchDownloader`] runs one worker per request on a `JoinSet`, bounded by
//! a semaphore, and shares one [`CancellationToken`] across the batch. The
//! first failure cancels the token; every artifact the batch produced is then
//! deleted before the call returns, and a single representative error
//! (lowest submission index) is reported.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fetchbatch_core::download::{BatchDownloader, ClientProvider, DownloadRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = Arc::new(ClientProvider::new());
//! let downloader = BatchDownloader::new(provider, 10)?;
//! let results = downloader
//!     .run_batch(vec![
//!         DownloadRequest::new(0, "https://example.com/a.pdf"),
//!         DownloadRequest::new(1, "https://example.com/b.pdf"),
//!     ])
//!     .await?;
//! for result in &results {
//!     println!("{} -> {}", result.index, result.file_path().display());
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::client::ClientProvider;
use super::constants::MAX_CONNECTIONS;
use super::error::DownloadError;
use super::worker::{DownloadOutcome, DownloadRequest, DownloadResult, download_to_temp};

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value; matches the connection ceiling.
const MAX_CONCURRENCY: usize = MAX_CONNECTIONS;

/// Default concurrency if not specified.
pub const DEFAULT_CONCURRENCY: usize = MAX_CONNECTIONS;

/// Error type for batch operations.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// Two requests in one batch share an index.
    #[error("duplicate request index {index} in batch")]
    DuplicateIndex {
        /// The repeated index.
        index: usize,
    },

    /// A download failed; the rest of the batch was cancelled and cleaned up.
    #[error("download {index} failed: {source}")]
    Download {
        /// Index of the failed request.
        index: usize,
        /// The worker's error.
        #[source]
        source: DownloadError,
    },

    /// A worker task panicked; the rest of the batch was cancelled and cleaned up.
    #[error("download task {index} panicked")]
    TaskPanicked {
        /// Index of the request whose task panicked.
        index: usize,
    },

    /// The batch was cancelled by the caller before it finished.
    #[error("batch cancelled")]
    Cancelled,
}

impl BatchError {
    /// Index of the request the error refers to, if any.
    #[must_use]
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Download { index, .. } | Self::TaskPanicked { index } => Some(*index),
            Self::DuplicateIndex { index } => Some(*index),
            Self::InvalidConcurrency { .. } | Self::Cancelled => None,
        }
    }

    /// The underlying download error, if the batch failed on one.
    #[must_use]
    pub fn download_error(&self) -> Option<&DownloadError> {
        match self {
            Self::Download { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Lifecycle of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchState {
    Running,
    Cancelling,
}

/// Bookkeeping for one `run_batch` call.
///
/// Completed results are owned here until the batch either succeeds (they are
/// returned) or fails (they are discarded).
struct BatchProgress {
    state: BatchState,
    completed: Vec<DownloadResult>,
    failures: Vec<(usize, BatchError)>,
    cancelled: usize,
}

impl BatchProgress {
    fn new(capacity: usize) -> Self {
        Self {
            state: BatchState::Running,
            completed: Vec::with_capacity(capacity),
            failures: Vec::new(),
            cancelled: 0,
        }
    }

    fn record_failure(&mut self, index: usize, error: BatchError, cancel: &CancellationToken) {
        if self.state == BatchState::Running {
            self.state = BatchState::Cancelling;
            warn!(index, error = %error, "download failed, cancelling batch");
            cancel.cancel();
        } else {
            debug!(index, error = %error, "additional failure while cancelling");
        }
        self.failures.push((index, error));
    }

    /// Deletes every completed artifact and returns the representative error.
    fn into_failure(self) -> BatchError {
        for result in self.completed {
            debug!(index = result.index, "discarding completed download of failed batch");
            result.artifact.discard();
        }

        let mut failures = self.failures;
        failures.sort_by_key(|(index, _)| *index);
        let mut failures = failures.into_iter();
        let Some((_, representative)) = failures.next() else {
            return BatchError::Cancelled;
        };
        for (index, error) in failures {
            warn!(index, error = %error, "discarding secondary batch failure");
        }
        representative
    }
}

/// Concurrent all-or-nothing downloader.
///
/// # Concurrency Model
///
/// - Each request runs in its own Tokio task on a `JoinSet`
/// - A semaphore permit is acquired before a task starts its download
/// - Permits are released automatically when downloads complete (RAII)
/// - All tasks share one cancellation token per batch; waiting for a permit,
///   waiting for a response and streaming the body all observe it
#[derive(Debug)]
pub struct BatchDownloader {
    provider: Arc<ClientProvider>,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    temp_dir: PathBuf,
}

impl BatchDownloader {
    /// Creates a downloader borrowing clients from `provider`.
    ///
    /// Temporary files go to the platform temp directory unless
    /// [`with_temp_dir`](Self::with_temp_dir) is used.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidConcurrency`] if `concurrency` is outside
    /// `1..=200`.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use fetchbatch_core::download::{BatchDownloader, ClientProvider};
    ///
    /// let downloader = BatchDownloader::new(Arc::new(ClientProvider::new()), 10).unwrap();
    /// assert_eq!(downloader.concurrency(), 10);
    /// ```
    #[instrument(level = "debug", skip(provider))]
    pub fn new(provider: Arc<ClientProvider>, concurrency: usize) -> Result<Self, BatchError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(BatchError::InvalidConcurrency { value: concurrency });
        }

        Ok(Self {
            provider,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            temp_dir: std::env::temp_dir(),
        })
    }

    /// Places temporary files under `temp_dir` instead of the platform default.
    #[must_use]
    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }

    /// Returns the configured concurrency limit.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Directory temporary files are created in.
    #[must_use]
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// The provider clients are borrowed from.
    #[must_use]
    pub fn provider(&self) -> &Arc<ClientProvider> {
        &self.provider
    }

    /// Downloads every request, or none.
    ///
    /// On success the results are ordered by request index and each one owns
    /// a live temporary file.
    ///
    /// # Errors
    ///
    /// - [`BatchError::DuplicateIndex`] before anything is sent
    /// - [`BatchError::Download`] / [`BatchError::TaskPanicked`] for the failed
    ///   request with the lowest index, after every artifact of the batch has
    ///   been deleted
    pub async fn run_batch(
        &self,
        requests: Vec<DownloadRequest>,
    ) -> Result<Vec<DownloadResult>, BatchError> {
        self.run_batch_with_cancel(requests, CancellationToken::new())
            .await
    }

    /// Like [`run_batch`](Self::run_batch), with a caller-held cancellation token.
    ///
    /// Cancelling `cancel` from outside stops the batch, deletes its
    /// artifacts and returns [`BatchError::Cancelled`]. The token must be
    /// fresh: it belongs to this batch only.
    ///
    /// # Errors
    ///
    /// Same as [`run_batch`](Self::run_batch), plus [`BatchError::Cancelled`].
    #[instrument(skip(self, requests, cancel), fields(requests = requests.len(), concurrency = self.concurrency))]
    pub async fn run_batch_with_cancel(
        &self,
        requests: Vec<DownloadRequest>,
        cancel: CancellationToken,
    ) -> Result<Vec<DownloadResult>, BatchError> {
        check_unique_indices(&requests)?;

        info!("starting batch");
        let total = requests.len();
        let mut tasks = JoinSet::new();
        let mut task_indices = HashMap::with_capacity(total);

        for request in requests {
            let index = request.index;
            let provider = Arc::clone(&self.provider);
            let semaphore = Arc::clone(&self.semaphore);
            let temp_dir = self.temp_dir.clone();
            let cancel = cancel.clone();

            let handle = tasks.spawn(async move {
                // Permit is dropped when this block exits (RAII)
                let _permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Ok(DownloadOutcome::Cancelled { index }),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return Ok(DownloadOutcome::Cancelled { index }),
                    },
                };
                download_to_temp(&provider, request, &temp_dir, &cancel).await
            });
            task_indices.insert(handle.id(), index);
        }

        debug!(task_count = total, "waiting for downloads to complete");

        let mut progress = BatchProgress::new(total);
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, Ok(DownloadOutcome::Completed(result)))) => {
                    if progress.state == BatchState::Cancelling {
                        debug!(index = result.index, "download completed after cancellation");
                    }
                    progress.completed.push(result);
                }
                Ok((_, Ok(DownloadOutcome::Cancelled { index }))) => {
                    debug!(index, "download cancelled");
                    progress.cancelled += 1;
                }
                Ok((id, Err(e))) => {
                    let index = task_indices.get(&id).copied().unwrap_or_default();
                    progress.record_failure(index, BatchError::Download { index, source: e }, &cancel);
                }
                Err(join_error) => {
                    let index = task_indices
                        .get(&join_error.id())
                        .copied()
                        .unwrap_or_default();
                    warn!(index, error = %join_error, "download task panicked");
                    progress.record_failure(index, BatchError::TaskPanicked { index }, &cancel);
                }
            }
        }

        if progress.state == BatchState::Cancelling || cancel.is_cancelled() {
            let completed = progress.completed.len();
            let cancelled = progress.cancelled;
            let error = progress.into_failure();
            info!(completed, cancelled, error = %error, "batch cancelled, temporary files removed");
            return Err(error);
        }

        let mut results = progress.completed;
        results.sort_by_key(|result| result.index);
        info!(completed = results.len(), "batch complete");
        Ok(results)
    }
}

fn check_unique_indices(requests: &[DownloadRequest]) -> Result<(), BatchError> {
    let mut seen = HashSet::with_capacity(requests.len());
    for request in requests {
        if !seen.insert(request.index) {
            return Err(BatchError::DuplicateIndex {
                index: request.index,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    fn downloader(temp_dir: &TempDir) -> BatchDownloader {
        BatchDownloader::new(Arc::new(ClientProvider::new()), 4)
            .unwrap()
            .with_temp_dir(temp_dir.path())
    }

    fn dir_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[test]
    fn test_new_valid_concurrency() {
        let provider = Arc::new(ClientProvider::new());
        let batch = BatchDownloader::new(Arc::clone(&provider), 1).unwrap();
        assert_eq!(batch.concurrency(), 1);

        let batch = BatchDownloader::new(Arc::clone(&provider), DEFAULT_CONCURRENCY).unwrap();
        assert_eq!(batch.concurrency(), 200);
        assert_eq!(batch.temp_dir(), std::env::temp_dir());
    }

    #[test]
    fn test_new_invalid_concurrency() {
        let provider = Arc::new(ClientProvider::new());
        assert!(matches!(
            BatchDownloader::new(Arc::clone(&provider), 0),
            Err(BatchError::InvalidConcurrency { value: 0 })
        ));
        assert!(matches!(
            BatchDownloader::new(provider, 201),
            Err(BatchError::InvalidConcurrency { value: 201 })
        ));
    }

    #[test]
    fn test_batch_error_display() {
        let error = BatchError::InvalidConcurrency { value: 0 };
        let msg = error.to_string();
        assert!(msg.contains("invalid concurrency"));
        assert!(msg.contains("200"));

        let error = BatchError::Download {
            index: 2,
            source: DownloadError::http_status("https://example.com/x", 404),
        };
        assert_eq!(error.index(), Some(2));
        assert_eq!(error.download_error().and_then(DownloadError::status), Some(404));
        assert!(error.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_duplicate_index_rejected_before_sending() {
        let temp_dir = TempDir::new().unwrap();
        let result = downloader(&temp_dir)
            .run_batch(vec![
                DownloadRequest::new(0, "https://example.invalid/a"),
                DownloadRequest::new(0, "https://example.invalid/b"),
            ])
            .await;
        assert!(matches!(result, Err(BatchError::DuplicateIndex { index: 0 })));
    }

    #[tokio::test]
    async fn test_empty_batch_returns_empty_results() {
        let temp_dir = TempDir::new().unwrap();
        let results = downloader(&temp_dir).run_batch(Vec::new()).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_results_sorted_by_index_regardless_of_completion_order() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();

        // Lower indices respond later, so completion order is reversed.
        for (name, delay_ms) in [("a", 300), ("b", 150), ("c", 0)] {
            Mock::given(method("GET"))
                .and(path(format!("/{name}.txt")))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_bytes(name.as_bytes().to_vec())
                        .set_delay(Duration::from_millis(delay_ms)),
                )
                .mount(&mock_server)
                .await;
        }

        let requests = ["a", "b", "c"]
            .iter()
            .enumerate()
            .map(|(i, name)| DownloadRequest::new(i, format!("{}/{name}.txt", mock_server.uri())))
            .rev()
            .collect();
        let results = downloader(&temp_dir).run_batch(requests).await.unwrap();

        let indices: Vec<usize> = results.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        let bodies: Vec<Vec<u8>> = results
            .iter()
            .map(|r| std::fs::read(r.file_path()).unwrap())
            .collect();
        assert_eq!(bodies, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn test_failure_removes_completed_and_in_flight_files() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .and(path("/fast.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fast".to_vec()))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing.txt"))
            .respond_with(ResponseTemplate::new(404).set_delay(Duration::from_millis(200)))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/slow.txt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"slow".to_vec())
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&mock_server)
            .await;

        let requests = vec![
            DownloadRequest::new(0, format!("{}/fast.txt", mock_server.uri())),
            DownloadRequest::new(1, format!("{}/missing.txt", mock_server.uri())),
            DownloadRequest::new(2, format!("{}/slow.txt", mock_server.uri()))
                .with_timeout(Duration::from_secs(30)),
        ];
        let started = std::time::Instant::now();
        let result = downloader(&temp_dir).run_batch(requests).await;

        match result {
            Err(BatchError::Download { index: 1, source }) => {
                assert_eq!(source.status(), Some(404));
            }
            other => panic!("expected download failure for index 1, got: {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(4), "slow download was not cancelled");
        assert!(dir_is_empty(temp_dir.path()));
    }

    #[tokio::test]
    async fn test_lowest_index_failure_is_reported() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .and(path("/late-error"))
            .respond_with(ResponseTemplate::new(500).set_delay(Duration::from_millis(100)))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/early-error"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&mock_server)
            .await;

        // Index 3 fails first; index 1 is already in flight and fails too.
        let requests = vec![
            DownloadRequest::new(3, format!("{}/early-error", mock_server.uri())),
            DownloadRequest::new(1, format!("{}/late-error", mock_server.uri())),
        ];
        let result = downloader(&temp_dir).run_batch(requests).await;

        let error = result.unwrap_err();
        // Index 1 may observe cancellation before its response arrives; either
        // way the reported failure is the lowest-indexed one that failed.
        match error {
            BatchError::Download { index: 1, ref source } => {
                assert_eq!(source.status(), Some(500));
            }
            BatchError::Download { index: 3, ref source } => {
                assert_eq!(source.status(), Some(403));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_external_cancel_cleans_up_and_reports_cancelled() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .and(path("/quick"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"done".to_vec()))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/stalled"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"never".to_vec())
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&mock_server)
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let requests = vec![
            DownloadRequest::new(0, format!("{}/quick", mock_server.uri())),
            DownloadRequest::new(1, format!("{}/stalled", mock_server.uri()))
                .with_timeout(Duration::from_secs(30)),
        ];
        let result = downloader(&temp_dir)
            .run_batch_with_cancel(requests, cancel)
            .await;

        assert!(matches!(result, Err(BatchError::Cancelled)), "got: {result:?}");
        assert!(dir_is_empty(temp_dir.path()));
    }

    #[tokio::test]
    async fn test_concurrency_one_still_completes_batch() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
            .mount(&mock_server)
            .await;

        let batch = BatchDownloader::new(Arc::new(ClientProvider::new()), 1)
            .unwrap()
            .with_temp_dir(temp_dir.path());
        let requests = (0..5)
            .map(|i| DownloadRequest::new(i, format!("{}/item/{i}", mock_server.uri())))
            .collect();
        let results = batch.run_batch(requests).await.unwrap();

        assert_eq!(results.len(), 5);
        assert!(results.iter().enumerate().all(|(i, r)| r.index == i));
        assert!(results.iter().all(|r| r.file_path().exists()));
    }
}
