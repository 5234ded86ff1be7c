//! Single streaming download into a temporary file.
//!
//! [`download_to_temp`] performs one request, streams the body into a fresh
//! [`TempArtifact`] and observes the batch's cancellation token while it does
//! so. Observing cancellation is not an error: the worker removes whatever it
//! wrote and reports [`DownloadOutcome::Cancelled`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Method;
use reqwest::header::{ACCEPT_ENCODING, CONNECTION, HeaderMap, HeaderName, HeaderValue};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::artifact::TempArtifact;
use super::client::{ClientConfig, ClientProvider};
use super::constants::{
    DEFAULT_ACCEPT_ENCODING, DEFAULT_CONNECTION, DEFAULT_REQUEST_TIMEOUT, DOWNLOAD_CHUNK_SIZE,
};
use super::error::DownloadError;
use super::metadata::{guess_file_name, mime_type, resolve_url, text_encoding};

/// One entry of a batch.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use fetchbatch_core::download::DownloadRequest;
///
/// let request = DownloadRequest::new(0, "https://example.com/report.csv")
///     .with_header("Authorization", "Bearer token")
///     .unwrap()
///     .with_timeout(Duration::from_secs(30));
/// assert_eq!(request.index, 0);
/// ```
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Position in the submitted batch; results are ordered by it.
    pub index: usize,
    /// HTTP method.
    pub method: Method,
    /// Target URL, validated when the download starts.
    pub url: String,
    /// Caller headers; names are case-insensitive and unique.
    pub headers: HeaderMap,
    /// Optional request body.
    pub body: Option<Vec<u8>>,
    /// Longest wait for the response headers and for each body frame after
    /// them. A slow but steady transfer may take longer than this in total.
    pub timeout: Duration,
    /// Proxy to route this request through.
    pub proxy_url: Option<String>,
    /// Whether server TLS certificates are verified.
    pub verify_tls: bool,
    /// File name reported instead of the one guessed from the response.
    pub custom_file_name: Option<String>,
}

impl DownloadRequest {
    /// A `GET` request with default options.
    #[must_use]
    pub fn new(index: usize, url: impl Into<String>) -> Self {
        Self {
            index,
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            proxy_url: None,
            verify_tls: true,
            custom_file_name: None,
        }
    }

    /// Sets the HTTP method.
    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Sets a header, replacing any previous value under the same name.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidHeader`] if the name or value is not valid HTTP.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, DownloadError> {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|_| DownloadError::invalid_header(name))?;
        let header_value =
            HeaderValue::from_str(value).map_err(|_| DownloadError::invalid_header(name))?;
        self.headers.insert(header_name, header_value);
        Ok(self)
    }

    /// Sets the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sets the inactivity timeout (see [`DownloadRequest::timeout`]).
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Routes the request through `proxy_url` on a dedicated client.
    #[must_use]
    pub fn with_proxy(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy_url = Some(proxy_url.into());
        self
    }

    /// Enables or disables TLS certificate verification.
    #[must_use]
    pub fn with_verify_tls(mut self, verify_tls: bool) -> Self {
        self.verify_tls = verify_tls;
        self
    }

    /// Overrides the reported file name.
    #[must_use]
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.custom_file_name = Some(file_name.into());
        self
    }

    /// Client selection for this request.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            proxy_url: self.proxy_url.clone(),
            verify_tls: self.verify_tls,
        }
    }
}

/// A completed download.
#[derive(Debug)]
pub struct DownloadResult {
    /// Index of the originating request.
    pub index: usize,
    /// Temporary file holding the body.
    pub artifact: TempArtifact,
    /// MIME type from `Content-Type`, without parameters.
    pub mime_type: Option<String>,
    /// Custom or guessed file name.
    pub file_name: Option<String>,
    /// Declared charset, or the UTF-8 default.
    pub text_encoding: Option<String>,
}

impl DownloadResult {
    /// Location of the downloaded body.
    #[must_use]
    pub fn file_path(&self) -> &Path {
        self.artifact.path()
    }
}

/// What a worker reports back to the orchestrator.
#[derive(Debug)]
pub enum DownloadOutcome {
    /// The body was fully written to a temporary file.
    Completed(DownloadResult),
    /// The worker saw the batch's cancellation and stopped without a file.
    Cancelled {
        /// Index of the originating request.
        index: usize,
    },
}

impl DownloadOutcome {
    /// Index of the originating request.
    #[must_use]
    pub fn index(&self) -> usize {
        match self {
            Self::Completed(result) => result.index,
            Self::Cancelled { index } => *index,
        }
    }

    /// Whether the worker stopped because of cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Adds default `Accept-Encoding` and `Connection` headers when the caller
/// sent none (or an empty value). Caller values are left untouched.
#[must_use]
pub fn patch_request_headers(mut headers: HeaderMap) -> HeaderMap {
    if header_is_blank(&headers, &ACCEPT_ENCODING) {
        headers.insert(
            ACCEPT_ENCODING,
            HeaderValue::from_static(DEFAULT_ACCEPT_ENCODING),
        );
    }
    if header_is_blank(&headers, &CONNECTION) {
        headers.insert(CONNECTION, HeaderValue::from_static(DEFAULT_CONNECTION));
    }
    headers
}

fn header_is_blank(headers: &HeaderMap, name: &HeaderName) -> bool {
    headers.get(name).is_none_or(|value| value.is_empty())
}

enum StreamStatus {
    Finished(u64),
    Cancelled,
}

/// Downloads one request into a new temporary file under `temp_dir`.
///
/// Cancellation is checked while waiting for the response, before the file
/// is created, while waiting for each body frame and before writing each
/// chunk. Any partial file is deleted before this function returns
/// `Cancelled` or an error.
///
/// # Errors
///
/// - [`DownloadError::InvalidUrl`] for a malformed URL
/// - [`DownloadError::HttpStatus`] for a non-2xx response
/// - [`DownloadError::Network`] for transport failures, including a body cut short
/// - [`DownloadError::Timeout`] when the headers or the next body frame take
///   longer than the request's timeout
/// - [`DownloadError::Io`] when the temporary file cannot be created or written
/// - [`DownloadError::ClientBuild`] / [`DownloadError::ProviderShutDown`] from the provider
#[instrument(skip(provider, request, temp_dir, cancel), fields(index = request.index, url = %request.url))]
pub async fn download_to_temp(
    provider: &ClientProvider,
    request: DownloadRequest,
    temp_dir: &Path,
    cancel: &CancellationToken,
) -> Result<DownloadOutcome, DownloadError> {
    let index = request.index;
    let parsed_url = resolve_url(&request.url)?;

    // Dropping the lease closes a proxy-scoped client on every return below.
    let lease = provider.acquire(&request.client_config()).await?;
    debug!(must_close = lease.must_close(), "acquired HTTP client");

    let DownloadRequest {
        method,
        url,
        headers,
        body,
        timeout,
        custom_file_name,
        ..
    } = request;

    let mut builder = lease
        .client()
        .request(method, parsed_url.clone())
        .headers(patch_request_headers(headers));
    if let Some(body) = body {
        builder = builder.body(body);
    }

    let response = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            debug!("cancelled before response");
            return Ok(DownloadOutcome::Cancelled { index });
        }
        sent = tokio::time::timeout(timeout, builder.send()) => match sent {
            Ok(sent) => sent.map_err(|e| DownloadError::from_reqwest(&url, e))?,
            Err(_) => return Err(DownloadError::timeout(url)),
        },
    };

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::http_status(url, status.as_u16()));
    }

    if cancel.is_cancelled() {
        debug!("cancelled before opening temporary file");
        return Ok(DownloadOutcome::Cancelled { index });
    }

    let file_name = custom_file_name.or_else(|| guess_file_name(&parsed_url, response.headers()));
    let mime_type = mime_type(response.headers());
    let text_encoding = text_encoding(response.headers());
    debug!(?file_name, ?mime_type, %text_encoding, "resolved response metadata");

    let (artifact, file) = create_artifact(temp_dir).await?;

    match stream_to_file(file, response, &url, artifact.path(), timeout, cancel).await {
        Ok(StreamStatus::Finished(bytes)) => {
            debug!(path = %artifact.path().display(), bytes, "download complete");
            Ok(DownloadOutcome::Completed(DownloadResult {
                index,
                artifact,
                mime_type,
                file_name,
                text_encoding: Some(text_encoding),
            }))
        }
        Ok(StreamStatus::Cancelled) => {
            debug!("cancelled mid-stream");
            artifact.discard();
            Ok(DownloadOutcome::Cancelled { index })
        }
        Err(e) => {
            debug!(path = %artifact.path().display(), "cleaning up partial file after error");
            artifact.discard();
            Err(e)
        }
    }
}

async fn create_artifact(temp_dir: &Path) -> Result<(TempArtifact, File), DownloadError> {
    let dir: PathBuf = temp_dir.to_path_buf();
    let created = tokio::task::spawn_blocking(move || TempArtifact::create_in(&dir))
        .await
        .map_err(|e| DownloadError::io(temp_dir, std::io::Error::other(e)))?;
    let (artifact, file) = created.map_err(|e| DownloadError::io(temp_dir, e))?;
    Ok((artifact, File::from_std(file)))
}

/// Streams the response body to `file` in fixed-size chunks.
///
/// Waiting longer than `read_timeout` for the next body frame is a
/// [`DownloadError::Timeout`]. Takes ownership of the file so the handle is closed before the caller
/// deletes a partial file.
async fn stream_to_file(
    file: File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
    read_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<StreamStatus, DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(StreamStatus::Cancelled),
            next = tokio::time::timeout(read_timeout, stream.next()) => {
                next.map_err(|_| DownloadError::timeout(url))?
            }
        };
        let Some(chunk_result) = next else {
            break;
        };
        let chunk = chunk_result.map_err(|e| DownloadError::from_reqwest(url, e))?;

        for piece in chunk.chunks(DOWNLOAD_CHUNK_SIZE) {
            if cancel.is_cancelled() {
                return Ok(StreamStatus::Cancelled);
            }
            writer
                .write_all(piece)
                .await
                .map_err(|e| DownloadError::io(file_path, e))?;
            bytes_written += piece.len() as u64;
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;

    Ok(StreamStatus::Finished(bytes_written))
}
