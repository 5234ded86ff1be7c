//! Constants for the download module (pool limits, timeouts, chunking).

use std::time::Duration;

/// Upper bound on concurrently open connections across one provider.
///
/// reqwest has no global connection ceiling, so the batch orchestrator
/// enforces this through its concurrency semaphore.
pub const MAX_CONNECTIONS: usize = 200;

/// Idle keep-alive connections retained per host by the shared clients.
pub const MAX_IDLE_CONNECTIONS_PER_HOST: usize = 50;

/// How long an idle pooled connection is kept before it is closed.
pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

/// Maximum number of redirects followed automatically.
pub const MAX_REDIRECTS: usize = 10;

/// Inactivity timeout (response headers, then each body frame) applied when
/// the caller does not set one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Size of each slice written to the temporary file.
pub const DOWNLOAD_CHUNK_SIZE: usize = 8 * 1024;

/// Text encoding assumed when the response does not declare a charset.
pub const DEFAULT_TEXT_ENCODING: &str = "utf-8";

/// `Accept-Encoding` value injected when the caller sends none.
pub const DEFAULT_ACCEPT_ENCODING: &str = "gzip, deflate, br, zstd";

/// `Connection` value injected when the caller sends none.
pub const DEFAULT_CONNECTION: &str = "keep-alive";

/// File name prefix of every temporary artifact.
pub const TEMP_FILE_PREFIX: &str = "fetchbatch-";

/// Maximum number of characters per text message in text output mode.
pub const TEXT_CHUNK_SIZE: usize = 512;
