//! Error types for the download module.
//!
//! This module defines structured errors for URL resolution and for single
//! downloads, carrying the URL or path each failure refers to.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while validating a raw URL string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UrlParseError {
    /// The string is not a syntactically valid absolute URL.
    #[error("malformed URL {url}: {reason}")]
    Malformed {
        /// The rejected input.
        url: String,
        /// Parser diagnostic.
        reason: String,
    },

    /// The URL parsed, but its scheme is not `http` or `https`.
    #[error("unsupported URL scheme '{scheme}' in {url}")]
    UnsupportedScheme {
        /// The rejected input.
        url: String,
        /// The scheme that was found.
        scheme: String,
    },

    /// The URL has no host component.
    #[error("URL has no host: {url}")]
    MissingHost {
        /// The rejected input.
        url: String,
    },
}

/// Errors that can occur during a single download.
///
/// Every variant is terminal for the worker that raised it and cancels the
/// batch the worker belongs to.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The request URL could not be resolved.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] UrlParseError),

    /// Non-2xx HTTP response.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Network-level error (DNS resolution, connection refused, TLS, broken stream).
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// No response, or no further body data, arrived within the request timeout.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// File system error while creating or writing the temporary file.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A header name or value supplied by the caller is not valid HTTP.
    #[error("invalid request header '{name}'")]
    InvalidHeader {
        /// The offending header name.
        name: String,
    },

    /// Building an HTTP client failed (bad proxy URL, TLS backend init).
    #[error("failed to build HTTP client: {source}")]
    ClientBuild {
        /// The underlying builder error.
        #[source]
        source: reqwest::Error,
    },

    /// The client provider was shut down before the request could start.
    #[error("HTTP client provider has been shut down")]
    ProviderShutDown,
}

impl DownloadError {
    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Classifies a reqwest error raised for `url` as a timeout or network failure.
    pub fn from_reqwest(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout { url: url.into() }
        } else {
            Self::Network {
                url: url.into(),
                source,
            }
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid header error.
    pub fn invalid_header(name: impl Into<String>) -> Self {
        Self::InvalidHeader { name: name.into() }
    }

    /// Creates a client build error.
    pub fn client_build(source: reqwest::Error) -> Self {
        Self::ClientBuild { source }
    }

    /// Returns the HTTP status code for status failures.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

// `From<reqwest::Error>` and `From<std::io::Error>` are not implemented: the
// variants need a URL or path the source errors do not carry.

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_timeout_display() {
        let error = DownloadError::timeout("https://example.com/file.pdf");
        assert!(error.to_string().contains("timeout"));
        assert!(error.to_string().contains("https://example.com/file.pdf"));
    }

    #[test]
    fn test_download_error_http_status_display() {
        let error = DownloadError::http_status("https://example.com/file.pdf", 404);
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected '404' in: {msg}");
        assert!(
            msg.contains("https://example.com/file.pdf"),
            "Expected URL in: {msg}"
        );
        assert_eq!(error.status(), Some(404));
    }

    #[test]
    fn test_download_error_io_display() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let error = DownloadError::io(PathBuf::from("/tmp/test.pdf"), io_error);
        let msg = error.to_string();
        assert!(msg.contains("/tmp/test.pdf"), "Expected path in: {msg}");
        assert_eq!(error.status(), None);
    }

    #[test]
    fn test_download_error_from_url_parse_error() {
        let error: DownloadError = UrlParseError::MissingHost {
            url: "file:///etc".to_string(),
        }
        .into();
        let msg = error.to_string();
        assert!(msg.starts_with("invalid URL"), "got: {msg}");
        assert!(msg.contains("file:///etc"), "got: {msg}");
    }

    #[test]
    fn test_url_parse_error_unsupported_scheme_display() {
        let error = UrlParseError::UnsupportedScheme {
            url: "ftp://example.com/a".to_string(),
            scheme: "ftp".to_string(),
        };
        assert!(error.to_string().contains("'ftp'"));
    }

    #[test]
    fn test_invalid_header_display_names_header() {
        let error = DownloadError::invalid_header("X Bad");
        assert!(error.to_string().contains("X Bad"));
    }
}
