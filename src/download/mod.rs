//! Concurrent, all-or-nothing downloads into temporary files.
//!
//! A batch is a list of [`DownloadRequest`]s handed to a [`BatchDownloader`].
//! Each request is streamed into its own [`TempArtifact`]; the batch either
//! returns every result in request order or fails with the first error, in
//! which case no temporary file from the batch remains on disk.
//!
//! HTTP clients come from a shared [`ClientProvider`]: requests without a
//! proxy reuse one of two long-lived clients (TLS verification on or off),
//! while proxied requests get a dedicated client that is closed when its
//! [`ClientLease`] is dropped.

mod artifact;
mod batch;
mod client;
pub mod constants;
mod error;
mod metadata;
mod worker;

pub use artifact::{TempArtifact, remove_temp_file};
pub use batch::{BatchDownloader, BatchError, DEFAULT_CONCURRENCY};
pub use client::{ClientConfig, ClientLease, ClientProvider};
pub use constants::{DEFAULT_REQUEST_TIMEOUT, MAX_CONNECTIONS, TEXT_CHUNK_SIZE};
pub use error::{DownloadError, UrlParseError};
pub use metadata::{guess_file_name, mime_type, resolve_url, text_encoding};
pub use worker::{
    DownloadOutcome, DownloadRequest, DownloadResult, download_to_temp, patch_request_headers,
};
