//! fetchbatch core library
//!
//! Downloads a batch of URLs concurrently into temporary files, treating the
//! batch as one all-or-nothing unit: either every file is delivered in
//! request order, or the batch fails and every temporary file it created is
//! deleted.
//!
//! # Architecture
//!
//! - [`download`] - shared HTTP clients, the per-URL worker and the batch orchestrator
//! - [`assembler`] - turns completed downloads into blob or text messages

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod assembler;
pub mod download;
mod user_agent;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use assembler::{MessageSink, OutputMode, ToolMessage, assemble};
pub use download::{
    BatchDownloader, BatchError, ClientProvider, DEFAULT_CONCURRENCY, DownloadError,
    DownloadOutcome, DownloadRequest, DownloadResult, TempArtifact,
};
