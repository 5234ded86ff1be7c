//! Turning completed downloads into outbound messages.
//!
//! [`assemble`] consumes the ordered results of a successful batch, reads each
//! temporary file, hands it to a [`MessageSink`] as either one blob message
//! or a series of text chunks, and deletes the file once it has been read.

mod sinks;

use std::io;
use std::path::PathBuf;

use encoding_rs::{Encoding, UTF_8};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::download::{DownloadResult, TEXT_CHUNK_SIZE};

pub use sinks::{DirectorySink, WriterSink};

/// A message produced from one completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolMessage {
    /// The raw file contents.
    Blob {
        /// File bytes.
        data: Vec<u8>,
        /// MIME type reported by the server.
        mime_type: Option<String>,
        /// Custom or guessed file name.
        file_name: Option<String>,
    },
    /// A piece of decoded text.
    Text(String),
}

/// Destination for assembled messages.
pub trait MessageSink {
    /// Accepts one message.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the message cannot be delivered.
    fn send(&mut self, message: ToolMessage) -> io::Result<()>;
}

impl MessageSink for Vec<ToolMessage> {
    fn send(&mut self, message: ToolMessage) -> io::Result<()> {
        self.push(message);
        Ok(())
    }
}

/// How completed files are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// One blob message per file.
    #[default]
    File,
    /// Decoded text, split into chunks.
    Text,
}

/// Errors raised while assembling messages.
#[derive(Debug, Error)]
pub enum AssembleError {
    /// A downloaded file could not be read.
    #[error("failed to read downloaded file {path}: {source}")]
    Read {
        /// The temporary file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The sink rejected a message.
    #[error("failed to emit message: {source}")]
    Sink {
        /// The sink's error.
        #[source]
        source: io::Error,
    },
}

/// Emits every result in order and deletes its temporary file.
///
/// Each file is deleted right after it is read, whether or not the sink
/// accepts the message. On error the remaining results are dropped, which
/// deletes their files too. Returns the number of messages sent.
///
/// # Errors
///
/// Returns [`AssembleError`] for the first unreadable file or rejected message.
#[instrument(skip(results, sink), fields(results = results.len()))]
pub async fn assemble<S>(
    results: Vec<DownloadResult>,
    mode: OutputMode,
    sink: &mut S,
) -> Result<usize, AssembleError>
where
    S: MessageSink + ?Sized,
{
    let mut sent = 0;
    for result in results {
        let DownloadResult {
            index,
            artifact,
            mime_type,
            file_name,
            text_encoding,
        } = result;

        let read = tokio::fs::read(artifact.path()).await;
        let path = artifact.path().to_path_buf();
        artifact.discard();
        let data = read.map_err(|source| AssembleError::Read { path, source })?;
        debug!(index, bytes = data.len(), "read downloaded file");

        match mode {
            OutputMode::File => {
                sink.send(ToolMessage::Blob {
                    data,
                    mime_type,
                    file_name,
                })
                .map_err(|source| AssembleError::Sink { source })?;
                sent += 1;
            }
            OutputMode::Text => {
                let text = decode_text(&data, text_encoding.as_deref());
                sent += send_text_in_chunks(sink, &text, TEXT_CHUNK_SIZE)
                    .map_err(|source| AssembleError::Sink { source })?;
            }
        }
    }
    Ok(sent)
}

/// Decodes `data` with the named encoding, falling back to UTF-8.
///
/// Malformed sequences are replaced rather than rejected.
#[must_use]
pub fn decode_text(data: &[u8], encoding: Option<&str>) -> String {
    let encoding = encoding
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or(UTF_8);
    let (text, _, had_errors) = encoding.decode(data);
    if had_errors {
        debug!(encoding = encoding.name(), "replaced malformed text sequences");
    }
    text.into_owned()
}

/// Sends `text` as consecutive messages of at most `chunk_size` characters.
///
/// Returns the number of messages sent; empty text sends nothing.
///
/// # Errors
///
/// Returns the sink's error for the first rejected chunk.
pub fn send_text_in_chunks<S>(sink: &mut S, text: &str, chunk_size: usize) -> io::Result<usize>
where
    S: MessageSink + ?Sized,
{
    let chunk_size = chunk_size.max(1);
    let mut sent = 0;
    let mut chars = text.char_indices().peekable();
    while let Some(&(start, _)) = chars.peek() {
        let end = chars
            .nth(chunk_size - 1)
            .map_or(text.len(), |(offset, ch)| offset + ch.len_utf8());
        sink.send(ToolMessage::Text(text[start..end].to_string()))?;
        sent += 1;
    }
    Ok(sent)
}
