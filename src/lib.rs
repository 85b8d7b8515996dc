//! # axum-part-writer
//!
//! Writes one part (a byte range) of a readable stream to a sink, the way a
//! web server answers an HTTP range request with `206 Partial Content`.
//!
//! The range arrives already parsed as an optional start offset and an
//! optional inclusive end offset, see [`PartRange`]. A [`PartWriter`] pairs
//! the range with a source and its content length and then either:
//!
//! - copies the part to a blocking [`std::io::Write`] with
//!   [`PartWriter::write_to`],
//! - copies it to a tokio [`AsyncWrite`] with [`PartWriter::write_to_async`],
//! - or turns into a [`PartStream`] response body, which also implements
//!   axum's [`IntoResponse`].
//!
//! A sink that goes away mid-transfer (the client aborted the download) is not
//! an error: the copy stops and reports [`CopyOutcome::client_aborted`].
//!
//! ```
//! use axum_part_writer::{PartRange, PartWriter};
//!
//! let content = b"Hello world this is a file to test range requests on!\n";
//! let range = PartRange::new(Some(6), Some(10)).unwrap();
//!
//! let mut sink = Vec::new();
//! let outcome = PartWriter::new(&content[..], content.len() as u64, range)
//!     .with_buffer_size(4)
//!     .write_to(&mut sink)
//!     .unwrap();
//!
//! assert_eq!(b"world", &sink[..]);
//! assert_eq!(5, outcome.bytes_written);
//! ```

mod copy;
mod file;
mod stream;

use std::io;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::TypedHeader;
use axum_extra::headers::{AcceptRanges, ContentLength, ContentRange};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

pub use copy::{copy_part, copy_part_async, CopyOutcome};
pub use file::SizedSource;
pub use stream::PartStream;

/// Chunk size used when none is configured.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Signed end offset meaning "to the end of the content".
pub const UNBOUNDED_END: i64 = -1;

const OCTET_STREAM: &str = "application/octet-stream";

/// Errors returned by the copy operations.
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    /// Reading the source or writing the sink failed for a reason other than
    /// the client going away.
    #[error("i/o error while copying part")]
    Io(#[from] io::Error),

    /// The offsets as the caller passed them.
    #[error("malformed range: start {start:?}, end {end:?}")]
    MalformedRange { start: Option<i128>, end: Option<i128> },
}

/// Marker a transport wraps in an [`io::Error`] to report that the peer
/// stopped reading, when none of the usual connection error kinds fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client aborted the response")]
pub struct ClientAborted;

impl From<ClientAborted> for io::Error {
    fn from(err: ClientAborted) -> io::Error {
        io::Error::other(err)
    }
}

/// Returns true when a sink write failed because the receiving end went away.
pub fn is_client_disconnect(err: &io::Error) -> bool {
    let closed = matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    );

    closed || err.get_ref().is_some_and(|inner| inner.is::<ClientAborted>())
}

pub(crate) fn effective_buffer_size(buffer_size: usize) -> usize {
    if buffer_size > 0 {
        buffer_size
    } else {
        DEFAULT_BUFFER_SIZE
    }
}

/// An inclusive byte interval `[start, end]` over the source.
///
/// A missing start copies from offset 0, a missing end copies to the end of
/// the content. With both missing the whole stream is copied without any
/// range bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartRange {
    start: Option<u64>,
    end: Option<u64>,
}

impl PartRange {
    /// The whole content.
    pub fn full() -> Self {
        PartRange::default()
    }

    /// Construct a range, rejecting `start > end`.
    pub fn new(start: Option<u64>, end: Option<u64>) -> Result<Self, CopyError> {
        if let (Some(first), Some(last)) = (start, end) {
            if first > last {
                return Err(CopyError::MalformedRange {
                    start: start.map(i128::from),
                    end: end.map(i128::from),
                });
            }
        }

        Ok(PartRange { start, end })
    }

    /// Construct a range from signed offsets, where an end of
    /// [`UNBOUNDED_END`] means "to the end of the content".
    ///
    /// Any other negative value is rejected, as is `start > end`.
    pub fn from_signed(start: Option<i64>, end: Option<i64>) -> Result<Self, CopyError> {
        let malformed = || CopyError::MalformedRange {
            start: start.map(i128::from),
            end: end.map(i128::from),
        };

        let first = match start {
            None => None,
            Some(start) => Some(u64::try_from(start).map_err(|_| malformed())?),
        };

        let last = match end {
            None | Some(UNBOUNDED_END) => None,
            Some(end) => Some(u64::try_from(end).map_err(|_| malformed())?),
        };

        PartRange::new(first, last).map_err(|_| malformed())
    }

    pub fn start(&self) -> Option<u64> {
        self.start
    }

    pub fn end(&self) -> Option<u64> {
        self.end
    }

    /// True when neither bound is set.
    pub fn is_full(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// The last offset to copy, inclusive. `None` when the range is open and
    /// the content is empty.
    pub fn effective_end(&self, content_length: u64) -> Option<u64> {
        self.end.or_else(|| content_length.checked_sub(1))
    }

    /// Number of bytes this range asks for. Bytes past the actual end of the
    /// source are counted; the copy just stops early there.
    pub fn len_within(&self, content_length: u64) -> u64 {
        let start = self.start.unwrap_or(0);
        match self.effective_end(content_length) {
            Some(end) if end >= start => (end - start).saturating_add(1),
            _ => 0,
        }
    }
}

/// Settings loaded by the host application, for example from a JSON or TOML
/// config file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartConfig {
    /// Bytes per read/write cycle. `0` selects [`DEFAULT_BUFFER_SIZE`].
    pub buffer_size: usize,
}

impl PartConfig {
    pub fn buffer_size(&self) -> usize {
        effective_buffer_size(self.buffer_size)
    }
}

/// A source with a fixed known content length.
pub trait PartSource: AsyncRead {
    /// The total size of the content.
    ///
    /// This should not change for the lifetime of the object once queried.
    fn content_length(&self) -> u64;

    /// Mime type of the content, if known.
    fn content_type(&self) -> Option<&str> {
        None
    }
}

/// Copies one part of a source to a sink.
///
/// The writer is consumed by the copy, because the source is read once.
#[derive(Debug)]
pub struct PartWriter<S> {
    source: S,
    content_length: u64,
    range: PartRange,
    buffer_size: usize,
}

impl<S> PartWriter<S> {
    pub fn new(source: S, content_length: u64, range: PartRange) -> Self {
        PartWriter { source, content_length, range, buffer_size: 0 }
    }

    /// Sets the number of bytes moved per read/write cycle. Non-positive
    /// values fall back to [`DEFAULT_BUFFER_SIZE`].
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_config(self, config: &PartConfig) -> Self {
        self.with_buffer_size(config.buffer_size)
    }

    /// The buffer size used for the copy (default is 4096).
    pub fn buffer_size(&self) -> usize {
        effective_buffer_size(self.buffer_size)
    }

    pub fn range(&self) -> PartRange {
        self.range
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }
}

impl<S: PartSource> PartWriter<S> {
    /// Construct a writer taking the content length from the source.
    pub fn for_source(source: S, range: PartRange) -> Self {
        let content_length = source.content_length();
        PartWriter::new(source, content_length, range)
    }
}

impl<S: io::Read> PartWriter<S> {
    /// Copies the part to a blocking sink on the calling thread.
    pub fn write_to<W: io::Write + ?Sized>(
        mut self,
        sink: &mut W,
    ) -> Result<CopyOutcome, CopyError> {
        let buffer_size = self.buffer_size();
        copy_part(&mut self.source, sink, self.content_length, self.range, buffer_size)
    }
}

impl<S: AsyncRead + Unpin> PartWriter<S> {
    /// Copies the part to an async sink.
    pub async fn write_to_async<W: AsyncWrite + Unpin + ?Sized>(
        mut self,
        sink: &mut W,
    ) -> Result<CopyOutcome, CopyError> {
        let buffer_size = self.buffer_size();
        copy_part_async(&mut self.source, sink, self.content_length, self.range, buffer_size).await
    }
}

impl<S: AsyncRead> PartWriter<S> {
    /// Turns the writer into a response body yielding the part.
    pub fn into_stream(self) -> PartStream<S> {
        let buffer_size = self.buffer_size();
        PartStream::new(self.source, self.content_length, self.range, buffer_size)
    }
}

impl<S: PartSource + Send + 'static> PartWriter<S> {
    /// Computes status, headers and body for the part. Returns
    /// [`PartNotSatisfiable`] when the range starts at or past the end of the
    /// content.
    pub fn try_respond(self) -> Result<PartResponse<S>, PartNotSatisfiable> {
        let total = self.content_length;
        let content_type = self.source.content_type().map(str::to_owned);
        let buffer_size = self.buffer_size();

        if self.range.is_full() {
            // stop at the advertised length even if the source runs longer
            let stream = PartStream::new(self.source, total, self.range, buffer_size)
                .capped_at(total);
            return Ok(PartResponse::Full {
                content_length: ContentLength(total),
                stream,
                content_type,
            });
        }

        let start = self.range.start().unwrap_or(0);
        if start >= total {
            tracing::debug!(start, total, "range starts past the end of the content");
            return Err(PartNotSatisfiable(ContentRange::unsatisfied_bytes(total)));
        }

        // HTTP ranges are inclusive, ContentRange::bytes takes an exclusive end
        let end_exclusive = match self.range.end() {
            Some(end) => end.saturating_add(1).min(total),
            None => total,
        };

        let content_range = ContentRange::bytes(start..end_exclusive, total)
            .map_err(|_| PartNotSatisfiable(ContentRange::unsatisfied_bytes(total)))?;

        let clamped = PartRange { start: Some(start), end: Some(end_exclusive - 1) };
        let stream = PartStream::new(self.source, total, clamped, buffer_size);

        Ok(PartResponse::Partial {
            content_range,
            content_length: ContentLength(end_exclusive - start),
            stream,
            content_type,
        })
    }
}

impl<S: PartSource + Send + 'static> IntoResponse for PartWriter<S> {
    fn into_response(self) -> Response {
        self.try_respond().into_response()
    }
}

/// Error type indicating that the requested part was not satisfiable. Implements [`IntoResponse`].
#[derive(Debug, Clone)]
pub struct PartNotSatisfiable(pub ContentRange);

impl IntoResponse for PartNotSatisfiable {
    fn into_response(self) -> Response {
        let status = StatusCode::RANGE_NOT_SATISFIABLE;
        let header = TypedHeader(self.0);
        (status, header, ()).into_response()
    }
}

/// Computed headers and body for a part response. Implements [`IntoResponse`].
#[derive(Debug)]
pub enum PartResponse<S> {
    /// No range requested, the whole content.
    Full {
        content_length: ContentLength,
        stream: PartStream<S>,
        content_type: Option<String>,
    },
    /// `206 Partial Content` for a single range.
    Partial {
        content_range: ContentRange,
        content_length: ContentLength,
        stream: PartStream<S>,
        content_type: Option<String>,
    },
}

fn content_type_header(content_type: Option<String>) -> [(header::HeaderName, HeaderValue); 1] {
    let value = content_type
        .and_then(|content_type| HeaderValue::from_str(&content_type).ok())
        .unwrap_or_else(|| HeaderValue::from_static(OCTET_STREAM));
    [(header::CONTENT_TYPE, value)]
}

impl<S: PartSource + Send + 'static> IntoResponse for PartResponse<S> {
    fn into_response(self) -> Response {
        let accept_ranges = TypedHeader(AcceptRanges::bytes());

        match self {
            PartResponse::Full { content_length, stream, content_type } => (
                StatusCode::OK,
                accept_ranges,
                TypedHeader(content_length),
                content_type_header(content_type),
                stream,
            )
                .into_response(),
            PartResponse::Partial { content_range, content_length, stream, content_type } => (
                StatusCode::PARTIAL_CONTENT,
                accept_ranges,
                TypedHeader(content_range),
                TypedHeader(content_length),
                content_type_header(content_type),
                stream,
            )
                .into_response(),
        }
    }
}
