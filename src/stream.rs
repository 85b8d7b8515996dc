use std::io;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::Stream;
use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use tokio::io::{AsyncRead, ReadBuf};

use crate::PartRange;

/// Response body stream for one part. Implements [`Stream`], [`Body`], and [`IntoResponse`].
///
/// Bytes before the range start are read and discarded, the rest is yielded
/// in chunks of at most the configured buffer size. A source that ends early
/// simply ends the stream.
#[pin_project]
#[derive(Debug)]
pub struct PartStream<B> {
    state: StreamState,
    buffer_size: usize,
    /// `None` when the whole source is streamed.
    length: Option<u64>,
    #[pin]
    body: B,
}

#[derive(Debug)]
enum StreamState {
    Skip { scratch: BytesMut, remaining: u64 },
    Reading { buffer: BytesMut, remaining: Option<u64> },
    Done,
}

impl<B: AsyncRead> PartStream<B> {
    pub(crate) fn new(body: B, content_length: u64, range: PartRange, buffer_size: usize) -> Self {
        let length = if range.is_full() { None } else { Some(range.len_within(content_length)) };
        let skip = range.start().unwrap_or(0);

        let state = if skip > 0 {
            StreamState::Skip { scratch: BytesMut::with_capacity(buffer_size), remaining: skip }
        } else {
            StreamState::Reading { buffer: BytesMut::with_capacity(buffer_size), remaining: length }
        };

        PartStream { state, buffer_size, length, body }
    }

    /// Ends the stream after `length` bytes of a full-content stream.
    pub(crate) fn capped_at(mut self, length: u64) -> Self {
        self.length = Some(length);
        if let StreamState::Reading { remaining, .. } = &mut self.state {
            *remaining = Some(length);
        }
        self
    }
}

impl<B: AsyncRead + Send + 'static> IntoResponse for PartStream<B> {
    fn into_response(self) -> Response {
        Response::new(axum::body::Body::new(self))
    }
}

impl<B: AsyncRead> Body for PartStream<B> {
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        match self.length {
            Some(length) => SizeHint::with_exact(length),
            None => SizeHint::default(),
        }
    }

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>)
        -> Poll<Option<io::Result<Frame<Bytes>>>>
    {
        self.poll_next(cx).map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl<B: AsyncRead> Stream for PartStream<B> {
    type Item = io::Result<Bytes>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>
    ) -> Poll<Option<io::Result<Bytes>>> {
        let mut this = self.project();

        loop {
            match this.state {
                StreamState::Skip { scratch, remaining } => {
                    if *remaining == 0 {
                        let buffer = BytesMut::with_capacity(*this.buffer_size);
                        *this.state = StreamState::Reading { buffer, remaining: *this.length };
                        continue;
                    }

                    // the scratch buffer is never filled, its spare capacity
                    // is reused for every discarded read
                    let uninit = scratch.spare_capacity_mut();
                    let nbytes = uninit.len()
                        .min(*this.buffer_size)
                        .min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                    let mut read_buf = ReadBuf::uninit(&mut uninit[..nbytes]);

                    match this.body.as_mut().poll_read(cx, &mut read_buf) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Some(Err(e))),
                        Poll::Ready(Ok(())) => match read_buf.filled().len() {
                            0 => {
                                tracing::debug!(remaining = *remaining, "source ended before range start");
                                *this.state = StreamState::Done;
                            }
                            n => *remaining -= n as u64,
                        },
                    }
                }

                StreamState::Reading { buffer, remaining } => {
                    if *remaining == Some(0) {
                        *this.state = StreamState::Done;
                        continue;
                    }

                    let uninit = buffer.spare_capacity_mut();

                    // the smaller of the buffer size and the bytes left in the range
                    let nbytes = uninit.len()
                        .min(*this.buffer_size)
                        .min(remaining.map_or(usize::MAX, |r| {
                            usize::try_from(r).unwrap_or(usize::MAX)
                        }));

                    let mut read_buf = ReadBuf::uninit(&mut uninit[..nbytes]);

                    match this.body.as_mut().poll_read(cx, &mut read_buf) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Some(Err(e))),
                        Poll::Ready(Ok(())) => match read_buf.filled().len() {
                            0 => {
                                if remaining.is_some() {
                                    tracing::debug!(?remaining, "source ended before range end");
                                }
                                *this.state = StreamState::Done;
                            }
                            n => {
                                // SAFETY: poll_read has filled the buffer with `n`
                                // additional bytes. `buffer.len` is always 0 here,
                                // a chunk is taken out after every read
                                unsafe { buffer.set_len(buffer.len() + n); }

                                let chunk = mem::replace(buffer, BytesMut::with_capacity(*this.buffer_size));

                                // cannot underflow, nbytes was capped at remaining
                                if let Some(remaining) = remaining {
                                    *remaining -= n as u64;
                                }

                                return Poll::Ready(Some(Ok(chunk.freeze())));
                            }
                        },
                    }
                }

                StreamState::Done => return Poll::Ready(None),
            }
        }
    }
}
