use std::io::{self, Read, Write};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::{effective_buffer_size, is_client_disconnect, CopyError, PartRange};

/// What a finished copy did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyOutcome {
    /// Bytes handed to the sink.
    pub bytes_written: u64,
    /// The sink went away before the part was complete.
    pub client_aborted: bool,
}

/// Copies the bytes selected by `range` from `source` to `sink` in chunks of
/// at most `buffer_size` bytes.
///
/// The source is read sequentially: bytes before the range start are read and
/// discarded. An open end resolves to `content_length`, which is trusted and
/// not checked against the stream. A source that ends early is not an error.
///
/// A sink that fails with a client disconnect (see
/// [`is_client_disconnect`](crate::is_client_disconnect)) stops the copy and
/// is reported through [`CopyOutcome::client_aborted`]. Neither stream is
/// flushed or closed.
pub fn copy_part<R, W>(
    source: &mut R,
    sink: &mut W,
    content_length: u64,
    range: PartRange,
    buffer_size: usize,
) -> Result<CopyOutcome, CopyError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buffer = vec![0; effective_buffer_size(buffer_size)];
    let mut outcome = CopyOutcome::default();

    if range.is_full() {
        debug!(content_length, buffer_size = buffer.len(), "copying full content");
        loop {
            let n = read_chunk(source, &mut buffer)?;
            if n == 0 || !write_chunk(sink, &buffer[..n], &mut outcome)? {
                break;
            }
        }
        return Ok(outcome);
    }

    let start = range.start().unwrap_or(0);
    let mut remaining = range.len_within(content_length);
    debug!(start, remaining, content_length, buffer_size = buffer.len(), "copying part");

    if start > 0 {
        let skipped = io::copy(&mut Read::take(&mut *source, start), &mut io::sink())?;
        if skipped < start {
            debug!(start, skipped, "source ended before range start");
        }
    }

    while remaining > 0 {
        let want = buffer.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = read_chunk(source, &mut buffer[..want])?;
        if n == 0 {
            debug!(remaining, "source ended before range end");
            break;
        }
        if !write_chunk(sink, &buffer[..n], &mut outcome)? {
            break;
        }
        remaining -= n as u64;
    }

    Ok(outcome)
}

fn read_chunk<R: Read + ?Sized>(source: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    loop {
        match source.read(buffer) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

/// Writes the whole chunk, counting every byte the sink accepts. Returns
/// `Ok(false)` when the client went away.
fn write_chunk<W: Write + ?Sized>(
    sink: &mut W,
    mut chunk: &[u8],
    outcome: &mut CopyOutcome,
) -> io::Result<bool> {
    while !chunk.is_empty() {
        match sink.write(chunk) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                outcome.bytes_written += n as u64;
                chunk = &chunk[n..];
                trace!(len = n, "wrote chunk");
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_client_disconnect(&e) => {
                debug!(bytes_written = outcome.bytes_written, error = %e, "client aborted, stopping copy");
                outcome.client_aborted = true;
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(true)
}

/// Async counterpart of [`copy_part`] with the same semantics.
pub async fn copy_part_async<R, W>(
    source: &mut R,
    sink: &mut W,
    content_length: u64,
    range: PartRange,
    buffer_size: usize,
) -> Result<CopyOutcome, CopyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0; effective_buffer_size(buffer_size)];
    let mut outcome = CopyOutcome::default();

    if range.is_full() {
        debug!(content_length, buffer_size = buffer.len(), "copying full content");
        loop {
            let n = read_chunk_async(source, &mut buffer).await?;
            if n == 0 || !write_chunk_async(sink, &buffer[..n], &mut outcome).await? {
                break;
            }
        }
        return Ok(outcome);
    }

    let start = range.start().unwrap_or(0);
    let mut remaining = range.len_within(content_length);
    debug!(start, remaining, content_length, buffer_size = buffer.len(), "copying part");

    if start > 0 {
        let mut skip = AsyncReadExt::take(&mut *source, start);
        let skipped = tokio::io::copy(&mut skip, &mut tokio::io::sink()).await?;
        if skipped < start {
            debug!(start, skipped, "source ended before range start");
        }
    }

    while remaining > 0 {
        let want = buffer.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = read_chunk_async(source, &mut buffer[..want]).await?;
        if n == 0 {
            debug!(remaining, "source ended before range end");
            break;
        }
        if !write_chunk_async(sink, &buffer[..n], &mut outcome).await? {
            break;
        }
        remaining -= n as u64;
    }

    Ok(outcome)
}

async fn read_chunk_async<R: AsyncRead + Unpin + ?Sized>(
    source: &mut R,
    buffer: &mut [u8],
) -> io::Result<usize> {
    loop {
        match source.read(buffer).await {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

async fn write_chunk_async<W: AsyncWrite + Unpin + ?Sized>(
    sink: &mut W,
    mut chunk: &[u8],
    outcome: &mut CopyOutcome,
) -> io::Result<bool> {
    while !chunk.is_empty() {
        match sink.write(chunk).await {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                outcome.bytes_written += n as u64;
                chunk = &chunk[n..];
                trace!(len = n, "wrote chunk");
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_client_disconnect(&e) => {
                debug!(bytes_written = outcome.bytes_written, error = %e, "client aborted, stopping copy");
                outcome.client_aborted = true;
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::io::{self, Read, Write};
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use assert_matches::assert_matches;
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    use super::*;
    use crate::ClientAborted;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn range(start: Option<u64>, end: Option<u64>) -> PartRange {
        PartRange::new(start, end).unwrap()
    }

    /// Records every write call; fails with `error` once `fail_after` chunks
    /// have been accepted.
    #[derive(Default)]
    struct Recorder {
        chunks: Vec<Vec<u8>>,
        fail_after: Option<(usize, fn() -> io::Error)>,
    }

    impl Recorder {
        fn failing_after(chunks: usize, error: fn() -> io::Error) -> Self {
            Recorder { chunks: Vec::new(), fail_after: Some((chunks, error)) }
        }

        fn bytes(&self) -> Vec<u8> {
            self.chunks.concat()
        }
    }

    impl Write for Recorder {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some((limit, error)) = self.fail_after {
                if self.chunks.len() >= limit {
                    return Err(error());
                }
            }
            self.chunks.push(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl AsyncWrite for Recorder {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Write::write(self.get_mut(), buf))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Hands out one byte per read, interrupting every other call.
    struct Trickle<'a> {
        data: &'a [u8],
        interrupt: bool,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.interrupt = !self.interrupt;
            if self.interrupt {
                return Err(io::ErrorKind::Interrupted.into());
            }
            let data = self.data;
            match (data.split_first(), buf.first_mut()) {
                (Some((byte, rest)), Some(slot)) => {
                    *slot = *byte;
                    self.data = rest;
                    Ok(1)
                }
                _ => Ok(0),
            }
        }
    }

    // no interruptions here, tokio's copy does not retry them
    impl AsyncRead for Trickle<'_> {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            let data = this.data;
            if let Some((byte, rest)) = data.split_first() {
                if buf.remaining() > 0 {
                    buf.put_slice(&[*byte]);
                    this.data = rest;
                }
            }
            Poll::Ready(Ok(()))
        }
    }

    struct Failing(io::ErrorKind);

    impl Read for Failing {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(self.0.into())
        }
    }

    impl AsyncRead for Failing {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(self.0.into()))
        }
    }

    /// Accepts half of the first write, then reports a broken pipe.
    #[derive(Default)]
    struct HalfThenBroken {
        accepted: Vec<u8>,
    }

    impl Write for HalfThenBroken {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if !self.accepted.is_empty() {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            let half = buf.len().div_ceil(2);
            self.accepted.extend_from_slice(&buf[..half]);
            Ok(half)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl AsyncWrite for HalfThenBroken {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Write::write(self.get_mut(), buf))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn copy(
        data: &[u8],
        content_length: u64,
        range: PartRange,
        buffer_size: usize,
    ) -> (Recorder, CopyOutcome) {
        let mut sink = Recorder::default();
        let outcome = copy_part(&mut &data[..], &mut sink, content_length, range, buffer_size).unwrap();
        (sink, outcome)
    }

    #[test]
    fn test_full_copy_in_chunks() {
        let data = content(100);
        let (sink, outcome) = copy(&data, 100, PartRange::full(), 10);

        assert_eq!(10, sink.chunks.len());
        assert!(sink.chunks.iter().all(|chunk| chunk.len() == 10));
        assert_eq!(data, sink.bytes());
        assert_eq!(CopyOutcome { bytes_written: 100, client_aborted: false }, outcome);
    }

    #[test]
    fn test_bounded_range() {
        let data = content(100);
        let (sink, outcome) = copy(&data, 100, range(Some(10), Some(19)), 4096);

        assert_eq!(&data[10..=19], &sink.bytes()[..]);
        assert_eq!(10, outcome.bytes_written);
    }

    #[test]
    fn test_open_ended_range() {
        let data = content(100);
        let open = PartRange::from_signed(Some(50), Some(-1)).unwrap();
        let (sink, _) = copy(&data, 100, open, 16);

        assert_eq!(&data[50..], &sink.bytes()[..]);
        assert!(sink.chunks.iter().all(|chunk| chunk.len() <= 16));
    }

    #[test]
    fn test_single_byte_range() {
        let data = content(100);
        let (sink, _) = copy(&data, 100, range(Some(0), Some(0)), 16);

        assert_eq!(vec![data[0]], sink.bytes());
    }

    #[test]
    fn test_end_beyond_content() {
        let data = content(10);
        let (sink, outcome) = copy(&data, 10, range(Some(5), Some(100)), 4);

        assert_eq!(&data[5..], &sink.bytes()[..]);
        assert!(!outcome.client_aborted);
    }

    #[test]
    fn test_end_without_start() {
        let data = content(100);
        let (sink, _) = copy(&data, 100, range(None, Some(24)), 7);

        assert_eq!(&data[..=24], &sink.bytes()[..]);
    }

    #[test]
    fn test_start_beyond_content() {
        let data = content(10);
        let (sink, outcome) = copy(&data, 10, range(Some(20), None), 4);

        assert!(sink.chunks.is_empty());
        assert_eq!(0, outcome.bytes_written);
    }

    #[test]
    fn test_buffer_size_does_not_change_output() {
        let data = content(100);
        for (start, end) in [(None, None), (Some(3), Some(71)), (Some(40), None), (Some(99), Some(99))] {
            let expected = copy(&data, 100, range(start, end), 4096).0.bytes();
            for buffer_size in [1, 7, 100, 1000] {
                let (sink, _) = copy(&data, 100, range(start, end), buffer_size);
                assert_eq!(expected, sink.bytes(), "buffer size {buffer_size}, range {start:?}-{end:?}");
                assert!(sink.chunks.iter().all(|chunk| chunk.len() <= buffer_size));
            }
        }
    }

    #[test]
    fn test_zero_buffer_size_uses_default() {
        let data = content(10_000);
        let (sink, _) = copy(&data, 10_000, PartRange::full(), 0);

        assert_eq!(DEFAULT_CHUNKS.to_vec(), sink.chunks.iter().map(Vec::len).collect::<Vec<_>>());
    }

    const DEFAULT_CHUNKS: [usize; 3] = [4096, 4096, 1808];

    #[test]
    fn test_short_source() {
        let data = content(30);
        let (sink, outcome) = copy(&data, 100, range(Some(10), Some(59)), 8);

        assert_eq!(&data[10..], &sink.bytes()[..]);
        assert_eq!(20, outcome.bytes_written);
    }

    #[test]
    fn test_skip_is_forced_over_short_reads() {
        let data = content(50);
        let mut source = Trickle { data: &data, interrupt: false };
        let mut sink = Recorder::default();

        copy_part(&mut source, &mut sink, 50, range(Some(20), Some(29)), 4).unwrap();

        assert_eq!(&data[20..=29], &sink.bytes()[..]);
    }

    #[test]
    fn test_client_disconnect_is_not_an_error() {
        let data = content(100);
        let mut sink = Recorder::failing_after(3, || io::ErrorKind::BrokenPipe.into());

        let outcome = copy_part(&mut &data[..], &mut sink, 100, PartRange::full(), 10).unwrap();

        assert_eq!(CopyOutcome { bytes_written: 30, client_aborted: true }, outcome);
        assert_eq!(&data[..30], &sink.bytes()[..]);
    }

    #[test]
    fn test_transport_abort_marker_is_not_an_error() {
        let data = content(100);
        let mut sink = Recorder::failing_after(1, || ClientAborted.into());

        let outcome = copy_part(&mut &data[..], &mut sink, 100, range(Some(10), None), 16).unwrap();

        assert!(outcome.client_aborted);
        assert_eq!(&data[10..26], &sink.bytes()[..]);
    }

    #[test]
    fn test_other_sink_errors_propagate() {
        let data = content(100);
        let mut sink = Recorder::failing_after(2, || io::ErrorKind::PermissionDenied.into());

        let err = copy_part(&mut &data[..], &mut sink, 100, range(Some(0), Some(50)), 10).unwrap_err();

        assert_matches!(err, CopyError::Io(e) if e.kind() == io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_source_errors_propagate() {
        // a broken pipe on the read side is a real failure
        let mut sink = Recorder::default();
        let mut source = Failing(io::ErrorKind::BrokenPipe);
        let err = copy_part(&mut source, &mut sink, 10, PartRange::full(), 4).unwrap_err();
        assert_matches!(err, CopyError::Io(e) if e.kind() == io::ErrorKind::BrokenPipe);

        let mut source = Failing(io::ErrorKind::Other);
        let err = copy_part(&mut source, &mut sink, 10, range(Some(2), None), 4).unwrap_err();
        assert_matches!(err, CopyError::Io(_));
    }

    #[test]
    fn test_partial_write_before_disconnect_is_counted() {
        let data = content(100);
        let mut sink = HalfThenBroken::default();

        let outcome = copy_part(&mut &data[..], &mut sink, 100, range(Some(10), Some(29)), 10).unwrap();

        assert_eq!(CopyOutcome { bytes_written: 5, client_aborted: true }, outcome);
        assert_eq!(&data[10..15], &sink.accepted[..]);
    }

    #[test]
    fn test_range_is_not_mutated_by_copy() {
        let data = content(100);
        let open = range(Some(90), None);

        let mut first = Vec::new();
        crate::PartWriter::new(&data[..], 100, open).write_to(&mut first).unwrap();
        let mut second = Vec::new();
        crate::PartWriter::new(&data[..], 100, open).write_to(&mut second).unwrap();

        assert_eq!(first, second);
        assert_eq!(None, open.end());
    }

    #[tokio::test]
    async fn test_async_scenarios() {
        let data = content(100);
        let cases = [
            (PartRange::full(), 10, &data[..]),
            (range(Some(10), Some(19)), 4096, &data[10..=19]),
            (range(Some(50), None), 16, &data[50..]),
            (range(Some(0), Some(0)), 16, &data[..1]),
        ];

        for (part, buffer_size, expected) in cases {
            let mut sink = Recorder::default();
            copy_part_async(&mut &data[..], &mut sink, 100, part, buffer_size).await.unwrap();
            assert_eq!(expected, &sink.bytes()[..]);
            assert!(sink.chunks.iter().all(|chunk| chunk.len() <= buffer_size));
        }

        let short = content(10);
        let mut sink = Recorder::default();
        copy_part_async(&mut &short[..], &mut sink, 10, range(Some(5), Some(100)), 4).await.unwrap();
        assert_eq!(&short[5..], &sink.bytes()[..]);
    }

    #[tokio::test]
    async fn test_async_client_disconnect() {
        let data = content(100);
        let mut sink = Recorder::failing_after(2, || io::ErrorKind::ConnectionReset.into());

        let outcome = copy_part_async(&mut &data[..], &mut sink, 100, range(Some(5), Some(94)), 8)
            .await
            .unwrap();

        assert_eq!(CopyOutcome { bytes_written: 16, client_aborted: true }, outcome);
        assert_eq!(&data[5..21], &sink.bytes()[..]);

        let mut sink = Recorder::failing_after(0, || io::ErrorKind::OutOfMemory.into());
        let err = copy_part_async(&mut &data[..], &mut sink, 100, PartRange::full(), 8).await.unwrap_err();
        assert_matches!(err, CopyError::Io(_));
    }

    #[tokio::test]
    async fn test_async_partial_write_before_disconnect_is_counted() {
        let data = content(100);
        let mut sink = HalfThenBroken::default();

        let outcome = copy_part_async(&mut &data[..], &mut sink, 100, PartRange::full(), 10)
            .await
            .unwrap();

        assert_eq!(CopyOutcome { bytes_written: 5, client_aborted: true }, outcome);
        assert_eq!(&data[..5], &sink.accepted[..]);
    }

    #[tokio::test]
    async fn test_async_skip_is_forced_over_short_reads() {
        let data = content(50);
        let mut source = Trickle { data: &data, interrupt: false };
        let mut sink = Recorder::default();

        copy_part_async(&mut source, &mut sink, 50, range(Some(20), Some(29)), 4).await.unwrap();

        assert_eq!(&data[20..=29], &sink.bytes()[..]);
    }

    #[tokio::test]
    async fn test_async_source_errors_propagate() {
        let mut sink = Recorder::default();

        let mut source = Failing(io::ErrorKind::BrokenPipe);
        let err = copy_part_async(&mut source, &mut sink, 10, PartRange::full(), 4).await.unwrap_err();
        assert_matches!(err, CopyError::Io(e) if e.kind() == io::ErrorKind::BrokenPipe);

        let mut source = Failing(io::ErrorKind::Other);
        let err = copy_part_async(&mut source, &mut sink, 10, range(Some(2), None), 4)
            .await
            .unwrap_err();
        assert_matches!(err, CopyError::Io(_));
        assert!(sink.chunks.is_empty());
    }
}
