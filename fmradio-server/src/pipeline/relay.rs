//! Bounded buffer between the encoder output and a slow client.
//!
//! With a zero-byte budget every chunk is written and flushed as soon as it
//! is read. With a positive budget a reader and a writer run side by side:
//! the reader keeps draining the encoder while the writer is stalled, but it
//! reserves budget before each read, so at most `capacity` bytes are ever
//! held in memory.

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

/// Largest read issued while buffering.
pub const READ_SEGMENT: usize = 16 * 1024;

/// Buffered mode flushes the sink after this many written bytes.
pub const FLUSH_INTERVAL: usize = 32 * 1024;

/// Read size in pass-through mode.
const COPY_CHUNK: usize = 64 * 1024;

/// Upper bound for the byte budget.
pub const MAX_BUFFER_BYTES: usize = 8 * 1024 * 1024;

/// Byte budget for `buffer_seconds` of audio at `bitrate_kbps`.
pub fn buffer_capacity(buffer_seconds: f64, bitrate_kbps: u32) -> usize {
    if !(buffer_seconds > 0.0) {
        return 0;
    }
    let bytes = buffer_seconds * f64::from(bitrate_kbps) * 1000.0 / 8.0;
    bytes.clamp(0.0, MAX_BUFFER_BYTES as f64) as usize
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("reading encoder output failed: {0}")]
    Source(#[source] io::Error),

    #[error("writing to client failed: {0}")]
    Sink(#[source] io::Error),
}

impl RelayError {
    /// The client went away; not a pipeline failure.
    pub fn is_disconnect(&self) -> bool {
        match self {
            RelayError::Sink(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::WriteZero
            ),
            RelayError::Source(_) => false,
        }
    }
}

/// Why the relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The source reached end of stream and everything was delivered.
    SourceClosed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Highest number of bytes read but not yet written.
    pub peak_buffered: usize,
}

/// Copy `source` into `sink` until end of stream, cancellation or error.
pub async fn relay<R, W>(
    source: &mut R,
    sink: &mut W,
    capacity: usize,
    cancel: &CancellationToken,
) -> Result<(RelayEnd, RelayStats), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if capacity == 0 {
        pass_through(source, sink, cancel).await
    } else {
        buffered(source, sink, capacity, cancel).await
    }
}

async fn pass_through<R, W>(
    source: &mut R,
    sink: &mut W,
    cancel: &CancellationToken,
) -> Result<(RelayEnd, RelayStats), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stats = RelayStats::default();
    let mut buf = vec![0u8; COPY_CHUNK];

    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok((RelayEnd::Cancelled, stats)),
            read = source.read(&mut buf) => read.map_err(RelayError::Source)?,
        };
        if n == 0 {
            return Ok((RelayEnd::SourceClosed, stats));
        }
        stats.bytes_in += n as u64;

        let write = async {
            sink.write_all(&buf[..n]).await?;
            sink.flush().await
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok((RelayEnd::Cancelled, stats)),
            written = write => written.map_err(RelayError::Sink)?,
        }
        stats.bytes_out += n as u64;
    }
}

async fn buffered<R, W>(
    source: &mut R,
    sink: &mut W,
    capacity: usize,
    cancel: &CancellationToken,
) -> Result<(RelayEnd, RelayStats), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let budget = Semaphore::new(capacity);
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let held = AtomicUsize::new(0);
    let peak = AtomicUsize::new(0);
    let bytes_in = AtomicU64::new(0);
    let bytes_out = AtomicU64::new(0);
    let segment = READ_SEGMENT.min(capacity);

    let (budget, held, peak) = (&budget, &held, &peak);
    let (bytes_in, bytes_out) = (&bytes_in, &bytes_out);

    let producer = async move {
        // Dropped on return, which lets the writer drain and stop.
        let tx = tx;
        let mut buf = vec![0u8; segment];
        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok::<_, RelayError>(RelayEnd::Cancelled),
                permit = budget.acquire_many(segment as u32) => match permit {
                    Ok(permit) => permit,
                    // Closed only once the writer has given up.
                    Err(_) => return Ok(RelayEnd::Cancelled),
                },
            };
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(RelayEnd::Cancelled),
                read = source.read(&mut buf) => read.map_err(RelayError::Source)?,
            };
            if n == 0 {
                return Ok(RelayEnd::SourceClosed);
            }
            // Keep exactly `n` bytes of budget reserved until the writer is done with them.
            permit.forget();
            budget.add_permits(segment - n);

            let now_held = held.fetch_add(n, Ordering::SeqCst) + n;
            peak.fetch_max(now_held, Ordering::SeqCst);
            bytes_in.fetch_add(n as u64, Ordering::Relaxed);
            if tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                return Ok(RelayEnd::Cancelled);
            }
        }
    };

    let consumer = async move {
        let mut unflushed = 0usize;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                chunk = rx.recv() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let written = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                written = sink.write_all(&chunk) => written,
            };
            if let Err(e) = written {
                budget.close();
                return Err(RelayError::Sink(e));
            }
            held.fetch_sub(chunk.len(), Ordering::SeqCst);
            budget.add_permits(chunk.len());
            bytes_out.fetch_add(chunk.len() as u64, Ordering::Relaxed);

            unflushed += chunk.len();
            if unflushed >= FLUSH_INTERVAL {
                unflushed = 0;
                if let Err(e) = sink.flush().await {
                    budget.close();
                    return Err(RelayError::Sink(e));
                }
            }
        }
        sink.flush().await.map_err(RelayError::Sink)
    };

    let (end, ()) = tokio::try_join!(producer, consumer)?;
    let end = if cancel.is_cancelled() { RelayEnd::Cancelled } else { end };
    Ok((
        end,
        RelayStats {
            bytes_in: bytes_in.load(Ordering::Relaxed),
            bytes_out: bytes_out.load(Ordering::Relaxed),
            peak_buffered: peak.load(Ordering::SeqCst),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    /// Sink accepting at most `per_write` bytes per call, yielding in between.
    struct SlowSink {
        data: Vec<u8>,
        per_write: usize,
        fail_after: Option<usize>,
    }

    impl SlowSink {
        fn new(per_write: usize) -> Self {
            Self { data: Vec::new(), per_write, fail_after: None }
        }
    }

    impl AsyncWrite for SlowSink {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if let Some(limit) = self.fail_after {
                if self.data.len() >= limit {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
            }
            let n = buf.len().min(self.per_write);
            self.data.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_buffer_capacity() {
        assert_eq!(buffer_capacity(0.0, 192), 0);
        assert_eq!(buffer_capacity(-1.0, 192), 0);
        assert_eq!(buffer_capacity(2.0, 192), 48_000);
        assert_eq!(buffer_capacity(60.0, 2_000), MAX_BUFFER_BYTES);
    }

    #[tokio::test]
    async fn test_pass_through_preserves_bytes() {
        let input = pattern(200_000);
        let mut source = &input[..];
        let mut sink = SlowSink::new(usize::MAX);
        let cancel = CancellationToken::new();

        let (end, stats) = relay(&mut source, &mut sink, 0, &cancel).await.unwrap();
        assert_eq!(end, RelayEnd::SourceClosed);
        assert_eq!(sink.data, input);
        assert_eq!(stats.bytes_out, input.len() as u64);
        assert_eq!(stats.peak_buffered, 0);
    }

    #[tokio::test]
    async fn test_buffered_respects_capacity() {
        let input = pattern(300_000);
        let mut source = &input[..];
        let mut sink = SlowSink::new(1_000);
        let cancel = CancellationToken::new();
        let capacity = 40_000;

        let (end, stats) = relay(&mut source, &mut sink, capacity, &cancel).await.unwrap();
        assert_eq!(end, RelayEnd::SourceClosed);
        assert_eq!(sink.data, input);
        assert!(stats.peak_buffered <= capacity);
        assert!(stats.peak_buffered > 0);
        assert_eq!(stats.bytes_in, stats.bytes_out);
    }

    #[tokio::test]
    async fn test_buffered_tiny_capacity() {
        let input = pattern(10_000);
        let mut source = &input[..];
        let mut sink = SlowSink::new(7);
        let cancel = CancellationToken::new();

        let (_, stats) = relay(&mut source, &mut sink, 100, &cancel).await.unwrap();
        assert_eq!(sink.data, input);
        assert!(stats.peak_buffered <= 100);
    }

    #[tokio::test]
    async fn test_sink_failure_is_disconnect() {
        let input = pattern(500_000);
        let mut source = &input[..];
        let mut sink = SlowSink::new(4_096);
        sink.fail_after = Some(50_000);
        let cancel = CancellationToken::new();

        let err = relay(&mut source, &mut sink, 64_000, &cancel).await.unwrap_err();
        assert!(matches!(err, RelayError::Sink(_)));
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_relay() {
        // A source that never produces anything.
        let (_writer, mut source) = tokio::io::duplex(1024);
        let mut sink = SlowSink::new(usize::MAX);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        for capacity in [0, 32_000] {
            let (end, _) = relay(&mut source, &mut sink, capacity, &cancel).await.unwrap();
            assert_eq!(end, RelayEnd::Cancelled);
        }
    }
}
