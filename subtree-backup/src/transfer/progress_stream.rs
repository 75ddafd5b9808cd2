//! Progress-tracking stream wrapper for archive uploads.

use super::progress::{bytes_per_second, format_bytes, format_speed};
use crate::remote::ByteReader;
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};
use tokio_util::io::{ReaderStream, StreamReader};

/// Callback for progress updates
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Stream wrapper that tracks bytes transferred and calls a progress callback
pub struct ProgressStream<S> {
    inner: S,
    bytes_transferred: u64,
    last_update: Instant,
    update_interval: Duration,
    callback: ProgressCallback,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    /// Create a new progress stream
    pub fn new(inner: S, callback: ProgressCallback) -> Self {
        Self {
            inner,
            bytes_transferred: 0,
            last_update: Instant::now(),
            update_interval: Duration::from_millis(250),
            callback,
        }
    }

    /// Override how often intermediate updates fire
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// Get total bytes transferred
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let inner = Pin::new(&mut self.inner);

        match inner.poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.bytes_transferred += bytes.len() as u64;

                let now = Instant::now();
                if now.duration_since(self.last_update) >= self.update_interval {
                    (self.callback)(self.bytes_transferred);
                    self.last_update = now;
                }

                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => {
                // Final update on completion
                (self.callback)(self.bytes_transferred);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Wrap an upload body so its throughput is logged every few seconds.
///
/// Read errors from `body` pass through unchanged.
pub fn track_upload(body: ByteReader, label: String) -> ByteReader {
    let started = Instant::now();

    let callback: ProgressCallback = Arc::new(move |bytes| {
        tracing::debug!(
            "{}: {} sent ({})",
            label,
            format_bytes(bytes),
            format_speed(bytes_per_second(bytes, started.elapsed()))
        );
    });

    let stream = ProgressStream::new(ReaderStream::new(body), callback).with_interval(Duration::from_secs(5));
    Box::pin(StreamReader::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_final_callback_reports_total() {
        let seen = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&seen);
        let chunks = futures_util::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ]);

        let mut stream = ProgressStream::new(chunks, Arc::new(move |n| sink.store(n, Ordering::SeqCst)));
        while stream.next().await.is_some() {}

        assert_eq!(stream.bytes_transferred(), 11);
        assert_eq!(seen.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_track_upload_passes_bytes_through() {
        let body: ByteReader = Box::pin(std::io::Cursor::new(vec![7u8; 100_000]));
        let mut reader = track_upload(body, "test".into());

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, vec![7u8; 100_000]);
    }

    #[tokio::test]
    async fn test_track_upload_keeps_read_errors() {
        let failing = tokio_util::io::StreamReader::new(futures_util::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("producer failed")),
        ]));
        let mut reader = track_upload(Box::pin(failing), "test".into());

        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).await.is_err());
    }
}
