use std::io;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

use crate::store::ByteStream;

/// Receives the cumulative number of bytes transferred by one call.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, bytes_transferred: u64);
}

impl<F> ProgressSink for F
where
    F: Fn(u64) + Send + Sync,
{
    fn on_progress(&self, bytes_transferred: u64) {
        self(bytes_transferred)
    }
}

/// Folds per-chunk progress into one monotonic total.
///
/// The user sink is invoked while the counter lock is held, so two
/// invocations never overlap even when chunks report from different tasks.
pub struct ProgressAggregator<'a> {
    total: Mutex<u64>,
    sink: &'a dyn ProgressSink,
}

impl<'a> ProgressAggregator<'a> {
    pub fn new(sink: &'a dyn ProgressSink) -> Self {
        Self {
            total: Mutex::new(0),
            sink,
        }
    }

    /// A reporter for one chunk; it remembers the last cumulative value it saw.
    pub fn chunk(&self) -> ChunkProgress<'_> {
        ChunkProgress {
            aggregator: self,
            last: 0,
        }
    }

    pub fn total(&self) -> u64 {
        *self.total.lock().expect("progress mutex poisoned")
    }

    fn add(&self, delta: u64) {
        let mut total = self.total.lock().expect("progress mutex poisoned");
        *total += delta;
        self.sink.on_progress(*total);
    }
}

pub struct ChunkProgress<'a> {
    aggregator: &'a ProgressAggregator<'a>,
    last: u64,
}

impl ChunkProgress<'_> {
    /// `cumulative` counts bytes seen so far within this chunk only.
    pub fn report(&mut self, cumulative: u64) {
        if cumulative <= self.last {
            return;
        }
        let delta = cumulative - self.last;
        self.last = cumulative;
        self.aggregator.add(delta);
    }
}

/// Stream adapter that reports every successful read into a [`ChunkProgress`].
pub struct ProgressReader<'a, R> {
    inner: R,
    progress: ChunkProgress<'a>,
    read: u64,
}

impl<'a, R> ProgressReader<'a, R> {
    pub fn new(inner: R, progress: ChunkProgress<'a>) -> Self {
        Self {
            inner,
            progress,
            read: 0,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<'_, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = (buf.filled().len() - before) as u64;
                if n > 0 {
                    this.read += n;
                    this.progress.report(this.read);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Boxes `inner` as a store body, reporting into a fresh chunk reporter when
/// progress is configured.
pub(crate) fn wrap_stream<'a, R>(
    inner: R,
    aggregator: Option<&'a ProgressAggregator<'a>>,
) -> ByteStream<'a>
where
    R: AsyncRead + Send + Unpin + 'a,
{
    match aggregator {
        Some(agg) => Box::pin(ProgressReader::new(inner, agg.chunk())),
        None => Box::pin(inner),
    }
}
