use std::fs::File;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::coordinator::run_chunks;
use crate::io::WriteAt;
use crate::plan::TransferSpec;
use crate::progress::{ProgressAggregator, ProgressSink, wrap_stream};
use crate::size::resolve_download_size;
use crate::store::{AccessConditions, ObjectStore};
use crate::{DEFAULT_BLOCK_SIZE, DEFAULT_PARALLELISM, Error, Result};

const COPY_BUFFER_BYTES: usize = 64 * 1024;

/// `[offset, offset + count)` of the remote object; `count` of `None` or
/// `Some(0)` reads to the end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRange {
    pub offset: u64,
    pub count: Option<u64>,
}

impl DownloadRange {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn new(offset: u64, count: Option<u64>) -> Self {
        Self { offset, count }
    }
}

pub struct DownloadOptions<'a> {
    /// Range size per request; 0 selects [`DEFAULT_BLOCK_SIZE`].
    pub block_size: u64,
    pub parallelism: usize,
    /// Content length the caller already knows, saving a metadata query.
    pub known_length: Option<u64>,
    pub access: AccessConditions,
    pub progress: Option<&'a dyn ProgressSink>,
    pub cancel: Option<&'a CancellationToken>,
}

impl Default for DownloadOptions<'_> {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            parallelism: DEFAULT_PARALLELISM,
            known_length: None,
            access: AccessConditions::default(),
            progress: None,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadResult {
    pub bytes_downloaded: u64,
    pub chunks: u64,
}

/// Downloads a range of `key` into `sink`, placing byte `offset + i` of the
/// object at position `i` of the sink.
pub async fn download_to_writer_at<S: ObjectStore + ?Sized, W: WriteAt + ?Sized>(
    store: &S,
    key: &str,
    range: DownloadRange,
    sink: &W,
    options: DownloadOptions<'_>,
) -> Result<DownloadResult> {
    let size = resolve_download_size(
        store,
        key,
        range.offset,
        range.count,
        options.known_length,
        &options.access,
    )
    .await?;
    if size == 0 {
        debug!(event = "download.empty", key, offset = range.offset, "download.empty");
        return Ok(DownloadResult::default());
    }
    check_range_end(range.offset, size)?;

    let block_size = if options.block_size == 0 {
        DEFAULT_BLOCK_SIZE
    } else {
        options.block_size
    };
    let spec = TransferSpec::new(size, block_size, options.parallelism, range.offset)?;
    debug!(
        event = "transfer.plan",
        provider = store.provider(),
        key,
        offset = spec.offset,
        size,
        block_size,
        chunks = spec.chunk_count(),
        parallelism = spec.parallelism,
        "transfer.plan"
    );

    let aggregator = options.progress.map(ProgressAggregator::new);
    let aggregator = aggregator.as_ref();
    let access = &options.access;
    let base = spec.offset;

    let written = run_chunks(
        "download",
        spec.chunks()?,
        spec.parallelism,
        options.cancel,
        |chunk, token| async move {
            let stream = store
                .download_range(key, base + chunk.offset, chunk.len, access)
                .await?;
            // Bytes past the chunk are neither written nor counted as progress.
            let mut body = wrap_stream(stream.take(chunk.len), aggregator);

            let mut buf = vec![0u8; COPY_BUFFER_BYTES.min(chunk.len as usize)];
            let mut written = 0u64;
            while written < chunk.len {
                let n = tokio::select! {
                    n = body.read(&mut buf) => n?,
                    _ = token.cancelled() => return Err(Error::Cancelled),
                };
                if n == 0 {
                    break;
                }
                sink.write_all_at(chunk.offset + written, &buf[..n])?;
                written += n as u64;
            }
            drop(body);

            if written != chunk.len {
                return Err(Error::ShortRead {
                    expected: chunk.len,
                    actual: written,
                });
            }
            Ok(written)
        },
    )
    .await?;

    Ok(DownloadResult {
        bytes_downloaded: written.iter().sum(),
        chunks: written.len() as u64,
    })
}

/// Downloads into `file`, first resizing it to exactly the size of the range.
///
/// Resizing drops stale trailing bytes from an earlier, larger file and
/// leaves a correctly sized file even when the range is empty.
pub async fn download_to_file<S: ObjectStore + ?Sized>(
    store: &S,
    key: &str,
    range: DownloadRange,
    file: &File,
    options: DownloadOptions<'_>,
) -> Result<DownloadResult> {
    let size = resolve_download_size(
        store,
        key,
        range.offset,
        range.count,
        options.known_length,
        &options.access,
    )
    .await?;
    check_range_end(range.offset, size)?;

    let current = file.metadata()?.len();
    if current != size {
        debug!(
            event = "download.resize",
            key,
            from = current,
            to = size,
            "download.resize"
        );
        file.set_len(size)?;
    }

    if size == 0 {
        return Ok(DownloadResult::default());
    }

    download_to_writer_at(
        store,
        key,
        DownloadRange::new(range.offset, Some(size)),
        file,
        options,
    )
    .await
}

fn check_range_end(offset: u64, size: u64) -> Result<()> {
    match offset.checked_add(size) {
        Some(_) => Ok(()),
        None => Err(Error::InvalidConfig {
            message: format!("range offset={offset} count={size} runs past u64::MAX"),
        }),
    }
}
