use std::fmt;
use std::fs::File;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::coordinator::run_chunks;
use crate::io::{ReadAt, SectionReader};
use crate::plan::TransferSpec;
use crate::progress::{ProgressAggregator, ProgressSink, wrap_stream};
use crate::size::local_source_size;
use crate::store::{AccessConditions, CommitResponse, ObjectAttributes, ObjectStore};
use crate::{DEFAULT_BLOCK_SIZE, DEFAULT_PARALLELISM, Error, Result};

/// Largest object the store accepts in a single upload request.
pub const MAX_UPLOAD_BLOB_BYTES: u64 = 256 * 1024 * 1024;
/// Largest single staged block.
pub const MAX_STAGE_BLOCK_BYTES: u64 = 4000 * 1024 * 1024;
/// Largest number of blocks one committed object may have.
pub const MAX_BLOCKS: u64 = 50_000;
/// Auto-selected block sizes are never smaller than this.
pub const MIN_AUTO_BLOCK_BYTES: u64 = DEFAULT_BLOCK_SIZE;

/// Opaque identifier of one staged block: 16 random bytes, base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(String);

impl BlockId {
    pub fn random() -> Self {
        let id = uuid::Uuid::new_v4();
        Self(base64::engine::general_purpose::STANDARD.encode(id.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UploadMode {
    SingleShot,
    Staged { block_size: u64, block_count: u64 },
}

/// Chooses between one whole-object request and stage-then-commit.
///
/// `block_size == 0` selects a block size automatically. Sources no larger
/// than `single_shot_max` always go out in one request.
pub fn select_upload_mode(source_size: u64, block_size: u64, single_shot_max: u64) -> Result<UploadMode> {
    let max_total = MAX_STAGE_BLOCK_BYTES * MAX_BLOCKS;
    if source_size > max_total {
        return Err(Error::SizeExceeded {
            size: source_size,
            max: max_total,
        });
    }
    if block_size > MAX_STAGE_BLOCK_BYTES {
        return Err(Error::InvalidConfig {
            message: format!("block_size must be <= {MAX_STAGE_BLOCK_BYTES}, got {block_size}"),
        });
    }
    if source_size <= single_shot_max {
        return Ok(UploadMode::SingleShot);
    }

    let block_size = if block_size == 0 {
        source_size.div_ceil(MAX_BLOCKS).max(MIN_AUTO_BLOCK_BYTES)
    } else {
        block_size
    };
    let block_count = source_size.div_ceil(block_size);
    if block_count > MAX_BLOCKS {
        return Err(Error::SizeExceeded {
            size: source_size,
            max: block_size * MAX_BLOCKS,
        });
    }
    Ok(UploadMode::Staged {
        block_size,
        block_count,
    })
}

pub struct UploadOptions<'a> {
    /// Staged block size; 0 selects one from the source size.
    pub block_size: u64,
    pub parallelism: usize,
    pub single_shot_max_bytes: u64,
    pub attributes: ObjectAttributes,
    pub access: AccessConditions,
    pub progress: Option<&'a dyn ProgressSink>,
    pub cancel: Option<&'a CancellationToken>,
}

impl Default for UploadOptions<'_> {
    fn default() -> Self {
        Self {
            block_size: 0,
            parallelism: DEFAULT_PARALLELISM,
            single_shot_max_bytes: MAX_UPLOAD_BLOB_BYTES,
            attributes: ObjectAttributes::default(),
            access: AccessConditions::default(),
            progress: None,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResult {
    pub mode: UploadMode,
    pub bytes_uploaded: u64,
    pub blocks_staged: u64,
    /// `None` when the source was empty and nothing was sent.
    pub response: Option<CommitResponse>,
}

pub async fn upload_file<S: ObjectStore + ?Sized>(
    store: &S,
    key: &str,
    file: &File,
    options: UploadOptions<'_>,
) -> Result<UploadResult> {
    let size = local_source_size(file)?;
    upload_reader_at(store, key, file, size, options).await
}

pub async fn upload_buffer<S: ObjectStore + ?Sized>(
    store: &S,
    key: &str,
    data: &[u8],
    options: UploadOptions<'_>,
) -> Result<UploadResult> {
    upload_reader_at(store, key, data, data.len() as u64, options).await
}

/// Uploads `size` bytes of `source` to `key`.
///
/// Staged uploads commit only after every block is staged. If any block
/// fails, no commit is issued and the staged blocks are left for the store
/// to discard.
pub async fn upload_reader_at<S: ObjectStore + ?Sized, R: ReadAt + ?Sized>(
    store: &S,
    key: &str,
    source: &R,
    size: u64,
    options: UploadOptions<'_>,
) -> Result<UploadResult> {
    if options.single_shot_max_bytes > MAX_UPLOAD_BLOB_BYTES {
        return Err(Error::InvalidConfig {
            message: format!(
                "single_shot_max_bytes must be <= {MAX_UPLOAD_BLOB_BYTES}, got {}",
                options.single_shot_max_bytes
            ),
        });
    }

    let mode = select_upload_mode(size, options.block_size, options.single_shot_max_bytes)?;
    debug!(
        event = "upload.mode",
        provider = store.provider(),
        key,
        size,
        mode = ?mode,
        "upload.mode"
    );

    if size == 0 {
        return Ok(UploadResult {
            mode,
            bytes_uploaded: 0,
            blocks_staged: 0,
            response: None,
        });
    }

    let aggregator = options.progress.map(ProgressAggregator::new);

    match mode {
        UploadMode::SingleShot => {
            let body = wrap_stream(SectionReader::new(source, 0, size), aggregator.as_ref());
            let response = store
                .upload(key, body, size, &options.attributes, &options.access)
                .await?;
            debug!(event = "upload.finish", key, size, etag = %response.etag, "upload.finish");
            Ok(UploadResult {
                mode,
                bytes_uploaded: size,
                blocks_staged: 0,
                response: Some(response),
            })
        }
        UploadMode::Staged {
            block_size,
            block_count,
        } => {
            let spec = TransferSpec::new(size, block_size, options.parallelism, 0)?;
            let access = &options.access;
            let aggregator = aggregator.as_ref();

            let block_ids = run_chunks(
                "upload.stage",
                spec.chunks()?,
                spec.parallelism,
                options.cancel,
                |chunk, token| async move {
                    let block_id = BlockId::random();
                    let body =
                        wrap_stream(SectionReader::new(source, chunk.offset, chunk.len), aggregator);
                    tokio::select! {
                        res = store.stage_block(key, &block_id, body, chunk.len, access) => res?,
                        _ = token.cancelled() => return Err(Error::Cancelled),
                    }
                    Ok(block_id)
                },
            )
            .await?;

            debug!(
                event = "upload.commit",
                key,
                blocks = block_count,
                "upload.commit"
            );
            let response = store
                .commit_block_list(key, &block_ids, &options.attributes, access)
                .await
                .map_err(|e| Error::Commit {
                    source: Box::new(e),
                })?;
            debug!(event = "upload.finish", key, size, etag = %response.etag, "upload.finish");

            Ok(UploadResult {
                mode,
                bytes_uploaded: size,
                blocks_staged: block_ids.len() as u64,
                response: Some(response),
            })
        }
    }
}
