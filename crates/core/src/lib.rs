pub mod config;
mod coordinator;
mod download;
mod error;
mod io;
mod plan;
mod progress;
pub mod run_log;
mod size;
mod store;
mod upload;

pub const APP_NAME: &str = "blockxfer";

/// Range/block size used when the caller does not pick one.
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;
pub const DEFAULT_PARALLELISM: usize = 5;

pub use coordinator::run_chunks;
pub use download::{
    DownloadOptions, DownloadRange, DownloadResult, download_to_file, download_to_writer_at,
};
pub use error::{Error, Result};
pub use io::{ReadAt, SectionReader, WriteAt};
pub use plan::{Chunk, TransferSpec, plan_chunks};
pub use progress::{ChunkProgress, ProgressAggregator, ProgressReader, ProgressSink};
pub use size::{local_source_size, resolve_download_size};
pub use store::{
    AccessConditions, ByteStream, CommitResponse, DirObjectStore, InMemoryObjectStore,
    ObjectAttributes, ObjectProperties, ObjectStore, StoreFuture,
};
pub use upload::{
    BlockId, MAX_BLOCKS, MAX_STAGE_BLOCK_BYTES, MAX_UPLOAD_BLOB_BYTES, MIN_AUTO_BLOCK_BYTES,
    UploadMode, UploadOptions, UploadResult, select_upload_mode, upload_buffer, upload_file,
    upload_reader_at,
};
