pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid chunk size: {chunk_size} (must be > 0)")]
    Planning { chunk_size: u64 },

    #[error("remote query failed: {message}")]
    RemoteQuery { message: String },

    #[error("remote store error: {message}")]
    Remote { message: String },

    #[error("source size {size} exceeds the maximum of {max} bytes for a staged upload")]
    SizeExceeded { size: u64, max: u64 },

    #[error("chunk {ordinal} (offset={offset} len={len}) failed: {source}")]
    ChunkTransfer {
        ordinal: u64,
        offset: u64,
        len: u64,
        #[source]
        source: Box<Error>,
    },

    #[error("commit failed: {source}")]
    Commit {
        #[source]
        source: Box<Error>,
    },

    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: u64, actual: u64 },

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Returns the innermost cause, looking through chunk and commit wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::ChunkTransfer { source, .. } | Error::Commit { source } => source.root_cause(),
            other => other,
        }
    }
}
