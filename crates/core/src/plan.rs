use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A contiguous byte range handled by exactly one worker.
///
/// `offset` is relative to the start of the transfer, not to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub ordinal: u64,
    pub offset: u64,
    pub len: u64,
}

impl Chunk {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Resolved shape of one transfer call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSpec {
    pub total_size: u64,
    pub chunk_size: u64,
    pub parallelism: usize,
    /// Position of the transfer inside the remote object.
    pub offset: u64,
}

impl TransferSpec {
    pub fn new(total_size: u64, chunk_size: u64, parallelism: usize, offset: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::Planning { chunk_size });
        }
        Ok(Self {
            total_size,
            chunk_size,
            parallelism: parallelism.max(1),
            offset,
        })
    }

    pub fn chunks(&self) -> Result<Vec<Chunk>> {
        plan_chunks(self.total_size, self.chunk_size)
    }

    pub fn chunk_count(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size)
    }
}

/// Splits `[0, total_size)` into `chunk_size` pieces; only the last may be shorter.
pub fn plan_chunks(total_size: u64, chunk_size: u64) -> Result<Vec<Chunk>> {
    if chunk_size == 0 {
        return Err(Error::Planning { chunk_size });
    }

    let count = total_size.div_ceil(chunk_size);
    let mut chunks = Vec::with_capacity(count as usize);
    let mut offset = 0u64;
    let mut ordinal = 0u64;
    while offset < total_size {
        let len = chunk_size.min(total_size - offset);
        chunks.push(Chunk {
            ordinal,
            offset,
            len,
        });
        offset += len;
        ordinal += 1;
    }
    Ok(chunks)
}
