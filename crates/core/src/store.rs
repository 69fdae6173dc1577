use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;

use crate::upload::BlockId;
use crate::{Error, Result};

mod dir;

pub use dir::DirObjectStore;

pub type ByteStream<'a> = Pin<Box<dyn AsyncRead + Send + 'a>>;
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Preconditions forwarded untouched to every remote call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessConditions {
    pub lease_id: Option<String>,
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAttributes {
    pub content_type: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectProperties {
    pub content_length: u64,
    pub etag: String,
    #[serde(default)]
    pub attributes: ObjectAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResponse {
    pub etag: String,
    pub content_length: u64,
}

/// The remote side of a transfer: a store of named objects built from blocks.
pub trait ObjectStore: Sync {
    fn provider(&self) -> &str;

    fn get_properties<'a>(
        &'a self,
        key: &'a str,
        access: &'a AccessConditions,
    ) -> StoreFuture<'a, ObjectProperties>;

    fn download_range<'a>(
        &'a self,
        key: &'a str,
        offset: u64,
        count: u64,
        access: &'a AccessConditions,
    ) -> StoreFuture<'a, ByteStream<'a>>;

    /// Replaces the object with `len` bytes read from `body` in one request.
    fn upload<'a>(
        &'a self,
        key: &'a str,
        body: ByteStream<'a>,
        len: u64,
        attributes: &'a ObjectAttributes,
        access: &'a AccessConditions,
    ) -> StoreFuture<'a, CommitResponse>;

    /// Stores an uncommitted block; it stays invisible until committed.
    fn stage_block<'a>(
        &'a self,
        key: &'a str,
        block_id: &'a BlockId,
        body: ByteStream<'a>,
        len: u64,
        access: &'a AccessConditions,
    ) -> StoreFuture<'a, ()>;

    /// Replaces the object with the concatenation of the listed staged blocks.
    fn commit_block_list<'a>(
        &'a self,
        key: &'a str,
        block_ids: &'a [BlockId],
        attributes: &'a ObjectAttributes,
        access: &'a AccessConditions,
    ) -> StoreFuture<'a, CommitResponse>;
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    etag: String,
    attributes: ObjectAttributes,
    block_list: Vec<BlockId>,
}

/// Keeps objects in memory and counts every remote call it receives.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    pub property_queries: AtomicUsize,
    pub range_reads: AtomicUsize,
    pub uploads: AtomicUsize,
    pub stages: AtomicUsize,
    pub commits: AtomicUsize,
    objects: Mutex<HashMap<String, StoredObject>>,
    staged: Mutex<HashMap<String, HashMap<BlockId, Vec<u8>>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_object(&self, key: &str, bytes: Vec<u8>) {
        self.objects.lock().await.insert(
            key.to_string(),
            StoredObject {
                bytes,
                etag: new_etag(),
                attributes: ObjectAttributes::default(),
                block_list: Vec::new(),
            },
        );
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().await.get(key).map(|o| o.bytes.clone())
    }

    pub async fn attributes(&self, key: &str) -> Option<ObjectAttributes> {
        self.objects
            .lock()
            .await
            .get(key)
            .map(|o| o.attributes.clone())
    }

    /// Block IDs of the last commit, in commit order.
    pub async fn committed_block_list(&self, key: &str) -> Option<Vec<BlockId>> {
        self.objects
            .lock()
            .await
            .get(key)
            .map(|o| o.block_list.clone())
    }

    pub async fn uncommitted_block_count(&self, key: &str) -> usize {
        self.staged.lock().await.get(key).map_or(0, |b| b.len())
    }

    pub fn remote_calls(&self) -> usize {
        self.property_queries.load(Ordering::Relaxed)
            + self.range_reads.load(Ordering::Relaxed)
            + self.uploads.load(Ordering::Relaxed)
            + self.stages.load(Ordering::Relaxed)
            + self.commits.load(Ordering::Relaxed)
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn provider(&self) -> &str {
        "test.mem"
    }

    fn get_properties<'a>(
        &'a self,
        key: &'a str,
        _access: &'a AccessConditions,
    ) -> StoreFuture<'a, ObjectProperties> {
        Box::pin(async move {
            self.property_queries.fetch_add(1, Ordering::Relaxed);
            let objects = self.objects.lock().await;
            let obj = objects.get(key).ok_or_else(|| not_found(key))?;
            Ok(ObjectProperties {
                content_length: obj.bytes.len() as u64,
                etag: obj.etag.clone(),
                attributes: obj.attributes.clone(),
            })
        })
    }

    fn download_range<'a>(
        &'a self,
        key: &'a str,
        offset: u64,
        count: u64,
        _access: &'a AccessConditions,
    ) -> StoreFuture<'a, ByteStream<'a>> {
        Box::pin(async move {
            self.range_reads.fetch_add(1, Ordering::Relaxed);
            let objects = self.objects.lock().await;
            let obj = objects.get(key).ok_or_else(|| not_found(key))?;
            let (start, end) = clamp_range(obj.bytes.len() as u64, offset, count)?;
            let slice = obj.bytes[start as usize..end as usize].to_vec();
            Ok(Box::pin(std::io::Cursor::new(slice)) as ByteStream<'a>)
        })
    }

    fn upload<'a>(
        &'a self,
        key: &'a str,
        body: ByteStream<'a>,
        len: u64,
        attributes: &'a ObjectAttributes,
        _access: &'a AccessConditions,
    ) -> StoreFuture<'a, CommitResponse> {
        Box::pin(async move {
            self.uploads.fetch_add(1, Ordering::Relaxed);
            let bytes = read_body(body, len).await?;
            let etag = new_etag();
            self.objects.lock().await.insert(
                key.to_string(),
                StoredObject {
                    bytes,
                    etag: etag.clone(),
                    attributes: attributes.clone(),
                    block_list: Vec::new(),
                },
            );
            Ok(CommitResponse {
                etag,
                content_length: len,
            })
        })
    }

    fn stage_block<'a>(
        &'a self,
        key: &'a str,
        block_id: &'a BlockId,
        body: ByteStream<'a>,
        len: u64,
        _access: &'a AccessConditions,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.stages.fetch_add(1, Ordering::Relaxed);
            let bytes = read_body(body, len).await?;
            self.staged
                .lock()
                .await
                .entry(key.to_string())
                .or_default()
                .insert(block_id.clone(), bytes);
            Ok(())
        })
    }

    fn commit_block_list<'a>(
        &'a self,
        key: &'a str,
        block_ids: &'a [BlockId],
        attributes: &'a ObjectAttributes,
        _access: &'a AccessConditions,
    ) -> StoreFuture<'a, CommitResponse> {
        Box::pin(async move {
            self.commits.fetch_add(1, Ordering::Relaxed);
            let mut staged = self.staged.lock().await;
            let mut bytes = Vec::new();
            {
                let none = HashMap::new();
                let blocks = staged.get(key).unwrap_or(&none);
                for id in block_ids {
                    let block = blocks.get(id).ok_or_else(|| Error::Remote {
                        message: format!("block not found: key={key} block_id={id}"),
                    })?;
                    bytes.extend_from_slice(block);
                }
            }
            // Committing discards every block that was staged but not listed.
            staged.remove(key);

            let etag = new_etag();
            let content_length = bytes.len() as u64;
            self.objects.lock().await.insert(
                key.to_string(),
                StoredObject {
                    bytes,
                    etag: etag.clone(),
                    attributes: attributes.clone(),
                    block_list: block_ids.to_vec(),
                },
            );
            Ok(CommitResponse {
                etag,
                content_length,
            })
        })
    }
}

/// Reads exactly `len` bytes; a body of any other size is rejected.
pub(crate) async fn read_body(mut body: ByteStream<'_>, len: u64) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(len as usize);
    body.read_to_end(&mut bytes).await?;
    if bytes.len() as u64 != len {
        return Err(Error::Remote {
            message: format!(
                "content length mismatch: declared={len} received={}",
                bytes.len()
            ),
        });
    }
    Ok(bytes)
}

/// Resolves a requested range against the object size; the end is clamped.
pub(crate) fn clamp_range(size: u64, offset: u64, count: u64) -> Result<(u64, u64)> {
    if count > 0 && offset >= size {
        return Err(Error::Remote {
            message: format!("range not satisfiable: offset={offset} size={size}"),
        });
    }
    let end = offset.saturating_add(count).min(size);
    Ok((offset.min(end), end))
}

pub(crate) fn new_etag() -> String {
    format!("\"{}\"", uuid::Uuid::new_v4().simple())
}

fn not_found(key: &str) -> Error {
    Error::Remote {
        message: format!("object not found: {key}"),
    }
}
