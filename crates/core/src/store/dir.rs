use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{
    AccessConditions, ByteStream, CommitResponse, ObjectAttributes, ObjectProperties, ObjectStore,
    StoreFuture, clamp_range,
};
use crate::upload::BlockId;
use crate::{Error, Result};

/// An object store kept in a local directory.
///
/// Layout under `root`:
/// - `objects/<key>`: committed object bytes
/// - `attrs/<key>.json`: attributes of the last upload or commit
/// - `blocks/<hex(key)>/<hex(block id)>`: staged, uncommitted blocks
#[derive(Debug, Clone)]
pub struct DirObjectStore {
    root: PathBuf,
}

impl DirObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join("objects").join(validate_key(key)?))
    }

    fn attrs_path(&self, key: &str) -> Result<PathBuf> {
        let rel = validate_key(key)?;
        let mut path = self.root.join("attrs").join(rel);
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".json");
        path.set_file_name(name);
        Ok(path)
    }

    fn blocks_dir(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join("blocks").join(hex::encode(key)))
    }

    fn block_path(&self, key: &str, block_id: &BlockId) -> Result<PathBuf> {
        Ok(self.blocks_dir(key)?.join(hex::encode(block_id.as_str())))
    }

    async fn write_atomic(&self, path: &Path, body: ByteStream<'_>, len: u64) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = tmp_path(path);
        let written = write_body(&tmp, body, len).await;
        publish_tmp(&tmp, path, written).await
    }

    async fn concat_blocks(&self, key: &str, block_ids: &[BlockId], tmp: &Path) -> Result<()> {
        let mut out = fs::File::create(tmp).await?;
        for id in block_ids {
            let block_path = self.block_path(key, id)?;
            let mut block = match fs::File::open(&block_path).await {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::Remote {
                        message: format!("block not found: key={key} block_id={id}"),
                    });
                }
                Err(e) => return Err(e.into()),
            };
            tokio::io::copy(&mut block, &mut out).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        Ok(())
    }

    async fn write_attrs(&self, key: &str, attributes: &ObjectAttributes) -> Result<()> {
        let path = self.attrs_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec(attributes).map_err(|e| Error::Remote {
            message: format!("attributes json failed: {e}"),
        })?;
        let tmp = tmp_path(&path);
        let written = fs::write(&tmp, json).await.map_err(Error::from);
        publish_tmp(&tmp, &path, written).await
    }

    async fn read_attrs(&self, key: &str) -> Result<ObjectAttributes> {
        let path = self.attrs_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| Error::Remote {
                message: format!("invalid attributes json for {key}: {e}"),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ObjectAttributes::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn properties(&self, key: &str) -> Result<ObjectProperties> {
        let path = self.object_path(key)?;
        let meta = match fs::metadata(&path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Err(not_found(key)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found(key)),
            Err(e) => return Err(e.into()),
        };
        let mtime_nanos = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Ok(ObjectProperties {
            content_length: meta.len(),
            etag: format!("\"{:x}-{:x}\"", meta.len(), mtime_nanos),
            attributes: self.read_attrs(key).await?,
        })
    }

    async fn commit_response(&self, key: &str) -> Result<CommitResponse> {
        let props = self.properties(key).await?;
        Ok(CommitResponse {
            etag: props.etag,
            content_length: props.content_length,
        })
    }
}

impl ObjectStore for DirObjectStore {
    fn provider(&self) -> &str {
        "local.dir"
    }

    fn get_properties<'a>(
        &'a self,
        key: &'a str,
        _access: &'a AccessConditions,
    ) -> StoreFuture<'a, ObjectProperties> {
        Box::pin(self.properties(key))
    }

    fn download_range<'a>(
        &'a self,
        key: &'a str,
        offset: u64,
        count: u64,
        _access: &'a AccessConditions,
    ) -> StoreFuture<'a, ByteStream<'a>> {
        Box::pin(async move {
            let path = self.object_path(key)?;
            let mut file = match fs::File::open(&path).await {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found(key)),
                Err(e) => return Err(e.into()),
            };
            let size = file.metadata().await?.len();
            let (start, end) = clamp_range(size, offset, count)?;
            file.seek(std::io::SeekFrom::Start(start)).await?;
            Ok(Box::pin(file.take(end - start)) as ByteStream<'a>)
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
            let path = self.object_path(key)?;
            self.write_atomic(&path, body, len).await?;
            self.write_attrs(key, attributes).await?;
            self.commit_response(key).await
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
            let path = self.block_path(key, block_id)?;
            self.write_atomic(&path, body, len).await
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
            let path = self.object_path(key)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let tmp = tmp_path(&path);
            let written = self.concat_blocks(key, block_ids, &tmp).await;
            publish_tmp(&tmp, &path, written).await?;
            self.write_attrs(key, attributes).await?;

            // Committing discards every staged block of the object.
            let _ = fs::remove_dir_all(self.blocks_dir(key)?).await;
            self.commit_response(key).await
        })
    }
}

/// Object keys are relative, `/`-separated paths without `.` or `..` parts.
fn validate_key(key: &str) -> Result<PathBuf> {
    let invalid = || Error::InvalidConfig {
        message: format!("invalid object key: {key:?}"),
    };
    if key.is_empty() || key.starts_with('/') || key.contains('\\') {
        return Err(invalid());
    }
    let mut rel = PathBuf::new();
    for part in key.split('/') {
        if part.is_empty() {
            return Err(invalid());
        }
        match Path::new(part).components().next() {
            Some(Component::Normal(_)) if Path::new(part).components().count() == 1 => {
                rel.push(part)
            }
            _ => return Err(invalid()),
        }
    }
    Ok(rel)
}

async fn write_body(tmp: &Path, body: ByteStream<'_>, len: u64) -> Result<()> {
    let mut file = fs::File::create(tmp).await?;
    let written = tokio::io::copy(&mut body.take(len + 1), &mut file).await?;
    if written != len {
        return Err(Error::Remote {
            message: format!("content length mismatch: declared={len} received={written}"),
        });
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

/// Moves `tmp` over `path` when `written` is `Ok`; on any failure the temp
/// file is removed.
async fn publish_tmp(tmp: &Path, path: &Path, written: Result<()>) -> Result<()> {
    let res = match written {
        Ok(()) => fs::rename(tmp, path).await.map_err(Error::from),
        Err(e) => Err(e),
    };
    if res.is_err() {
        let _ = fs::remove_file(tmp).await;
    }
    res
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    path.with_file_name(name)
}

fn not_found(key: &str) -> Error {
    Error::Remote {
        message: format!("object not found: {key}"),
    }
}
