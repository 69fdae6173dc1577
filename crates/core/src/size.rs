use std::fs::File;

use tracing::debug;

use crate::store::{AccessConditions, ObjectStore};
use crate::{Error, Result};

/// Number of bytes a download of `[offset, ..)` will move.
///
/// A non-zero `count` wins, then a content length the caller already holds,
/// and only then is the store asked. `Some(0)` reads to the end like `None`.
/// A result of zero means there is nothing to transfer.
pub async fn resolve_download_size<S: ObjectStore + ?Sized>(
    store: &S,
    key: &str,
    offset: u64,
    count: Option<u64>,
    known_length: Option<u64>,
    access: &AccessConditions,
) -> Result<u64> {
    if let Some(count) = count.filter(|&c| c > 0) {
        return Ok(count);
    }

    let length = match known_length {
        Some(length) => length,
        None => {
            let props = store
                .get_properties(key, access)
                .await
                .map_err(|e| Error::RemoteQuery {
                    message: format!("{key}: {e}"),
                })?;
            debug!(
                event = "size.queried",
                key,
                content_length = props.content_length,
                "size.queried"
            );
            props.content_length
        }
    };
    Ok(length.saturating_sub(offset))
}

/// Uploads take their size from the local source; the store is never asked.
pub fn local_source_size(file: &File) -> Result<u64> {
    Ok(file.metadata()?.len())
}
