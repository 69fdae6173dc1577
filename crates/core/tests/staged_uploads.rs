use std::collections::HashSet;
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use blockxfer_core::{
    AccessConditions, BlockId, ByteStream, CommitResponse, Error, InMemoryObjectStore,
    MAX_BLOCKS, MAX_STAGE_BLOCK_BYTES, ObjectAttributes, ObjectProperties, ObjectStore, ReadAt,
    StoreFuture, UploadMode, UploadOptions, upload_buffer, upload_reader_at,
};
use tokio_util::sync::CancellationToken;

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    getrandom::getrandom(&mut buf).unwrap();
    buf
}

fn staged_options<'a>(block_size: u64, parallelism: usize) -> UploadOptions<'a> {
    UploadOptions {
        block_size,
        parallelism,
        single_shot_max_bytes: 1000,
        ..UploadOptions::default()
    }
}

/// Wraps the in-memory store: delays and fails stage calls on demand, and
/// records how many stages run at once and which access conditions arrive.
struct InstrumentedStore {
    inner: InMemoryObjectStore,
    delay: Duration,
    fail_on_stage: Option<usize>,
    stage_calls: AtomicUsize,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    leases: Mutex<Vec<Option<String>>>,
}

impl InstrumentedStore {
    fn new() -> Self {
        Self {
            inner: InMemoryObjectStore::new(),
            delay: Duration::ZERO,
            fail_on_stage: None,
            stage_calls: AtomicUsize::new(0),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            leases: Mutex::new(Vec::new()),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failing_on_stage(mut self, call_no: usize) -> Self {
        self.fail_on_stage = Some(call_no);
        self
    }

    fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::Relaxed)
    }

    fn record_lease(&self, access: &AccessConditions) {
        self.leases.lock().unwrap().push(access.lease_id.clone());
    }
}

impl ObjectStore for InstrumentedStore {
    fn provider(&self) -> &str {
        "test.instrumented"
    }

    fn get_properties<'a>(
        &'a self,
        key: &'a str,
        access: &'a AccessConditions,
    ) -> StoreFuture<'a, ObjectProperties> {
        self.record_lease(access);
        self.inner.get_properties(key, access)
    }

    fn download_range<'a>(
        &'a self,
        key: &'a str,
        offset: u64,
        count: u64,
        access: &'a AccessConditions,
    ) -> StoreFuture<'a, ByteStream<'a>> {
        self.record_lease(access);
        self.inner.download_range(key, offset, count, access)
    }

    fn upload<'a>(
        &'a self,
        key: &'a str,
        body: ByteStream<'a>,
        len: u64,
        attributes: &'a ObjectAttributes,
        access: &'a AccessConditions,
    ) -> StoreFuture<'a, CommitResponse> {
        self.record_lease(access);
        self.inner.upload(key, body, len, attributes, access)
    }

    fn stage_block<'a>(
        &'a self,
        key: &'a str,
        block_id: &'a BlockId,
        body: ByteStream<'a>,
        len: u64,
        access: &'a AccessConditions,
    ) -> StoreFuture<'a, ()> {
        self.record_lease(access);
        Box::pin(async move {
            let call_no = self.stage_calls.fetch_add(1, Ordering::Relaxed) + 1;
            let current = self.concurrent.fetch_add(1, Ordering::Relaxed) + 1;
            self.max_concurrent.fetch_max(current, Ordering::Relaxed);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.concurrent.fetch_sub(1, Ordering::Relaxed);

            if self.fail_on_stage == Some(call_no) {
                return Err(Error::Remote {
                    message: "injected stage failure".to_string(),
                });
            }
            self.inner
                .stage_block(key, block_id, body, len, access)
                .await
        })
    }

    fn commit_block_list<'a>(
        &'a self,
        key: &'a str,
        block_ids: &'a [BlockId],
        attributes: &'a ObjectAttributes,
        access: &'a AccessConditions,
    ) -> StoreFuture<'a, CommitResponse> {
        self.record_lease(access);
        self.inner
            .commit_block_list(key, block_ids, attributes, access)
    }
}

/// A source of arbitrary size that never allocates it.
struct Zeros;

impl ReadAt for Zeros {
    fn read_at(&self, _offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        buf.fill(0);
        Ok(buf.len())
    }
}

#[tokio::test]
async fn empty_source_makes_no_remote_calls() {
    let store = InMemoryObjectStore::new();
    let res = upload_buffer(&store, "obj", &[], UploadOptions::default())
        .await
        .unwrap();

    assert_eq!(res.bytes_uploaded, 0);
    assert!(res.response.is_none());
    assert_eq!(store.remote_calls(), 0);
    assert!(store.get("obj").await.is_none());
}

#[tokio::test]
async fn small_source_is_one_request() {
    let store = InMemoryObjectStore::new();
    let data = random_bytes(5000);
    let res = upload_buffer(
        &store,
        "obj",
        &data,
        UploadOptions {
            block_size: 1024,
            attributes: ObjectAttributes {
                content_type: Some("application/octet-stream".to_string()),
                ..ObjectAttributes::default()
            },
            ..UploadOptions::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(res.mode, UploadMode::SingleShot);
    assert_eq!(store.remote_calls(), 1);
    assert_eq!(store.uploads.load(Ordering::Relaxed), 1);
    assert_eq!(store.get("obj").await.unwrap(), data);
    assert_eq!(
        store.attributes("obj").await.unwrap().content_type.as_deref(),
        Some("application/octet-stream")
    );
    let response = res.response.unwrap();
    assert_eq!(response.content_length, 5000);
}

#[tokio::test]
async fn large_source_stages_blocks_then_commits_once() {
    let store = InMemoryObjectStore::new();
    let data = random_bytes(10_000);

    let res = upload_buffer(&store, "obj", &data, staged_options(1024, 4))
        .await
        .unwrap();

    assert_eq!(
        res.mode,
        UploadMode::Staged {
            block_size: 1024,
            block_count: 10
        }
    );
    assert_eq!(res.blocks_staged, 10);
    assert_eq!(store.stages.load(Ordering::Relaxed), 10);
    assert_eq!(store.commits.load(Ordering::Relaxed), 1);
    assert_eq!(store.uploads.load(Ordering::Relaxed), 0);

    let blocks = store.committed_block_list("obj").await.unwrap();
    assert_eq!(blocks.len(), 10);
    let unique: HashSet<_> = blocks.iter().collect();
    assert_eq!(unique.len(), 10);

    // The commit concatenates in list order, so equal bytes mean the list
    // is in block order.
    assert_eq!(store.get("obj").await.unwrap(), data);
    assert_eq!(store.uncommitted_block_count("obj").await, 0);
}

#[tokio::test]
async fn oversized_source_is_rejected_before_any_call() {
    let store = InMemoryObjectStore::new();

    let err = upload_reader_at(
        &store,
        "obj",
        &Zeros,
        MAX_STAGE_BLOCK_BYTES * MAX_BLOCKS + 1,
        UploadOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::SizeExceeded { .. }));

    let err = upload_reader_at(
        &store,
        "obj",
        &Zeros,
        MAX_BLOCKS * 10 + 1,
        staged_options(10, 4),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::SizeExceeded { .. }));

    assert_eq!(store.remote_calls(), 0);
}

#[tokio::test]
async fn stage_failure_skips_commit_and_later_blocks() {
    let store = InstrumentedStore::new().failing_on_stage(2);
    let data = random_bytes(8 * 1024);

    let err = upload_buffer(&store, "obj", &data, staged_options(1024, 1))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ChunkTransfer { ordinal: 1, .. }));
    assert!(matches!(err.root_cause(), Error::Remote { .. }));
    assert_eq!(store.stage_calls.load(Ordering::Relaxed), 2);
    assert_eq!(store.inner.commits.load(Ordering::Relaxed), 0);
    assert!(store.inner.get("obj").await.is_none());
}

#[tokio::test]
async fn parallel_stage_failure_never_commits() {
    let store = InstrumentedStore::new()
        .with_delay(Duration::from_millis(20))
        .failing_on_stage(3);
    let data = random_bytes(32 * 1024);

    let err = upload_buffer(&store, "obj", &data, staged_options(1024, 4))
        .await
        .unwrap_err();

    assert!(matches!(err.root_cause(), Error::Remote { .. }));
    assert!(store.stage_calls.load(Ordering::Relaxed) < 32);
    assert_eq!(store.inner.commits.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn stages_in_flight_never_exceed_parallelism() {
    let store = InstrumentedStore::new().with_delay(Duration::from_millis(20));
    let data = random_bytes(12 * 1024);

    upload_buffer(&store, "obj", &data, staged_options(1024, 3))
        .await
        .unwrap();

    let max_concurrent = store.max_concurrent();
    assert!(max_concurrent <= 3);
    assert!(max_concurrent >= 2);
    assert_eq!(store.inner.get("obj").await.unwrap(), data);
}

#[tokio::test]
async fn access_conditions_reach_every_call() {
    let store = InstrumentedStore::new();
    let data = random_bytes(4096);

    upload_buffer(
        &store,
        "obj",
        &data,
        UploadOptions {
            access: AccessConditions {
                lease_id: Some("lease-1".to_string()),
                ..AccessConditions::default()
            },
            ..staged_options(1024, 2)
        },
    )
    .await
    .unwrap();

    let leases = store.leases.lock().unwrap();
    assert_eq!(leases.len(), 5);
    assert!(leases.iter().all(|l| l.as_deref() == Some("lease-1")));
}

#[tokio::test]
async fn cancelled_caller_stages_nothing() {
    let store = InstrumentedStore::new();
    let data = random_bytes(4096);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = upload_buffer(
        &store,
        "obj",
        &data,
        UploadOptions {
            cancel: Some(&cancel),
            ..staged_options(1024, 2)
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(store.stage_calls.load(Ordering::Relaxed), 0);
    assert_eq!(store.inner.commits.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn upload_progress_counts_every_byte() {
    let store = InMemoryObjectStore::new();
    let data = random_bytes(10_000);
    let seen = Mutex::new(Vec::new());
    let progress = |n: u64| seen.lock().unwrap().push(n);

    upload_buffer(
        &store,
        "obj",
        &data,
        UploadOptions {
            progress: Some(&progress),
            ..staged_options(1024, 4)
        },
    )
    .await
    .unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(seen.last().copied(), Some(10_000));
}
