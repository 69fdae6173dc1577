use std::future::Future;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::plan::Chunk;
use crate::{Error, Result};

/// Runs `op` once per chunk with at most `parallelism` operations in flight.
///
/// The first failure cancels the token handed to every operation and stops
/// new launches; operations already running are awaited, and their errors are
/// dropped. On success the outputs are returned in chunk order, one slot per
/// chunk, regardless of completion order.
///
/// `cancel` is the caller's token. A child of it is passed to operations, so a
/// chunk failure never cancels the caller's token.
pub async fn run_chunks<T, F, Fut>(
    operation: &'static str,
    chunks: Vec<Chunk>,
    parallelism: usize,
    cancel: Option<&CancellationToken>,
    op: F,
) -> Result<Vec<T>>
where
    F: Fn(Chunk, CancellationToken) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let parallelism = parallelism.max(1);
    let total = chunks.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    let token = cancel.map(|c| c.child_token()).unwrap_or_default();
    let mut done: Vec<(usize, T)> = Vec::with_capacity(total);
    let mut pending = chunks.into_iter().enumerate();
    let mut in_flight = FuturesUnordered::new();
    let mut first_error: Option<Error> = None;
    let mut launched = 0usize;

    debug!(
        event = "coordinator.start",
        operation,
        chunks = total,
        parallelism,
        "coordinator.start"
    );

    loop {
        while first_error.is_none() && !token.is_cancelled() && in_flight.len() < parallelism {
            let Some((slot, chunk)) = pending.next() else {
                break;
            };
            launched += 1;
            debug!(
                event = "chunk.start",
                operation,
                ordinal = chunk.ordinal,
                offset = chunk.offset,
                len = chunk.len,
                "chunk.start"
            );
            let fut = op(chunk, token.clone());
            in_flight.push(async move { (slot, chunk, fut.await) });
        }

        let Some((slot, chunk, res)) = in_flight.next().await else {
            break;
        };

        match res {
            Ok(value) => {
                debug!(
                    event = "chunk.finish",
                    operation,
                    ordinal = chunk.ordinal,
                    "chunk.finish"
                );
                done.push((slot, value));
            }
            Err(e) if first_error.is_none() => {
                debug!(
                    event = "chunk.failed",
                    operation,
                    ordinal = chunk.ordinal,
                    error = %e,
                    "chunk.failed"
                );
                token.cancel();
                first_error = Some(wrap_chunk_error(chunk, e));
            }
            Err(e) => {
                debug!(
                    event = "chunk.error_discarded",
                    operation,
                    ordinal = chunk.ordinal,
                    error = %e,
                    "chunk.error_discarded"
                );
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    if launched < total {
        debug!(
            event = "coordinator.cancelled",
            operation,
            launched,
            chunks = total,
            "coordinator.cancelled"
        );
        return Err(Error::Cancelled);
    }

    // Every chunk was launched and none failed, so each one finished once.
    debug_assert_eq!(done.len(), total);
    done.sort_unstable_by_key(|(slot, _)| *slot);
    Ok(done.into_iter().map(|(_, value)| value).collect())
}

fn wrap_chunk_error(chunk: Chunk, e: Error) -> Error {
    match e {
        Error::Cancelled => Error::Cancelled,
        other => Error::ChunkTransfer {
            ordinal: chunk.ordinal,
            offset: chunk.offset,
            len: chunk.len,
            source: Box::new(other),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::plan::plan_chunks;

    #[tokio::test]
    async fn empty_input_launches_nothing() {
        let calls = AtomicUsize::new(0);
        let out: Vec<()> = run_chunks("test", Vec::new(), 4, None, |_, _| {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Ok(()) }
        })
        .await
        .unwrap();
        assert!(out.is_empty());
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn outputs_are_in_chunk_order() {
        let chunks = plan_chunks(100, 10).unwrap();
        let out = run_chunks("test", chunks, 4, None, |chunk, _| async move {
            // Later chunks finish first.
            tokio::time::sleep(Duration::from_millis(20 - chunk.ordinal * 2)).await;
            Ok(chunk.offset)
        })
        .await
        .unwrap();
        assert_eq!(out, (0..10).map(|i| i * 10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn cancel_after_last_launch_keeps_every_output() {
        let chunks = plan_chunks(40, 10).unwrap();
        let caller = CancellationToken::new();
        let out = run_chunks("test", chunks, 4, Some(&caller), |chunk, _| {
            let caller = &caller;
            async move {
                if chunk.ordinal == 3 {
                    caller.cancel();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(chunk.ordinal)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn never_exceeds_parallelism() {
        let chunks = plan_chunks(64, 4).unwrap();
        let current = AtomicUsize::new(0);
        let max_seen = AtomicUsize::new(0);
        run_chunks("test", chunks, 3, None, |_, _| {
            let current = &current;
            let max_seen = &max_seen;
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
        assert_eq!(max_seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn first_error_wins_and_stops_launching() {
        let chunks = plan_chunks(100, 10).unwrap();
        let started = Mutex::new(Vec::new());
        let finished = AtomicUsize::new(0);

        let err = run_chunks("test", chunks, 2, None, |chunk, token| {
            started.lock().unwrap().push(chunk.ordinal);
            let finished = &finished;
            async move {
                match chunk.ordinal {
                    0 => {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Err(Error::Remote {
                            message: "boom".to_string(),
                        })
                    }
                    1 => {
                        // A running sibling sees the signal and is still awaited.
                        token.cancelled().await;
                        finished.fetch_add(1, Ordering::SeqCst);
                        Err(Error::Remote {
                            message: "late".to_string(),
                        })
                    }
                    _ => Ok(()),
                }
            }
        })
        .await
        .unwrap_err();

        match err {
            Error::ChunkTransfer { ordinal, source, .. } => {
                assert_eq!(ordinal, 0);
                assert!(source.to_string().contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*started.lock().unwrap(), vec![0, 1]);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn caller_cancellation_stops_launches() {
        let chunks = plan_chunks(100, 10).unwrap();
        let cancel = CancellationToken::new();
        let calls = AtomicUsize::new(0);

        let err = run_chunks("test", chunks, 1, Some(&cancel), |_, _| {
            if calls.fetch_add(1, Ordering::SeqCst) == 2 {
                cancel.cancel();
            }
            async { Ok(()) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
