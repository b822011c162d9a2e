//! The write batcher (`spec.md` §4.4): a background task that drains the
//! write queue, groups every immediately-available request into one
//! `SAVEPOINT`, and fans the per-request results back to waiters. This is
//! the component that turns N concurrent writers into far fewer
//! transactions without anyone coordinating explicitly — the "batching
//! occurs opportunistically, not on a timer" property the spec calls out.

use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use cache_common::{Metrics, StorageError, StorageErrorKind};

use crate::pool::ConnPool;

/// Bounded so submitters experience natural backpressure once 64 writes
/// are queued ahead of them — the size the reference implementation uses.
pub const QUEUE_CAPACITY: usize = 64;

type WriteJob = Box<dyn FnOnce(&Connection) -> Result<(), StorageError> + Send>;

struct WriteRequest {
    job: WriteJob,
    reply: oneshot::Sender<Result<(), StorageError>>,
}

/// The caller-facing half: a cloneable sender onto the batcher's queue.
#[derive(Clone)]
pub struct Batcher {
    tx: mpsc::Sender<WriteRequest>,
}

impl Batcher {
    /// Spawns the single background task that drives batching for a
    /// `Provider`. Only one exists per provider, per `spec.md`'s contract.
    pub fn spawn(pool: Arc<dyn ConnPool>, metrics: Metrics) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let handle = tokio::spawn(run(pool, metrics, rx));
        (Batcher { tx }, handle)
    }

    /// Submits a write closure and awaits its result only after the
    /// transaction it lands in actually commits.
    pub async fn submit(
        &self,
        job: impl FnOnce(&Connection) -> Result<(), StorageError> + Send + 'static,
    ) -> Result<(), StorageError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = WriteRequest {
            job: Box::new(job),
            reply: reply_tx,
        };

        if self.tx.send(request).await.is_err() {
            return Err(StorageErrorKind::PoolClosed.into());
        }

        match reply_rx.await {
            Ok(result) => result,
            // The batcher dropped our reply sender without answering —
            // only happens if it lost its connection and the batch was
            // abandoned (step 2 of the algorithm).
            Err(_) => Err(StorageErrorKind::PoolClosed.into()),
        }
    }
}

async fn run(pool: Arc<dyn ConnPool>, metrics: Metrics, mut rx: mpsc::Receiver<WriteRequest>) {
    // 1. Block on the queue for the first request of the next batch.
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];

        // 5. Drain whatever else is immediately available without
        // blocking — this is what lets batch size scale with load while
        // a lone writer still commits alone.
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        run_batch(&pool, &metrics, batch).await;
    }
    // Queue closed (every `Batcher` clone dropped) and now drained: exit.
}

async fn run_batch(pool: &Arc<dyn ConnPool>, metrics: &Metrics, batch: Vec<WriteRequest>) {
    let Some(conn) = pool.acquire().await else {
        // 2. No connection available: the batch is dropped. Each waiter
        // learns the pool is closed rather than hanging forever.
        for request in batch {
            let _ = request.reply.send(Err(StorageErrorKind::PoolClosed.into()));
        }
        return;
    };

    let query_count = batch.len() as i64;

    // Run the blocking SQLite work off the async executor's own thread.
    let (conn, outcome) = tokio::task::spawn_blocking(move || {
        let outcome = execute_batch(&conn, batch);
        (conn, outcome)
    })
    .await
    .expect("batcher worker task panicked");

    pool.release(conn);

    metrics.count("sqliteStorage.batch.queries", query_count);
    match outcome {
        BatchOutcome::Committed => {
            metrics.incr("sqliteStorage.batch.committed");
        }
        BatchOutcome::SavepointFailed { results, .. } => {
            metrics.incr("sqliteStorage.batch.errors");
            for (reply, result) in results {
                let _ = reply.send(result);
            }
            return;
        }
    }
}

enum BatchOutcome {
    Committed,
    SavepointFailed {
        #[allow(dead_code)]
        error: StorageError,
        results: Vec<(oneshot::Sender<Result<(), StorageError>>, Result<(), StorageError>)>,
    },
}

/// 3-7 of the algorithm: open a savepoint, run every request's closure
/// recording its own error, release the savepoint, then deliver results.
/// A query failing doesn't abort the batch — only a savepoint-level
/// failure does, and even then every caller still gets their own answer.
fn execute_batch(conn: &Connection, batch: Vec<WriteRequest>) -> BatchOutcome {
    if let Err(e) = conn.execute_batch("SAVEPOINT batch_writes;") {
        let error = StorageError::from(StorageErrorKind::BatchTransaction(e.to_string()));
        let results = batch
            .into_iter()
            .map(|r| (r.reply, Err(StorageErrorKind::PoolClosed.into())))
            .collect();
        return BatchOutcome::SavepointFailed { error, results };
    }

    let mut outcomes = Vec::with_capacity(batch.len());
    for request in batch {
        let result = (request.job)(conn);
        outcomes.push((request.reply, result));
    }

    match conn.execute_batch("RELEASE batch_writes;") {
        Ok(()) => {
            for (reply, result) in outcomes {
                let _ = reply.send(result);
            }
            BatchOutcome::Committed
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK TO batch_writes;");
            BatchOutcome::SavepointFailed {
                error: StorageErrorKind::BatchTransaction(e.to_string()).into(),
                results: outcomes,
            }
        }
    }
}
