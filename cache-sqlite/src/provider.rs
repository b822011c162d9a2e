//! The provider (`spec.md` §4.5): owns the pool, the write queue and the
//! batcher task, and hands out `Instance` handles keyed by blob name.

use std::io::Write;
use std::sync::Arc;

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection};
use tokio::task::JoinHandle;

use cache_common::{Metrics, StorageError, StorageErrorKind};
use cache_settings::{ConstructionOptions, ProviderOptions};

use crate::batch::Batcher;
use crate::instance::Instance;
use crate::pool::{ConnPool, MultiConnPool, PooledConn, SingleConnPool};
use crate::{init, schema};

struct Inner {
    pool: Arc<dyn ConnPool>,
    batcher: std::sync::Mutex<Option<Batcher>>,
    batcher_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    metrics: Metrics,
}

/// Cheap to clone — every clone shares the same pool, queue and batcher
/// task via the inner `Arc`, matching `syncstorage_db_common`'s pool
/// handles.
#[derive(Clone)]
pub struct Provider {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").finish()
    }
}

impl Provider {
    /// Opens (or creates) the database described by `construction`,
    /// applies the schema unless `dont_init_schema` is set, prepares
    /// every pooled connection's pragmas, persists `capacity` if
    /// nonzero, and spawns the write batcher when `provider.batch_writes`
    /// is true.
    pub async fn new(
        construction: &ConstructionOptions,
        provider_opts: &ProviderOptions,
        metrics: Metrics,
    ) -> Result<Self, StorageError> {
        let wal = construction.concurrent_blob_reads;

        let pool: Arc<dyn ConnPool> = if construction.wants_single_connection() {
            let conn = open_one(construction)?;
            init::prepare_connection(&conn, wal)?;
            if !construction.dont_init_schema {
                schema::apply(&conn)?;
            }
            Arc::new(SingleConnPool::new(conn))
        } else {
            let manager = build_manager(construction);
            let max_size = provider_opts.num_conns.max(1);
            let multi = MultiConnPool::new(manager, max_size)?;

            // Prime every connection the pool will ever hand out: draw
            // them all up front, prepare pragmas/schema, and put them
            // back, per `spec.md` §4.3. `size()` is the pool's own idea
            // of how many connections it knows about, rather than the
            // constructor argument we happened to pass it.
            let mut drawn = Vec::with_capacity(multi.size() as usize);
            for _ in 0..multi.size() {
                let conn = multi
                    .acquire()
                    .await
                    .ok_or_else(|| StorageError::from(StorageErrorKind::PoolClosed))?;
                init::prepare_connection(&conn, wal)?;
                if !construction.dont_init_schema {
                    schema::apply(&conn)?;
                }
                drawn.push(conn);
            }
            for conn in drawn {
                multi.release(conn);
            }

            Arc::new(multi)
        };

        if construction.capacity != 0 {
            set_capacity_on(&pool, construction.capacity).await?;
        }

        let (batcher, handle) = if provider_opts.batch_writes {
            let (batcher, handle) = Batcher::spawn(Arc::clone(&pool), metrics.clone());
            (Some(batcher), Some(handle))
        } else {
            (None, None)
        };

        Ok(Provider {
            inner: Arc::new(Inner {
                pool,
                batcher: std::sync::Mutex::new(batcher),
                batcher_handle: std::sync::Mutex::new(handle),
                metrics,
            }),
        })
    }

    /// Never fails: pairs `location` with a reference back to this
    /// provider, per `spec.md` §4.5.
    pub fn new_instance(&self, location: impl Into<String>) -> Instance {
        Instance::new(location.into(), self.clone())
    }

    pub(crate) fn pool(&self) -> &Arc<dyn ConnPool> {
        &self.inner.pool
    }

    /// Runs `job` against a connection owned exclusively for the
    /// duration of the write: through the batcher when write-batching is
    /// enabled, or directly against the pool otherwise.
    pub(crate) async fn submit_write(
        &self,
        job: impl FnOnce(&Connection) -> Result<(), StorageError> + Send + 'static,
    ) -> Result<(), StorageError> {
        let batcher = self.inner.batcher.lock().unwrap().clone();
        if let Some(batcher) = batcher {
            batcher.submit(job).await
        } else {
            let conn = self
                .inner
                .pool
                .acquire()
                .await
                .ok_or_else(|| StorageError::from(StorageErrorKind::PoolClosed))?;
            let (conn, result) = tokio::task::spawn_blocking(move || {
                let result = job(&conn);
                (conn, result)
            })
            .await
            .expect("direct write task panicked");
            self.inner.pool.release(conn);
            result
        }
    }

    /// Streams every blob whose name starts with `prefix`, ordered by
    /// the numeric value of the suffix after `prefix`, into `sink`.
    /// Returns the total number of bytes written alongside the first
    /// error encountered, if any, per `spec.md` §4.5.
    pub async fn write_consecutive_chunks(
        &self,
        prefix: impl Into<String>,
        mut sink: impl Write + Send + 'static,
    ) -> (u64, Result<(), StorageError>) {
        let prefix = prefix.into();
        let conn = match self.inner.pool.acquire().await {
            Some(conn) => conn,
            None => return (0, Err(StorageErrorKind::PoolClosed.into())),
        };

        let (conn, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = stream_chunks(&conn, &prefix, &mut sink);
            (conn, outcome)
        })
        .await
        .expect("write_consecutive_chunks task panicked");

        self.inner.pool.release(conn);
        outcome
    }

    /// Upserts the `capacity` setting; may trigger eviction on the next
    /// mutating write, not immediately (`spec.md` §4.7).
    pub async fn set_capacity(&self, bytes: u64) -> Result<(), StorageError> {
        set_capacity_on(&self.inner.pool, bytes).await
    }

    /// Deletes the `capacity` setting row; no further eviction occurs
    /// until it is re-set.
    pub async fn unlimit_capacity(&self) -> Result<(), StorageError> {
        let conn = self
            .inner
            .pool
            .acquire()
            .await
            .ok_or_else(|| StorageError::from(StorageErrorKind::PoolClosed))?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = conn
                .execute("DELETE FROM setting WHERE name = 'capacity'", [])
                .map(|_| ())
                .map_err(StorageError::from);
            (conn, result)
        })
        .await
        .expect("unlimit_capacity task panicked");
        self.inner.pool.release(conn);
        result
    }

    /// Closes the write queue (letting the batcher's in-flight batch
    /// finish), awaits the batcher task, then closes the pool.
    pub async fn close(&self) -> Result<(), StorageError> {
        // Dropping the last live `Batcher` (its mpsc sender) closes the
        // queue; the batcher task observes that once its current batch
        // finishes and exits on its own.
        self.inner.batcher.lock().unwrap().take();
        if let Some(handle) = self.inner.batcher_handle.lock().unwrap().take() {
            // Dropping every `Batcher` clone closes the mpsc sender; the
            // batcher task observes the closed channel and exits once
            // its current batch finishes.
            let _ = handle.await;
        }
        self.inner.pool.close().await
    }
}

async fn set_capacity_on(pool: &Arc<dyn ConnPool>, bytes: u64) -> Result<(), StorageError> {
    let conn = pool
        .acquire()
        .await
        .ok_or_else(|| StorageError::from(StorageErrorKind::PoolClosed))?;
    let bytes = bytes as i64;
    let (conn, result) = tokio::task::spawn_blocking(move || {
        let result = conn
            .execute(
                "INSERT OR REPLACE INTO setting (name, value) VALUES ('capacity', ?1)",
                params![bytes],
            )
            .map(|_| ())
            .map_err(StorageError::from);
        (conn, result)
    })
    .await
    .expect("set_capacity task panicked");
    pool.release(conn);
    result
}

fn stream_chunks(
    conn: &PooledConn,
    prefix: &str,
    sink: &mut (impl Write + Send),
) -> (u64, Result<(), StorageError>) {
    let mut written = 0u64;
    let outcome = (|| -> Result<(), StorageError> {
        let mut stmt = conn.prepare(
            "SELECT data FROM blob \
             WHERE substr(name, 1, ?1) = ?2 \
             ORDER BY CAST(substr(name, ?1 + 1) AS INTEGER), name",
        )?;
        let prefix_len = prefix.len() as i64;
        let mut rows = stmt.query(params![prefix_len, prefix])?;
        while let Some(row) = rows.next()? {
            let data: Vec<u8> = row.get(0)?;
            sink.write_all(&data)
                .map_err(|e| StorageError::internal(e.to_string()))?;
            written += data.len() as u64;
        }
        Ok(())
    })();

    (written, outcome)
}

fn build_manager(construction: &ConstructionOptions) -> SqliteConnectionManager {
    if construction.memory {
        // A distinct in-memory database per connection would defeat
        // pooling entirely; share one named in-memory database across
        // the pool via a URI instead.
        SqliteConnectionManager::file("file:cache-sqlite-shared?mode=memory&cache=shared")
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI,
            )
    } else {
        let path = construction
            .path
            .clone()
            .unwrap_or_else(|| "cache.db".to_owned());
        SqliteConnectionManager::file(path)
    }
}

fn open_one(construction: &ConstructionOptions) -> Result<Connection, StorageError> {
    let conn = if construction.memory {
        Connection::open_in_memory()?
    } else {
        let path = construction
            .path
            .clone()
            .unwrap_or_else(|| "cache.db".to_owned());
        Connection::open(path)?
    };
    Ok(conn)
}
