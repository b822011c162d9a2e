//! A per-blob-name handle (`spec.md` §4.6): get/put/stat/read_at/delete,
//! `readdir_names`, and the panic-on-call `write_at` the spec classifies
//! as unsupported.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};

use cache_common::{StorageError, StorageErrorIntrospect, StorageErrorKind};

use crate::pool::{ConnPool, PooledConn};
use crate::provider::Provider;

const PUT_RETRY_ATTEMPTS: u32 = 10;
const PUT_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// The subset of file-info `spec.md` §4.6 defines: `size` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
}

/// The result of a single `read_at` call: a byte count and, separately,
/// whatever error accompanies it. Modeled as its own type rather than
/// `std::io::Read` because a short read at EOF needs to report both a
/// positive `n` and an EOF error in the same return, which `Read` cannot
/// express.
#[derive(Debug)]
pub struct ReadAt {
    pub n: usize,
    pub result: Result<(), StorageError>,
}

/// The resource-provider interface `spec.md` §1/§6 says the (out of
/// scope) pieces-storage adapter binds against.
#[async_trait]
pub trait Resource: Send + Sync {
    async fn put(&self, data: Vec<u8>) -> Result<(), StorageError>;
    async fn get(&self) -> Result<BlobReader, StorageError>;
    async fn stat(&self) -> Result<FileInfo, StorageError>;
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> ReadAt;
    async fn readdir_names(&self) -> Result<Vec<String>, StorageError>;
    async fn delete(&self) -> Result<(), StorageError>;
    fn write_at(&self, buf: &[u8], offset: u64) -> ReadAt;
}

/// A lightweight `(location, provider-ref)` pair, per `spec.md` §4.6.
/// Cheap to construct: `Provider::new_instance` never fails.
#[derive(Clone)]
pub struct Instance {
    location: String,
    provider: Provider,
}

impl Instance {
    pub(crate) fn new(location: String, provider: Provider) -> Self {
        Instance { location, provider }
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

#[async_trait]
impl Resource for Instance {
    /// Buffers `data` (already fully read into memory by the caller) and
    /// `insert-or-replace`s it, retrying up to ten times with a
    /// one-second wait whenever SQLite reports contention, per
    /// `spec.md` §4.6/§7.
    async fn put(&self, data: Vec<u8>) -> Result<(), StorageError> {
        let name = self.location.clone();
        let mut attempt = 0;
        loop {
            let name = name.clone();
            let data = data.clone();
            let result = self
                .provider
                .submit_write(move |conn| {
                    let now = now_secs();
                    conn.execute(
                        "INSERT OR REPLACE INTO blob (name, last_used, data) VALUES (?1, ?2, ?3)",
                        params![name, now, data],
                    )
                    .map(|_| ())
                    .map_err(StorageError::from)
                })
                .await;

            match result {
                Err(ref e) if e.is_busy() && attempt < PUT_RETRY_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(PUT_RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }

    /// Acquires a connection directly (bypassing the batcher — this is a
    /// read path per `spec.md` §4.5), updates `last_used`, and hands
    /// back a reader that holds the connection until it is closed or
    /// dropped.
    async fn get(&self) -> Result<BlobReader, StorageError> {
        let pool = self.provider.pool().clone();
        let conn = pool
            .acquire()
            .await
            .ok_or_else(|| StorageError::from(StorageErrorKind::PoolClosed))?;
        let name = self.location.clone();

        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = touch_and_size(&conn, &name);
            (conn, result)
        })
        .await
        .expect("get task panicked");

        match result {
            Ok(size) => Ok(BlobReader {
                conn: Some(conn),
                pool,
                name: self.location.clone(),
                position: 0,
                size,
            }),
            Err(e) => {
                pool.release(conn);
                Err(e)
            }
        }
    }

    /// Reads `size` without touching `last_used`, per `spec.md` §4.6's
    /// access-time policy.
    async fn stat(&self) -> Result<FileInfo, StorageError> {
        let pool = self.provider.pool().clone();
        let conn = pool
            .acquire()
            .await
            .ok_or_else(|| StorageError::from(StorageErrorKind::PoolClosed))?;
        let name = self.location.clone();

        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = conn
                .query_row(
                    "SELECT length(data) FROM blob WHERE name = ?1",
                    params![name],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
                .map_err(StorageError::from)
                .and_then(|opt| opt.ok_or_else(|| StorageError::not_found(name)));
            (conn, result)
        })
        .await
        .expect("stat task panicked");

        pool.release(conn);
        result.map(|size| FileInfo { size: size as u64 })
    }

    /// Reads via a SQL substring projection (1-based at the SQL layer,
    /// 0-based in `offset`) rather than opening a native blob object —
    /// the path `spec.md` §9 prefers to avoid locking pathologies on
    /// in-memory/WAL-disabled databases. Does not update `last_used`.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> ReadAt {
        let pool = self.provider.pool().clone();
        let conn = match pool.acquire().await {
            Some(conn) => conn,
            None => {
                return ReadAt {
                    n: 0,
                    result: Err(StorageErrorKind::PoolClosed.into()),
                }
            }
        };
        let name = self.location.clone();
        let want = buf.len();
        let sql_offset = offset as i64 + 1;

        let (conn, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = read_slice(&conn, &name, sql_offset, want);
            (conn, outcome)
        })
        .await
        .expect("read_at task panicked");

        pool.release(conn);

        match outcome {
            Ok(bytes) => {
                let n = bytes.len();
                buf[..n].copy_from_slice(&bytes);
                if n < want {
                    ReadAt {
                        n,
                        result: Err(StorageErrorKind::Eof.into()),
                    }
                } else {
                    ReadAt { n, result: Ok(()) }
                }
            }
            Err(e) => ReadAt { n: 0, result: Err(e) },
        }
    }

    /// Lists every blob whose name starts with `location + '/'`, with
    /// that prefix stripped.
    async fn readdir_names(&self) -> Result<Vec<String>, StorageError> {
        let pool = self.provider.pool().clone();
        let conn = pool
            .acquire()
            .await
            .ok_or_else(|| StorageError::from(StorageErrorKind::PoolClosed))?;
        let prefix = format!("{}/", self.location);

        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = (|| -> Result<Vec<String>, StorageError> {
                let prefix_len = prefix.len() as i64;
                let mut stmt = conn.prepare(
                    "SELECT name FROM blob WHERE substr(name, 1, ?1) = ?2 ORDER BY name",
                )?;
                let names = stmt
                    .query_map(params![prefix_len, prefix], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(names
                    .into_iter()
                    .map(|n| n[prefix.len()..].to_owned())
                    .collect())
            })();
            (conn, result)
        })
        .await
        .expect("readdir_names task panicked");

        pool.release(conn);
        result
    }

    /// Deletes the blob row; the `blob_after_delete` trigger adjusts
    /// `blob_meta.size`. Routed through the batcher like any other
    /// write.
    async fn delete(&self) -> Result<(), StorageError> {
        let name = self.location.clone();
        self.provider
            .submit_write(move |conn| {
                conn.execute("DELETE FROM blob WHERE name = ?1", params![name])
                    .map(|_| ())
                    .map_err(StorageError::from)
            })
            .await
    }

    /// Unsupported: `spec.md` §4.6/§7 classifies calling this as a
    /// programming error, not a runtime failure.
    fn write_at(&self, _buf: &[u8], _offset: u64) -> ReadAt {
        panic!("write_at is not supported by this storage engine");
    }
}

fn touch_and_size(conn: &PooledConn, name: &str) -> Result<u64, StorageError> {
    let now = now_secs();
    let touched = conn.execute(
        "UPDATE blob SET last_used = ?1 WHERE name = ?2",
        params![now, name],
    )?;
    if touched == 0 {
        return Err(StorageError::not_found(name.to_owned()));
    }
    let size: i64 = conn.query_row(
        "SELECT length(data) FROM blob WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(size as u64)
}

fn read_slice(
    conn: &PooledConn,
    name: &str,
    sql_offset: i64,
    want: usize,
) -> Result<Vec<u8>, StorageError> {
    let data: Option<Vec<u8>> = conn
        .query_row(
            "SELECT substr(data, ?1, ?2) FROM blob WHERE name = ?3",
            params![sql_offset, want as i64, name],
            |row| row.get(0),
        )
        .optional()?;

    data.ok_or_else(|| StorageError::not_found(name.to_owned()))
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

/// The "read-closer" `get()` returns: holds its connection until
/// `close`d or dropped, releasing it to the pool exactly once.
pub struct BlobReader {
    conn: Option<PooledConn>,
    pool: std::sync::Arc<dyn ConnPool>,
    name: String,
    position: u64,
    size: u64,
}

impl BlobReader {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reads up to `buf.len()` bytes starting at the reader's current
    /// position, advancing it by the amount read.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        let Some(conn) = self.conn.take() else {
            return Err(StorageError::internal("read after close"));
        };

        let name = self.name.clone();
        let sql_offset = self.position as i64 + 1;
        let want = buf.len();

        let (conn, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = read_slice(&conn, &name, sql_offset, want);
            (conn, outcome)
        })
        .await
        .expect("blob reader task panicked");

        self.conn = Some(conn);

        let bytes = outcome?;
        let n = bytes.len();
        buf[..n].copy_from_slice(&bytes);
        self.position += n as u64;
        Ok(n)
    }

    /// Releases the connection. Safe to call more than once; subsequent
    /// calls are no-ops.
    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

impl Drop for BlobReader {
    fn drop(&mut self) {
        self.close();
    }
}
