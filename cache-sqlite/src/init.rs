//! Applies the per-connection pragmas `spec.md` §4.3 calls for, in order,
//! to every connection before the `Provider` serves its first request.

use rusqlite::Connection;

use cache_common::{StorageError, StorageErrorKind};

/// Applies the sequence of pragmas: recursive triggers on, synchronous
/// off (the durability trade the design documents), journaling mode
/// (WAL when concurrent blob reads were requested, otherwise off), and a
/// large `mmap_size` request that SQLite clamps to whatever the OS
/// actually allows.
pub fn prepare_connection(conn: &Connection, wal: bool) -> Result<(), StorageError> {
    let pragma = |sql: &str| -> Result<(), StorageError> {
        conn.execute_batch(sql)
            .map_err(|e| StorageError::from(StorageErrorKind::Schema(e.to_string())))
    };

    pragma("PRAGMA recursive_triggers = ON;")?;
    pragma("PRAGMA synchronous = OFF;")?;
    if wal {
        pragma("PRAGMA journal_mode = WAL;")?;
    } else {
        pragma("PRAGMA journal_mode = OFF;")?;
    }
    // ~10^12 bytes; SQLite clamps this to what the platform permits.
    pragma("PRAGMA mmap_size = 1000000000000;")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pragmas_apply_without_error() {
        let conn = Connection::open_in_memory().unwrap();
        prepare_connection(&conn, false).unwrap();

        let synchronous: i64 = conn
            .query_row("PRAGMA synchronous", [], |row| row.get(0))
            .unwrap();
        assert_eq!(synchronous, 0);
    }

    #[test]
    fn wal_mode_is_opt_in() {
        let path = std::env::temp_dir().join(format!("cache-sqlite-wal-test-{:?}", std::thread::current().id()));
        let conn = Connection::open(&path).unwrap();
        prepare_connection(&conn, true).unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        drop(conn);
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
    }
}
