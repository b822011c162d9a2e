//! DDL for the three tables, the eviction view, and the triggers that keep
//! `blob_meta.size` and the LRU invariant consistent — the single source of
//! truth for the eviction policy (`spec.md` §2, component 1).

use rusqlite::Connection;

use cache_common::StorageError;

/// Applies the schema. Idempotent: safe to call against an
/// already-initialized database. Must run before any other statement
/// against a fresh connection, since `PRAGMA auto_vacuum` only takes
/// effect on an empty database and has to precede the first `CREATE TABLE`.
pub fn apply(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(SCHEMA_SQL)
        .map_err(|e| StorageError::from(cache_common::StorageErrorKind::Schema(e.to_string())))
}

const SCHEMA_SQL: &str = r#"
PRAGMA auto_vacuum = INCREMENTAL;

CREATE TABLE IF NOT EXISTS blob (
    name TEXT PRIMARY KEY NOT NULL,
    last_used INTEGER NOT NULL,
    data BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS blob_meta (
    key TEXT PRIMARY KEY NOT NULL,
    value INTEGER NOT NULL
);

INSERT OR IGNORE INTO blob_meta (key, value) VALUES ('size', 0);

CREATE TABLE IF NOT EXISTS setting (
    name TEXT PRIMARY KEY NOT NULL,
    value INTEGER NOT NULL
);

-- Yields the minimum prefix of the LRU (last_used, rowid) order whose
-- removal would bring blob_meta.size back to at-or-below setting.capacity.
-- `remaining` carried into row i is the total size as it would stand after
-- deleting rows 1..i-1; a row appears in the output iff that value was
-- still > capacity, i.e. deleting it is still necessary to reach
-- at-or-below capacity (a total that merely equals capacity is not over it).
CREATE VIEW IF NOT EXISTS deletable_blob AS
WITH RECURSIVE sweep(rowid, name, last_used, remaining) AS (
    SELECT
        blob.rowid,
        blob.name,
        blob.last_used,
        (SELECT value FROM blob_meta WHERE key = 'size')
    FROM blob
    ORDER BY blob.last_used, blob.rowid
    LIMIT 1

    UNION ALL

    SELECT
        next_blob.rowid,
        next_blob.name,
        next_blob.last_used,
        sweep.remaining - (SELECT length(data) FROM blob WHERE blob.rowid = sweep.rowid)
    FROM sweep
    JOIN blob next_blob ON (next_blob.last_used, next_blob.rowid) = (
        SELECT last_used, rowid
        FROM blob
        WHERE (last_used, rowid) > (sweep.last_used, sweep.rowid)
        ORDER BY last_used, rowid
        LIMIT 1
    )
    WHERE sweep.remaining > (SELECT value FROM setting WHERE name = 'capacity')
)
SELECT rowid, name
FROM sweep
WHERE remaining > (SELECT value FROM setting WHERE name = 'capacity');

-- `rowid != new.rowid` keeps a just-inserted oversized blob alive even
-- though the sweep above would otherwise name it: the view only ever
-- reasons about total size, it doesn't know which row was just written.
CREATE TRIGGER IF NOT EXISTS blob_after_insert AFTER INSERT ON blob BEGIN
    UPDATE blob_meta SET value = value + length(new.data) WHERE key = 'size';
    DELETE FROM blob WHERE rowid IN (SELECT rowid FROM deletable_blob) AND rowid != new.rowid;
END;

CREATE TRIGGER IF NOT EXISTS blob_after_update_data AFTER UPDATE OF data ON blob BEGIN
    UPDATE blob_meta SET value = value + (length(new.data) - length(old.data)) WHERE key = 'size';
    DELETE FROM blob WHERE rowid IN (SELECT rowid FROM deletable_blob) AND rowid != new.rowid;
END;

-- Shrinking can't violate the capacity bound, so no sweep is needed here.
CREATE TRIGGER IF NOT EXISTS blob_after_delete AFTER DELETE ON blob BEGIN
    UPDATE blob_meta SET value = value - length(old.data) WHERE key = 'size';
END;
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn open_and_init() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        conn
    }

    fn total_size(conn: &Connection) -> i64 {
        conn.query_row(
            "SELECT value FROM blob_meta WHERE key = 'size'",
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    fn set_capacity(conn: &Connection, bytes: i64) {
        conn.execute(
            "INSERT OR REPLACE INTO setting (name, value) VALUES ('capacity', ?1)",
            [bytes],
        )
        .unwrap();
    }

    fn insert(conn: &Connection, name: &str, data: &[u8], last_used: i64) {
        conn.execute(
            "INSERT OR REPLACE INTO blob (name, last_used, data) VALUES (?1, ?2, ?3)",
            rusqlite::params![name, last_used, data],
        )
        .unwrap();
    }

    fn names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn.prepare("SELECT name FROM blob ORDER BY name").unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .map(Result::unwrap)
            .collect()
    }

    #[test]
    fn schema_application_is_idempotent() {
        let conn = open_and_init();
        apply(&conn).unwrap();
        assert_eq!(total_size(&conn), 0);
    }

    #[test]
    fn eviction_order_scenario() {
        // spec.md §8 scenario 1.
        let conn = open_and_init();
        set_capacity(&conn, 10);
        insert(&conn, "a", &[1, 2, 3], 1);
        insert(&conn, "b", &[4, 5, 6, 7], 2);
        insert(&conn, "c", &[8, 9, 10], 3);
        assert_eq!(total_size(&conn), 10);
        assert_eq!(names(&conn), vec!["a", "b", "c"]);

        insert(&conn, "d", &[11, 12], 4);

        assert_eq!(names(&conn), vec!["b", "c", "d"]);
        assert_eq!(total_size(&conn), 9);
    }

    #[test]
    fn single_oversized_blob_survives() {
        // spec.md §8 scenario 2.
        let conn = open_and_init();
        set_capacity(&conn, 5);
        insert(&conn, "x", &[1, 2, 3, 4, 5, 6, 7], 1);

        assert_eq!(names(&conn), vec!["x"]);
        assert_eq!(total_size(&conn), 7);
    }

    #[test]
    fn oversized_blob_clears_older_rows_but_survives() {
        let conn = open_and_init();
        set_capacity(&conn, 5);
        insert(&conn, "a", &[0, 0, 0], 1);
        insert(&conn, "x", &[1; 7], 2);

        assert_eq!(names(&conn), vec!["x"]);
        assert_eq!(total_size(&conn), 7);
    }

    #[test]
    fn replace_accounting() {
        // spec.md §8 scenario 3.
        let conn = open_and_init();
        insert(&conn, "k", &[0, 0], 1);
        assert_eq!(total_size(&conn), 2);

        insert(&conn, "k", &[0, 0, 0, 0, 0], 2);
        assert_eq!(total_size(&conn), 5);
    }

    #[test]
    fn delete_shrinks_size_without_eviction() {
        let conn = open_and_init();
        set_capacity(&conn, 100);
        insert(&conn, "a", &[1, 2, 3], 1);
        conn.execute("DELETE FROM blob WHERE name = 'a'", []).unwrap();
        assert_eq!(total_size(&conn), 0);
        assert!(names(&conn).is_empty());
    }

    #[test]
    fn unbounded_without_capacity_row() {
        let conn = open_and_init();
        insert(&conn, "a", &[0; 1000], 1);
        insert(&conn, "b", &[0; 1000], 2);
        assert_eq!(names(&conn), vec!["a", "b"]);
    }
}
