// src/cache/schema.rs

//! Cache database schema and migrations
//!
//! The cache is a single table addressed by (namespace, key). The payload
//! is either an opaque blob or a JSON document; the freshness columns are
//! an optional sidecar filled in for remote resources.
//!
//! The schema version lives in `PRAGMA user_version`. Migration `n` in
//! [`MIGRATIONS`] upgrades version `n` to `n + 1`.

use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Ordered upgrade steps
const MIGRATIONS: &[&str] = &[
    // v1: entries with freshness sidecar
    "CREATE TABLE cache_entries (
        namespace TEXT NOT NULL,
        key TEXT NOT NULL,
        kind TEXT NOT NULL CHECK(kind IN ('blob', 'json')),
        payload BLOB NOT NULL,
        etag TEXT,
        max_age INTEGER,
        width INTEGER,
        height INTEGER,
        stored_at INTEGER NOT NULL,
        PRIMARY KEY (namespace, key)
    );
    CREATE INDEX idx_cache_entries_namespace ON cache_entries(namespace);",
];

/// Version a fully migrated cache reports
pub const SCHEMA_VERSION: i32 = MIGRATIONS.len() as i32;

pub fn schema_version(conn: &Connection) -> Result<i32> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Bring the cache up to [`SCHEMA_VERSION`]
///
/// Each step runs in its own transaction together with the version bump.
/// A cache written by a newer build is refused rather than downgraded.
pub fn migrate(conn: &Connection) -> Result<()> {
    let current = schema_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(Error::InitError(format!(
            "cache schema version {current} is newer than supported version {SCHEMA_VERSION}"
        )));
    }
    if current == SCHEMA_VERSION {
        debug!("Cache schema is up to date (version {})", current);
        return Ok(());
    }

    for (index, sql) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let target = index as i32 + 1;
        info!("Migrating cache schema to version {}", target);
        conn.execute_batch(&format!(
            "BEGIN;\n{sql}\nPRAGMA user_version = {target};\nCOMMIT;"
        ))
        .inspect_err(|_| {
            let _ = conn.execute_batch("ROLLBACK");
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_fresh_database() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(schema_version(&conn).unwrap(), 0);
        migrate(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_newer_schema_refused() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&format!("PRAGMA user_version = {};", SCHEMA_VERSION + 1))
            .unwrap();
        assert!(matches!(migrate(&conn), Err(Error::InitError(_))));
    }
}
