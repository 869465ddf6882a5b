//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1. Per-collection record
//! tables are not part of the versioned schema; they are created on first
//! write from [`collection_table_sql`].

use rusqlite::Connection;

use replica_core::{now_millis, CollectionPath};

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Prefix of every per-collection record table.
pub const TABLE_PREFIX: &str = "records_";

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema version {} is newer than supported version {}",
            current, CURRENT_VERSION
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
        tracing::debug!(version = CURRENT_VERSION, "schema migrated");
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: collection catalog.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per synchronized collection
        CREATE TABLE collections (
            path TEXT PRIMARY KEY,            -- CollectionPath, '/'-separated
            table_name TEXT NOT NULL UNIQUE,  -- records_<hex(path)>
            created_at INTEGER NOT NULL       -- Unix ms
        );
        "#,
    )?;

    Ok(())
}

/// Name of the record table backing a collection.
///
/// The path is hex-encoded so that arbitrary path characters can never
/// escape the quoted identifier.
pub fn table_name(path: &CollectionPath) -> String {
    format!("{}{}", TABLE_PREFIX, hex::encode(path.as_str()))
}

/// DDL for one collection's record table.
pub fn collection_table_sql(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{table}" (
            record_key TEXT PRIMARY KEY,
            payload BLOB NOT NULL,               -- codec-encoded record
            dirty INTEGER NOT NULL DEFAULT 0,    -- 1 while a local write is unconfirmed
            last_applied_seq INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL          -- Unix ms of the last local mutation
        );
        CREATE INDEX IF NOT EXISTS "idx_{table}_dirty" ON "{table}"(dirty);
        "#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"collections".to_string()));
        assert!(tables.contains(&"schema_migrations".to_string()));
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_newer_schema_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (99, 0)",
            [],
        )
        .unwrap();

        assert!(matches!(migrate(&mut conn), Err(StoreError::Migration(_))));
    }

    #[test]
    fn test_table_name_is_safe() {
        let path = CollectionPath::parse("t/it's \"quoted\"").unwrap();
        let name = table_name(&path);
        assert!(name.starts_with(TABLE_PREFIX));
        assert!(name[TABLE_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit()));

        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&collection_table_sql(&name)).unwrap();
    }
}
