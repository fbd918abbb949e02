//! Versioned schema for the tag database.
//!
//! The applied version lives in `PRAGMA user_version`. Each pending migration
//! runs in its own immediate transaction together with the version bump, so a
//! crash leaves either the old schema and old marker or the new schema and new
//! marker.

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info};

use super::error::{execute, Result, SqlResultExt, StoreError};

pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    up: fn(&Transaction) -> Result<()>,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_tags_images",
        up: create_tags_images,
    },
    Migration {
        version: 2,
        name: "add_file_identity",
        up: add_file_identity,
    },
];

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE COLLATE NOCASE,
    color_hex TEXT,
    created_at REAL NOT NULL,
    updated_at REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    file_name TEXT NOT NULL,
    directory TEXT NOT NULL,
    created_at REAL NOT NULL,
    updated_at REAL NOT NULL
);

-- Associations; either parent going away removes the link
CREATE TABLE IF NOT EXISTS image_tags (
    image_id INTEGER NOT NULL REFERENCES images(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    created_at REAL NOT NULL,
    PRIMARY KEY (image_id, tag_id)
);

CREATE INDEX IF NOT EXISTS idx_tags_name ON tags(name COLLATE NOCASE);
CREATE INDEX IF NOT EXISTS idx_image_tags_image ON image_tags(image_id);
CREATE INDEX IF NOT EXISTS idx_image_tags_tag ON image_tags(tag_id);
"#;

fn create_tags_images(tx: &Transaction) -> Result<()> {
    tx.execute_batch(SCHEMA_V1).on_statement("migration 1: create_tags_images")
}

fn add_file_identity(tx: &Transaction) -> Result<()> {
    add_column_if_missing(tx, "images", "file_identifier", "TEXT")?;
    add_column_if_missing(tx, "images", "bookmark", "BLOB")?;
    execute(
        tx,
        "CREATE INDEX IF NOT EXISTS idx_images_file_identifier ON images(file_identifier)",
        [],
    )?;
    Ok(())
}

/// `ALTER TABLE ... ADD COLUMN` is not idempotent on its own; check first so a
/// half-finished run can be repeated.
fn add_column_if_missing(tx: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    if column_exists(tx, table, column)? {
        debug!(table, column, "Column already present, skipping");
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {column} {decl}");
    execute(tx, &sql, [])?;
    Ok(())
}

pub(crate) fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    const SQL: &str = "SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2";
    let found = conn
        .query_row(SQL, params![table, column], |_| Ok(()))
        .optional()
        .on_statement(SQL)?;
    Ok(found.is_some())
}

/// Highest version this build knows how to produce.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

pub fn current_version(conn: &Connection) -> Result<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .on_statement("PRAGMA user_version")
}

/// Apply every migration newer than the stored marker. Returns the resulting
/// schema version.
pub fn migrate(conn: &mut Connection) -> Result<u32> {
    let current = current_version(conn)?;
    let latest = latest_version();

    if current > latest {
        return Err(StoreError::SchemaTooNew {
            found: current,
            supported: latest,
        });
    }
    if current == latest {
        debug!(version = current, "Tag database schema is up to date");
        return Ok(current);
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .on_statement("BEGIN IMMEDIATE")?;
        (migration.up)(&tx)?;
        tx.pragma_update(None, "user_version", migration.version)
            .on_statement("PRAGMA user_version")?;
        tx.commit().on_statement("COMMIT")?;
        info!(version = migration.version, name = migration.name, "Applied schema migration");
    }

    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, table: &str) -> bool {
        conn.query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |_| Ok(()),
        )
        .optional()
        .unwrap()
        .is_some()
    }

    #[test]
    fn test_migrate_fresh_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(current_version(&conn).unwrap(), 0);

        let version = migrate(&mut conn).unwrap();
        assert_eq!(version, latest_version());
        assert_eq!(current_version(&conn).unwrap(), 2);

        for table in ["tags", "images", "image_tags"] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }
        assert!(column_exists(&conn, "images", "file_identifier").unwrap());
        assert!(column_exists(&conn, "images", "bookmark").unwrap());
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), latest_version());
    }

    #[test]
    fn test_migration_two_survives_partial_run() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_V1).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();
        // A previous run added one column and then died before the marker moved.
        conn.execute_batch("ALTER TABLE images ADD COLUMN file_identifier TEXT").unwrap();

        migrate(&mut conn).unwrap();

        assert_eq!(current_version(&conn).unwrap(), 2);
        assert!(column_exists(&conn, "images", "bookmark").unwrap());
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 99).unwrap();

        let err = migrate(&mut conn).unwrap_err();
        assert!(matches!(err, StoreError::SchemaTooNew { found: 99, supported: 2 }));
    }

    #[test]
    fn test_tag_names_are_case_insensitive_unique() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO tags (name, created_at, updated_at) VALUES ('Work', 0, 0)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO tags (name, created_at, updated_at) VALUES ('work', 0, 0)",
            [],
        );
        assert!(dup.is_err());
    }
}
