//! The single serialized gate to the tag database.
//!
//! `ConnectionManager` owns one SQLite handle for its whole lifetime. The file
//! is opened, configured and migrated on the first call to [`perform`], never
//! at construction, and every operation runs while holding the same mutex.
//!
//! [`perform`]: ConnectionManager::perform

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{ffi, Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use super::error::{Result, SqlResultExt, StoreError};
use super::schema;
use crate::config::DatabaseConfig;

enum Location {
    File(PathBuf),
    Memory,
}

enum State {
    /// Not opened yet.
    Pending,
    Ready(Connection),
    /// Opening failed or the handle was closed; the gate stays shut.
    Unavailable,
}

pub struct ConnectionManager {
    location: Location,
    busy_timeout: Duration,
    state: Mutex<State>,
}

impl ConnectionManager {
    /// Manager for an on-disk database. Nothing touches the filesystem until
    /// the first operation.
    pub fn new(path: impl Into<PathBuf>, config: &DatabaseConfig) -> Self {
        Self::with_location(Location::File(path.into()), config)
    }

    /// Manager for a private in-memory database.
    pub fn in_memory(config: &DatabaseConfig) -> Self {
        Self::with_location(Location::Memory, config)
    }

    fn with_location(location: Location, config: &DatabaseConfig) -> Self {
        Self {
            location,
            busy_timeout: config.busy_timeout(),
            state: Mutex::new(State::Pending),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            Location::File(path) => Some(path),
            Location::Memory => None,
        }
    }

    /// Run `operation` against the live handle. No other operation runs until
    /// this one returns; its value or error is passed through unchanged.
    pub fn perform<T, F>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut state = self.lock();
        let conn = self.ensure_open(&mut state)?;
        operation(conn)
    }

    /// Run `operation` inside `BEGIN IMMEDIATE ... COMMIT`. Any error rolls the
    /// whole transaction back before it is returned.
    pub fn transact<T, F>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        self.perform(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .on_statement("BEGIN IMMEDIATE")?;
            // Dropping an uncommitted transaction rolls it back and swallows
            // any rollback failure.
            let value = operation(&tx)?;
            tx.commit().on_statement("COMMIT")?;
            Ok(value)
        })
    }

    /// Persisted schema version of the open database.
    pub fn schema_version(&self) -> Result<u32> {
        self.perform(|conn| schema::current_version(conn))
    }

    /// Close the handle. Later operations fail with `Uninitialized`.
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, State::Unavailable) {
            State::Ready(conn) => conn
                .close()
                .map_err(|(_, err)| StoreError::execution(err, "close")),
            State::Pending | State::Unavailable => Ok(()),
        }
    }

    // A panic inside an operation poisons the mutex; the handle is still
    // consistent because multi-statement work runs in transactions.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open<'s>(&self, state: &'s mut State) -> Result<&'s mut Connection> {
        if matches!(state, State::Pending) {
            match self.open_and_migrate() {
                Ok(conn) => *state = State::Ready(conn),
                Err(err) => {
                    *state = State::Unavailable;
                    return Err(err);
                }
            }
        }
        match state {
            State::Ready(conn) => Ok(conn),
            State::Pending | State::Unavailable => Err(StoreError::Uninitialized),
        }
    }

    fn open_and_migrate(&self) -> Result<Connection> {
        let mut conn = self.open_connection()?;
        configure(&conn, self.busy_timeout)?;
        let version = schema::migrate(&mut conn)?;
        info!(path = ?self.path(), version, "Tag database ready");
        Ok(conn)
    }

    fn open_connection(&self) -> Result<Connection> {
        match &self.location {
            Location::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|err| StoreError::OpenFailed {
                        code: ffi::SQLITE_CANTOPEN,
                        message: format!("cannot create {}: {err}", parent.display()),
                    })?;
                }
                Connection::open(path).map_err(StoreError::open)
            }
            Location::Memory => Connection::open_in_memory().map_err(StoreError::open),
        }
    }
}

/// Engine settings applied once per open.
fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", true)
        .on_statement("PRAGMA foreign_keys = ON")?;
    let journal_mode: String = conn
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .on_statement("PRAGMA journal_mode = WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .on_statement("PRAGMA synchronous = NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")
        .on_statement("PRAGMA temp_store = MEMORY")?;
    conn.busy_timeout(busy_timeout)
        .on_statement("PRAGMA busy_timeout")?;
    // rarray() for batch lookups
    rusqlite::vtab::array::load_module(conn).on_statement("load rarray module")?;

    debug!(
        journal_mode = %journal_mode,
        busy_timeout_ms = busy_timeout.as_millis() as u64,
        "Configured tag database connection"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::error::execute;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    fn pragma(conn: &Connection, name: &str) -> String {
        conn.pragma_query_value(None, name, |row| {
            let value: rusqlite::types::Value = row.get(0)?;
            Ok(match value {
                rusqlite::types::Value::Integer(i) => i.to_string(),
                rusqlite::types::Value::Text(s) => s,
                other => format!("{other:?}"),
            })
        })
        .unwrap()
    }

    #[test]
    fn test_open_is_lazy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("support").join("tags.sqlite3");
        let manager = ConnectionManager::new(&path, &DatabaseConfig::default());
        assert!(!path.exists());

        manager.perform(|_| Ok(())).unwrap();
        assert!(path.exists());
        assert_eq!(manager.schema_version().unwrap(), schema::latest_version());
    }

    #[test]
    fn test_pragmas_applied() {
        let dir = tempdir().unwrap();
        let config = DatabaseConfig { busy_timeout_ms: 1234 };
        let manager = ConnectionManager::new(dir.path().join("tags.sqlite3"), &config);

        manager
            .perform(|conn| {
                assert_eq!(pragma(conn, "foreign_keys"), "1");
                assert_eq!(pragma(conn, "journal_mode"), "wal");
                assert_eq!(pragma(conn, "synchronous"), "1");
                assert_eq!(pragma(conn, "temp_store"), "2");
                assert_eq!(pragma(conn, "busy_timeout"), "1234");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let manager = ConnectionManager::in_memory(&DatabaseConfig::default());

        let result: Result<()> = manager.transact(|tx| {
            execute(
                tx,
                "INSERT INTO tags (name, created_at, updated_at) VALUES ('draft', 0, 0)",
                [],
            )?;
            Err(StoreError::InvalidName)
        });
        assert!(matches!(result, Err(StoreError::InvalidName)));

        let count: i64 = manager
            .perform(|conn| {
                conn.query_row("SELECT COUNT(*) FROM tags", [], |row| row.get(0))
                    .on_statement("count")
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_open_failure_is_fatal() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let manager =
            ConnectionManager::new(blocker.join("tags.sqlite3"), &DatabaseConfig::default());

        let first = manager.perform(|_| Ok(())).unwrap_err();
        assert!(matches!(first, StoreError::OpenFailed { .. }));

        let second = manager.perform(|_| Ok(())).unwrap_err();
        assert!(matches!(second, StoreError::Uninitialized));
    }

    #[test]
    fn test_close_shuts_the_gate() {
        let manager = ConnectionManager::in_memory(&DatabaseConfig::default());
        manager.perform(|_| Ok(())).unwrap();
        manager.close().unwrap();
        manager.close().unwrap();

        let err = manager.perform(|_| Ok(())).unwrap_err();
        assert!(matches!(err, StoreError::Uninitialized));
    }

    #[test]
    fn test_operations_are_serialized() {
        let dir = tempdir().unwrap();
        let manager = Arc::new(ConnectionManager::new(
            dir.path().join("tags.sqlite3"),
            &DatabaseConfig::default(),
        ));
        manager
            .perform(|conn| {
                conn.execute_batch("CREATE TABLE counter (value INTEGER NOT NULL); INSERT INTO counter VALUES (0);")
                    .on_statement("setup")
            })
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    for _ in 0..25 {
                        manager
                            .transact(|tx| {
                                // read-modify-write would lose updates if two
                                // operations interleaved
                                let value: i64 = tx
                                    .query_row("SELECT value FROM counter", [], |row| row.get(0))
                                    .on_statement("read")?;
                                execute(tx, "UPDATE counter SET value = ?1", [value + 1])?;
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let total: i64 = manager
            .perform(|conn| {
                conn.query_row("SELECT value FROM counter", [], |row| row.get(0))
                    .on_statement("read")
            })
            .unwrap();
        assert_eq!(total, 200);
    }
}
