//! Error taxonomy for the tag store.
//!
//! Engine failures carry the SQLite result code, the engine message and the
//! statement that failed. Validation failures are raised before anything is
//! written.

use rusqlite::{ffi, CachedStatement, Connection, Params};
use thiserror::Error;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The gate was used after a fatal open/migration failure or after close.
    #[error("tag database is not available")]
    Uninitialized,

    #[error("failed to open tag database (code {code}): {message}")]
    OpenFailed { code: i32, message: String },

    #[error("failed to prepare statement: {message} [{statement}]")]
    PrepareFailed { message: String, statement: String },

    #[error("statement failed (code {code}): {message} [{statement}]")]
    ExecutionFailed {
        code: i32,
        message: String,
        statement: String,
    },

    #[error("tag name must not be empty")]
    InvalidName,

    #[error("a tag named {0:?} already exists")]
    DuplicateName(String),

    #[error("tag {0} does not exist")]
    TagNotFound(i64),

    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: u32, supported: u32 },
}

impl StoreError {
    pub(crate) fn open(err: rusqlite::Error) -> Self {
        StoreError::OpenFailed {
            code: result_code(&err),
            message: err.to_string(),
        }
    }

    pub(crate) fn prepare(err: rusqlite::Error, statement: &str) -> Self {
        StoreError::PrepareFailed {
            message: err.to_string(),
            statement: compact(statement),
        }
    }

    pub(crate) fn execution(err: rusqlite::Error, statement: &str) -> Self {
        StoreError::ExecutionFailed {
            code: result_code(&err),
            message: err.to_string(),
            statement: compact(statement),
        }
    }

    /// Extended SQLite result code for engine failures, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            StoreError::OpenFailed { code, .. } | StoreError::ExecutionFailed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

fn result_code(err: &rusqlite::Error) -> i32 {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => failure.extended_code,
        _ => ffi::SQLITE_ERROR,
    }
}

// Statements are written as indented multi-line strings; collapse them so
// error messages stay on one line.
fn compact(statement: &str) -> String {
    statement.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Attach statement context to a raw rusqlite result.
pub(crate) trait SqlResultExt<T> {
    fn on_statement(self, statement: &str) -> Result<T>;
}

impl<T> SqlResultExt<T> for rusqlite::Result<T> {
    fn on_statement(self, statement: &str) -> Result<T> {
        self.map_err(|err| StoreError::execution(err, statement))
    }
}

/// Prepare (or fetch from the connection's cache) a statement. The returned
/// handle is released when it goes out of scope.
pub(crate) fn prepare<'c>(conn: &'c Connection, sql: &str) -> Result<CachedStatement<'c>> {
    conn.prepare_cached(sql).map_err(|err| StoreError::prepare(err, sql))
}

/// Prepare and run a statement that returns no rows.
pub(crate) fn execute<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<usize> {
    prepare(conn, sql)?.execute(params).on_statement(sql)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_keeps_statement() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE)")
            .unwrap();
        execute(&conn, "INSERT INTO t (name) VALUES (?1)", ["a"]).unwrap();

        let err = execute(
            &conn,
            "INSERT INTO t (name)\n        VALUES (?1)",
            ["a"],
        )
        .unwrap_err();

        match err {
            StoreError::ExecutionFailed { code, statement, .. } => {
                assert_eq!(code, ffi::SQLITE_CONSTRAINT_UNIQUE);
                assert_eq!(statement, "INSERT INTO t (name) VALUES (?1)");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_prepare_error() {
        let conn = Connection::open_in_memory().unwrap();
        let err = match prepare(&conn, "SELEC nonsense") {
            Err(err) => err,
            Ok(_) => panic!("statement should not compile"),
        };
        assert!(matches!(err, StoreError::PrepareFailed { .. }));
        assert_eq!(err.code(), None);
    }
}
