mod connection;
mod error;
mod images;
mod maintenance;
mod schema;
mod tags;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

pub use connection::ConnectionManager;
pub use error::{Result, StoreError};
pub use images::{ImageRecord, MatchTier, Resolution};
pub use maintenance::InspectionSummary;
pub use schema::{latest_version, Migration, MIGRATIONS};
pub use tags::{TagRecord, TaggedImageRecord};

use crate::config::Config;
use crate::identity::{self, FileIdentityProvider, NoopIdentity};

/// The tag database as the UI layer sees it.
///
/// Cheap to clone; clones share one connection gate, so any number of threads
/// can hold a `TagStore` while operations still run one at a time.
#[derive(Clone)]
pub struct TagStore {
    db: Arc<ConnectionManager>,
    identity: Arc<dyn FileIdentityProvider>,
}

impl TagStore {
    pub fn new(db: Arc<ConnectionManager>, identity: Arc<dyn FileIdentityProvider>) -> Self {
        Self { db, identity }
    }

    /// Store backed by the configured database file and identity provider.
    pub fn from_config(config: &Config) -> Self {
        let db = ConnectionManager::new(config.db_path.clone(), &config.database);
        Self::new(Arc::new(db), identity::default_provider(&config.identity))
    }

    /// Private in-memory store with path-only identity.
    pub fn in_memory() -> Self {
        let db = ConnectionManager::in_memory(&Default::default());
        Self::new(Arc::new(db), Arc::new(NoopIdentity))
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.db
    }

    pub fn database_path(&self) -> Option<PathBuf> {
        self.db.path().map(|path| path.to_path_buf())
    }
}

/// Current time as stored in the database: Unix seconds, microsecond precision.
pub(crate) fn now_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

pub(crate) fn to_datetime(seconds: f64) -> DateTime<Utc> {
    let micros = (seconds * 1_000_000.0).round() as i64;
    Utc.timestamp_micros(micros)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_round_trip() {
        let now = now_timestamp();
        let restored = to_datetime(now);
        assert_eq!(restored.timestamp_micros(), (now * 1_000_000.0).round() as i64);
    }

    #[test]
    fn test_store_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TagStore>();
    }
}
