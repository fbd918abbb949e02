//! Tag storage for an image viewer: an embedded SQLite database associating
//! user-defined tags with image files, which keeps following those files
//! across renames and moves.

pub mod config;
pub mod db;
pub mod identity;
pub mod logging;

pub use config::Config;
pub use db::{
    ConnectionManager, ImageRecord, InspectionSummary, StoreError, TagRecord, TagStore,
    TaggedImageRecord,
};
pub use identity::{FileIdentityProvider, FileRef, NoopIdentity};
