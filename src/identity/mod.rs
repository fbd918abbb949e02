//! File identity: turning a caller's file reference into the canonical form
//! stored in the database, plus the platform hooks that let a row follow its
//! file across renames and moves.
//!
//! A [`FileIdentityProvider`] supplies two optional capabilities:
//!
//! - a volume-local *file identifier* that survives rename/move on the same
//!   volume
//! - an opaque *bookmark* blob that can re-locate the file later
//!
//! Both are best-effort. [`NoopIdentity`] returns nothing and reduces
//! resolution to path matching.

#[cfg(unix)]
mod inode;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{IdentityConfig, IdentityProviderType};

#[cfg(unix)]
pub use inode::InodeIdentity;

/// A file as the caller knows it. Identifier and bookmark, when given, take
/// precedence over whatever the provider would derive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileRef {
    pub path: PathBuf,
    pub file_identifier: Option<String>,
    pub bookmark: Option<Vec<u8>>,
}

impl FileRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file_identifier: None,
            bookmark: None,
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.file_identifier = Some(identifier.into());
        self
    }

    pub fn with_bookmark(mut self, bookmark: impl Into<Vec<u8>>) -> Self {
        self.bookmark = Some(bookmark.into());
        self
    }
}

impl From<PathBuf> for FileRef {
    fn from(path: PathBuf) -> Self {
        FileRef::new(path)
    }
}

impl From<&Path> for FileRef {
    fn from(path: &Path) -> Self {
        FileRef::new(path)
    }
}

/// Bookmark resolution can run while the database gate is held, so
/// implementations must not call back into the tag store.
pub trait FileIdentityProvider: Send + Sync {
    /// Persistent volume-local identifier for the file at `path`.
    fn file_identifier(&self, path: &Path) -> Option<String>;

    /// Opaque blob that [`resolve_bookmark`](Self::resolve_bookmark) can turn
    /// back into a path later.
    fn create_bookmark(&self, path: &Path) -> Option<Vec<u8>>;

    /// Current location of a bookmarked file, if it can still be found.
    fn resolve_bookmark(&self, bookmark: &[u8]) -> Option<PathBuf>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopIdentity;

impl FileIdentityProvider for NoopIdentity {
    fn file_identifier(&self, _path: &Path) -> Option<String> {
        None
    }

    fn create_bookmark(&self, _path: &Path) -> Option<Vec<u8>> {
        None
    }

    fn resolve_bookmark(&self, _bookmark: &[u8]) -> Option<PathBuf> {
        None
    }
}

/// Provider selected by configuration.
pub fn default_provider(config: &IdentityConfig) -> Arc<dyn FileIdentityProvider> {
    match config.provider {
        IdentityProviderType::None => Arc::new(NoopIdentity),
        IdentityProviderType::Auto => platform_provider(config),
    }
}

#[cfg(unix)]
fn platform_provider(config: &IdentityConfig) -> Arc<dyn FileIdentityProvider> {
    Arc::new(InodeIdentity::new(config.bookmark_search_depth))
}

#[cfg(not(unix))]
fn platform_provider(_config: &IdentityConfig) -> Arc<dyn FileIdentityProvider> {
    Arc::new(NoopIdentity)
}

/// Canonical form of a file reference, ready to be matched against rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedFile {
    pub path: String,
    pub file_name: String,
    pub directory: String,
    pub file_identifier: Option<String>,
    pub bookmark: Option<Vec<u8>>,
}

impl NormalizedFile {
    pub fn new(path: &Path, file_identifier: Option<String>, bookmark: Option<Vec<u8>>) -> Self {
        let (file_name, directory) = location_parts(path);
        Self {
            path: path.to_string_lossy().into_owned(),
            file_name,
            directory,
            file_identifier,
            bookmark,
        }
    }
}

pub fn normalize(file: &FileRef, provider: &dyn FileIdentityProvider) -> NormalizedFile {
    let path = canonical_path(&file.path);
    let file_identifier = file
        .file_identifier
        .clone()
        .or_else(|| provider.file_identifier(&path));
    let bookmark = file.bookmark.clone().or_else(|| provider.create_bookmark(&path));
    NormalizedFile::new(&path, file_identifier, bookmark)
}

/// Absolute path with symlinks resolved. Files that no longer exist cannot be
/// canonicalized, so they fall back to a lexically absolute path.
pub fn canonical_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// `(file_name, directory)` for a path.
pub fn location_parts(path: &Path) -> (String, String) {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let directory = path
        .parent()
        .map(|dir| dir.to_string_lossy().into_owned())
        .unwrap_or_default();
    (file_name, directory)
}
