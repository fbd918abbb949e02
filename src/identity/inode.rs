//! Inode-backed identity for Unix filesystems.
//!
//! The identifier is `"<device>:<inode>"`. The bookmark records the path along
//! with device and inode; resolving it re-checks the recorded path and then
//! walks the nearest surviving ancestor directory looking for the same inode.
//! Inodes can be reused after deletion, so a match is a strong hint, not proof.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use super::FileIdentityProvider;

#[derive(Debug, Serialize, Deserialize)]
struct InodeBookmark {
    path: PathBuf,
    device: u64,
    inode: u64,
}

#[derive(Debug, Clone)]
pub struct InodeIdentity {
    search_depth: usize,
}

impl InodeIdentity {
    /// `search_depth` bounds both how far up the recorded path we look for a
    /// surviving directory and how deep we walk below it.
    pub fn new(search_depth: usize) -> Self {
        Self {
            search_depth: search_depth.max(1),
        }
    }

    fn search(&self, bookmark: &InodeBookmark) -> Option<PathBuf> {
        let root = bookmark
            .path
            .ancestors()
            .skip(1)
            .take(self.search_depth)
            .find(|dir| dir.is_dir())?;

        WalkDir::new(root)
            .follow_links(false)
            .max_depth(self.search_depth)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|entry| entry.file_type().is_file())
            .find(|entry| {
                entry
                    .metadata()
                    .map(|m| m.dev() == bookmark.device && m.ino() == bookmark.inode)
                    .unwrap_or(false)
            })
            .map(|entry| entry.into_path())
    }
}

impl Default for InodeIdentity {
    fn default() -> Self {
        Self::new(2)
    }
}

fn file_key(path: &Path) -> Option<(u64, u64)> {
    fs::metadata(path)
        .ok()
        .filter(|m| m.is_file())
        .map(|m| (m.dev(), m.ino()))
}

impl FileIdentityProvider for InodeIdentity {
    fn file_identifier(&self, path: &Path) -> Option<String> {
        let (device, inode) = file_key(path)?;
        Some(format!("{device}:{inode}"))
    }

    fn create_bookmark(&self, path: &Path) -> Option<Vec<u8>> {
        let (device, inode) = file_key(path)?;
        let bookmark = InodeBookmark {
            path: path.to_path_buf(),
            device,
            inode,
        };
        serde_json::to_vec(&bookmark).ok()
    }

    fn resolve_bookmark(&self, bookmark: &[u8]) -> Option<PathBuf> {
        let bookmark: InodeBookmark = serde_json::from_slice(bookmark).ok()?;
        if file_key(&bookmark.path) == Some((bookmark.device, bookmark.inode)) {
            return Some(bookmark.path);
        }
        let found = self.search(&bookmark);
        debug!(original = ?bookmark.path, found = ?found, "Searched for bookmarked file");
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_identifier_survives_rename() {
        let dir = tempdir().unwrap();
        let before = dir.path().join("photo.jpg");
        fs::write(&before, b"jpeg").unwrap();
        let identity = InodeIdentity::default();
        let id_before = identity.file_identifier(&before).unwrap();

        let after = dir.path().join("renamed.jpg");
        fs::rename(&before, &after).unwrap();

        assert_eq!(identity.file_identifier(&after).unwrap(), id_before);
        assert_eq!(identity.file_identifier(&before), None);
    }

    #[test]
    fn test_bookmark_follows_move_into_subdirectory() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("album").join("photo.jpg");
        fs::create_dir_all(original.parent().unwrap()).unwrap();
        fs::write(&original, b"jpeg").unwrap();
        let identity = InodeIdentity::new(2);
        let bookmark = identity.create_bookmark(&original).unwrap();

        let moved = dir.path().join("album").join("2024").join("photo-1.jpg");
        fs::create_dir_all(moved.parent().unwrap()).unwrap();
        fs::rename(&original, &moved).unwrap();

        let resolved = identity.resolve_bookmark(&bookmark).unwrap();
        assert_eq!(
            fs::canonicalize(resolved).unwrap(),
            fs::canonicalize(&moved).unwrap()
        );
    }

    #[test]
    fn test_bookmark_for_deleted_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.jpg");
        fs::write(&path, b"jpeg").unwrap();
        let identity = InodeIdentity::default();
        let bookmark = identity.create_bookmark(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(identity.resolve_bookmark(&bookmark), None);
        assert_eq!(identity.resolve_bookmark(b"not json"), None);
    }
}
