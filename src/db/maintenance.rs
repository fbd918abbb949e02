//! Multi-step maintenance: merging tags, purging unused ones, and checking
//! image rows against the filesystem.

use std::path::Path;

use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{info, warn};

use super::error::{execute, Result, StoreError};
use super::images::{self, ImageRecord};
use super::tags::{self, TagRecord};
use super::{now_timestamp, TagStore};
use crate::identity::{canonical_path, NormalizedFile};

const COPY_ASSOCIATIONS: &str = r#"
    INSERT INTO image_tags (image_id, tag_id, created_at)
    SELECT image_id, ?2, created_at FROM image_tags WHERE tag_id = ?1
    ON CONFLICT(image_id, tag_id)
    DO UPDATE SET created_at = MIN(image_tags.created_at, excluded.created_at)
"#;
const DELETE_ASSOCIATIONS: &str = "DELETE FROM image_tags WHERE tag_id = ?1";
const DELETE_TAG: &str = "DELETE FROM tags WHERE id = ?1";
const PURGE_UNUSED: &str = r#"
    DELETE FROM tags
    WHERE NOT EXISTS (SELECT 1 FROM image_tags WHERE image_tags.tag_id = tags.id)
"#;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InspectionSummary {
    pub checked_count: usize,
    pub recovered_count: usize,
    pub removed_count: usize,
    /// Stored paths of rows whose file could not be found.
    pub missing_paths: Vec<String>,
}

fn purge(conn: &Connection) -> Result<usize> {
    execute(conn, PURGE_UNUSED, [])
}

/// Move every association of `source` onto `target` and drop `source`. An
/// image carrying both keeps the earlier association time.
fn fold_into(conn: &Connection, source: i64, target: i64) -> Result<()> {
    execute(conn, COPY_ASSOCIATIONS, params![source, target])?;
    execute(conn, DELETE_ASSOCIATIONS, [source])?;
    execute(conn, DELETE_TAG, [source])?;
    Ok(())
}

impl TagStore {
    /// Fold `source_ids` into the tag named `target_name`, creating it if
    /// needed. Unknown source ids are ignored. Returns the target with its
    /// usage count.
    pub fn merge_tags(&self, source_ids: &[i64], target_name: &str) -> Result<TagRecord> {
        let target_name = target_name.trim().to_string();
        if target_name.is_empty() {
            return Err(StoreError::InvalidName);
        }
        let now = now_timestamp();

        let merged = self.db.transact(|tx| {
            let target = tags::upsert_tag(tx, &target_name, now)?;
            let mut folded = Vec::new();
            for &source in source_ids {
                if source == target || folded.contains(&source) {
                    continue;
                }
                fold_into(tx, source, target)?;
                folded.push(source);
            }
            tags::tag_with_usage(tx, target)?.ok_or(StoreError::TagNotFound(target))
        })?;

        info!(
            target = %merged.name,
            sources = source_ids.len(),
            usage = merged.usage_count.unwrap_or(0),
            "Merged tags"
        );
        Ok(merged)
    }

    /// Delete every tag with no associations. Returns how many went.
    pub fn purge_unused_tags(&self) -> Result<usize> {
        let purged = self.db.transact(|tx| purge(tx))?;
        info!(purged, "Purged unused tags");
        Ok(purged)
    }

    /// Check every image row against the filesystem, following bookmarks for
    /// files that moved. With `remove_missing`, rows that cannot be found are
    /// deleted along with tags they leave unused.
    ///
    /// Runs as a single transaction, so no other operation can change the
    /// rows while they are being checked.
    pub fn inspect_images(&self, remove_missing: bool) -> Result<InspectionSummary> {
        let now = now_timestamp();
        let summary = self.db.transact(|tx| {
            let rows = images::all_images(tx)?;
            let mut summary = InspectionSummary {
                checked_count: rows.len(),
                ..Default::default()
            };

            for row in rows {
                if Path::new(&row.path).exists() {
                    continue;
                }
                if let Some(file) = self.recover(&row) {
                    match images::path_owner(tx, &file.path)? {
                        Some(owner) if owner != row.id => {
                            warn!(
                                stored = %row.path,
                                found = %file.path,
                                owner,
                                "Bookmark points at a file another row already tracks"
                            );
                        }
                        _ => {
                            images::update_location(tx, row.id, &file, now)?;
                            summary.recovered_count += 1;
                            continue;
                        }
                    }
                }

                if remove_missing {
                    let tag_ids = tags::tag_ids_for_image(tx, row.id)?;
                    if images::delete_image(tx, row.id)? {
                        summary.removed_count += 1;
                    }
                    tags::sweep_orphans(tx, &tag_ids)?;
                }
                summary.missing_paths.push(row.path);
            }
            Ok(summary)
        })?;

        info!(
            checked = summary.checked_count,
            recovered = summary.recovered_count,
            removed = summary.removed_count,
            missing = summary.missing_paths.len(),
            "Inspected images"
        );
        Ok(summary)
    }

    /// Where the row's bookmark now points, if that file exists.
    fn recover(&self, row: &ImageRecord) -> Option<NormalizedFile> {
        let bookmark = row.bookmark.as_deref()?;
        let found = self.identity.resolve_bookmark(bookmark)?;
        if !found.exists() {
            return None;
        }
        let path = canonical_path(&found);
        let identifier = self.identity.file_identifier(&path);
        let bookmark = self.identity.create_bookmark(&path);
        Some(NormalizedFile::new(&path, identifier, bookmark))
    }
}
