//! Tags, their associations with images, and the lookups the UI layer runs.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::vtab::array::Array;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::debug;

use super::error::{execute, prepare, Result, SqlResultExt, StoreError};
use super::images::{self, image_from_row, ImageRecord};
use super::{now_timestamp, to_datetime, TagStore};
use crate::identity::{canonical_path, normalize, FileRef, NormalizedFile};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagRecord {
    pub id: i64,
    pub name: String,
    pub color_hex: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Distinct images using the tag; only computed by the listing queries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_count: Option<i64>,
}

/// A file together with its complete tag list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaggedImageRecord {
    pub path: PathBuf,
    /// `None` when the file has no row (pure lookups never create one).
    pub image_id: Option<i64>,
    pub tags: Vec<TagRecord>,
}

const TAG_COLUMNS: &str = "t.id, t.name, t.color_hex, t.created_at, t.updated_at";

const UPSERT_TAG: &str = r#"
    INSERT INTO tags (name, created_at, updated_at) VALUES (?1, ?2, ?2)
    ON CONFLICT(name) DO UPDATE SET updated_at = excluded.updated_at
    RETURNING id
"#;
const LINK: &str =
    "INSERT OR IGNORE INTO image_tags (image_id, tag_id, created_at) VALUES (?1, ?2, ?3)";
const UNLINK: &str = "DELETE FROM image_tags WHERE image_id = ?1 AND tag_id = ?2";
const SELECT_TAG_IDS_FOR_IMAGE: &str = "SELECT tag_id FROM image_tags WHERE image_id = ?1";
const SWEEP_TAGS: &str = r#"
    DELETE FROM tags
    WHERE id IN rarray(?1)
      AND NOT EXISTS (SELECT 1 FROM image_tags WHERE image_tags.tag_id = tags.id)
"#;
const SELECT_TAG_EXISTS: &str = "SELECT 1 FROM tags WHERE id = ?1";
const SELECT_NAME_OWNER: &str = "SELECT id FROM tags WHERE name = ?1 AND id != ?2";
const RENAME_TAG: &str = "UPDATE tags SET name = ?2, updated_at = ?3 WHERE id = ?1";
const SET_COLOR: &str = "UPDATE tags SET color_hex = ?2, updated_at = ?3 WHERE id = ?1";
const DELETE_TAG: &str = "DELETE FROM tags WHERE id = ?1";

pub(crate) fn tag_from_row(row: &Row) -> rusqlite::Result<TagRecord> {
    Ok(TagRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        color_hex: row.get(2)?,
        created_at: to_datetime(row.get(3)?),
        updated_at: to_datetime(row.get(4)?),
        usage_count: None,
    })
}

fn tag_with_count_from_row(row: &Row) -> rusqlite::Result<TagRecord> {
    let mut tag = tag_from_row(row)?;
    tag.usage_count = Some(row.get(5)?);
    Ok(tag)
}

/// Trim, drop empties and de-duplicate case-insensitively, keeping the first
/// spelling seen. Folding is ASCII-only to agree with SQLite's NOCASE.
pub(crate) fn sanitize_names<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .iter()
        .map(|name| name.as_ref().trim())
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(name.to_ascii_lowercase()))
        .map(str::to_string)
        .collect()
}

fn clean_color(color: Option<&str>) -> Option<String> {
    color
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

fn id_array(ids: &[i64]) -> Array {
    Rc::new(ids.iter().copied().map(Value::from).collect())
}

/// Create the tag or refresh its `updated_at`; the stored spelling of an
/// existing tag is kept.
pub(crate) fn upsert_tag(conn: &Connection, name: &str, now: f64) -> Result<i64> {
    let mut stmt = prepare(conn, UPSERT_TAG)?;
    stmt.query_row(params![name, now], |row| row.get(0))
        .on_statement(UPSERT_TAG)
}

fn link(conn: &Connection, image_id: i64, tag_id: i64, now: f64) -> Result<()> {
    execute(conn, LINK, params![image_id, tag_id, now])?;
    Ok(())
}

pub(crate) fn tag_ids_for_image(conn: &Connection, image_id: i64) -> Result<Vec<i64>> {
    let mut stmt = prepare(conn, SELECT_TAG_IDS_FOR_IMAGE)?;
    let rows = stmt
        .query_map([image_id], |row| row.get(0))
        .on_statement(SELECT_TAG_IDS_FOR_IMAGE)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .on_statement(SELECT_TAG_IDS_FOR_IMAGE)
}

/// Delete whichever of `tag_ids` no longer has any association.
pub(crate) fn sweep_orphans(conn: &Connection, tag_ids: &[i64]) -> Result<usize> {
    if tag_ids.is_empty() {
        return Ok(0);
    }
    let removed = execute(conn, SWEEP_TAGS, [id_array(tag_ids)])?;
    if removed > 0 {
        debug!(removed, "Swept orphaned tags");
    }
    Ok(removed)
}

pub(crate) fn tags_for_image_id(conn: &Connection, image_id: i64) -> Result<Vec<TagRecord>> {
    let sql = format!(
        "SELECT {TAG_COLUMNS} FROM image_tags it JOIN tags t ON t.id = it.tag_id \
         WHERE it.image_id = ?1 ORDER BY t.name COLLATE NOCASE, t.id"
    );
    let mut stmt = prepare(conn, &sql)?;
    let rows = stmt.query_map([image_id], tag_from_row).on_statement(&sql)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().on_statement(&sql)
}

pub(crate) fn tag_with_usage(conn: &Connection, tag_id: i64) -> Result<Option<TagRecord>> {
    let sql = format!(
        "SELECT {TAG_COLUMNS}, COUNT(DISTINCT it.image_id) FROM tags t \
         LEFT JOIN image_tags it ON it.tag_id = t.id WHERE t.id = ?1 GROUP BY t.id"
    );
    let mut stmt = prepare(conn, &sql)?;
    stmt.query_row([tag_id], tag_with_count_from_row)
        .optional()
        .on_statement(&sql)
}

fn tag_exists(conn: &Connection, tag_id: i64) -> Result<bool> {
    let mut stmt = prepare(conn, SELECT_TAG_EXISTS)?;
    let found = stmt
        .query_row([tag_id], |_| Ok(()))
        .optional()
        .on_statement(SELECT_TAG_EXISTS)?;
    Ok(found.is_some())
}

// Escape LIKE wildcards so a prefix is matched literally.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

impl TagStore {
    fn normalize_all(&self, files: &[FileRef]) -> Vec<NormalizedFile> {
        files
            .iter()
            .map(|file| normalize(file, self.identity.as_ref()))
            .collect()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Every tag with its usage count, most used first, then by name.
    pub fn list_tags(&self) -> Result<Vec<TagRecord>> {
        let sql = format!(
            "SELECT {TAG_COLUMNS}, COUNT(DISTINCT it.image_id) AS usage_count FROM tags t \
             LEFT JOIN image_tags it ON it.tag_id = t.id GROUP BY t.id \
             ORDER BY usage_count DESC, t.name COLLATE NOCASE ASC"
        );
        self.db.perform(|conn| {
            let mut stmt = prepare(conn, &sql)?;
            let rows = stmt.query_map([], tag_with_count_from_row).on_statement(&sql)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().on_statement(&sql)
        })
    }

    pub fn tags_for_image(&self, path: impl AsRef<Path>) -> Result<Vec<TagRecord>> {
        let path = path.as_ref().to_path_buf();
        let mut found = self.tags_for_images(std::slice::from_ref(&path))?;
        Ok(found.remove(&path).unwrap_or_default())
    }

    /// Tags for a batch of paths in one query. Every requested path gets an
    /// entry; files without a row map to an empty list.
    pub fn tags_for_images<P: AsRef<Path>>(
        &self,
        paths: &[P],
    ) -> Result<HashMap<PathBuf, Vec<TagRecord>>> {
        let mut requested: HashMap<String, Vec<PathBuf>> = HashMap::new();
        let mut result = HashMap::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let key = canonical_path(path).to_string_lossy().into_owned();
            requested.entry(key).or_default().push(path.to_path_buf());
            result.insert(path.to_path_buf(), Vec::new());
        }
        if requested.is_empty() {
            return Ok(result);
        }

        let keys: Array = Rc::new(requested.keys().cloned().map(Value::from).collect());
        let sql = format!(
            "SELECT i.path, {TAG_COLUMNS} FROM images i \
             JOIN image_tags it ON it.image_id = i.id \
             JOIN tags t ON t.id = it.tag_id \
             WHERE i.path IN rarray(?1) \
             ORDER BY i.path, t.name COLLATE NOCASE, t.id"
        );
        let rows: Vec<(String, TagRecord)> = self.db.perform(|conn| {
            let mut stmt = prepare(conn, &sql)?;
            let rows = stmt
                .query_map([keys], |row| {
                    let path: String = row.get(0)?;
                    let tag = TagRecord {
                        id: row.get(1)?,
                        name: row.get(2)?,
                        color_hex: row.get(3)?,
                        created_at: to_datetime(row.get(4)?),
                        updated_at: to_datetime(row.get(5)?),
                        usage_count: None,
                    };
                    Ok((path, tag))
                })
                .on_statement(&sql)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().on_statement(&sql)
        })?;

        for (stored, tag) in rows {
            for original in requested.get(&stored).into_iter().flatten() {
                if let Some(tags) = result.get_mut(original) {
                    tags.push(tag.clone());
                }
            }
        }
        Ok(result)
    }

    /// Exact, case-insensitive lookup by name.
    pub fn find_tag(&self, name: &str) -> Result<Option<TagRecord>> {
        let name = name.trim().to_string();
        let sql = format!(
            "SELECT {TAG_COLUMNS}, COUNT(DISTINCT it.image_id) FROM tags t \
             LEFT JOIN image_tags it ON it.tag_id = t.id WHERE t.name = ?1 GROUP BY t.id"
        );
        self.db.perform(|conn| {
            let mut stmt = prepare(conn, &sql)?;
            stmt.query_row([&name], tag_with_count_from_row)
                .optional()
                .on_statement(&sql)
        })
    }

    /// Tags whose name starts with `prefix`, for autocompletion.
    pub fn search_tags(&self, prefix: &str, limit: usize) -> Result<Vec<TagRecord>> {
        let pattern = like_prefix(prefix.trim());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {TAG_COLUMNS}, COUNT(DISTINCT it.image_id) FROM tags t \
             LEFT JOIN image_tags it ON it.tag_id = t.id \
             WHERE t.name LIKE ?1 ESCAPE '\\' GROUP BY t.id \
             ORDER BY t.name COLLATE NOCASE LIMIT ?2"
        );
        self.db.perform(|conn| {
            let mut stmt = prepare(conn, &sql)?;
            let rows = stmt
                .query_map(params![pattern, limit], tag_with_count_from_row)
                .on_statement(&sql)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().on_statement(&sql)
        })
    }

    pub fn images_with_tag(&self, tag_id: i64) -> Result<Vec<ImageRecord>> {
        const SQL: &str = r#"
            SELECT i.id, i.path, i.file_name, i.directory, i.file_identifier, i.bookmark,
                   i.created_at, i.updated_at
            FROM images i JOIN image_tags it ON it.image_id = i.id
            WHERE it.tag_id = ?1
            ORDER BY i.path
        "#;
        self.db.perform(|conn| {
            let mut stmt = prepare(conn, SQL)?;
            let rows = stmt.query_map([tag_id], image_from_row).on_statement(SQL)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().on_statement(SQL)
        })
    }

    /// The row for `file`, following renames and moves. Never creates a row.
    pub fn image(&self, file: &FileRef) -> Result<Option<ImageRecord>> {
        let normalized = normalize(file, self.identity.as_ref());
        let now = now_timestamp();
        self.db.transact(|tx| {
            match images::resolve(tx, &normalized, false, now)? {
                Some(resolution) => images::image_by_id(tx, resolution.image_id),
                None => Ok(None),
            }
        })
    }

    // ========================================================================
    // Assignment
    // ========================================================================

    /// Attach `names` to every file and return each file's full tag list.
    ///
    /// With no usable names this is a pure lookup: no rows are created and
    /// unknown files come back with `image_id: None`.
    pub fn assign_tags<S: AsRef<str>>(
        &self,
        files: &[FileRef],
        names: &[S],
    ) -> Result<Vec<TaggedImageRecord>> {
        // Tags are only created alongside an association.
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let names = sanitize_names(names);
        let normalized = self.normalize_all(files);
        let now = now_timestamp();

        self.db.transact(|tx| {
            let tag_ids = names
                .iter()
                .map(|name| upsert_tag(tx, name, now))
                .collect::<Result<Vec<_>>>()?;
            let create = !tag_ids.is_empty();

            let mut tagged = Vec::with_capacity(normalized.len());
            for file in &normalized {
                let image_id = images::resolve(tx, file, create, now)?.map(|r| r.image_id);
                let tags = match image_id {
                    Some(image_id) => {
                        for &tag_id in &tag_ids {
                            link(tx, image_id, tag_id, now)?;
                        }
                        tags_for_image_id(tx, image_id)?
                    }
                    None => Vec::new(),
                };
                tagged.push(TaggedImageRecord {
                    path: PathBuf::from(&file.path),
                    image_id,
                    tags,
                });
            }
            debug!(files = tagged.len(), tags = tag_ids.len(), "Assigned tags");
            Ok(tagged)
        })
    }

    /// Detach one tag from one file; the tag is deleted if nothing else uses
    /// it. Returns the file's remaining tags.
    pub fn remove_tag(&self, file: &FileRef, tag_id: i64) -> Result<Vec<TagRecord>> {
        let normalized = normalize(file, self.identity.as_ref());
        let now = now_timestamp();

        self.db.transact(|tx| {
            let Some(resolution) = images::resolve(tx, &normalized, false, now)? else {
                return Ok(Vec::new());
            };
            execute(tx, UNLINK, params![resolution.image_id, tag_id])?;
            sweep_orphans(tx, &[tag_id])?;
            tags_for_image_id(tx, resolution.image_id)
        })
    }

    // ========================================================================
    // Tag edits
    // ========================================================================

    pub fn rename_tag(&self, tag_id: i64, name: &str) -> Result<TagRecord> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(StoreError::InvalidName);
        }
        let now = now_timestamp();

        self.db.transact(|tx| {
            if !tag_exists(tx, tag_id)? {
                return Err(StoreError::TagNotFound(tag_id));
            }
            let owner: Option<i64> = {
                let mut stmt = prepare(tx, SELECT_NAME_OWNER)?;
                stmt.query_row(params![name, tag_id], |row| row.get(0))
                    .optional()
                    .on_statement(SELECT_NAME_OWNER)?
            };
            if owner.is_some() {
                return Err(StoreError::DuplicateName(name.clone()));
            }
            execute(tx, RENAME_TAG, params![tag_id, name, now])?;
            tag_with_usage(tx, tag_id)?.ok_or(StoreError::TagNotFound(tag_id))
        })
    }

    /// Set or clear (`None` or blank) a tag's color. Returns rows updated.
    pub fn set_tag_color(&self, tag_id: i64, color: Option<&str>) -> Result<usize> {
        self.set_tags_color(&[tag_id], color)
    }

    pub fn set_tags_color(&self, tag_ids: &[i64], color: Option<&str>) -> Result<usize> {
        let color = clean_color(color);
        let now = now_timestamp();

        self.db.transact(|tx| {
            let mut stmt = prepare(tx, SET_COLOR)?;
            let mut updated = 0;
            for &tag_id in tag_ids {
                updated += stmt
                    .execute(params![tag_id, color, now])
                    .on_statement(SET_COLOR)?;
            }
            Ok(updated)
        })
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    pub fn delete_tag(&self, tag_id: i64) -> Result<bool> {
        Ok(self.delete_tags(&[tag_id])? > 0)
    }

    /// Delete tags and, through the cascade, their associations.
    pub fn delete_tags(&self, tag_ids: &[i64]) -> Result<usize> {
        self.db.transact(|tx| {
            let mut stmt = prepare(tx, DELETE_TAG)?;
            let mut deleted = 0;
            for &tag_id in tag_ids {
                deleted += stmt.execute([tag_id]).on_statement(DELETE_TAG)?;
            }
            Ok(deleted)
        })
    }

    /// Forget a file. Tags it was the last user of go with it.
    pub fn delete_image(&self, file: &FileRef) -> Result<bool> {
        let normalized = normalize(file, self.identity.as_ref());
        let now = now_timestamp();

        self.db.transact(|tx| {
            let Some(resolution) = images::resolve(tx, &normalized, false, now)? else {
                return Ok(false);
            };
            let tag_ids = tag_ids_for_image(tx, resolution.image_id)?;
            let removed = images::delete_image(tx, resolution.image_id)?;
            sweep_orphans(tx, &tag_ids)?;
            Ok(removed)
        })
    }

    // ========================================================================
    // Locations
    // ========================================================================

    /// Re-resolve files believed to be live without creating rows. Returns how
    /// many rows were found through their identifier or bookmark and had their
    /// location rewritten.
    pub fn reconcile(&self, files: &[FileRef]) -> Result<usize> {
        let normalized = self.normalize_all(files);
        let now = now_timestamp();

        self.db.transact(|tx| {
            let mut relocated = 0;
            for file in &normalized {
                if let Some(resolution) = images::resolve(tx, file, false, now)? {
                    if resolution.relocated() {
                        relocated += 1;
                    }
                }
            }
            Ok(relocated)
        })
    }
}
