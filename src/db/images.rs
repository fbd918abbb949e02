//! Image rows and the resolution that keeps them attached to their files.
//!
//! Resolution tries, in order: exact path, file identifier (rename or move on
//! the same volume), bookmark (relocation across restarts). Whichever tier
//! hits, the row is rewritten with the fresh location so the next lookup is a
//! cheap path match again.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use serde::Serialize;
use tracing::debug;

use super::error::{execute, prepare, Result, SqlResultExt};
use super::to_datetime;
use crate::identity::NormalizedFile;

const SELECT_ID_BY_PATH: &str = "SELECT id FROM images WHERE path = ?1";
const SELECT_ID_BY_IDENTIFIER: &str =
    "SELECT id FROM images WHERE file_identifier = ?1 ORDER BY updated_at DESC LIMIT 1";
const SELECT_ID_BY_BOOKMARK: &str =
    "SELECT id FROM images WHERE bookmark = ?1 ORDER BY updated_at DESC LIMIT 1";
const UPDATE_LOCATION: &str = r#"
    UPDATE images
    SET path = ?2, file_name = ?3, directory = ?4,
        file_identifier = COALESCE(?5, file_identifier),
        bookmark = COALESCE(?6, bookmark),
        updated_at = ?7
    WHERE id = ?1
"#;
const INSERT_IMAGE: &str = r#"
    INSERT INTO images (path, file_name, directory, file_identifier, bookmark, created_at, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
"#;
const SELECT_IMAGE_BY_ID: &str = r#"
    SELECT id, path, file_name, directory, file_identifier, bookmark, created_at, updated_at
    FROM images WHERE id = ?1
"#;
const SELECT_ALL_IMAGES: &str = r#"
    SELECT id, path, file_name, directory, file_identifier, bookmark, created_at, updated_at
    FROM images ORDER BY id
"#;
const DELETE_IMAGE: &str = "DELETE FROM images WHERE id = ?1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRecord {
    pub id: i64,
    pub path: String,
    pub file_name: String,
    pub directory: String,
    pub file_identifier: Option<String>,
    #[serde(skip)]
    pub bookmark: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Which resolution tier found the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchTier {
    Path,
    Identifier,
    Bookmark,
    Created,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub image_id: i64,
    pub tier: MatchTier,
}

impl Resolution {
    /// True when the row was found somewhere other than its stored path.
    pub fn relocated(&self) -> bool {
        matches!(self.tier, MatchTier::Identifier | MatchTier::Bookmark)
    }
}

pub(crate) fn image_from_row(row: &Row) -> rusqlite::Result<ImageRecord> {
    Ok(ImageRecord {
        id: row.get(0)?,
        path: row.get(1)?,
        file_name: row.get(2)?,
        directory: row.get(3)?,
        file_identifier: row.get(4)?,
        bookmark: row.get(5)?,
        created_at: to_datetime(row.get(6)?),
        updated_at: to_datetime(row.get(7)?),
    })
}

fn find_id(conn: &Connection, sql: &str, value: &dyn ToSql) -> Result<Option<i64>> {
    let mut stmt = prepare(conn, sql)?;
    stmt.query_row([value], |row| row.get(0))
        .optional()
        .on_statement(sql)
}

/// Find the row for `file`, refreshing its location on a hit. With `create`,
/// a file no tier recognises gets a new row; without it the answer is `None`.
pub(crate) fn resolve(
    conn: &Connection,
    file: &NormalizedFile,
    create: bool,
    now: f64,
) -> Result<Option<Resolution>> {
    let mut matched = find_id(conn, SELECT_ID_BY_PATH, &file.path)?.map(|id| (id, MatchTier::Path));

    if matched.is_none() {
        if let Some(identifier) = &file.file_identifier {
            matched = find_id(conn, SELECT_ID_BY_IDENTIFIER, identifier)?
                .map(|id| (id, MatchTier::Identifier));
        }
    }
    if matched.is_none() {
        if let Some(bookmark) = &file.bookmark {
            matched = find_id(conn, SELECT_ID_BY_BOOKMARK, bookmark)?
                .map(|id| (id, MatchTier::Bookmark));
        }
    }

    match matched {
        Some((image_id, tier)) => {
            update_location(conn, image_id, file, now)?;
            if tier != MatchTier::Path {
                debug!(image_id, ?tier, path = %file.path, "Relocated image record");
            }
            Ok(Some(Resolution { image_id, tier }))
        }
        None if create => {
            execute(
                conn,
                INSERT_IMAGE,
                params![
                    file.path,
                    file.file_name,
                    file.directory,
                    file.file_identifier,
                    file.bookmark,
                    now
                ],
            )?;
            Ok(Some(Resolution {
                image_id: conn.last_insert_rowid(),
                tier: MatchTier::Created,
            }))
        }
        None => Ok(None),
    }
}

/// Rewrite a row's location. Absent identifier/bookmark keep the stored ones.
pub(crate) fn update_location(
    conn: &Connection,
    image_id: i64,
    file: &NormalizedFile,
    now: f64,
) -> Result<usize> {
    execute(
        conn,
        UPDATE_LOCATION,
        params![
            image_id,
            file.path,
            file.file_name,
            file.directory,
            file.file_identifier,
            file.bookmark,
            now
        ],
    )
}

pub(crate) fn image_by_id(conn: &Connection, image_id: i64) -> Result<Option<ImageRecord>> {
    let mut stmt = prepare(conn, SELECT_IMAGE_BY_ID)?;
    stmt.query_row([image_id], image_from_row)
        .optional()
        .on_statement(SELECT_IMAGE_BY_ID)
}

pub(crate) fn all_images(conn: &Connection) -> Result<Vec<ImageRecord>> {
    let mut stmt = prepare(conn, SELECT_ALL_IMAGES)?;
    let rows = stmt
        .query_map([], image_from_row)
        .on_statement(SELECT_ALL_IMAGES)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .on_statement(SELECT_ALL_IMAGES)
}

pub(crate) fn delete_image(conn: &Connection, image_id: i64) -> Result<bool> {
    Ok(execute(conn, DELETE_IMAGE, [image_id])? > 0)
}

pub(crate) fn path_owner(conn: &Connection, path: &str) -> Result<Option<i64>> {
    find_id(conn, SELECT_ID_BY_PATH, &path)
}
