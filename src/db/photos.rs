use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::PathBuf;

use super::Database;
use crate::error::Result;
use crate::records::ChildKind;

/// A materialized attachment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhotoAttachment {
    pub id: i64,
    pub subject: String,
    pub parent_global_id: String,
    pub layer: ChildKind,
    /// Object id of the child feature the attachment hangs off.
    pub object_id: i64,
    pub attachment_id: i64,
    pub filename: String,
    pub local_path: PathBuf,
    pub content_type: Option<String>,
    pub size_bytes: Option<i64>,
    pub downloaded_at: DateTime<Utc>,
}

const PHOTO_COLUMNS: &str = "id, subject, parent_global_id, layer, object_id, attachment_id, \
    filename, local_path, content_type, size_bytes, downloaded_at";

fn photo_from_row(row: &Row) -> rusqlite::Result<PhotoAttachment> {
    let layer: String = row.get(3)?;
    let layer = ChildKind::from_str(&layer).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(3, Type::Text, format!("unknown layer '{}'", layer).into())
    })?;
    let local_path: String = row.get(7)?;

    Ok(PhotoAttachment {
        id: row.get(0)?,
        subject: row.get(1)?,
        parent_global_id: row.get(2)?,
        layer,
        object_id: row.get(4)?,
        attachment_id: row.get(5)?,
        filename: row.get(6)?,
        local_path: PathBuf::from(local_path),
        content_type: row.get(8)?,
        size_bytes: row.get(9)?,
        downloaded_at: row.get(10)?,
    })
}

pub(crate) fn photos_for_parent(conn: &Connection, subject: &str, parent_global_id: &str) -> Result<Vec<PhotoAttachment>> {
    let sql = format!(
        "SELECT {} FROM photo_attachments WHERE subject = ?1 AND parent_global_id = ?2 \
         ORDER BY layer, object_id, filename",
        PHOTO_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let photos = stmt
        .query_map([subject, parent_global_id], photo_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(photos)
}

fn find(conn: &Connection, subject: &str, parent_global_id: &str, layer: ChildKind, filename: &str) -> Result<Option<PhotoAttachment>> {
    let sql = format!(
        "SELECT {} FROM photo_attachments \
         WHERE subject = ?1 AND parent_global_id = ?2 AND layer = ?3 AND filename = ?4",
        PHOTO_COLUMNS
    );
    let photo = conn
        .query_row(&sql, params![subject, parent_global_id, layer.as_str(), filename], photo_from_row)
        .optional()?;
    Ok(photo)
}

impl Database {
    /// Record a completed download. Re-recording the same key refreshes the
    /// location and timestamp; rows are never removed.
    pub fn record_photo(&self, photo: &PhotoAttachment) -> Result<PhotoAttachment> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO photo_attachments (
                subject, parent_global_id, layer, object_id, attachment_id,
                filename, local_path, content_type, size_bytes, downloaded_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(subject, parent_global_id, layer, filename) DO UPDATE SET
                object_id = excluded.object_id,
                attachment_id = excluded.attachment_id,
                local_path = excluded.local_path,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                downloaded_at = excluded.downloaded_at
            "#,
            params![
                photo.subject,
                photo.parent_global_id,
                photo.layer.as_str(),
                photo.object_id,
                photo.attachment_id,
                photo.filename,
                photo.local_path.to_string_lossy(),
                photo.content_type,
                photo.size_bytes,
                photo.downloaded_at,
            ],
        )?;

        find(&conn, &photo.subject, &photo.parent_global_id, photo.layer, &photo.filename)?
            .ok_or(crate::error::SyncError::Store(rusqlite::Error::QueryReturnedNoRows))
    }

    pub fn find_photo(&self, subject: &str, parent_global_id: &str, layer: ChildKind, filename: &str) -> Result<Option<PhotoAttachment>> {
        let conn = self.conn();
        find(&conn, subject, parent_global_id, layer, filename)
    }

    pub fn photos_for_parent(&self, subject: &str, parent_global_id: &str) -> Result<Vec<PhotoAttachment>> {
        let conn = self.conn();
        photos_for_parent(&conn, subject, parent_global_id)
    }

    pub fn count_photos(&self, subject: &str) -> Result<i64> {
        let conn = self.conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM photo_attachments WHERE subject = ?1",
            [subject],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;

    fn photo(filename: &str, attachment_id: i64) -> PhotoAttachment {
        PhotoAttachment {
            id: 0,
            subject: "S1".to_string(),
            parent_global_id: "G1".to_string(),
            layer: ChildKind::Description,
            object_id: 5,
            attachment_id,
            filename: filename.to_string(),
            local_path: PathBuf::from(format!("/tmp/S1/G1/{}", filename)),
            content_type: Some("image/jpeg".to_string()),
            size_bytes: Some(10),
            downloaded_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_and_find_photo() {
        let (_dir, db) = temp_db();
        let stored = db.record_photo(&photo("a.jpg", 1)).unwrap();
        assert!(stored.id > 0);

        let found = db
            .find_photo("S1", "G1", ChildKind::Description, "a.jpg")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, stored.id);
        assert!(db.find_photo("S1", "G1", ChildKind::Fact, "a.jpg").unwrap().is_none());
    }

    #[test]
    fn test_record_photo_is_keyed_by_filename() {
        let (_dir, db) = temp_db();
        let first = db.record_photo(&photo("a.jpg", 1)).unwrap();
        let again = db.record_photo(&photo("a.jpg", 9)).unwrap();
        db.record_photo(&photo("b.jpg", 2)).unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(again.attachment_id, 9);
        assert_eq!(db.count_photos("S1").unwrap(), 2);
        assert_eq!(db.photos_for_parent("S1", "G1").unwrap().len(), 2);
    }
}
