//! Parent and child record storage, including the reconciliation pass.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

use super::Database;
use crate::error::Result;
use crate::records::{
    ChildFields, ChildKind, ChildRecord, DescriptionFields, FactFields, ParentFields, ParentRecord,
};

/// A parent as stored locally.
#[derive(Debug, Clone, Serialize)]
pub struct StoredParent {
    pub fields: ParentFields,
    /// Subject whose sync last rewrote the row; membership is tracked separately.
    pub subject: String,
    pub fingerprint: String,
    pub synced_at: DateTime<Utc>,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFingerprint {
    pub fingerprint: String,
    pub deleted: bool,
}

/// A changed parent with its complete, freshly fetched children.
#[derive(Debug, Clone)]
pub struct ParentUpdate {
    pub parent: ParentRecord,
    pub children: Vec<ChildRecord>,
}

/// Everything one sync pass learned about a subject.
#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    /// Every global id the remote returned for the subject.
    pub seen: HashSet<String>,
    pub changed: Vec<ParentUpdate>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub written: usize,
    pub unchanged: usize,
    pub deleted: usize,
}

pub(crate) const PARENT_COLUMNS: &str = "p.global_id, p.object_id, p.subject, p.code, p.alt_code, \
    p.supervisor, p.site_component, p.component_type, p.activity, p.reference_installation, \
    p.surveyed_at, p.edited_at, p.longitude, p.latitude, p.extra, p.fingerprint, p.synced_at, p.deleted";

fn json_map(row: &Row, idx: usize) -> rusqlite::Result<Map<String, Value>> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Map a row selected with [`PARENT_COLUMNS`].
pub(crate) fn parent_from_row(row: &Row) -> rusqlite::Result<StoredParent> {
    Ok(StoredParent {
        fields: ParentFields {
            global_id: row.get(0)?,
            object_id: row.get(1)?,
            code: row.get(3)?,
            alt_code: row.get(4)?,
            supervisor: row.get(5)?,
            site_component: row.get(6)?,
            component_type: row.get(7)?,
            activity: row.get(8)?,
            reference_installation: row.get(9)?,
            surveyed_at: row.get(10)?,
            edited_at: row.get(11)?,
            longitude: row.get(12)?,
            latitude: row.get(13)?,
            extra: json_map(row, 14)?,
        },
        subject: row.get(2)?,
        fingerprint: row.get(15)?,
        synced_at: row.get(16)?,
        deleted: row.get(17)?,
    })
}

/// Children of one parent from one layer, in object id order.
pub(crate) fn children_of(conn: &Connection, kind: ChildKind, parent_global_id: &str) -> Result<Vec<ChildFields>> {
    let sql = format!(
        "SELECT object_id, global_id, parent_global_id, {}, extra FROM {} \
         WHERE parent_global_id = ?1 ORDER BY object_id",
        kind.text_column(),
        kind.table()
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let children = stmt
        .query_map([parent_global_id], |row| {
            let object_id: i64 = row.get(0)?;
            let global_id: Option<String> = row.get(1)?;
            let parent_global_id: String = row.get(2)?;
            let text: Option<String> = row.get(3)?;
            let extra = json_map(row, 4)?;
            Ok(match kind {
                ChildKind::Description => ChildFields::Description(DescriptionFields {
                    object_id,
                    global_id,
                    parent_global_id,
                    description: text,
                    extra,
                }),
                ChildKind::Fact => ChildFields::Fact(FactFields {
                    object_id,
                    global_id,
                    parent_global_id,
                    fact: text,
                    extra,
                }),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(children)
}

/// Insert or update a parent's content. Returns whether a write happened: an
/// existing row is left alone when its fingerprint matches and it is live.
fn upsert_parent(tx: &Transaction, subject: &str, parent: &ParentRecord, now: DateTime<Utc>) -> Result<bool> {
    let f = &parent.fields;
    let changed = tx.execute(
        r#"
        INSERT INTO parent_records (
            global_id, object_id, subject, code, alt_code, supervisor, site_component,
            component_type, activity, reference_installation, surveyed_at, edited_at,
            longitude, latitude, extra, raw, fingerprint, synced_at, deleted
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, 0)
        ON CONFLICT(global_id) DO UPDATE SET
            object_id = excluded.object_id,
            subject = excluded.subject,
            code = excluded.code,
            alt_code = excluded.alt_code,
            supervisor = excluded.supervisor,
            site_component = excluded.site_component,
            component_type = excluded.component_type,
            activity = excluded.activity,
            reference_installation = excluded.reference_installation,
            surveyed_at = excluded.surveyed_at,
            edited_at = excluded.edited_at,
            longitude = excluded.longitude,
            latitude = excluded.latitude,
            extra = excluded.extra,
            raw = excluded.raw,
            fingerprint = excluded.fingerprint,
            synced_at = excluded.synced_at,
            deleted = 0
        WHERE parent_records.fingerprint <> excluded.fingerprint
           OR parent_records.deleted = 1
        "#,
        params![
            f.global_id,
            f.object_id,
            subject,
            f.code,
            f.alt_code,
            f.supervisor,
            f.site_component,
            f.component_type,
            f.activity,
            f.reference_installation,
            f.surveyed_at,
            f.edited_at,
            f.longitude,
            f.latitude,
            serde_json::to_string(&f.extra)?,
            parent.raw,
            parent.fingerprint,
            now,
        ],
    )?;
    Ok(changed > 0)
}

fn replace_children(tx: &Transaction, parent_global_id: &str, children: &[ChildRecord]) -> Result<()> {
    for kind in ChildKind::ALL {
        tx.execute(
            &format!("DELETE FROM {} WHERE parent_global_id = ?1", kind.table()),
            [parent_global_id],
        )?;
    }

    for child in children {
        let kind = child.kind();
        let sql = format!(
            "INSERT INTO {} (parent_global_id, object_id, global_id, {}, extra, raw) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            kind.table(),
            kind.text_column()
        );
        tx.execute(
            &sql,
            params![
                parent_global_id,
                child.fields.object_id(),
                child.fields.global_id(),
                child.fields.text(),
                serde_json::to_string(child.fields.extra())?,
                child.raw,
            ],
        )?;
    }
    Ok(())
}

/// Add the parent to the subject's membership, reviving it if it was swept.
/// Returns whether the membership changed.
fn claim_parent(tx: &Transaction, subject: &str, global_id: &str, now: DateTime<Utc>) -> Result<bool> {
    let changed = tx.execute(
        r#"
        INSERT INTO subject_parents (subject, global_id, synced_at, deleted)
        VALUES (?1, ?2, ?3, 0)
        ON CONFLICT(subject, global_id) DO UPDATE SET
            synced_at = excluded.synced_at,
            deleted = 0
        WHERE subject_parents.deleted = 1
        "#,
        params![subject, global_id, now],
    )?;
    Ok(changed > 0)
}

/// Flag every live member of `subject` that the remote no longer returned.
/// The parent row itself is flagged only once no other subject keeps it live.
fn sweep_absent(tx: &Transaction, subject: &str, seen: &HashSet<String>, now: DateTime<Utc>) -> Result<usize> {
    let live: Vec<String> = {
        let mut stmt = tx.prepare("SELECT global_id FROM subject_parents WHERE subject = ?1 AND deleted = 0")?;
        let ids = stmt
            .query_map([subject], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        ids
    };

    let mut deleted = 0;
    for global_id in live.iter().filter(|id| !seen.contains(*id)) {
        deleted += tx.execute(
            "UPDATE subject_parents SET deleted = 1, synced_at = ?3 WHERE subject = ?1 AND global_id = ?2",
            params![subject, global_id, now],
        )?;
        tx.execute(
            "UPDATE parent_records SET deleted = 1, synced_at = ?2 WHERE global_id = ?1 \
             AND NOT EXISTS (SELECT 1 FROM subject_parents m WHERE m.global_id = ?1 AND m.deleted = 0)",
            params![global_id, now],
        )?;
    }
    Ok(deleted)
}

impl Database {
    pub fn parent_fingerprints(&self, subject: &str) -> Result<HashMap<String, CachedFingerprint>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT m.global_id, p.fingerprint, m.deleted FROM subject_parents m \
             JOIN parent_records p ON p.global_id = m.global_id WHERE m.subject = ?1",
        )?;
        let map = stmt
            .query_map([subject], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    CachedFingerprint {
                        fingerprint: row.get(1)?,
                        deleted: row.get(2)?,
                    },
                ))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(map)
    }

    /// Apply one pass in a single transaction: upsert changed parents and
    /// claim them for the subject, replace their children, then soft-delete
    /// the subject's members absent from `plan.seen`.
    pub fn apply_reconciliation(&self, subject: &str, plan: &ReconcilePlan, now: DateTime<Utc>) -> Result<ReconcileStats> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut stats = ReconcileStats::default();

        for update in &plan.changed {
            let rewritten = upsert_parent(&tx, subject, &update.parent, now)?;
            let claimed = claim_parent(&tx, subject, update.parent.global_id(), now)?;
            if rewritten || claimed {
                stats.written += 1;
            } else {
                stats.unchanged += 1;
            }
            replace_children(&tx, update.parent.global_id(), &update.children)?;
        }

        stats.deleted = sweep_absent(&tx, subject, &plan.seen, now)?;
        tx.commit()?;

        Ok(stats)
    }

    pub fn get_parent(&self, global_id: &str) -> Result<Option<StoredParent>> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM parent_records p WHERE p.global_id = ?1", PARENT_COLUMNS);
        let parent = conn.query_row(&sql, [global_id], parent_from_row).optional()?;
        Ok(parent)
    }

    /// All children of a parent, descriptions first.
    pub fn children(&self, parent_global_id: &str) -> Result<Vec<ChildFields>> {
        let conn = self.conn();
        let mut all = Vec::new();
        for kind in ChildKind::ALL {
            all.extend(children_of(&conn, kind, parent_global_id)?);
        }
        Ok(all)
    }

    pub fn count_parents(&self, subject: &str) -> Result<i64> {
        let conn = self.conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM subject_parents WHERE subject = ?1 AND deleted = 0",
            [subject],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
