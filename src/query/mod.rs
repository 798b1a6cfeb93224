//! Filtered, sorted, paginated composite views over the local cache.
//!
//! A composite row is a live parent with its descriptions, facts and
//! downloaded photos. Soft-deleted parents never appear.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;

use crate::db::photos::photos_for_parent;
use crate::db::records::{children_of, parent_from_row, PARENT_COLUMNS};
use crate::db::{Database, PhotoAttachment};
use crate::error::{require_subject, Result};
use crate::records::{ChildFields, ChildKind, DescriptionFields, FactFields, ParentFields};
use crate::tasks::JobStatus;

pub const DEFAULT_PAGE_SIZE: usize = 25;
pub const MAX_PAGE_SIZE: usize = 500;

/// Fields that accept an exact-match filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterField {
    Supervisor,
    SiteComponent,
    ComponentType,
    Activity,
    ReferenceInstallation,
    /// Matches parents with at least one fact child carrying the value.
    DetectedFact,
}

impl FilterField {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterField::Supervisor => "supervisor",
            FilterField::SiteComponent => "site_component",
            FilterField::ComponentType => "component_type",
            FilterField::Activity => "activity",
            FilterField::ReferenceInstallation => "reference_installation",
            FilterField::DetectedFact => "detected_fact",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "supervisor" => Some(FilterField::Supervisor),
            "site_component" | "component" => Some(FilterField::SiteComponent),
            "component_type" => Some(FilterField::ComponentType),
            "activity" => Some(FilterField::Activity),
            "reference_installation" | "installation" => Some(FilterField::ReferenceInstallation),
            "detected_fact" | "fact" => Some(FilterField::DetectedFact),
            _ => None,
        }
    }

    fn condition(&self) -> &'static str {
        match self {
            FilterField::Supervisor => "p.supervisor = ?",
            FilterField::SiteComponent => "p.site_component = ?",
            FilterField::ComponentType => "p.component_type = ?",
            FilterField::Activity => "p.activity = ?",
            FilterField::ReferenceInstallation => "p.reference_installation = ?",
            FilterField::DetectedFact => {
                "EXISTS (SELECT 1 FROM fact_records f WHERE f.parent_global_id = p.global_id AND f.fact = ?)"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    SurveyedAt,
    EditedAt,
    ObjectId,
    Supervisor,
    SiteComponent,
    ComponentType,
    Activity,
}

impl SortField {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "surveyed_at" | "date" => Some(SortField::SurveyedAt),
            "edited_at" => Some(SortField::EditedAt),
            "object_id" => Some(SortField::ObjectId),
            "supervisor" => Some(SortField::Supervisor),
            "site_component" => Some(SortField::SiteComponent),
            "component_type" => Some(SortField::ComponentType),
            "activity" => Some(SortField::Activity),
            _ => None,
        }
    }

    fn column(&self) -> &'static str {
        match self {
            SortField::SurveyedAt => "p.surveyed_at",
            SortField::EditedAt => "p.edited_at",
            SortField::ObjectId => "p.object_id",
            SortField::Supervisor => "p.supervisor",
            SortField::SiteComponent => "p.site_component",
            SortField::ComponentType => "p.component_type",
            SortField::Activity => "p.activity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SortSpec {
    pub field: SortField,
    pub direction: SortDirection,
}

impl Default for SortSpec {
    /// Newest survey first.
    fn default() -> Self {
        Self {
            field: SortField::SurveyedAt,
            direction: SortDirection::Desc,
        }
    }
}

impl SortSpec {
    /// Parse `field`, `field:asc` or `field:desc`.
    pub fn parse(s: &str) -> Option<Self> {
        let (field, direction) = match s.split_once(':') {
            Some((field, dir)) => {
                let direction = match dir.trim().to_ascii_lowercase().as_str() {
                    "asc" => SortDirection::Asc,
                    "desc" => SortDirection::Desc,
                    _ => return None,
                };
                (field, direction)
            }
            None => (s, SortDirection::Asc),
        };
        Some(Self {
            field: SortField::parse(field)?,
            direction,
        })
    }
}

/// Inclusive bounds on the survey date, epoch milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub from: Option<i64>,
    pub to: Option<i64>,
}

impl DateRange {
    /// Whole-day bounds: `from` at midnight, `to` through the end of its day.
    pub fn between_days(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        let start = |d: NaiveDate| d.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
        Self {
            from: from.map(start),
            to: to
                .and_then(|d| d.succ_opt())
                .map(|next| start(next) - 1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompositeQuery {
    pub subject: String,
    pub filters: Vec<(FilterField, String)>,
    pub date_range: DateRange,
    pub sort: SortSpec,
    /// 1-based.
    pub page: usize,
    pub page_size: usize,
}

impl CompositeQuery {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            filters: Vec::new(),
            date_range: DateRange::default(),
            sort: SortSpec::default(),
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn filter(mut self, field: FilterField, value: impl Into<String>) -> Self {
        self.filters.push((field, value.into()));
        self
    }

    pub fn date_range(mut self, range: DateRange) -> Self {
        self.date_range = range;
        self
    }

    pub fn sort(mut self, sort: SortSpec) -> Self {
        self.sort = sort;
        self
    }

    pub fn page(mut self, page: usize, page_size: usize) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    fn effective_page(&self) -> usize {
        self.page.max(1)
    }

    fn effective_page_size(&self) -> usize {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    /// Rows skipped before this page. Saturates, so an absurd page number
    /// yields an empty page.
    fn offset(&self) -> i64 {
        let skipped = (self.effective_page() - 1).saturating_mul(self.effective_page_size());
        i64::try_from(skipped).unwrap_or(i64::MAX)
    }
}

/// A query against the subject of a job; the subject comes from the job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreviewRequest {
    pub filters: Vec<(FilterField, String)>,
    pub date_range: DateRange,
    pub sort: Option<SortSpec>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

impl PreviewRequest {
    pub fn into_query(self, subject: &str, default_page_size: usize) -> CompositeQuery {
        CompositeQuery {
            subject: subject.to_string(),
            filters: self.filters,
            date_range: self.date_range,
            sort: self.sort.unwrap_or_default(),
            page: self.page.unwrap_or(1),
            page_size: self.page_size.unwrap_or(default_page_size),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompositeRow {
    pub parent: ParentFields,
    pub synced_at: DateTime<Utc>,
    pub descriptions: Vec<DescriptionFields>,
    pub facts: Vec<FactFields>,
    pub photos: Vec<PhotoAttachment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompositePage {
    pub rows: Vec<CompositeRow>,
    /// Matching rows across all pages.
    pub total: u64,
    pub page: usize,
    pub page_size: usize,
}

/// Result of a query routed through the job tracker.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum QueryOutcome {
    Ready(CompositePage),
    /// The subject's sync has not completed yet; poll again.
    NotReady { status: JobStatus },
}

impl QueryOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, QueryOutcome::Ready(_))
    }
}

pub struct QueryEngine<'a> {
    db: &'a Database,
}

impl<'a> QueryEngine<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn query(&self, query: &CompositeQuery) -> Result<CompositePage> {
        let subject = require_subject(&query.subject)?;
        let page = query.effective_page();
        let page_size = query.effective_page_size();

        let mut clauses = vec![
            "EXISTS (SELECT 1 FROM subject_parents m WHERE m.global_id = p.global_id \
             AND m.subject = ? AND m.deleted = 0)"
                .to_string(),
        ];
        let mut params: Vec<SqlValue> = vec![SqlValue::Text(subject.to_string())];

        for (field, value) in &query.filters {
            clauses.push(field.condition().to_string());
            params.push(SqlValue::Text(value.clone()));
        }
        if let Some(from) = query.date_range.from {
            clauses.push("p.surveyed_at >= ?".to_string());
            params.push(SqlValue::Integer(from));
        }
        if let Some(to) = query.date_range.to {
            clauses.push("p.surveyed_at <= ?".to_string());
            params.push(SqlValue::Integer(to));
        }
        let where_clause = clauses.join(" AND ");

        let conn = self.db.conn();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM parent_records p WHERE {}", where_clause),
            params_from_iter(params.iter()),
            |row| row.get(0),
        )?;

        let direction = match query.sort.direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };
        let sql = format!(
            "SELECT {} FROM parent_records p WHERE {} ORDER BY {} {}, p.object_id ASC LIMIT ? OFFSET ?",
            PARENT_COLUMNS,
            where_clause,
            query.sort.field.column(),
            direction
        );
        params.push(SqlValue::Integer(page_size as i64));
        params.push(SqlValue::Integer(query.offset()));

        let parents = {
            let mut stmt = conn.prepare(&sql)?;
            let parents = stmt
                .query_map(params_from_iter(params.iter()), parent_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            parents
        };

        let rows = parents
            .into_iter()
            .map(|parent| -> Result<CompositeRow> {
                let (descriptions, facts) = split_children(&conn, &parent.fields.global_id)?;
                let photos = photos_for_parent(&conn, subject, &parent.fields.global_id)?;
                Ok(CompositeRow {
                    synced_at: parent.synced_at,
                    parent: parent.fields,
                    descriptions,
                    facts,
                    photos,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(CompositePage {
            rows,
            total: total.max(0) as u64,
            page,
            page_size,
        })
    }

    /// First page of the default view, built once a sync has landed.
    pub fn prepare(&self, subject: &str, page_size: usize) -> Result<CompositePage> {
        let page = self.query(&CompositeQuery::new(subject).page(1, page_size))?;
        tracing::debug!(subject, total = page.total, rows = page.rows.len(), "Preview prepared");
        Ok(page)
    }
}

fn split_children(conn: &Connection, parent_global_id: &str) -> Result<(Vec<DescriptionFields>, Vec<FactFields>)> {
    let mut descriptions = Vec::new();
    let mut facts = Vec::new();
    for kind in ChildKind::ALL {
        for child in children_of(conn, kind, parent_global_id)? {
            match child {
                ChildFields::Description(d) => descriptions.push(d),
                ChildFields::Fact(f) => facts.push(f),
            }
        }
    }
    Ok((descriptions, facts))
}
