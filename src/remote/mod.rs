//! Access to the remote feature service.
//!
//! The [`RemoteLayerClient`] trait is the seam between the sync engine and
//! the network. [`ArcGisClient`] talks to a FeatureServer over HTTP; tests use
//! an in-memory service.

pub mod arcgis;
#[cfg(test)]
pub(crate) mod fake;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::RemoteConfig;
use crate::error::Result;
use crate::records::ChildKind;

pub use arcgis::ArcGisClient;

/// Numeric layer index within the feature service.
pub type LayerId = u32;

/// Upper bound on records per page accepted by the service.
pub const MAX_PAGE_SIZE: usize = 2000;

/// A feature as returned by a layer query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Feature {
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct FeaturePage {
    pub features: Vec<Feature>,
    /// False once a page comes back shorter than requested without the
    /// service flagging its own transfer limit.
    pub has_more: bool,
}

/// An attachment listed on a child feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub id: i64,
    /// Object id of the feature owning the attachment.
    pub object_id: i64,
    pub name: String,
    pub content_type: Option<String>,
    pub size: Option<i64>,
}

/// The three layers making up one survey dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerSet {
    pub parent: LayerId,
    pub description: LayerId,
    pub fact: LayerId,
}

impl LayerSet {
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            parent: config.parent_layer,
            description: config.description_layer,
            fact: config.fact_layer,
        }
    }

    pub fn child(&self, kind: ChildKind) -> LayerId {
        match kind {
            ChildKind::Description => self.description,
            ChildKind::Fact => self.fact,
        }
    }
}

/// Boolean predicate over attribute fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, String),
    In(String, Vec<String>),
    Or(Vec<Predicate>),
    And(Vec<Predicate>),
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Eq(field.into(), value.into())
    }

    pub fn in_list(field: impl Into<String>, values: Vec<String>) -> Self {
        Predicate::In(field.into(), values)
    }

    /// Render as a service `where` clause. Values are quoted; field names come
    /// from configuration and are used as-is.
    pub fn to_where(&self) -> String {
        match self {
            Predicate::Eq(field, value) => format!("{} = {}", field, quote(value)),
            Predicate::In(_, values) if values.is_empty() => "1=0".to_string(),
            Predicate::In(field, values) => {
                let quoted: Vec<String> = values.iter().map(|v| quote(v)).collect();
                format!("{} IN ({})", field, quoted.join(", "))
            }
            Predicate::Or(parts) => join_parts(parts, " OR ", "1=0"),
            Predicate::And(parts) => join_parts(parts, " AND ", "1=1"),
        }
    }

    /// Evaluate against an attribute map, comparing values as text.
    pub fn matches(&self, attributes: &Map<String, Value>) -> bool {
        match self {
            Predicate::Eq(field, value) => {
                attribute_text(attributes, field).as_deref() == Some(value.as_str())
            }
            Predicate::In(field, values) => attribute_text(attributes, field)
                .map(|text| values.iter().any(|v| *v == text))
                .unwrap_or(false),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(attributes)),
            Predicate::And(parts) => parts.iter().all(|p| p.matches(attributes)),
        }
    }
}

fn join_parts(parts: &[Predicate], separator: &str, empty: &str) -> String {
    if parts.is_empty() {
        return empty.to_string();
    }
    let rendered: Vec<String> = parts.iter().map(|p| format!("({})", p.to_where())).collect();
    rendered.join(separator)
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn attribute_text(attributes: &Map<String, Value>, field: &str) -> Option<String> {
    match attributes.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Filter selecting every parent belonging to a subject.
pub fn subject_filter(code_field: &str, alt_code_field: &str, subject: &str) -> Predicate {
    Predicate::Or(vec![
        Predicate::eq(code_field, subject),
        Predicate::eq(alt_code_field, subject),
    ])
}

/// Client for a remote layered feature service.
///
/// Implementations never retry; any transport failure or service error payload
/// is returned as [`crate::error::SyncError::RemoteService`].
pub trait RemoteLayerClient: Send + Sync {
    /// Fetch one page of features matching `filter`, ordered by object id.
    /// An empty `fields` slice requests every attribute.
    fn query(
        &self,
        layer: LayerId,
        filter: &Predicate,
        fields: &[&str],
        offset: usize,
        page_size: usize,
    ) -> Result<FeaturePage>;

    /// Number of features matching `filter`, as reported by the service.
    fn count(&self, layer: LayerId, filter: &Predicate) -> Result<u64>;

    fn list_attachments(&self, layer: LayerId, object_id: i64) -> Result<Vec<AttachmentRef>>;

    fn fetch_attachment(&self, layer: LayerId, object_id: i64, attachment_id: i64) -> Result<Vec<u8>>;
}

pub fn clamp_page_size(page_size: usize) -> usize {
    page_size.clamp(1, MAX_PAGE_SIZE)
}

/// Page through a layer until the service runs out of features.
pub fn fetch_all(
    client: &dyn RemoteLayerClient,
    layer: LayerId,
    filter: &Predicate,
    page_size: usize,
) -> Result<Vec<Feature>> {
    let page_size = clamp_page_size(page_size);
    let mut features = Vec::new();
    let mut offset = 0;

    loop {
        let page = client.query(layer, filter, &[], offset, page_size)?;
        let received = page.features.len();
        features.extend(page.features);

        if !page.has_more || received == 0 {
            break;
        }
        offset += received;
    }

    Ok(features)
}

#[cfg(test)]
mod tests {
    use super::fake::FakeService;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_where_clause_rendering() {
        let filter = subject_filter("cod_accion", "cod_accion_alt", "CA-1");
        assert_eq!(
            filter.to_where(),
            "(cod_accion = 'CA-1') OR (cod_accion_alt = 'CA-1')"
        );

        let list = Predicate::in_list("parentglobalid", vec!["{A}".into(), "O'Neil".into()]);
        assert_eq!(list.to_where(), "parentglobalid IN ('{A}', 'O''Neil')");
        assert_eq!(Predicate::in_list("x", vec![]).to_where(), "1=0");
    }

    #[test]
    fn test_predicate_matches() {
        let attributes = json!({ "cod_accion": "CA-1", "n": 4 });
        let attributes = attributes.as_object().unwrap();

        assert!(Predicate::eq("cod_accion", "CA-1").matches(attributes));
        assert!(Predicate::eq("n", "4").matches(attributes));
        assert!(!Predicate::eq("missing", "CA-1").matches(attributes));
        assert!(subject_filter("other", "cod_accion", "CA-1").matches(attributes));
        assert!(!Predicate::And(vec![
            Predicate::eq("cod_accion", "CA-1"),
            Predicate::eq("n", "5"),
        ])
        .matches(attributes));
    }

    #[test]
    fn test_pagination_union_matches_service_count() {
        let service = FakeService::new();
        for i in 0..23 {
            let code = if i % 3 == 0 { "OTHER" } else { "CA-1" };
            service.add_parent(json!({
                "objectid": i + 1,
                "globalid": format!("G{}", i),
                "cod_accion": code
            }));
        }
        let filter = subject_filter("cod_accion", "cod_accion_alt", "CA-1");

        let all = fetch_all(&service, 0, &filter, 5).unwrap();
        let counted = service.count(0, &filter).unwrap();
        assert_eq!(all.len() as u64, counted);

        let mut ids: Vec<i64> = all
            .iter()
            .map(|f| f.attributes["objectid"].as_i64().unwrap())
            .collect();
        ids.dedup();
        assert_eq!(ids.len(), all.len());
    }

    #[test]
    fn test_full_last_page_reports_more() {
        let service = FakeService::new();
        for i in 0..4 {
            service.add_parent(json!({ "objectid": i, "globalid": format!("G{}", i), "cod_accion": "S" }));
        }
        let filter = Predicate::eq("cod_accion", "S");

        let first = service.query(0, &filter, &[], 0, 4).unwrap();
        assert!(first.has_more);
        let second = service.query(0, &filter, &[], 4, 4).unwrap();
        assert!(second.features.is_empty());
        assert!(!second.has_more);
    }
}
