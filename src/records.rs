//! Typed records flattened from remote features.
//!
//! Each layer gets its own field struct. Attributes that are not mapped to a
//! typed field are kept in `extra` so nothing the service sends is lost.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::config::FieldNames;
use crate::error::{Result, SyncError};
use crate::remote::Feature;

/// Which child layer a record (or attachment) came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildKind {
    Description,
    Fact,
}

impl ChildKind {
    pub const ALL: [ChildKind; 2] = [ChildKind::Description, ChildKind::Fact];

    /// Stable layer identifier stored alongside attachments.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildKind::Description => "descriptions",
            ChildKind::Fact => "facts",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "descriptions" => Some(ChildKind::Description),
            "facts" => Some(ChildKind::Fact),
            _ => None,
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        match self {
            ChildKind::Description => "description_records",
            ChildKind::Fact => "fact_records",
        }
    }

    pub(crate) fn text_column(&self) -> &'static str {
        match self {
            ChildKind::Description => "description",
            ChildKind::Fact => "fact",
        }
    }
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flattened attributes of one supervision point.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParentFields {
    pub object_id: i64,
    pub global_id: String,
    pub code: Option<String>,
    pub alt_code: Option<String>,
    pub supervisor: Option<String>,
    pub site_component: Option<String>,
    pub component_type: Option<String>,
    pub activity: Option<String>,
    pub reference_installation: Option<String>,
    /// Survey date, epoch milliseconds.
    pub surveyed_at: Option<i64>,
    /// Remote last-modified date, epoch milliseconds.
    pub edited_at: Option<i64>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DescriptionFields {
    pub object_id: i64,
    pub global_id: Option<String>,
    pub parent_global_id: String,
    pub description: Option<String>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FactFields {
    pub object_id: i64,
    pub global_id: Option<String>,
    pub parent_global_id: String,
    pub fact: Option<String>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layer", rename_all = "lowercase")]
pub enum ChildFields {
    Description(DescriptionFields),
    Fact(FactFields),
}

impl ChildFields {
    pub fn kind(&self) -> ChildKind {
        match self {
            ChildFields::Description(_) => ChildKind::Description,
            ChildFields::Fact(_) => ChildKind::Fact,
        }
    }

    pub fn object_id(&self) -> i64 {
        match self {
            ChildFields::Description(d) => d.object_id,
            ChildFields::Fact(f) => f.object_id,
        }
    }

    pub fn global_id(&self) -> Option<&str> {
        match self {
            ChildFields::Description(d) => d.global_id.as_deref(),
            ChildFields::Fact(f) => f.global_id.as_deref(),
        }
    }

    pub fn parent_global_id(&self) -> &str {
        match self {
            ChildFields::Description(d) => &d.parent_global_id,
            ChildFields::Fact(f) => &f.parent_global_id,
        }
    }

    /// The layer's free-text value (description or detected fact).
    pub fn text(&self) -> Option<&str> {
        match self {
            ChildFields::Description(d) => d.description.as_deref(),
            ChildFields::Fact(f) => f.fact.as_deref(),
        }
    }

    pub fn extra(&self) -> &Map<String, Value> {
        match self {
            ChildFields::Description(d) => &d.extra,
            ChildFields::Fact(f) => &f.extra,
        }
    }

    pub(crate) fn set_parent_global_id(&mut self, global_id: &str) {
        match self {
            ChildFields::Description(d) => d.parent_global_id = global_id.to_string(),
            ChildFields::Fact(f) => f.parent_global_id = global_id.to_string(),
        }
    }
}

/// A parent feature ready to be written, with its raw payload and fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentRecord {
    pub fields: ParentFields,
    pub raw: String,
    pub fingerprint: String,
}

impl ParentRecord {
    pub fn from_feature(feature: &Feature, names: &FieldNames) -> Result<Self> {
        let mut attributes = feature.attributes.clone();

        let object_id = take_i64(&mut attributes, &names.object_id)
            .ok_or_else(|| SyncError::remote(format!("feature without '{}'", names.object_id)))?;
        let global_id = take_string(&mut attributes, &names.global_id).ok_or_else(|| {
            SyncError::remote(format!("feature {} without '{}'", object_id, names.global_id))
        })?;

        let (longitude, latitude) = point_of(feature.geometry.as_ref());

        let fields = ParentFields {
            object_id,
            global_id,
            code: take_string(&mut attributes, &names.code),
            alt_code: take_string(&mut attributes, &names.alt_code),
            supervisor: take_string(&mut attributes, &names.supervisor),
            site_component: take_string(&mut attributes, &names.site_component),
            component_type: take_string(&mut attributes, &names.component_type),
            activity: take_string(&mut attributes, &names.activity),
            reference_installation: take_string(&mut attributes, &names.reference_installation),
            surveyed_at: take_i64(&mut attributes, &names.surveyed_at),
            edited_at: take_i64(&mut attributes, &names.edited_at),
            longitude,
            latitude,
            extra: attributes,
        };

        let fingerprint = fingerprint(&fields)?;
        let raw = serde_json::to_string(feature)?;

        Ok(Self {
            fields,
            raw,
            fingerprint,
        })
    }

    pub fn global_id(&self) -> &str {
        &self.fields.global_id
    }
}

/// A child feature ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildRecord {
    pub fields: ChildFields,
    pub raw: String,
}

impl ChildRecord {
    pub fn from_feature(kind: ChildKind, feature: &Feature, names: &FieldNames) -> Result<Self> {
        let mut attributes = feature.attributes.clone();

        let object_id = take_i64(&mut attributes, &names.object_id).ok_or_else(|| {
            SyncError::remote(format!("{} feature without '{}'", kind, names.object_id))
        })?;
        let parent_global_id = take_string(&mut attributes, &names.parent_link).ok_or_else(|| {
            SyncError::remote(format!(
                "{} feature {} without '{}'",
                kind, object_id, names.parent_link
            ))
        })?;
        let global_id = take_string(&mut attributes, &names.global_id);

        let fields = match kind {
            ChildKind::Description => ChildFields::Description(DescriptionFields {
                object_id,
                global_id,
                parent_global_id,
                description: take_string(&mut attributes, &names.description),
                extra: attributes,
            }),
            ChildKind::Fact => ChildFields::Fact(FactFields {
                object_id,
                global_id,
                parent_global_id,
                fact: take_string(&mut attributes, &names.detected_fact),
                extra: attributes,
            }),
        };

        Ok(Self {
            fields,
            raw: serde_json::to_string(feature)?,
        })
    }

    pub fn kind(&self) -> ChildKind {
        self.fields.kind()
    }
}

/// Content hash over the flattened parent fields.
///
/// Keys are serialized in sorted order at every level so the value does not
/// depend on the attribute order the service happened to use.
pub fn fingerprint(fields: &ParentFields) -> Result<String> {
    let value = serde_json::to_value(fields)?;
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Join key form of a global id: no braces, uppercase.
///
/// Services are inconsistent about braces and case between a layer's
/// `globalid` and the children's link field.
pub fn normalize_global_id(global_id: &str) -> String {
    global_id
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .to_ascii_uppercase()
}

fn take_string(attributes: &mut Map<String, Value>, key: &str) -> Option<String> {
    match attributes.remove(key)? {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn take_i64(attributes: &mut Map<String, Value>, key: &str) -> Option<i64> {
    match attributes.remove(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn point_of(geometry: Option<&Value>) -> (Option<f64>, Option<f64>) {
    match geometry {
        Some(g) => (
            g.get("x").and_then(Value::as_f64),
            g.get("y").and_then(Value::as_f64),
        ),
        None => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feature(value: Value) -> Feature {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parent_from_feature_maps_fields() {
        let names = FieldNames::default();
        let f = feature(json!({
            "attributes": {
                "objectid": 12,
                "globalid": "{AB-12}",
                "cod_accion": "CA-1",
                "supervisor": " Rivera ",
                "fecha": 1700000000000i64,
                "humedad": 41.5
            },
            "geometry": { "x": -77.03, "y": -12.04 }
        }));

        let record = ParentRecord::from_feature(&f, &names).unwrap();
        assert_eq!(record.fields.object_id, 12);
        assert_eq!(record.global_id(), "{AB-12}");
        assert_eq!(record.fields.code.as_deref(), Some("CA-1"));
        assert_eq!(record.fields.supervisor.as_deref(), Some("Rivera"));
        assert_eq!(record.fields.surveyed_at, Some(1_700_000_000_000));
        assert_eq!(record.fields.longitude, Some(-77.03));
        assert_eq!(record.fields.extra.get("humedad"), Some(&json!(41.5)));
        assert!(!record.fields.extra.contains_key("supervisor"));
        assert_eq!(record.fingerprint.len(), 64);
    }

    #[test]
    fn test_parent_without_global_id_is_rejected() {
        let names = FieldNames::default();
        let f = feature(json!({ "attributes": { "objectid": 3 } }));
        assert!(matches!(
            ParentRecord::from_feature(&f, &names),
            Err(SyncError::RemoteService(_))
        ));
    }

    #[test]
    fn test_fingerprint_ignores_attribute_order() {
        let names = FieldNames::default();
        let a = feature(json!({ "attributes": {
            "objectid": 1, "globalid": "G1", "x1": 1, "x2": "two"
        }}));
        let b = feature(json!({ "attributes": {
            "x2": "two", "globalid": "G1", "x1": 1, "objectid": 1
        }}));

        let fa = ParentRecord::from_feature(&a, &names).unwrap().fingerprint;
        let fb = ParentRecord::from_feature(&b, &names).unwrap().fingerprint;
        assert_eq!(fa, fb);
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let names = FieldNames::default();
        let a = feature(json!({ "attributes": {
            "objectid": 1, "globalid": "G1", "actividad": "poda"
        }}));
        let b = feature(json!({ "attributes": {
            "objectid": 1, "globalid": "G1", "actividad": "riego"
        }}));

        let fa = ParentRecord::from_feature(&a, &names).unwrap().fingerprint;
        let fb = ParentRecord::from_feature(&b, &names).unwrap().fingerprint;
        assert_ne!(fa, fb);
    }

    #[test]
    fn test_child_from_feature() {
        let names = FieldNames::default();
        let f = feature(json!({ "attributes": {
            "objectid": 7,
            "parentglobalid": "{ab-12}",
            "hecho_detec": "Derrame de aceite"
        }}));

        let child = ChildRecord::from_feature(ChildKind::Fact, &f, &names).unwrap();
        assert_eq!(child.kind(), ChildKind::Fact);
        assert_eq!(child.fields.object_id(), 7);
        assert_eq!(child.fields.text(), Some("Derrame de aceite"));
        assert_eq!(normalize_global_id(child.fields.parent_global_id()), "AB-12");
    }

    #[test]
    fn test_child_kind_round_trips_through_str() {
        for kind in ChildKind::ALL {
            assert_eq!(ChildKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(ChildKind::from_str("photos"), None);
    }
}
