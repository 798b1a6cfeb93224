use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::io::Read;

use super::{clamp_page_size, AttachmentRef, Feature, FeaturePage, LayerId, Predicate, RemoteLayerClient};
use crate::config::RemoteConfig;
use crate::error::{Result, SyncError};

/// Largest attachment body accepted (64 MiB).
const MAX_ATTACHMENT_BYTES: u64 = 64 * 1024 * 1024;

/// Client for an ArcGIS REST FeatureServer.
pub struct ArcGisClient {
    agent: ureq::Agent,
    base_url: String,
    token: Option<String>,
    order_by: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    features: Vec<Feature>,
    /// Set when the server's own `maxRecordCount` cut the page short.
    #[serde(default, rename = "exceededTransferLimit")]
    exceeded_transfer_limit: bool,
}

impl QueryResponse {
    fn into_page(self, page_size: usize) -> FeaturePage {
        let received = self.features.len();
        let has_more = received >= page_size || (self.exceeded_transfer_limit && received > 0);
        FeaturePage {
            features: self.features,
            has_more,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct AttachmentsResponse {
    #[serde(default, rename = "attachmentInfos")]
    attachment_infos: Vec<AttachmentInfo>,
}

#[derive(Debug, Deserialize)]
struct AttachmentInfo {
    id: i64,
    name: String,
    #[serde(default, rename = "contentType")]
    content_type: Option<String>,
    #[serde(default)]
    size: Option<i64>,
}

impl ArcGisClient {
    pub fn new(config: &RemoteConfig, object_id_field: &str) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout()).build();

        Self {
            agent,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone().filter(|t| !t.is_empty()),
            order_by: format!("{} ASC", object_id_field),
        }
    }

    fn layer_url(&self, layer: LayerId) -> String {
        format!("{}/{}", self.base_url, layer)
    }

    /// POST a form to a query-style endpoint and decode the JSON answer.
    fn post_form<T: DeserializeOwned>(&self, url: &str, mut params: Vec<(&str, String)>) -> Result<T> {
        params.push(("f", "json".to_string()));
        if let Some(token) = &self.token {
            params.push(("token", token.clone()));
        }
        let form: Vec<(&str, &str)> = params.iter().map(|(k, v)| (*k, v.as_str())).collect();

        let response = self
            .agent
            .post(url)
            .send_form(&form)
            .map_err(|e| SyncError::remote(format!("POST {}: {}", url, e)))?;

        decode(url, response)
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut request = self.agent.get(url).query("f", "json");
        if let Some(token) = &self.token {
            request = request.query("token", token);
        }

        let response = request
            .call()
            .map_err(|e| SyncError::remote(format!("GET {}: {}", url, e)))?;

        decode(url, response)
    }
}

fn decode<T: DeserializeOwned>(url: &str, response: ureq::Response) -> Result<T> {
    let body: Value = response
        .into_json()
        .map_err(|e| SyncError::remote(format!("{}: invalid JSON response: {}", url, e)))?;

    check_service_error(&body)?;

    serde_json::from_value(body)
        .map_err(|e| SyncError::remote(format!("{}: unexpected response shape: {}", url, e)))
}

/// The service reports most failures as HTTP 200 with an `error` object.
fn check_service_error(body: &Value) -> Result<()> {
    let Some(error) = body.get("error") else {
        return Ok(());
    };

    let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
    let mut message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown service error")
        .to_string();

    if let Some(details) = error.get("details").and_then(Value::as_array) {
        let details: Vec<&str> = details.iter().filter_map(Value::as_str).collect();
        if !details.is_empty() {
            message = format!("{} ({})", message, details.join("; "));
        }
    }

    Err(SyncError::remote(format!("service error {}: {}", code, message)))
}

/// Read a whole body, failing instead of truncating when it exceeds `limit`.
fn read_limited(reader: impl Read, limit: u64, url: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    reader
        .take(limit.saturating_add(1))
        .read_to_end(&mut bytes)
        .map_err(|e| SyncError::remote(format!("GET {}: {}", url, e)))?;

    if bytes.len() as u64 > limit {
        return Err(SyncError::remote(format!(
            "GET {}: attachment exceeds the {} byte limit",
            url, limit
        )));
    }
    Ok(bytes)
}

impl RemoteLayerClient for ArcGisClient {
    fn query(
        &self,
        layer: LayerId,
        filter: &Predicate,
        fields: &[&str],
        offset: usize,
        page_size: usize,
    ) -> Result<FeaturePage> {
        let page_size = clamp_page_size(page_size);
        let out_fields = if fields.is_empty() {
            "*".to_string()
        } else {
            fields.join(",")
        };
        let url = format!("{}/query", self.layer_url(layer));

        let response: QueryResponse = self.post_form(
            &url,
            vec![
                ("where", filter.to_where()),
                ("outFields", out_fields),
                ("returnGeometry", "true".to_string()),
                ("outSR", "4326".to_string()),
                ("orderByFields", self.order_by.clone()),
                ("resultOffset", offset.to_string()),
                ("resultRecordCount", page_size.to_string()),
            ],
        )?;

        tracing::debug!(
            layer,
            offset,
            received = response.features.len(),
            truncated = response.exceeded_transfer_limit,
            "Layer page fetched"
        );

        Ok(response.into_page(page_size))
    }

    fn count(&self, layer: LayerId, filter: &Predicate) -> Result<u64> {
        let url = format!("{}/query", self.layer_url(layer));
        let response: CountResponse = self.post_form(
            &url,
            vec![
                ("where", filter.to_where()),
                ("returnCountOnly", "true".to_string()),
            ],
        )?;
        Ok(response.count)
    }

    fn list_attachments(&self, layer: LayerId, object_id: i64) -> Result<Vec<AttachmentRef>> {
        let url = format!("{}/{}/attachments", self.layer_url(layer), object_id);
        let response: AttachmentsResponse = self.get_json(&url)?;

        Ok(response
            .attachment_infos
            .into_iter()
            .map(|info| AttachmentRef {
                id: info.id,
                object_id,
                name: info.name,
                content_type: info.content_type,
                size: info.size,
            })
            .collect())
    }

    fn fetch_attachment(&self, layer: LayerId, object_id: i64, attachment_id: i64) -> Result<Vec<u8>> {
        let url = format!(
            "{}/{}/attachments/{}",
            self.layer_url(layer),
            object_id,
            attachment_id
        );
        let mut request = self.agent.get(&url);
        if let Some(token) = &self.token {
            request = request.query("token", token);
        }

        let response = request
            .call()
            .map_err(|e| SyncError::remote(format!("GET {}: {}", url, e)))?;
        let is_json = response.content_type().contains("json");

        let declared = response.header("Content-Length").and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(len) = declared.filter(|len| *len > MAX_ATTACHMENT_BYTES) {
            return Err(SyncError::remote(format!(
                "GET {}: attachment of {} bytes exceeds the {} byte limit",
                url, len, MAX_ATTACHMENT_BYTES
            )));
        }
        let bytes = read_limited(response.into_reader(), MAX_ATTACHMENT_BYTES, &url)?;

        // A JSON body in place of the binary is an error payload.
        if is_json {
            if let Ok(body) = serde_json::from_slice::<Value>(&bytes) {
                check_service_error(&body)?;
            }
        }

        Ok(bytes)
    }
}
