//! In-memory feature service for tests.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{AttachmentRef, Feature, FeaturePage, LayerId, Predicate, RemoteLayerClient};
use crate::error::{Result, SyncError};

pub const PARENT_LAYER: LayerId = 0;
pub const DESCRIPTION_LAYER: LayerId = 1;
pub const FACT_LAYER: LayerId = 2;

#[derive(Default)]
struct State {
    layers: HashMap<LayerId, Vec<Feature>>,
    attachments: HashMap<(LayerId, i64), Vec<(AttachmentRef, Vec<u8>)>>,
    query_error: Option<String>,
    failing_fetches: HashSet<String>,
    query_delay: Option<Duration>,
    next_attachment_id: i64,
}

#[derive(Default)]
pub struct FakeService {
    state: Mutex<State>,
    queries: AtomicUsize,
    listings: AtomicUsize,
    fetches: AtomicUsize,
}

impl FakeService {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_feature(&self, layer: LayerId, attributes: Value) {
        let feature = Feature {
            attributes: attributes.as_object().cloned().unwrap_or_default(),
            geometry: None,
        };
        self.state().layers.entry(layer).or_default().push(feature);
    }

    pub fn add_parent(&self, attributes: Value) {
        self.add_feature(PARENT_LAYER, attributes);
    }

    /// Set one attribute on the parent with the given global id.
    pub fn update_parent(&self, global_id: &str, key: &str, value: Value) {
        let mut state = self.state();
        if let Some(parents) = state.layers.get_mut(&PARENT_LAYER) {
            for feature in parents.iter_mut() {
                if feature.attributes.get("globalid").and_then(Value::as_str) == Some(global_id) {
                    feature.attributes.insert(key.to_string(), value.clone());
                }
            }
        }
    }

    pub fn remove_parent(&self, global_id: &str) {
        let mut state = self.state();
        if let Some(parents) = state.layers.get_mut(&PARENT_LAYER) {
            parents.retain(|f| f.attributes.get("globalid").and_then(Value::as_str) != Some(global_id));
        }
    }

    pub fn add_attachment(&self, layer: LayerId, object_id: i64, name: &str, bytes: &[u8]) {
        let mut state = self.state();
        state.next_attachment_id += 1;
        let attachment = AttachmentRef {
            id: state.next_attachment_id,
            object_id,
            name: name.to_string(),
            content_type: Some("image/jpeg".to_string()),
            size: Some(bytes.len() as i64),
        };
        state
            .attachments
            .entry((layer, object_id))
            .or_default()
            .push((attachment, bytes.to_vec()));
    }

    pub fn fail_queries(&self, message: &str) {
        self.state().query_error = Some(message.to_string());
    }

    pub fn fail_fetch(&self, name: &str) {
        self.state().failing_fetches.insert(name.to_string());
    }

    pub fn set_query_delay(&self, delay: Duration) {
        self.state().query_delay = Some(delay);
    }

    pub fn query_calls(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn listing_calls(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn matching(&self, layer: LayerId, filter: &Predicate) -> Result<Vec<Feature>> {
        let (delay, error) = {
            let state = self.state();
            (state.query_delay, state.query_error.clone())
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if let Some(message) = error {
            return Err(SyncError::remote(message));
        }

        let state = self.state();
        let mut features: Vec<Feature> = state
            .layers
            .get(&layer)
            .map(|all| all.iter().filter(|f| filter.matches(&f.attributes)).cloned().collect())
            .unwrap_or_default();
        features.sort_by_key(|f| f.attributes.get("objectid").and_then(Value::as_i64));
        Ok(features)
    }
}

impl RemoteLayerClient for FakeService {
    fn query(
        &self,
        layer: LayerId,
        filter: &Predicate,
        _fields: &[&str],
        offset: usize,
        page_size: usize,
    ) -> Result<FeaturePage> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let features: Vec<Feature> = self
            .matching(layer, filter)?
            .into_iter()
            .skip(offset)
            .take(page_size)
            .collect();
        let has_more = features.len() == page_size;
        Ok(FeaturePage { features, has_more })
    }

    fn count(&self, layer: LayerId, filter: &Predicate) -> Result<u64> {
        Ok(self.matching(layer, filter)?.len() as u64)
    }

    fn list_attachments(&self, layer: LayerId, object_id: i64) -> Result<Vec<AttachmentRef>> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state()
            .attachments
            .get(&(layer, object_id))
            .map(|list| list.iter().map(|(a, _)| a.clone()).collect())
            .unwrap_or_default())
    }

    fn fetch_attachment(&self, layer: LayerId, object_id: i64, attachment_id: i64) -> Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        let (attachment, bytes) = state
            .attachments
            .get(&(layer, object_id))
            .and_then(|list| list.iter().find(|(a, _)| a.id == attachment_id))
            .ok_or_else(|| SyncError::remote(format!("attachment {} not found", attachment_id)))?;
        if state.failing_fetches.contains(&attachment.name) {
            return Err(SyncError::remote(format!("fetch of {} refused", attachment.name)));
        }
        Ok(bytes.clone())
    }
}
