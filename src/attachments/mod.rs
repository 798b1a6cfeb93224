//! Downloads attachments to a deterministic location on disk.
//!
//! Layout: `<root>/<subject>/<parent global id>/<filename>`. When the other
//! child layer already holds that name under the same parent, the file goes
//! to `<root>/<subject>/<parent global id>/<layer>/<filename>` instead. The
//! database row is written only after the file is in place, so a row always
//! means the file exists.

use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::db::{Database, PhotoAttachment};
use crate::error::{Result, SyncError};
use crate::records::ChildKind;
use crate::remote::{AttachmentRef, LayerSet, RemoteLayerClient};

/// Outcome of materializing one attachment.
#[derive(Debug, Clone)]
pub struct Materialized {
    pub record: PhotoAttachment,
    /// False when the attachment was already on disk and nothing was fetched.
    pub fetched: bool,
}

pub struct AttachmentStore {
    root: PathBuf,
    db: Arc<Database>,
    client: Arc<dyn RemoteLayerClient>,
    layers: LayerSet,
    /// Held while a path is chosen, written and recorded.
    placement: Mutex<()>,
}

impl AttachmentStore {
    pub fn new(root: PathBuf, db: Arc<Database>, client: Arc<dyn RemoteLayerClient>, layers: LayerSet) -> Self {
        Self {
            root,
            db,
            client,
            layers,
            placement: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where an attachment for this subject and parent lives on disk.
    pub fn local_path(&self, subject: &str, parent_global_id: &str, filename: &str) -> PathBuf {
        self.root
            .join(sanitize_component(subject))
            .join(sanitize_component(parent_global_id))
            .join(sanitize_component(filename))
    }

    /// Ensure an attachment is on disk and recorded.
    ///
    /// Without `force`, an existing record whose file is still present is
    /// returned as-is and the service is not contacted.
    pub fn materialize(
        &self,
        subject: &str,
        parent_global_id: &str,
        layer: ChildKind,
        attachment: &AttachmentRef,
        force: bool,
    ) -> Result<Materialized> {
        self.materialize_inner(subject, parent_global_id, layer, attachment, force)
            .map_err(|e| match e {
                SyncError::Attachment { .. } => e,
                other => SyncError::attachment(&attachment.name, other),
            })
    }

    fn materialize_inner(
        &self,
        subject: &str,
        parent_global_id: &str,
        layer: ChildKind,
        attachment: &AttachmentRef,
        force: bool,
    ) -> Result<Materialized> {
        if !force {
            if let Some(existing) = self.db.find_photo(subject, parent_global_id, layer, &attachment.name)? {
                if existing.local_path.is_file() {
                    return Ok(Materialized {
                        record: existing,
                        fetched: false,
                    });
                }
                tracing::warn!(
                    path = %existing.local_path.display(),
                    "Recorded attachment missing on disk, fetching again"
                );
            }
        }

        let bytes = self
            .client
            .fetch_attachment(self.layers.child(layer), attachment.object_id, attachment.id)?;

        let _placement = self.placement.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let path = self.placement_path(subject, parent_global_id, layer, &attachment.name)?;
        write_atomically(&path, &bytes)?;

        let record = self.db.record_photo(&PhotoAttachment {
            id: 0,
            subject: subject.to_string(),
            parent_global_id: parent_global_id.to_string(),
            layer,
            object_id: attachment.object_id,
            attachment_id: attachment.id,
            filename: attachment.name.clone(),
            local_path: path,
            content_type: attachment.content_type.clone(),
            size_bytes: Some(bytes.len() as i64),
            downloaded_at: Utc::now(),
        })?;

        tracing::debug!(
            subject,
            parent = parent_global_id,
            file = %attachment.name,
            bytes = bytes.len(),
            "Attachment downloaded"
        );

        Ok(Materialized {
            record,
            fetched: true,
        })
    }

    /// The default path, unless a row from the other layer already owns it.
    fn placement_path(&self, subject: &str, parent_global_id: &str, layer: ChildKind, filename: &str) -> Result<PathBuf> {
        let path = self.local_path(subject, parent_global_id, filename);
        let claimed = self
            .db
            .photos_for_parent(subject, parent_global_id)?
            .into_iter()
            .any(|photo| photo.layer != layer && photo.local_path == path);
        if !claimed {
            return Ok(path);
        }

        tracing::warn!(
            subject,
            parent = parent_global_id,
            layer = layer.as_str(),
            path = %path.display(),
            "Attachment name already used by another layer, storing under the layer directory"
        );
        Ok(self
            .root
            .join(sanitize_component(subject))
            .join(sanitize_component(parent_global_id))
            .join(layer.as_str())
            .join(sanitize_component(filename)))
    }
}

/// Write through a temporary sibling and rename, so a crash never leaves a
/// truncated file under the final name.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| SyncError::attachment(path.display().to_string(), "path has no parent"))?;
    fs::create_dir_all(dir)?;

    // Removed on drop unless persisted
    let mut tmp = tempfile::Builder::new().prefix(".").suffix(".part").tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Make a string safe to use as a single path component.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;
    use crate::remote::fake::{FakeService, DESCRIPTION_LAYER};

    fn layers() -> LayerSet {
        LayerSet {
            parent: 0,
            description: DESCRIPTION_LAYER,
            fact: 2,
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<FakeService>, AttachmentStore, AttachmentRef) {
        let (dir, db) = temp_db();
        let service = Arc::new(FakeService::new());
        service.add_attachment(DESCRIPTION_LAYER, 40, "foto 1.jpg", b"jpeg-bytes");
        let attachment = service.list_attachments(DESCRIPTION_LAYER, 40).unwrap().remove(0);

        let store = AttachmentStore::new(dir.path().join("photos"), Arc::new(db), service.clone(), layers());
        (dir, service, store, attachment)
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("{AB-12}"), "{AB-12}");
        assert_eq!(sanitize_component("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize_component(".."), "_");
        assert_eq!(sanitize_component("  "), "_");
        assert_eq!(sanitize_component("a:b?.jpg"), "a_b_.jpg");
    }

    #[test]
    fn test_materialize_writes_file_then_record() {
        let (_dir, service, store, attachment) = setup();

        let result = store
            .materialize("CA 1", "{G1}", ChildKind::Description, &attachment, false)
            .unwrap();

        assert!(result.fetched);
        assert_eq!(service.fetch_calls(), 1);
        let expected = store.root().join("CA 1").join("{G1}").join("foto 1.jpg");
        assert_eq!(result.record.local_path, expected);
        assert_eq!(fs::read(&expected).unwrap(), b"jpeg-bytes");
        assert_eq!(result.record.size_bytes, Some(10));
    }

    #[test]
    fn test_existing_attachment_skips_network() {
        let (_dir, service, store, attachment) = setup();
        let first = store
            .materialize("S", "G1", ChildKind::Description, &attachment, false)
            .unwrap();

        let second = store
            .materialize("S", "G1", ChildKind::Description, &attachment, false)
            .unwrap();

        assert!(!second.fetched);
        assert_eq!(second.record, first.record);
        assert_eq!(service.fetch_calls(), 1);
    }

    #[test]
    fn test_force_downloads_again() {
        let (_dir, service, store, attachment) = setup();
        store
            .materialize("S", "G1", ChildKind::Description, &attachment, false)
            .unwrap();
        let forced = store
            .materialize("S", "G1", ChildKind::Description, &attachment, true)
            .unwrap();

        assert!(forced.fetched);
        assert_eq!(service.fetch_calls(), 2);
    }

    #[test]
    fn test_same_name_in_both_layers_keeps_both_files() {
        let (_dir, service, store, description) = setup();
        service.add_attachment(2, 50, "foto 1.jpg", b"fact-bytes");
        let fact = service.list_attachments(2, 50).unwrap().remove(0);
        let store = Arc::new(store);

        let results: Vec<Materialized> = std::thread::scope(|scope| {
            let jobs = [(ChildKind::Description, &description), (ChildKind::Fact, &fact)];
            let handles: Vec<_> = jobs
                .into_iter()
                .map(|(layer, attachment)| {
                    let store = store.clone();
                    scope.spawn(move || store.materialize("S", "G1", layer, attachment, false).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_ne!(results[0].record.local_path, results[1].record.local_path);
        assert_eq!(fs::read(&results[0].record.local_path).unwrap(), b"jpeg-bytes");
        assert_eq!(fs::read(&results[1].record.local_path).unwrap(), b"fact-bytes");

        // Placement is stable across later passes
        let again = store.materialize("S", "G1", ChildKind::Fact, &fact, true).unwrap();
        assert_eq!(again.record.local_path, results[1].record.local_path);
        assert_eq!(store.db.photos_for_parent("S", "G1").unwrap().len(), 2);

        let leftovers: Vec<_> = fs::read_dir(store.local_path("S", "G1", "x").parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_failed_fetch_leaves_no_record() {
        let (_dir, service, store, attachment) = setup();
        service.fail_fetch("foto 1.jpg");

        let err = store
            .materialize("S", "G1", ChildKind::Description, &attachment, false)
            .unwrap_err();

        assert!(matches!(err, SyncError::Attachment { .. }));
        assert!(store
            .db
            .find_photo("S", "G1", ChildKind::Description, "foto 1.jpg")
            .unwrap()
            .is_none());
        assert!(!store.local_path("S", "G1", "foto 1.jpg").exists());
    }
}
