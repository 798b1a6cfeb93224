//! The sync orchestrator: pulls a subject's parents and children from the
//! feature service, reconciles them into the store, then materializes the
//! attachments of every child touched by the pass.

use chrono::{Duration, Utc};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::attachments::AttachmentStore;
use crate::config::{Config, FieldNames};
use crate::db::records::CachedFingerprint;
use crate::db::{Database, ParentUpdate, ReconcilePlan};
use crate::error::{require_subject, Result, SyncError};
use crate::records::{normalize_global_id, ChildKind, ChildRecord, ParentRecord};
use crate::remote::{
    clamp_page_size, fetch_all, subject_filter, AttachmentRef, LayerSet, Predicate, RemoteLayerClient,
};
use crate::tasks::{JobStatus, SyncCounters};

/// Parent ids per child-layer `IN (...)` query.
const CHILD_BATCH: usize = 50;

/// Receives phase changes and counter updates while a sync runs.
pub trait SyncProgress: Sync {
    fn phase(&self, status: JobStatus);
    fn counters(&self, counters: &SyncCounters);
}

/// Progress sink that discards everything.
pub struct NoProgress;

impl SyncProgress for NoProgress {
    fn phase(&self, _status: JobStatus) {}
    fn counters(&self, _counters: &SyncCounters) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Ignore freshness and fingerprints, rewriting and re-downloading everything.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SyncResult {
    pub from_cache: bool,
    pub counters: SyncCounters,
    pub parents_written: usize,
    pub parents_deleted: usize,
}

/// A child feature whose attachments need materializing.
#[derive(Debug, Clone)]
struct AttachmentOwner {
    parent_global_id: String,
    kind: ChildKind,
    object_id: i64,
}

pub struct Synchronizer {
    db: Arc<Database>,
    client: Arc<dyn RemoteLayerClient>,
    attachments: AttachmentStore,
    layers: LayerSet,
    fields: FieldNames,
    page_size: usize,
    fresh_for: Duration,
    pool: rayon::ThreadPool,
}

impl Synchronizer {
    pub fn new(config: &Config, db: Arc<Database>, client: Arc<dyn RemoteLayerClient>) -> Result<Self> {
        let layers = LayerSet::from_config(&config.remote);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.attachments.workers.max(1))
            .thread_name(|i| format!("attachments-{}", i))
            .build()
            .map_err(|e| SyncError::Io(std::io::Error::other(e)))?;

        Ok(Self {
            attachments: AttachmentStore::new(config.attachments.path.clone(), db.clone(), client.clone(), layers),
            db,
            client,
            layers,
            fields: config.fields.clone(),
            page_size: clamp_page_size(config.remote.page_size),
            fresh_for: config.cache.fresh_for(),
            pool,
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Bring the local mirror of `subject` up to date.
    pub fn sync(&self, subject: &str, options: SyncOptions, progress: &dyn SyncProgress) -> Result<SyncResult> {
        let subject = require_subject(subject)?;

        progress.phase(JobStatus::CheckingCache);
        if !options.force {
            let summary = self.db.summary(subject)?;
            if summary.is_fresh(Utc::now(), self.fresh_for) {
                tracing::info!(subject, records = summary.record_count, "Serving subject from cache");
                return Ok(SyncResult {
                    from_cache: true,
                    ..SyncResult::default()
                });
            }
        }

        progress.phase(JobStatus::Syncing);
        let mut counters = SyncCounters::default();
        let plan = self.collect(subject, options, &mut counters, progress)?;

        let stats = self.db.apply_reconciliation(subject, &plan, Utc::now())?;
        tracing::info!(
            subject,
            seen = plan.seen.len(),
            written = stats.written,
            unchanged = stats.unchanged,
            deleted = stats.deleted,
            "Reconciliation committed"
        );

        progress.phase(JobStatus::DownloadingPhotos);
        let owners: Vec<AttachmentOwner> = plan
            .changed
            .iter()
            .flat_map(|update| {
                update.children.iter().map(move |child| AttachmentOwner {
                    parent_global_id: update.parent.global_id().to_string(),
                    kind: child.kind(),
                    object_id: child.fields.object_id(),
                })
            })
            .collect();
        self.download_attachments(subject, &owners, options.force, &mut counters, progress);

        let record_count = self.db.count_parents(subject)?;
        self.db.record_sync(subject, Utc::now(), record_count)?;

        tracing::info!(
            subject,
            fetched = counters.fetched,
            attachments = counters.attachments_downloaded,
            failed = counters.attachments_failed,
            "Sync finished"
        );

        Ok(SyncResult {
            from_cache: false,
            counters,
            parents_written: stats.written,
            parents_deleted: stats.deleted,
        })
    }

    /// Page through the parent layer and build the reconciliation plan.
    /// No store writes happen here.
    fn collect(
        &self,
        subject: &str,
        options: SyncOptions,
        counters: &mut SyncCounters,
        progress: &dyn SyncProgress,
    ) -> Result<ReconcilePlan> {
        let filter = subject_filter(&self.fields.code, &self.fields.alt_code, subject);

        match self.client.count(self.layers.parent, &filter) {
            Ok(total) => counters.total = total,
            Err(e) => tracing::warn!(subject, error = %e, "Count request failed, progress total unknown"),
        }
        progress.counters(counters);

        let cached = self.db.parent_fingerprints(subject)?;
        let mut plan = ReconcilePlan::default();
        let mut offset = 0;

        loop {
            let page = self.client.query(self.layers.parent, &filter, &[], offset, self.page_size)?;
            let received = page.features.len();

            let mut changed = Vec::new();
            for feature in &page.features {
                let parent = match ParentRecord::from_feature(feature, &self.fields) {
                    Ok(parent) => parent,
                    Err(e) => {
                        tracing::warn!(subject, error = %e, "Skipping malformed parent feature");
                        continue;
                    }
                };
                if !plan.seen.insert(parent.global_id().to_string()) {
                    tracing::debug!(subject, global_id = parent.global_id(), "Duplicate parent across pages");
                    continue;
                }
                if options.force || !is_unchanged(cached.get(parent.global_id()), &parent) {
                    changed.push(parent);
                }
            }

            plan.changed.extend(self.with_children(changed)?);

            counters.fetched += received as u64;
            if counters.total < counters.fetched {
                counters.total = counters.fetched;
            }
            progress.counters(counters);

            if !page.has_more || received == 0 {
                break;
            }
            offset += received;
        }

        Ok(plan)
    }

    /// Fetch both child layers for the given parents and attach each child to
    /// its parent.
    fn with_children(&self, parents: Vec<ParentRecord>) -> Result<Vec<ParentUpdate>> {
        if parents.is_empty() {
            return Ok(Vec::new());
        }

        let index: HashMap<String, usize> = parents
            .iter()
            .enumerate()
            .map(|(i, p)| (normalize_global_id(p.global_id()), i))
            .collect();
        let mut updates: Vec<ParentUpdate> = parents
            .into_iter()
            .map(|parent| ParentUpdate {
                parent,
                children: Vec::new(),
            })
            .collect();

        let ids: Vec<String> = updates.iter().map(|u| u.parent.global_id().to_string()).collect();
        for chunk in ids.chunks(CHILD_BATCH) {
            let filter = Predicate::in_list(self.fields.parent_link.clone(), chunk.to_vec());
            for kind in ChildKind::ALL {
                let features = fetch_all(self.client.as_ref(), self.layers.child(kind), &filter, self.page_size)?;
                for feature in &features {
                    let mut child = match ChildRecord::from_feature(kind, feature, &self.fields) {
                        Ok(child) => child,
                        Err(e) => {
                            tracing::warn!(layer = %kind, error = %e, "Skipping malformed child feature");
                            continue;
                        }
                    };
                    let key = normalize_global_id(child.fields.parent_global_id());
                    match index.get(&key) {
                        Some(&i) => {
                            let update = &mut updates[i];
                            child.fields.set_parent_global_id(update.parent.global_id());
                            update.children.push(child);
                        }
                        None => tracing::warn!(
                            layer = %kind,
                            parent = %key,
                            "Child references a parent outside this batch"
                        ),
                    }
                }
            }
        }

        Ok(updates)
    }

    /// List and materialize attachments on the worker pool. Failures are
    /// counted and logged, never returned.
    fn download_attachments(
        &self,
        subject: &str,
        owners: &[AttachmentOwner],
        force: bool,
        counters: &mut SyncCounters,
        progress: &dyn SyncProgress,
    ) {
        if owners.is_empty() {
            progress.counters(counters);
            return;
        }

        let listed: Vec<(&AttachmentOwner, Result<Vec<AttachmentRef>>)> = self.pool.install(|| {
            owners
                .par_iter()
                .map(|owner| {
                    let layer = self.layers.child(owner.kind);
                    (owner, self.client.list_attachments(layer, owner.object_id))
                })
                .collect()
        });

        let mut work = Vec::new();
        for (owner, result) in listed {
            match result {
                Ok(refs) => work.extend(refs.into_iter().map(|r| (owner, r))),
                Err(e) => {
                    counters.attachments_failed += 1;
                    tracing::warn!(
                        subject,
                        layer = %owner.kind,
                        object_id = owner.object_id,
                        error = %e,
                        "Attachment listing failed"
                    );
                }
            }
        }
        counters.attachments_total += work.len() as u64;
        progress.counters(counters);

        let shared = Mutex::new(*counters);
        self.pool.install(|| {
            work.par_iter().for_each(|(owner, attachment)| {
                let outcome = self
                    .attachments
                    .materialize(subject, &owner.parent_global_id, owner.kind, attachment, force);

                let mut c = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                match outcome {
                    Ok(_) => c.attachments_downloaded += 1,
                    Err(e) => {
                        c.attachments_failed += 1;
                        tracing::warn!(subject, parent = %owner.parent_global_id, error = %e, "Attachment skipped");
                    }
                }
                progress.counters(&c);
            });
        });

        *counters = shared.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
    }
}

fn is_unchanged(cached: Option<&CachedFingerprint>, parent: &ParentRecord) -> bool {
    matches!(cached, Some(c) if !c.deleted && c.fingerprint == parent.fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;
    use crate::query::{CompositeQuery, QueryEngine};
    use crate::remote::fake::{FakeService, DESCRIPTION_LAYER, FACT_LAYER};
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        db: Arc<Database>,
        service: Arc<FakeService>,
        sync: Synchronizer,
    }

    fn fixture(fresh_for_secs: u64) -> Fixture {
        let (dir, db) = temp_db();
        let db = Arc::new(db);
        let service = Arc::new(FakeService::new());

        let mut config = Config::default();
        config.attachments.path = dir.path().join("photos");
        config.attachments.workers = 2;
        config.remote.page_size = 2;
        config.cache.fresh_for_secs = fresh_for_secs;

        let sync = Synchronizer::new(&config, db.clone(), service.clone()).unwrap();
        Fixture { dir, db, service, sync }
    }

    /// Three parents of subject X, one description and one fact each, and
    /// five attachments spread over the children.
    fn seed(service: &FakeService) {
        for (i, gid) in ["G1", "G2", "G3"].iter().enumerate() {
            let oid = i as i64 + 1;
            service.add_parent(json!({
                "objectid": oid, "globalid": gid, "cod_accion": "X", "actividad": "poda"
            }));
            service.add_feature(
                DESCRIPTION_LAYER,
                json!({ "objectid": 10 + oid, "parentglobalid": gid, "descripcion": format!("d{}", oid) }),
            );
            service.add_feature(
                FACT_LAYER,
                json!({ "objectid": 20 + oid, "parentglobalid": gid, "hecho_detec": "derrame" }),
            );
        }
        service.add_parent(json!({ "objectid": 9, "globalid": "OTHER", "cod_accion": "Y" }));

        service.add_attachment(DESCRIPTION_LAYER, 11, "a.jpg", b"a");
        service.add_attachment(DESCRIPTION_LAYER, 11, "b.jpg", b"b");
        service.add_attachment(DESCRIPTION_LAYER, 12, "c.jpg", b"c");
        service.add_attachment(FACT_LAYER, 21, "d.jpg", b"d");
        service.add_attachment(FACT_LAYER, 23, "e.jpg", b"e");
    }

    struct Recorder {
        phases: Mutex<Vec<JobStatus>>,
        last: Mutex<SyncCounters>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                phases: Mutex::new(Vec::new()),
                last: Mutex::new(SyncCounters::default()),
            }
        }
    }

    impl SyncProgress for Recorder {
        fn phase(&self, status: JobStatus) {
            self.phases.lock().unwrap().push(status);
        }

        fn counters(&self, counters: &SyncCounters) {
            *self.last.lock().unwrap() = *counters;
        }
    }

    #[test]
    fn test_first_sync_cache_hit_then_forced_redownload() {
        let f = fixture(3600);
        seed(&f.service);

        let recorder = Recorder::new();
        let first = f.sync.sync("X", SyncOptions::default(), &recorder).unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.counters.fetched, 3);
        assert_eq!(first.counters.total, 3);
        assert_eq!(first.counters.attachments_total, 5);
        assert_eq!(first.counters.attachments_downloaded, 5);
        assert_eq!(first.counters.attachments_failed, 0);
        assert_eq!(f.service.fetch_calls(), 5);
        assert_eq!(
            *recorder.phases.lock().unwrap(),
            vec![JobStatus::CheckingCache, JobStatus::Syncing, JobStatus::DownloadingPhotos]
        );
        assert_eq!(*recorder.last.lock().unwrap(), first.counters);

        let photo = f.dir.path().join("photos").join("X").join("G1").join("a.jpg");
        assert_eq!(std::fs::read(photo).unwrap(), b"a");
        assert_eq!(f.db.count_photos("X").unwrap(), 5);

        let queries = f.service.query_calls();
        let second = f.sync.sync("X", SyncOptions::default(), &NoProgress).unwrap();
        assert!(second.from_cache);
        assert_eq!(second.counters, SyncCounters::default());
        assert_eq!(f.service.query_calls(), queries);

        let third = f.sync.sync("X", SyncOptions { force: true }, &NoProgress).unwrap();
        assert!(!third.from_cache);
        assert_eq!(third.counters.attachments_downloaded, 5);
        assert_eq!(f.service.fetch_calls(), 10);
    }

    #[test]
    fn test_resync_without_changes_writes_nothing() {
        let f = fixture(0);
        seed(&f.service);

        let first = f.sync.sync("X", SyncOptions::default(), &NoProgress).unwrap();
        assert_eq!(first.parents_written, 3);

        let listings = f.service.listing_calls();
        let second = f.sync.sync("X", SyncOptions::default(), &NoProgress).unwrap();
        assert!(!second.from_cache);
        assert_eq!(second.parents_written, 0);
        assert_eq!(second.parents_deleted, 0);
        assert_eq!(second.counters.fetched, 3);
        assert_eq!(f.service.listing_calls(), listings);
        assert_eq!(f.service.fetch_calls(), 5);
        assert_eq!(f.db.count_parents("X").unwrap(), 3);
    }

    #[test]
    fn test_only_changed_parent_is_rewritten() {
        let f = fixture(0);
        seed(&f.service);
        f.sync.sync("X", SyncOptions::default(), &NoProgress).unwrap();
        let before = f.db.get_parent("G2").unwrap().unwrap();

        f.service.update_parent("G1", "actividad", json!("riego"));
        let result = f.sync.sync("X", SyncOptions::default(), &NoProgress).unwrap();

        assert_eq!(result.parents_written, 1);
        let g1 = f.db.get_parent("G1").unwrap().unwrap();
        assert_eq!(g1.fields.activity.as_deref(), Some("riego"));
        assert_eq!(f.db.children("G1").unwrap().len(), 2);

        let after = f.db.get_parent("G2").unwrap().unwrap();
        assert_eq!(after.synced_at, before.synced_at);
        assert_eq!(after.fingerprint, before.fingerprint);
    }

    #[test]
    fn test_missing_parent_is_soft_deleted() {
        let f = fixture(0);
        seed(&f.service);
        f.sync.sync("X", SyncOptions::default(), &NoProgress).unwrap();

        f.service.remove_parent("G3");
        let result = f.sync.sync("X", SyncOptions::default(), &NoProgress).unwrap();

        assert_eq!(result.parents_deleted, 1);
        assert!(f.db.get_parent("G3").unwrap().unwrap().deleted);
        assert_eq!(f.db.count_parents("X").unwrap(), 2);
        assert_eq!(f.db.summary("X").unwrap().record_count, 2);
    }

    #[test]
    fn test_parent_matching_two_subjects_stays_in_both() {
        let f = fixture(0);
        seed(&f.service);
        f.service.update_parent("G1", "cod_accion_alt", json!("Y"));

        let x = f.sync.sync("X", SyncOptions::default(), &NoProgress).unwrap();
        assert_eq!(x.parents_written, 3);
        let y = f.sync.sync("Y", SyncOptions::default(), &NoProgress).unwrap();
        assert_eq!(y.parents_written, 2);
        assert_eq!(y.parents_deleted, 0);

        let page = QueryEngine::new(&f.db).query(&CompositeQuery::new("X")).unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(f.db.summary("X").unwrap().record_count, 3);
        assert_eq!(f.db.count_parents("Y").unwrap(), 2);

        // Alternating syncs settle instead of rewriting the shared row
        let x_again = f.sync.sync("X", SyncOptions::default(), &NoProgress).unwrap();
        let y_again = f.sync.sync("Y", SyncOptions::default(), &NoProgress).unwrap();
        assert_eq!(x_again.parents_written, 0);
        assert_eq!(y_again.parents_written, 0);
        assert_eq!(f.db.count_parents("X").unwrap(), 3);
    }

    #[test]
    fn test_remote_failure_aborts_without_marking_sync() {
        let f = fixture(3600);
        seed(&f.service);
        f.service.fail_queries("Invalid query");

        let err = f.sync.sync("X", SyncOptions::default(), &NoProgress).unwrap_err();
        assert!(matches!(err, SyncError::RemoteService(ref m) if m.contains("Invalid query")));

        let summary = f.db.summary("X").unwrap();
        assert!(summary.last_sync_at.is_none());
        assert_eq!(summary.record_count, 0);
    }

    #[test]
    fn test_attachment_failure_is_not_fatal() {
        let f = fixture(3600);
        seed(&f.service);
        f.service.fail_fetch("c.jpg");

        let result = f.sync.sync("X", SyncOptions::default(), &NoProgress).unwrap();
        assert_eq!(result.counters.attachments_total, 5);
        assert_eq!(result.counters.attachments_downloaded, 4);
        assert_eq!(result.counters.attachments_failed, 1);
        assert_eq!(f.db.count_photos("X").unwrap(), 4);
        assert!(f.db.summary("X").unwrap().last_sync_at.is_some());
    }

    #[test]
    fn test_blank_subject_is_rejected() {
        let f = fixture(0);
        let err = f.sync.sync("  ", SyncOptions::default(), &NoProgress).unwrap_err();
        assert!(matches!(err, SyncError::SubjectRequired));
        assert_eq!(f.service.query_calls(), 0);
    }
}
