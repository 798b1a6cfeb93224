pub const SCHEMA: &str = r#"
-- Parent features: one row per remote supervision point, never physically deleted
CREATE TABLE IF NOT EXISTS parent_records (
    global_id TEXT PRIMARY KEY,
    object_id INTEGER NOT NULL,
    subject TEXT NOT NULL,   -- subject whose sync last rewrote the row

    -- Flattened attributes
    code TEXT,
    alt_code TEXT,
    supervisor TEXT,
    site_component TEXT,
    component_type TEXT,
    activity TEXT,
    reference_installation TEXT,
    surveyed_at INTEGER,     -- epoch milliseconds
    edited_at INTEGER,       -- remote last-modified, epoch milliseconds
    longitude REAL,
    latitude REAL,
    extra TEXT NOT NULL DEFAULT '{}',  -- unmapped attributes as JSON

    raw TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    synced_at TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0   -- no subject keeps it live
);

CREATE INDEX IF NOT EXISTS idx_parent_surveyed ON parent_records(surveyed_at);

-- Subject membership. A parent matches every subject naming it in code or
-- alt_code, and each subject tracks its own soft-delete flag.
CREATE TABLE IF NOT EXISTS subject_parents (
    subject TEXT NOT NULL,
    global_id TEXT NOT NULL,
    synced_at TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (subject, global_id)
);

CREATE INDEX IF NOT EXISTS idx_subject_parents_live ON subject_parents(subject, deleted);

-- Child layers, replaced wholesale whenever their parent is rewritten
CREATE TABLE IF NOT EXISTS description_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_global_id TEXT NOT NULL,
    object_id INTEGER NOT NULL,
    global_id TEXT,
    description TEXT,
    extra TEXT NOT NULL DEFAULT '{}',
    raw TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_description_parent ON description_records(parent_global_id);

CREATE TABLE IF NOT EXISTS fact_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_global_id TEXT NOT NULL,
    object_id INTEGER NOT NULL,
    global_id TEXT,
    fact TEXT,
    extra TEXT NOT NULL DEFAULT '{}',
    raw TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_fact_parent ON fact_records(parent_global_id);
CREATE INDEX IF NOT EXISTS idx_fact_value ON fact_records(fact);

-- Downloaded attachments; a row means the file is on disk
CREATE TABLE IF NOT EXISTS photo_attachments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subject TEXT NOT NULL,
    parent_global_id TEXT NOT NULL,
    layer TEXT NOT NULL,              -- 'descriptions' or 'facts'
    object_id INTEGER NOT NULL,       -- owning child feature
    attachment_id INTEGER NOT NULL,
    filename TEXT NOT NULL,
    local_path TEXT NOT NULL,
    content_type TEXT,
    size_bytes INTEGER,
    downloaded_at TEXT NOT NULL,
    UNIQUE (subject, parent_global_id, layer, filename)
);

CREATE INDEX IF NOT EXISTS idx_photo_parent ON photo_attachments(subject, parent_global_id);

-- Last successful sync per subject
CREATE TABLE IF NOT EXISTS subject_syncs (
    subject TEXT PRIMARY KEY,
    last_sync_at TEXT NOT NULL,
    record_count INTEGER NOT NULL DEFAULT 0
);

-- Sync jobs, mirrored from the in-process tracker
CREATE TABLE IF NOT EXISTS sync_jobs (
    id INTEGER PRIMARY KEY,
    subject TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    total INTEGER NOT NULL DEFAULT 0,
    fetched INTEGER NOT NULL DEFAULT 0,
    attachments_total INTEGER NOT NULL DEFAULT 0,
    attachments_downloaded INTEGER NOT NULL DEFAULT 0,
    attachments_failed INTEGER NOT NULL DEFAULT 0,
    from_cache INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_jobs_status ON sync_jobs(status);
"#;

/// Additive migrations for databases created by earlier versions. Each one is
/// allowed to fail or do nothing when already applied.
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE sync_jobs ADD COLUMN attachments_failed INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE photo_attachments ADD COLUMN content_type TEXT",
    "INSERT OR IGNORE INTO subject_parents (subject, global_id, synced_at, deleted) \
     SELECT subject, global_id, synced_at, deleted FROM parent_records",
];
