use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "SURVEY_MIRROR_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub fields: FieldNames,

    #[serde(default)]
    pub attachments: AttachmentConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// FeatureServer root, e.g. `https://services.arcgis.com/<org>/arcgis/rest/services/<name>/FeatureServer`
    #[serde(default)]
    pub base_url: String,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_page_size")]
    pub page_size: usize,

    #[serde(default)]
    pub parent_layer: u32,

    #[serde(default = "default_description_layer")]
    pub description_layer: u32,

    #[serde(default = "default_fact_layer")]
    pub fact_layer: u32,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_page_size() -> usize {
    1000
}

fn default_description_layer() -> u32 {
    1
}

fn default_fact_layer() -> u32 {
    2
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: None,
            timeout_secs: default_timeout_secs(),
            page_size: default_page_size(),
            parent_layer: 0,
            description_layer: default_description_layer(),
            fact_layer: default_fact_layer(),
        }
    }
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Remote attribute names mapped onto the typed record fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldNames {
    pub object_id: String,
    pub global_id: String,
    /// Linkage field on both child layers, holding the parent's global id.
    pub parent_link: String,
    pub code: String,
    pub alt_code: String,
    pub supervisor: String,
    pub site_component: String,
    pub component_type: String,
    pub activity: String,
    pub reference_installation: String,
    pub surveyed_at: String,
    pub edited_at: String,
    pub description: String,
    pub detected_fact: String,
}

impl Default for FieldNames {
    fn default() -> Self {
        Self {
            object_id: "objectid".to_string(),
            global_id: "globalid".to_string(),
            parent_link: "parentglobalid".to_string(),
            code: "cod_accion".to_string(),
            alt_code: "cod_accion_alt".to_string(),
            supervisor: "supervisor".to_string(),
            site_component: "componente".to_string(),
            component_type: "tipo_componente".to_string(),
            activity: "actividad".to_string(),
            reference_installation: "instalacion_ref".to_string(),
            surveyed_at: "fecha".to_string(),
            edited_at: "EditDate".to_string(),
            description: "descripcion".to_string(),
            detected_fact: "hecho_detec".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentConfig {
    #[serde(default = "default_attachment_path")]
    pub path: PathBuf,

    /// Size of the download worker pool.
    #[serde(default = "default_attachment_workers")]
    pub workers: usize,
}

fn default_attachment_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("survey-mirror/photos")
}

fn default_attachment_workers() -> usize {
    4
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            path: default_attachment_path(),
            workers: default_attachment_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// A subject synced more recently than this is served from cache.
    #[serde(default = "default_fresh_for_secs")]
    pub fresh_for_secs: u64,

    /// How long finished jobs stay pollable.
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,

    #[serde(default = "default_preview_page_size")]
    pub preview_page_size: usize,
}

fn default_fresh_for_secs() -> u64 {
    60 * 60
}

fn default_job_retention_secs() -> u64 {
    30 * 60
}

fn default_preview_page_size() -> usize {
    25
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fresh_for_secs: default_fresh_for_secs(),
            job_retention_secs: default_job_retention_secs(),
            preview_page_size: default_preview_page_size(),
        }
    }
}

/// Seconds as a duration, saturating at the largest representable one.
fn saturating_seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

impl CacheConfig {
    pub fn fresh_for(&self) -> chrono::Duration {
        saturating_seconds(self.fresh_for_secs)
    }

    pub fn job_retention(&self) -> chrono::Duration {
        saturating_seconds(self.job_retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Subjects refreshed on every daemon pass.
    #[serde(default)]
    pub subjects: Vec<String>,

    #[serde(default = "default_daemon_interval")]
    pub interval_secs: u64,
}

fn default_daemon_interval() -> u64 {
    15 * 60
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            subjects: Vec::new(),
            interval_secs: default_daemon_interval(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("survey-mirror")
        .join("cache.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            remote: RemoteConfig::default(),
            fields: FieldNames::default(),
            attachments: AttachmentConfig::default(),
            cache: CacheConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

impl Config {
    /// Load from `SURVEY_MIRROR_CONFIG` or the default location, writing a
    /// default file when none exists yet.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("survey-mirror")
    }

    fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [remote]
            base_url = "https://example.test/FeatureServer"
            page_size = 500

            [fields]
            code = "codigo"
            "#,
        )
        .unwrap();

        assert_eq!(config.remote.page_size, 500);
        assert_eq!(config.remote.description_layer, 1);
        assert_eq!(config.fields.code, "codigo");
        assert_eq!(config.fields.parent_link, "parentglobalid");
        assert_eq!(config.cache.fresh_for_secs, 3600);
        assert_eq!(config.attachments.workers, 4);
    }

    #[test]
    fn test_huge_cache_windows_saturate() {
        let config: Config = toml::from_str(
            r#"
            [cache]
            fresh_for_secs = 10000000000000000
            job_retention_secs = 18446744073709551615
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.fresh_for(), chrono::Duration::MAX);
        assert_eq!(config.cache.job_retention(), chrono::Duration::MAX);
        assert_eq!(CacheConfig::default().fresh_for(), chrono::Duration::hours(1));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.daemon.subjects = vec!["CA-7".to_string()];
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.daemon.subjects, vec!["CA-7".to_string()]);
        assert_eq!(loaded.remote.fact_layer, 2);
    }
}
