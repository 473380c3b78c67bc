use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::embeddings::DistanceMetric;
use crate::sync::backoff::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found at {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Configuration stored in ~/.adkiosk/config.json
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Identity of this kiosk. Stamped on every locally written synced row.
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// IANA zone used to evaluate ad time-of-day windows.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Config {
    /// Minimal config for a device, everything else defaulted.
    pub fn for_device(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            data_dir: None,
            timezone: default_timezone(),
            identity: IdentityConfig::default(),
            selection: SelectionConfig::default(),
            sync: SyncConfig::default(),
            object_store: ObjectStoreConfig::default(),
            backup: BackupConfig::default(),
            catalog: CatalogConfig::default(),
        }
    }

    pub fn tz(&self) -> Result<chrono_tz::Tz, ConfigError> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| ConfigError::Invalid(format!("unknown timezone: {}", self.timezone)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.trim().is_empty() {
            return Err(ConfigError::Invalid("deviceId must not be empty".into()));
        }
        if self.device_id.contains('/') {
            return Err(ConfigError::Invalid("deviceId must not contain '/'".into()));
        }
        self.tz()?;

        let identity = &self.identity;
        if !(identity.threshold.is_finite() && identity.threshold > 0.0) {
            return Err(ConfigError::Invalid("identity.threshold must be positive".into()));
        }
        if identity.embedding_dim == 0 {
            return Err(ConfigError::Invalid("identity.embeddingDim must be positive".into()));
        }
        if !(0.0..=1.0).contains(&identity.refine_alpha) {
            return Err(ConfigError::Invalid("identity.refineAlpha must be within [0, 1]".into()));
        }

        let selection = &self.selection;
        if !(selection.weight_floor.is_finite() && selection.weight_floor > 0.0) {
            return Err(ConfigError::Invalid("selection.weightFloor must be positive".into()));
        }
        if !(0.0..=1.0).contains(&selection.recency_floor) || selection.recency_floor == 0.0 {
            return Err(ConfigError::Invalid("selection.recencyFloor must be within (0, 1]".into()));
        }
        if selection.recency_half_life_secs <= 0.0 {
            return Err(ConfigError::Invalid("selection.recencyHalfLifeSecs must be positive".into()));
        }
        if selection.max_variety_bonus < 1.0 || selection.mood_bonus <= 0.0 {
            return Err(ConfigError::Invalid(
                "selection.maxVarietyBonus must be >= 1 and selection.moodBonus positive".into(),
            ));
        }

        if self.sync.enabled {
            let url = self
                .sync
                .remote_url
                .as_deref()
                .ok_or_else(|| ConfigError::Invalid("sync.remoteUrl is required when sync is enabled".into()))?;
            require_https(url, "sync.remoteUrl")?;
        }
        if self.sync.batch_size == 0 {
            return Err(ConfigError::Invalid("sync.batchSize must be positive".into()));
        }
        if let Some(url) = self.object_store.url.as_deref() {
            require_https(url, "objectStore.url")?;
        }
        if (self.backup.enabled || self.catalog.enabled)
            && self.object_store.url.is_none()
            && self.object_store.dir.is_none()
        {
            return Err(ConfigError::Invalid(
                "objectStore.url or objectStore.dir is required for backup and catalog ingest".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding the database and downloaded media.
    pub fn resolved_data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::home_dir()
                .map(|home| home.join(".adkiosk"))
                .ok_or(ConfigError::HomeDirNotFound),
        }
    }

    pub fn resolved_media_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.catalog.media_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.resolved_data_dir()?.join("media")),
        }
    }
}

fn require_https(raw: &str, field: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(raw).map_err(|e| ConfigError::Invalid(format!("{}: {}", field, e)))?;
    if parsed.scheme() != "https" {
        return Err(ConfigError::Invalid(format!("{} must use https", field)));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityConfig {
    #[serde(default)]
    pub metric: DistanceMetric,
    /// A match must be strictly closer than this.
    #[serde(default = "default_match_threshold")]
    pub threshold: f32,
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
    #[serde(default = "default_refine_alpha")]
    pub refine_alpha: f32,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_frame_throttle_secs")]
    pub frame_throttle_secs: i64,
}

fn default_match_threshold() -> f32 {
    0.35
}
fn default_embedding_dim() -> usize {
    128
}
fn default_refine_alpha() -> f32 {
    0.1
}
fn default_retention_days() -> i64 {
    90
}
fn default_frame_throttle_secs() -> i64 {
    600
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            metric: DistanceMetric::default(),
            threshold: default_match_threshold(),
            embedding_dim: default_embedding_dim(),
            refine_alpha: default_refine_alpha(),
            retention_days: default_retention_days(),
            frame_throttle_secs: default_frame_throttle_secs(),
        }
    }
}

/// Coefficients of the ad weighting policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionConfig {
    /// An ad shown less than this many seconds ago is not eligible, unless it
    /// is the only candidate.
    #[serde(default = "default_min_repeat_secs")]
    pub min_repeat_secs: i64,
    #[serde(default = "default_recency_floor")]
    pub recency_floor: f64,
    #[serde(default = "default_recency_half_life_secs")]
    pub recency_half_life_secs: f64,
    #[serde(default = "default_variety_window_secs")]
    pub variety_window_secs: i64,
    #[serde(default = "default_variety_strength")]
    pub variety_strength: f64,
    #[serde(default = "default_max_variety_bonus")]
    pub max_variety_bonus: f64,
    #[serde(default = "default_mood_bonus")]
    pub mood_bonus: f64,
    #[serde(default = "default_weight_floor")]
    pub weight_floor: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

fn default_min_repeat_secs() -> i64 {
    60
}
fn default_recency_floor() -> f64 {
    0.2
}
fn default_recency_half_life_secs() -> f64 {
    300.0
}
fn default_variety_window_secs() -> i64 {
    3600
}
fn default_variety_strength() -> f64 {
    0.5
}
fn default_max_variety_bonus() -> f64 {
    2.0
}
fn default_mood_bonus() -> f64 {
    1.5
}
fn default_weight_floor() -> f64 {
    0.01
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_repeat_secs: default_min_repeat_secs(),
            recency_floor: default_recency_floor(),
            recency_half_life_secs: default_recency_half_life_secs(),
            variety_window_secs: default_variety_window_secs(),
            variety_strength: default_variety_strength(),
            max_variety_bonus: default_max_variety_bonus(),
            mood_bonus: default_mood_bonus(),
            weight_floor: default_weight_floor(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    /// Environment variable holding the bearer token for the remote store.
    #[serde(default = "default_sync_token_env")]
    pub token_env: String,
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_sync_token_env() -> String {
    "ADKIOSK_SYNC_TOKEN".to_string()
}
fn default_sync_interval_secs() -> u64 {
    300
}
fn default_batch_size() -> usize {
    500
}
fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            remote_url: None,
            token_env: default_sync_token_env(),
            interval_secs: default_sync_interval_secs(),
            batch_size: default_batch_size(),
            request_timeout_secs: default_request_timeout_secs(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Where backups go and the media catalog comes from. Either an https
/// endpoint or a local (e.g. mounted) directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStoreConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_backup_interval_minutes")]
    pub interval_minutes: u64,
}

fn default_backup_interval_minutes() -> u64 {
    60
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: default_backup_interval_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Key prefix under which catalog media is laid out.
    #[serde(default = "default_catalog_prefix")]
    pub prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_dir: Option<PathBuf>,
    #[serde(default = "default_catalog_interval_secs")]
    pub interval_secs: u64,
}

fn default_catalog_prefix() -> String {
    "ads".to_string()
}
fn default_catalog_interval_secs() -> u64 {
    600
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prefix: default_catalog_prefix(),
            media_dir: None,
            interval_secs: default_catalog_interval_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config: Config = serde_json::from_str(r#"{ "deviceId": "kiosk-01" }"#).unwrap();
        assert_eq!(config.timezone, "UTC");
        assert_eq!(config.identity.embedding_dim, 128);
        assert_eq!(config.selection.min_repeat_secs, 60);
        assert_eq!(config.sync.retry.max_attempts, 3);
        assert!(!config.sync.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_nested_overrides_parse() {
        let config: Config = serde_json::from_str(
            r#"{
                "deviceId": "kiosk-02",
                "timezone": "Europe/Berlin",
                "identity": { "metric": "euclidean", "threshold": 0.6 },
                "selection": { "seed": 7, "moodBonus": 2.0 },
                "sync": { "enabled": true, "remoteUrl": "https://sync.example.com/v1",
                          "retry": { "maxAttempts": 5 } }
            }"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.identity.metric, DistanceMetric::Euclidean);
        assert_eq!(config.selection.seed, Some(7));
        assert_eq!(config.sync.retry.max_attempts, 5);
        assert_eq!(config.sync.retry.initial_backoff_ms, RetryPolicy::default().initial_backoff_ms);
        assert_eq!(config.tz().unwrap(), chrono_tz::Europe::Berlin);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::for_device("");
        assert!(config.validate().is_err());

        config = Config::for_device("kiosk-01");
        config.timezone = "Mars/Olympus".into();
        assert!(config.validate().is_err());

        config = Config::for_device("kiosk-01");
        config.sync.enabled = true;
        config.sync.remote_url = Some("http://sync.example.com".into());
        assert!(config.validate().is_err());

        config = Config::for_device("kiosk-01");
        config.identity.threshold = 0.0;
        assert!(config.validate().is_err());

        config = Config::for_device("kiosk-01");
        config.backup.enabled = true;
        assert!(config.validate().is_err());
    }
}
