use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;

use crate::db::{DbError, KioskDb, SharedDb};
use crate::identity::IdentityResolver;
use crate::object_store::{self, ObjectStore, ObjectStoreError};
use crate::selection::draw::RngDraws;
use crate::selection::AdSelector;
use crate::sync::engine::SyncEngine;
use crate::sync::remote::{EnvCredentials, HttpRemoteStore, RemoteError, RemoteStore};
use crate::types::{Config, ConfigError};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to open local store: {0}")]
    Store(#[from] DbError),

    #[error("Failed to set up remote store: {0}")]
    Remote(#[from] RemoteError),

    #[error("Failed to set up object store: {0}")]
    ObjectStore(#[from] ObjectStoreError),
}

/// Everything a running kiosk shares between the detection path and the
/// background pollers.
pub struct AppState {
    pub config: Config,
    pub db: SharedDb,
    pub resolver: Arc<IdentityResolver>,
    pub selector: Arc<AdSelector>,
    /// `None` when sync is disabled.
    pub sync: Option<Arc<SyncEngine>>,
    /// `None` when neither backup nor catalog ingest has somewhere to go.
    pub object_store: Option<Arc<dyn ObjectStore>>,
    /// Notify to wake the sync poller for an immediate round.
    pub sync_wake: Arc<Notify>,
}

impl AppState {
    /// Open the store under the configured data directory and wire up the
    /// remote and object stores the config asks for.
    pub fn open(config: Config) -> Result<Self, StartupError> {
        config.validate()?;
        let db = KioskDb::open_in(&config.resolved_data_dir()?, &config.device_id)?;

        let remote: Option<Arc<dyn RemoteStore>> = match config.sync.remote_url.as_deref() {
            Some(url) if config.sync.enabled => {
                let credentials = Arc::new(EnvCredentials::new(config.sync.token_env.clone()));
                let timeout = Duration::from_secs(config.sync.request_timeout_secs.max(1));
                Some(Arc::new(HttpRemoteStore::new(url, credentials, timeout)?))
            }
            _ => None,
        };
        let object_store = object_store::from_config(&config.object_store)?;

        Self::assemble(config, db, remote, object_store)
    }

    /// Build state around an already-open store. Used by `open` and by
    /// callers that bring their own remote (loopback deployments, tests).
    pub fn assemble(
        config: Config,
        db: KioskDb,
        remote: Option<Arc<dyn RemoteStore>>,
        object_store: Option<Arc<dyn ObjectStore>>,
    ) -> Result<Self, StartupError> {
        if db.device_id() != config.device_id {
            return Err(ConfigError::Invalid(format!(
                "store belongs to {} but config names {}",
                db.device_id(),
                config.device_id
            ))
            .into());
        }
        let tz = config.tz()?;
        let db = db.into_shared();

        let resolver = Arc::new(IdentityResolver::new(db.clone(), config.identity.clone()));
        let selector = Arc::new(AdSelector::new(
            db.clone(),
            config.selection.clone(),
            tz,
            Box::new(RngDraws::from_config(config.selection.seed)),
        ));
        let sync = remote.map(|remote| Arc::new(SyncEngine::new(db.clone(), remote, config.sync.clone())));

        Ok(Self {
            config,
            db,
            resolver,
            selector,
            sync,
            object_store,
            sync_wake: Arc::new(Notify::new()),
        })
    }

    /// Ask the sync poller for a round now instead of at the next interval.
    pub fn request_sync(&self) {
        self.sync_wake.notify_one();
    }
}

/// Default config location: `~/.adkiosk/config.json`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;
    Ok(home.join(".adkiosk").join("config.json"))
}

/// Load and validate the config from `path`, or from the default location.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Err(ConfigError::NotFound(config_path));
    }

    let content = fs::read_to_string(&config_path)?;
    let config: Config = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::sync::remote::MemoryRemoteStore;
    use tempfile::tempdir;

    #[test]
    fn test_load_config_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        assert!(matches!(load_config(Some(&path)), Err(ConfigError::NotFound(p)) if p == path));
    }

    #[test]
    fn test_load_config_validates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        fs::write(&path, r#"{ "deviceId": "kiosk-01", "timezone": "Europe/Berlin" }"#).unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.device_id, "kiosk-01");

        fs::write(&path, r#"{ "deviceId": "kiosk-01", "timezone": "Mars/Olympus" }"#).unwrap();
        assert!(matches!(load_config(Some(&path)), Err(ConfigError::Invalid(_))));

        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_config(Some(&path)), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_open_creates_store_in_data_dir() {
        let dir = tempdir().unwrap();
        let mut config = Config::for_device("kiosk-01");
        config.data_dir = Some(dir.path().to_path_buf());

        let state = AppState::open(config).unwrap();
        assert!(dir.path().join("adkiosk.db").exists());
        assert!(state.sync.is_none());
        assert!(state.object_store.is_none());
        assert_eq!(state.db.lock().device_id(), "kiosk-01");
    }

    #[test]
    fn test_assemble_with_loopback_remote() {
        let config = Config::for_device("kiosk-01");
        let remote: Arc<dyn RemoteStore> = Arc::new(MemoryRemoteStore::new());
        let state = AppState::assemble(config, test_db("kiosk-01"), Some(remote), None).unwrap();
        assert!(state.sync.is_some());

        let mismatched = AppState::assemble(Config::for_device("kiosk-02"), test_db("kiosk-01"), None, None);
        assert!(matches!(mismatched, Err(StartupError::Config(ConfigError::Invalid(_)))));
    }
}
