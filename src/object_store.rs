//! Object storage used for database backups and the media catalog.
//!
//! Keys are `/`-separated relative paths. [`HttpObjectStore`] talks to an
//! https endpoint; [`FsObjectStore`] maps keys onto a directory tree (a
//! mounted share, or a local folder in tests).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

use crate::types::ObjectStoreConfig;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object store request failed: {0}")]
    Http(String),

    #[error("Object store returned {status} for {key}")]
    Status { status: u16, key: String },

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Object store misconfigured: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub key: String,
    #[serde(default)]
    pub size: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), ObjectStoreError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError>;
    /// Objects whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, ObjectStoreError>;
}

/// Reject keys that could escape the store root or address a directory.
pub fn validate_key(key: &str) -> Result<(), ObjectStoreError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.ends_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(ObjectStoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Build the configured store, if any. A URL wins over a directory.
pub fn from_config(config: &ObjectStoreConfig) -> Result<Option<Arc<dyn ObjectStore>>, ObjectStoreError> {
    if let Some(url) = config.url.as_deref() {
        let token = match config.token_env.as_deref() {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                ObjectStoreError::Configuration(format!("{} is not set", var))
            })?),
            None => None,
        };
        let store = HttpObjectStore::new(url, token, Duration::from_secs(120))?;
        return Ok(Some(Arc::new(store)));
    }
    if let Some(dir) = config.dir.as_ref() {
        return Ok(Some(Arc::new(FsObjectStore::new(dir.clone()))));
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Directory tree
// ---------------------------------------------------------------------------

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, part| path.join(part)))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), ObjectStoreError> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| ObjectStoreError::InvalidKey(key.to_string()))?
            .to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;
        // Write beside the target and rename, so readers never see a partial object.
        let partial = parent.join(format!(
            ".{}.partial",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("object")
        ));
        tokio::fs::write(&partial, &body).await?;
        tokio::fs::rename(&partial, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ObjectStoreError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, ObjectStoreError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || list_tree(&root, &prefix))
            .await
            .map_err(|e| ObjectStoreError::Io(std::io::Error::other(e)))?
    }
}

fn list_tree(root: &Path, prefix: &str) -> Result<Vec<ObjectMeta>, ObjectStoreError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| ObjectStoreError::Io(std::io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        // Skip in-flight writes.
        if parts.last().is_some_and(|name| name.starts_with('.') && name.ends_with(".partial")) {
            continue;
        }
        let key = parts.join("/");
        if key.starts_with(prefix) {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            out.push(ObjectMeta { key, size });
        }
    }
    out.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(out)
}

// ---------------------------------------------------------------------------
// HTTP endpoint
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    objects: Vec<ObjectMeta>,
}

/// `PUT`/`GET <base>/<key>` for objects, `GET <base>?prefix=` for listings.
pub struct HttpObjectStore {
    http: reqwest::Client,
    base: url::Url,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, ObjectStoreError> {
        let mut base = url::Url::parse(base_url).map_err(|e| ObjectStoreError::Configuration(e.to_string()))?;
        if base.scheme() != "https" {
            return Err(ObjectStoreError::Configuration(format!(
                "object store must use https: {}",
                base_url
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .https_only(true)
            .build()
            .map_err(|e| ObjectStoreError::Http(e.to_string()))?;
        Ok(Self { http, base, token })
    }

    fn object_url(&self, key: &str) -> Result<url::Url, ObjectStoreError> {
        validate_key(key)?;
        self.base
            .join(key)
            .map_err(|e| ObjectStoreError::InvalidKey(format!("{}: {}", key, e)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn check(response: &reqwest::Response, key: &str) -> Result<(), ObjectStoreError> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ObjectStoreError::NotFound(key.to_string()));
        }
        if !status.is_success() {
            return Err(ObjectStoreError::Status {
                status: status.as_u16(),
                key: key.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), ObjectStoreError> {
        let url = self.object_url(key)?;
        let response = self
            .authorize(self.http.put(url))
            .body(body)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Http(e.to_string()))?;
        Self::check(&response, key)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let url = self.object_url(key)?;
        let response = self
            .authorize(self.http.get(url))
            .send()
            .await
            .map_err(|e| ObjectStoreError::Http(e.to_string()))?;
        Self::check(&response, key)?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ObjectStoreError::Http(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, ObjectStoreError> {
        let response = self
            .authorize(self.http.get(self.base.clone()))
            .query(&[("prefix", prefix)])
            .send()
            .await
            .map_err(|e| ObjectStoreError::Http(e.to_string()))?;
        Self::check(&response, prefix)?;
        let mut listing: ListResponse = response
            .json()
            .await
            .map_err(|e| ObjectStoreError::Http(e.to_string()))?;
        listing.objects.retain(|o| o.key.starts_with(prefix));
        listing.objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listing.objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("ads/kiosk-1/acme/male/18-29/3/spot.mp4").is_ok());
        for bad in ["", "/abs", "a/../b", "a//b", "dir/", "a\\b", "./a"] {
            assert!(validate_key(bad).is_err(), "{}", bad);
        }
    }

    #[tokio::test]
    async fn test_fs_store_put_get_list() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.put("ads/k1/a.png", b"one".to_vec()).await.unwrap();
        store.put("ads/k1/sub/b.mp4", b"two!".to_vec()).await.unwrap();
        store.put("backups/k1/x.db", b"db".to_vec()).await.unwrap();

        assert_eq!(store.get("ads/k1/a.png").await.unwrap(), b"one");
        assert!(matches!(store.get("ads/k1/zzz").await, Err(ObjectStoreError::NotFound(_))));

        let listed = store.list("ads/").await.unwrap();
        assert_eq!(
            listed,
            vec![
                ObjectMeta {
                    key: "ads/k1/a.png".into(),
                    size: 3
                },
                ObjectMeta {
                    key: "ads/k1/sub/b.mp4".into(),
                    size: 4
                },
            ]
        );
        assert_eq!(store.list("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_fs_store_rejects_escaping_keys() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("root"));
        assert!(matches!(
            store.put("../outside", b"x".to_vec()).await,
            Err(ObjectStoreError::InvalidKey(_))
        ));
        assert!(store.list("anything").await.unwrap().is_empty());
    }

    #[test]
    fn test_from_config_prefers_url() {
        assert!(from_config(&ObjectStoreConfig::default()).unwrap().is_none());
        let dir_only = ObjectStoreConfig {
            dir: Some(PathBuf::from("/tmp/adkiosk-objects")),
            ..ObjectStoreConfig::default()
        };
        assert!(from_config(&dir_only).unwrap().is_some());
        let plain_http = ObjectStoreConfig {
            url: Some("http://objects.example.com".into()),
            ..ObjectStoreConfig::default()
        };
        assert!(matches!(from_config(&plain_http), Err(ObjectStoreError::Configuration(_))));
    }
}
