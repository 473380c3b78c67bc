//! The shared remote store, seen from a kiosk.
//!
//! Push accepts one batch per entity type and dedupes rows by
//! `(origin_device, entity_type, seq)`, so a batch replayed after a crash is
//! absorbed instead of double-applied. The ack carries the checksum of the
//! rows as the remote now holds them. Pull returns rows written by other
//! devices after a remote sequence mark.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::checksum::{checksum, BatchChecksum};
use crate::db::{EntityType, SyncRow};
use crate::error::SyncError;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("credentials unavailable: {0}")]
    Credentials(String),
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Network(msg) => SyncError::TransientNetwork(msg),
            RemoteError::Timeout => SyncError::TransientNetwork("request timed out".to_string()),
            RemoteError::Protocol(msg) => SyncError::TransientNetwork(format!("protocol: {}", msg)),
            RemoteError::Rejected { status, message } => {
                SyncError::RemoteRejected(format!("{}: {}", status, message))
            }
            RemoteError::Credentials(msg) => SyncError::Configuration(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub device_id: String,
    pub entity_type: EntityType,
    pub rows: Vec<SyncRow>,
    pub idempotency_key: String,
    pub checksum: BatchChecksum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushAck {
    pub accepted: usize,
    pub duplicates: usize,
    /// Checksum of the batch's rows as persisted remotely.
    pub persisted: BatchChecksum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub device_id: String,
    pub entity_type: EntityType,
    pub since_remote_seq: i64,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullBatch {
    pub rows: Vec<SyncRow>,
    pub checksum: BatchChecksum,
    #[serde(default)]
    pub has_more: bool,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn push(&self, request: PushRequest) -> Result<PushAck, RemoteError>;
    async fn pull(&self, request: PullRequest) -> Result<PullBatch, RemoteError>;
}

/// Supplies the bearer token for remote calls. Loading secrets is the
/// caller's business.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Result<String, RemoteError>;
}

/// Reads the token from an environment variable on every call, so rotation
/// needs no restart.
pub struct EnvCredentials {
    var: String,
}

impl EnvCredentials {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl CredentialProvider for EnvCredentials {
    fn bearer_token(&self) -> Result<String, RemoteError> {
        std::env::var(&self.var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| RemoteError::Credentials(format!("{} is not set", self.var)))
    }
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

pub struct HttpRemoteStore {
    http: reqwest::Client,
    base: url::Url,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, credentials: Arc<dyn CredentialProvider>, timeout: Duration) -> Result<Self, RemoteError> {
        let mut base = url::Url::parse(base_url).map_err(|e| RemoteError::Protocol(e.to_string()))?;
        if base.scheme() != "https" {
            return Err(RemoteError::Protocol(format!("remote store must use https: {}", base_url)));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .https_only(true)
            .build()
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;
        Ok(Self {
            http,
            base,
            credentials,
        })
    }

    fn endpoint(&self, device_id: &str, entity: EntityType, leaf: &str) -> Result<url::Url, RemoteError> {
        self.base
            .join(&format!("v1/devices/{}/entities/{}/{}", device_id, entity.as_str(), leaf))
            .map_err(|e| RemoteError::Protocol(e.to_string()))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| RemoteError::Protocol(e.to_string()));
        }
        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            Err(RemoteError::Network(format!("status {}: {}", status, body)))
        } else {
            Err(RemoteError::Rejected {
                status: status.as_u16(),
                message: body,
            })
        }
    }
}

fn map_transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Network(err.to_string())
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn push(&self, request: PushRequest) -> Result<PushAck, RemoteError> {
        let token = self.credentials.bearer_token()?;
        let url = self.endpoint(&request.device_id, request.entity_type, "batches")?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .header("Idempotency-Key", request.idempotency_key.as_str())
            .json(&request)
            .send()
            .await
            .map_err(map_transport_error)?;
        Self::read_json(response).await
    }

    async fn pull(&self, request: PullRequest) -> Result<PullBatch, RemoteError> {
        let token = self.credentials.bearer_token()?;
        let url = self.endpoint(&request.device_id, request.entity_type, "changes")?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .query(&[
                ("since", request.since_remote_seq.to_string()),
                ("limit", request.limit.to_string()),
            ])
            .send()
            .await
            .map_err(map_transport_error)?;
        Self::read_json(response).await
    }
}

// ---------------------------------------------------------------------------
// In-process remote
// ---------------------------------------------------------------------------

/// Failure modes the in-process remote can be told to produce on its next
/// call.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Fail before touching any state.
    Network,
    /// Stall for the given duration before answering normally.
    Stall(Duration),
    /// Commit the push, then lose the ack.
    DropAckAfterCommit,
    /// Commit the push, then report a checksum that does not match.
    CorruptAck,
    /// Alter one pulled row after the checksum was computed.
    CorruptPull,
}

#[derive(Default)]
struct MemoryRemoteInner {
    rows: Vec<SyncRow>,
    index: HashMap<(String, EntityType, i64), usize>,
    next_remote_seq: i64,
    faults: VecDeque<Fault>,
    push_calls: usize,
}

/// Shared in-process remote store. Clones share state, so several kiosks in
/// one process (or one test) see the same backend.
#[derive(Clone, Default)]
pub struct MemoryRemoteStore {
    inner: Arc<Mutex<MemoryRemoteInner>>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, fault: Fault) {
        self.inner.lock().faults.push_back(fault);
    }

    pub fn row_count(&self) -> usize {
        self.inner.lock().rows.len()
    }

    pub fn push_calls(&self) -> usize {
        self.inner.lock().push_calls
    }

    pub fn rows_of(&self, entity: EntityType) -> Vec<SyncRow> {
        self.inner
            .lock()
            .rows
            .iter()
            .filter(|r| r.entity_type == entity)
            .cloned()
            .collect()
    }

    fn next_fault(&self) -> Option<Fault> {
        self.inner.lock().faults.pop_front()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn push(&self, request: PushRequest) -> Result<PushAck, RemoteError> {
        let fault = self.next_fault();
        match &fault {
            Some(Fault::Network) => return Err(RemoteError::Network("connection reset".into())),
            Some(Fault::Stall(d)) => tokio::time::sleep(*d).await,
            _ => {}
        }

        let mut inner = self.inner.lock();
        inner.push_calls += 1;

        // One remote transaction: validate everything before applying anything.
        for row in &request.rows {
            if row.entity_type != request.entity_type || row.origin_device != request.device_id {
                return Err(RemoteError::Rejected {
                    status: 422,
                    message: format!("row {} does not belong to this batch", row.idempotency_key()),
                });
            }
        }

        let mut accepted = 0;
        let mut duplicates = 0;
        let mut persisted = Vec::with_capacity(request.rows.len());
        for row in &request.rows {
            let key = (row.origin_device.clone(), row.entity_type, row.seq);
            match inner.index.get(&key).copied() {
                Some(idx) => {
                    duplicates += 1;
                    persisted.push(inner.rows[idx].clone());
                }
                None => {
                    inner.next_remote_seq += 1;
                    let mut stored = row.clone();
                    stored.remote_seq = Some(inner.next_remote_seq);
                    let idx = inner.rows.len();
                    inner.rows.push(stored.clone());
                    inner.index.insert(key, idx);
                    persisted.push(stored);
                    accepted += 1;
                }
            }
        }
        drop(inner);

        let mut persisted = checksum(&persisted).map_err(|e| RemoteError::Protocol(e.to_string()))?;
        match fault {
            Some(Fault::DropAckAfterCommit) => {
                return Err(RemoteError::Network("connection lost before ack".into()));
            }
            Some(Fault::CorruptAck) => persisted.digest = "0".repeat(64),
            _ => {}
        }

        Ok(PushAck {
            accepted,
            duplicates,
            persisted,
        })
    }

    async fn pull(&self, request: PullRequest) -> Result<PullBatch, RemoteError> {
        let fault = self.next_fault();
        match &fault {
            Some(Fault::Network) => return Err(RemoteError::Network("connection reset".into())),
            Some(Fault::Stall(d)) => tokio::time::sleep(*d).await,
            _ => {}
        }

        let (mut rows, has_more) = {
            let inner = self.inner.lock();
            let mut matching = inner.rows.iter().filter(|r| {
                r.entity_type == request.entity_type
                    && r.origin_device != request.device_id
                    && r.remote_seq.unwrap_or(0) > request.since_remote_seq
            });
            let rows: Vec<SyncRow> = matching.by_ref().take(request.limit).cloned().collect();
            let has_more = matching.next().is_some();
            (rows, has_more)
        };

        let sum = checksum(&rows).map_err(|e| RemoteError::Protocol(e.to_string()))?;
        if fault == Some(Fault::CorruptPull) {
            match rows.first_mut() {
                Some(first) => first.payload = serde_json::json!({ "corrupted": true }),
                // Nothing to corrupt yet; keep the fault for a pull that returns rows.
                None => self.inner.lock().faults.push_front(Fault::CorruptPull),
            }
        }
        Ok(PullBatch {
            rows,
            checksum: sum,
            has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(origin: &str, seq: i64) -> SyncRow {
        SyncRow {
            entity_type: EntityType::DisplayEvent,
            origin_device: origin.to_string(),
            seq,
            primary_key: format!("{}:{}", origin, seq),
            updated_at: Utc::now(),
            prev_version: None,
            payload: serde_json::json!({ "seq": seq }),
            remote_seq: None,
        }
    }

    fn push_request(origin: &str, rows: Vec<SyncRow>) -> PushRequest {
        PushRequest {
            device_id: origin.to_string(),
            entity_type: EntityType::DisplayEvent,
            checksum: checksum(&rows).unwrap(),
            idempotency_key: format!("{}:display_event:batch", origin),
            rows,
        }
    }

    #[tokio::test]
    async fn test_push_dedupes_by_origin_and_seq() {
        let remote = MemoryRemoteStore::new();
        let request = push_request("dev-a", vec![row("dev-a", 1), row("dev-a", 2)]);

        let first = remote.push(request.clone()).await.unwrap();
        assert_eq!((first.accepted, first.duplicates), (2, 0));
        assert_eq!(first.persisted, request.checksum);

        let replay = remote.push(request.clone()).await.unwrap();
        assert_eq!((replay.accepted, replay.duplicates), (0, 2));
        assert_eq!(replay.persisted, request.checksum);
        assert_eq!(remote.row_count(), 2);
    }

    #[tokio::test]
    async fn test_pull_excludes_own_rows_and_pages() {
        let remote = MemoryRemoteStore::new();
        remote.push(push_request("dev-a", vec![row("dev-a", 1), row("dev-a", 2)])).await.unwrap();
        remote.push(push_request("dev-b", vec![row("dev-b", 1)])).await.unwrap();

        let pull = |device: &str, since: i64, limit: usize| PullRequest {
            device_id: device.to_string(),
            entity_type: EntityType::DisplayEvent,
            since_remote_seq: since,
            limit,
        };

        let for_b = remote.pull(pull("dev-b", 0, 1)).await.unwrap();
        assert_eq!(for_b.rows.len(), 1);
        assert!(for_b.has_more);
        assert_eq!(for_b.checksum, checksum(&for_b.rows).unwrap());

        let rest = remote
            .pull(pull("dev-b", for_b.rows[0].remote_seq.unwrap(), 10))
            .await
            .unwrap();
        assert_eq!(rest.rows.len(), 1);
        assert!(!rest.has_more);

        let for_a = remote.pull(pull("dev-a", 0, 10)).await.unwrap();
        assert_eq!(for_a.rows.iter().map(|r| r.origin_device.as_str()).collect::<Vec<_>>(), vec!["dev-b"]);
    }

    #[tokio::test]
    async fn test_rejects_rows_from_other_devices() {
        let remote = MemoryRemoteStore::new();
        let err = remote
            .push(push_request("dev-a", vec![row("dev-b", 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Rejected { status: 422, .. }));
        assert_eq!(remote.row_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_ack_still_commits() {
        let remote = MemoryRemoteStore::new();
        remote.inject(Fault::DropAckAfterCommit);
        assert!(remote.push(push_request("dev-a", vec![row("dev-a", 1)])).await.is_err());
        assert_eq!(remote.row_count(), 1);
    }

    #[test]
    fn test_http_store_requires_https() {
        let creds: Arc<dyn CredentialProvider> = Arc::new(EnvCredentials::new("ADKIOSK_TEST_UNSET_TOKEN"));
        assert!(HttpRemoteStore::new("http://sync.example.com", creds.clone(), Duration::from_secs(5)).is_err());
        let store = HttpRemoteStore::new("https://sync.example.com/api", creds, Duration::from_secs(5)).unwrap();
        let url = store.endpoint("kiosk-1", EntityType::Person, "batches").unwrap();
        assert_eq!(url.as_str(), "https://sync.example.com/api/v1/devices/kiosk-1/entities/person/batches");
    }

    #[test]
    fn test_missing_token_is_a_configuration_error() {
        let creds = EnvCredentials::new("ADKIOSK_TEST_UNSET_TOKEN");
        let err = creds.bearer_token().unwrap_err();
        assert!(matches!(SyncError::from(err), SyncError::Configuration(_)));
    }
}
