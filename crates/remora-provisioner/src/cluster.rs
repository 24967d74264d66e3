use crate::error::{ProvisionerError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, PersistentVolume};
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

pub const CLAIMS_PATH: &str = "/api/v1/persistentvolumeclaims";
pub const VOLUMES_PATH: &str = "/api/v1/persistentvolumes";
pub const CLASSES_PATH: &str = "/apis/storage.k8s.io/v1/storageclasses";
pub const BETA_CLASSES_PATH: &str = "/apis/storage.k8s.io/v1beta1/storageclasses";

/// The cluster mutations the provisioner performs. Informer reads go
/// through [`ApiClient`] directly; this seam exists so chains and
/// recorders can run against an in-memory cluster in tests.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume>;
    async fn delete_volume(&self, name: &str) -> Result<()>;
    async fn create_event(&self, event: &Event) -> Result<()>;
    async fn server_version(&self) -> Result<ServerVersion>;
}

/// Watch event type on the cluster watch stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    Error,
}

#[derive(Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    event_type: WatchEventType,
    object: serde_json::Value,
}

#[derive(Deserialize, Default)]
struct ListMeta {
    #[serde(rename = "resourceVersion", default)]
    resource_version: String,
}

#[derive(Deserialize)]
struct RawList {
    #[serde(default)]
    metadata: ListMeta,
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

/// Version reported by the cluster API server
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerVersion {
    #[serde(default)]
    pub major: String,
    #[serde(default)]
    pub minor: String,
    #[serde(rename = "gitVersion", default)]
    pub git_version: String,
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.git_version)
    }
}

/// Lightweight HTTP client for the cluster API server
pub struct ApiClient {
    base_url: String,
    client: Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET a collection, returning the raw items and the list's
    /// resource version (the point to start watching from).
    pub async fn list(&self, path: &str) -> Result<(Vec<serde_json::Value>, String)> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProvisionerError::cluster(format!("HTTP request failed: {}", e)))?;
        let resp = check_status("GET", path, resp).await?;

        let list: RawList = resp
            .json()
            .await
            .map_err(|e| ProvisionerError::cluster(format!("failed to parse list: {}", e)))?;
        Ok((list.items, list.metadata.resource_version))
    }

    /// Open a watch on a collection from `resource_version`.
    pub async fn start_watch(&self, path: &str, resource_version: &str) -> Result<RawWatch> {
        let url = format!(
            "{}{}?watch=true&resourceVersion={}",
            self.base_url, path, resource_version
        );
        debug!("WATCH {}", url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProvisionerError::cluster(format!("HTTP request failed: {}", e)))?;
        let resp = check_status("WATCH", path, resp).await?;

        Ok(RawWatch {
            response: resp,
            buffer: Vec::new(),
        })
    }
}

async fn check_status(
    verb: &str,
    path: &str,
    resp: reqwest::Response,
) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(ProvisionerError::cluster(format!(
        "{} {} failed with status {}: {}",
        verb, path, status, body
    )))
}

#[async_trait]
impl ClusterClient for ApiClient {
    /// POST /api/v1/persistentvolumes
    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume> {
        let url = format!("{}{}", self.base_url, VOLUMES_PATH);
        debug!("POST {}", url);

        let resp = self
            .client
            .post(&url)
            .json(volume)
            .send()
            .await
            .map_err(|e| ProvisionerError::cluster(format!("HTTP request failed: {}", e)))?;
        let resp = check_status("POST", VOLUMES_PATH, resp).await?;

        resp.json::<PersistentVolume>()
            .await
            .map_err(|e| ProvisionerError::cluster(format!("failed to parse volume: {}", e)))
    }

    /// DELETE /api/v1/persistentvolumes/{name}
    async fn delete_volume(&self, name: &str) -> Result<()> {
        let url = format!("{}{}/{}", self.base_url, VOLUMES_PATH, name);
        debug!("DELETE {}", url);

        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| ProvisionerError::cluster(format!("HTTP request failed: {}", e)))?;
        check_status("DELETE", VOLUMES_PATH, resp).await?;
        Ok(())
    }

    /// POST /api/v1/namespaces/{namespace}/events
    async fn create_event(&self, event: &Event) -> Result<()> {
        let namespace = event.metadata.namespace.as_deref().unwrap_or("default");
        let url = format!("{}/api/v1/namespaces/{}/events", self.base_url, namespace);
        debug!("POST {}", url);

        let resp = self
            .client
            .post(&url)
            .json(event)
            .send()
            .await
            .map_err(|e| ProvisionerError::cluster(format!("HTTP request failed: {}", e)))?;
        check_status("POST", "events", resp).await?;
        Ok(())
    }

    /// GET /version
    async fn server_version(&self) -> Result<ServerVersion> {
        let url = format!("{}/version", self.base_url);
        debug!("GET {}", url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProvisionerError::cluster(format!("HTTP request failed: {}", e)))?;
        let resp = check_status("GET", "/version", resp).await?;

        resp.json::<ServerVersion>()
            .await
            .map_err(|e| ProvisionerError::cluster(format!("failed to parse version: {}", e)))
    }
}

/// A chunked watch stream, decoded one newline-delimited JSON event
/// at a time.
pub struct RawWatch {
    response: reqwest::Response,
    buffer: Vec<u8>,
}

impl RawWatch {
    /// The next event, or `None` when the server ends the stream.
    /// Undecodable lines are logged and skipped.
    pub async fn next_event(&mut self) -> Result<Option<(WatchEventType, serde_json::Value)>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match serde_json::from_slice::<RawWatchEvent>(line) {
                    Ok(event) => return Ok(Some((event.event_type, event.object))),
                    Err(e) => {
                        warn!("skipping undecodable watch line: {}", e);
                        continue;
                    }
                }
            }

            let chunk = self
                .response
                .chunk()
                .await
                .map_err(|e| ProvisionerError::cluster(format!("watch stream failed: {}", e)))?;
            match chunk {
                Some(bytes) => self.buffer.extend_from_slice(&bytes),
                None => return Ok(None),
            }
        }
    }
}

/// Decode a raw watch/list object into a typed cluster object.
///
/// The apiVersion/kind discriminators are dropped first: list items
/// omit them, legacy endpoints disagree on them, and the target type
/// already fixes both.
pub(crate) fn decode_object<T: serde::de::DeserializeOwned>(
    mut value: serde_json::Value,
) -> Option<T> {
    if let Some(object) = value.as_object_mut() {
        object.remove("apiVersion");
        object.remove("kind");
    }
    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            warn!("failed to decode cluster object: {}", e);
            None
        }
    }
}

/// Read-side cache of cluster objects, filled by an informer task.
pub struct Store<T> {
    items: RwLock<HashMap<String, T>>,
}

impl<T: Clone> Store<T> {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: &str, item: T) {
        self.items.write().insert(key.to_string(), item);
    }

    pub fn remove(&self, key: &str) {
        self.items.write().remove(key);
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.items.read().get(key).cloned()
    }

    pub fn list(&self) -> Vec<T> {
        self.items.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

impl<T: Clone> Default for Store<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_event_decodes_uppercase_types() {
        let event: RawWatchEvent = serde_json::from_value(serde_json::json!({
            "type": "MODIFIED",
            "object": {"kind": "PersistentVolumeClaim"}
        }))
        .unwrap();
        assert_eq!(event.event_type, WatchEventType::Modified);
        assert_eq!(event.object["kind"], "PersistentVolumeClaim");
    }

    #[test]
    fn test_list_envelope_decodes_items_and_version() {
        let list: RawList = serde_json::from_value(serde_json::json!({
            "metadata": {"resourceVersion": "412"},
            "items": [{"metadata": {"name": "a"}}, {"metadata": {"name": "b"}}]
        }))
        .unwrap();
        assert_eq!(list.metadata.resource_version, "412");
        assert_eq!(list.items.len(), 2);
    }

    #[test]
    fn test_server_version_decode() {
        let version: ServerVersion = serde_json::from_value(serde_json::json!({
            "major": "1", "minor": "30", "gitVersion": "v1.30.2"
        }))
        .unwrap();
        assert_eq!(version.major, "1");
        assert_eq!(version.minor, "30");
        assert_eq!(version.to_string(), "v1.30.2");
    }

    #[test]
    fn test_store_insert_get_remove() {
        let store: Store<String> = Store::new();
        assert!(store.is_empty());

        store.insert("ns/a", "alpha".to_string());
        store.insert("ns/b", "beta".to_string());
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("ns/a").as_deref(), Some("alpha"));

        store.remove("ns/a");
        assert!(store.get("ns/a").is_none());
        assert_eq!(store.list().len(), 1);
    }
}
