use crate::cluster::{ClusterClient, ServerVersion};
use crate::error::{ProvisionerError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, PersistentVolume};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory cluster for tests: stores created volumes, records
/// deletions and events, and can fail volume creation on demand.
#[derive(Default)]
pub struct MockClusterClient {
    volumes: RwLock<HashMap<String, PersistentVolume>>,
    deleted: RwLock<Vec<String>>,
    events: RwLock<Vec<Event>>,
    create_error: RwLock<Option<String>>,
}

impl MockClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_create_error(&self, message: Option<&str>) {
        *self.create_error.write().await = message.map(str::to_string);
    }

    pub async fn volume(&self, name: &str) -> Option<PersistentVolume> {
        self.volumes.read().await.get(name).cloned()
    }

    pub async fn volume_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.volumes.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every delete call seen, in order (including repeats).
    pub async fn deleted_volumes(&self) -> Vec<String> {
        self.deleted.read().await.clone()
    }

    pub async fn posted_events(&self) -> Vec<Event> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl ClusterClient for MockClusterClient {
    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume> {
        if let Some(message) = self.create_error.read().await.clone() {
            return Err(ProvisionerError::cluster(message));
        }
        let name = volume.metadata.name.clone().unwrap_or_default();
        let mut stored = volume.clone();
        if stored.metadata.uid.is_none() {
            stored.metadata.uid = Some(format!("uid-{}", name));
        }
        self.volumes.write().await.insert(name.clone(), stored.clone());
        debug!("mock: cluster volume created: {}", name);
        Ok(stored)
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.deleted.write().await.push(name.to_string());
        self.volumes.write().await.remove(name);
        debug!("mock: cluster volume deleted: {}", name);
        Ok(())
    }

    async fn create_event(&self, event: &Event) -> Result<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn server_version(&self) -> Result<ServerVersion> {
        Ok(ServerVersion {
            major: "1".to_string(),
            minor: "30".to_string(),
            git_version: "v1.30.0-mock".to_string(),
        })
    }
}
