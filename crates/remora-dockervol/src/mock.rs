use crate::client::{DockerVolume, PluginCapabilities, VolumeDriver};
use crate::error::{DockervolError, Result};
use async_trait::async_trait;
use remora_core::OptionsMap;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory volume driver for tests and development.
///
/// Maintains a volume registry and records every create, update, and
/// remove call so callers can assert on exactly what reached the
/// plugin. Failures can be injected per operation.
#[derive(Default)]
pub struct MockVolumeDriver {
    volumes: RwLock<HashMap<String, DockerVolume>>,
    create_error: RwLock<Option<String>>,
    remove_error: RwLock<Option<String>>,
    create_calls: RwLock<Vec<(String, OptionsMap)>>,
    update_calls: RwLock<Vec<(String, OptionsMap)>>,
    remove_calls: RwLock<Vec<(String, Option<String>)>>,
}

impl MockVolumeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an existing volume with the given status map.
    pub async fn insert_volume(&self, name: &str, status: OptionsMap) {
        self.volumes.write().await.insert(
            name.to_string(),
            DockerVolume {
                name: name.to_string(),
                mountpoint: String::new(),
                status,
            },
        );
    }

    /// Make every subsequent create fail with `message`.
    pub async fn set_create_error(&self, message: Option<&str>) {
        *self.create_error.write().await = message.map(str::to_string);
    }

    /// Make every subsequent remove fail with `message`.
    pub async fn set_remove_error(&self, message: Option<&str>) {
        *self.remove_error.write().await = message.map(str::to_string);
    }

    pub async fn volume_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.volumes.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn create_calls(&self) -> Vec<(String, OptionsMap)> {
        self.create_calls.read().await.clone()
    }

    pub async fn update_calls(&self) -> Vec<(String, OptionsMap)> {
        self.update_calls.read().await.clone()
    }

    pub async fn remove_calls(&self) -> Vec<(String, Option<String>)> {
        self.remove_calls.read().await.clone()
    }
}

#[async_trait]
impl VolumeDriver for MockVolumeDriver {
    async fn activate(&self) -> Result<()> {
        Ok(())
    }

    async fn capabilities(&self) -> Result<PluginCapabilities> {
        Ok(PluginCapabilities {
            scope: "global".to_string(),
        })
    }

    async fn create(&self, name: &str, options: OptionsMap) -> Result<String> {
        if name.is_empty() {
            return Err(DockervolError::MissingName);
        }
        self.create_calls
            .write()
            .await
            .push((name.to_string(), options.clone()));
        if let Some(message) = self.create_error.read().await.clone() {
            return Err(DockervolError::driver(message));
        }
        self.volumes.write().await.insert(
            name.to_string(),
            DockerVolume {
                name: name.to_string(),
                mountpoint: String::new(),
                status: OptionsMap::new(),
            },
        );
        debug!("mock: volume created: {}", name);
        Ok(name.to_string())
    }

    async fn update(&self, name: &str, options: OptionsMap) -> Result<String> {
        self.update_calls
            .write()
            .await
            .push((name.to_string(), options.clone()));
        let mut volumes = self.volumes.write().await;
        let volume = volumes
            .get_mut(name)
            .ok_or_else(|| DockervolError::driver(format!("Unable to find volume {}", name)))?;
        volume.status.extend(options);
        Ok(name.to_string())
    }

    async fn list(&self) -> Result<Vec<DockerVolume>> {
        let mut volumes: Vec<DockerVolume> = self.volumes.read().await.values().cloned().collect();
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(volumes)
    }

    async fn get(&self, name: &str) -> Result<DockerVolume> {
        self.volumes
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| DockervolError::driver(format!("Unable to find volume {}", name)))
    }

    async fn mount(&self, name: &str, _mount_id: &str) -> Result<String> {
        let mut volumes = self.volumes.write().await;
        let volume = volumes
            .get_mut(name)
            .ok_or_else(|| DockervolError::driver(format!("Unable to find volume {}", name)))?;
        volume.mountpoint = format!("/mnt/{}", name);
        Ok(volume.mountpoint.clone())
    }

    async fn unmount(&self, name: &str, _mount_id: &str) -> Result<()> {
        let mut volumes = self.volumes.write().await;
        let volume = volumes
            .get_mut(name)
            .ok_or_else(|| DockervolError::driver(format!("Unable to find volume {}", name)))?;
        volume.mountpoint = String::new();
        Ok(())
    }

    async fn remove(&self, name: &str, manager: Option<&str>) -> Result<()> {
        if name.is_empty() {
            return Err(DockervolError::MissingName);
        }
        self.remove_calls
            .write()
            .await
            .push((name.to_string(), manager.map(str::to_string)));
        if let Some(message) = self.remove_error.read().await.clone() {
            return Err(DockervolError::driver(message));
        }
        let mut volumes = self.volumes.write().await;
        if volumes.remove(name).is_none() {
            return Err(DockervolError::driver(format!(
                "Unable to find volume {}",
                name
            )));
        }
        debug!("mock: volume removed: {}", name);
        Ok(())
    }
}
