use crate::chain::Runner;
use crate::cluster::ClusterClient;
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use remora_core::keys;
use remora_core::OptionsMap;
use remora_dockervol::VolumeDriver;
use std::sync::Arc;
use tracing::{debug, error, info};

pub const STEP_CREATE_PLUGIN_VOLUME: &str = "create-plugin-volume";
pub const STEP_CREATE_CLUSTER_VOLUME: &str = "create-cluster-volume";
pub const STEP_MONITOR_BIND: &str = "monitor-bind";
pub const STEP_DELETE_PLUGIN_VOLUME: &str = "delete-plugin-volume";
pub const STEP_DELETE_CLUSTER_VOLUME: &str = "delete-cluster-volume";

/// What a chain step publishes for its successors.
#[derive(Debug, Clone)]
pub enum StepOutput {
    /// A volume name (plugin-chosen, or the bound volume's).
    Name(String),
    /// The cluster volume as the cluster stored it.
    Volume(Box<PersistentVolume>),
    /// Nothing to report.
    Done,
}

impl StepOutput {
    pub fn as_name(&self) -> Option<&str> {
        match self {
            StepOutput::Name(name) => Some(name),
            _ => None,
        }
    }

    pub fn into_volume(self) -> Option<PersistentVolume> {
        match self {
            StepOutput::Volume(volume) => Some(*volume),
            _ => None,
        }
    }
}

/// Create the backing plugin volume. The plugin ultimately picks the
/// name; rollback removes whatever name it returned, first tagged
/// with our manager marker, then untagged.
pub(crate) struct CreatePluginVolume {
    driver: Arc<dyn VolumeDriver>,
    requested_name: String,
    options: OptionsMap,
    returned_name: Option<String>,
}

impl CreatePluginVolume {
    pub fn new(driver: Arc<dyn VolumeDriver>, requested_name: &str, options: OptionsMap) -> Self {
        Self {
            driver,
            requested_name: requested_name.to_string(),
            options,
            returned_name: None,
        }
    }
}

#[async_trait]
impl Runner<StepOutput> for CreatePluginVolume {
    fn name(&self) -> &str {
        STEP_CREATE_PLUGIN_VOLUME
    }

    async fn run(&mut self) -> Result<StepOutput> {
        let name = self
            .driver
            .create(&self.requested_name, self.options.clone())
            .await
            .map_err(|e| {
                error!("failed to create plugin volume, error = {}", e);
                e
            })?;
        self.returned_name = Some(name.clone());
        Ok(StepOutput::Name(name))
    }

    async fn rollback(&mut self) -> Result<()> {
        let Some(name) = self.returned_name.clone() else {
            return Ok(());
        };
        remove_with_manager_fallback(self.driver.as_ref(), &name).await
    }
}

/// Remove a plugin volume we own: tagged with the manager marker
/// first, retried untagged for plugins that reject the tag.
async fn remove_with_manager_fallback(driver: &dyn VolumeDriver, name: &str) -> Result<()> {
    match driver.remove(name, Some(keys::MANAGER_NAME)).await {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!(
                "tagged remove of plugin volume {} failed ({}), retrying untagged",
                name, e
            );
            driver.remove(name, None).await?;
            Ok(())
        }
    }
}

/// Delete the backing plugin volume of a released cluster volume.
pub(crate) struct DeletePluginVolume {
    driver: Arc<dyn VolumeDriver>,
    name: String,
}

impl DeletePluginVolume {
    pub fn new(driver: Arc<dyn VolumeDriver>, name: &str) -> Self {
        Self {
            driver,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Runner<StepOutput> for DeletePluginVolume {
    fn name(&self) -> &str {
        STEP_DELETE_PLUGIN_VOLUME
    }

    async fn run(&mut self) -> Result<StepOutput> {
        remove_with_manager_fallback(self.driver.as_ref(), &self.name).await?;
        Ok(StepOutput::Done)
    }

    async fn rollback(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Register the cluster volume object whose claim-ref points at the
/// originating claim.
pub(crate) struct CreateClusterVolume {
    cluster: Arc<dyn ClusterClient>,
    volume: PersistentVolume,
}

impl CreateClusterVolume {
    pub fn new(cluster: Arc<dyn ClusterClient>, volume: PersistentVolume) -> Self {
        Self { cluster, volume }
    }
}

#[async_trait]
impl Runner<StepOutput> for CreateClusterVolume {
    fn name(&self) -> &str {
        STEP_CREATE_CLUSTER_VOLUME
    }

    async fn run(&mut self) -> Result<StepOutput> {
        let created = self.cluster.create_volume(&self.volume).await?;
        info!(
            "created cluster volume {}",
            created.metadata.name.as_deref().unwrap_or("")
        );
        Ok(StepOutput::Volume(Box::new(created)))
    }

    async fn rollback(&mut self) -> Result<()> {
        let name = self.volume.metadata.name.as_deref().unwrap_or("");
        self.cluster.delete_volume(name).await
    }
}

/// Remove the cluster volume object.
pub(crate) struct DeleteClusterVolume {
    cluster: Arc<dyn ClusterClient>,
    name: String,
}

impl DeleteClusterVolume {
    pub fn new(cluster: Arc<dyn ClusterClient>, name: &str) -> Self {
        Self {
            cluster,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Runner<StepOutput> for DeleteClusterVolume {
    fn name(&self) -> &str {
        STEP_DELETE_CLUSTER_VOLUME
    }

    async fn run(&mut self) -> Result<StepOutput> {
        self.cluster.delete_volume(&self.name).await?;
        Ok(StepOutput::Done)
    }

    async fn rollback(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remora_dockervol::MockVolumeDriver;

    #[tokio::test]
    async fn test_create_plugin_volume_publishes_returned_name() {
        let driver = Arc::new(MockVolumeDriver::new());
        let mut step = CreatePluginVolume::new(Arc::clone(&driver) as _, "vol1", OptionsMap::new());

        let output = step.run().await.unwrap();
        assert_eq!(output.as_name(), Some("vol1"));
        assert_eq!(driver.volume_names().await, vec!["vol1"]);
    }

    #[tokio::test]
    async fn test_create_rollback_removes_with_manager_tag() {
        let driver = Arc::new(MockVolumeDriver::new());
        let mut step = CreatePluginVolume::new(Arc::clone(&driver) as _, "vol1", OptionsMap::new());
        step.run().await.unwrap();

        step.rollback().await.unwrap();
        assert_eq!(
            driver.remove_calls().await,
            vec![("vol1".to_string(), Some(keys::MANAGER_NAME.to_string()))]
        );
        assert!(driver.volume_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_rollback_noop_before_create() {
        let driver = Arc::new(MockVolumeDriver::new());
        let mut step = CreatePluginVolume::new(Arc::clone(&driver) as _, "vol1", OptionsMap::new());

        step.rollback().await.unwrap();
        assert!(driver.remove_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_retries_untagged_after_tagged_failure() {
        let driver = Arc::new(MockVolumeDriver::new());
        driver.insert_volume("vol1", OptionsMap::new()).await;
        driver.set_remove_error(Some("manager mismatch")).await;

        let mut step = DeletePluginVolume::new(Arc::clone(&driver) as _, "vol1");
        assert!(step.run().await.is_err());
        assert_eq!(
            driver.remove_calls().await,
            vec![
                ("vol1".to_string(), Some(keys::MANAGER_NAME.to_string())),
                ("vol1".to_string(), None),
            ]
        );
    }
}
