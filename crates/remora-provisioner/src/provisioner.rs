use crate::chain::Chain;
use crate::claim::{
    claim_class_name, claim_name, claim_namespace, claim_phase, claim_uid, class_overrides,
    claim_override_options, run_claim_informer, CLAIM_BOUND, CLAIM_PENDING,
};
use crate::class::run_class_informer;
use crate::cluster::{ApiClient, ClusterClient, Store, WatchEventType};
use crate::config::DriverConfig;
use crate::error::Result;
use crate::events::{
    class_reference, volume_reference, EventRecorder, EventType, REASON_DELETE_GET_CLIENT,
    REASON_DELETE_VOLUME, REASON_PROVISION_GET_CLIENT, REASON_PROVISION_STORAGE,
};
use crate::mailbox::{MailboxRegistry, UpdateMessage};
use crate::monitor::{MonitorBind, MAX_WAIT_FOR_BIND};
use crate::steps::{
    CreateClusterVolume, CreatePluginVolume, DeleteClusterVolume, DeletePluginVolume, StepOutput,
    STEP_CREATE_CLUSTER_VOLUME,
};
use crate::throttle::Throttle;
use crate::volume::{
    best_volume_name, docker_options, new_persistent_volume, run_volume_informer,
    set_default_docker_options, volume_name, volume_phase, volume_provisioned_by,
    volume_reclaim_policy, volume_uid, RECLAIM_DELETE, VOLUME_RELEASED,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use remora_core::keys;
use remora_core::{claim_request_bytes, size_for_factor, OptionsMap};
use remora_dockervol::{DockerVolume, DockerVolumePlugin, Options as DockervolOptions, VolumeDriver};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_WAIT_FOR_CLAIMS: u32 = 60;
const STATUS_LOGGING_WAIT: Duration = Duration::from_secs(5);

/// Builds a plugin client (and the settings shaping its options) for
/// a class's provisioner identifier.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn client_for(
        &self,
        provisioner_name: &str,
    ) -> Result<(Arc<dyn VolumeDriver>, DriverConfig)>;
}

/// Production factory: resolves the per-driver side-car config and
/// dials the plugin socket it names.
pub struct ConfigDriverFactory {
    docker_socket_path: String,
}

impl ConfigDriverFactory {
    /// `docker_socket_path` overrides the container runtime socket
    /// used for V2 plugin resolution; empty keeps the default.
    pub fn new(docker_socket_path: impl Into<String>) -> Self {
        Self {
            docker_socket_path: docker_socket_path.into(),
        }
    }
}

#[async_trait]
impl DriverFactory for ConfigDriverFactory {
    async fn client_for(
        &self,
        provisioner_name: &str,
    ) -> Result<(Arc<dyn VolumeDriver>, DriverConfig)> {
        let config = DriverConfig::for_provisioner(provisioner_name)?;
        let options = DockervolOptions {
            socket_path: config.socket_path.clone(),
            strip_k8s_from_options: config.strip_k8s_from_options,
            supports_capabilities: false,
            docker_socket_path: self.docker_socket_path.clone(),
        };
        let client = DockerVolumePlugin::connect(&options).await?;
        Ok((Arc::new(client), config))
    }
}

/// Tuning knobs for a provisioner instance.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// The prefix this instance owns; classes whose provisioner id
    /// begins with `<name>/` are ours.
    pub provisioner_name: String,
    /// When false, chains only manage cluster objects and leave
    /// plugin volumes alone.
    pub affect_plugin_vols: bool,
    /// Run the periodic status logger.
    pub debug: bool,
    /// Cap on in-flight provision chains.
    pub max_provisions: u32,
    /// Cap on in-flight delete chains.
    pub max_deletes: u32,
    /// Retries per chain step (attempts = retries + 1).
    pub chain_retries: u32,
    /// Pause between provision step attempts; sized to cluster bind
    /// windows.
    pub provision_retry_sleep: Duration,
    /// Pause between delete step attempts.
    pub delete_retry_sleep: Duration,
    /// Wall clock one bind-monitor attempt waits.
    pub bind_timeout: Duration,
}

impl ProvisionerConfig {
    pub fn new(provisioner_name: impl Into<String>) -> Self {
        Self {
            provisioner_name: provisioner_name.into(),
            affect_plugin_vols: true,
            debug: false,
            max_provisions: 4,
            max_deletes: 10,
            chain_retries: 2,
            provision_retry_sleep: Duration::from_secs(120),
            delete_retry_sleep: Duration::from_secs(5),
            bind_timeout: MAX_WAIT_FOR_BIND,
        }
    }
}

/// The claim-driven provisioning controller: consumes claim and
/// volume events, dispatches provision and delete chains against the
/// volume plugin, and keeps the cluster's volume objects in step.
pub struct Provisioner {
    cluster: Arc<dyn ClusterClient>,
    drivers: Arc<dyn DriverFactory>,
    recorder: Arc<dyn EventRecorder>,
    registry: Arc<MailboxRegistry>,
    throttle: Arc<Throttle>,
    claim_store: Arc<Store<PersistentVolumeClaim>>,
    class_store: Arc<Store<StorageClass>>,
    name_prefix: String,
    docker_vol_name_annotation: String,
    config: ProvisionerConfig,
}

impl Provisioner {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        drivers: Arc<dyn DriverFactory>,
        recorder: Arc<dyn EventRecorder>,
        config: ProvisionerConfig,
    ) -> Self {
        debug!(
            "provisioner (prefix={}) is being created with provision cap {} and delete cap {}",
            config.provisioner_name, config.max_provisions, config.max_deletes
        );
        Self {
            cluster,
            drivers,
            recorder,
            registry: Arc::new(MailboxRegistry::new()),
            throttle: Arc::new(Throttle::new(config.max_provisions, config.max_deletes)),
            claim_store: Arc::new(Store::new()),
            class_store: Arc::new(Store::new()),
            name_prefix: format!("{}/", config.provisioner_name),
            docker_vol_name_annotation: format!(
                "{}/{}",
                config.provisioner_name,
                keys::DOCKER_VOLUME_NAME
            ),
            config,
        }
    }

    pub fn claim_store(&self) -> &Arc<Store<PersistentVolumeClaim>> {
        &self.claim_store
    }

    pub fn class_store(&self) -> &Arc<Store<StorageClass>> {
        &self.class_store
    }

    pub fn registry(&self) -> &Arc<MailboxRegistry> {
        &self.registry
    }

    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.throttle
    }

    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }

    /// Start the informers and the startup sweep, then block until a
    /// storage class is visible. Chains keep running after `token`
    /// fires; only the informer tasks stop.
    pub async fn start(self: Arc<Self>, api: Arc<ApiClient>, token: CancellationToken) -> Result<()> {
        let version = self.cluster.server_version().await?;
        // 1.5 clusters still serve classes from the beta endpoint
        let use_beta_classes = version.major == "1" && version.minor == "5";

        tokio::spawn(run_class_informer(
            Arc::clone(&api),
            Arc::clone(&self),
            use_beta_classes,
            token.clone(),
        ));
        tokio::spawn(run_claim_informer(
            Arc::clone(&api),
            Arc::clone(&self),
            token.clone(),
        ));
        {
            let this = Arc::clone(&self);
            tokio::spawn(async move { this.update_docker_volume_metadata().await });
        }
        tokio::spawn(run_volume_informer(api, Arc::clone(&self), token.clone()));
        if self.config.debug {
            tokio::spawn(Arc::clone(&self).status_logger(token.clone()));
        }

        self.wait_for_classes(&token).await;
        info!(
            "provisioner (prefix={}) has been started and is watching a server with version {}",
            self.name_prefix, version
        );
        Ok(())
    }

    /// React to a claim event: pending claims of classes we own get
    /// a provision chain; everything else is forwarded to whatever
    /// monitor is parked on the claim.
    pub async fn observe_claim(self: Arc<Self>, event: WatchEventType, claim: PersistentVolumeClaim) {
        if matches!(event, WatchEventType::Deleted | WatchEventType::Error) {
            return;
        }
        let uid = claim_uid(&claim).to_string();
        if uid.is_empty() {
            warn!("ignoring claim {} without a uid", claim_name(&claim));
            return;
        }

        if claim_phase(&claim) == CLAIM_PENDING {
            let class_name = claim_class_name(&claim);
            let class = match self.get_class(&class_name) {
                Ok(class) => class,
                Err(e) => {
                    error!(
                        "error getting class named {} for claim {}: {}",
                        class_name,
                        claim_name(&claim),
                        e
                    );
                    return;
                }
            };
            if !class.provisioner.starts_with(&self.name_prefix) {
                info!(
                    "class named {} in claim {} did not refer to a supported provisioner \
                     (name must begin with {}). current provisioner={} - skipping",
                    class_name,
                    claim_name(&claim),
                    self.name_prefix,
                    class.provisioner
                );
                return;
            }

            // one chain per claim id: registering the mailbox is the
            // in-flight marker, so a duplicate pending event falls
            // through to a plain forward
            if let Some(receiver) = self.registry.register(&uid) {
                info!(
                    "provisioning: provisioner:{} claim:{} class:{}",
                    class.provisioner,
                    claim_name(&claim),
                    class_name
                );
                let this = Arc::clone(&self);
                tokio::spawn(async move { this.provision_volume(claim, class, receiver).await });
                return;
            }
            debug!(
                "claim {} ({}) already has a chain in flight",
                claim_name(&claim),
                uid
            );
        }

        self.registry.send(&uid, UpdateMessage::Claim(Box::new(claim)));
    }

    /// React to a volume event: forward it to any parked monitor,
    /// then clean up released volumes we provisioned. A synthetic
    /// delete event runs the chain without removing the (already
    /// gone) cluster object.
    pub async fn observe_volume(self: Arc<Self>, event: WatchEventType, volume: PersistentVolume) {
        if matches!(event, WatchEventType::Error) {
            return;
        }
        let uid = volume_uid(&volume).to_string();
        if !uid.is_empty() {
            self.registry
                .send(&uid, UpdateMessage::Volume(Box::new(volume.clone())));
        }

        if volume_phase(&volume) != VOLUME_RELEASED
            || volume_reclaim_policy(&volume) != RECLAIM_DELETE
        {
            debug!(
                "{:?} event: volume:{} phase:{} (reclaim policy:{}) - skipping",
                event,
                volume_name(&volume),
                volume_phase(&volume),
                volume_reclaim_policy(&volume)
            );
            return;
        }
        let Some(provisioned_by) = volume_provisioned_by(&volume) else {
            info!(
                "{:?} event: volume:{} phase:{} - missing provisioner annotation, skipping",
                event,
                volume_name(&volume),
                volume_phase(&volume)
            );
            return;
        };
        if !provisioned_by.starts_with(&self.name_prefix) {
            info!(
                "{:?} event: volume:{} phase:{} provisioner:{} - unknown provisioner, skipping",
                event,
                volume_name(&volume),
                volume_phase(&volume),
                provisioned_by
            );
            return;
        }

        let rm_pv = !matches!(event, WatchEventType::Deleted);
        debug!(
            "{:?} event: cleaning up volume:{} phase:{}",
            event,
            volume_name(&volume),
            volume_phase(&volume)
        );
        let this = Arc::clone(&self);
        tokio::spawn(async move { this.delete_volume(volume, rm_pv).await });
    }

    async fn provision_volume(
        self: Arc<Self>,
        claim: PersistentVolumeClaim,
        class: StorageClass,
        receiver: tokio::sync::mpsc::Receiver<UpdateMessage>,
    ) {
        let claim_id = claim_uid(&claim).to_string();
        let created_volume_id = self.run_provision(&claim, &class, receiver).await;
        // the mailbox goes away with the chain, under every key it
        // was reachable by
        match created_volume_id {
            Some(volume_id) => self.registry.remove(&[&claim_id, &volume_id]),
            None => self.registry.remove(&[&claim_id]),
        }
    }

    /// Run one provision chain. Returns the created cluster volume's
    /// identifier when the chain got that far, whatever the final
    /// outcome, so the caller can unregister the mailbox alias.
    async fn run_provision(
        &self,
        claim: &PersistentVolumeClaim,
        class: &StorageClass,
        receiver: tokio::sync::mpsc::Receiver<UpdateMessage>,
    ) -> Option<String> {
        let claim_id = claim_uid(claim);
        let vol_name = best_volume_name(claim, class, &self.docker_vol_name_annotation);
        let namespace = claim_namespace(claim).to_string();
        let class_name = claim_class_name(claim);

        let mut params = class.parameters.clone().unwrap_or_default();
        params.insert("name".to_string(), vol_name.clone());

        let volume =
            new_persistent_volume(&vol_name, &params, claim, class, &self.docker_vol_name_annotation);
        debug!("volume to be created: {}", vol_name);

        // slow down a create storm
        let _slot = self.throttle.acquire_provision().await;

        let (driver, settings) = match self.drivers.client_for(&class.provisioner).await {
            Ok(pair) => pair,
            Err(e) => {
                let message = format!(
                    "failed to get volume plugin client for class {} while trying to provision claim {} ({}): {}",
                    class_name,
                    claim_name(claim),
                    claim_id,
                    e
                );
                error!("{}", message);
                self.recorder
                    .event(
                        class_reference(class),
                        EventType::Warning,
                        REASON_PROVISION_GET_CLIENT,
                        &message,
                    )
                    .await;
                return None;
            }
        };

        if let Some(existing) = get_docker_volume(driver.as_ref(), &vol_name).await {
            error!(
                "a plugin volume named {} already exists ({:?}) - skipping provision for claim {}",
                vol_name,
                existing.mountpoint,
                claim_name(claim)
            );
            return None;
        }

        let claim_size = match claim_request_bytes(claim) {
            Some(bytes) if !settings.storage_resource_options.is_empty() => {
                let size = size_for_factor(bytes, settings.factor_for_conversion);
                debug!(
                    "claim size={} for {} bytes and conversion factor {}",
                    size, bytes, settings.factor_for_conversion
                );
                size
            }
            _ => 0,
        };

        let overrides = class_overrides(&params);
        let mut options = match docker_options(
            &params,
            claim_size,
            &settings.storage_resource_options,
            &namespace,
            &self.claim_store,
        ) {
            Ok(options) => options,
            Err(e) => {
                let message = format!(
                    "error building plugin options for claim {} with class {}: {}",
                    claim_name(claim),
                    class_name,
                    e
                );
                error!("{}", message);
                self.recorder
                    .event(
                        class_reference(class),
                        EventType::Warning,
                        REASON_PROVISION_STORAGE,
                        &message,
                    )
                    .await;
                return None;
            }
        };
        claim_override_options(claim, &overrides, &mut options, &self.name_prefix);
        set_default_docker_options(&mut options, &settings.default_options);
        debug!("merged options map: {:?}", options);

        let mut chain = Chain::new(self.config.chain_retries, self.config.provision_retry_sleep);
        if self.config.affect_plugin_vols {
            let _ = chain.append(Box::new(CreatePluginVolume::new(
                Arc::clone(&driver),
                &vol_name,
                options,
            )));
        }
        let _ = chain.append(Box::new(CreateClusterVolume::new(
            Arc::clone(&self.cluster),
            volume,
        )));
        let _ = chain.append(Box::new(MonitorBind::new(
            claim.clone(),
            chain.outputs(),
            receiver,
            Arc::clone(&self.registry),
            Arc::clone(&self.recorder),
            self.config.bind_timeout,
        )));

        self.recorder
            .event(
                class_reference(class),
                EventType::Normal,
                REASON_PROVISION_STORAGE,
                &format!(
                    "{} provisioning storage for claim {} ({}) using class {}",
                    class.provisioner,
                    claim_name(claim),
                    claim_id,
                    class_name
                ),
            )
            .await;

        let outputs = chain.outputs();
        if let Err(e) = chain.execute().await {
            self.recorder
                .event(
                    class_reference(class),
                    EventType::Warning,
                    REASON_PROVISION_STORAGE,
                    &format!(
                        "failed to create volume for claim {} with class {}: {}",
                        claim_name(claim),
                        class_name,
                        e
                    ),
                )
                .await;
        }

        outputs
            .get(STEP_CREATE_CLUSTER_VOLUME)
            .and_then(StepOutput::into_volume)
            .and_then(|created| created.metadata.uid)
    }

    /// Run one delete chain for a released volume. Tolerates a
    /// backing volume the plugin no longer reports.
    async fn delete_volume(self: Arc<Self>, volume: PersistentVolume, rm_pv: bool) {
        let name = volume_name(&volume).to_string();
        let provisioned_by = volume_provisioned_by(&volume).unwrap_or("").to_string();
        debug!(
            "cleaning up volume {} (delete chains={}, parked={})",
            name,
            self.throttle.deletes(),
            self.throttle.parked()
        );

        // slow down a delete storm
        let _slot = self.throttle.acquire_delete().await;

        let mut chain = Chain::new(self.config.chain_retries, self.config.delete_retry_sleep);

        if self.config.affect_plugin_vols {
            let (driver, _settings) = match self.drivers.client_for(&provisioned_by).await {
                Ok(pair) => pair,
                Err(e) => {
                    let message = format!(
                        "failed to get volume plugin client for {} while trying to delete volume {}: {}",
                        provisioned_by, name, e
                    );
                    error!("{}", message);
                    self.recorder
                        .event(
                            volume_reference(&volume),
                            EventType::Warning,
                            REASON_DELETE_GET_CLIENT,
                            &message,
                        )
                        .await;
                    return;
                }
            };
            match get_docker_volume(driver.as_ref(), &name).await {
                Some(backing) if backing.name == name => {
                    self.recorder
                        .event(
                            volume_reference(&volume),
                            EventType::Normal,
                            REASON_DELETE_VOLUME,
                            &format!("cleaning up volume named {}", name),
                        )
                        .await;
                    debug!(
                        "plugin volume named {} found, deleting via {}",
                        name, provisioned_by
                    );
                    let _ = chain.append(Box::new(DeletePluginVolume::new(driver, &name)));
                }
                _ => debug!("no plugin volume named {} - nothing to remove", name),
            }
        }

        if rm_pv {
            let _ = chain.append(Box::new(DeleteClusterVolume::new(
                Arc::clone(&self.cluster),
                &name,
            )));
        }

        if let Err(e) = chain.execute().await {
            self.recorder
                .event(
                    volume_reference(&volume),
                    EventType::Warning,
                    REASON_DELETE_VOLUME,
                    &format!("failed to delete volume for {}: {}", name, e),
                )
                .await;
        }
    }

    /// Startup sweep: stamp our manager tag onto the backing volumes
    /// of every bound claim we own that is not already managed.
    pub async fn update_docker_volume_metadata(&self) {
        debug!("metadata update sweep started");
        let mut options = OptionsMap::new();
        options.insert(keys::MANAGER.to_string(), keys::MANAGER_NAME.into());

        let mut waited = 0;
        while self.claim_store.is_empty() {
            if waited > MAX_WAIT_FOR_CLAIMS {
                info!(
                    "no claims found after waiting {} seconds. ignoring update",
                    MAX_WAIT_FOR_CLAIMS
                );
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            waited += 1;
        }

        for claim in self.claim_store.list() {
            if claim_phase(&claim) != CLAIM_BOUND {
                debug!("claim {} was not bound - skipping", claim_name(&claim));
                continue;
            }
            let class_name = claim_class_name(&claim);
            let class = match self.get_class(&class_name) {
                Ok(class) => class,
                Err(_) => {
                    error!(
                        "unable to retrieve class {} for claim {}",
                        class_name,
                        claim_name(&claim)
                    );
                    continue;
                }
            };
            if !class.provisioner.starts_with(&self.name_prefix) {
                info!(
                    "metadata sweep: class {} in claim {} is not ours (provisioner={}) - skipping",
                    class_name,
                    claim_name(&claim),
                    class.provisioner
                );
                continue;
            }
            // a plugin that rejects update is left alone; move on
            if let Err(e) = self
                .update_volume(&claim, &class.provisioner, options.clone())
                .await
            {
                error!(
                    "unable to update volume for claim {}: {}",
                    claim_name(&claim),
                    e
                );
                continue;
            }
        }
        debug!("metadata update sweep ended");
    }

    async fn update_volume(
        &self,
        claim: &PersistentVolumeClaim,
        provisioner: &str,
        options: OptionsMap,
    ) -> Result<()> {
        let vol_name = claim
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.clone())
            .unwrap_or_default();
        if vol_name.is_empty() {
            return Err(crate::error::ProvisionerError::internal(format!(
                "claim {} has no bound volume",
                claim_name(claim)
            )));
        }

        let (driver, _settings) = self.drivers.client_for(provisioner).await?;
        let backing = get_docker_volume(driver.as_ref(), &vol_name).await;
        let Some(backing) = backing.filter(|v| v.name == vol_name) else {
            return Err(crate::error::ProvisionerError::internal(format!(
                "plugin volume named {} was not found",
                vol_name
            )));
        };

        if let Some(manager) = backing.status.get(keys::MANAGER) {
            let manager = manager.to_string();
            if !manager.is_empty() {
                debug!(
                    "claim {} has manager set to {} - skipping",
                    claim_name(claim),
                    manager
                );
                return Ok(());
            }
        }

        debug!(
            "invoking update for volume {} with options {:?}",
            vol_name, options
        );
        driver.update(&vol_name, options).await?;
        Ok(())
    }

    /// Block until at least one storage class is cached, logging
    /// every 30 seconds so a stuck start is visible.
    pub async fn wait_for_classes(&self, token: &CancellationToken) {
        let mut polls = 0;
        while self.class_store.is_empty() {
            if token.is_cancelled() {
                return;
            }
            if polls > 29 {
                info!("no storage class found. unable to make progress.");
                polls = 0;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            polls += 1;
        }
    }

    async fn status_logger(self: Arc<Self>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(STATUS_LOGGING_WAIT) => {}
            }
            match self.cluster.server_version().await {
                Ok(_) => info!(
                    "status: provision chains={}, delete chains={}, parked chains={}, ids tracked={}, connection=valid",
                    self.throttle.provisions(),
                    self.throttle.deletes(),
                    self.throttle.parked(),
                    self.registry.len()
                ),
                Err(e) => {
                    error!(
                        "status: provision chains={}, delete chains={}, parked chains={}, ids tracked={}, connection error={}",
                        self.throttle.provisions(),
                        self.throttle.deletes(),
                        self.throttle.parked(),
                        self.registry.len(),
                        e
                    );
                    return;
                }
            }
        }
    }

    fn get_class(&self, name: &str) -> Result<StorageClass> {
        self.class_store
            .get(name)
            .ok_or_else(|| crate::error::ProvisionerError::ClassNotFound {
                name: name.to_string(),
            })
    }
}

/// A plugin volume by name, or `None` when the plugin does not
/// report one (lookup errors count as absent).
pub(crate) async fn get_docker_volume(driver: &dyn VolumeDriver, name: &str) -> Option<DockerVolume> {
    match driver.get(name).await {
        Ok(volume) if !volume.name.is_empty() => Some(volume),
        _ => None,
    }
}
