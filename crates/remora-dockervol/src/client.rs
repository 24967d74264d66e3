use crate::catalog::resolve_v2_socket;
use crate::error::{DockervolError, Result};
use crate::transport::SocketClient;
use async_trait::async_trait;
use hyper::Method;
use remora_core::OptionsMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

pub const ACTIVATE_URI: &str = "/Plugin.Activate";
pub const CAPABILITIES_URI: &str = "/VolumeDriver.Capabilities";
pub const CREATE_URI: &str = "/VolumeDriver.Create";
pub const UPDATE_URI: &str = "/VolumeDriver.Update";
pub const LIST_URI: &str = "/VolumeDriver.List";
pub const GET_URI: &str = "/VolumeDriver.Get";
pub const REMOVE_URI: &str = "/VolumeDriver.Remove";
pub const MOUNT_URI: &str = "/VolumeDriver.Mount";
pub const UNMOUNT_URI: &str = "/VolumeDriver.Unmount";

const DEFAULT_SOCKET_PATH: &str = "/run/docker/plugins/remora.sock";
const SOCKET_TIMEOUT: Duration = Duration::from_secs(300);
const MOUNT_MAX_TRIES: u64 = 3;

/// Details about a plugin volume as the driver reports it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerVolume {
    #[serde(rename = "Name", default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "Mountpoint", default, skip_serializing_if = "String::is_empty")]
    pub mountpoint: String,
    #[serde(rename = "Status", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub status: OptionsMap,
}

/// Capabilities advertised by the plugin.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginCapabilities {
    #[serde(rename = "Scope", default)]
    pub scope: String,
}

/// Settings for constructing a [`DockerVolumePlugin`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Full path to the plugin socket, or the name of a docker V2
    /// plugin to resolve through the plugin catalog.
    pub socket_path: String,
    /// Strip orchestrator-internal option keys before create/update.
    pub strip_k8s_from_options: bool,
    /// Probe `/VolumeDriver.Capabilities` at construction.
    pub supports_capabilities: bool,
    /// Socket of the container runtime, for V2 plugin resolution.
    /// Empty uses the runtime default.
    pub docker_socket_path: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            strip_k8s_from_options: true,
            supports_capabilities: false,
            docker_socket_path: String::new(),
        }
    }
}

/// Typed operations against a single docker volume plugin.
///
/// The provisioner and the per-node helper both speak to the plugin
/// through this trait; [`DockerVolumePlugin`] is the socket-backed
/// implementation and [`crate::mock::MockVolumeDriver`] backs tests.
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    async fn activate(&self) -> Result<()>;
    async fn capabilities(&self) -> Result<PluginCapabilities>;
    /// Create a volume. The returned name is the one the plugin
    /// chose, which callers must use from then on.
    async fn create(&self, name: &str, options: OptionsMap) -> Result<String>;
    async fn update(&self, name: &str, options: OptionsMap) -> Result<String>;
    async fn list(&self) -> Result<Vec<DockerVolume>>;
    async fn get(&self, name: &str) -> Result<DockerVolume>;
    async fn mount(&self, name: &str, mount_id: &str) -> Result<String>;
    async fn unmount(&self, name: &str, mount_id: &str) -> Result<()>;
    /// Remove a volume, optionally tagged with a manager name the
    /// plugin may use to refuse foreign removals.
    async fn remove(&self, name: &str, manager: Option<&str>) -> Result<()>;
}

#[derive(Serialize)]
struct DriverRequest<'a> {
    #[serde(rename = "Name", skip_serializing_if = "str::is_empty")]
    name: &'a str,
    #[serde(rename = "Opts", skip_serializing_if = "Option::is_none")]
    opts: Option<&'a OptionsMap>,
}

#[derive(Serialize)]
struct MountRequest<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "ID")]
    id: &'a str,
}

#[derive(Serialize)]
struct Empty {}

#[derive(Deserialize, Default)]
struct ActivateResponse {
    #[serde(rename = "Implements", default)]
    #[allow(unused)]
    implements: Vec<String>,
}

#[derive(Deserialize, Default)]
struct GetResponse {
    #[serde(rename = "Volume", default)]
    volume: DockerVolume,
    #[serde(rename = "Err", default)]
    err: String,
}

#[derive(Deserialize, Default)]
struct ListResponse {
    #[serde(rename = "Volumes", default)]
    volumes: Vec<DockerVolume>,
    #[serde(rename = "Err", default)]
    err: String,
}

#[derive(Deserialize, Default)]
struct MountResponse {
    #[serde(rename = "Mountpoint", default)]
    mountpoint: String,
    #[serde(rename = "Err", default)]
    err: String,
}

#[derive(Deserialize, Default)]
struct CapabilitiesResponse {
    #[serde(rename = "Capabilities", default)]
    capabilities: PluginCapabilities,
    #[serde(rename = "Err", default)]
    err: String,
}

/// Promote a non-empty `Err` field to a caller-visible error.
fn driver_error_check(err: &str) -> Result<()> {
    if err.is_empty() {
        Ok(())
    } else {
        Err(DockervolError::driver(err))
    }
}

/// The socket-backed client to a docker volume plugin.
pub struct DockerVolumePlugin {
    client: SocketClient,
    strip_k8s_opts: bool,
}

impl DockerVolumePlugin {
    /// Build a client from `options`. A non-absolute socket path is
    /// treated as a V2 plugin name and resolved through the
    /// container runtime's plugin catalog. When asked, probes the
    /// capabilities endpoint to verify connectivity.
    pub async fn connect(options: &Options) -> Result<Self> {
        let socket_path = if options.socket_path.starts_with('/') {
            options.socket_path.clone()
        } else {
            resolve_v2_socket(&options.socket_path, &options.docker_socket_path).await?
        };

        let socket_path = if socket_path.is_empty() {
            DEFAULT_SOCKET_PATH.to_string()
        } else {
            socket_path
        };

        let dvp = Self {
            client: SocketClient::new(&socket_path, SOCKET_TIMEOUT),
            strip_k8s_opts: options.strip_k8s_from_options,
        };

        if options.supports_capabilities {
            let caps = dvp.capabilities().await?;
            debug!("plugin at {} reports scope '{}'", socket_path, caps.scope);
        }

        Ok(dvp)
    }

    async fn create_or_update(
        &self,
        name: &str,
        mut options: OptionsMap,
        is_update: bool,
    ) -> Result<String> {
        if name.is_empty() {
            return Err(DockervolError::MissingName);
        }
        if self.strip_k8s_opts {
            options.retain(|key, _| !key.starts_with(remora_core::keys::K8S_OPTION_PREFIX));
        }

        let req = DriverRequest {
            name,
            opts: Some(&options),
        };
        let (method, uri) = if is_update {
            (Method::PUT, UPDATE_URI)
        } else {
            (Method::POST, CREATE_URI)
        };
        let res: GetResponse = self.client.do_json(method, uri, Some(&req)).await?;
        driver_error_check(&res.err)?;
        Ok(res.volume.name)
    }

    async fn mounter(&self, name: &str, mount_id: &str, uri: &str) -> Result<String> {
        if name.is_empty() {
            return Err(DockervolError::MissingName);
        }
        let req = MountRequest { name, id: mount_id };
        let res: MountResponse = self.client.do_json(Method::POST, uri, Some(&req)).await?;
        driver_error_check(&res.err)?;
        Ok(res.mountpoint)
    }

    /// Mount and unmount poke at kernel state, so they get their own
    /// retry layer on top of the transport's.
    async fn mounter_with_retry(&self, name: &str, mount_id: &str, uri: &str) -> Result<String> {
        let mut try_number = 0;
        loop {
            debug!(
                "mounter called with {} {} {} try:{}",
                name,
                mount_id,
                uri,
                try_number + 1
            );
            match self.mounter(name, mount_id, uri).await {
                Ok(mountpoint) => return Ok(mountpoint),
                Err(e) if try_number < MOUNT_MAX_TRIES => {
                    try_number += 1;
                    debug!("{} failed for {}: {}", uri, name, e);
                    tokio::time::sleep(Duration::from_secs(try_number)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl VolumeDriver for DockerVolumePlugin {
    async fn activate(&self) -> Result<()> {
        let _res: ActivateResponse = self
            .client
            .do_json(Method::POST, ACTIVATE_URI, Some(&Empty {}))
            .await?;
        Ok(())
    }

    async fn capabilities(&self) -> Result<PluginCapabilities> {
        let res: CapabilitiesResponse = self
            .client
            .do_json(Method::POST, CAPABILITIES_URI, Some(&Empty {}))
            .await?;
        driver_error_check(&res.err)?;
        Ok(res.capabilities)
    }

    async fn create(&self, name: &str, options: OptionsMap) -> Result<String> {
        let created = self.create_or_update(name, options, false).await?;
        info!("created plugin volume named {}", created);
        Ok(created)
    }

    async fn update(&self, name: &str, options: OptionsMap) -> Result<String> {
        self.create_or_update(name, options, true).await
    }

    async fn list(&self) -> Result<Vec<DockerVolume>> {
        let res: ListResponse = self
            .client
            .do_json(Method::POST, LIST_URI, Some(&Empty {}))
            .await?;
        driver_error_check(&res.err)?;
        Ok(res.volumes)
    }

    async fn get(&self, name: &str) -> Result<DockerVolume> {
        let req = DriverRequest { name, opts: None };
        let res: GetResponse = self.client.do_json(Method::POST, GET_URI, Some(&req)).await?;
        driver_error_check(&res.err)?;
        Ok(res.volume)
    }

    async fn mount(&self, name: &str, mount_id: &str) -> Result<String> {
        self.mounter_with_retry(name, mount_id, MOUNT_URI).await
    }

    async fn unmount(&self, name: &str, mount_id: &str) -> Result<()> {
        self.mounter_with_retry(name, mount_id, UNMOUNT_URI).await?;
        Ok(())
    }

    async fn remove(&self, name: &str, manager: Option<&str>) -> Result<()> {
        if name.is_empty() {
            return Err(DockervolError::MissingName);
        }
        let opts = manager.map(|m| {
            let mut map = OptionsMap::new();
            map.insert(remora_core::keys::MANAGER.to_string(), m.into());
            map
        });
        let req = DriverRequest {
            name,
            opts: opts.as_ref(),
        };
        let res: GetResponse = self
            .client
            .do_json(Method::POST, REMOVE_URI, Some(&req))
            .await?;
        driver_error_check(&res.err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_request_wire_shape() {
        let mut opts = OptionsMap::new();
        opts.insert("size".to_string(), 16i64.into());
        let req = DriverRequest {
            name: "vol1",
            opts: Some(&opts),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, serde_json::json!({"Name": "vol1", "Opts": {"size": 16}}));
    }

    #[test]
    fn test_driver_request_omits_empty_fields() {
        let req = DriverRequest {
            name: "vol1",
            opts: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, serde_json::json!({"Name": "vol1"}));
    }

    #[test]
    fn test_get_response_err_promotion() {
        let res: GetResponse =
            serde_json::from_value(serde_json::json!({"Err": "no such volume"})).unwrap();
        assert!(driver_error_check(&res.err).is_err());

        let res: GetResponse =
            serde_json::from_value(serde_json::json!({"Volume": {"Name": "v"}})).unwrap();
        assert!(driver_error_check(&res.err).is_ok());
        assert_eq!(res.volume.name, "v");
    }

    #[test]
    fn test_volume_status_decodes_mixed_scalars() {
        let res: GetResponse = serde_json::from_value(serde_json::json!({
            "Volume": {
                "Name": "v",
                "Mountpoint": "/mnt/v",
                "Status": {"manager": "k8s", "sizeInGiB": 16, "devicePath": "/dev/dm-3"}
            }
        }))
        .unwrap();
        assert_eq!(
            res.volume.status.get("manager").and_then(|v| v.as_str()),
            Some("k8s")
        );
        assert_eq!(
            res.volume.status.get("sizeInGiB").and_then(|v| v.as_i64()),
            Some(16)
        );
    }
}
