use crate::error::{DockervolError, Result};
use crate::transport::SocketClient;
use hyper::Method;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";
const DOCKER_SOCKET_TIMEOUT: Duration = Duration::from_secs(300);

/// A docker V2 plugin as the runtime's catalog describes it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Plugin {
    #[serde(rename = "Id", default)]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Enabled", default)]
    pub enabled: bool,
    #[serde(rename = "Config", default)]
    pub config: PluginConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginConfig {
    #[serde(rename = "Interface", default)]
    pub interface: PluginInterface,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginInterface {
    #[serde(rename = "Socket", default)]
    pub socket: String,
}

/// Light-weight client for the container runtime's plugin catalog.
pub struct DockerClient {
    client: SocketClient,
}

impl DockerClient {
    /// `socket_path` is the runtime socket; empty uses the default.
    pub fn new(socket_path: &str) -> Self {
        let path = if socket_path.is_empty() {
            DEFAULT_DOCKER_SOCKET
        } else {
            socket_path
        };
        Self {
            client: SocketClient::new(path, DOCKER_SOCKET_TIMEOUT),
        }
    }

    /// GET /plugins
    pub async fn plugins(&self) -> Result<Vec<Plugin>> {
        let plugins: Vec<Plugin> = self
            .client
            .do_json::<(), _>(Method::GET, "/plugins", None)
            .await
            .map_err(|e| {
                info!("unable to list docker plugins - {}", e);
                e
            })?;
        debug!("catalog returned {} plugins", plugins.len());
        Ok(plugins)
    }
}

/// Resolve the socket path of a V2 plugin by name. Plugin names in
/// the catalog may carry a `:latest` tag. A disabled plugin is an
/// error that still carries the resolved path.
pub async fn resolve_v2_socket(name: &str, docker_socket: &str) -> Result<String> {
    let client = DockerClient::new(docker_socket);
    let plugins = client.plugins().await.map_err(|e| {
        DockervolError::transport(format!("failed to get V2 plugins from docker: {}", e))
    })?;

    for plugin in plugins {
        if plugin.name == name || plugin.name == format!("{}:latest", name) {
            let socket_path = format!(
                "/run/docker/plugins/{}/{}",
                plugin.id, plugin.config.interface.socket
            );
            if !plugin.enabled {
                return Err(DockervolError::PluginDisabled {
                    name: name.to_string(),
                    socket_path,
                });
            }
            return Ok(socket_path);
        }
    }

    Err(DockervolError::PluginNotFound {
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_catalog_decode() {
        let json = serde_json::json!([{
            "Id": "9c7b7ab4",
            "Name": "acme/volumes:latest",
            "Enabled": true,
            "Config": {"Interface": {"Socket": "acme.sock"}}
        }]);
        let plugins: Vec<Plugin> = serde_json::from_value(json).unwrap();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].id, "9c7b7ab4");
        assert!(plugins[0].enabled);
        assert_eq!(plugins[0].config.interface.socket, "acme.sock");
    }
}
