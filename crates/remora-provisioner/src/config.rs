use crate::error::{ProvisionerError, Result};
use remora_core::keys;
use remora_core::{OptionValue, OptionsMap};
use serde_json::Value;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const DEFAULT_FACTOR_FOR_CONVERSION: i64 = 1_073_741_824;

/// Per-driver settings from the side-car JSON file that sits next to
/// the flexvolume plugin executable.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Path to the plugin socket, or a V2 plugin name.
    pub socket_path: String,
    /// Strip orchestrator-internal option keys before create/update.
    pub strip_k8s_from_options: bool,
    /// Option keys that carry a storage size and follow the claim's
    /// requested capacity.
    pub storage_resource_options: Vec<String>,
    /// Divisor translating requested bytes into plugin size units.
    pub factor_for_conversion: i64,
    /// Options merged under (never over) the computed option map.
    pub default_options: OptionsMap,
}

impl Default for DriverConfig {
    fn default() -> Self {
        let mut default_options = OptionsMap::new();
        default_options.insert("mountConflictDelay".to_string(), OptionValue::Int(30));
        default_options.insert(keys::MANAGER.to_string(), keys::MANAGER_NAME.into());
        Self {
            socket_path: "/run/docker/plugins/remora.sock".to_string(),
            strip_k8s_from_options: true,
            storage_resource_options: vec!["size".to_string(), "sizeInGiB".to_string()],
            factor_for_conversion: DEFAULT_FACTOR_FOR_CONVERSION,
            default_options,
        }
    }
}

impl DriverConfig {
    /// The side-car config path for a `<vendor>/<driver>` provisioner
    /// id: `<plugin-dir>/<vendor~driver>/<driver>.json`.
    pub fn config_path(provisioner_name: &str) -> Result<PathBuf> {
        let mut segments = provisioner_name.splitn(2, '/');
        let vendor = segments.next().unwrap_or_default();
        let driver = segments.next().unwrap_or_default();
        if vendor.is_empty() || driver.is_empty() {
            return Err(ProvisionerError::InvalidProvisionerName {
                name: provisioner_name.to_string(),
            });
        }
        Ok(PathBuf::from(keys::FLEXVOLUME_BASE_PATH)
            .join(format!("{}~{}", vendor, driver))
            .join(format!("{}.json", driver)))
    }

    /// Resolve and load the config for a provisioner id. File
    /// problems are not fatal: they are logged and defaults used.
    pub fn for_provisioner(provisioner_name: &str) -> Result<DriverConfig> {
        let path = Self::config_path(provisioner_name)?;
        debug!("looking for {}", path.display());
        match Self::load(&path) {
            Ok(config) => Ok(config),
            Err(e) => {
                info!(
                    "unable to process config at {}, {}. Using defaults.",
                    path.display(),
                    e
                );
                Ok(DriverConfig::default())
            }
        }
    }

    /// Load a driver config from `path`, falling back to the default
    /// for each key that is absent or unusable.
    pub fn load(path: &Path) -> Result<DriverConfig> {
        let json = JsonConfig::from_path(path)?;
        let mut config = DriverConfig::default();

        if let Ok(socket) = json.get_string("dockerVolumePluginSocketPath") {
            config.socket_path = socket;
        }
        if let Ok(strip) = json.get_bool("stripK8sFromOptions") {
            config.strip_k8s_from_options = strip;
        }
        if let Ok(options) = json.get_string_slice("listOfStorageResourceOptions") {
            config.storage_resource_options = options;
        }
        let factor = json.get_i64("factorForConversion").unwrap_or(0);
        if factor != 0 {
            config.factor_for_conversion = factor;
        }
        if let Ok(maps) = json.get_map_slice("defaultOptions") {
            debug!("parsing defaultOptions {:?}", maps);
            let mut options = OptionsMap::new();
            for entries in maps {
                for (key, value) in entries {
                    if let Ok(value) = serde_json::from_value::<OptionValue>(value) {
                        options.insert(key, value);
                    }
                }
            }
            config.default_options = options;
        }

        Ok(config)
    }
}

/// A map loaded from a JSON file, read through coercing accessors:
/// numbers written as strings parse, scalars asked for as strings
/// stringify. Side-car configs are hand-written and deserve the
/// slack.
pub struct JsonConfig {
    config: serde_json::Map<String, Value>,
}

impl JsonConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| ProvisionerError::config(format!("{}: {}", path.display(), e)))?;
        let config = serde_json::from_reader(file)
            .map_err(|e| ProvisionerError::config(format!("{}: {}", path.display(), e)))?;
        Ok(Self { config })
    }

    pub fn get_string(&self, key: &str) -> Result<String> {
        match self.config.get(key) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err(ProvisionerError::config(format!("key:{} not found", key))),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        match self.config.get(key) {
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) => s
                .parse()
                .map_err(|e| ProvisionerError::config(format!("key:{} is not a bool: {}", key, e))),
            Some(other) => Err(ProvisionerError::config(format!(
                "key:{} is not a bool. value:{}",
                key, other
            ))),
            None => Err(ProvisionerError::config(format!("key:{} not found", key))),
        }
    }

    pub fn get_i64(&self, key: &str) -> Result<i64> {
        match self.config.get(key) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| {
                    ProvisionerError::config(format!("key:{} is not a number. value:{}", key, n))
                }),
            Some(Value::String(s)) => s.parse().map_err(|e| {
                ProvisionerError::config(format!("key:{} is not a number: {}", key, e))
            }),
            Some(other) => Err(ProvisionerError::config(format!(
                "key:{} is not a number. value:{}",
                key, other
            ))),
            None => Err(ProvisionerError::config(format!("key:{} not found", key))),
        }
    }

    pub fn get_string_slice(&self, key: &str) -> Result<Vec<String>> {
        match self.config.get(key) {
            Some(Value::Array(items)) => Ok(items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()),
            Some(other) => Err(ProvisionerError::config(format!(
                "key:{} is not a slice. value:{}",
                key, other
            ))),
            None => Err(ProvisionerError::config(format!("key:{} not found", key))),
        }
    }

    pub fn get_map_slice(&self, key: &str) -> Result<Vec<serde_json::Map<String, Value>>> {
        match self.config.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::Object(map) => Ok(map.clone()),
                    other => Err(ProvisionerError::config(format!(
                        "key:{} contains a non-map entry: {}",
                        key, other
                    ))),
                })
                .collect(),
            Some(other) => Err(ProvisionerError::config(format!(
                "key:{} is not a slice. value:{}",
                key, other
            ))),
            None => Err(ProvisionerError::config(format!("key:{} not found", key))),
        }
    }
}
