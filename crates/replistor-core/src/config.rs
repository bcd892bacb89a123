use crate::error::{DriverError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// How the backend expects resize sizes to be expressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMode {
    /// Signed difference from the current size
    #[default]
    Relative,
    /// Full new size, replacing the current one
    Absolute,
}

/// Reconnect and timeout parameters for the backend transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Upper bound for a single backend call before it counts as a
    /// connection failure
    pub call_timeout_secs: u64,
    /// Upper bound for establishing a connection
    pub connect_timeout_secs: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

impl ReconnectPolicy {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Driver configuration
///
/// Loading is owned by the caller; the CLI reads it from YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Backend control plane endpoint
    pub endpoint: String,
    /// Number of nodes each volume is replicated to
    pub redundancy: u32,
    /// Whether extend may be called with a smaller size
    pub allow_shrink: bool,
    /// Resize calling convention of the backend
    pub resize_mode: ResizeMode,
    pub reconnect: ReconnectPolicy,
    /// Prefix for backend resource names derived from volume ids
    pub resource_prefix: String,
    /// Prefix for backend snapshot names derived from snapshot ids
    pub snapshot_prefix: String,
    /// Backend name reported in volume stats
    pub backend_name: String,
    /// Percentage of capacity the scheduler should keep free
    pub reserved_percentage: u8,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:6996".to_string(),
            redundancy: 1,
            allow_shrink: false,
            resize_mode: ResizeMode::default(),
            reconnect: ReconnectPolicy::default(),
            resource_prefix: "vol-".to_string(),
            snapshot_prefix: "snap-".to_string(),
            backend_name: "replistor".to_string(),
            reserved_percentage: 0,
        }
    }
}

impl DriverConfig {
    /// Load configuration from a YAML file. Missing fields take defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading driver config from {}", path.display());

        let data = std::fs::read_to_string(path).map_err(|e| {
            DriverError::invalid_config(
                format!("Failed to read {}: {}", path.display(), e),
                "Check that the config file exists and is readable",
            )
        })?;
        Self::from_yaml(&data)
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml(data: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(data).map_err(|e| {
            DriverError::invalid_config(
                format!("Failed to parse config: {}", e),
                "Check the YAML syntax and field names",
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the driver cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.redundancy == 0 {
            return Err(DriverError::invalid_config(
                "redundancy must be at least 1",
                "Set 'redundancy' to the number of replicas per volume",
            ));
        }
        if self.endpoint.trim().is_empty() {
            return Err(DriverError::invalid_config(
                "endpoint is empty",
                "Set 'endpoint' to the backend control plane URL",
            ));
        }
        if self.resource_prefix.is_empty() || self.snapshot_prefix.is_empty() {
            return Err(DriverError::invalid_config(
                "resource and snapshot prefixes must not be empty",
                "Use distinct non-empty prefixes such as 'vol-' and 'snap-'",
            ));
        }
        if self.reserved_percentage > 100 {
            return Err(DriverError::invalid_config(
                format!("reserved_percentage {} exceeds 100", self.reserved_percentage),
                "Use a value between 0 and 100",
            ));
        }
        if self.reconnect.call_timeout_secs == 0 {
            return Err(DriverError::invalid_config(
                "reconnect.call_timeout_secs must be positive",
                "Use a timeout of at least one second",
            ));
        }
        Ok(())
    }
}
