//! Run configuration
//!
//! Every timeout and interval the harness uses lives here so that scenarios
//! never carry their own literals. Values are loaded from an optional YAML
//! file and then overridden from the command line.
//!
//! ```yaml
//! namespace: mayastor
//! control_plane: v1
//! rest_endpoints: ["10.0.0.11", "10.0.0.12"]
//! platform: hetzner
//! pools:
//!   device: /dev/sdb
//! wait:
//!   timeout_secs: 120
//!   interval_secs: 5
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::domain::ControlPlaneVersion;
use crate::error::{Error, Result};

/// Port the REST control plane is exposed on.
pub const DEFAULT_REST_PORT: u16 = 30011;

/// Port the e2e node agent listens on.
pub const DEFAULT_AGENT_PORT: u16 = 10012;

// =============================================================================
// Platform Selection
// =============================================================================

/// Cloud platform hosting the cluster nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    /// Hetzner Cloud, driven through the `hcloud` CLI
    Hetzner,
    /// No power control available
    #[default]
    None,
}

impl std::str::FromStr for PlatformKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "hetzner" | "hcloud" => Ok(PlatformKind::Hetzner),
            "none" | "" => Ok(PlatformKind::None),
            other => Err(Error::Config(format!("unknown platform: {}", other))),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Default polling budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub timeout_secs: u64,
    pub interval_secs: u64,
    /// Budget for a full rebuild (child and nexus back Online)
    pub rebuild_timeout_secs: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            interval_secs: 5,
            rebuild_timeout_secs: 120,
        }
    }
}

impl WaitConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn rebuild_timeout(&self) -> Duration {
        Duration::from_secs(self.rebuild_timeout_secs)
    }
}

/// Fault injection timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// How long the engine pod may take to leave a node after its label is removed
    pub engine_unschedule_timeout_secs: u64,
    /// How long the engine pod may take to come back after its label is restored
    pub engine_reschedule_timeout_secs: u64,
    pub engine_poll_interval_secs: u64,
    /// Delay before a spawned fault is applied
    pub default_delay_secs: u64,
    pub agent_port: u16,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            engine_unschedule_timeout_secs: 100,
            engine_reschedule_timeout_secs: 180,
            engine_poll_interval_secs: 5,
            default_delay_secs: 10,
            agent_port: DEFAULT_AGENT_PORT,
        }
    }
}

impl FaultConfig {
    pub fn engine_unschedule_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_unschedule_timeout_secs)
    }

    pub fn engine_reschedule_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_reschedule_timeout_secs)
    }

    pub fn engine_poll_interval(&self) -> Duration {
        Duration::from_secs(self.engine_poll_interval_secs)
    }

    pub fn default_delay(&self) -> Duration {
        Duration::from_secs(self.default_delay_secs)
    }
}

/// Data integrity workload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Budget for one fio phase
    pub fio_timeout_secs: u64,
    /// Block device inside the application pod
    pub device: String,
    /// Namespace application pods run in
    pub app_namespace: String,
    /// Size of the volume under test, used to scale the fio budget
    pub volume_size_mb: u64,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            fio_timeout_secs: 90,
            device: "/dev/sdm".to_string(),
            app_namespace: "default".to_string(),
            volume_size_mb: 1024,
        }
    }
}

impl IntegrityConfig {
    pub fn fio_timeout(&self) -> Duration {
        Duration::from_secs(self.fio_timeout_secs)
    }

    /// fio budget for a volume of `vol_mb` megabytes: half a second per MB.
    pub fn fio_timeout_for_volume(vol_mb: u64) -> Duration {
        Duration::from_secs((vol_mb / 2).max(1))
    }
}

/// Pool layout and pool wait budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Disk each configured pool is built on
    pub device: String,
    pub create_timeout_secs: u64,
    pub create_interval_secs: u64,
    pub delete_interval_secs: u64,
    pub stale_online_timeout_secs: u64,
    pub stale_online_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            device: "/dev/sdb".to_string(),
            create_timeout_secs: 120,
            create_interval_secs: 5,
            delete_interval_secs: 5,
            stale_online_timeout_secs: 300,
            stale_online_interval_secs: 10,
        }
    }
}

impl PoolConfig {
    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }

    pub fn create_interval(&self) -> Duration {
        Duration::from_secs(self.create_interval_secs)
    }

    pub fn delete_interval(&self) -> Duration {
        Duration::from_secs(self.delete_interval_secs)
    }

    pub fn stale_online_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_online_timeout_secs)
    }

    pub fn stale_online_interval(&self) -> Duration {
        Duration::from_secs(self.stale_online_interval_secs)
    }

    /// Name of the configured pool on `node`.
    pub fn pool_name_for(node: &str) -> String {
        format!("pool-on-{}", node)
    }
}

// =============================================================================
// Top-level Configuration
// =============================================================================

/// Complete run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    /// Namespace the storage system is installed in
    pub namespace: String,
    pub control_plane: ControlPlaneVersion,
    /// Node addresses tried in order for the REST control plane
    pub rest_endpoints: Vec<String>,
    pub rest_port: u16,
    pub request_timeout_secs: u64,
    pub platform: PlatformKind,
    pub wait: WaitConfig,
    pub faults: FaultConfig,
    pub integrity: IntegrityConfig,
    pub pools: PoolConfig,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            namespace: "mayastor".to_string(),
            control_plane: ControlPlaneVersion::V1,
            rest_endpoints: Vec::new(),
            rest_port: DEFAULT_REST_PORT,
            request_timeout_secs: 30,
            platform: PlatformKind::None,
            wait: WaitConfig::default(),
            faults: FaultConfig::default(),
            integrity: IntegrityConfig::default(),
            pools: PoolConfig::default(),
        }
    }
}

impl SentinelConfig {
    /// Load configuration from a YAML file. Missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: SentinelConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Reject configurations that would make every wait degenerate.
    pub fn validate(&self) -> Result<()> {
        if self.wait.interval_secs == 0 {
            return Err(Error::Config("wait.interval_secs must be non-zero".into()));
        }
        if self.pools.create_interval_secs == 0 || self.pools.stale_online_interval_secs == 0 {
            return Err(Error::Config("pool poll intervals must be non-zero".into()));
        }
        if self.faults.engine_poll_interval_secs == 0 {
            return Err(Error::Config(
                "faults.engine_poll_interval_secs must be non-zero".into(),
            ));
        }
        if self.pools.device.is_empty() {
            return Err(Error::Config("pools.device must be set".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_match_harness_budgets() {
        let config = SentinelConfig::default();
        assert_eq!(config.wait.timeout(), Duration::from_secs(120));
        assert_eq!(config.wait.interval(), Duration::from_secs(5));
        assert_eq!(config.wait.rebuild_timeout(), Duration::from_secs(120));
        assert_eq!(config.integrity.fio_timeout(), Duration::from_secs(90));
        assert_eq!(
            config.faults.engine_unschedule_timeout(),
            Duration::from_secs(100)
        );
        assert_eq!(
            config.faults.engine_reschedule_timeout(),
            Duration::from_secs(180)
        );
        assert_eq!(config.pools.create_timeout(), Duration::from_secs(120));
        assert_eq!(config.pools.stale_online_timeout(), Duration::from_secs(300));
        assert_eq!(config.pools.stale_online_interval(), Duration::from_secs(10));
        assert_eq!(config.rest_port, 30011);
        assert_eq!(config.faults.agent_port, 10012);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = SentinelConfig::from_yaml(
            r#"
control_plane: v0
platform: hetzner
wait:
  timeout_secs: 30
pools:
  device: /dev/nvme1n1
"#,
        )
        .unwrap();

        assert_eq!(config.control_plane, ControlPlaneVersion::V0);
        assert_eq!(config.platform, PlatformKind::Hetzner);
        assert_eq!(config.wait.timeout_secs, 30);
        assert_eq!(config.wait.interval_secs, 5);
        assert_eq!(config.pools.device, "/dev/nvme1n1");
        assert_eq!(config.namespace, "mayastor");
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = SentinelConfig::from_yaml("wait:\n  interval_secs: 0\n").unwrap_err();
        assert_matches!(err, Error::Config(_));
    }

    #[test]
    fn test_bad_yaml_is_yaml_error() {
        let err = SentinelConfig::from_yaml("wait: [1, 2").unwrap_err();
        assert_matches!(err, Error::Yaml(_));
    }

    #[test]
    fn test_fio_timeout_scales_with_volume() {
        assert_eq!(
            IntegrityConfig::fio_timeout_for_volume(1024),
            Duration::from_secs(512)
        );
        assert_eq!(
            IntegrityConfig::fio_timeout_for_volume(1),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_pool_name_for_node() {
        assert_eq!(PoolConfig::pool_name_for("worker-2"), "pool-on-worker-2");
    }

    #[test]
    fn test_platform_from_str() {
        assert_eq!("hcloud".parse::<PlatformKind>().unwrap(), PlatformKind::Hetzner);
        assert_eq!("none".parse::<PlatformKind>().unwrap(), PlatformKind::None);
        assert!("aws".parse::<PlatformKind>().is_err());
    }
}
