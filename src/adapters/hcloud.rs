//! Hetzner Cloud platform adapter, driving the `hcloud` CLI.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, instrument};

use crate::domain::ports::{Platform, PowerState};
use crate::error::{Error, Result};

/// Power control for Hetzner Cloud servers named after their cluster nodes.
#[derive(Debug, Clone)]
pub struct HcloudPlatform {
    binary: String,
}

impl Default for HcloudPlatform {
    fn default() -> Self {
        Self::new("hcloud")
    }
}

impl HcloudPlatform {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, node: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Platform {
                node: node.to_string(),
                reason: format!("failed to run {}: {}", self.binary, e),
            })?;
        if !output.status.success() {
            return Err(Error::Platform {
                node: node.to_string(),
                reason: format!(
                    "{} {} exited with {:?}: {}",
                    self.binary,
                    args.join(" "),
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Find `node` in `name status` lines and map its status to a power state.
fn parse_power_state(listing: &str, node: &str) -> Option<PowerState> {
    listing.lines().find_map(|line| {
        let mut cols = line.split_whitespace();
        match (cols.next(), cols.next()) {
            (Some(name), Some(status)) if name == node => Some(if status == "running" {
                PowerState::Running
            } else {
                PowerState::Off
            }),
            _ => None,
        }
    })
}

#[async_trait]
impl Platform for HcloudPlatform {
    #[instrument(skip(self))]
    async fn power_on_node(&self, node: &str) -> Result<()> {
        info!(node, "Power on");
        self.run(node, &["server", "poweron", node]).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn power_off_node(&self, node: &str) -> Result<()> {
        info!(node, "Power off");
        self.run(node, &["server", "poweroff", node]).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn node_power_state(&self, node: &str) -> Result<PowerState> {
        let listing = self
            .run(
                node,
                &["server", "list", "-o", "noheader", "-o", "columns=name,status"],
            )
            .await?;
        parse_power_state(&listing, node).ok_or_else(|| Error::Platform {
            node: node.to_string(),
            reason: "server not listed by hcloud".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "node-1   running\nnode-2   off\nnode-20  running\n";

    #[test]
    fn test_parse_power_state() {
        assert_eq!(parse_power_state(LISTING, "node-1"), Some(PowerState::Running));
        assert_eq!(parse_power_state(LISTING, "node-2"), Some(PowerState::Off));
        assert_eq!(parse_power_state(LISTING, "node-20"), Some(PowerState::Running));
        assert_eq!(parse_power_state(LISTING, "node-3"), None);
    }

    #[test]
    fn test_transitional_status_is_not_running() {
        assert_eq!(
            parse_power_state("node-1 stopping\n", "node-1"),
            Some(PowerState::Off)
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_platform_error() {
        let platform = HcloudPlatform::new("/nonexistent/hcloud");
        let err = platform.power_off_node("node-1").await.unwrap_err();
        assert_eq!(err.kind(), "platform");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abandoned_power_call_kills_child() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        let dir = std::env::temp_dir().join(format!("hcloud-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir).unwrap();
        let marker = dir.join("powered-off");
        let binary = dir.join("hcloud");
        std::fs::write(
            &binary,
            format!("#!/bin/sh\nsleep 2\ntouch {}\n", marker.display()),
        )
        .unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let platform = HcloudPlatform::new(binary.display().to_string());
        let abandoned =
            tokio::time::timeout(Duration::from_millis(200), platform.power_off_node("node-1"))
                .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
