//! Observed-state types for the container runtime gateway

use crate::error::{BerthError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Network protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(BerthError::Network(format!(
                "Unknown protocol: {}",
                other
            ))),
        }
    }
}

/// Container status as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is created but not running
    Created,
    /// Container is running
    Running,
    /// Container is restarting
    Restarting,
    /// Container is paused
    Paused,
    /// Container has exited
    Exited,
    /// Container is in an error state
    Dead,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Restarting => write!(f, "restarting"),
            ContainerStatus::Paused => write!(f, "paused"),
            ContainerStatus::Exited => write!(f, "exited"),
            ContainerStatus::Dead => write!(f, "dead"),
        }
    }
}

impl ContainerStatus {
    /// Parse an engine status string, mapping anything unrecognised to Dead
    pub fn parse(s: &str) -> Self {
        match s {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "restarting" => ContainerStatus::Restarting,
            "paused" => ContainerStatus::Paused,
            "exited" | "removing" => ContainerStatus::Exited,
            _ => ContainerStatus::Dead,
        }
    }
}

/// A resolved image as reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    /// Image ID (content digest)
    pub id: String,
    /// Repo tags published by the runtime, e.g. ["nginx:1.21"]
    pub repo_tags: Vec<String>,
    /// Container ports the image declares, e.g. [(80, Tcp)]
    pub exposed_ports: Vec<(u16, Protocol)>,
}

/// A single container-port to host-port binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Port inside the container
    pub container_port: u16,
    /// Protocol of the exposed port
    pub protocol: Protocol,
    /// Ephemeral host port assigned by the runtime
    pub host_port: u16,
}

/// The runtime's view of one container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedContainer {
    /// Container ID
    pub id: String,
    /// Container labels
    pub labels: HashMap<String, String>,
    /// Repo tags of the image the container was started from
    pub image_tags: Vec<String>,
    /// Lifecycle status
    pub status: ContainerStatus,
    /// Published port bindings (empty until the runtime finishes network setup)
    pub ports: Vec<PortBinding>,
    /// Creation time
    pub created_at: Option<DateTime<Utc>>,
}

impl ObservedContainer {
    /// Check if the container is running
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// Check if the container carries the given label
    pub fn has_label(&self, key: &str, value: &str) -> bool {
        self.labels.get(key).map(String::as_str) == Some(value)
    }
}

/// Parse an exposed-port key of the form "80/tcp"
pub fn parse_port_key(key: &str) -> Result<(u16, Protocol)> {
    let (port, proto) = key.split_once('/').ok_or_else(|| {
        BerthError::Network(format!("Malformed port key '{}'", key))
    })?;

    let port = port
        .parse::<u16>()
        .map_err(|_| BerthError::Network(format!("Malformed port number in '{}'", key)))?;

    Ok((port, proto.parse()?))
}

/// One host-side binding entry in the engine's port table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostBinding {
    #[serde(rename = "HostIp", default)]
    pub host_ip: String,
    #[serde(rename = "HostPort")]
    pub host_port: String,
}

/// Parse the engine's `NetworkSettings.Ports` table into port bindings.
///
/// The table maps "port/proto" keys to a list of host bindings, where the
/// list may be null for exposed-but-unpublished ports:
/// `{"80/tcp": [{"HostIp": "0.0.0.0", "HostPort": "32768"}], "443/tcp": null}`
pub fn parse_port_table(
    table: &HashMap<String, Option<Vec<HostBinding>>>,
) -> Result<Vec<PortBinding>> {
    let mut bindings = Vec::new();

    for (key, hosts) in table {
        let (container_port, protocol) = parse_port_key(key)?;

        for host in hosts.iter().flatten() {
            let host_port = host.host_port.parse::<u16>().map_err(|_| {
                BerthError::Network(format!(
                    "Malformed host port '{}' for '{}'",
                    host.host_port, key
                ))
            })?;

            bindings.push(PortBinding {
                container_port,
                protocol,
                host_port,
            });
        }
    }

    bindings.sort_by_key(|b| (b.container_port, b.protocol, b.host_port));
    Ok(bindings)
}
