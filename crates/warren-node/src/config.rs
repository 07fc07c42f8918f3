//! Configuration structures for VM instances and the node controller.

use crate::teardown::DEFAULT_KILL_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Which instance variant a configuration launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmKind {
    /// Base instance with no hypervisor control channel.
    Generic,
    /// KVM instance exposing monitor-backed operations
    /// (raw control, migrate, screenshot).
    Kvm,
}

impl fmt::Display for VmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmKind::Generic => write!(f, "generic"),
            VmKind::Kvm => write!(f, "kvm"),
        }
    }
}

/// A network attachment, naming the virtual LAN it connects to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Virtual LAN identifier
    pub vlan: u32,
    /// Optional fixed MAC address
    pub mac: Option<String>,
}

/// Launch-time configuration for a VM instance.
///
/// Immutable once the instance is launched; reconfiguration happens by
/// killing and relaunching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    /// Instance variant to launch
    pub kind: VmKind,
    /// Number of vCPUs to allocate
    pub vcpus: u32,
    /// Memory in MB
    pub memory_mb: u32,
    /// Ordered network attachments
    pub networks: Vec<NetworkConfig>,
    /// Incoming-migration file to restore from (KVM only)
    pub migrate_path: Option<String>,
}

impl VmConfig {
    /// Create a configuration with default resources.
    pub fn new(kind: VmKind) -> Self {
        Self {
            kind,
            vcpus: 1,
            memory_mb: 512,
            networks: Vec::new(),
            migrate_path: None,
        }
    }

    /// Set the number of vCPUs.
    pub fn with_vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    /// Set the memory in MB.
    pub fn with_memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    /// Append a network attachment on the given VLAN.
    pub fn with_network(mut self, vlan: u32) -> Self {
        self.networks.push(NetworkConfig { vlan, mac: None });
        self
    }

    /// Set the incoming-migration file path.
    pub fn with_migrate_path(mut self, path: impl Into<String>) -> Self {
        self.migrate_path = Some(path.into());
        self
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new(VmKind::Generic)
    }
}

/// Configuration for the node controller itself.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// How long a kill invocation waits for teardown acknowledgments
    /// before logging the stragglers and returning. One value per node;
    /// not configurable per call.
    pub kill_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            kill_timeout: DEFAULT_KILL_TIMEOUT,
        }
    }
}
