//! In-memory directory of the VM instances on this node.
//!
//! The registry is the single owner of instance membership: entries are
//! added by [`Registry::launch`] and removed only by [`Registry::reap`].
//! Dispatch and the teardown protocol observe instances through read
//! snapshots and never delete entries themselves.

use crate::config::{NodeConfig, VmConfig, VmKind};
use crate::error::{Error, Result};
use crate::vm::{GenericVm, KvmVm, Monitor, Vm, KVM_INFO_MASK, VM_INFO_MASK};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Source of hypervisor monitor connections for KVM launches.
///
/// The control-protocol transport itself lives outside this crate; a
/// deployment supplies a provider that connects to whatever it uses.
#[async_trait]
pub trait MonitorProvider: Send + Sync {
    /// Connect a monitor for the instance with the given id.
    async fn connect(&self, id: u32) -> Result<Arc<dyn Monitor>>;
}

/// Directory of all VM instances on this node, keyed by id.
///
/// Invariant: every key equals its instance's id. Iteration order is
/// unspecified; callers requiring determinism must impose their own.
pub struct Registry {
    config: NodeConfig,
    monitors: Option<Arc<dyn MonitorProvider>>,
    vms: RwLock<HashMap<u32, Arc<dyn Vm>>>,
    next_id: AtomicU32,
}

impl Registry {
    /// Create an empty registry with default configuration.
    ///
    /// Without a monitor provider only generic instances can launch;
    /// see [`with_monitor_provider`](Self::with_monitor_provider).
    pub fn new() -> Self {
        Self::with_config(NodeConfig::default())
    }

    /// Create an empty registry with the given configuration.
    pub fn with_config(config: NodeConfig) -> Self {
        Self {
            config,
            monitors: None,
            vms: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(0),
        }
    }

    /// Attach a monitor provider, enabling KVM launches.
    pub fn with_monitor_provider(mut self, provider: Arc<dyn MonitorProvider>) -> Self {
        self.monitors = Some(provider);
        self
    }

    /// The node configuration this registry was built with.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Launch a new instance in the building state and return its id.
    ///
    /// An empty name leaves the instance unnamed; a non-empty name must
    /// be unique among named instances.
    ///
    /// # Errors
    /// Fails on a duplicate name, or on a KVM launch when no monitor
    /// provider is configured or the monitor connection fails.
    pub async fn launch(&self, name: &str, config: VmConfig) -> Result<u32> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let vm: Arc<dyn Vm> = match config.kind {
            VmKind::Generic => Arc::new(GenericVm::new(id, name, config)),
            VmKind::Kvm => {
                let provider = self
                    .monitors
                    .as_ref()
                    .ok_or_else(|| Error::Monitor("no monitor provider configured".into()))?;
                let monitor = provider.connect(id).await?;
                Arc::new(KvmVm::new(id, name, config, monitor))
            }
        };

        let mut vms = self.vms.write().await;
        if !name.is_empty() && vms.values().any(|existing| existing.name() == name) {
            return Err(Error::DuplicateName(name.to_string()));
        }
        vms.insert(id, vm);
        tracing::info!(id, name, "VM launched");

        Ok(id)
    }

    /// Look up an instance by id or name.
    ///
    /// A fully numeric token resolves by id only; anything else scans
    /// names.
    pub async fn find(&self, id_or_name: &str) -> Option<Arc<dyn Vm>> {
        let vms = self.vms.read().await;
        if let Ok(id) = id_or_name.parse::<u32>() {
            return vms.get(&id).cloned();
        }
        vms.values().find(|vm| vm.name() == id_or_name).cloned()
    }

    /// Get an instance by id.
    pub async fn get(&self, id: u32) -> Option<Arc<dyn Vm>> {
        self.vms.read().await.get(&id).cloned()
    }

    /// Read snapshot of every instance, for dispatcher scans.
    pub async fn snapshot(&self) -> Vec<Arc<dyn Vm>> {
        self.vms.read().await.values().cloned().collect()
    }

    /// Number of instances currently registered.
    pub async fn len(&self) -> usize {
        self.vms.read().await.len()
    }

    /// Whether the registry holds no instances.
    pub async fn is_empty(&self) -> bool {
        self.vms.read().await.is_empty()
    }

    /// Remove every instance in a terminal state, returning how many
    /// were removed. The only membership-removal path.
    pub async fn reap(&self) -> usize {
        let mut vms = self.vms.write().await;
        let before = vms.len();
        vms.retain(|id, vm| {
            if vm.state().is_terminal() {
                tracing::info!(id = *id, name = vm.name(), "deleting VM");
                false
            } else {
                true
            }
        });
        before - vms.len()
    }

    /// Render the info table for the requested view.
    ///
    /// The KVM view lists only KVM instances and adds their extra
    /// columns; the generic view lists everything. Rows that fail to
    /// render are skipped.
    pub async fn info(&self, kind: Option<VmKind>) -> (Vec<&'static str>, Vec<Vec<String>>) {
        let mask = match kind {
            Some(VmKind::Kvm) => KVM_INFO_MASK,
            _ => VM_INFO_MASK,
        };

        let mut table = Vec::new();
        for vm in self.snapshot().await {
            if let Some(kind) = kind {
                if vm.kind() != kind {
                    continue;
                }
            }
            match vm.info(mask) {
                Ok(row) => table.push(row),
                Err(err) => {
                    tracing::warn!(id = vm.id(), error = %err, "skipping VM info row");
                }
            }
        }

        (mask.to_vec(), table)
    }

    /// Pass a raw control-protocol command to a single instance.
    ///
    /// # Errors
    /// Not-found if the target matches nothing; unsupported if the
    /// instance is not a KVM variant.
    pub async fn control_raw(&self, target: &str, cmd: &str) -> Result<String> {
        let vm = self.require(target).await?;
        match vm.hypervisor() {
            Some(ops) => ops.control_raw(cmd).await,
            None => Err(unsupported(vm.as_ref(), "control")),
        }
    }

    /// Save a single instance's state to a migration file.
    pub async fn migrate(&self, target: &str, path: &Path) -> Result<()> {
        let vm = self.require(target).await?;
        match vm.hypervisor() {
            Some(ops) => ops.migrate(path).await,
            None => Err(unsupported(vm.as_ref(), "migrate")),
        }
    }

    /// Capture a single instance's screen to a file.
    pub async fn screenshot(&self, target: &str, path: &Path) -> Result<()> {
        let vm = self.require(target).await?;
        match vm.hypervisor() {
            Some(ops) => ops.screenshot(path).await,
            None => Err(unsupported(vm.as_ref(), "screenshot")),
        }
    }

    async fn require(&self, target: &str) -> Result<Arc<dyn Vm>> {
        self.find(target)
            .await
            .ok_or_else(|| Error::NotFound(target.to_string()))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn unsupported(vm: &dyn Vm, op: &str) -> Error {
    let name = if vm.name().is_empty() {
        vm.id().to_string()
    } else {
        vm.name().to_string()
    };
    Error::Unsupported {
        name,
        op: op.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::teardown::KillBatch;
    use std::time::Duration;

    struct NullMonitor;

    #[async_trait]
    impl Monitor for NullMonitor {
        async fn raw(&self, cmd: &str) -> Result<String> {
            Ok(format!("ok: {cmd}"))
        }

        async fn migrate(&self, _path: &Path) -> Result<()> {
            Ok(())
        }

        async fn screendump(&self, _path: &Path) -> Result<()> {
            Ok(())
        }

        async fn quit(&self) -> Result<()> {
            Ok(())
        }
    }

    struct NullProvider;

    #[async_trait]
    impl MonitorProvider for NullProvider {
        async fn connect(&self, _id: u32) -> Result<Arc<dyn Monitor>> {
            Ok(Arc::new(NullMonitor))
        }
    }

    #[tokio::test]
    async fn launch_assigns_sequential_ids() {
        let registry = Registry::new();
        let a = registry.launch("a", VmConfig::default()).await.unwrap();
        let b = registry.launch("b", VmConfig::default()).await.unwrap();

        assert_ne!(a, b);
        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.get(a).await.unwrap().name(), "a");
    }

    #[tokio::test]
    async fn launch_rejects_duplicate_names() {
        let registry = Registry::new();
        registry.launch("web0", VmConfig::default()).await.unwrap();

        let err = registry
            .launch("web0", VmConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateName(_)));

        // Unnamed instances never collide.
        registry.launch("", VmConfig::default()).await.unwrap();
        registry.launch("", VmConfig::default()).await.unwrap();
    }

    #[tokio::test]
    async fn kvm_launch_requires_provider() {
        let registry = Registry::new();
        let err = registry
            .launch("kvm0", VmConfig::new(VmKind::Kvm))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Monitor(_)));

        let registry = Registry::new().with_monitor_provider(Arc::new(NullProvider));
        registry
            .launch("kvm0", VmConfig::new(VmKind::Kvm))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn find_by_id_and_name() {
        let registry = Registry::new();
        let id = registry.launch("web0", VmConfig::default()).await.unwrap();

        assert!(registry.find("web0").await.is_some());
        assert!(registry.find(&id.to_string()).await.is_some());
        assert!(registry.find("nope").await.is_none());
        // Numeric tokens resolve by id only.
        assert!(registry.find("99").await.is_none());
    }

    #[tokio::test]
    async fn reap_removes_only_terminal_instances() {
        let registry = Registry::new();
        let doomed = registry.launch("doomed", VmConfig::default()).await.unwrap();
        registry.launch("alive", VmConfig::default()).await.unwrap();

        let batch = KillBatch::new();
        let vm = registry.get(doomed).await.unwrap();
        assert!(vm.kill(batch.ack_sender()));
        let unacked = batch.wait([doomed].into(), Duration::from_secs(5)).await;
        assert!(unacked.is_empty());

        assert_eq!(registry.reap().await, 1);
        assert_eq!(registry.len().await, 1);
        assert!(registry.find("alive").await.is_some());
        // Reaping is idempotent.
        assert_eq!(registry.reap().await, 0);
    }

    #[tokio::test]
    async fn info_views_filter_by_kind() {
        let registry = Registry::new().with_monitor_provider(Arc::new(NullProvider));
        registry.launch("web0", VmConfig::default()).await.unwrap();
        registry
            .launch("kvm0", VmConfig::new(VmKind::Kvm))
            .await
            .unwrap();

        let (mask, table) = registry.info(None).await;
        assert_eq!(mask, VM_INFO_MASK);
        assert_eq!(table.len(), 2);

        let (mask, table) = registry.info(Some(VmKind::Kvm)).await;
        assert_eq!(mask, KVM_INFO_MASK);
        assert_eq!(table.len(), 1);
        assert_eq!(table[0][1], "kvm0");
    }

    #[tokio::test]
    async fn capability_accessors_gate_by_variant() {
        let registry = Registry::new().with_monitor_provider(Arc::new(NullProvider));
        registry.launch("web0", VmConfig::default()).await.unwrap();
        registry
            .launch("kvm0", VmConfig::new(VmKind::Kvm))
            .await
            .unwrap();

        let out = registry.control_raw("kvm0", "query-status").await.unwrap();
        assert_eq!(out, "ok: query-status");

        let err = registry.control_raw("web0", "query-status").await.unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));

        let err = registry
            .migrate("missing", Path::new("/tmp/out.migrate"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
