//! VM instance abstraction: state machine, variants, and capabilities.
//!
//! Every instance moves through a fixed state machine driven by an
//! explicit transition table ([`VmState::transition`]); eligibility
//! checks are table lookups, never ad hoc flag tests. The specialized
//! KVM variant additionally exposes monitor-backed operations through
//! the [`HypervisorOps`] capability trait; querying the capability on a
//! generic instance yields `None`, which callers surface as an
//! unsupported-operation error rather than a downcast failure.

use crate::config::{VmConfig, VmKind};
use crate::error::{Error, Result};
use crate::teardown::AckSender;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Info-query column mask for the generic view.
pub const VM_INFO_MASK: &[&str] = &["id", "name", "state", "vcpus", "memory", "vlan", "launched"];

/// Info-query column mask for the KVM view.
pub const KVM_INFO_MASK: &[&str] = &[
    "id", "name", "state", "vcpus", "memory", "vlan", "launched", "migrate",
];

/// Lifecycle state of a VM instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum VmState {
    /// Launched but not yet started
    Building,
    /// Executing
    Running,
    /// Stopped but resumable
    Paused,
    /// Torn down cleanly (terminal)
    Quit,
    /// Teardown or runtime failure (terminal)
    Error,
}

/// Action attempted against the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmAction {
    /// Begin or resume execution
    Start,
    /// Pause execution
    Stop,
    /// Initiate asynchronous teardown
    Kill,
}

impl VmState {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, VmState::Quit | VmState::Error)
    }

    /// Transition table: the state reached by applying `action` from
    /// this state, or `None` when the action is inapplicable.
    ///
    /// Kill reports its eventual success state; the actual move to
    /// `Quit` (or `Error`) happens when the asynchronous teardown
    /// completes.
    pub fn transition(self, action: VmAction) -> Option<VmState> {
        match (action, self) {
            (VmAction::Start, VmState::Building | VmState::Paused) => Some(VmState::Running),
            (VmAction::Stop, VmState::Running) => Some(VmState::Paused),
            (VmAction::Kill, from) if !from.is_terminal() => Some(VmState::Quit),
            _ => None,
        }
    }

    fn from_u8(v: u8) -> VmState {
        match v {
            0 => VmState::Building,
            1 => VmState::Running,
            2 => VmState::Paused,
            3 => VmState::Quit,
            _ => VmState::Error,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Building => write!(f, "building"),
            VmState::Running => write!(f, "running"),
            VmState::Paused => write!(f, "paused"),
            VmState::Quit => write!(f, "quit"),
            VmState::Error => write!(f, "error"),
        }
    }
}

/// Lock-free state holder shared with in-flight teardown tasks.
#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: VmState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> VmState {
        VmState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: VmState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Atomically apply `action` via the transition table. Returns the
    /// new state, or the (unchanged) current state if inapplicable.
    fn try_transition(&self, action: VmAction) -> std::result::Result<VmState, VmState> {
        loop {
            let current = self.get();
            let Some(next) = current.transition(action) else {
                return Err(current);
            };
            if self
                .0
                .compare_exchange(
                    current as u8,
                    next as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(next);
            }
        }
    }
}

/// Hypervisor control channel -- the out-of-scope subsystem boundary.
///
/// Implementations wrap whatever the deployment uses to talk to the
/// hypervisor (a QMP socket, typically). The core only depends on this
/// interface.
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Pass a raw control-protocol command through verbatim.
    async fn raw(&self, cmd: &str) -> Result<String>;

    /// Stream VM state into a migration file.
    async fn migrate(&self, path: &Path) -> Result<()>;

    /// Dump the current screen contents to a file.
    async fn screendump(&self, path: &Path) -> Result<()>;

    /// Terminate the hypervisor process.
    async fn quit(&self) -> Result<()>;
}

/// Capability set of the specialized KVM variant.
#[async_trait]
pub trait HypervisorOps: Send + Sync {
    /// Raw control-protocol pass-through.
    async fn control_raw(&self, cmd: &str) -> Result<String>;

    /// Save VM state to a migration file.
    async fn migrate(&self, path: &Path) -> Result<()>;

    /// Capture the VM screen to a file.
    async fn screenshot(&self, path: &Path) -> Result<()>;
}

/// A managed VM instance tracked by the registry.
#[async_trait]
pub trait Vm: Send + Sync {
    /// Registry-assigned id, immutable for the instance's lifetime.
    fn id(&self) -> u32;

    /// Operator-assigned name; empty if unnamed.
    fn name(&self) -> &str;

    /// Which variant this instance is.
    fn kind(&self) -> VmKind;

    /// Current lifecycle state.
    fn state(&self) -> VmState;

    /// Launch-time configuration.
    fn config(&self) -> &VmConfig;

    /// When the instance was launched.
    fn launched_at(&self) -> DateTime<Utc>;

    /// Begin or resume execution.
    ///
    /// # Errors
    /// Returns a state error unless the instance is building or paused.
    async fn start(&self) -> Result<()>;

    /// Pause execution.
    ///
    /// # Errors
    /// Returns a state error unless the instance is running.
    async fn stop(&self) -> Result<()>;

    /// Initiate asynchronous teardown, acknowledging on `ack` when it
    /// completes. Fire-and-forget: returns immediately with `true` if
    /// teardown was initiated, `false` if the instance is already
    /// terminal or already tearing down (no ack will be sent).
    fn kill(&self, ack: AckSender) -> bool;

    /// Render the requested info columns for this instance.
    ///
    /// # Errors
    /// Fails if the mask names a column this variant does not expose.
    fn info(&self, mask: &[&str]) -> Result<Vec<String>>;

    /// Capability check for the specialized operation set.
    fn hypervisor(&self) -> Option<&dyn HypervisorOps> {
        None
    }
}

/// State shared by both instance variants.
struct VmCommon {
    id: u32,
    name: String,
    config: VmConfig,
    launched_at: DateTime<Utc>,
    state: Arc<StateCell>,
    kill_started: AtomicBool,
}

impl VmCommon {
    fn new(id: u32, name: impl Into<String>, config: VmConfig) -> Self {
        Self {
            id,
            name: name.into(),
            config,
            launched_at: Utc::now(),
            state: Arc::new(StateCell::new(VmState::Building)),
            kill_started: AtomicBool::new(false),
        }
    }

    /// Name for diagnostics: the operator name, or the id if unnamed.
    fn describe(&self) -> String {
        if self.name.is_empty() {
            self.id.to_string()
        } else {
            self.name.clone()
        }
    }

    fn start(&self) -> Result<()> {
        match self.state.try_transition(VmAction::Start) {
            Ok(_) => {
                tracing::info!(id = self.id, name = %self.name, "VM started");
                Ok(())
            }
            Err(current) => Err(Error::State(format!("{} ({current})", self.describe()))),
        }
    }

    fn stop(&self) -> Result<()> {
        match self.state.try_transition(VmAction::Stop) {
            Ok(_) => {
                tracing::info!(id = self.id, name = %self.name, "VM stopped");
                Ok(())
            }
            Err(current) => Err(Error::State(format!("{} ({current})", self.describe()))),
        }
    }

    /// Spawn `teardown` and move to `Quit`/`Error` when it finishes,
    /// then ack. At most one teardown is ever started per instance.
    fn kill<F>(&self, ack: AckSender, teardown: F) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        if self.state.get().is_terminal() {
            return false;
        }
        if self.kill_started.swap(true, Ordering::AcqRel) {
            return false;
        }

        let id = self.id;
        let name = self.name.clone();
        let state = Arc::clone(&self.state);
        tracing::info!(id, %name, "killing VM");

        tokio::spawn(async move {
            match teardown.await {
                Ok(()) => state.set(VmState::Quit),
                Err(err) => {
                    tracing::error!(id, %name, error = %err, "VM teardown failed");
                    state.set(VmState::Error);
                }
            }
            ack.ack(id);
        });

        true
    }

    fn field(&self, field: &str) -> Option<String> {
        match field {
            "id" => Some(self.id.to_string()),
            "name" => Some(self.name.clone()),
            "state" => Some(self.state.get().to_string()),
            "vcpus" => Some(self.config.vcpus.to_string()),
            "memory" => Some(self.config.memory_mb.to_string()),
            "vlan" => {
                let vlans: Vec<String> = self
                    .config
                    .networks
                    .iter()
                    .map(|net| net.vlan.to_string())
                    .collect();
                Some(format!("[{}]", vlans.join(",")))
            }
            "launched" => Some(self.launched_at.to_rfc3339()),
            _ => None,
        }
    }
}

/// Base VM instance with no hypervisor control channel.
pub struct GenericVm {
    common: VmCommon,
}

impl GenericVm {
    /// Create a generic instance in the building state.
    pub fn new(id: u32, name: impl Into<String>, config: VmConfig) -> Self {
        Self {
            common: VmCommon::new(id, name, config),
        }
    }
}

#[async_trait]
impl Vm for GenericVm {
    fn id(&self) -> u32 {
        self.common.id
    }

    fn name(&self) -> &str {
        &self.common.name
    }

    fn kind(&self) -> VmKind {
        VmKind::Generic
    }

    fn state(&self) -> VmState {
        self.common.state.get()
    }

    fn config(&self) -> &VmConfig {
        &self.common.config
    }

    fn launched_at(&self) -> DateTime<Utc> {
        self.common.launched_at
    }

    async fn start(&self) -> Result<()> {
        self.common.start()
    }

    async fn stop(&self) -> Result<()> {
        self.common.stop()
    }

    fn kill(&self, ack: AckSender) -> bool {
        // Nothing external to tear down.
        self.common.kill(ack, async { Ok(()) })
    }

    fn info(&self, mask: &[&str]) -> Result<Vec<String>> {
        mask.iter()
            .map(|field| {
                self.common
                    .field(field)
                    .ok_or_else(|| Error::UnknownInfoField(field.to_string()))
            })
            .collect()
    }
}

/// Specialized KVM instance backed by a hypervisor monitor.
pub struct KvmVm {
    common: VmCommon,
    monitor: Arc<dyn Monitor>,
}

impl KvmVm {
    /// Create a KVM instance in the building state.
    pub fn new(id: u32, name: impl Into<String>, config: VmConfig, monitor: Arc<dyn Monitor>) -> Self {
        Self {
            common: VmCommon::new(id, name, config),
            monitor,
        }
    }
}

#[async_trait]
impl Vm for KvmVm {
    fn id(&self) -> u32 {
        self.common.id
    }

    fn name(&self) -> &str {
        &self.common.name
    }

    fn kind(&self) -> VmKind {
        VmKind::Kvm
    }

    fn state(&self) -> VmState {
        self.common.state.get()
    }

    fn config(&self) -> &VmConfig {
        &self.common.config
    }

    fn launched_at(&self) -> DateTime<Utc> {
        self.common.launched_at
    }

    async fn start(&self) -> Result<()> {
        self.common.start()
    }

    async fn stop(&self) -> Result<()> {
        self.common.stop()
    }

    fn kill(&self, ack: AckSender) -> bool {
        let monitor = Arc::clone(&self.monitor);
        self.common.kill(ack, async move { monitor.quit().await })
    }

    fn info(&self, mask: &[&str]) -> Result<Vec<String>> {
        mask.iter()
            .map(|field| {
                if *field == "migrate" {
                    return Ok(self.common.config.migrate_path.clone().unwrap_or_default());
                }
                self.common
                    .field(field)
                    .ok_or_else(|| Error::UnknownInfoField(field.to_string()))
            })
            .collect()
    }

    fn hypervisor(&self) -> Option<&dyn HypervisorOps> {
        Some(self)
    }
}

#[async_trait]
impl HypervisorOps for KvmVm {
    async fn control_raw(&self, cmd: &str) -> Result<String> {
        self.monitor.raw(cmd).await
    }

    async fn migrate(&self, path: &Path) -> Result<()> {
        tracing::info!(id = self.common.id, path = %path.display(), "migrating VM");
        self.monitor.migrate(path).await
    }

    async fn screenshot(&self, path: &Path) -> Result<()> {
        self.monitor.screendump(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::teardown::KillBatch;
    use std::time::Duration;

    struct OkMonitor;

    #[async_trait]
    impl Monitor for OkMonitor {
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

    struct FailingMonitor;

    #[async_trait]
    impl Monitor for FailingMonitor {
        async fn raw(&self, _cmd: &str) -> Result<String> {
            Err(Error::Monitor("socket closed".into()))
        }

        async fn migrate(&self, _path: &Path) -> Result<()> {
            Err(Error::Monitor("socket closed".into()))
        }

        async fn screendump(&self, _path: &Path) -> Result<()> {
            Err(Error::Monitor("socket closed".into()))
        }

        async fn quit(&self) -> Result<()> {
            Err(Error::Monitor("socket closed".into()))
        }
    }

    #[test]
    fn transition_table() {
        use VmAction::*;
        use VmState::*;

        assert_eq!(Building.transition(Start), Some(Running));
        assert_eq!(Paused.transition(Start), Some(Running));
        assert_eq!(Running.transition(Start), None);
        assert_eq!(Quit.transition(Start), None);

        assert_eq!(Running.transition(Stop), Some(Paused));
        assert_eq!(Building.transition(Stop), None);
        assert_eq!(Paused.transition(Stop), None);

        assert_eq!(Building.transition(Kill), Some(Quit));
        assert_eq!(Running.transition(Kill), Some(Quit));
        assert_eq!(Paused.transition(Kill), Some(Quit));
        assert_eq!(Quit.transition(Kill), None);
        assert_eq!(Error.transition(Kill), None);
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let vm = GenericVm::new(0, "web0", VmConfig::default());
        assert_eq!(vm.state(), VmState::Building);

        vm.start().await.unwrap();
        assert_eq!(vm.state(), VmState::Running);

        assert!(vm.start().await.is_err());

        vm.stop().await.unwrap();
        assert_eq!(vm.state(), VmState::Paused);

        vm.start().await.unwrap();
        assert_eq!(vm.state(), VmState::Running);
    }

    #[tokio::test]
    async fn kill_acks_and_reaches_quit() {
        let vm = GenericVm::new(4, "web4", VmConfig::default());
        let batch = KillBatch::new();

        assert!(vm.kill(batch.ack_sender()));
        let unacked = batch.wait([4].into(), Duration::from_secs(5)).await;

        assert!(unacked.is_empty());
        assert_eq!(vm.state(), VmState::Quit);
    }

    #[tokio::test]
    async fn kill_is_initiated_at_most_once() {
        let vm = GenericVm::new(4, "web4", VmConfig::default());
        let batch = KillBatch::new();

        assert!(vm.kill(batch.ack_sender()));
        assert!(!vm.kill(batch.ack_sender()));

        let unacked = batch.wait([4].into(), Duration::from_secs(5)).await;
        assert!(unacked.is_empty());
        assert_eq!(vm.state(), VmState::Quit);

        // Terminal now; a further kill is inapplicable.
        let batch = KillBatch::new();
        assert!(!vm.kill(batch.ack_sender()));
    }

    #[tokio::test]
    async fn failed_teardown_lands_in_error_state() {
        let vm = KvmVm::new(2, "kvm2", VmConfig::new(VmKind::Kvm), Arc::new(FailingMonitor));
        let batch = KillBatch::new();

        assert!(vm.kill(batch.ack_sender()));
        let unacked = batch.wait([2].into(), Duration::from_secs(5)).await;

        // Failure still acknowledges; the state records the failure.
        assert!(unacked.is_empty());
        assert_eq!(vm.state(), VmState::Error);
    }

    #[tokio::test]
    async fn capability_gating() {
        let generic = GenericVm::new(0, "web0", VmConfig::default());
        assert!(generic.hypervisor().is_none());

        let kvm = KvmVm::new(1, "kvm1", VmConfig::new(VmKind::Kvm), Arc::new(OkMonitor));
        let ops = kvm.hypervisor().unwrap();
        assert_eq!(ops.control_raw("query-status").await.unwrap(), "ok: query-status");
    }

    #[test]
    fn info_masks() {
        let config = VmConfig::default().with_network(100).with_network(200);
        let vm = GenericVm::new(3, "web3", config);

        let row = vm.info(VM_INFO_MASK).unwrap();
        assert_eq!(row[0], "3");
        assert_eq!(row[1], "web3");
        assert_eq!(row[2], "building");
        assert_eq!(row[5], "[100,200]");

        assert!(matches!(
            vm.info(&["bogus"]),
            Err(Error::UnknownInfoField(_))
        ));
        // The KVM-only column is unknown to the generic variant.
        assert!(vm.info(KVM_INFO_MASK).is_err());
    }

    #[test]
    fn kvm_info_includes_migrate_column() {
        let config = VmConfig::new(VmKind::Kvm).with_migrate_path("/tmp/in.migrate");
        let vm = KvmVm::new(5, "kvm5", config, Arc::new(OkMonitor));

        let row = vm.info(KVM_INFO_MASK).unwrap();
        assert_eq!(row[7], "/tmp/in.migrate");
    }
}
