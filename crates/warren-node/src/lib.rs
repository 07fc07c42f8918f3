//! # warren-node
//!
//! Per-node VM controller for the warren distributed testbed.
//!
//! Each testbed host runs one controller managing the local set of VM
//! instances that form part of a larger, multi-host experiment topology.
//! Operators address instances by name, numeric id, or compact range
//! expressions (`kn[1-20]`, see `warren-ranges`), and bulk operations
//! fan out across the resolved set with consolidated error reporting.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     warren-node (host)                    │
//! ├───────────────────────────────────────────────────────────┤
//! │                                                           │
//! │  target expr ──▶ warren-ranges ──▶ names / ids / wildcard │
//! │                                            │              │
//! │  ┌──────────────┐      ┌─────────────────┐ │              │
//! │  │   Registry   │─────▶│ HashMap<u32,    │◀┘ scan         │
//! │  │  - launch()  │      │   Arc<dyn Vm>>  │                │
//! │  │  - reap()    │      └─────────────────┘                │
//! │  │  - info()    │               │                         │
//! │  └──────────────┘               ▼ fan-out (JoinSet)       │
//! │  ┌──────────────┐      ┌─────────────────┐                │
//! │  │  dispatch    │─────▶│ GenericVm/KvmVm │                │
//! │  │  - start()   │      │  state machine  │                │
//! │  │  - stop()    │      └─────────────────┘                │
//! │  │  - kill()    │               │ teardown task           │
//! │  └──────────────┘               ▼                         │
//! │         ▲              ┌─────────────────┐                │
//! │         └──────────────│ KillBatch (ack  │                │
//! │        wait + timeout  │  channel)       │                │
//! │                        └─────────────────┘                │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The hypervisor control channel ([`Monitor`]) and everything behind
//! it (control-protocol transport, migration mechanics, screen capture
//! encoding) are external collaborators; this crate holds only the
//! orchestration logic.

mod config;
mod dispatch;
mod error;
mod registry;
mod teardown;
mod vm;

pub use config::{NetworkConfig, NodeConfig, VmConfig, VmKind};
pub use dispatch::WILDCARD;
pub use error::{Error, Result};
pub use registry::{MonitorProvider, Registry};
pub use teardown::{AckSender, KillBatch, DEFAULT_KILL_TIMEOUT};
pub use vm::{
    GenericVm, HypervisorOps, KvmVm, Monitor, Vm, VmAction, VmState, KVM_INFO_MASK, VM_INFO_MASK,
};
