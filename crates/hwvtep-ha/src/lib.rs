//! HA aggregation and reconciliation engine for HWVTEP devices.
//!
//! Several physical devices ("members") can be configured as one logical HA
//! device ("group"). The engine keeps three views consistent:
//!
//! - config written against the group is copied into every member
//! - the operational state of live members is aggregated under the group
//! - a device that reconnects gets its configured bridges replayed
//!
//! # Architecture
//!
//! ```text
//!   Config datastore                     Operational datastore
//!         │                                 │                │
//!         ▼                                 ▼                ▼
//!   HaConfigListener                 HaStateMachine   ReconciliationListener
//!   (discovery, propagation)         (aggregates)     (bridge replay)
//!         │                                 │                │ deferred TPs
//!         └──────────── HaCache ────────────┘                ▼
//!                 (parent/child index)          TerminationPointReconciler
//! ```
//!
//! Each listener runs on its own [`hwvtep_store::ListenerWorker`]; the
//! relationship index is shared between them. [`HaEngine`] starts and stops
//! the whole set.

mod cache;
mod config_listener;
mod discovery;
mod engine;
mod error;
mod propagation;
mod reconciliation;
mod state_machine;
mod tp_reconciler;

pub use cache::HaCache;
pub use config_listener::HaConfigListener;
pub use discovery::{DiscoveryOutcome, RelationshipDiscovery};
pub use engine::{HaEngine, HaEngineConfig};
pub use error::{HaError, HaResult};
pub use propagation::{replicated_global, ConfigPropagation, PropagationReport, PropagationStats};
pub use reconciliation::{
    supported_protocols, BridgeReconciler, BridgeSelection, DeferredTps, DeviceTransactor,
    ReconcileReport, ReconciliationListener, RecordingTransactor, Replay, SelectedBridges,
    StoreTransactor, SUPPORTED_PROTOCOLS,
};
pub use state_machine::{GroupRecord, GroupRegistry, GroupState, HaStateMachine, StateMachineStats};
pub use tp_reconciler::{
    PendingEntry, PendingTpCache, TerminationPointReconciler, TpReconcilerHandle,
    TpReconcilerStatus, DEFAULT_TP_CACHE_TIMEOUT,
};
