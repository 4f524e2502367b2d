//! Store abstractions consumed by the HWVTEP HA engine.
//!
//! This crate provides the seam between the engine and the transactional,
//! tree-structured datastore:
//!
//! - [`DataBroker`]: read, commit and subscribe against a datastore
//! - [`Transaction`]: buffered put/merge/delete with read-your-writes
//! - [`TxSession`]: a per-worker transaction chain, discarded on failure
//! - [`ChangeListener`]: per-listener batch handling hooks
//! - [`ListenerWorker`]: the serialized batch loop driving one listener
//! - [`MemoryBroker`]: in-memory broker used by the daemon and tests
//!
//! # Architecture
//!
//! ```text
//!   commit(ops) ──> MemoryBroker ──> notifier task
//!                                        │ bounded mpsc per subscriber
//!                    ┌───────────────────┼───────────────────┐
//!                    ▼                   ▼                   ▼
//!             ListenerWorker      ListenerWorker      ListenerWorker
//!             (one batch at a     (own TxSession)     ...
//!              time, awaits commit)
//! ```
//!
//! Batches for one listener are strictly serialized; different listeners
//! run concurrently on their own tasks.

mod broker;
mod change;
mod error;
mod listener;
mod memory;
mod transaction;

pub use broker::{DataBroker, Subscription};
pub use change::{ChangeBatch, ChangeKind, Datastore, NodeChange, WriteOp};
pub use error::{StoreError, StoreResult};
pub use listener::{
    BatchOutcome, ChangeListener, ListenerWorker, WorkerConfig, WorkerHandle, WorkerStats,
};
pub use memory::MemoryBroker;
pub use transaction::{Transaction, TxSession};
