//! Test infrastructure for the HWVTEP HA engine
//!
//! Provides:
//! - An in-memory store environment
//! - Node builders and fixtures for HA groups, members and bridges
//! - Store verification helpers with polling for asynchronous outcomes

pub mod fixtures;
mod store_env;
mod verification;

pub use fixtures::*;
pub use store_env::TestStore;
pub use verification::*;
