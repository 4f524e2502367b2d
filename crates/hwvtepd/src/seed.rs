//! Startup seed for the in-memory store
//!
//! A seed file is JSON with one node list per datastore:
//!
//! ```text
//! {
//!   "config":      [ <node>, ... ],
//!   "operational": [ <node>, ... ]
//! }
//! ```
//!
//! Config nodes are committed first so the engine sees groups before
//! their members connect.

use anyhow::{Context, Result};
use hwvtep_store::{DataBroker, Datastore, WriteOp};
use hwvtep_types::Node;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub config: Vec<Node>,
    #[serde(default)]
    pub operational: Vec<Node>,
}

impl SeedFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read seed file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse seed file {}", path.display()))
    }

    pub fn is_empty(&self) -> bool {
        self.config.is_empty() && self.operational.is_empty()
    }

    /// Commits the seed, one transaction per datastore.
    pub async fn apply(self, broker: &dyn DataBroker) -> Result<()> {
        let counts = (self.config.len(), self.operational.len());
        for (datastore, nodes) in [
            (Datastore::Config, self.config),
            (Datastore::Operational, self.operational),
        ] {
            if nodes.is_empty() {
                continue;
            }
            let ops = nodes
                .into_iter()
                .map(|node| WriteOp::Put { datastore, node })
                .collect();
            broker
                .commit(ops)
                .await
                .with_context(|| format!("failed to seed {} datastore", datastore))?;
        }
        info!(config = counts.0, operational = counts.1, "store seeded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hwvtep_store::MemoryBroker;
    use hwvtep_types::NodeId;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_seed_applies_both_datastores() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seed.json");
        let seed = SeedFile {
            config: vec![Node::new(NodeId::new("hwvtep://ha1"))],
            operational: vec![Node::new(NodeId::new("hwvtep://s1"))],
        };
        fs::write(&path, serde_json::to_string_pretty(&seed).unwrap()).unwrap();

        let loaded = SeedFile::load(&path).unwrap();
        assert_eq!(loaded, seed);

        let broker = MemoryBroker::new();
        loaded.apply(broker.as_ref()).await.unwrap();
        assert!(broker.get(Datastore::Config, &NodeId::new("hwvtep://ha1")).is_some());
        assert!(broker.get(Datastore::Operational, &NodeId::new("hwvtep://s1")).is_some());
        assert_eq!(broker.commit_count(), 2);
    }

    #[test]
    fn test_missing_sections_default_empty() {
        let seed: SeedFile = serde_json::from_str("{}").unwrap();
        assert!(seed.is_empty());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let err = SeedFile::load(dir.path().join("absent.json")).unwrap_err();
        assert!(err.to_string().contains("failed to read seed file"));
    }
}
