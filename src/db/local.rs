//! Node-local store
//!
//! Per-node state that is never replicated:
//! - Node configuration (the advertised cluster address)
//! - The raft roster cache, seeded at join time and replaced on role changes
//!
//! Backed by RocksDB under `<var_dir>/database/local`.

use rocksdb::{Options, DB};
use std::path::Path;

use crate::common::raft::{RaftNode, RaftRole};
use crate::Result;

const CF_CONFIG: &str = "config";
const CF_RAFT: &str = "raft";

const KEY_CLUSTER_ADDRESS: &str = "cluster.address";

/// Node-local configuration.
#[derive(Debug, Clone, Default)]
pub struct LocalConfig {
    /// The network address this node advertises to the cluster. Empty until
    /// the operator enables clustering.
    pub cluster_address: Option<String>,
}

impl LocalConfig {
    pub fn cluster_address(&self) -> &str {
        self.cluster_address.as_deref().unwrap_or("")
    }
}

/// Node-local store
pub struct LocalStore {
    db: DB,
}

impl LocalStore {
    /// Open or create the local store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_CONFIG, CF_RAFT])?;

        Ok(Self { db })
    }

    // === Config operations ===

    /// Load the node configuration
    pub fn config_load(&self) -> Result<LocalConfig> {
        let cf = self.db.cf_handle(CF_CONFIG).unwrap();
        let cluster_address = match self.db.get_cf(cf, KEY_CLUSTER_ADDRESS.as_bytes())? {
            Some(bytes) => {
                let address = String::from_utf8(bytes)
                    .map_err(|_| crate::Error::Encoding("invalid config value".into()))?;
                (!address.is_empty()).then_some(address)
            }
            None => None,
        };
        Ok(LocalConfig { cluster_address })
    }

    /// Set the advertised cluster address
    pub fn set_cluster_address(&self, address: &str) -> Result<()> {
        let cf = self.db.cf_handle(CF_CONFIG).unwrap();
        self.db
            .put_cf(cf, KEY_CLUSTER_ADDRESS.as_bytes(), address.as_bytes())?;
        Ok(())
    }

    // === Raft roster cache ===

    /// All cached raft roster entries, ordered by id
    pub fn raft_nodes(&self) -> Result<Vec<RaftNode>> {
        let cf = self.db.cf_handle(CF_RAFT).unwrap();
        let iter = self.db.iterator_cf(cf, rocksdb::IteratorMode::Start);

        let mut nodes = Vec::new();
        for item in iter {
            let (_, value) = item?;
            let node: RaftNode = bincode::deserialize(&value)?;
            nodes.push(node);
        }

        Ok(nodes)
    }

    /// Addresses of all cached raft roster entries
    pub fn raft_node_addresses(&self) -> Result<Vec<String>> {
        Ok(self
            .raft_nodes()?
            .into_iter()
            .map(|node| node.address)
            .collect())
    }

    /// Seed the roster cache with this node as the first member (id 1).
    pub fn raft_node_first(&self, address: &str) -> Result<u64> {
        let node = RaftNode::new(1, address, RaftRole::Voter);
        self.put_raft_node(&node)?;
        Ok(node.id)
    }

    /// Replace the whole roster cache with the given list.
    pub fn raft_nodes_replace(&self, nodes: &[RaftNode]) -> Result<()> {
        let cf = self.db.cf_handle(CF_RAFT).unwrap();
        let existing: Vec<Vec<u8>> = self
            .db
            .iterator_cf(cf, rocksdb::IteratorMode::Start)
            .map(|item| item.map(|(key, _)| key.to_vec()))
            .collect::<std::result::Result<_, _>>()?;
        for key in existing {
            self.db.delete_cf(cf, key)?;
        }
        for node in nodes {
            self.put_raft_node(node)?;
        }
        Ok(())
    }

    fn put_raft_node(&self, node: &RaftNode) -> Result<()> {
        let cf = self.db.cf_handle(CF_RAFT).unwrap();
        let value = bincode::serialize(node)?;
        self.db.put_cf(cf, node.id.to_be_bytes(), value)?;
        Ok(())
    }
}
