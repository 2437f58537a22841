//! Cluster membership control plane
//!
//! The membership layer coordinates four entwined concerns: the consensus
//! roster (voter / stand-by / spare), the replicated member registry, the
//! local consensus driver's lifecycle, and the policy deciding who holds
//! which role. See [`membership`] for the operation surface.

pub mod gateway;
pub mod heartbeat;
pub mod membership;
pub mod roster;

use std::path::PathBuf;
use std::sync::Arc;

use crate::cluster::heartbeat::HeartbeatTransport;
use crate::db::cluster::ClusterDb;
use crate::db::local::LocalStore;

pub use gateway::{CertInfo, ConsensusClient, ConsensusDriver, Gateway};
pub use membership::{MemberStatus, MemberView};

/// Shared daemon state handed to every membership operation.
///
/// Carried explicitly instead of living in globals: each transition receives
/// the stores and transport it acts on.
pub struct DaemonState {
    /// The daemon's state directory (certificates, databases).
    pub var_dir: PathBuf,
    /// Node-local store: cluster address and the raft roster cache.
    pub local: Arc<LocalStore>,
    /// Handle to the replicated member registry.
    pub cluster: ClusterDb,
    /// Transport for heartbeats and liveness probes.
    pub transport: Arc<dyn HeartbeatTransport>,
}

impl DaemonState {
    pub fn new(
        var_dir: PathBuf,
        local: Arc<LocalStore>,
        cluster: ClusterDb,
        transport: Arc<dyn HeartbeatTransport>,
    ) -> Self {
        Self {
            var_dir,
            local,
            cluster,
            transport,
        }
    }
}
