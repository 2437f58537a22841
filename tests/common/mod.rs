//! Shared fixtures: stub consensus engine, stub transport, cluster builders
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use warden::cluster::heartbeat::{HeartbeatPayload, HeartbeatTransport};
use warden::cluster::{CertInfo, ConsensusClient, ConsensusDriver, DaemonState, Gateway};
use warden::db::cluster::ClusterDb;
use warden::db::local::LocalStore;
use warden::{Error, RaftNode, RaftRole, Result};

pub const SCHEMA: i32 = 10;
pub const API_EXTENSIONS: i32 = 42;
pub const ARCH: i32 = 2;

/// Consensus state shared by every node of a stub cluster, standing in for
/// the replicated log.
#[derive(Default)]
pub struct SharedConsensus {
    pub roster: Mutex<Vec<RaftNode>>,
    pub rpc_log: Mutex<Vec<String>>,
    pub fail_leader: AtomicBool,
}

/// Stub consensus engine: one instance per node, all sharing the cluster's
/// consensus state.
#[derive(Clone)]
pub struct StubEngine {
    running: Arc<AtomicBool>,
    shared: Arc<SharedConsensus>,
}

impl StubEngine {
    pub fn new(shared: Arc<SharedConsensus>) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            shared,
        }
    }

    pub fn set_roster(&self, roster: Vec<RaftNode>) {
        *self.shared.roster.lock().unwrap() = roster;
    }

    pub fn roster(&self) -> Vec<RaftNode> {
        self.shared.roster.lock().unwrap().clone()
    }

    pub fn rpc_log(&self) -> Vec<String> {
        self.shared.rpc_log.lock().unwrap().clone()
    }
}

pub struct StubClient {
    shared: Arc<SharedConsensus>,
}

impl ConsensusClient for StubClient {
    async fn add(&mut self, node: RaftNode) -> Result<()> {
        self.shared
            .rpc_log
            .lock()
            .unwrap()
            .push(format!("add {}", node.id));
        let mut roster = self.shared.roster.lock().unwrap();
        if roster.iter().any(|n| n.id == node.id) {
            return Err(Error::Other(format!("node {} already in roster", node.id)));
        }
        roster.push(node);
        Ok(())
    }

    async fn remove(&mut self, id: u64) -> Result<()> {
        self.shared.rpc_log.lock().unwrap().push(format!("remove {}", id));
        let mut roster = self.shared.roster.lock().unwrap();
        let before = roster.len();
        roster.retain(|n| n.id != id);
        if roster.len() == before {
            return Err(Error::Other(format!("node {} not in roster", id)));
        }
        Ok(())
    }

    async fn assign(&mut self, id: u64, role: RaftRole) -> Result<()> {
        self.shared
            .rpc_log
            .lock()
            .unwrap()
            .push(format!("assign {} {}", id, role));
        let mut roster = self.shared.roster.lock().unwrap();
        let node = roster
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| Error::Other(format!("node {} not in roster", id)))?;
        node.role = role;
        Ok(())
    }
}

impl ConsensusDriver for StubEngine {
    type Client = StubClient;

    fn start(&self, info: Option<&RaftNode>, _dir: &Path, _cert: &CertInfo) -> Result<()> {
        if let Some(info) = info {
            let mut roster = self.shared.roster.lock().unwrap();
            // A fresh cluster forms around the first node to start.
            if roster.is_empty() {
                roster.push(info.clone());
            }
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn roster(&self) -> Result<Vec<RaftNode>> {
        Ok(self.shared.roster.lock().unwrap().clone())
    }

    async fn wait_leadership(&self) -> Result<()> {
        Ok(())
    }

    async fn find_leader(&self, _peers: &[String], _timeout: Duration) -> Result<StubClient> {
        if self.shared.fail_leader.load(Ordering::SeqCst) {
            return Err(Error::Transient("no leader reachable".into()));
        }
        Ok(StubClient {
            shared: self.shared.clone(),
        })
    }
}

/// Stub peer transport: probes succeed for addresses marked reachable,
/// heartbeats are recorded.
#[derive(Default)]
pub struct StubTransport {
    pub reachable: Mutex<BTreeSet<String>>,
    pub heartbeats: Mutex<Vec<(String, HeartbeatPayload)>>,
}

impl StubTransport {
    pub fn mark_reachable(&self, address: &str) {
        self.reachable.lock().unwrap().insert(address.to_string());
    }

    pub fn heartbeat_targets(&self) -> Vec<String> {
        self.heartbeats
            .lock()
            .unwrap()
            .iter()
            .map(|(address, _)| address.clone())
            .collect()
    }
}

#[async_trait]
impl HeartbeatTransport for StubTransport {
    async fn heartbeat(&self, address: &str, payload: &HeartbeatPayload) -> Result<()> {
        self.heartbeats
            .lock()
            .unwrap()
            .push((address.to_string(), payload.clone()));
        Ok(())
    }

    async fn probe(&self, address: &str) -> Result<()> {
        if self.reachable.lock().unwrap().contains(address) {
            Ok(())
        } else {
            Err(Error::Transient(format!("probe of {} failed", address)))
        }
    }
}

/// One node of a stub cluster.
pub struct Fixture {
    pub dir: TempDir,
    pub state: DaemonState,
    pub gateway: Gateway<StubEngine>,
    pub engine: StubEngine,
    pub transport: Arc<StubTransport>,
}

impl Fixture {
    /// A fresh node with its own cluster database and consensus state.
    pub fn new(address: &str) -> Self {
        let shared = Arc::new(SharedConsensus::default());
        let cluster = ClusterDb::new(SCHEMA, API_EXTENSIONS, ARCH);
        Self::with_cluster(address, shared, cluster)
    }

    /// A node of an existing cluster: shares its consensus state and its
    /// replicated database.
    pub fn joining(address: &str, other: &Fixture) -> Self {
        Self::with_cluster(
            address,
            other.engine.shared.clone(),
            other.state.cluster.clone(),
        )
    }

    fn with_cluster(address: &str, shared: Arc<SharedConsensus>, cluster: ClusterDb) -> Self {
        init_tracing();

        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("server.crt"), b"-----TEST CERT-----").unwrap();
        std::fs::write(dir.path().join("server.key"), b"-----TEST KEY-----").unwrap();

        let local =
            Arc::new(LocalStore::open(dir.path().join("database").join("local")).unwrap());
        local.set_cluster_address(address).unwrap();

        let engine = StubEngine::new(shared);
        let cert = CertInfo::load(dir.path(), "server").unwrap();
        let gateway = Gateway::new(engine.clone(), local.clone(), dir.path().to_path_buf(), cert);

        let transport = Arc::new(StubTransport::default());
        let state = DaemonState::new(
            dir.path().to_path_buf(),
            local,
            cluster,
            transport.clone(),
        );

        Fixture {
            dir,
            state,
            gateway,
            engine,
            transport,
        }
    }

    pub fn cert(&self) -> CertInfo {
        CertInfo::load(self.dir.path(), "server").unwrap()
    }

    /// Insert a registry row for a member with a fresh heartbeat.
    pub async fn seed_member(&self, name: &str, address: &str) -> i64 {
        let name = name.to_string();
        let address = address.to_string();
        self.state
            .cluster
            .transaction(move |tx| {
                let id = tx.node_add(&name, &address, ARCH, SCHEMA, API_EXTENSIONS)?;
                tx.node_heartbeat(&address, Utc::now())?;
                Ok(id)
            })
            .await
            .unwrap()
    }

    /// Age a member's heartbeat so it reads as offline.
    pub async fn age_heartbeat(&self, address: &str, age: chrono::Duration) {
        let address = address.to_string();
        self.state
            .cluster
            .transaction(move |tx| tx.node_heartbeat(&address, Utc::now() - age))
            .await
            .unwrap()
    }

    /// Claim the install-time self row, as a completed bootstrap would.
    pub async fn claim_self_row(&self, name: &str, address: &str) {
        let name = name.to_string();
        let address = address.to_string();
        self.state
            .cluster
            .transaction(move |tx| {
                tx.node_update(1, &name, &address)?;
                tx.node_heartbeat(&address, Utc::now())
            })
            .await
            .unwrap()
    }
}

/// Roster entry shorthand for test setups.
pub fn raft_node(id: u64, address: &str, role: RaftRole) -> RaftNode {
    RaftNode::new(id, address, role)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}
