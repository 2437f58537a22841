//! Gateway to the consensus engine
//!
//! The gateway owns the lifecycle of the local consensus driver: starting it
//! from the on-disk state, shutting it down, wiping that state and starting
//! over (the reconfigure cycle), and locating the current cluster leader.
//!
//! The engine itself is an external collaborator behind [`ConsensusDriver`];
//! warden only drives its lifecycle and talks to the leader it elects.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::common::raft::{RaftNode, RaftRole};
use crate::db::local::LocalStore;
use crate::{Error, Result};

/// Keypair and optional CA material used to authenticate cluster traffic.
#[derive(Debug, Clone)]
pub struct CertInfo {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub ca_pem: Option<Vec<u8>>,
}

impl CertInfo {
    /// Load the `<prefix>.crt` / `<prefix>.key` keypair from `dir`, plus
    /// `<prefix>.ca` when present.
    pub fn load(dir: &Path, prefix: &str) -> Result<Self> {
        let cert_pem = std::fs::read(dir.join(format!("{}.crt", prefix)))?;
        let key_pem = std::fs::read(dir.join(format!("{}.key", prefix)))?;
        let ca_path = dir.join(format!("{}.ca", prefix));
        let ca_pem = if ca_path.exists() {
            Some(std::fs::read(ca_path)?)
        } else {
            None
        };
        Ok(Self {
            cert_pem,
            key_pem,
            ca_pem,
        })
    }

    /// Combined PEM (key then certificate) for TLS client identities.
    pub fn identity_pem(&self) -> Vec<u8> {
        let mut pem = self.key_pem.clone();
        pem.extend_from_slice(&self.cert_pem);
        pem
    }
}

/// Client handle to the current consensus leader.
#[allow(async_fn_in_trait)]
pub trait ConsensusClient: Send {
    /// Append a member to the consensus configuration.
    async fn add(&mut self, node: RaftNode) -> Result<()>;

    /// Remove a member from the consensus configuration.
    async fn remove(&mut self, id: u64) -> Result<()>;

    /// Change a member's role in the consensus configuration.
    async fn assign(&mut self, id: u64, role: RaftRole) -> Result<()>;
}

/// The consensus engine consumed by the gateway.
#[allow(async_fn_in_trait)]
pub trait ConsensusDriver: Send + Sync + 'static {
    type Client: ConsensusClient;

    /// Start the engine from the on-disk state in `dir`. `info` is this
    /// node's roster entry when it participates in consensus, `None` for a
    /// client-only node.
    fn start(&self, info: Option<&RaftNode>, dir: &Path, cert: &CertInfo) -> Result<()>;

    /// Terminate the engine and close its in-memory connections.
    fn stop(&self) -> Result<()>;

    /// Whether the engine is currently running on this node.
    fn is_running(&self) -> bool;

    /// The latest roster known to the consensus log.
    fn roster(&self) -> Result<Vec<RaftNode>>;

    /// Block until this node is elected leader.
    async fn wait_leadership(&self) -> Result<()>;

    /// Locate the current leader among `peers` and return a client for it.
    async fn find_leader(&self, peers: &[String], timeout: Duration) -> Result<Self::Client>;
}

/// Controller for the local consensus driver.
pub struct Gateway<D: ConsensusDriver> {
    driver: D,
    local: Arc<LocalStore>,
    var_dir: PathBuf,
    cert: RwLock<CertInfo>,
    info: RwLock<Option<RaftNode>>,
}

impl<D: ConsensusDriver> Gateway<D> {
    pub fn new(driver: D, local: Arc<LocalStore>, var_dir: PathBuf, cert: CertInfo) -> Self {
        Self {
            driver,
            local,
            var_dir,
            cert: RwLock::new(cert),
            info: RwLock::new(None),
        }
    }

    /// Directory holding the consensus engine's replicated state.
    pub fn global_database_dir(&self) -> PathBuf {
        self.var_dir.join("database").join("global")
    }

    /// Start the consensus driver from the current on-disk state.
    ///
    /// The node runs the engine only when the local roster cache lists its
    /// own cluster address; otherwise the driver starts client-only.
    pub fn init(&self) -> Result<()> {
        let config = self.local.config_load()?;
        let nodes = self.local.raft_nodes()?;
        let info = match config.cluster_address {
            Some(address) => nodes.into_iter().find(|n| n.address == address),
            None => None,
        };

        std::fs::create_dir_all(self.global_database_dir())?;

        let cert = self.cert.read().unwrap().clone();
        self.driver.start(info.as_ref(), &self.global_database_dir(), &cert)?;
        *self.info.write().unwrap() = info;

        tracing::info!("consensus gateway initialized");
        Ok(())
    }

    /// Terminate the consensus driver.
    pub fn shutdown(&self) -> Result<()> {
        tracing::info!("shutting down consensus gateway");
        self.driver.stop()
    }

    /// Block until this node is elected leader. Used only by bootstrap.
    pub async fn wait_leadership(&self) -> Result<()> {
        self.driver.wait_leadership().await
    }

    /// The latest roster known to the consensus log.
    pub fn current_raft_nodes(&self) -> Result<Vec<RaftNode>> {
        self.driver.roster()
    }

    /// Whether the consensus engine is running on this node.
    pub fn is_consensus_node(&self) -> bool {
        self.driver.is_running()
    }

    /// This node's roster entry, once known.
    pub fn info(&self) -> Option<RaftNode> {
        self.info.read().unwrap().clone()
    }

    pub fn set_info(&self, info: Option<RaftNode>) {
        *self.info.write().unwrap() = info;
    }

    /// The currently bound cluster certificate.
    pub fn cert(&self) -> CertInfo {
        self.cert.read().unwrap().clone()
    }

    /// Locate the current leader and return a client for it.
    pub async fn find_leader(&self, timeout: Duration) -> Result<D::Client> {
        let peers = self.local.raft_node_addresses()?;
        match tokio::time::timeout(timeout, self.driver.find_leader(&peers, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Transient(format!(
                "no cluster leader reachable within {:?}",
                timeout
            ))),
        }
    }

    /// Tear the engine down and start it again from a clean slate:
    /// shutdown, wipe the on-disk state, rebind the certificate if given,
    /// re-initialize.
    ///
    /// The caller must hold the cluster database gate exclusively across the
    /// whole cycle and release it with a reconciling transaction.
    pub fn reconfigure(&self, cert: Option<CertInfo>) -> Result<()> {
        self.shutdown()?;

        let dir = self.global_database_dir();
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(cert) = cert {
            *self.cert.write().unwrap() = cert;
        }

        self.init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct NullClient;

    impl ConsensusClient for NullClient {
        async fn add(&mut self, _node: RaftNode) -> Result<()> {
            Ok(())
        }
        async fn remove(&mut self, _id: u64) -> Result<()> {
            Ok(())
        }
        async fn assign(&mut self, _id: u64, _role: RaftRole) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingDriver {
        running: AtomicBool,
        started_as: Mutex<Option<Option<RaftNode>>>,
    }

    impl ConsensusDriver for Arc<RecordingDriver> {
        type Client = NullClient;

        fn start(&self, info: Option<&RaftNode>, dir: &Path, _cert: &CertInfo) -> Result<()> {
            assert!(dir.exists());
            *self.started_as.lock().unwrap() = Some(info.cloned());
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
            Ok(Vec::new())
        }

        async fn wait_leadership(&self) -> Result<()> {
            Ok(())
        }

        async fn find_leader(
            &self,
            _peers: &[String],
            _timeout: Duration,
        ) -> Result<Self::Client> {
            Ok(NullClient)
        }
    }

    fn cert() -> CertInfo {
        CertInfo {
            cert_pem: b"cert".to_vec(),
            key_pem: b"key".to_vec(),
            ca_pem: None,
        }
    }

    #[tokio::test]
    async fn test_init_client_only_when_not_in_roster() {
        let dir = tempdir().unwrap();
        let local = Arc::new(LocalStore::open(dir.path().join("database/local")).unwrap());
        let driver = Arc::new(RecordingDriver::default());
        let gateway = Gateway::new(
            driver.clone(),
            local,
            dir.path().to_path_buf(),
            cert(),
        );

        gateway.init().unwrap();
        assert!(gateway.is_consensus_node());
        assert_eq!(*driver.started_as.lock().unwrap(), Some(None));
        assert!(gateway.info().is_none());
    }

    #[tokio::test]
    async fn test_init_picks_up_self_entry() {
        let dir = tempdir().unwrap();
        let local = Arc::new(LocalStore::open(dir.path().join("database/local")).unwrap());
        local.set_cluster_address("10.0.0.1:8443").unwrap();
        local.raft_node_first("10.0.0.1:8443").unwrap();

        let driver = Arc::new(RecordingDriver::default());
        let gateway = Gateway::new(
            driver.clone(),
            local,
            dir.path().to_path_buf(),
            cert(),
        );

        gateway.init().unwrap();
        let info = gateway.info().unwrap();
        assert_eq!(info.id, 1);
        assert_eq!(info.role, RaftRole::Voter);
    }

    #[tokio::test]
    async fn test_reconfigure_wipes_consensus_dir() {
        let dir = tempdir().unwrap();
        let local = Arc::new(LocalStore::open(dir.path().join("database/local")).unwrap());
        let driver = Arc::new(RecordingDriver::default());
        let gateway = Gateway::new(
            driver.clone(),
            local,
            dir.path().to_path_buf(),
            cert(),
        );
        gateway.init().unwrap();

        let leftover = gateway.global_database_dir().join("segment-1");
        std::fs::write(&leftover, b"stale").unwrap();

        gateway.reconfigure(None).unwrap();
        assert!(!leftover.exists());
        assert!(gateway.is_consensus_node());
    }
}
