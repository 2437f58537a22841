//! Heartbeat payloads and the peer transport
//!
//! Membership transitions broadcast a partial, roster-only heartbeat so that
//! peers refresh their raft roster cache without waiting for the next full
//! heartbeat round. The broadcast is best-effort: sends are spawned and never
//! awaited by the transition itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::gateway::CertInfo;
use crate::common::raft::RaftNode;
use crate::{Error, Result};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Member entry carried in a heartbeat payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMember {
    pub id: i64,
    pub address: String,
}

/// Heartbeat request body exchanged between members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Whether the payload carries the full cluster state. Roster refresh
    /// notifications set this to false.
    pub full_state: bool,
    pub raft_nodes: Vec<RaftNode>,
    pub members: Vec<HeartbeatMember>,
}

impl HeartbeatPayload {
    /// Build the partial payload broadcast after a roster change.
    pub fn roster_only(raft_nodes: &[RaftNode]) -> Self {
        let members = raft_nodes
            .iter()
            .map(|node| HeartbeatMember {
                id: node.id as i64,
                address: node.address.clone(),
            })
            .collect();
        Self {
            full_state: false,
            raft_nodes: raft_nodes.to_vec(),
            members,
        }
    }
}

/// Transport used to reach peers for heartbeats and liveness probes.
#[async_trait]
pub trait HeartbeatTransport: Send + Sync {
    /// Deliver a heartbeat payload to the peer at `address`. Best-effort.
    async fn heartbeat(&self, address: &str, payload: &HeartbeatPayload) -> Result<()>;

    /// Open a TLS connection to the peer and fetch its server info, to tell
    /// a lagging heartbeat from a genuinely unreachable member.
    async fn probe(&self, address: &str) -> Result<()>;
}

/// HTTPS transport authenticated with the cluster certificate.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(cert: &CertInfo) -> Result<Self> {
        let identity = reqwest::Identity::from_pem(&cert.identity_pem())
            .map_err(|e| Error::Transient(format!("invalid cluster certificate: {}", e)))?;

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .timeout(SEND_TIMEOUT)
            // Peers authenticate with the pinned cluster certificate, not a
            // public CA chain.
            .danger_accept_invalid_certs(true);

        if let Some(ca) = &cert.ca_pem {
            let ca = reqwest::Certificate::from_pem(ca)
                .map_err(|e| Error::Transient(format!("invalid cluster CA: {}", e)))?;
            builder = builder.add_root_certificate(ca);
        }

        let client = builder
            .build()
            .map_err(|e| Error::Transient(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HeartbeatTransport for HttpTransport {
    async fn heartbeat(&self, address: &str, payload: &HeartbeatPayload) -> Result<()> {
        let url = format!("https://{}/internal/heartbeat", address);
        self.client
            .put(&url)
            .json(payload)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| Error::Transient(format!("heartbeat to {} failed: {}", address, e)))?;
        Ok(())
    }

    async fn probe(&self, address: &str) -> Result<()> {
        let url = format!("https://{}/internal/server", address);
        self.client
            .get(&url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| Error::Transient(format!("probe of {} failed: {}", address, e)))?;
        Ok(())
    }
}

/// Notify every peer except `self_id` that the roster changed.
///
/// Sends are fire-and-forget; failures are logged and otherwise ignored, the
/// next heartbeat round will catch stragglers up.
pub fn notify_roster_update(
    transport: Arc<dyn HeartbeatTransport>,
    raft_nodes: &[RaftNode],
    self_id: u64,
) {
    let payload = HeartbeatPayload::roster_only(raft_nodes);
    for node in raft_nodes {
        if node.id == self_id {
            continue;
        }
        let transport = transport.clone();
        let payload = payload.clone();
        let address = node.address.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.heartbeat(&address, &payload).await {
                tracing::debug!("roster notification to {} failed: {}", address, e);
            }
        });
    }
}
