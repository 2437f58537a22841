//! Replicated registry handle
//!
//! Client-side view of the cluster database that rides the consensus engine.
//! Holds the member registry plus the per-node storage pool, network and
//! operation rows that membership transitions migrate around.
//!
//! Access runs through [`ClusterDb::transaction`]. Membership transitions
//! that restart the consensus driver first take the gate exclusively with
//! [`ClusterDb::enter_exclusive`], which drains in-flight transactions;
//! the returned guard reopens the gate only after running one final
//! reconciling transaction (or on drop, for error paths).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use uuid::Uuid;

use crate::common::config::ClusterConfig;
use crate::{Error, Result};

/// Application role tag carried by members that host a voter.
pub const ROLE_DATABASE: &str = "database";

/// Address recorded for the initial self-row before clustering is enabled.
pub const UNCLUSTERED_ADDRESS: &str = "0.0.0.0";

/// A row in the replicated member registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub architecture: i32,
    pub schema: i32,
    pub api_extensions: i32,
    pub pending: bool,
    pub roles: BTreeSet<String>,
    pub heartbeat: Option<DateTime<Utc>>,
}

impl Member {
    /// Whether the member's last heartbeat is older than the threshold.
    pub fn is_offline(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        match self.heartbeat {
            Some(seen) => {
                now.signed_duration_since(seen).num_milliseconds()
                    > threshold.as_millis() as i64
            }
            None => true,
        }
    }

    /// The member's (schema, api_extensions) version record.
    pub fn version(&self) -> [i32; 2] {
        [self.schema, self.api_extensions]
    }
}

/// A storage pool row with its per-node attachments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePool {
    pub id: i64,
    pub name: String,
    pub driver: String,
    pub pending: bool,
    pub nodes: BTreeSet<i64>,
    pub node_configs: BTreeMap<i64, BTreeMap<String, String>>,
    pub volumes: Vec<PoolVolume>,
}

/// A storage volume row, scoped to one node of its pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolVolume {
    pub name: String,
    pub node_id: i64,
}

/// A network row with its per-node attachments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: i64,
    pub name: String,
    pub pending: bool,
    pub nodes: BTreeSet<i64>,
    pub node_configs: BTreeMap<i64, BTreeMap<String, String>>,
}

/// An asynchronous operation owned by one member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub uuid: Uuid,
    pub op_type: String,
    pub node_id: i64,
}

/// A workload hosted by one member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub node_id: i64,
}

/// An image cached by one member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub fingerprint: String,
    pub node_id: i64,
}

#[derive(Debug, Default)]
struct ClusterData {
    members: Vec<Member>,
    pools: Vec<StoragePool>,
    networks: Vec<Network>,
    operations: Vec<Operation>,
    instances: Vec<Instance>,
    images: Vec<Image>,
    config: BTreeMap<String, String>,
    next_member_id: i64,
    next_pool_id: i64,
    next_network_id: i64,
}

/// Shared handle to the replicated registry.
#[derive(Clone)]
pub struct ClusterDb {
    data: Arc<Mutex<ClusterData>>,
    gate: Arc<RwLock<()>>,
    node_id: Arc<AtomicI64>,
}

impl ClusterDb {
    /// Create a handle seeded with the install-time self row (id 1), the way
    /// a freshly installed node comes up before clustering is enabled.
    pub fn new(schema: i32, api_extensions: i32, architecture: i32) -> Self {
        let mut data = ClusterData {
            next_member_id: 2,
            next_pool_id: 1,
            next_network_id: 1,
            ..Default::default()
        };
        data.members.push(Member {
            id: 1,
            name: "none".to_string(),
            address: UNCLUSTERED_ADDRESS.to_string(),
            architecture,
            schema,
            api_extensions,
            pending: false,
            roles: BTreeSet::new(),
            heartbeat: None,
        });
        Self {
            data: Arc::new(Mutex::new(data)),
            gate: Arc::new(RwLock::new(())),
            node_id: Arc::new(AtomicI64::new(1)),
        }
    }

    /// Bind the acting member identity used by node-scoped queries.
    pub fn bind_node_id(&self, id: i64) {
        self.node_id.store(id, Ordering::SeqCst);
    }

    /// The currently bound member identity.
    pub fn node_id(&self) -> i64 {
        self.node_id.load(Ordering::SeqCst)
    }

    /// Run a transaction against the registry.
    ///
    /// Blocks while the exclusive gate is held by a membership transition.
    pub async fn transaction<R>(
        &self,
        f: impl FnOnce(&mut ClusterTx<'_>) -> Result<R>,
    ) -> Result<R> {
        let _shared = self.gate.read().await;
        let mut data = self.data.lock().unwrap();
        let mut tx = ClusterTx {
            data: &mut data,
            node_id: self.node_id.clone(),
        };
        f(&mut tx)
    }

    /// Take the gate exclusively, draining in-flight transactions first.
    ///
    /// Regular access resumes when the returned guard exits (or drops).
    pub async fn enter_exclusive(&self) -> Result<ExclusiveGuard> {
        let guard = self.gate.clone().write_owned().await;
        Ok(ExclusiveGuard {
            db: self.clone(),
            _guard: guard,
        })
    }
}

/// Witness that the cluster database gate is held exclusively.
///
/// Dropping the guard reopens the gate; [`ExclusiveGuard::exit`] runs the
/// reconciling transaction first.
pub struct ExclusiveGuard {
    db: ClusterDb,
    _guard: OwnedRwLockWriteGuard<()>,
}

impl ExclusiveGuard {
    /// Run `f` as the first transaction on the reopened registry, then
    /// release the gate. The gate is released even when `f` fails.
    pub fn exit<R>(self, f: impl FnOnce(&mut ClusterTx<'_>) -> Result<R>) -> Result<R> {
        let result = {
            let mut data = self.db.data.lock().unwrap();
            let mut tx = ClusterTx {
                data: &mut data,
                node_id: self.db.node_id.clone(),
            };
            f(&mut tx)
        };
        drop(self);
        result
    }
}

/// A transaction over the replicated registry.
pub struct ClusterTx<'a> {
    data: &'a mut ClusterData,
    node_id: Arc<AtomicI64>,
}

impl ClusterTx<'_> {
    /// Bind the acting member identity for this and subsequent transactions.
    pub fn bind_node_id(&self, id: i64) {
        self.node_id.store(id, Ordering::SeqCst);
    }

    // === Member registry ===

    pub fn nodes(&self) -> Result<Vec<Member>> {
        Ok(self.data.members.clone())
    }

    pub fn nodes_count(&self) -> Result<usize> {
        Ok(self.data.members.len())
    }

    pub fn node_by_name(&self, name: &str) -> Result<Member> {
        self.data
            .members
            .iter()
            .find(|m| m.name == name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("member with name {}", name)))
    }

    pub fn node_by_address(&self, address: &str) -> Result<Member> {
        self.data
            .members
            .iter()
            .find(|m| m.address == address)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("member with address {}", address)))
    }

    pub fn node_pending_by_address(&self, address: &str) -> Result<Member> {
        self.data
            .members
            .iter()
            .find(|m| m.address == address && m.pending)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("pending member with address {}", address)))
    }

    /// Address of the acting member.
    pub fn node_address(&self) -> Result<String> {
        let id = self.node_id.load(Ordering::SeqCst);
        self.data
            .members
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.address.clone())
            .ok_or_else(|| Error::NotFound(format!("member with id {}", id)))
    }

    /// Insert a member row and return its id.
    pub fn node_add(
        &mut self,
        name: &str,
        address: &str,
        architecture: i32,
        schema: i32,
        api_extensions: i32,
    ) -> Result<i64> {
        let id = self.data.next_member_id;
        self.data.next_member_id += 1;
        self.data.members.push(Member {
            id,
            name: name.to_string(),
            address: address.to_string(),
            architecture,
            schema,
            api_extensions,
            pending: false,
            roles: BTreeSet::new(),
            heartbeat: Some(crate::common::now()),
        });
        Ok(id)
    }

    pub fn node_update(&mut self, id: i64, name: &str, address: &str) -> Result<()> {
        let member = self.member_mut(id)?;
        member.name = name.to_string();
        member.address = address.to_string();
        Ok(())
    }

    pub fn node_pending(&mut self, id: i64, pending: bool) -> Result<()> {
        self.member_mut(id)?.pending = pending;
        Ok(())
    }

    pub fn node_add_role(&mut self, id: i64, role: &str) -> Result<()> {
        self.member_mut(id)?.roles.insert(role.to_string());
        Ok(())
    }

    pub fn node_remove_role(&mut self, id: i64, role: &str) -> Result<()> {
        self.member_mut(id)?.roles.remove(role);
        Ok(())
    }

    pub fn node_heartbeat(&mut self, address: &str, seen: DateTime<Utc>) -> Result<()> {
        let member = self
            .data
            .members
            .iter_mut()
            .find(|m| m.address == address)
            .ok_or_else(|| Error::NotFound(format!("member with address {}", address)))?;
        member.heartbeat = Some(seen);
        Ok(())
    }

    /// Drop every row derived from the member: workloads, images, per-node
    /// pool and network state, operations.
    pub fn node_clear(&mut self, id: i64) -> Result<()> {
        self.data.instances.retain(|i| i.node_id != id);
        self.data.images.retain(|i| i.node_id != id);
        self.data.operations.retain(|o| o.node_id != id);
        for pool in &mut self.data.pools {
            pool.nodes.remove(&id);
            pool.node_configs.remove(&id);
            pool.volumes.retain(|v| v.node_id != id);
        }
        for network in &mut self.data.networks {
            network.nodes.remove(&id);
            network.node_configs.remove(&id);
        }
        Ok(())
    }

    pub fn node_remove(&mut self, id: i64) -> Result<()> {
        let before = self.data.members.len();
        self.data.members.retain(|m| m.id != id);
        if self.data.members.len() == before {
            return Err(Error::NotFound(format!("member with id {}", id)));
        }
        Ok(())
    }

    /// Empty-check used before a member may leave: reports what it still
    /// hosts, or `None` when nothing is left.
    pub fn node_is_empty(&self, id: i64) -> Result<Option<String>> {
        let instances: Vec<&str> = self
            .data
            .instances
            .iter()
            .filter(|i| i.node_id == id)
            .map(|i| i.name.as_str())
            .collect();
        if !instances.is_empty() {
            return Ok(Some(format!(
                "Member still has the following workloads: {}",
                instances.join(", ")
            )));
        }

        let images: Vec<&str> = self
            .data
            .images
            .iter()
            .filter(|i| i.node_id == id)
            .map(|i| i.fingerprint.as_str())
            .collect();
        if !images.is_empty() {
            return Ok(Some(format!(
                "Member still has the following images: {}",
                images.join(", ")
            )));
        }

        Ok(None)
    }

    pub fn node_offline_threshold(&self) -> Result<Duration> {
        self.cluster_config()?.offline_threshold()
    }

    // === Cluster config ===

    pub fn cluster_config(&self) -> Result<ClusterConfig> {
        ClusterConfig::from_map(self.data.config.clone())
    }

    pub fn config_put(&mut self, key: &str, value: &str) -> Result<()> {
        self.data
            .config
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    // === Storage pools ===

    pub fn storage_pool_create(&mut self, name: &str, driver: &str) -> Result<i64> {
        let id = self.data.next_pool_id;
        self.data.next_pool_id += 1;
        let node_id = self.node_id.load(Ordering::SeqCst);
        self.data.pools.push(StoragePool {
            id,
            name: name.to_string(),
            driver: driver.to_string(),
            pending: false,
            nodes: BTreeSet::from([node_id]),
            node_configs: BTreeMap::new(),
            volumes: Vec::new(),
        });
        Ok(id)
    }

    pub fn storage_pool_ids_not_pending(&self) -> Result<BTreeMap<String, i64>> {
        Ok(self
            .data
            .pools
            .iter()
            .filter(|p| !p.pending)
            .map(|p| (p.name.clone(), p.id))
            .collect())
    }

    pub fn storage_pool_driver(&self, id: i64) -> Result<String> {
        Ok(self.pool(id)?.driver.clone())
    }

    pub fn storage_pool_node_join(&mut self, id: i64, node_id: i64) -> Result<()> {
        self.pool_mut(id)?.nodes.insert(node_id);
        Ok(())
    }

    /// Create per-node volume placeholders for a joining member of a
    /// ceph-backed pool, one for each volume name already present.
    pub fn storage_pool_node_join_ceph(&mut self, id: i64, node_id: i64) -> Result<()> {
        let pool = self.pool_mut(id)?;
        let names: BTreeSet<String> = pool.volumes.iter().map(|v| v.name.clone()).collect();
        for name in names {
            pool.volumes.push(PoolVolume { name, node_id });
        }
        Ok(())
    }

    pub fn storage_pool_config_add(
        &mut self,
        id: i64,
        node_id: i64,
        config: BTreeMap<String, String>,
    ) -> Result<()> {
        self.pool_mut(id)?.node_configs.insert(node_id, config);
        Ok(())
    }

    pub fn storage_pool_volume_add(&mut self, id: i64, name: &str) -> Result<()> {
        let node_id = self.node_id.load(Ordering::SeqCst);
        self.pool_mut(id)?.volumes.push(PoolVolume {
            name: name.to_string(),
            node_id,
        });
        Ok(())
    }

    pub fn storage_pool_volumes(&self, id: i64) -> Result<Vec<PoolVolume>> {
        Ok(self.pool(id)?.volumes.clone())
    }

    /// The acting member's per-pool config, keyed by pool name.
    pub fn storage_pools_node_config(
        &self,
    ) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
        let node_id = self.node_id.load(Ordering::SeqCst);
        Ok(self
            .data
            .pools
            .iter()
            .filter_map(|p| {
                p.node_configs
                    .get(&node_id)
                    .map(|c| (p.name.clone(), c.clone()))
            })
            .collect())
    }

    // === Networks ===

    pub fn network_create(&mut self, name: &str) -> Result<i64> {
        let id = self.data.next_network_id;
        self.data.next_network_id += 1;
        let node_id = self.node_id.load(Ordering::SeqCst);
        self.data.networks.push(Network {
            id,
            name: name.to_string(),
            pending: false,
            nodes: BTreeSet::from([node_id]),
            node_configs: BTreeMap::new(),
        });
        Ok(id)
    }

    pub fn network_ids_not_pending(&self) -> Result<BTreeMap<String, i64>> {
        Ok(self
            .data
            .networks
            .iter()
            .filter(|n| !n.pending)
            .map(|n| (n.name.clone(), n.id))
            .collect())
    }

    pub fn network_node_join(&mut self, id: i64, node_id: i64) -> Result<()> {
        self.network_mut(id)?.nodes.insert(node_id);
        Ok(())
    }

    pub fn network_config_add(
        &mut self,
        id: i64,
        node_id: i64,
        config: BTreeMap<String, String>,
    ) -> Result<()> {
        self.network_mut(id)?.node_configs.insert(node_id, config);
        Ok(())
    }

    /// The acting member's per-network config, keyed by network name.
    pub fn networks_node_config(&self) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
        let node_id = self.node_id.load(Ordering::SeqCst);
        Ok(self
            .data
            .networks
            .iter()
            .filter_map(|n| {
                n.node_configs
                    .get(&node_id)
                    .map(|c| (n.name.clone(), c.clone()))
            })
            .collect())
    }

    // === Operations ===

    pub fn operations(&self) -> Result<Vec<Operation>> {
        Ok(self.data.operations.clone())
    }

    /// Record an operation as owned by the acting member.
    pub fn operation_add(&mut self, uuid: Uuid, op_type: &str) -> Result<()> {
        let node_id = self.node_id.load(Ordering::SeqCst);
        self.data.operations.push(Operation {
            uuid,
            op_type: op_type.to_string(),
            node_id,
        });
        Ok(())
    }

    // === Workloads and images ===

    pub fn instance_add(&mut self, name: &str, node_id: i64) -> Result<()> {
        self.data.instances.push(Instance {
            name: name.to_string(),
            node_id,
        });
        Ok(())
    }

    pub fn image_add(&mut self, fingerprint: &str, node_id: i64) -> Result<()> {
        self.data.images.push(Image {
            fingerprint: fingerprint.to_string(),
            node_id,
        });
        Ok(())
    }

    // === Internal lookups ===

    fn member_mut(&mut self, id: i64) -> Result<&mut Member> {
        self.data
            .members
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| Error::NotFound(format!("member with id {}", id)))
    }

    fn pool(&self, id: i64) -> Result<&StoragePool> {
        self.data
            .pools
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| Error::NotFound(format!("storage pool with id {}", id)))
    }

    fn pool_mut(&mut self, id: i64) -> Result<&mut StoragePool> {
        self.data
            .pools
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| Error::NotFound(format!("storage pool with id {}", id)))
    }

    fn network_mut(&mut self, id: i64) -> Result<&mut Network> {
        self.data
            .networks
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| Error::NotFound(format!("network with id {}", id)))
    }
}
