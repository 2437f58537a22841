//! Membership transitions
//!
//! The operations that grow, shrink and rebalance the cluster. Every
//! transition follows the same shape: read preconditions in a plain
//! transaction, optionally take the registry gate exclusively while the
//! consensus driver is torn down and rebuilt, talk to the current leader,
//! then reconcile the member registry in the transaction that reopens the
//! gate. Roster-change notifications to peers are fired asynchronously at
//! the very end and never awaited.
//!
//! Transitions are meant to be invoked serially at the cluster level; the
//! exclusive gate only protects a single node against its own concurrent
//! database traffic.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use crate::cluster::gateway::{CertInfo, ConsensusClient, ConsensusDriver, Gateway};
use crate::cluster::heartbeat::notify_roster_update;
use crate::cluster::roster;
use crate::cluster::DaemonState;
use crate::common::raft::{find_by_address, RaftNode, RaftRole};
use crate::common::{arch_name, compare_versions, now};
use crate::db::cluster::{ClusterDb, ClusterTx, Member, ROLE_DATABASE, UNCLUSTERED_ADDRESS};
use crate::db::local::LocalStore;
use crate::{Error, Result};

/// Deadline applied to every leader-directed RPC.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const CLUSTER_CERT_FILES: [&str; 3] = ["cluster.crt", "cluster.key", "cluster.ca"];

/// Turn an un-clustered node into a one-member cluster.
///
/// The node must already have its cluster address configured and be
/// listening on it.
pub async fn bootstrap<D: ConsensusDriver>(
    state: &DaemonState,
    gateway: &Gateway<D>,
    name: &str,
) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("member name must not be empty".into()));
    }

    check_no_leftover_cluster_cert(&state.var_dir)?;

    // Seed the local roster cache with ourselves as the first entry.
    let config = state.local.config_load()?;
    let address = config.cluster_address().to_string();
    check_local_state_for_bootstrap_or_join(&state.local, &address)?;
    state.local.raft_node_first(&address)?;

    // Claim the install-time self row in the registry.
    state
        .cluster
        .transaction(|tx| {
            check_cluster_state_for_bootstrap_or_join(tx)?;
            tx.node_update(1, name, &address)?;
            tx.node_add_role(1, ROLE_DATABASE)
        })
        .await?;

    tracing::info!(name, %address, "bootstrapping new cluster");

    // Restart the consensus driver with the seeded roster while nothing else
    // can touch the registry.
    let guard = state.cluster.enter_exclusive().await?;
    gateway.shutdown()?;
    gateway.init()?;
    gateway.wait_leadership().await?;

    // The cluster certificate is the node certificate, by reference.
    for ext in [".crt", ".key", ".ca"] {
        if ext == ".ca" && !state.var_dir.join("server.ca").exists() {
            continue;
        }
        std::os::unix::fs::symlink(
            format!("server{}", ext),
            state.var_dir.join(format!("cluster{}", ext)),
        )?;
    }

    // A trivial read as the gate reopens, forcing pooled connections to
    // re-establish against the network endpoint.
    guard.exit(|tx| tx.nodes().map(|_| ()))?;

    Ok(())
}

/// Admit a prospective member and return the roster it should join with.
///
/// Runs on a voter. The new member's role is chosen by capacity: voter while
/// a multi-member roster has voter room, then stand-by, then spare.
pub async fn accept<D: ConsensusDriver>(
    state: &DaemonState,
    gateway: &Gateway<D>,
    name: &str,
    address: &str,
    schema: i32,
    api_extensions: i32,
    architecture: i32,
) -> Result<Vec<RaftNode>> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("member name must not be empty".into()));
    }
    if address.is_empty() {
        return Err(Error::InvalidArgument(
            "member address must not be empty".into(),
        ));
    }

    // Insert the registry row, pending until the member actually joins.
    let id = state
        .cluster
        .transaction(|tx| {
            check_cluster_state_for_accept(tx, name, address, schema, api_extensions)?;
            let id = tx.node_add(name, address, architecture, schema, api_extensions)?;
            tx.node_pending(id, true)?;
            Ok(id)
        })
        .await?;

    let mut nodes = gateway.current_raft_nodes()?;
    let role = roster::role_for_new_member(&nodes);
    tracing::info!(name, address, %role, "accepted new cluster member");

    nodes.push(RaftNode::new(id as u64, address, role));
    Ok(nodes)
}

/// Make this node join an existing cluster.
///
/// `accept` must have been called against the leader first; `raft_nodes` is
/// the roster it returned and `cert` the keypair of the cluster being joined.
pub async fn join<D: ConsensusDriver>(
    state: &DaemonState,
    gateway: &Gateway<D>,
    cert: CertInfo,
    name: &str,
    raft_nodes: Vec<RaftNode>,
) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("member name must not be empty".into()));
    }

    // Replace the local roster cache with the one handed out by accept.
    let config = state.local.config_load()?;
    let address = config.cluster_address().to_string();
    check_local_state_for_bootstrap_or_join(&state.local, &address)?;
    state.local.raft_nodes_replace(&raft_nodes)?;

    // Snapshot the local config this node contributes to cluster-wide pools
    // and networks, plus any outstanding operations, before the registry
    // handle switches identity.
    let (pools, networks, operations) = state
        .cluster
        .transaction(|tx| {
            Ok((
                tx.storage_pools_node_config()?,
                tx.networks_node_config()?,
                tx.operations()?,
            ))
        })
        .await?;

    let guard = state.cluster.enter_exclusive().await?;

    // Wipe any leftover consensus state and come back up with the cluster
    // certificate bound.
    gateway.reconfigure(Some(cert))?;

    let info = match find_by_address(&raft_nodes, &address) {
        Some(info) => info.clone(),
        None => {
            return Err(Error::Fatal(format!(
                "joining member {} not present in the provided roster",
                address
            )))
        }
    };

    tracing::info!(
        id = info.id,
        address = %info.address,
        role = %info.role,
        "joining consensus cluster"
    );

    let mut client = gateway.find_leader(REQUEST_TIMEOUT).await?;
    with_timeout(client.add(info.clone()), "add-member request").await?;

    // Reconcile the registry as the gate reopens: discover our pending row,
    // bind its id, migrate pool/network config and operations, then clear
    // the pending flag.
    let member_id = guard.exit(|tx| {
        let member = tx.node_pending_by_address(&address)?;
        tx.bind_node_id(member.id);

        for (pool_name, pool_id) in tx.storage_pool_ids_not_pending()? {
            tx.storage_pool_node_join(pool_id, member.id)?;

            let driver = tx.storage_pool_driver(pool_id)?;
            if driver == "ceph" || driver == "cephfs" {
                // Remote pools need per-node volume placeholders instead of
                // node-local config.
                tx.storage_pool_node_join_ceph(pool_id, member.id)?;
            } else {
                let pool_config = pools.get(&pool_name).ok_or_else(|| {
                    Error::PreconditionFailed(format!(
                        "joining member has no config for pool {}",
                        pool_name
                    ))
                })?;
                tx.storage_pool_config_add(pool_id, member.id, pool_config.clone())?;
            }
        }

        for (network_name, network_id) in tx.network_ids_not_pending()? {
            let network_config = networks.get(&network_name).ok_or_else(|| {
                Error::PreconditionFailed(format!(
                    "joining member has no config for network {}",
                    network_name
                ))
            })?;
            tx.network_node_join(network_id, member.id)?;
            tx.network_config_add(network_id, member.id, network_config.clone())?;
        }

        // Outstanding operations follow the node under its new identity.
        for operation in &operations {
            tx.operation_add(operation.uuid, &operation.op_type)?;
        }

        tx.node_pending(member.id, false)?;

        if info.role == RaftRole::Voter {
            tx.node_add_role(member.id, ROLE_DATABASE)?;
        }

        Ok(member.id)
    })?;

    tracing::info!(member_id, "migrated local state to cluster registry");
    notify_roster_update(state.transport.clone(), &raft_nodes, info.id);

    Ok(())
}

/// Change the local node's consensus role to whatever `nodes` assigns it.
pub async fn assign<D: ConsensusDriver>(
    state: &DaemonState,
    gateway: &Gateway<D>,
    nodes: Vec<RaftNode>,
) -> Result<()> {
    let address = state.cluster.transaction(|tx| tx.node_address()).await?;
    if address.is_empty() {
        return Err(Error::PreconditionFailed(
            "cluster member is not exposed on the network".into(),
        ));
    }

    let info = find_by_address(&nodes, &address)
        .cloned()
        .ok_or_else(|| {
            Error::PreconditionFailed(
                "this member is not included in the given roster".into(),
            )
        })?;

    state.local.raft_nodes_replace(&nodes)?;

    // A node that joined cleanly already runs the consensus driver and only
    // needs its role changed. A node that did not (or predates role
    // support) must rebuild the driver from scratch first.
    let guard = if gateway.is_consensus_node() {
        None
    } else {
        let guard = state.cluster.enter_exclusive().await?;
        gateway.reconfigure(None)?;
        Some(guard)
    };

    tracing::info!(
        id = info.id,
        address = %info.address,
        role = %info.role,
        "changing consensus role"
    );

    let mut client = gateway.find_leader(REQUEST_TIMEOUT).await?;
    with_timeout(client.assign(info.id, info.role), "assign-role request").await?;

    gateway.set_info(Some(info.clone()));

    // Mirror the consensus role onto the application role set.
    let reconcile = |tx: &mut ClusterTx<'_>| {
        let member = tx.node_by_address(&address)?;
        if info.role == RaftRole::Voter {
            tx.node_add_role(member.id, ROLE_DATABASE)
        } else {
            tx.node_remove_role(member.id, ROLE_DATABASE)
        }
    };
    match guard {
        Some(guard) => guard.exit(reconcile)?,
        None => state.cluster.transaction(reconcile).await?,
    }

    notify_roster_update(state.transport.clone(), &nodes, info.id);

    Ok(())
}

/// Plan a promotion to rebalance the roster, demoting unreachable voters
/// and stand-bys along the way.
///
/// Returns the address to promote and the projected roster, or `None` when
/// the roster is already at capacity. Only plans: the caller applies the
/// returned roster via [`assign`] on the promoted node. Must be called on
/// the leader, serialized with [`handover`].
pub async fn rebalance<D: ConsensusDriver>(
    state: &DaemonState,
    gateway: &Gateway<D>,
) -> Result<Option<(String, Vec<RaftNode>)>> {
    let mut current = gateway.current_raft_nodes()?;

    let (threshold, members) = state
        .cluster
        .transaction(|tx| Ok((tx.node_offline_threshold()?, tx.nodes()?)))
        .await?;
    let by_address: std::collections::BTreeMap<&str, &Member> =
        members.iter().map(|m| (m.address.as_str(), m)).collect();

    // Demote members whose heartbeat lapsed and which a live probe cannot
    // reach either. Demoted members sit this round out entirely.
    let mut demoted: BTreeSet<String> = BTreeSet::new();
    for i in 0..current.len() {
        let node = current[i].clone();
        if node.role == RaftRole::Spare {
            continue;
        }
        let Some(member) = by_address.get(node.address.as_str()) else {
            continue;
        };
        if !member.is_offline(threshold, now()) {
            continue;
        }
        // The heartbeat may just be lagging; trust a successful probe.
        if state.transport.probe(&node.address).await.is_ok() {
            continue;
        }

        tracing::info!(address = %node.address, "demoting unreachable member to spare");
        let mut client = gateway.find_leader(REQUEST_TIMEOUT).await?;
        with_timeout(client.assign(node.id, RaftRole::Spare), "demotion request").await?;

        let member_id = member.id;
        state
            .cluster
            .transaction(move |tx| tx.node_remove_role(member_id, ROLE_DATABASE))
            .await?;

        current[i].role = RaftRole::Spare;
        demoted.insert(node.address);
    }

    let planning: Vec<RaftNode> = current
        .iter()
        .filter(|n| !demoted.contains(&n.address))
        .cloned()
        .collect();

    let Some((address, role)) = roster::pick_promotion(&planning) else {
        return Ok(None);
    };

    tracing::debug!(%address, %role, "found member to promote");
    let projected = roster::with_role(&current, &address, role);
    Ok(Some((address, projected)))
}

/// Find a member able to take over from a voter that is shutting down.
///
/// Returns the replacement's address and the projected roster, or `None`
/// when the leaving member is not a voter or no online replacement exists.
/// The caller proceeds with [`leave`] either way. Leader-only, serialized
/// with [`rebalance`].
pub async fn handover<D: ConsensusDriver>(
    state: &DaemonState,
    gateway: &Gateway<D>,
    address: &str,
) -> Result<Option<(String, Vec<RaftNode>)>> {
    let nodes = gateway.current_raft_nodes()?;

    match find_by_address(&nodes, address) {
        None => {
            return Err(Error::PreconditionFailed(format!(
                "no consensus member has address {}",
                address
            )))
        }
        Some(node) if node.role != RaftRole::Voter => return Ok(None),
        Some(_) => {}
    }

    for candidate in roster::handover_candidates(&nodes, address) {
        if !is_member_online(state, &candidate.address).await? {
            continue;
        }
        let projected = roster::with_role(&nodes, &candidate.address, RaftRole::Voter);
        return Ok(Some((candidate.address.clone(), projected)));
    }

    Ok(None)
}

/// Remove a member from the consensus roster.
///
/// The registry row stays; that removal is [`purge`]'s job. With `force`,
/// the member leaves even while it still hosts workloads or images. Returns
/// the leaving member's address. Leader-only.
pub async fn leave<D: ConsensusDriver>(
    state: &DaemonState,
    gateway: &Gateway<D>,
    name: &str,
    force: bool,
) -> Result<String> {
    tracing::debug!(name, force, "removing member from the cluster");

    let address = state
        .cluster
        .transaction(|tx| {
            let member = tx.node_by_name(name)?;
            if !force {
                check_cluster_state_for_leave(tx, member.id)?;
            }
            Ok(member.address)
        })
        .await?;

    let nodes = gateway.current_raft_nodes()?;
    let Some(info) = find_by_address(&nodes, &address) else {
        // Not part of the consensus roster: nothing to remove here.
        return Ok(address);
    };

    tracing::info!(id = info.id, address = %info.address, "removing member from consensus roster");
    let mut client = gateway.find_leader(REQUEST_TIMEOUT).await?;
    with_timeout(client.remove(info.id), "remove-member request").await?;

    Ok(address)
}

/// Delete a member's registry row and everything derived from it.
pub async fn purge(cluster: &ClusterDb, name: &str) -> Result<()> {
    tracing::debug!(name, "purging member from the registry");

    cluster
        .transaction(|tx| {
            let member = tx.node_by_name(name)?;
            tx.node_clear(member.id)?;
            tx.node_remove(member.id)
        })
        .await
}

/// Classification of a member for operator-facing listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Online,
    Offline,
    /// Upgraded ahead of the rest of the cluster, waiting for the others.
    Blocked,
    /// The member's version record cannot be interpreted.
    Broken,
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberStatus::Online => write!(f, "Online"),
            MemberStatus::Offline => write!(f, "Offline"),
            MemberStatus::Blocked => write!(f, "Blocked"),
            MemberStatus::Broken => write!(f, "Broken"),
        }
    }
}

/// Operator-facing view of one cluster member.
#[derive(Debug, Clone)]
pub struct MemberView {
    pub server_name: String,
    pub url: String,
    pub database: bool,
    pub roles: Vec<String>,
    pub architecture: String,
    pub status: MemberStatus,
    pub message: String,
}

/// List the members of the cluster with their status.
pub async fn list(state: &DaemonState) -> Result<Vec<MemberView>> {
    let (members, threshold) = state
        .cluster
        .transaction(|tx| Ok((tx.nodes()?, tx.node_offline_threshold()?)))
        .await?;

    // The cluster baseline is the lowest version still in service; members
    // ahead of it are blocked until the stragglers upgrade.
    let baseline = members
        .iter()
        .filter(|m| version_is_valid(m))
        .map(|m| m.version())
        .min_by(|a, b| compare_versions(*a, *b));

    let now = now();
    let mut result = Vec::with_capacity(members.len());
    for member in &members {
        let (status, message) = if !version_is_valid(member) {
            (MemberStatus::Broken, "inconsistent version".to_string())
        } else if member.is_offline(threshold, now) {
            let since = match member.heartbeat {
                Some(seen) => format!("no heartbeat since {}", now.signed_duration_since(seen)),
                None => "no heartbeat recorded".to_string(),
            };
            (MemberStatus::Offline, since)
        } else if baseline
            .is_some_and(|b| compare_versions(member.version(), b) == std::cmp::Ordering::Greater)
        {
            (
                MemberStatus::Blocked,
                "waiting for other members to be upgraded".to_string(),
            )
        } else {
            (MemberStatus::Online, "fully operational".to_string())
        };

        result.push(MemberView {
            server_name: member.name.clone(),
            url: format!("https://{}", member.address),
            database: member.roles.contains(ROLE_DATABASE),
            roles: member.roles.iter().cloned().collect(),
            architecture: arch_name(member.architecture)?.to_string(),
            status,
            message,
        });
    }

    Ok(result)
}

/// The current number of members in the registry.
pub async fn count(state: &DaemonState) -> Result<usize> {
    state.cluster.transaction(|tx| tx.nodes_count()).await
}

/// Whether clustering is enabled on this node.
pub fn enabled(local: &LocalStore) -> Result<bool> {
    Ok(!local.raft_node_addresses()?.is_empty())
}

/// Classify the member at `address` as online or offline.
///
/// The heartbeat is authoritative; a live TLS probe only overrides it to
/// mask heartbeat lag.
pub async fn is_member_online(state: &DaemonState, address: &str) -> Result<bool> {
    let addr = address.to_string();
    let online = state
        .cluster
        .transaction(move |tx| {
            let threshold = tx.node_offline_threshold()?;
            let member = tx.node_by_address(&addr)?;
            Ok(!member.is_offline(threshold, now()))
        })
        .await?;

    if !online && state.transport.probe(address).await.is_ok() {
        return Ok(true);
    }

    Ok(online)
}

fn version_is_valid(member: &Member) -> bool {
    member.schema > 0 && member.api_extensions > 0
}

async fn with_timeout<T>(fut: impl Future<Output = Result<T>>, what: &str) -> Result<T> {
    match tokio::time::timeout(REQUEST_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Transient(format!("{} timed out", what))),
    }
}

// === Preconditions ===
//
// Pure predicates over the two stores, run before a transition mutates
// anything.

/// The local roster cache and cluster address must allow becoming a cluster
/// member: an address is configured, and the cache is still empty.
fn check_local_state_for_bootstrap_or_join(local: &LocalStore, address: &str) -> Result<()> {
    let nodes = local.raft_nodes()?;

    let has_cluster_address = !address.is_empty();
    let has_raft_nodes = !nodes.is_empty();

    if !has_cluster_address && has_raft_nodes {
        return Err(Error::InconsistentState(
            "found leftover entries in the raft roster cache".into(),
        ));
    }
    if !has_cluster_address {
        return Err(Error::PreconditionFailed(
            "no cluster address is configured on this member".into(),
        ));
    }
    if has_raft_nodes {
        return Err(Error::PreconditionFailed(
            "the member is already part of a cluster".into(),
        ));
    }

    Ok(())
}

/// The registry must hold exactly the install-time self row.
fn check_cluster_state_for_bootstrap_or_join(tx: &ClusterTx<'_>) -> Result<()> {
    let members = tx.nodes()?;
    if members.len() != 1 {
        return Err(Error::InconsistentState(
            "found leftover entries in the member registry".into(),
        ));
    }
    Ok(())
}

/// A prospective member must bring a unique name and address and agree with
/// every existing member on schema and API versions.
fn check_cluster_state_for_accept(
    tx: &ClusterTx<'_>,
    name: &str,
    address: &str,
    schema: i32,
    api_extensions: i32,
) -> Result<()> {
    let members = tx.nodes()?;

    if members.len() == 1 && members[0].address == UNCLUSTERED_ADDRESS {
        return Err(Error::PreconditionFailed("clustering is not enabled".into()));
    }

    for member in &members {
        if member.name == name {
            return Err(Error::PreconditionFailed(format!(
                "the cluster already has a member with name: {}",
                name
            )));
        }
        if member.address == address {
            return Err(Error::PreconditionFailed(format!(
                "the cluster already has a member with address: {}",
                address
            )));
        }
        if member.schema != schema {
            return Err(Error::PreconditionFailed(format!(
                "the joining member's schema version does not match (cluster has {})",
                member.schema
            )));
        }
        if member.api_extensions != api_extensions {
            return Err(Error::PreconditionFailed(format!(
                "the joining member's API extension count does not match (cluster has {})",
                member.api_extensions
            )));
        }
    }

    Ok(())
}

/// A member may only leave once it hosts nothing and is not the last one.
fn check_cluster_state_for_leave(tx: &ClusterTx<'_>, member_id: i64) -> Result<()> {
    if let Some(message) = tx.node_is_empty(member_id)? {
        return Err(Error::PreconditionFailed(message));
    }

    if tx.nodes()?.len() == 1 {
        return Err(Error::PreconditionFailed(
            "member is the only member in the cluster".into(),
        ));
    }

    Ok(())
}

/// No cluster certificate files may predate a bootstrap.
fn check_no_leftover_cluster_cert(dir: &Path) -> Result<()> {
    for basename in CLUSTER_CERT_FILES {
        if dir.join(basename).exists() {
            return Err(Error::InconsistentState(
                "found leftover cluster certificate".into(),
            ));
        }
    }
    Ok(())
}
