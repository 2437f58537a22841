//! Roster policy
//!
//! Pure helpers that decide who should hold which consensus role when the
//! roster changes. No I/O here: the membership operations feed these with a
//! roster snapshot and apply the returned plan through the leader.

use crate::common::raft::{RaftNode, RaftRole, MAX_STAND_BYS, MAX_VOTERS};

/// Roster addresses grouped by role, in roster order.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RosterTally {
    pub voters: Vec<String>,
    pub standbys: Vec<String>,
    pub spares: Vec<String>,
}

pub fn partition(nodes: &[RaftNode]) -> RosterTally {
    let mut tally = RosterTally::default();
    for node in nodes {
        let bucket = match node.role {
            RaftRole::Voter => &mut tally.voters,
            RaftRole::StandBy => &mut tally.standbys,
            RaftRole::Spare => &mut tally.spares,
        };
        bucket.push(node.address.clone());
    }
    tally
}

/// The role a newly accepted member should start with, given the current
/// roster: voter while there is voter capacity in a multi-member cluster,
/// then stand-by while there is stand-by capacity, spare otherwise.
pub fn role_for_new_member(nodes: &[RaftNode]) -> RaftRole {
    let tally = partition(nodes);
    if nodes.len() > 1 && tally.voters.len() < MAX_VOTERS {
        RaftRole::Voter
    } else if tally.standbys.len() < MAX_STAND_BYS {
        RaftRole::StandBy
    } else {
        RaftRole::Spare
    }
}

/// Pick the member to promote, if any promotion is due.
///
/// Promotes towards voter first (stand-by members ahead of spares, since they
/// already hold the log), then backfills stand-by capacity from spares. A
/// single-voter roster is left alone: growth of a one-member cluster happens
/// through accept/join, not here.
pub fn pick_promotion(nodes: &[RaftNode]) -> Option<(String, RaftRole)> {
    let tally = partition(nodes);

    let (role, candidates) = if tally.voters.len() < MAX_VOTERS && tally.voters.len() > 1 {
        let mut candidates = tally.standbys;
        candidates.extend(tally.spares);
        (RaftRole::Voter, candidates)
    } else if tally.standbys.len() < MAX_STAND_BYS {
        (RaftRole::StandBy, tally.spares)
    } else {
        return None;
    };

    let address = candidates.into_iter().next()?;
    Some((address, role))
}

/// Candidates able to replace a leaving voter: every roster entry that is
/// not a voter and not the leaver, in roster order. The caller keeps the
/// first one that is actually online.
pub fn handover_candidates<'a>(nodes: &'a [RaftNode], leaving: &str) -> Vec<&'a RaftNode> {
    nodes
        .iter()
        .filter(|node| node.role != RaftRole::Voter && node.address != leaving)
        .collect()
}

/// A copy of the roster with the entry at `address` given `role`.
pub fn with_role(nodes: &[RaftNode], address: &str, role: RaftRole) -> Vec<RaftNode> {
    let mut nodes = nodes.to_vec();
    if let Some(node) = nodes.iter_mut().find(|n| n.address == address) {
        node.role = role;
    }
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u64, role: RaftRole) -> RaftNode {
        RaftNode::new(id, format!("10.0.0.{}:8443", id), role)
    }

    #[test]
    fn partition_groups_by_role_in_order() {
        let nodes = vec![
            node(1, RaftRole::Voter),
            node(2, RaftRole::Spare),
            node(3, RaftRole::StandBy),
            node(4, RaftRole::Voter),
        ];
        let tally = partition(&nodes);
        assert_eq!(tally.voters, vec!["10.0.0.1:8443", "10.0.0.4:8443"]);
        assert_eq!(tally.standbys, vec!["10.0.0.3:8443"]);
        assert_eq!(tally.spares, vec!["10.0.0.2:8443"]);
    }

    #[test]
    fn new_member_fills_voter_capacity_first() {
        let nodes = vec![node(1, RaftRole::Voter), node(2, RaftRole::Voter)];
        assert_eq!(role_for_new_member(&nodes), RaftRole::Voter);
    }

    #[test]
    fn new_member_is_standby_on_single_node_cluster() {
        // A one-member roster never makes the newcomer a voter directly.
        let nodes = vec![node(1, RaftRole::Voter)];
        assert_eq!(role_for_new_member(&nodes), RaftRole::StandBy);
    }

    #[test]
    fn new_member_is_spare_at_full_capacity() {
        let nodes = vec![
            node(1, RaftRole::Voter),
            node(2, RaftRole::Voter),
            node(3, RaftRole::Voter),
            node(4, RaftRole::StandBy),
            node(5, RaftRole::StandBy),
        ];
        assert_eq!(role_for_new_member(&nodes), RaftRole::Spare);
    }

    #[test]
    fn promotion_prefers_standby_over_spare() {
        let nodes = vec![
            node(1, RaftRole::Voter),
            node(2, RaftRole::Voter),
            node(3, RaftRole::StandBy),
            node(4, RaftRole::Spare),
        ];
        let (address, role) = pick_promotion(&nodes).unwrap();
        assert_eq!(address, "10.0.0.3:8443");
        assert_eq!(role, RaftRole::Voter);
    }

    #[test]
    fn promotion_backfills_standbys_from_spares() {
        let nodes = vec![
            node(1, RaftRole::Voter),
            node(2, RaftRole::Voter),
            node(3, RaftRole::Voter),
            node(4, RaftRole::StandBy),
            node(5, RaftRole::Spare),
        ];
        let (address, role) = pick_promotion(&nodes).unwrap();
        assert_eq!(address, "10.0.0.5:8443");
        assert_eq!(role, RaftRole::StandBy);
    }

    #[test]
    fn promotion_leaves_single_voter_cluster_alone() {
        let nodes = vec![node(1, RaftRole::Voter), node(2, RaftRole::Spare)];
        // Voter count is 1: spares may still back-fill stand-by capacity,
        // but nobody is promoted to voter.
        let (address, role) = pick_promotion(&nodes).unwrap();
        assert_eq!(address, "10.0.0.2:8443");
        assert_eq!(role, RaftRole::StandBy);

        let nodes = vec![node(1, RaftRole::Voter)];
        assert!(pick_promotion(&nodes).is_none());
    }

    #[test]
    fn promotion_is_a_fixed_point_at_capacity() {
        let nodes = vec![
            node(1, RaftRole::Voter),
            node(2, RaftRole::Voter),
            node(3, RaftRole::Voter),
            node(4, RaftRole::StandBy),
            node(5, RaftRole::StandBy),
        ];
        assert!(pick_promotion(&nodes).is_none());
    }

    #[test]
    fn handover_candidates_skip_voters_and_leaver() {
        let nodes = vec![
            node(1, RaftRole::Voter),
            node(2, RaftRole::Voter),
            node(3, RaftRole::StandBy),
            node(4, RaftRole::Spare),
        ];
        let candidates = handover_candidates(&nodes, "10.0.0.3:8443");
        let addresses: Vec<&str> = candidates.iter().map(|n| n.address.as_str()).collect();
        assert_eq!(addresses, vec!["10.0.0.4:8443"]);
    }

    #[test]
    fn with_role_projects_a_copy() {
        let nodes = vec![node(1, RaftRole::Voter), node(2, RaftRole::Spare)];
        let projected = with_role(&nodes, "10.0.0.2:8443", RaftRole::Voter);
        assert_eq!(projected[1].role, RaftRole::Voter);
        assert_eq!(nodes[1].role, RaftRole::Spare);
    }
}
