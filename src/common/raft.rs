//! Consensus roster types shared across warden
//!
//! A node holds one of three roles in the consensus group:
//! - **Voter**: participates in quorum.
//! - **StandBy**: receives the log but does not vote; cheap to promote.
//! - **Spare**: does not receive the log at all.

use serde::{Deserialize, Serialize};

/// Target number of voters in the consensus group.
pub const MAX_VOTERS: usize = 3;

/// Target number of stand-by members in the consensus group.
pub const MAX_STAND_BYS: usize = 2;

/// Role of a node in the consensus group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    #[serde(rename = "voter")]
    Voter,
    #[serde(rename = "stand-by")]
    StandBy,
    #[serde(rename = "spare")]
    Spare,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Voter => write!(f, "voter"),
            RaftRole::StandBy => write!(f, "stand-by"),
            RaftRole::Spare => write!(f, "spare"),
        }
    }
}

/// An entry in the consensus group's configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftNode {
    pub id: u64,
    pub address: String,
    pub role: RaftRole,
}

impl RaftNode {
    pub fn new(id: u64, address: impl Into<String>, role: RaftRole) -> Self {
        Self {
            id,
            address: address.into(),
            role,
        }
    }
}

/// Find the roster entry with the given address.
pub fn find_by_address<'a>(nodes: &'a [RaftNode], address: &str) -> Option<&'a RaftNode> {
    nodes.iter().find(|n| n.address == address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_encoding() {
        let json = serde_json::to_string(&RaftRole::StandBy).unwrap();
        assert_eq!(json, "\"stand-by\"");
        let role: RaftRole = serde_json::from_str("\"spare\"").unwrap();
        assert_eq!(role, RaftRole::Spare);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(RaftRole::Voter.to_string(), "voter");
        assert_eq!(RaftRole::StandBy.to_string(), "stand-by");
    }

    #[test]
    fn test_find_by_address() {
        let nodes = vec![
            RaftNode::new(1, "10.0.0.1:8443", RaftRole::Voter),
            RaftNode::new(2, "10.0.0.2:8443", RaftRole::Spare),
        ];
        assert_eq!(find_by_address(&nodes, "10.0.0.2:8443").unwrap().id, 2);
        assert!(find_by_address(&nodes, "10.0.0.9:8443").is_none());
    }
}
