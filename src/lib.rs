//! # warden
//!
//! Cluster membership control plane for the warden workload manager:
//! - Replicated member registry kept in step with the consensus roster
//! - Capacity-driven role policy (3 voters, 2 stand-bys)
//! - Consensus driver lifecycle (bootstrap, join, reconfigure)
//! - Heartbeat-based liveness with on-demand TLS probes
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              Replicated registry             │
//! │   (member rows, pools, networks, operations) │
//! └───────────┬──────────────────────────────────┘
//!             │ rides the consensus engine
//!   ┌─────────┴──────────┬────────────────┐
//!   │                    │                │
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌─────▼──────┐
//! │ Voter      │   │ Stand-by   │   │ Spare      │
//! │ (quorum)   │   │ (log only) │   │ (no log)   │
//! └────────────┘   └────────────┘   └────────────┘
//! ```
//!
//! Membership transitions (`bootstrap`, `accept`, `join`, `assign`,
//! `rebalance`, `handover`, `leave`, `purge`) live in
//! [`cluster::membership`]. The consensus engine itself is consumed through
//! the [`cluster::ConsensusDriver`] trait; the daemon wires in the concrete
//! engine, HTTP endpoints and CLI.

pub mod cluster;
pub mod common;
pub mod db;

// Re-export commonly used types
pub use cluster::{CertInfo, ConsensusClient, ConsensusDriver, DaemonState, Gateway};
pub use common::{Error, RaftNode, RaftRole, Result};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
