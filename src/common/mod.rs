//! Common utilities and types shared across warden

pub mod config;
pub mod error;
pub mod raft;
pub mod utils;

pub use config::ClusterConfig;
pub use error::{Error, Result};
pub use raft::{find_by_address, RaftNode, RaftRole, MAX_STAND_BYS, MAX_VOTERS};
pub use utils::{arch_name, compare_versions, now, parse_duration};
