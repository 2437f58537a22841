//! Database layer: the node-local store and the replicated registry handle

pub mod cluster;
pub mod local;

pub use cluster::{
    ClusterDb, ClusterTx, ExclusiveGuard, Member, Operation, ROLE_DATABASE, UNCLUSTERED_ADDRESS,
};
pub use local::{LocalConfig, LocalStore};
