//! Cluster-wide configuration for warden
//!
//! These keys live in the replicated store and apply to every member. The
//! node-local configuration (cluster address) lives in `db::local` instead.

use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::common::utils::parse_duration;
use crate::{Error, Result};

/// Minimum accepted offline threshold. Anything lower would race the
/// heartbeat interval and flap members between online and offline.
pub const MIN_OFFLINE_THRESHOLD: Duration = Duration::from_secs(10);

static DEFAULTS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("cluster.offline_threshold", "20");
    m
});

/// Snapshot of the replicated cluster configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    values: BTreeMap<String, String>,
}

impl ClusterConfig {
    /// Build a config snapshot from raw key/value rows, validating every key.
    pub fn from_map(values: BTreeMap<String, String>) -> Result<Self> {
        let config = Self { values };
        config.offline_threshold()?;
        Ok(config)
    }

    /// How long a member may go without a heartbeat before it is considered
    /// offline.
    pub fn offline_threshold(&self) -> Result<Duration> {
        let raw = self.get("cluster.offline_threshold");
        let threshold = parse_duration(raw)?;
        if threshold < MIN_OFFLINE_THRESHOLD {
            return Err(Error::InvalidArgument(format!(
                "offline threshold must be at least {}s",
                MIN_OFFLINE_THRESHOLD.as_secs()
            )));
        }
        Ok(threshold)
    }

    fn get(&self, key: &str) -> &str {
        self.values
            .get(key)
            .map(String::as_str)
            .unwrap_or_else(|| DEFAULTS.get(key).copied().unwrap_or(""))
    }
}
