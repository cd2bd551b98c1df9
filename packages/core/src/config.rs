//! Core Configuration
//!
//! All tunables in one struct with production defaults. Tests construct the
//! struct directly; deployments override through `EDGEWARDEN_*` environment
//! variables.

use serde::Deserialize;
use std::time::Duration;

/// Tunables for the per-tenant state machine and server
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    /// Maximum authorization path length, traversal hops plus the
    /// permission edge
    pub max_traversal: usize,

    /// Maximum version lag served by catch-up before a full resync
    pub max_catchup: u64,

    /// Mutations since the last snapshot that trigger a new one
    pub snapshot_mutation_threshold: u64,

    /// Idle time since the last mutation that triggers a snapshot
    pub snapshot_idle: Duration,

    /// Idle time after which a WebSocket connection is evicted
    pub connection_idle: Duration,

    /// Idle time after which a tenant actor is drained and evicted
    pub tenant_idle: Duration,

    /// Query cache capacity (entries)
    pub cache_capacity: usize,

    /// Query cache time bound
    pub cache_ttl: Duration,

    /// Whether the query cache is enabled at all
    pub cache_enabled: bool,

    /// Per-connection send queue bound (frames); overflow closes the
    /// connection as a slow consumer
    pub send_queue_capacity: usize,

    /// Soft cap on per-tenant resident memory (bytes); over the cap the
    /// tenant stops accepting new connections
    pub memory_soft_cap: usize,

    /// Deadline for graph queries
    pub query_timeout: Duration,

    /// Deadline for proof validation
    pub proof_timeout: Duration,

    /// WebSocket heartbeat interval
    pub heartbeat_interval: Duration,

    /// Missed heartbeats before the connection is closed
    pub max_missed_pongs: u8,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_traversal: 10,
            max_catchup: 100,
            snapshot_mutation_threshold: 100,
            snapshot_idle: Duration::from_secs(300),
            connection_idle: Duration::from_secs(300),
            tenant_idle: Duration::from_secs(600),
            cache_capacity: 1024,
            cache_ttl: Duration::from_secs(60),
            cache_enabled: true,
            send_queue_capacity: 256,
            memory_soft_cap: 128 * 1024 * 1024,
            query_timeout: Duration::from_millis(100),
            proof_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(30),
            max_missed_pongs: 3,
        }
    }
}

impl CoreConfig {
    /// Entries the ledger mirrors in memory and the durable log must retain
    /// past a snapshot
    pub fn log_retention(&self) -> usize {
        (self.max_catchup + 100) as usize
    }

    /// Build a config from `EDGEWARDEN_*` environment variables, falling
    /// back to defaults for anything unset or unparseable
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_parse("EDGEWARDEN_MAX_TRAVERSAL") {
            config.max_traversal = value;
        }
        if let Some(value) = env_parse("EDGEWARDEN_MAX_CATCHUP") {
            config.max_catchup = value;
        }
        if let Some(value) = env_parse("EDGEWARDEN_SNAPSHOT_THRESHOLD") {
            config.snapshot_mutation_threshold = value;
        }
        if let Some(value) = env_parse("EDGEWARDEN_SNAPSHOT_IDLE_SECS") {
            config.snapshot_idle = Duration::from_secs(value);
        }
        if let Some(value) = env_parse("EDGEWARDEN_CONNECTION_IDLE_SECS") {
            config.connection_idle = Duration::from_secs(value);
        }
        if let Some(value) = env_parse("EDGEWARDEN_TENANT_IDLE_SECS") {
            config.tenant_idle = Duration::from_secs(value);
        }
        if let Some(value) = env_parse("EDGEWARDEN_CACHE_CAPACITY") {
            config.cache_capacity = value;
        }
        if let Some(value) = env_parse("EDGEWARDEN_CACHE_TTL_SECS") {
            config.cache_ttl = Duration::from_secs(value);
        }
        if let Some(value) = env_parse::<u8>("EDGEWARDEN_CACHE_ENABLED") {
            config.cache_enabled = value != 0;
        }
        if let Some(value) = env_parse("EDGEWARDEN_SEND_QUEUE_CAPACITY") {
            config.send_queue_capacity = value;
        }
        if let Some(value) = env_parse("EDGEWARDEN_MEMORY_SOFT_CAP") {
            config.memory_soft_cap = value;
        }
        if let Some(value) = env_parse("EDGEWARDEN_QUERY_TIMEOUT_MS") {
            config.query_timeout = Duration::from_millis(value);
        }
        if let Some(value) = env_parse("EDGEWARDEN_PROOF_TIMEOUT_MS") {
            config.proof_timeout = Duration::from_millis(value);
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = CoreConfig::default();
        assert_eq!(config.max_traversal, 10);
        assert_eq!(config.max_catchup, 100);
        assert_eq!(config.snapshot_mutation_threshold, 100);
        assert_eq!(config.snapshot_idle, Duration::from_secs(300));
        assert_eq!(config.cache_capacity, 1024);
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.send_queue_capacity, 256);
        assert_eq!(config.memory_soft_cap, 128 * 1024 * 1024);
        assert_eq!(config.query_timeout, Duration::from_millis(100));
        assert_eq!(config.proof_timeout, Duration::from_millis(500));
        assert_eq!(config.log_retention(), 200);
    }
}
