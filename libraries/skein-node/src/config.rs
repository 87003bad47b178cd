use std::{path::PathBuf, time::Duration};

use serde::Deserialize;
use skein_wire::Multiaddr;

use crate::{
    dial_ranker::DialConfig,
    events::OverflowPolicy,
    health::HealthConfig,
    reconnect::ReconnectionPolicy,
    resources::ResourceLimits,
};

/// Which security upgraders to announce, in preference order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityKind {
    Noise,
    /// Testing only: no encryption, unauthenticated identities.
    Plaintext,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub grace_period_ms: u64,
    /// Sweep cadence for trimming and idle collection.
    pub maintenance_interval_ms: u64,
    /// Connections idle longer than this are disconnected; zero disables.
    pub idle_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            high_watermark: 256,
            low_watermark: 192,
            grace_period_ms: 30_000,
            maintenance_interval_ms: 10_000,
            idle_timeout_ms: 0,
        }
    }
}

impl PoolConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms.max(100))
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub buffer: usize,
    pub overflow: OverflowPolicy,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            buffer: 256,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct TraversalConfig {
    pub attempt_timeout_ms: u64,
    pub overall_timeout_ms: u64,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 15_000,
            overall_timeout_ms: 60_000,
        }
    }
}

impl TraversalConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }
}

/// Everything an embedder tunes about a node. All fields default sanely, so
/// `NodeConfig::default()` is a working local-only node.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Addresses to listen on at startup.
    pub listen_addrs: Vec<Multiaddr>,
    /// Security upgraders to announce, in preference order. Empty means
    /// noise only.
    pub security: Vec<SecurityKind>,
    /// Relay endpoints the relay traversal mechanism may route through.
    pub relay_addrs: Vec<Multiaddr>,
    pub pool: PoolConfig,
    pub reconnect: ReconnectionPolicy,
    pub health: HealthConfig,
    pub resources: ResourceLimits,
    pub events: EventConfig,
    pub dial: DialConfig,
    pub traversal: TraversalConfig,
    /// When set, the record store and peer store persist under this
    /// directory.
    pub store_dir: Option<PathBuf>,
}

impl NodeConfig {
    pub fn security_kinds(&self) -> Vec<SecurityKind> {
        if self.security.is_empty() {
            vec![SecurityKind::Noise]
        } else {
            self.security.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_from_sparse_json() {
        let cfg: NodeConfig = serde_json::from_str(
            r#"{
                "listen_addrs": ["/memory/0"],
                "security": ["plaintext"],
                "pool": {"high_watermark": 4, "low_watermark": 2},
                "reconnect": {"max_retries": 7},
                "events": {"overflow": "block"}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.listen_addrs.len(), 1);
        assert_eq!(cfg.security, vec![SecurityKind::Plaintext]);
        assert_eq!(cfg.pool.high_watermark, 4);
        assert_eq!(cfg.pool.low_watermark, 2);
        assert_eq!(cfg.reconnect.max_retries, 7);
        assert_eq!(cfg.events.overflow, OverflowPolicy::Block);
        // untouched sections keep their defaults
        assert_eq!(cfg.health.max_failures, 3);
    }

    #[test]
    fn empty_security_defaults_to_noise() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.security_kinds(), vec![SecurityKind::Noise]);
    }
}
