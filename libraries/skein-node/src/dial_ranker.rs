use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use parking_lot::Mutex;
use serde::Deserialize;
use skein_wire::{Component, Multiaddr};

/// The coarse path classification driving dial ordering and black-hole
/// tracking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PathKind {
    Local,
    IpQuic,
    IpTcp,
    Wrapped,
    Relay,
}

pub fn classify(addr: &Multiaddr) -> PathKind {
    let mut kind = PathKind::IpTcp;
    for component in addr.components() {
        match component {
            Component::P2pCircuit => return PathKind::Relay,
            Component::Memory(_) => return PathKind::Local,
            Component::Ip4(ip) => {
                if ip.is_loopback() || ip.is_private() || ip.is_link_local() {
                    return PathKind::Local;
                }
            }
            Component::Ip6(ip) => {
                if ip.is_loopback() {
                    return PathKind::Local;
                }
            }
            Component::QuicV1 => kind = PathKind::IpQuic,
            Component::Ws => kind = PathKind::Wrapped,
            _ => {}
        }
    }
    kind
}

fn is_ipv6(addr: &Multiaddr) -> bool {
    matches!(addr.components().first(), Some(Component::Ip6(_)))
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct DialConfig {
    pub dial_timeout_ms: u64,
    pub group_delay_ms: u64,
    pub relay_delay_ms: u64,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: 15_000,
            group_delay_ms: 250,
            relay_delay_ms: 2_000,
        }
    }
}

impl DialConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

/// One rank of the dial plan: addresses raced together after a start delay.
#[derive(Debug)]
pub struct DialGroup {
    pub delay: Duration,
    pub addrs: Vec<Multiaddr>,
}

/// Orders candidate addresses into staggered groups: local first and
/// immediately, then QUIC, then TCP, then wrapped transports, with relays
/// last and latest. IPv6 precedes IPv4 within a group. Path kinds the
/// black-hole detector has written off are skipped entirely.
pub fn plan_dials(
    addrs: &[Multiaddr],
    cfg: &DialConfig,
    detector: &BlackHoleDetector,
) -> Vec<DialGroup> {
    let mut buckets: HashMap<PathKind, Vec<Multiaddr>> = HashMap::new();
    for addr in addrs {
        let kind = classify(addr);
        if !detector.allows(kind) {
            tracing::debug!(addr = display(addr), "skipping black-holed path kind");
            continue;
        }
        buckets.entry(kind).or_default().push(addr.clone());
    }

    let group_delay = Duration::from_millis(cfg.group_delay_ms);
    let relay_delay = Duration::from_millis(cfg.relay_delay_ms);
    let order = [
        PathKind::Local,
        PathKind::IpQuic,
        PathKind::IpTcp,
        PathKind::Wrapped,
    ];
    let mut groups: Vec<DialGroup> = vec![];
    for kind in order {
        if let Some(mut addrs) = buckets.remove(&kind) {
            addrs.sort_by_key(|a| !is_ipv6(a));
            groups.push(DialGroup {
                delay: group_delay * groups.len() as u32,
                addrs,
            });
        }
    }
    if let Some(addrs) = buckets.remove(&PathKind::Relay) {
        let staggered = group_delay * groups.len() as u32;
        groups.push(DialGroup {
            delay: relay_delay.max(staggered),
            addrs,
        });
    }
    groups
}

/// Rolling per-path-kind success windows. A path kind whose recent success
/// rate collapses is dropped from ranking until it shows signs of life.
pub struct BlackHoleDetector {
    windows: Mutex<HashMap<PathKind, VecDeque<bool>>>,
    window_size: usize,
    min_samples: usize,
    threshold: f64,
}

impl Default for BlackHoleDetector {
    fn default() -> Self {
        Self::new(100, 10, 0.05)
    }
}

impl BlackHoleDetector {
    pub fn new(window_size: usize, min_samples: usize, threshold: f64) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            window_size,
            min_samples,
            threshold,
        }
    }

    pub fn record(&self, kind: PathKind, succeeded: bool) {
        let mut windows = self.windows.lock();
        let window = windows.entry(kind).or_default();
        window.push_back(succeeded);
        while window.len() > self.window_size {
            window.pop_front();
        }
    }

    pub fn allows(&self, kind: PathKind) -> bool {
        let windows = self.windows.lock();
        let Some(window) = windows.get(&kind) else {
            return true;
        };
        if window.len() < self.min_samples {
            return true;
        }
        let successes = window.iter().filter(|ok| **ok).count();
        successes as f64 / window.len() as f64 >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let cases: [(&str, PathKind); 6] = [
            ("/ip4/127.0.0.1/tcp/1", PathKind::Local),
            ("/memory/3", PathKind::Local),
            ("/ip4/8.8.8.8/tcp/4001", PathKind::IpTcp),
            ("/ip6/2001:db8::1/udp/4001/quic-v1", PathKind::IpQuic),
            ("/ip4/8.8.8.8/tcp/4001/ws", PathKind::Wrapped),
            ("/ip4/9.9.9.9/tcp/4001/p2p-circuit", PathKind::Relay),
        ];
        for (addr, kind) in cases {
            assert_eq!(classify(&addr.parse().unwrap()), kind, "{addr}");
        }
    }

    #[test]
    fn plan_orders_and_staggers() {
        let addrs: Vec<Multiaddr> = [
            "/ip4/9.9.9.9/tcp/1/p2p-circuit",
            "/ip4/8.8.8.8/tcp/1",
            "/ip6/2001:db8::1/tcp/1",
            "/ip4/8.8.8.8/udp/1/quic-v1",
            "/ip4/127.0.0.1/tcp/1",
        ]
        .iter()
        .map(|a| a.parse().unwrap())
        .collect();
        let cfg = DialConfig::default();
        let plan = plan_dials(&addrs, &cfg, &BlackHoleDetector::default());

        assert_eq!(plan.len(), 4);
        // local leads with zero delay
        assert_eq!(plan[0].delay, Duration::ZERO);
        assert_eq!(classify(&plan[0].addrs[0]), PathKind::Local);
        // quic before tcp, v6 before v4 within tcp
        assert_eq!(classify(&plan[1].addrs[0]), PathKind::IpQuic);
        assert_eq!(classify(&plan[2].addrs[0]), PathKind::IpTcp);
        assert!(is_ipv6(&plan[2].addrs[0]));
        // relay trails with the bigger delay
        assert_eq!(classify(&plan[3].addrs[0]), PathKind::Relay);
        assert_eq!(plan[3].delay, Duration::from_millis(cfg.relay_delay_ms));
        // delays are non-decreasing
        for pair in plan.windows(2) {
            assert!(pair[0].delay <= pair[1].delay);
        }
    }

    #[test]
    fn black_hole_suppression_and_recovery() {
        let detector = BlackHoleDetector::new(20, 10, 0.2);
        assert!(detector.allows(PathKind::IpQuic));
        for _ in 0..15 {
            detector.record(PathKind::IpQuic, false);
        }
        assert!(!detector.allows(PathKind::IpQuic));
        // other kinds are unaffected
        assert!(detector.allows(PathKind::IpTcp));
        // fresh successes push the window back over the threshold
        for _ in 0..10 {
            detector.record(PathKind::IpQuic, true);
        }
        assert!(detector.allows(PathKind::IpQuic));
    }

    #[test]
    fn suppressed_kind_leaves_the_plan() {
        let detector = BlackHoleDetector::new(20, 10, 0.2);
        for _ in 0..15 {
            detector.record(PathKind::IpTcp, false);
        }
        let addrs: Vec<Multiaddr> = ["/ip4/8.8.8.8/tcp/1", "/ip4/8.8.8.8/udp/1/quic-v1"]
            .iter()
            .map(|a| a.parse().unwrap())
            .collect();
        let plan = plan_dials(&addrs, &DialConfig::default(), &detector);
        assert_eq!(plan.len(), 1);
        assert_eq!(classify(&plan[0].addrs[0]), PathKind::IpQuic);
    }
}
