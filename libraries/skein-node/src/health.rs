use std::{collections::HashMap, sync::Arc, time::Duration};

use async_io::Timer;
use async_task::Task;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use skein_wire::PeerId;
use smol_timeout2::TimeoutExt;

/// The liveness probe a health monitor runs against a peer. The node injects
/// one that opens a throwaway stream on the peer's mux.
#[async_trait]
pub trait Pinger: Send + Sync + 'static {
    async fn ping(&self, peer: PeerId) -> anyhow::Result<Duration>;
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub max_failures: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            timeout_ms: 5_000,
            max_failures: 3,
        }
    }
}

/// One logical monitor per watched peer: probe each interval, clear the
/// failure counter on success, and report the peer once failures accumulate
/// past the limit. The consumer treats a report like a forced disconnect.
pub struct HealthMonitor {
    cfg: HealthConfig,
    pinger: Arc<dyn Pinger>,
    report: async_channel::Sender<PeerId>,
    watchers: Mutex<HashMap<PeerId, Task<()>>>,
}

impl HealthMonitor {
    pub fn new(cfg: HealthConfig, pinger: Arc<dyn Pinger>) -> (Self, async_channel::Receiver<PeerId>) {
        let (report, failures) = async_channel::unbounded();
        (
            Self {
                cfg,
                pinger,
                report,
                watchers: Mutex::new(HashMap::new()),
            },
            failures,
        )
    }

    pub fn watch(&self, peer: PeerId) {
        if !self.cfg.enabled {
            return;
        }
        let cfg = self.cfg;
        let pinger = self.pinger.clone();
        let report = self.report.clone();
        let task = smolscale::spawn(async move {
            let interval = Duration::from_millis(cfg.interval_ms);
            let timeout = Duration::from_millis(cfg.timeout_ms);
            let mut failures = 0u32;
            loop {
                Timer::after(interval).await;
                let outcome = pinger.ping(peer).timeout(timeout).await;
                match outcome {
                    Some(Ok(rtt)) => {
                        tracing::trace!(peer = display(peer), rtt = debug(rtt), "health probe ok");
                        failures = 0;
                    }
                    Some(Err(err)) => {
                        failures += 1;
                        tracing::debug!(
                            peer = display(peer),
                            failures,
                            err = debug(err),
                            "health probe failed"
                        );
                    }
                    None => {
                        failures += 1;
                        tracing::debug!(peer = display(peer), failures, "health probe timed out");
                    }
                }
                if failures >= cfg.max_failures {
                    let _ = report.send(peer).await;
                    return;
                }
            }
        });
        self.watchers.lock().insert(peer, task);
    }

    pub fn unwatch(&self, peer: &PeerId) {
        self.watchers.lock().remove(peer);
    }

    pub fn unwatch_all(&self) {
        self.watchers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyPinger {
        fail_after: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Pinger for FlakyPinger {
        async fn ping(&self, _peer: PeerId) -> anyhow::Result<Duration> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_after {
                Ok(Duration::from_millis(1))
            } else {
                anyhow::bail!("peer stopped answering")
            }
        }
    }

    #[test]
    fn reports_after_max_failures() {
        smolscale::block_on(async {
            let cfg = HealthConfig {
                enabled: true,
                interval_ms: 5,
                timeout_ms: 50,
                max_failures: 3,
            };
            let pinger = Arc::new(FlakyPinger {
                fail_after: 2,
                calls: AtomicU32::new(0),
            });
            let (monitor, failures) = HealthMonitor::new(cfg, pinger);
            let peer = skein_wire::KeyPair::from_seed([5; 32]).peer_id();
            monitor.watch(peer);
            assert_eq!(failures.recv().await.unwrap(), peer);
        })
    }

    #[test]
    fn unwatch_cancels_probing() {
        smolscale::block_on(async {
            let cfg = HealthConfig {
                enabled: true,
                interval_ms: 5,
                timeout_ms: 50,
                max_failures: 1,
            };
            let pinger = Arc::new(FlakyPinger {
                fail_after: 0,
                calls: AtomicU32::new(0),
            });
            let (monitor, failures) = HealthMonitor::new(cfg, pinger);
            let peer = skein_wire::KeyPair::from_seed([6; 32]).peer_id();
            monitor.watch(peer);
            monitor.unwatch(&peer);
            // the watcher task is gone; nothing ever lands on the channel
            assert!(
                failures
                    .recv()
                    .timeout(Duration::from_millis(100))
                    .await
                    .is_none()
            );
        })
    }
}
