pub mod config;
pub mod dial_ranker;
pub mod errors;
pub mod events;
pub mod gater;
pub mod health;
pub mod peer_store;
pub mod pool;
pub mod reconnect;
pub mod resources;
pub mod store;
pub mod swarm;
pub mod traversal;
pub mod upgrade;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use async_task::Task;
use async_trait::async_trait;
use braidmux::MuxConfig;
use cordage::{Transport, memory::MemoryTransport, tcp::TcpTransport};
use parking_lot::Mutex;
use skein_secure::{NoiseUpgrader, PlaintextUpgrader, SecurityUpgrader};
use skein_wire::{KeyPair, Multiaddr, PeerId};

pub use config::{NodeConfig, SecurityKind};
pub use errors::{DisconnectReason, ErrorCategory, NodeError};
pub use events::{NodeEvent, OverflowPolicy};
pub use gater::{AllowAll, ConnectionGater, GateStage};
pub use pool::{ConnectionPool, Direction, ManagedConnection, TrimReport};
pub use resources::{ResourceManager, ResourceSnapshot, ResourceTrackedStream};
pub use swarm::{InboundStreamHandler, StreamCtx, Swarm};

use crate::{
    events::EventBus,
    health::{HealthConfig, HealthMonitor, Pinger},
    peer_store::PeerStore,
    store::RecordStore,
    swarm::SwarmDialer,
    traversal::{
        DirectMechanism, HintProvider, HolePunchMechanism, LocalDirectMechanism, RelayMechanism,
        RendezvousService, TraversalCandidate, TraversalContext, TraversalCoordinator,
        TraversalMechanism,
    },
    upgrade::Upgrader,
};

/// A component that serves one or more protocols over inbound streams.
#[async_trait]
pub trait StreamService: Send + Sync + 'static {
    fn protocols(&self) -> Vec<String>;

    async fn handle_stream(&self, ctx: StreamCtx);
}

/// A component that wants to know about peer lifecycle transitions.
pub trait PeerObserver: Send + Sync + 'static {
    fn peer_connected(&self, peer: PeerId);

    fn peer_disconnected(&self, peer: PeerId, reason: &DisconnectReason);
}

/// A component that can produce candidate addresses for a peer.
#[async_trait]
pub trait DiscoveryBehaviour: Send + Sync + 'static {
    async fn candidate_addresses(&self, peer: PeerId) -> Vec<Multiaddr>;
}

struct ServiceAdapter(Arc<dyn StreamService>);

#[async_trait]
impl InboundStreamHandler for ServiceAdapter {
    async fn handle(&self, ctx: StreamCtx) {
        self.0.handle_stream(ctx).await;
    }
}

/// Bridges attached discovery behaviours into traversal hints for the
/// direct mechanism.
struct DiscoveryHints {
    behaviours: Arc<Mutex<Vec<Arc<dyn DiscoveryBehaviour>>>>,
}

#[async_trait]
impl HintProvider for DiscoveryHints {
    async fn hints(&self, ctx: &TraversalContext) -> Vec<TraversalCandidate> {
        let behaviours = self.behaviours.lock().clone();
        let mut hints = vec![];
        for behaviour in behaviours {
            for addr in behaviour.candidate_addresses(ctx.target).await {
                let mut candidate = TraversalCandidate {
                    mechanism_id: "direct".into(),
                    peer: ctx.target,
                    path_kind: dial_ranker::classify(&addr),
                    score: 30,
                    address: Some(addr),
                    metadata: Default::default(),
                };
                candidate
                    .metadata
                    .insert("source".into(), "discovery".into());
                hints.push(candidate);
            }
        }
        hints
    }
}

/// Probes a peer by opening and closing a throwaway stream on its mux.
struct MuxPinger {
    pool: Arc<ConnectionPool>,
}

#[async_trait]
impl Pinger for MuxPinger {
    async fn ping(&self, peer: PeerId) -> anyhow::Result<Duration> {
        let conn = self
            .pool
            .connection(&peer)
            .ok_or_else(|| anyhow::anyhow!("no live connection to probe"))?;
        let start = Instant::now();
        let stream = conn
            .mux
            .open()
            .await
            .map_err(|e| anyhow::anyhow!("probe stream failed: {e}"))?;
        drop(stream);
        Ok(start.elapsed())
    }
}

struct NodeInner {
    cfg: NodeConfig,
    local_peer: PeerId,
    swarm: Arc<Swarm>,
    pool: Arc<ConnectionPool>,
    resources: Arc<ResourceManager>,
    events: Arc<EventBus>,
    peer_store: Arc<PeerStore>,
    health: Arc<HealthMonitor>,
    health_failures: async_channel::Receiver<PeerId>,
    traversal: Mutex<Option<Arc<TraversalCoordinator>>>,
    rendezvous: Mutex<Option<Arc<dyn RendezvousService>>>,
    stream_services: Mutex<Vec<Arc<dyn StreamService>>>,
    peer_observers: Mutex<Vec<Arc<dyn PeerObserver>>>,
    discovery: Arc<Mutex<Vec<Arc<dyn DiscoveryBehaviour>>>>,
    running: AtomicBool,
    bg_tasks: Mutex<Vec<Task<()>>>,
}

/// The public face of the stack: one identity, one pool, one swarm, one
/// event stream. Embedders drive everything through this.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(cfg: NodeConfig, keypair: KeyPair) -> anyhow::Result<Self> {
        Self::with_gater(cfg, keypair, Arc::new(AllowAll))
    }

    pub fn with_gater(
        cfg: NodeConfig,
        keypair: KeyPair,
        gater: Arc<dyn ConnectionGater>,
    ) -> anyhow::Result<Self> {
        let local_peer = keypair.peer_id();
        let record_store = match &cfg.store_dir {
            Some(dir) => Some(Arc::new(RecordStore::open(dir)?)),
            None => None,
        };
        let peer_store = Arc::new(PeerStore::new(record_store));
        let events = Arc::new(EventBus::new(cfg.events.buffer, cfg.events.overflow));
        let resources = Arc::new(ResourceManager::new(cfg.resources.clone()));
        let pool = Arc::new(ConnectionPool::new(cfg.pool.clone()));

        let security: Vec<Arc<dyn SecurityUpgrader>> = cfg
            .security_kinds()
            .into_iter()
            .map(|kind| -> Arc<dyn SecurityUpgrader> {
                match kind {
                    SecurityKind::Noise => Arc::new(NoiseUpgrader::new(keypair.clone())),
                    SecurityKind::Plaintext => Arc::new(PlaintextUpgrader::new(keypair.clone())),
                }
            })
            .collect();
        let upgrader = Arc::new(Upgrader::new(security, MuxConfig::default(), gater.clone()));

        let transports: Vec<Arc<dyn Transport>> =
            vec![Arc::new(MemoryTransport), Arc::new(TcpTransport)];
        let swarm = Swarm::new(
            local_peer,
            transports,
            upgrader,
            pool.clone(),
            gater,
            resources.clone(),
            events.clone(),
            cfg.dial,
            cfg.pool.clone(),
            cfg.reconnect,
        );

        let (health, health_failures) = HealthMonitor::new(
            cfg.health,
            Arc::new(MuxPinger { pool: pool.clone() }),
        );

        Ok(Self {
            inner: Arc::new(NodeInner {
                local_peer,
                swarm,
                pool,
                resources,
                events,
                peer_store,
                health: Arc::new(health),
                health_failures,
                traversal: Mutex::new(None),
                rendezvous: Mutex::new(None),
                stream_services: Mutex::new(vec![]),
                peer_observers: Mutex::new(vec![]),
                discovery: Arc::new(Mutex::new(vec![])),
                running: AtomicBool::new(false),
                bg_tasks: Mutex::new(vec![]),
                cfg,
            }),
        })
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local_peer
    }

    /// Attach a service before `start`. Services attached later only take
    /// effect on the next start.
    pub fn attach_service(&self, service: Arc<dyn StreamService>) {
        self.inner.stream_services.lock().push(service);
    }

    pub fn attach_observer(&self, observer: Arc<dyn PeerObserver>) {
        self.inner.peer_observers.lock().push(observer);
    }

    pub fn attach_discovery(&self, behaviour: Arc<dyn DiscoveryBehaviour>) {
        self.inner.discovery.lock().push(behaviour);
    }

    pub fn set_rendezvous(&self, rendezvous: Arc<dyn RendezvousService>) {
        self.inner.rendezvous.lock().replace(rendezvous);
    }

    /// Brings the node up: listeners, services, traversal, supervision.
    pub async fn start(&self) -> anyhow::Result<()> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for service in inner.stream_services.lock().clone() {
            for protocol in service.protocols() {
                inner
                    .swarm
                    .register_handler(protocol, Arc::new(ServiceAdapter(service.clone())));
            }
        }

        for addr in &inner.cfg.listen_addrs {
            if let Err(err) = inner.swarm.listen(addr).await {
                inner
                    .events
                    .emit(NodeEvent::ListenError(addr.clone(), err.to_string()))
                    .await;
            }
        }

        // the ordered mechanism pipeline, local first, relays last
        let dialer = Arc::new(SwarmDialer(inner.swarm.clone()));
        let mut mechanisms: Vec<Arc<dyn TraversalMechanism>> = vec![
            Arc::new(LocalDirectMechanism {
                dialer: dialer.clone(),
            }),
            Arc::new(DirectMechanism {
                dialer: dialer.clone(),
            }),
        ];
        if let Some(rendezvous) = inner.rendezvous.lock().clone() {
            mechanisms.push(Arc::new(HolePunchMechanism {
                dialer: dialer.clone(),
                rendezvous,
            }));
        }
        if !inner.cfg.relay_addrs.is_empty() {
            mechanisms.push(Arc::new(RelayMechanism {
                dialer,
                relays: inner.cfg.relay_addrs.clone(),
            }));
        }
        let hints: Vec<Arc<dyn HintProvider>> = vec![Arc::new(DiscoveryHints {
            behaviours: inner.discovery.clone(),
        })];
        inner
            .traversal
            .lock()
            .replace(Arc::new(TraversalCoordinator::new(
                mechanisms,
                hints,
                inner.cfg.traversal,
                inner.events.clone(),
            )));

        let mut tasks = inner.bg_tasks.lock();
        tasks.push(smolscale::spawn(event_pump(Arc::downgrade(inner))));
        tasks.push(smolscale::spawn(health_pump(Arc::downgrade(inner))));
        tasks.push(smolscale::spawn(maintenance_loop(Arc::downgrade(inner))));
        tracing::info!(local = display(inner.local_peer), "node started");
        Ok(())
    }

    /// Tears the node down: background tasks, listeners, every connection.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        inner.bg_tasks.lock().clear();
        inner.health.unwatch_all();
        inner.traversal.lock().take();
        for service in inner.stream_services.lock().iter() {
            for protocol in service.protocols() {
                inner.swarm.unregister_handler(&protocol);
            }
        }
        inner.swarm.shutdown().await;
        tracing::info!(local = display(inner.local_peer), "node shut down");
    }

    fn check_running(&self) -> Result<(), NodeError> {
        if self.inner.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NodeError::NodeNotRunning)
        }
    }

    /// Starts listening on one more address.
    pub async fn listen(&self, addr: &Multiaddr) -> Result<Multiaddr, NodeError> {
        self.check_running()?;
        self.inner.swarm.listen(addr).await
    }

    /// Dials a specific address.
    pub async fn connect(&self, addr: &Multiaddr) -> Result<PeerId, NodeError> {
        self.check_running()?;
        let (_, peer) = self.inner.swarm.connect_addr(addr).await?;
        let (dial_addr, _) = addr.split_peer();
        if !dial_addr.is_empty() {
            self.inner.peer_store.add_address(peer, dial_addr);
        }
        Ok(peer)
    }

    /// Reaches a peer by identity: known addresses through the ranked dialer
    /// first, the full traversal pipeline after that.
    pub async fn connect_peer(&self, peer: PeerId) -> Result<PeerId, NodeError> {
        self.check_running()?;
        if self.inner.pool.is_connected(&peer) {
            return Ok(peer);
        }
        let known = self.inner.peer_store.addresses_of(&peer);
        if !known.is_empty() {
            match self.inner.swarm.dial_ranked(peer, known.clone()).await {
                Ok((_, peer)) => return Ok(peer),
                Err(err) => {
                    tracing::debug!(
                        peer = display(peer),
                        err = debug(&err),
                        "ranked dial failed, falling back to traversal"
                    );
                }
            }
        }
        let coordinator = self
            .inner
            .traversal
            .lock()
            .clone()
            .ok_or(NodeError::NodeNotRunning)?;
        let result = coordinator
            .traverse(TraversalContext {
                target: peer,
                known_addrs: known,
                limited_conn: None,
            })
            .await?;
        Ok(result.connected_peer)
    }

    pub async fn disconnect(&self, peer: PeerId) {
        self.inner.swarm.disconnect(peer).await;
    }

    /// Opens an outbound stream speaking `protocol` to a connected peer.
    pub async fn new_stream(
        &self,
        peer: PeerId,
        protocol: &str,
    ) -> Result<ResourceTrackedStream, NodeError> {
        self.check_running()?;
        self.inner.swarm.new_stream(peer, protocol).await
    }

    /// Registers a bare protocol handler.
    pub fn handle(&self, protocol: impl Into<String>, handler: Arc<dyn InboundStreamHandler>) {
        self.inner.swarm.register_handler(protocol, handler);
    }

    /// A fresh, independent subscription to the node's lifecycle events.
    pub fn events(&self) -> async_channel::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.pool.connected_peers()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.pool.connection_count()
    }

    pub fn trim_report(&self) -> TrimReport {
        self.inner.pool.trim_report()
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.inner.resources
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    pub fn peer_store(&self) -> &Arc<PeerStore> {
        &self.inner.peer_store
    }
}

/// Relays lifecycle events to health monitoring and attached observers.
async fn event_pump(weak: std::sync::Weak<NodeInner>) {
    let Some(recv) = weak.upgrade().map(|inner| inner.events.subscribe()) else {
        return;
    };
    while let Ok(event) = recv.recv().await {
        let Some(inner) = weak.upgrade() else { return };
        match &event {
            NodeEvent::PeerConnected(peer) => {
                inner.health.watch(*peer);
                for observer in inner.peer_observers.lock().clone() {
                    observer.peer_connected(*peer);
                }
            }
            NodeEvent::PeerDisconnected(peer, reason) => {
                if !inner.pool.is_connected(peer) {
                    inner.health.unwatch(peer);
                }
                for observer in inner.peer_observers.lock().clone() {
                    observer.peer_disconnected(*peer, reason);
                }
            }
            _ => {}
        }
    }
}

/// Turns health-monitor verdicts into forced disconnects.
async fn health_pump(weak: std::sync::Weak<NodeInner>) {
    let Some(failures) = weak.upgrade().map(|inner| inner.health_failures.clone()) else {
        return;
    };
    while let Ok(peer) = failures.recv().await {
        let Some(inner) = weak.upgrade() else { return };
        inner.swarm.force_disconnect_unhealthy(peer).await;
    }
}

/// Periodic pool maintenance: trimming, idle sweeping, peer-store GC.
async fn maintenance_loop(weak: std::sync::Weak<NodeInner>) {
    let Some(interval) = weak
        .upgrade()
        .map(|inner| inner.cfg.pool.maintenance_interval())
    else {
        return;
    };
    loop {
        async_io::Timer::after(interval).await;
        let Some(inner) = weak.upgrade() else { return };
        inner.swarm.trim_now().await;
        inner.swarm.sweep_idle().await;
        inner.peer_store.gc(Duration::from_secs(24 * 3600));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{AsyncReadExt, AsyncWriteExt};
    use skein_wire::Component;

    fn test_config(listen: Option<&str>) -> NodeConfig {
        NodeConfig {
            listen_addrs: listen.iter().map(|a| a.parse().unwrap()).collect(),
            security: vec![SecurityKind::Plaintext],
            health: HealthConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    struct EchoService {
        served: async_channel::Sender<PeerId>,
    }

    #[async_trait]
    impl StreamService for EchoService {
        fn protocols(&self) -> Vec<String> {
            vec!["/echo/1.0.0".to_string()]
        }

        async fn handle_stream(&self, mut ctx: StreamCtx) {
            let _ = self.served.send(ctx.peer).await;
            let mut buf = [0u8; 3];
            if ctx.stream.read_exact(&mut buf).await.is_ok() {
                let _ = ctx.stream.write_all(&buf).await;
                let _ = ctx.stream.flush().await;
                let _ = ctx.stream.close().await;
            }
        }
    }

    fn memory_id(addr: &Multiaddr) -> u64 {
        match addr.components() {
            [Component::Memory(id), ..] => *id,
            _ => panic!("not a memory addr"),
        }
    }

    async fn echo_server() -> (Node, Multiaddr, async_channel::Receiver<PeerId>) {
        let server = Node::new(test_config(Some("/memory/0")), KeyPair::generate()).unwrap();
        let (served_tx, served_rx) = async_channel::unbounded();
        server.attach_service(Arc::new(EchoService { served: served_tx }));
        let server_events = server.events();
        server.start().await.unwrap();
        let listen_addr = loop {
            match server_events.recv().await.unwrap() {
                NodeEvent::NewListenAddr(addr) => break addr,
                _ => continue,
            }
        };
        let full = listen_addr.encapsulate(&vec![Component::P2p(server.local_peer())].into());
        (server, full, served_rx)
    }

    #[tracing_test::traced_test]
    #[test]
    fn s1_echo_over_memory() {
        smolscale::block_on(async {
            let (server, server_addr, served) = echo_server().await;
            let server_events = server.events();

            let client = Node::new(test_config(None), KeyPair::generate()).unwrap();
            client.start().await.unwrap();

            let peer = client.connect(&server_addr).await.unwrap();
            assert_eq!(peer, server_addr.peer_id().unwrap());

            let mut stream = client.new_stream(peer, "/echo/1.0.0").await.unwrap();
            stream.write_all(&[0x01, 0x02, 0x03]).await.unwrap();
            stream.flush().await.unwrap();
            let mut reply = [0u8; 3];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply, [0x01, 0x02, 0x03]);

            // the server observed the client connecting before the handler ran
            let client_peer = client.local_peer();
            let mut saw_connected = false;
            loop {
                match server_events.recv().await.unwrap() {
                    NodeEvent::PeerConnected(p) if p == client_peer => {
                        saw_connected = true;
                        break;
                    }
                    _ => continue,
                }
            }
            assert!(saw_connected);
            assert_eq!(served.recv().await.unwrap(), client_peer);

            client.shutdown().await;
            server.shutdown().await;
        })
    }

    #[test]
    fn s6_concurrent_dials_join() {
        smolscale::block_on(async {
            let (server, server_addr, _served) = echo_server().await;
            let (dial_addr, _) = server_addr.split_peer();
            let hub_id = memory_id(&dial_addr);

            let client = Node::new(test_config(None), KeyPair::generate()).unwrap();
            client.start().await.unwrap();

            let dials_before = cordage::memory::dial_count(hub_id);
            let mut joiners = vec![];
            for _ in 0..50 {
                let client = client.clone();
                let addr = server_addr.clone();
                joiners.push(smolscale::spawn(async move {
                    client.connect(&addr).await
                }));
            }
            let mut peers = vec![];
            for joiner in joiners {
                peers.push(joiner.await.unwrap());
            }
            let expected = server_addr.peer_id().unwrap();
            assert!(peers.iter().all(|p| *p == expected));
            assert_eq!(cordage::memory::dial_count(hub_id) - dials_before, 1);
            assert_eq!(client.connection_count(), 1);

            client.shutdown().await;
            server.shutdown().await;
        })
    }

    #[test]
    fn gated_dial_is_refused() {
        smolscale::block_on(async {
            let (server, server_addr, _served) = echo_server().await;
            let denied = server_addr.peer_id().unwrap();
            let gater = Arc::new(gater::DenyPeers {
                denied: [denied].into_iter().collect(),
            });
            let client =
                Node::with_gater(test_config(None), KeyPair::generate(), gater).unwrap();
            client.start().await.unwrap();
            let client_events = client.events();

            let err = client.connect(&server_addr).await.unwrap_err();
            assert!(matches!(err, NodeError::ConnectionGated(GateStage::Dial)));
            loop {
                match client_events.recv().await.unwrap() {
                    NodeEvent::ConnectionGated(peer, _, GateStage::Dial) => {
                        assert_eq!(peer, Some(denied));
                        break;
                    }
                    _ => continue,
                }
            }

            client.shutdown().await;
            server.shutdown().await;
        })
    }

    #[test]
    fn connect_peer_uses_stored_addresses() {
        smolscale::block_on(async {
            let (server, server_addr, _served) = echo_server().await;
            let peer = server_addr.peer_id().unwrap();
            let (dial_addr, _) = server_addr.split_peer();

            let client = Node::new(test_config(None), KeyPair::generate()).unwrap();
            client.start().await.unwrap();
            client.peer_store().add_address(peer, dial_addr);

            assert_eq!(client.connect_peer(peer).await.unwrap(), peer);
            assert!(client.connected_peers().contains(&peer));

            client.shutdown().await;
            server.shutdown().await;
        })
    }

    #[test]
    fn remote_close_triggers_reconnect() {
        smolscale::block_on(async {
            let (server, server_addr, _served) = echo_server().await;
            let mut cfg = test_config(None);
            cfg.reconnect = reconnect::ReconnectionPolicy {
                enabled: true,
                max_retries: 5,
                backoff: reconnect::BackoffStrategy::Constant { delay_ms: 20 },
                jitter: 0.0,
                reset_threshold_ms: 60_000,
            };
            let client = Node::new(cfg, KeyPair::generate()).unwrap();
            client.start().await.unwrap();
            let client_events = client.events();

            let peer = client.connect(&server_addr).await.unwrap();
            // the server kicks us; the client should come back on its own
            server.disconnect(client.local_peer()).await;

            let mut saw_reconnecting = false;
            loop {
                match client_events.recv().await.unwrap() {
                    NodeEvent::Reconnecting { peer: p, .. } if p == peer => {
                        saw_reconnecting = true;
                    }
                    NodeEvent::Reconnected { peer: p, .. } if p == peer => break,
                    _ => continue,
                }
            }
            assert!(saw_reconnecting);
            assert!(client.connected_peers().contains(&peer));

            client.shutdown().await;
            server.shutdown().await;
        })
    }
}
