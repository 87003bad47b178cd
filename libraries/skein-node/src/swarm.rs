use std::{
    sync::{Arc, Weak},
    time::Instant,
};

use async_task::Task;
use async_trait::async_trait;
use braidmux::GOAWAY_NORMAL;
use cordage::{RawConn, Transport};
use dashmap::DashMap;
use futures_util::{FutureExt, StreamExt, stream::FuturesUnordered};
use parking_lot::Mutex;
use skein_secure::Role;
use skein_select::{SelectError, negotiate_inbound, negotiate_outbound};
use skein_wire::{Multiaddr, PeerId};
use smol_timeout2::TimeoutExt;
use smolscale::reaper::TaskReaper;

use crate::{
    config::PoolConfig,
    dial_ranker::{BlackHoleDetector, DialConfig, classify, plan_dials},
    errors::{DisconnectReason, ErrorCategory, NodeError},
    events::{EventBus, NodeEvent},
    gater::{ConnectionGater, GateStage},
    pool::{ConnId, ConnState, ConnectionPool, Direction, PendingDial},
    reconnect::ReconnectionPolicy,
    resources::{ResourceManager, ResourceTrackedStream},
    traversal::CandidateDialer,
    upgrade::{UpgradedConn, Upgrader},
};

/// What an inbound stream handler receives: the authenticated peer, the
/// negotiated protocol, and the stream itself with its resource reservations
/// attached.
pub struct StreamCtx {
    pub peer: PeerId,
    pub protocol: String,
    pub stream: ResourceTrackedStream,
}

#[async_trait]
pub trait InboundStreamHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: StreamCtx);
}

/// The dial/accept core: executes upgrades in both directions, deduplicates
/// concurrent dials to one peer, supervises live connections, and schedules
/// reconnects.
pub struct Swarm {
    local_peer: PeerId,
    transports: Vec<Arc<dyn Transport>>,
    upgrader: Arc<Upgrader>,
    pool: Arc<ConnectionPool>,
    gater: Arc<dyn ConnectionGater>,
    resources: Arc<ResourceManager>,
    events: Arc<EventBus>,
    handlers: DashMap<String, Arc<dyn InboundStreamHandler>>,
    detector: Arc<BlackHoleDetector>,
    dial_cfg: DialConfig,
    pool_cfg: PoolConfig,
    reconnect_policy: ReconnectionPolicy,
    listener_tasks: Mutex<Vec<(Multiaddr, Task<()>)>>,
    monitor_tasks: DashMap<ConnId, Task<()>>,
    stream_reaper: TaskReaper<()>,
}

impl Swarm {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_peer: PeerId,
        transports: Vec<Arc<dyn Transport>>,
        upgrader: Arc<Upgrader>,
        pool: Arc<ConnectionPool>,
        gater: Arc<dyn ConnectionGater>,
        resources: Arc<ResourceManager>,
        events: Arc<EventBus>,
        dial_cfg: DialConfig,
        pool_cfg: PoolConfig,
        reconnect_policy: ReconnectionPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_peer,
            transports,
            upgrader,
            pool,
            gater,
            resources,
            events,
            handlers: DashMap::new(),
            detector: Arc::new(BlackHoleDetector::default()),
            dial_cfg,
            pool_cfg,
            reconnect_policy,
            listener_tasks: Mutex::new(vec![]),
            monitor_tasks: DashMap::new(),
            stream_reaper: TaskReaper::new(),
        })
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn detector(&self) -> &Arc<BlackHoleDetector> {
        &self.detector
    }

    pub fn register_handler(&self, protocol: impl Into<String>, handler: Arc<dyn InboundStreamHandler>) {
        self.handlers.insert(protocol.into(), handler);
    }

    pub fn unregister_handler(&self, protocol: &str) {
        self.handlers.remove(protocol);
    }

    /// Installs a supervision task for a connection. A replaced task (the
    /// reconnect loop finishing its own job, say) is detached rather than
    /// cancelled so it can run to its natural end.
    fn park_monitor(&self, id: ConnId, task: Task<()>) {
        if let Some(old) = self.monitor_tasks.insert(id, task) {
            old.detach();
        }
    }

    /// Forgets a supervision task without cancelling it. Used from within
    /// the task itself, where a plain remove would self-cancel.
    fn release_monitor(&self, id: ConnId) {
        if let Some((_, task)) = self.monitor_tasks.remove(&id) {
            task.detach();
        }
    }

    fn transport_for_dial(&self, addr: &Multiaddr) -> Result<Arc<dyn Transport>, NodeError> {
        self.transports
            .iter()
            .find(|t| t.can_dial(addr))
            .cloned()
            .ok_or(NodeError::NoSuitableTransport)
    }

    /// Dials one address, joining any dial already in flight toward the same
    /// peer: N concurrent connects produce one transport dial and N copies
    /// of its outcome.
    pub async fn connect_addr(
        self: &Arc<Self>,
        addr: &Multiaddr,
    ) -> Result<(ConnId, PeerId), NodeError> {
        let (dial_addr, peer_hint) = addr.split_peer();
        if !self.gater.intercept_dial(peer_hint, addr) {
            self.events
                .emit(NodeEvent::ConnectionGated(peer_hint, addr.clone(), GateStage::Dial))
                .await;
            return Err(NodeError::ConnectionGated(GateStage::Dial));
        }
        match peer_hint {
            Some(peer) => {
                if let Some(existing) = self.connected_id(&peer) {
                    return Ok((existing, peer));
                }
                self.join_or_dial(peer, dial_addr).await
            }
            None => self.perform_dial(None, &dial_addr).await,
        }
    }

    fn connected_id(&self, peer: &PeerId) -> Option<ConnId> {
        self.pool
            .connections(peer)
            .into_iter()
            .find(|meta| meta.state == ConnState::Connected)
            .map(|meta| meta.id)
    }

    async fn join_or_dial(
        self: &Arc<Self>,
        peer: PeerId,
        dial_addr: Multiaddr,
    ) -> Result<(ConnId, PeerId), NodeError> {
        let (pending, _created) = self.pool.join_or_register_dial(peer, || {
            let this = self.clone();
            smolscale::spawn(async move {
                let result = this.perform_dial(Some(peer), &dial_addr).await;
                this.pool.remove_pending_dial(&peer);
                result.map_err(Arc::new)
            })
            .shared()
        });
        await_pending(pending).await
    }

    /// The full outbound pipeline for one address.
    async fn perform_dial(
        self: &Arc<Self>,
        expected_peer: Option<PeerId>,
        dial_addr: &Multiaddr,
    ) -> Result<(ConnId, PeerId), NodeError> {
        let transport = self.transport_for_dial(dial_addr)?;
        self.resources
            .reserve_connection(expected_peer, Direction::Outbound)
            .map_err(|err| NodeError::ResourceLimitExceeded {
                scope: err.scope,
                resource: err.resource.to_string(),
            })?;

        let entry_id =
            expected_peer.map(|peer| self.pool.add_connecting(peer, dial_addr.clone(), Direction::Outbound));

        let path_kind = classify(dial_addr);
        let upgraded = async {
            let raw = transport
                .dial(dial_addr)
                .await
                .map_err(NodeError::Transport)?;
            self.upgrader
                .upgrade(raw, Role::Initiator, expected_peer, Direction::Outbound)
                .await
                .map_err(NodeError::Upgrade)
        }
        .timeout(self.dial_cfg.dial_timeout())
        .await
        .unwrap_or(Err(NodeError::DialTimeout));

        match upgraded {
            Ok(upgraded) => {
                self.detector.record(path_kind, true);
                let peer = upgraded.remote_peer;
                let id = self
                    .finalize_outbound(entry_id, expected_peer, peer, dial_addr, upgraded)
                    .await?;
                Ok((id, peer))
            }
            Err(err) => {
                self.detector.record(path_kind, false);
                self.resources
                    .release_connection(expected_peer, Direction::Outbound);
                if let Some(id) = entry_id {
                    self.pool.remove(id);
                }
                self.events
                    .emit(NodeEvent::ConnectionError(expected_peer, err.to_string()))
                    .await;
                Err(err)
            }
        }
    }

    async fn finalize_outbound(
        self: &Arc<Self>,
        entry_id: Option<ConnId>,
        expected_peer: Option<PeerId>,
        peer: PeerId,
        dial_addr: &Multiaddr,
        upgraded: UpgradedConn,
    ) -> Result<ConnId, NodeError> {
        // an anonymous dial learns the peer only now; move the reservation
        if expected_peer.is_none() {
            if let Err(err) = self.resources.adopt_peer(peer, Direction::Outbound) {
                upgraded.mux.close(GOAWAY_NORMAL).await;
                self.resources.release_connection(None, Direction::Outbound);
                return Err(NodeError::ResourceLimitExceeded {
                    scope: err.scope,
                    resource: err.resource.to_string(),
                });
            }
        }
        let conn = Arc::new(upgraded);
        let id = match entry_id {
            Some(id) => {
                self.pool.update_connection(id, conn.clone());
                id
            }
            None => self
                .pool
                .add(conn.clone(), peer, dial_addr.clone(), Direction::Outbound),
        };
        if self.reconnect_policy.enabled {
            self.pool.set_auto_reconnect(peer, Some(dial_addr.clone()));
        }
        self.after_connect(id, peer, conn).await;
        Ok(id)
    }

    /// Everything that happens once a connection (either direction) is live:
    /// trimming, supervision, and the connected event. `peerConnected` is
    /// emitted before the caller can touch the connection, so it always
    /// precedes stream activity on it.
    fn after_connect<'a>(
        self: &'a Arc<Self>,
        id: ConnId,
        peer: PeerId,
        conn: Arc<UpgradedConn>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            self.trim_now().await;
            // the connected event strictly precedes any stream activity, so it
            // goes out before the acceptor starts
            self.events.emit(NodeEvent::PeerConnected(peer)).await;
            let monitor = {
                let weak = Arc::downgrade(self);
                let conn = conn.clone();
                smolscale::spawn(async move {
                    run_connection(weak, id, peer, conn).await;
                })
            };
            self.park_monitor(id, monitor);
        })
    }

    /// Evicts over-watermark connections and reports what happened.
    pub async fn trim_now(self: &Arc<Self>) {
        let report = self.pool.trim_report();
        let victims = self.pool.trim_if_needed();
        for (rank, (meta, conn)) in victims.into_iter().enumerate() {
            self.release_monitor(meta.id);
            self.resources
                .release_connection(Some(meta.peer), meta.direction);
            if let Some(conn) = conn {
                conn.mux.close(GOAWAY_NORMAL).await;
            }
            self.events
                .emit(NodeEvent::Trimmed {
                    peer: meta.peer,
                    trim_rank: rank,
                    tags: meta.tags.len(),
                })
                .await;
            self.events
                .emit(NodeEvent::PeerDisconnected(meta.peer, DisconnectReason::LocalClose))
                .await;
        }
        if report.target > report.trimmable {
            self.events
                .emit(NodeEvent::TrimConstrained {
                    target: report.target,
                    selected: report.selected,
                    trimmable: report.trimmable,
                    active: report.active,
                })
                .await;
        }
    }

    /// The staggered multi-address dialer: classify into path groups, launch
    /// each group after its delay, first success cancels the rest.
    pub async fn dial_ranked(
        self: &Arc<Self>,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
    ) -> Result<(ConnId, PeerId), NodeError> {
        if let Some(existing) = self.connected_id(&peer) {
            return Ok((existing, peer));
        }
        let (pending, _created) = self.pool.join_or_register_dial(peer, || {
            let this = self.clone();
            smolscale::spawn(async move {
                let result = this.race_ranked(peer, addrs).await;
                this.pool.remove_pending_dial(&peer);
                result.map_err(Arc::new)
            })
            .shared()
        });
        await_pending(pending).await
    }

    async fn race_ranked(
        self: &Arc<Self>,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
    ) -> Result<(ConnId, PeerId), NodeError> {
        let groups = plan_dials(&addrs, &self.dial_cfg, &self.detector);
        if groups.is_empty() {
            return Err(NodeError::AllDialsFailed);
        }
        let mut in_flight = FuturesUnordered::new();
        for group in groups {
            for addr in group.addrs {
                let this = self.clone();
                let delay = group.delay;
                in_flight.push(smolscale::spawn(async move {
                    if !delay.is_zero() {
                        async_io::Timer::after(delay).await;
                    }
                    this.perform_dial(Some(peer), &addr).await
                }));
            }
        }
        let mut last_err = None;
        while let Some(outcome) = in_flight.next().await {
            match outcome {
                Ok(done) => return Ok(done),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or(NodeError::AllDialsFailed))
    }

    /// Binds a listener and runs its accept loop until shutdown.
    pub async fn listen(self: &Arc<Self>, addr: &Multiaddr) -> Result<Multiaddr, NodeError> {
        let transport = self
            .transports
            .iter()
            .find(|t| t.can_listen(addr))
            .cloned()
            .ok_or(NodeError::NoSuitableTransport)?;
        let mut listener = transport.listen(addr).await?;
        let bound = listener.local_addr();
        self.events
            .emit(NodeEvent::NewListenAddr(bound.clone()))
            .await;

        let weak = Arc::downgrade(self);
        let loop_addr = bound.clone();
        let task = smolscale::spawn(async move {
            loop {
                let accepted = listener.accept().await;
                let Some(this) = weak.upgrade() else {
                    return;
                };
                match accepted {
                    Ok(raw) => this.handle_accepted(raw).await,
                    Err(err) => {
                        this.events
                            .emit(NodeEvent::ListenError(loop_addr.clone(), err.to_string()))
                            .await;
                        listener.close();
                        return;
                    }
                }
            }
        });
        self.listener_tasks.lock().push((bound.clone(), task));
        Ok(bound)
    }

    async fn handle_accepted(self: &Arc<Self>, raw: Box<dyn RawConn>) {
        let remote = raw.remote_addr();
        if !self.gater.intercept_accept(&remote) {
            self.events
                .emit(NodeEvent::ConnectionGated(None, remote, GateStage::Accept))
                .await;
            return;
        }
        // hold an inbound slot before spending any work on the handshake
        if let Err(err) = self.resources.reserve_connection(None, Direction::Inbound) {
            self.events
                .emit(NodeEvent::ConnectionError(None, err.to_string()))
                .await;
            return;
        }
        let this = self.clone();
        self.stream_reaper.attach(smolscale::spawn(async move {
            let upgraded = async {
                this.upgrader
                    .upgrade(raw, Role::Responder, None, Direction::Inbound)
                    .await
                    .map_err(NodeError::Upgrade)
            }
            .timeout(this.dial_cfg.dial_timeout())
            .await
            .unwrap_or(Err(NodeError::DialTimeout));
            match upgraded {
                Ok(upgraded) => {
                    let peer = upgraded.remote_peer;
                    let remote_addr = upgraded.remote_addr.clone();
                    if let Err(err) = this.resources.adopt_peer(peer, Direction::Inbound) {
                        upgraded.mux.close(GOAWAY_NORMAL).await;
                        this.resources.release_connection(None, Direction::Inbound);
                        this.events
                            .emit(NodeEvent::ConnectionError(Some(peer), err.to_string()))
                            .await;
                        return;
                    }
                    let conn = Arc::new(upgraded);
                    let id = this
                        .pool
                        .add(conn.clone(), peer, remote_addr, Direction::Inbound);
                    this.after_connect(id, peer, conn).await;
                }
                Err(err) => {
                    this.resources.release_connection(None, Direction::Inbound);
                    this.events
                        .emit(NodeEvent::ConnectionError(None, err.to_string()))
                        .await;
                }
            }
        }));
    }

    /// Opens a stream to a connected peer and negotiates one protocol on it.
    pub async fn new_stream(
        self: &Arc<Self>,
        peer: PeerId,
        protocol: &str,
    ) -> Result<ResourceTrackedStream, NodeError> {
        let conn = self
            .pool
            .connection(&peer)
            .ok_or(NodeError::NotConnected(peer))?;
        let mut stream = conn.mux.open().await?;
        let negotiated = negotiate_outbound(&mut stream, &[protocol])
            .await
            .map_err(|err| {
                tracing::debug!(peer = display(peer), protocol, err = debug(&err), "stream negotiation failed");
                NodeError::ProtocolNegotiationFailed
            })?;
        if let Err(err) =
            self.resources
                .reserve_stream(peer, protocol, Direction::Outbound, None)
        {
            stream.reset();
            return Err(NodeError::ResourceLimitExceeded {
                scope: err.scope,
                resource: err.resource.to_string(),
            });
        }
        if let Some(id) = self.connected_id(&peer) {
            self.pool.record_activity(id);
        }
        Ok(ResourceTrackedStream::with_residue(
            stream,
            negotiated.residue,
            self.resources.clone(),
            peer,
            protocol.to_string(),
            Direction::Outbound,
            None,
        ))
    }

    /// Deliberate local disconnect: no reconnection, reason `LocalClose`.
    pub async fn disconnect(self: &Arc<Self>, peer: PeerId) {
        self.pool.set_auto_reconnect(peer, None);
        let removed = self.pool.remove_peer(&peer);
        for (meta, conn) in removed {
            self.monitor_tasks.remove(&meta.id);
            if meta.state == ConnState::Connected {
                self.resources
                    .release_connection(Some(peer), meta.direction);
            }
            if let Some(conn) = conn {
                conn.mux.close(GOAWAY_NORMAL).await;
            }
            self.events
                .emit(NodeEvent::PeerDisconnected(peer, DisconnectReason::LocalClose))
                .await;
        }
    }

    /// Treats a failed health probe exactly like a remote disconnect with
    /// reason `HealthCheckFailed`.
    pub async fn force_disconnect_unhealthy(self: &Arc<Self>, peer: PeerId) {
        self.events.emit(NodeEvent::HealthCheckFailed(peer)).await;
        let ids: Vec<ConnId> = self
            .pool
            .connections(&peer)
            .into_iter()
            .filter(|meta| meta.state == ConnState::Connected)
            .map(|meta| meta.id)
            .collect();
        for id in ids {
            self.handle_disconnect(id, peer, DisconnectReason::HealthCheckFailed)
                .await;
        }
    }

    /// Sweeps idle connections, disconnecting them with `IdleTimeout`.
    pub async fn sweep_idle(self: &Arc<Self>) {
        let Some(threshold) = self.pool_cfg.idle_timeout() else {
            return;
        };
        for meta in self.pool.idle_connections(threshold) {
            self.handle_disconnect(meta.id, meta.peer, DisconnectReason::IdleTimeout)
                .await;
        }
    }

    /// The common tail of every involuntary disconnect: detach and close the
    /// connection, emit the event, and decide on reconnection.
    async fn handle_disconnect(
        self: &Arc<Self>,
        id: ConnId,
        peer: PeerId,
        reason: DisconnectReason,
    ) {
        let lived = self.pool.connected_for(id);
        // begin_disconnect refuses unless the entry is still Connected, so
        // racing monitors and sweepers cannot double-handle one death
        let Some((meta, conn)) = self.pool.begin_disconnect(id, reason.clone()) else {
            return;
        };
        // the caller is usually the monitor itself; never self-cancel
        self.release_monitor(id);
        self.resources
            .release_connection(Some(peer), meta.direction);
        if let Some(conn) = conn {
            conn.mux.close(GOAWAY_NORMAL).await;
        }
        self.events
            .emit(NodeEvent::PeerDisconnected(peer, reason.clone()))
            .await;

        // a connection that held up long enough earns a fresh retry budget
        if lived.is_some_and(|lived| lived >= self.reconnect_policy.reset_threshold()) {
            self.pool.reset_retry(id);
        }
        let attempt = self.pool.snapshot(id).map(|m| m.retry_count).unwrap_or(0);
        let reconnect_addr = self.pool.auto_reconnect_addr(&peer);
        match reconnect_addr {
            Some(addr) if self.reconnect_policy.should_reconnect(attempt, &reason) => {
                self.schedule_reconnect(id, peer, addr, attempt).await;
            }
            _ => {
                self.pool.remove(id);
            }
        }
    }

    async fn schedule_reconnect(
        self: &Arc<Self>,
        id: ConnId,
        peer: PeerId,
        addr: Multiaddr,
        first_attempt: u32,
    ) {
        let delay = self.reconnect_policy.next_delay(first_attempt);
        self.pool.update_state(
            id,
            ConnState::Reconnecting {
                attempt: first_attempt,
                next_at: Instant::now() + delay,
            },
        );
        self.events
            .emit(NodeEvent::Reconnecting {
                peer,
                attempt: first_attempt,
                next_delay: delay,
            })
            .await;

        let weak = Arc::downgrade(self);
        let task = smolscale::spawn(async move {
            let mut delay = delay;
            let mut attempt = first_attempt;
            loop {
                async_io::Timer::after(delay).await;
                let Some(this) = weak.upgrade() else {
                    return;
                };
                match this.redial(id, peer, &addr).await {
                    Ok(()) => {
                        this.events
                            .emit(NodeEvent::Reconnected { peer, attempt })
                            .await;
                        return;
                    }
                    Err(err) => {
                        tracing::debug!(
                            peer = display(peer),
                            attempt,
                            err = debug(&err),
                            "reconnect attempt failed"
                        );
                        attempt = this.pool.increment_retry(id);
                        let reason = err.disconnect_reason();
                        if !this.reconnect_policy.should_reconnect(attempt, &reason) {
                            this.pool
                                .update_state(id, ConnState::Failed(reason));
                            this.pool.set_auto_reconnect(peer, None);
                            this.events
                                .emit(NodeEvent::ReconnectionFailed {
                                    peer,
                                    attempts: attempt,
                                })
                                .await;
                            return;
                        }
                        delay = this.reconnect_policy.next_delay(attempt);
                        this.pool.update_state(
                            id,
                            ConnState::Reconnecting {
                                attempt,
                                next_at: Instant::now() + delay,
                            },
                        );
                        this.events
                            .emit(NodeEvent::Reconnecting {
                                peer,
                                attempt,
                                next_delay: delay,
                            })
                            .await;
                    }
                }
                // drop the strong handle before sleeping again
                drop(this);
            }
        });
        self.park_monitor(id, task);
    }

    /// One reconnect redial reusing the existing pool entry.
    async fn redial(self: &Arc<Self>, id: ConnId, peer: PeerId, addr: &Multiaddr) -> Result<(), NodeError> {
        let transport = self.transport_for_dial(addr)?;
        self.resources
            .reserve_connection(Some(peer), Direction::Outbound)
            .map_err(|err| NodeError::ResourceLimitExceeded {
                scope: err.scope,
                resource: err.resource.to_string(),
            })?;
        let result = async {
            let raw = transport.dial(addr).await.map_err(NodeError::Transport)?;
            self.upgrader
                .upgrade(raw, Role::Initiator, Some(peer), Direction::Outbound)
                .await
                .map_err(NodeError::Upgrade)
        }
        .timeout(self.dial_cfg.dial_timeout())
        .await
        .unwrap_or(Err(NodeError::DialTimeout));
        match result {
            Ok(upgraded) => {
                let conn = Arc::new(upgraded);
                self.pool.update_connection(id, conn.clone());
                self.after_connect(id, peer, conn).await;
                Ok(())
            }
            Err(err) => {
                self.resources
                    .release_connection(Some(peer), Direction::Outbound);
                Err(err)
            }
        }
    }

    /// Orderly teardown: stop listening, stop supervising, close everything.
    pub async fn shutdown(self: &Arc<Self>) {
        for (_, task) in self.listener_tasks.lock().drain(..) {
            drop(task);
        }
        self.monitor_tasks.clear();
        let peers = self.pool.connected_peers();
        for peer in peers {
            self.disconnect(peer).await;
        }
        // entries stuck mid-dial or mid-reconnect just go away
        for meta in self.pool.entries() {
            self.pool.remove(meta.id);
        }
    }
}

async fn await_pending(pending: PendingDial) -> Result<(ConnId, PeerId), NodeError> {
    match pending.await {
        Ok(done) => Ok(done),
        Err(err) => Err(NodeError::Shared(err)),
    }
}

/// Supervises one live connection: serves its inbound streams and turns its
/// death into a disconnect.
async fn run_connection(weak: Weak<Swarm>, id: ConnId, peer: PeerId, conn: Arc<UpgradedConn>) {
    let accept_err = loop {
        match conn.mux.accept().await {
            Ok(stream) => {
                let Some(this) = weak.upgrade() else { return };
                this.pool.record_activity(id);
                let weak_streams = Arc::downgrade(&this);
                this.stream_reaper.attach(smolscale::spawn(async move {
                    serve_inbound_stream(weak_streams, peer, stream).await;
                }));
            }
            Err(err) => break err,
        }
    };
    // a GoAway keeps existing streams alive; give the session a bounded
    // drain window rather than holding the transport open forever
    let reason = match accept_err {
        braidmux::MuxError::GoAway(_) => {
            let _ = conn
                .mux
                .wait_until_dead()
                .timeout(std::time::Duration::from_secs(30))
                .await;
            DisconnectReason::RemoteClose
        }
        braidmux::MuxError::ConnectionClosed => DisconnectReason::RemoteClose,
        braidmux::MuxError::KeepaliveTimeout => DisconnectReason::HealthCheckFailed,
        other => DisconnectReason::error(ErrorCategory::Muxer, other.to_string()),
    };
    let Some(this) = weak.upgrade() else { return };
    this.handle_disconnect(id, peer, reason).await;
}

/// Negotiates and dispatches one inbound stream against the registered
/// handlers.
async fn serve_inbound_stream(weak: Weak<Swarm>, peer: PeerId, stream: braidmux::MuxStream) {
    let Some(this) = weak.upgrade() else { return };
    let protocols: Vec<String> = this.handlers.iter().map(|e| e.key().clone()).collect();
    let refs: Vec<&str> = protocols.iter().map(String::as_str).collect();
    let mut stream = stream;
    let negotiated = match negotiate_inbound(&mut stream, &refs).await {
        Ok(negotiated) => negotiated,
        Err(SelectError::ConnectionClosed) => return,
        Err(err) => {
            tracing::debug!(peer = display(peer), err = debug(&err), "inbound stream negotiation failed");
            stream.reset();
            return;
        }
    };
    let Some(handler) = this.handlers.get(&negotiated.protocol).map(|h| h.value().clone())
    else {
        stream.reset();
        return;
    };
    if this
        .resources
        .reserve_stream(peer, &negotiated.protocol, Direction::Inbound, None)
        .is_err()
    {
        stream.reset();
        return;
    }
    let ctx = StreamCtx {
        peer,
        protocol: negotiated.protocol.clone(),
        stream: ResourceTrackedStream::with_residue(
            stream,
            negotiated.residue,
            this.resources.clone(),
            peer,
            negotiated.protocol,
            Direction::Inbound,
            None,
        ),
    };
    drop(this);
    handler.handle(ctx).await;
}

/// The swarm as a traversal capability: mechanisms dial through this and
/// never touch transports directly.
pub struct SwarmDialer(pub Arc<Swarm>);

#[async_trait]
impl CandidateDialer for SwarmDialer {
    async fn dial_addr(&self, peer: Option<PeerId>, addr: &Multiaddr) -> Result<PeerId, NodeError> {
        // mechanisms hand us the bare address; splice the peer back in so
        // identity is verified and dial joining applies
        let full = match (peer, addr.peer_id()) {
            (Some(peer), None) => {
                addr.encapsulate(&vec![skein_wire::Component::P2p(peer)].into())
            }
            _ => addr.clone(),
        };
        let (_, peer) = self.0.connect_addr(&full).await?;
        Ok(peer)
    }
}
