use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::Poll,
};

use braidmux::MuxStream;
use futures_util::{AsyncRead, AsyncWrite};
use parking_lot::Mutex;
use serde::Deserialize;
use skein_wire::PeerId;
use thiserror::Error;

use crate::pool::Direction;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{scope} resource limit exceeded for {resource}")]
pub struct LimitExceeded {
    pub scope: String,
    pub resource: &'static str,
}

/// Raw counters for one scope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceStat {
    pub inbound_conns: usize,
    pub outbound_conns: usize,
    pub inbound_streams: usize,
    pub outbound_streams: usize,
    pub memory_bytes: u64,
}

impl ResourceStat {
    pub fn total_conns(&self) -> usize {
        self.inbound_conns + self.outbound_conns
    }

    pub fn total_streams(&self) -> usize {
        self.inbound_streams + self.outbound_streams
    }

    fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// A scope's view with the derived totals included.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResourceSnapshot {
    pub inbound_conns: usize,
    pub outbound_conns: usize,
    pub total_conns: usize,
    pub inbound_streams: usize,
    pub outbound_streams: usize,
    pub total_streams: usize,
    pub memory_bytes: u64,
}

impl From<ResourceStat> for ResourceSnapshot {
    fn from(stat: ResourceStat) -> Self {
        Self {
            inbound_conns: stat.inbound_conns,
            outbound_conns: stat.outbound_conns,
            total_conns: stat.total_conns(),
            inbound_streams: stat.inbound_streams,
            outbound_streams: stat.outbound_streams,
            total_streams: stat.total_streams(),
            memory_bytes: stat.memory_bytes,
        }
    }
}

/// Ceilings for one scope. The defaults are effectively unlimited; embedders
/// dial them down per deployment.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct ScopeLimits {
    pub max_conns: usize,
    pub max_streams: usize,
    pub max_memory_bytes: u64,
}

impl Default for ScopeLimits {
    fn default() -> Self {
        Self {
            max_conns: usize::MAX,
            max_streams: usize::MAX,
            max_memory_bytes: u64::MAX,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub system: ScopeLimits,
    pub per_peer: ScopeLimits,
    pub per_protocol: ScopeLimits,
    pub per_service: ScopeLimits,
}

#[derive(Default)]
struct Scopes {
    system: ResourceStat,
    peers: HashMap<PeerId, ResourceStat>,
    protocols: HashMap<String, ResourceStat>,
    services: HashMap<String, ResourceStat>,
}

/// Multi-scope accounting with reserve-all-or-nothing semantics: one lock,
/// every involved scope checked against its effective limit, then every
/// counter bumped together or none at all.
pub struct ResourceManager {
    limits: ResourceLimits,
    peer_overrides: Mutex<HashMap<PeerId, ScopeLimits>>,
    protocol_overrides: Mutex<HashMap<String, ScopeLimits>>,
    scopes: Mutex<Scopes>,
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            peer_overrides: Mutex::new(HashMap::new()),
            protocol_overrides: Mutex::new(HashMap::new()),
            scopes: Mutex::new(Scopes::default()),
        }
    }

    pub fn set_peer_limit(&self, peer: PeerId, limits: ScopeLimits) {
        self.peer_overrides.lock().insert(peer, limits);
    }

    pub fn set_protocol_limit(&self, protocol: impl Into<String>, limits: ScopeLimits) {
        self.protocol_overrides.lock().insert(protocol.into(), limits);
    }

    fn peer_limit(&self, peer: &PeerId) -> ScopeLimits {
        self.peer_overrides
            .lock()
            .get(peer)
            .copied()
            .unwrap_or(self.limits.per_peer)
    }

    fn protocol_limit(&self, protocol: &str) -> ScopeLimits {
        self.protocol_overrides
            .lock()
            .get(protocol)
            .copied()
            .unwrap_or(self.limits.per_protocol)
    }

    /// Reserves one connection. With no peer yet (an inbound connection
    /// before its handshake) only the system scope is involved.
    pub fn reserve_connection(
        &self,
        peer: Option<PeerId>,
        direction: Direction,
    ) -> Result<(), LimitExceeded> {
        let mut scopes = self.scopes.lock();
        if scopes.system.total_conns() + 1 > self.limits.system.max_conns {
            return Err(LimitExceeded {
                scope: "system".into(),
                resource: "connections",
            });
        }
        if let Some(peer) = peer {
            let stat = scopes.peers.get(&peer).copied().unwrap_or_default();
            if stat.total_conns() + 1 > self.peer_limit(&peer).max_conns {
                return Err(LimitExceeded {
                    scope: format!("peer {peer}"),
                    resource: "connections",
                });
            }
            bump_conn(scopes.peers.entry(peer).or_default(), direction, 1);
        }
        bump_conn(&mut scopes.system, direction, 1);
        Ok(())
    }

    /// Moves an anonymous inbound reservation onto a peer once its identity
    /// is known. Fails (without touching anything) if the peer is full.
    pub fn adopt_peer(&self, peer: PeerId, direction: Direction) -> Result<(), LimitExceeded> {
        let mut scopes = self.scopes.lock();
        let stat = scopes.peers.get(&peer).copied().unwrap_or_default();
        if stat.total_conns() + 1 > self.peer_limit(&peer).max_conns {
            return Err(LimitExceeded {
                scope: format!("peer {peer}"),
                resource: "connections",
            });
        }
        bump_conn(scopes.peers.entry(peer).or_default(), direction, 1);
        Ok(())
    }

    pub fn release_connection(&self, peer: Option<PeerId>, direction: Direction) {
        let mut scopes = self.scopes.lock();
        bump_conn(&mut scopes.system, direction, -1);
        if let Some(peer) = peer {
            if let Some(stat) = scopes.peers.get_mut(&peer) {
                bump_conn(stat, direction, -1);
            }
            drop_if_zero_peer(&mut scopes, &peer);
        }
    }

    /// Reserves one stream across the system, peer, protocol and (when
    /// given) service scopes, atomically.
    pub fn reserve_stream(
        &self,
        peer: PeerId,
        protocol: &str,
        direction: Direction,
        service: Option<&str>,
    ) -> Result<(), LimitExceeded> {
        let peer_max = self.peer_limit(&peer).max_streams;
        let protocol_max = self.protocol_limit(protocol).max_streams;
        let mut scopes = self.scopes.lock();

        if scopes.system.total_streams() + 1 > self.limits.system.max_streams {
            return Err(LimitExceeded {
                scope: "system".into(),
                resource: "streams",
            });
        }
        let peer_stat = scopes.peers.get(&peer).copied().unwrap_or_default();
        if peer_stat.total_streams() + 1 > peer_max {
            return Err(LimitExceeded {
                scope: format!("peer {peer}"),
                resource: "streams",
            });
        }
        let proto_stat = scopes.protocols.get(protocol).copied().unwrap_or_default();
        if proto_stat.total_streams() + 1 > protocol_max {
            return Err(LimitExceeded {
                scope: format!("protocol {protocol}"),
                resource: "streams",
            });
        }
        if let Some(service) = service {
            let svc_stat = scopes.services.get(service).copied().unwrap_or_default();
            if svc_stat.total_streams() + 1 > self.limits.per_service.max_streams {
                return Err(LimitExceeded {
                    scope: format!("service {service}"),
                    resource: "streams",
                });
            }
        }

        // every check passed: commit the whole reservation
        bump_stream(&mut scopes.system, direction, 1);
        bump_stream(scopes.peers.entry(peer).or_default(), direction, 1);
        bump_stream(
            scopes.protocols.entry(protocol.to_string()).or_default(),
            direction,
            1,
        );
        if let Some(service) = service {
            bump_stream(
                scopes.services.entry(service.to_string()).or_default(),
                direction,
                1,
            );
        }
        Ok(())
    }

    pub fn release_stream(
        &self,
        peer: PeerId,
        protocol: &str,
        direction: Direction,
        service: Option<&str>,
    ) {
        let mut scopes = self.scopes.lock();
        bump_stream(&mut scopes.system, direction, -1);
        if let Some(stat) = scopes.peers.get_mut(&peer) {
            bump_stream(stat, direction, -1);
        }
        drop_if_zero_peer(&mut scopes, &peer);
        if let Some(stat) = scopes.protocols.get_mut(protocol) {
            bump_stream(stat, direction, -1);
        }
        if scopes.protocols.get(protocol).is_some_and(ResourceStat::is_zero) {
            scopes.protocols.remove(protocol);
        }
        if let Some(service) = service {
            if let Some(stat) = scopes.services.get_mut(service) {
                bump_stream(stat, direction, -1);
            }
            if scopes.services.get(service).is_some_and(ResourceStat::is_zero) {
                scopes.services.remove(service);
            }
        }
    }

    pub fn reserve_memory(&self, peer: PeerId, bytes: u64) -> Result<(), LimitExceeded> {
        let peer_max = self.peer_limit(&peer).max_memory_bytes;
        let mut scopes = self.scopes.lock();
        if scopes.system.memory_bytes.saturating_add(bytes) > self.limits.system.max_memory_bytes {
            return Err(LimitExceeded {
                scope: "system".into(),
                resource: "memory",
            });
        }
        let peer_stat = scopes.peers.get(&peer).copied().unwrap_or_default();
        if peer_stat.memory_bytes.saturating_add(bytes) > peer_max {
            return Err(LimitExceeded {
                scope: format!("peer {peer}"),
                resource: "memory",
            });
        }
        scopes.system.memory_bytes += bytes;
        scopes.peers.entry(peer).or_default().memory_bytes += bytes;
        Ok(())
    }

    pub fn release_memory(&self, peer: PeerId, bytes: u64) {
        let mut scopes = self.scopes.lock();
        scopes.system.memory_bytes = scopes.system.memory_bytes.saturating_sub(bytes);
        if let Some(stat) = scopes.peers.get_mut(&peer) {
            stat.memory_bytes = stat.memory_bytes.saturating_sub(bytes);
        }
        drop_if_zero_peer(&mut scopes, &peer);
    }

    pub fn system_snapshot(&self) -> ResourceSnapshot {
        self.scopes.lock().system.into()
    }

    pub fn peer_snapshot(&self, peer: &PeerId) -> ResourceSnapshot {
        self.scopes
            .lock()
            .peers
            .get(peer)
            .copied()
            .unwrap_or_default()
            .into()
    }

    pub fn protocol_snapshot(&self, protocol: &str) -> ResourceSnapshot {
        self.scopes
            .lock()
            .protocols
            .get(protocol)
            .copied()
            .unwrap_or_default()
            .into()
    }

    pub fn service_snapshot(&self, service: &str) -> ResourceSnapshot {
        self.scopes
            .lock()
            .services
            .get(service)
            .copied()
            .unwrap_or_default()
            .into()
    }
}

fn drop_if_zero_peer(scopes: &mut Scopes, peer: &PeerId) {
    if scopes.peers.get(peer).is_some_and(ResourceStat::is_zero) {
        scopes.peers.remove(peer);
    }
}

fn bump_conn(stat: &mut ResourceStat, direction: Direction, delta: isize) {
    let field = match direction {
        Direction::Inbound => &mut stat.inbound_conns,
        Direction::Outbound => &mut stat.outbound_conns,
    };
    *field = field.saturating_add_signed(delta);
}

fn bump_stream(stat: &mut ResourceStat, direction: Direction, delta: isize) {
    let field = match direction {
        Direction::Inbound => &mut stat.inbound_streams,
        Direction::Outbound => &mut stat.outbound_streams,
    };
    *field = field.saturating_add_signed(delta);
}

/// A muxed stream that owns the reservations made for it and releases them
/// exactly once, on close, reset or drop. Bytes a protocol negotiation read
/// past its own messages are replayed before the stream proper.
pub struct ResourceTrackedStream {
    inner: MuxStream,
    residue: bytes::BytesMut,
    manager: Arc<ResourceManager>,
    peer: PeerId,
    protocol: String,
    direction: Direction,
    service: Option<String>,
    released: AtomicBool,
}

impl ResourceTrackedStream {
    pub fn new(
        inner: MuxStream,
        manager: Arc<ResourceManager>,
        peer: PeerId,
        protocol: String,
        direction: Direction,
        service: Option<String>,
    ) -> Self {
        Self::with_residue(
            inner,
            bytes::BytesMut::new(),
            manager,
            peer,
            protocol,
            direction,
            service,
        )
    }

    pub fn with_residue(
        inner: MuxStream,
        residue: bytes::BytesMut,
        manager: Arc<ResourceManager>,
        peer: PeerId,
        protocol: String,
        direction: Direction,
        service: Option<String>,
    ) -> Self {
        Self {
            inner,
            residue,
            manager,
            peer,
            protocol,
            direction,
            service,
            released: AtomicBool::new(false),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Forcibly terminates the stream and releases its reservations.
    pub fn reset(&mut self) {
        self.inner.reset();
        self.release_once();
    }

    fn release_once(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.manager.release_stream(
                self.peer,
                &self.protocol,
                self.direction,
                self.service.as_deref(),
            );
        }
    }
}

impl Drop for ResourceTrackedStream {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl AsyncRead for ResourceTrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        if !self.residue.is_empty() && !buf.is_empty() {
            let n = self.residue.len().min(buf.len());
            buf[..n].copy_from_slice(&self.residue.split_to(n));
            return Poll::Ready(Ok(n));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ResourceTrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        let result = Pin::new(&mut self.inner).poll_close(cx);
        if matches!(result, Poll::Ready(Ok(()))) {
            self.release_once();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        skein_wire::KeyPair::from_seed([n; 32]).peer_id()
    }

    #[test]
    fn failed_reservation_changes_nothing() {
        let manager = ResourceManager::new(ResourceLimits {
            per_protocol: ScopeLimits {
                max_streams: 0,
                ..Default::default()
            },
            ..Default::default()
        });
        let p = peer(1);
        assert!(
            manager
                .reserve_stream(p, "/echo/1.0.0", Direction::Outbound, Some("echo"))
                .is_err()
        );
        assert_eq!(manager.system_snapshot().total_streams, 0);
        assert_eq!(manager.peer_snapshot(&p).total_streams, 0);
        assert_eq!(manager.service_snapshot("echo").total_streams, 0);
    }

    #[test]
    fn per_peer_override_beats_default() {
        let manager = ResourceManager::new(ResourceLimits::default());
        let p = peer(2);
        manager.set_peer_limit(
            p,
            ScopeLimits {
                max_conns: 1,
                ..Default::default()
            },
        );
        assert!(manager.reserve_connection(Some(p), Direction::Outbound).is_ok());
        assert!(manager.reserve_connection(Some(p), Direction::Outbound).is_err());
        // the system scope only holds the one committed reservation
        assert_eq!(manager.system_snapshot().total_conns, 1);
    }

    #[test]
    fn release_deletes_empty_scopes() {
        let manager = ResourceManager::new(ResourceLimits::default());
        let p = peer(3);
        manager
            .reserve_stream(p, "/echo/1.0.0", Direction::Inbound, None)
            .unwrap();
        manager.release_stream(p, "/echo/1.0.0", Direction::Inbound, None);
        assert!(manager.scopes.lock().peers.is_empty());
        assert!(manager.scopes.lock().protocols.is_empty());
        assert_eq!(manager.system_snapshot().total_streams, 0);
    }

    #[test]
    fn adopt_peer_after_anonymous_accept() {
        let manager = ResourceManager::new(ResourceLimits::default());
        let p = peer(4);
        manager.reserve_connection(None, Direction::Inbound).unwrap();
        manager.adopt_peer(p, Direction::Inbound).unwrap();
        assert_eq!(manager.peer_snapshot(&p).inbound_conns, 1);
        assert_eq!(manager.system_snapshot().inbound_conns, 1);
        manager.release_connection(Some(p), Direction::Inbound);
        assert_eq!(manager.system_snapshot().inbound_conns, 0);
    }
}
