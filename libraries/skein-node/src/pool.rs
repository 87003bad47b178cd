use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use async_task::Task;
use futures_util::future::Shared;
use parking_lot::Mutex;
use skein_wire::{Multiaddr, PeerId};

use crate::{
    config::PoolConfig,
    errors::{DisconnectReason, NodeError},
    upgrade::UpgradedConn,
};

pub type ConnId = u64;

/// The shared outcome of an in-flight dial: every caller that joined the
/// dial observes the same result. The error side is an Arc so the one
/// underlying failure can fan out to every joiner.
pub type DialOutcome = Result<(ConnId, PeerId), Arc<NodeError>>;
pub type PendingDial = Shared<Task<DialOutcome>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnected(DisconnectReason),
    Reconnecting { attempt: u32, next_at: Instant },
    Failed(DisconnectReason),
}

/// The pool's book-keeping for one connection. Cloned out as a snapshot;
/// the live connection object lives beside it inside the pool.
#[derive(Clone, Debug)]
pub struct ManagedConnection {
    pub id: ConnId,
    pub peer: PeerId,
    pub address: Multiaddr,
    pub direction: Direction,
    pub state: ConnState,
    pub retry_count: u32,
    pub last_activity: Instant,
    pub connected_at: Option<Instant>,
    pub tags: BTreeSet<String>,
    pub is_protected: bool,
}

struct Entry {
    meta: ManagedConnection,
    // None exactly while `meta.state` is `Connecting`
    conn: Option<Arc<UpgradedConn>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrimExclusion {
    Protected,
    WithinGracePeriod,
    NotConnected,
}

#[derive(Clone, Debug)]
pub struct TrimCandidate {
    pub id: ConnId,
    pub peer: PeerId,
    pub selected_for_trim: bool,
    pub trim_rank: Option<usize>,
    pub exclusion_reason: Option<TrimExclusion>,
}

/// A dry-run snapshot of what trimming would do right now.
#[derive(Clone, Debug)]
pub struct TrimReport {
    pub active: usize,
    pub total: usize,
    pub target: usize,
    pub trimmable: usize,
    pub selected: usize,
    pub candidates: Vec<TrimCandidate>,
}

#[derive(Default)]
struct PoolInner {
    entries: HashMap<ConnId, Entry>,
    peer_conns: HashMap<PeerId, Vec<ConnId>>,
    pending_dials: HashMap<PeerId, PendingDial>,
    auto_reconnect: HashMap<PeerId, Multiaddr>,
    next_id: ConnId,
}

/// The exclusive owner of every managed connection. All operations are
/// non-blocking mutations under one internal lock; anything that might
/// suspend (closing muxes, emitting events) happens on handles the caller
/// takes out of the pool first.
pub struct ConnectionPool {
    cfg: PoolConfig,
    inner: Mutex<PoolInner>,
}

impl ConnectionPool {
    pub fn new(cfg: PoolConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    fn insert(
        inner: &mut PoolInner,
        peer: PeerId,
        address: Multiaddr,
        direction: Direction,
        state: ConnState,
        conn: Option<Arc<UpgradedConn>>,
    ) -> ConnId {
        inner.next_id += 1;
        let id = inner.next_id;
        let connected = state == ConnState::Connected;
        inner.entries.insert(
            id,
            Entry {
                meta: ManagedConnection {
                    id,
                    peer,
                    address,
                    direction,
                    state,
                    retry_count: 0,
                    last_activity: Instant::now(),
                    connected_at: connected.then(Instant::now),
                    tags: BTreeSet::new(),
                    is_protected: false,
                },
                conn,
            },
        );
        inner.peer_conns.entry(peer).or_default().push(id);
        id
    }

    /// Registers a dial in progress.
    pub fn add_connecting(&self, peer: PeerId, address: Multiaddr, direction: Direction) -> ConnId {
        let mut inner = self.inner.lock();
        Self::insert(&mut inner, peer, address, direction, ConnState::Connecting, None)
    }

    /// Registers an already-established connection.
    pub fn add(
        &self,
        conn: Arc<UpgradedConn>,
        peer: PeerId,
        address: Multiaddr,
        direction: Direction,
    ) -> ConnId {
        let mut inner = self.inner.lock();
        Self::insert(
            &mut inner,
            peer,
            address,
            direction,
            ConnState::Connected,
            Some(conn),
        )
    }

    /// Flips a `Connecting` entry to `Connected` with its live connection.
    pub fn update_connection(&self, id: ConnId, conn: Arc<UpgradedConn>) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&id) else {
            return false;
        };
        entry.conn = Some(conn);
        entry.meta.state = ConnState::Connected;
        entry.meta.connected_at = Some(Instant::now());
        entry.meta.last_activity = Instant::now();
        true
    }

    /// Updates an entry's state, returning the fresh snapshot. Leaving
    /// `Connected` detaches the live connection object and hands it back so
    /// the caller can close it outside the lock.
    pub fn update_state(
        &self,
        id: ConnId,
        state: ConnState,
    ) -> Option<(ManagedConnection, Option<Arc<UpgradedConn>>)> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(&id)?;
        let detached = if state == ConnState::Connected {
            None
        } else {
            entry.conn.take()
        };
        entry.meta.state = state;
        Some((entry.meta.clone(), detached))
    }

    /// Atomically claims a connected entry for disconnect handling: flips it
    /// to `Disconnected` and detaches the live connection. Returns None when
    /// the entry is gone or already left `Connected`, so exactly one caller
    /// wins a racing disconnect.
    pub fn begin_disconnect(
        &self,
        id: ConnId,
        reason: DisconnectReason,
    ) -> Option<(ManagedConnection, Option<Arc<UpgradedConn>>)> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(&id)?;
        if entry.meta.state != ConnState::Connected {
            return None;
        }
        entry.meta.state = ConnState::Disconnected(reason);
        let conn = entry.conn.take();
        Some((entry.meta.clone(), conn))
    }

    pub fn remove(&self, id: ConnId) -> Option<(ManagedConnection, Option<Arc<UpgradedConn>>)> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.remove(&id)?;
        if let Some(ids) = inner.peer_conns.get_mut(&entry.meta.peer) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                inner.peer_conns.remove(&entry.meta.peer);
            }
        }
        Some((entry.meta, entry.conn))
    }

    pub fn remove_peer(
        &self,
        peer: &PeerId,
    ) -> Vec<(ManagedConnection, Option<Arc<UpgradedConn>>)> {
        let ids = {
            let inner = self.inner.lock();
            inner.peer_conns.get(peer).cloned().unwrap_or_default()
        };
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// The first live connection to a peer.
    pub fn connection(&self, peer: &PeerId) -> Option<Arc<UpgradedConn>> {
        let inner = self.inner.lock();
        let ids = inner.peer_conns.get(peer)?;
        ids.iter().find_map(|id| {
            let entry = inner.entries.get(id)?;
            (entry.meta.state == ConnState::Connected)
                .then(|| entry.conn.clone())
                .flatten()
        })
    }

    pub fn connections(&self, peer: &PeerId) -> Vec<ManagedConnection> {
        let inner = self.inner.lock();
        inner
            .peer_conns
            .get(peer)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.entries.get(id).map(|e| e.meta.clone()))
            .collect()
    }

    pub fn snapshot(&self, id: ConnId) -> Option<ManagedConnection> {
        self.inner.lock().entries.get(&id).map(|e| e.meta.clone())
    }

    pub fn entries(&self) -> Vec<ManagedConnection> {
        self.inner
            .lock()
            .entries
            .values()
            .map(|e| e.meta.clone())
            .collect()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connection(peer).is_some()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        let inner = self.inner.lock();
        let mut peers: Vec<PeerId> = inner
            .entries
            .values()
            .filter(|e| e.meta.state == ConnState::Connected)
            .map(|e| e.meta.peer)
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    /// Live connections only.
    pub fn connection_count(&self) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.meta.state == ConnState::Connected)
            .count()
    }

    pub fn count_by_direction(&self, direction: Direction) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.meta.state == ConnState::Connected && e.meta.direction == direction)
            .count()
    }

    pub fn total_entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn tag(&self, id: ConnId, tag: impl Into<String>) {
        if let Some(entry) = self.inner.lock().entries.get_mut(&id) {
            entry.meta.tags.insert(tag.into());
        }
    }

    pub fn untag(&self, id: ConnId, tag: &str) {
        if let Some(entry) = self.inner.lock().entries.get_mut(&id) {
            entry.meta.tags.remove(tag);
        }
    }

    pub fn protect(&self, id: ConnId, protected: bool) {
        if let Some(entry) = self.inner.lock().entries.get_mut(&id) {
            entry.meta.is_protected = protected;
        }
    }

    pub fn set_auto_reconnect(&self, peer: PeerId, address: Option<Multiaddr>) {
        let mut inner = self.inner.lock();
        match address {
            Some(address) => {
                inner.auto_reconnect.insert(peer, address);
            }
            None => {
                inner.auto_reconnect.remove(&peer);
            }
        }
    }

    pub fn auto_reconnect_addr(&self, peer: &PeerId) -> Option<Multiaddr> {
        self.inner.lock().auto_reconnect.get(peer).cloned()
    }

    pub fn has_pending_dial(&self, peer: &PeerId) -> bool {
        self.inner.lock().pending_dials.contains_key(peer)
    }

    pub fn pending_dial(&self, peer: &PeerId) -> Option<PendingDial> {
        self.inner.lock().pending_dials.get(peer).cloned()
    }

    /// Joins the peer's in-flight dial, or registers a new one made by the
    /// callback. The boolean says whether this call created it.
    pub fn join_or_register_dial(
        &self,
        peer: PeerId,
        make: impl FnOnce() -> PendingDial,
    ) -> (PendingDial, bool) {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.pending_dials.get(&peer) {
            return (existing.clone(), false);
        }
        let task = make();
        inner.pending_dials.insert(peer, task.clone());
        (task, true)
    }

    pub fn remove_pending_dial(&self, peer: &PeerId) {
        self.inner.lock().pending_dials.remove(peer);
    }

    pub fn record_activity(&self, id: ConnId) {
        if let Some(entry) = self.inner.lock().entries.get_mut(&id) {
            entry.meta.last_activity = Instant::now();
        }
    }

    /// Connected entries whose last activity is older than the threshold.
    pub fn idle_connections(&self, threshold: Duration) -> Vec<ManagedConnection> {
        let inner = self.inner.lock();
        inner
            .entries
            .values()
            .filter(|e| {
                e.meta.state == ConnState::Connected && e.meta.last_activity.elapsed() > threshold
            })
            .map(|e| e.meta.clone())
            .collect()
    }

    pub fn increment_retry(&self, id: ConnId) -> u32 {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&id) {
            Some(entry) => {
                entry.meta.retry_count += 1;
                entry.meta.retry_count
            }
            None => 0,
        }
    }

    pub fn reset_retry(&self, id: ConnId) {
        if let Some(entry) = self.inner.lock().entries.get_mut(&id) {
            entry.meta.retry_count = 0;
        }
    }

    /// How long the connection has currently been up.
    pub fn connected_for(&self, id: ConnId) -> Option<Duration> {
        self.inner
            .lock()
            .entries
            .get(&id)
            .and_then(|e| e.meta.connected_at)
            .map(|at| at.elapsed())
    }

    /// Victim order: fewest tags first, then stalest activity, with inbound
    /// entries ahead of outbound on a full tie.
    fn victim_order(a: &ManagedConnection, b: &ManagedConnection) -> std::cmp::Ordering {
        a.tags
            .len()
            .cmp(&b.tags.len())
            .then(a.last_activity.cmp(&b.last_activity))
            .then_with(|| {
                let rank = |d: Direction| match d {
                    Direction::Inbound => 0,
                    Direction::Outbound => 1,
                };
                rank(a.direction).cmp(&rank(b.direction))
            })
    }

    fn trim_victims(inner: &PoolInner, cfg: &PoolConfig) -> (usize, usize, Vec<ConnId>) {
        let active: Vec<&ManagedConnection> = inner
            .entries
            .values()
            .filter(|e| e.meta.state == ConnState::Connected)
            .map(|e| &e.meta)
            .collect();
        if active.len() <= cfg.high_watermark {
            return (active.len(), 0, vec![]);
        }
        let target = active.len() - cfg.low_watermark;
        let mut trimmable: Vec<&ManagedConnection> = active
            .iter()
            .copied()
            .filter(|meta| {
                !meta.is_protected
                    && meta
                        .connected_at
                        .is_some_and(|at| at.elapsed() >= cfg.grace_period())
            })
            .collect();
        trimmable.sort_by(|a, b| Self::victim_order(a, b));
        let victims = trimmable
            .iter()
            .take(target)
            .map(|meta| meta.id)
            .collect();
        (active.len(), target, victims)
    }

    /// Evicts down toward the low watermark when the pool sits above the
    /// high one. Victims come back to the caller so the actual closing
    /// happens outside the lock.
    pub fn trim_if_needed(&self) -> Vec<(ManagedConnection, Option<Arc<UpgradedConn>>)> {
        let victims = {
            let inner = self.inner.lock();
            let (_, _, victims) = Self::trim_victims(&inner, &self.cfg);
            victims
        };
        victims.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// The dry-run view of the same selection, for observability.
    pub fn trim_report(&self) -> TrimReport {
        let inner = self.inner.lock();
        let (active, target, victims) = Self::trim_victims(&inner, &self.cfg);
        let mut trimmable = 0usize;
        let candidates = inner
            .entries
            .values()
            .map(|entry| {
                let meta = &entry.meta;
                let exclusion_reason = if meta.state != ConnState::Connected {
                    Some(TrimExclusion::NotConnected)
                } else if meta.is_protected {
                    Some(TrimExclusion::Protected)
                } else if meta
                    .connected_at
                    .is_none_or(|at| at.elapsed() < self.cfg.grace_period())
                {
                    Some(TrimExclusion::WithinGracePeriod)
                } else {
                    trimmable += 1;
                    None
                };
                let trim_rank = victims.iter().position(|v| *v == meta.id);
                TrimCandidate {
                    id: meta.id,
                    peer: meta.peer,
                    selected_for_trim: trim_rank.is_some(),
                    trim_rank,
                    exclusion_reason,
                }
            })
            .collect();
        TrimReport {
            active,
            total: inner.entries.len(),
            target,
            trimmable,
            selected: victims.len(),
            candidates,
        }
    }
}
