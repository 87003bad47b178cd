use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::RwLock;
use skein_wire::{Multiaddr, PeerId};

use crate::store::RecordStore;

/// An in-memory address book feeding `connect(PeerId)` traversal, optionally
/// mirrored into the record store so addresses survive restarts. Multiaddr
/// equality is canonical (long- and short-form IPv6 compare equal), so
/// duplicate observations collapse.
pub struct PeerStore {
    inner: RwLock<HashMap<PeerId, Vec<(Multiaddr, Instant)>>>,
    persist: Option<Arc<RecordStore>>,
}

impl PeerStore {
    pub fn new(persist: Option<Arc<RecordStore>>) -> Self {
        let store = Self {
            inner: RwLock::new(HashMap::new()),
            persist,
        };
        store.load();
        store
    }

    fn load(&self) {
        let Some(persist) = &self.persist else {
            return;
        };
        let Ok(Some((value, _))) = persist.get("peer-store/addresses") else {
            return;
        };
        let Ok(parsed) = serde_json::from_value::<HashMap<PeerId, Vec<Multiaddr>>>(value) else {
            tracing::warn!("persisted peer store is unreadable, starting empty");
            return;
        };
        let now = Instant::now();
        let mut inner = self.inner.write();
        for (peer, addrs) in parsed {
            inner.insert(peer, addrs.into_iter().map(|a| (a, now)).collect());
        }
    }

    fn persist(&self) {
        let Some(persist) = &self.persist else {
            return;
        };
        let snapshot: HashMap<String, Vec<String>> = self
            .inner
            .read()
            .iter()
            .map(|(peer, addrs)| {
                (
                    peer.to_string(),
                    addrs.iter().map(|(a, _)| a.to_string()).collect(),
                )
            })
            .collect();
        if let Ok(value) = serde_json::to_value(&snapshot) {
            if let Err(err) = persist.put("peer-store/addresses", value) {
                tracing::debug!(err = debug(err), "could not persist peer store");
            }
        }
    }

    pub fn add_address(&self, peer: PeerId, addr: Multiaddr) {
        {
            let mut inner = self.inner.write();
            let addrs = inner.entry(peer).or_default();
            if let Some(existing) = addrs.iter_mut().find(|(a, _)| *a == addr) {
                existing.1 = Instant::now();
            } else {
                addrs.push((addr, Instant::now()));
            }
        }
        self.persist();
    }

    pub fn addresses_of(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.inner
            .read()
            .get(peer)
            .map(|addrs| addrs.iter().map(|(a, _)| a.clone()).collect())
            .unwrap_or_default()
    }

    pub fn remove_peer(&self, peer: &PeerId) {
        self.inner.write().remove(peer);
        self.persist();
    }

    /// Drops addresses not refreshed within `max_age`.
    pub fn gc(&self, max_age: Duration) {
        {
            let mut inner = self.inner.write();
            for addrs in inner.values_mut() {
                addrs.retain(|(_, seen)| seen.elapsed() <= max_age);
            }
            inner.retain(|_, addrs| !addrs.is_empty());
        }
        self.persist();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        skein_wire::KeyPair::from_seed([n; 32]).peer_id()
    }

    #[test]
    fn addresses_dedupe_canonically() {
        let store = PeerStore::new(None);
        let p = peer(1);
        store.add_address(p, "/ip6/::1/tcp/1".parse().unwrap());
        store.add_address(p, "/ip6/0:0:0:0:0:0:0:1/tcp/1".parse().unwrap());
        assert_eq!(store.addresses_of(&p).len(), 1);
    }

    #[test]
    fn gc_drops_stale() {
        let store = PeerStore::new(None);
        let p = peer(2);
        store.add_address(p, "/memory/7".parse().unwrap());
        store.gc(Duration::from_secs(3600));
        assert_eq!(store.addresses_of(&p).len(), 1);
        store.gc(Duration::ZERO);
        assert!(store.addresses_of(&p).is_empty());
    }
}
