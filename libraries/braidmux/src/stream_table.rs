use std::{
    hash::BuildHasherDefault,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use ahash::AHasher;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::{
    frame::Frame,
    stream::StreamShared,
    window::{MAX_WINDOW, SendWindow},
};

type Inner = DashMap<u32, StreamEntry, BuildHasherDefault<AHasher>>;

/// The session-side record of one live stream. Ids are unique across both
/// directions (odd for the initiator, even for the responder), so the id
/// alone keys the table.
#[derive(Clone)]
pub(crate) struct StreamEntry {
    pub send_incoming: async_channel::Sender<Frame>,
    pub send_window: Arc<SendWindow>,
    pub recv_window: Arc<Mutex<u64>>,
    pub shared: Arc<StreamShared>,
}

/// A table containing all per-stream state within a mux session.
#[derive(Clone)]
pub(crate) struct StreamTable {
    inner: Arc<Inner>,
    session_dead: Arc<AtomicBool>,
}

impl StreamTable {
    pub fn new(session_dead: Arc<AtomicBool>) -> Self {
        Self {
            inner: Arc::new(DashMap::with_hasher(
                BuildHasherDefault::<AHasher>::default(),
            )),
            session_dead,
        }
    }

    pub fn contains_id(&self, id: u32) -> bool {
        self.inner.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn create_entry(&self, stream_id: u32, initial_window: u32, needs_ack: bool) -> CreatedEntry {
        let (send_incoming, recv_incoming) = async_channel::unbounded::<Frame>();
        let entry = StreamEntry {
            send_incoming,
            send_window: Arc::new(SendWindow::new(initial_window)),
            recv_window: Arc::new(Mutex::new(initial_window as u64)),
            shared: Arc::new(StreamShared::new(self.session_dead.clone(), needs_ack)),
        };
        self.inner.insert(stream_id, entry.clone());
        CreatedEntry {
            entry,
            recv_incoming,
        }
    }

    pub fn remove(&self, stream_id: u32) {
        self.inner.remove(&stream_id);
    }

    /// Hands an incoming DATA frame to the stream's incoming mover, debiting
    /// the receive window first. Returns false on a window violation; frames
    /// for unknown streams are silently discarded.
    pub fn deliver(&self, stream_id: u32, frame: Frame) -> bool {
        if let Some(entry) = self.inner.get(&stream_id) {
            {
                let mut window = entry.recv_window.lock();
                let len = frame.body.len() as u64;
                if len > *window {
                    return false;
                }
                *window -= len;
            }
            let _ = entry.send_incoming.try_send(frame);
        }
        true
    }

    /// Grants credit to a stream's send window. Updates for unknown (e.g.
    /// already-reset) streams are silently discarded.
    pub fn grow_send_window(&self, stream_id: u32, delta: u32) {
        if let Some(entry) = self.inner.get(&stream_id) {
            entry.send_window.grow(delta);
        }
    }

    /// Restores receive-window credit about to be advertised to the peer.
    /// Held together under the stream's window lock so a racing deliver
    /// cannot observe a half-applied update.
    pub fn credit_recv_window(&self, stream_id: u32, delta: u32) {
        if let Some(entry) = self.inner.get(&stream_id) {
            let mut window = entry.recv_window.lock();
            *window = (*window + delta as u64).min(MAX_WINDOW);
        }
    }

    /// Marks a stream reset and removes it: any pending read or write on it
    /// fails from here on.
    pub fn trip_reset(&self, stream_id: u32) {
        if let Some((_, entry)) = self.inner.remove(&stream_id) {
            entry.shared.trip_reset();
            entry.send_incoming.close();
        }
    }

    /// Abrupt shutdown: resets every stream and marks the session dead.
    pub fn reset_all(&self) {
        self.session_dead.store(true, Ordering::SeqCst);
        for entry in self.inner.iter() {
            entry.shared.trip_reset();
            entry.send_incoming.close();
        }
        self.inner.clear();
    }
}

pub(crate) struct CreatedEntry {
    pub entry: StreamEntry,
    pub recv_incoming: async_channel::Receiver<Frame>,
}
