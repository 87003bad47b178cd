use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use skein_wire::{Multiaddr, PeerId};

use crate::{errors::DisconnectReason, gater::GateStage};

/// Everything a node tells the outside world about its lifecycle.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId, DisconnectReason),
    NewListenAddr(Multiaddr),
    ListenError(Multiaddr, String),
    ConnectionError(Option<PeerId>, String),
    ConnectionGated(Option<PeerId>, Multiaddr, GateStage),
    Reconnecting {
        peer: PeerId,
        attempt: u32,
        next_delay: Duration,
    },
    Reconnected {
        peer: PeerId,
        attempt: u32,
    },
    ReconnectionFailed {
        peer: PeerId,
        attempts: u32,
    },
    Trimmed {
        peer: PeerId,
        trim_rank: usize,
        tags: usize,
    },
    TrimConstrained {
        target: usize,
        selected: usize,
        trimmable: usize,
        active: usize,
    },
    HealthCheckFailed(PeerId),
    TraversalAttempt {
        peer: PeerId,
        mechanism: String,
        succeeded: bool,
    },
}

/// What to do with a slow subscriber whose buffer is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Shed the oldest buffered event and keep going.
    #[default]
    DropOldest,
    /// Suspend the emitter until the subscriber catches up.
    Block,
}

/// A multi-consumer broadcast: every subscriber gets its own bounded queue
/// with every event, in emission order.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    buffer: usize,
    policy: OverflowPolicy,
}

#[derive(Clone)]
struct Subscriber {
    send: async_channel::Sender<NodeEvent>,
    // the bus keeps one receiver clone per subscriber so DropOldest can shed
    // from the head of that subscriber's queue
    recv: async_channel::Receiver<NodeEvent>,
}

impl Subscriber {
    fn is_abandoned(&self) -> bool {
        // only our own shedding clone remains
        self.send.receiver_count() <= 1
    }
}

impl EventBus {
    pub fn new(buffer: usize, policy: OverflowPolicy) -> Self {
        Self {
            subscribers: Mutex::new(vec![]),
            buffer: buffer.max(1),
            policy,
        }
    }

    pub fn subscribe(&self) -> async_channel::Receiver<NodeEvent> {
        let (send, recv) = async_channel::bounded(self.buffer);
        self.subscribers.lock().push(Subscriber {
            send,
            recv: recv.clone(),
        });
        recv
    }

    /// Delivers one event to every live subscriber. The subscriber list is
    /// snapshotted first so delivery never happens under the lock.
    pub async fn emit(&self, event: NodeEvent) {
        tracing::debug!(event = debug(&event), "emitting node event");
        let subscribers = self.subscribers.lock().clone();
        let mut any_dead = false;
        for sub in &subscribers {
            if sub.is_abandoned() {
                any_dead = true;
                continue;
            }
            match self.policy {
                OverflowPolicy::Block => {
                    if sub.send.send(event.clone()).await.is_err() {
                        any_dead = true;
                    }
                }
                OverflowPolicy::DropOldest => {
                    let mut outgoing = event.clone();
                    loop {
                        match sub.send.try_send(outgoing) {
                            Ok(()) => break,
                            Err(async_channel::TrySendError::Full(back)) => {
                                // shed from the head, then retry the tail
                                let _ = sub.recv.try_recv();
                                outgoing = back;
                            }
                            Err(async_channel::TrySendError::Closed(_)) => {
                                any_dead = true;
                                break;
                            }
                        }
                    }
                }
            }
        }
        if any_dead {
            self.subscribers.lock().retain(|sub| !sub.is_abandoned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_sees_every_event() {
        smolscale::block_on(async {
            let bus = EventBus::new(16, OverflowPolicy::DropOldest);
            let sub_a = bus.subscribe();
            let sub_b = bus.subscribe();
            let peer = skein_wire::KeyPair::from_seed([9; 32]).peer_id();
            bus.emit(NodeEvent::PeerConnected(peer)).await;
            assert!(matches!(
                sub_a.recv().await.unwrap(),
                NodeEvent::PeerConnected(p) if p == peer
            ));
            assert!(matches!(
                sub_b.recv().await.unwrap(),
                NodeEvent::PeerConnected(p) if p == peer
            ));
        })
    }

    #[test]
    fn drop_oldest_sheds_from_the_head() {
        smolscale::block_on(async {
            let bus = EventBus::new(2, OverflowPolicy::DropOldest);
            let sub = bus.subscribe();
            let peer = skein_wire::KeyPair::from_seed([9; 32]).peer_id();
            for attempt in 0..4u32 {
                bus.emit(NodeEvent::Reconnected { peer, attempt }).await;
            }
            // the two oldest were shed; the two newest remain in order
            assert!(matches!(
                sub.recv().await.unwrap(),
                NodeEvent::Reconnected { attempt: 2, .. }
            ));
            assert!(matches!(
                sub.recv().await.unwrap(),
                NodeEvent::Reconnected { attempt: 3, .. }
            ));
        })
    }

    #[test]
    fn dead_subscribers_are_pruned() {
        smolscale::block_on(async {
            let bus = EventBus::new(4, OverflowPolicy::DropOldest);
            let sub = bus.subscribe();
            drop(sub);
            let peer = skein_wire::KeyPair::from_seed([9; 32]).peer_id();
            bus.emit(NodeEvent::PeerConnected(peer)).await;
            assert!(bus.subscribers.lock().is_empty());
        })
    }
}
