use skein_wire::{Multiaddr, PeerId};

use crate::pool::Direction;

/// Where in the upgrade pipeline a connection was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GateStage {
    Dial,
    Accept,
    Secured,
}

impl std::fmt::Display for GateStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateStage::Dial => "dial".fmt(f),
            GateStage::Accept => "accept".fmt(f),
            GateStage::Secured => "secured".fmt(f),
        }
    }
}

/// Policy hooks consulted before dialing, after accepting, and once the
/// remote identity is authenticated. Returning false kills the connection
/// with `ConnectionGated`; gated connections are never retried.
pub trait ConnectionGater: Send + Sync + 'static {
    fn intercept_dial(&self, peer: Option<PeerId>, addr: &Multiaddr) -> bool {
        let (_, _) = (peer, addr);
        true
    }

    fn intercept_accept(&self, addr: &Multiaddr) -> bool {
        let _ = addr;
        true
    }

    fn intercept_secured(&self, peer: PeerId, direction: Direction) -> bool {
        let (_, _) = (peer, direction);
        true
    }
}

/// The default gater: everything passes.
pub struct AllowAll;

impl ConnectionGater for AllowAll {}

/// A simple denylist gater, mostly useful in tests and as a template.
#[derive(Default)]
pub struct DenyPeers {
    pub denied: std::collections::HashSet<PeerId>,
}

impl ConnectionGater for DenyPeers {
    fn intercept_dial(&self, peer: Option<PeerId>, _addr: &Multiaddr) -> bool {
        peer.is_none_or(|peer| !self.denied.contains(&peer))
    }

    fn intercept_secured(&self, peer: PeerId, _direction: Direction) -> bool {
        !self.denied.contains(&peer)
    }
}
