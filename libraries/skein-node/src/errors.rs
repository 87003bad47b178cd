use braidmux::MuxError;
use cordage::TransportError;
use skein_secure::SecureError;
use skein_select::SelectError;
use skein_wire::PeerId;
use thiserror::Error;

use crate::gater::GateStage;

/// Which layer an error originated in. Disconnect reasons carrying an error
/// compare by this category alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Transport,
    Security,
    Muxer,
    Protocol,
    Internal,
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::Transport => "transport",
            ErrorCategory::Security => "security",
            ErrorCategory::Muxer => "muxer",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Internal => "internal",
            ErrorCategory::Unknown => "unknown",
        };
        name.fmt(f)
    }
}

/// Why a managed connection ended.
#[derive(Clone, Debug)]
pub enum DisconnectReason {
    LocalClose,
    RemoteClose,
    Timeout,
    IdleTimeout,
    HealthCheckFailed,
    LimitExceeded,
    Gated(GateStage),
    Error {
        category: ErrorCategory,
        message: String,
    },
}

impl DisconnectReason {
    pub fn error(category: ErrorCategory, message: impl Into<String>) -> Self {
        DisconnectReason::Error {
            category,
            message: message.into(),
        }
    }

    /// Whether reconnection may consume this reason. Deliberate local closes,
    /// gating, limit enforcement and protocol misbehavior are final.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DisconnectReason::LocalClose
            | DisconnectReason::Gated(_)
            | DisconnectReason::LimitExceeded => false,
            DisconnectReason::Error { category, .. } => *category != ErrorCategory::Protocol,
            _ => true,
        }
    }
}

/// Equality ignores error messages: two `Error` reasons match when their
/// categories do.
impl PartialEq for DisconnectReason {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DisconnectReason::Error { category: a, .. }, DisconnectReason::Error { category: b, .. }) => a == b,
            (DisconnectReason::Gated(a), DisconnectReason::Gated(b)) => a == b,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl Eq for DisconnectReason {}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::LocalClose => "closed locally".fmt(f),
            DisconnectReason::RemoteClose => "closed by peer".fmt(f),
            DisconnectReason::Timeout => "timed out".fmt(f),
            DisconnectReason::IdleTimeout => "idle too long".fmt(f),
            DisconnectReason::HealthCheckFailed => "health check failed".fmt(f),
            DisconnectReason::LimitExceeded => "over a connection limit".fmt(f),
            DisconnectReason::Gated(stage) => write!(f, "gated at {stage}"),
            DisconnectReason::Error { category, message } => {
                write!(f, "{category} error: {message}")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("no security upgraders configured")]
    NoSecurityUpgraders,
    #[error("no muxers configured")]
    NoMuxers,
    #[error("security negotiation failed for {0}")]
    SecurityNegotiationFailed(String),
    #[error("muxer negotiation failed for {0}")]
    MuxerNegotiationFailed(String),
    #[error("connection gated at {0}")]
    ConnectionGated(GateStage),
    #[error(transparent)]
    Select(#[from] SelectError),
    #[error(transparent)]
    Secure(#[from] SecureError),
}

impl UpgradeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            UpgradeError::NoSecurityUpgraders
            | UpgradeError::SecurityNegotiationFailed(_)
            | UpgradeError::Secure(_) => ErrorCategory::Security,
            UpgradeError::NoMuxers | UpgradeError::MuxerNegotiationFailed(_) => {
                ErrorCategory::Muxer
            }
            UpgradeError::ConnectionGated(_) => ErrorCategory::Internal,
            UpgradeError::Select(_) => ErrorCategory::Protocol,
        }
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("no configured transport can handle this address")]
    NoSuitableTransport,
    #[error("not connected to {0}")]
    NotConnected(PeerId),
    #[error("could not negotiate an application protocol")]
    ProtocolNegotiationFailed,
    #[error("the node is not running")]
    NodeNotRunning,
    #[error("connection limit reached")]
    ConnectionLimitReached,
    #[error("connection gated at {0}")]
    ConnectionGated(GateStage),
    #[error("{scope} resource limit exceeded for {resource}")]
    ResourceLimitExceeded { scope: String, resource: String },
    #[error("every dial candidate failed")]
    AllDialsFailed,
    #[error("dial timed out")]
    DialTimeout,
    #[error("{0}")]
    Shared(std::sync::Arc<NodeError>),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Upgrade(#[from] UpgradeError),
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Traversal(#[from] crate::traversal::TraversalError),
}

impl NodeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            NodeError::NoSuitableTransport | NodeError::Transport(_) | NodeError::DialTimeout => {
                ErrorCategory::Transport
            }
            NodeError::Upgrade(e) => e.category(),
            NodeError::Mux(_) => ErrorCategory::Muxer,
            NodeError::ProtocolNegotiationFailed => ErrorCategory::Protocol,
            NodeError::NodeNotRunning
            | NodeError::ConnectionLimitReached
            | NodeError::ConnectionGated(_)
            | NodeError::ResourceLimitExceeded { .. } => ErrorCategory::Internal,
            NodeError::NotConnected(_) | NodeError::AllDialsFailed | NodeError::Traversal(_) => {
                ErrorCategory::Unknown
            }
            NodeError::Shared(inner) => inner.category(),
        }
    }

    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            NodeError::Shared(inner) => inner.disconnect_reason(),
            NodeError::ConnectionGated(stage) => DisconnectReason::Gated(*stage),
            NodeError::ConnectionLimitReached | NodeError::ResourceLimitExceeded { .. } => {
                DisconnectReason::LimitExceeded
            }
            NodeError::DialTimeout => DisconnectReason::Timeout,
            other => DisconnectReason::error(other.category(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_equality_is_category_only() {
        let a = DisconnectReason::error(ErrorCategory::Transport, "connection refused");
        let b = DisconnectReason::error(ErrorCategory::Transport, "host unreachable");
        let c = DisconnectReason::error(ErrorCategory::Muxer, "bad frame");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, DisconnectReason::RemoteClose);
    }

    #[test]
    fn recoverability_matrix() {
        assert!(!DisconnectReason::LocalClose.is_recoverable());
        assert!(!DisconnectReason::Gated(GateStage::Dial).is_recoverable());
        assert!(!DisconnectReason::LimitExceeded.is_recoverable());
        assert!(!DisconnectReason::error(ErrorCategory::Protocol, "x").is_recoverable());
        assert!(DisconnectReason::RemoteClose.is_recoverable());
        assert!(DisconnectReason::Timeout.is_recoverable());
        assert!(DisconnectReason::IdleTimeout.is_recoverable());
        assert!(DisconnectReason::HealthCheckFailed.is_recoverable());
        assert!(DisconnectReason::error(ErrorCategory::Transport, "x").is_recoverable());
    }
}
