use async_trait::async_trait;
use skein_wire::Multiaddr;
use thiserror::Error;

use crate::RawConn;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no transport supports {0}")]
    UnsupportedAddress(Multiaddr),
    #[error("dial failed: {0}")]
    DialFailed(#[source] std::io::Error),
    #[error("listener closed")]
    ListenerClosed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Transports create raw connections by dialing out, and listeners by binding
/// locally. Which addresses a transport understands is a static property, so
/// that a set of configured transports can be matched against an address
/// without performing I/O.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn can_dial(&self, addr: &Multiaddr) -> bool;

    fn can_listen(&self, addr: &Multiaddr) -> bool;

    async fn dial(&self, addr: &Multiaddr) -> Result<Box<dyn RawConn>, TransportError>;

    async fn listen(&self, addr: &Multiaddr) -> Result<BoxListener, TransportError>;
}

/// Listeners accept incoming raw connections from some bound endpoint.
/// `close` is idempotent: the first call tears the endpoint down and wakes any
/// pending accept with `ListenerClosed`; later calls do nothing.
#[async_trait]
pub trait Listener: Send + 'static {
    async fn accept(&mut self) -> Result<Box<dyn RawConn>, TransportError>;

    fn local_addr(&self) -> Multiaddr;

    fn close(&mut self);
}

pub type BoxListener = Box<dyn Listener>;
