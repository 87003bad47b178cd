use skein_wire::Multiaddr;

use futures_util::{AsyncRead, AsyncWrite};

pub mod memory;
pub mod tcp;
mod transport;

pub use transport::{BoxListener, Listener, Transport, TransportError};

/// Cordage overall is based on returning connection-like items that implement
/// AsyncRead and AsyncWrite, as well as a few other things. This is called a
/// RawConn: an unauthenticated, unencrypted byte duplex with addressing
/// attached. `poll_close` is idempotent and terminal.
pub trait RawConn: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// The local endpoint, when the transport knows it.
    fn local_addr(&self) -> Option<Multiaddr>;

    /// The remote endpoint.
    fn remote_addr(&self) -> Multiaddr;
}

impl RawConn for Box<dyn RawConn> {
    fn local_addr(&self) -> Option<Multiaddr> {
        (**self).local_addr()
    }

    fn remote_addr(&self) -> Multiaddr {
        (**self).remote_addr()
    }
}

impl std::fmt::Debug for dyn RawConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConn")
            .field("local_addr", &self.local_addr())
            .field("remote_addr", &self.remote_addr())
            .finish()
    }
}
