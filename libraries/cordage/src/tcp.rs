use std::net::{IpAddr, SocketAddr, TcpStream};

use async_io::Async;
use async_trait::async_trait;
use futures_lite::{AsyncRead, AsyncWrite};
use pin_project::pin_project;
use skein_wire::{Component, Multiaddr};

use crate::{BoxListener, Listener, RawConn, Transport, TransportError};

/// A transport for `/ip4|ip6/../tcp/..` addresses.
pub struct TcpTransport;

fn socket_addr(addr: &Multiaddr) -> Option<SocketAddr> {
    match addr.components() {
        [Component::Ip4(ip), Component::Tcp(port), ..] => {
            Some(SocketAddr::new(IpAddr::V4(*ip), *port))
        }
        [Component::Ip6(ip), Component::Tcp(port), ..] => {
            Some(SocketAddr::new(IpAddr::V6(*ip), *port))
        }
        _ => None,
    }
}

pub fn multiaddr_of(sock: SocketAddr) -> Multiaddr {
    let ip = match sock.ip() {
        IpAddr::V4(v4) => Component::Ip4(v4),
        IpAddr::V6(v6) => Component::Ip6(v6),
    };
    vec![ip, Component::Tcp(sock.port())].into()
}

#[async_trait]
impl Transport for TcpTransport {
    fn can_dial(&self, addr: &Multiaddr) -> bool {
        socket_addr(addr).is_some()
    }

    fn can_listen(&self, addr: &Multiaddr) -> bool {
        socket_addr(addr).is_some()
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<Box<dyn RawConn>, TransportError> {
        let dest = socket_addr(addr).ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;
        let inner = Async::<TcpStream>::connect(dest)
            .await
            .map_err(TransportError::DialFailed)?;
        let _ = inner.get_ref().set_nodelay(true);
        let local = inner.get_ref().local_addr().ok().map(multiaddr_of);
        Ok(Box::new(TcpConn {
            inner,
            local,
            remote: multiaddr_of(dest),
        }))
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<BoxListener, TransportError> {
        let bind = socket_addr(addr).ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;
        let inner = Async::<std::net::TcpListener>::bind(bind)?;
        let local = multiaddr_of(inner.get_ref().local_addr()?);
        Ok(Box::new(TcpListener {
            inner: Some(inner),
            local,
        }))
    }
}

pub struct TcpListener {
    inner: Option<Async<std::net::TcpListener>>,
    local: Multiaddr,
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&mut self) -> Result<Box<dyn RawConn>, TransportError> {
        let inner = self.inner.as_ref().ok_or(TransportError::ListenerClosed)?;
        let (conn, peer) = inner
            .accept()
            .await
            .inspect_err(|e| tracing::error!(err = debug(e), "failed to accept"))?;
        let _ = conn.get_ref().set_nodelay(true);
        Ok(Box::new(TcpConn {
            inner: conn,
            local: Some(self.local.clone()),
            remote: multiaddr_of(peer),
        }))
    }

    fn local_addr(&self) -> Multiaddr {
        self.local.clone()
    }

    fn close(&mut self) {
        self.inner = None;
    }
}

#[pin_project]
pub struct TcpConn {
    #[pin]
    inner: Async<TcpStream>,
    local: Option<Multiaddr>,
    remote: Multiaddr,
}

impl AsyncRead for TcpConn {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut [u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpConn {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().inner.poll_close(cx)
    }
}

impl RawConn for TcpConn {
    fn local_addr(&self) -> Option<Multiaddr> {
        self.local.clone()
    }

    fn remote_addr(&self) -> Multiaddr {
        self.remote.clone()
    }
}
