use bytes::BytesMut;
use cordage::RawConn;
use futures_util::{AsyncRead, AsyncWrite};
use pin_project::pin_project;
use skein_wire::Multiaddr;

/// A connection wrapper that first replays bytes a negotiation read past its
/// own messages, then delegates to the underlying connection. Without this,
/// early data coalesced into a negotiation read would be lost.
#[pin_project]
pub struct ResidueConn<C> {
    residue: BytesMut,
    #[pin]
    inner: C,
}

impl<C> ResidueConn<C> {
    pub fn new(inner: C, residue: BytesMut) -> Self {
        Self { residue, inner }
    }

    pub fn into_inner(self) -> (C, BytesMut) {
        (self.inner, self.residue)
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for ResidueConn<C> {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut [u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let this = self.project();
        if !this.residue.is_empty() {
            let n = this.residue.len().min(buf.len());
            buf[..n].copy_from_slice(&this.residue.split_to(n));
            return std::task::Poll::Ready(Ok(n));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for ResidueConn<C> {
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

impl<C: RawConn> RawConn for ResidueConn<C> {
    fn local_addr(&self) -> Option<Multiaddr> {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> Multiaddr {
        self.inner.remote_addr()
    }
}
