pub mod crypt;
mod handshake;
pub mod noise;
pub mod plaintext;

use async_trait::async_trait;
use cordage::RawConn;
use futures_util::{AsyncRead, AsyncWrite};
use skein_wire::{Multiaddr, PeerId, framed::FramedError};
use thiserror::Error;

pub use noise::NoiseUpgrader;
pub use plaintext::PlaintextUpgrader;

/// Which side of the handshake we play.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Error)]
pub enum SecureError {
    #[error("peer presented an invalid or small-order public key")]
    InvalidKey,
    #[error("expected peer {expected}, handshake authenticated {got}")]
    PeerIdMismatch { expected: PeerId, got: PeerId },
    #[error("handshake signature did not verify")]
    BadSignature,
    #[error("malformed handshake message")]
    MalformedHandshake,
    #[error("connection closed mid-handshake")]
    ConnectionClosed,
    #[error(transparent)]
    Io(std::io::Error),
}

impl From<FramedError> for SecureError {
    fn from(err: FramedError) -> Self {
        match err {
            FramedError::StreamClosed => SecureError::ConnectionClosed,
            FramedError::InvalidVarint | FramedError::MessageTooLarge { .. } => {
                SecureError::MalformedHandshake
            }
            FramedError::Io(e) => SecureError::Io(e),
        }
    }
}

impl From<std::io::Error> for SecureError {
    fn from(err: std::io::Error) -> Self {
        SecureError::Io(err)
    }
}

/// A security upgrader turns a raw connection into an authenticated (and,
/// plaintext aside, encrypted) one. Which upgrader runs is decided by
/// multistream-select against `protocol_id`.
#[async_trait]
pub trait SecurityUpgrader: Send + Sync + 'static {
    fn protocol_id(&self) -> &str;

    async fn secure(
        &self,
        conn: Box<dyn RawConn>,
        role: Role,
        expected_remote_peer: Option<PeerId>,
    ) -> Result<SecuredConn, SecureError>;
}

/// An authenticated connection: the same byte-duplex shape as a RawConn,
/// plus the identities proven during the handshake.
#[pin_project::pin_project]
pub struct SecuredConn {
    #[pin]
    inner: Box<dyn RawConn>,
    local_peer: PeerId,
    remote_peer: PeerId,
}

impl SecuredConn {
    pub fn new(inner: Box<dyn RawConn>, local_peer: PeerId, remote_peer: PeerId) -> Self {
        Self {
            inner,
            local_peer,
            remote_peer,
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    pub fn local_addr(&self) -> Option<Multiaddr> {
        self.inner.local_addr()
    }

    pub fn remote_addr(&self) -> Multiaddr {
        self.inner.remote_addr()
    }
}

impl std::fmt::Debug for SecuredConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecuredConn(remote={})", self.remote_peer)
    }
}

impl AsyncRead for SecuredConn {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut [u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl AsyncWrite for SecuredConn {
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

#[cfg(test)]
mod tests {
    use super::*;
    use cordage::{Transport, memory::MemoryTransport};
    use futures_lite::future::zip;
    use futures_util::{AsyncReadExt, AsyncWriteExt};
    use skein_wire::KeyPair;

    async fn raw_pair() -> (Box<dyn RawConn>, Box<dyn RawConn>) {
        let mut listener = MemoryTransport
            .listen(&"/memory/0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr();
        let (dialed, accepted) =
            zip(MemoryTransport.dial(&addr), listener.accept()).await;
        (dialed.unwrap(), accepted.unwrap())
    }

    async fn secured_round_trip(make: impl Fn(KeyPair) -> Box<dyn SecurityUpgrader>) {
        let client_key = KeyPair::generate();
        let server_key = KeyPair::generate();
        let client_peer = client_key.peer_id();
        let server_peer = server_key.peer_id();
        let (client_raw, server_raw) = raw_pair().await;

        let client_up = make(client_key);
        let server_up = make(server_key);
        let client_side = client_up.secure(client_raw, Role::Initiator, Some(server_peer));
        let server_side = server_up.secure(server_raw, Role::Responder, None);
        let (client, server) = zip(client_side, server_side).await;
        let (mut client, mut server) = (client.unwrap(), server.unwrap());

        assert_eq!(client.remote_peer(), server_peer);
        assert_eq!(server.remote_peer(), client_peer);

        client.write_all(b"over the wire").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = vec![0u8; 13];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over the wire");

        server.write_all(b"and back").await.unwrap();
        server.flush().await.unwrap();
        let mut buf = vec![0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"and back");
    }

    #[test]
    fn noise_round_trip() {
        smolscale::block_on(secured_round_trip(|key| Box::new(NoiseUpgrader::new(key))))
    }

    #[test]
    fn plaintext_round_trip() {
        smolscale::block_on(secured_round_trip(|key| {
            Box::new(PlaintextUpgrader::new(key))
        }))
    }

    #[test]
    fn peer_id_mismatch_detected() {
        smolscale::block_on(async {
            let client_key = KeyPair::generate();
            let server_key = KeyPair::generate();
            let not_the_server = KeyPair::generate().peer_id();
            let (client_raw, server_raw) = raw_pair().await;

            let client_up = NoiseUpgrader::new(client_key);
            let server_up = NoiseUpgrader::new(server_key);
            let client_side =
                client_up.secure(client_raw, Role::Initiator, Some(not_the_server));
            let server_side = server_up.secure(server_raw, Role::Responder, None);
            let (client, _server) = zip(client_side, server_side).await;
            assert!(matches!(
                client.unwrap_err(),
                SecureError::PeerIdMismatch { .. }
            ));
        })
    }

    #[test]
    fn zero_ephemeral_rejected() {
        smolscale::block_on(async {
            let server_key = KeyPair::generate();
            let (mut client_raw, server_raw) = raw_pair().await;

            let attacker = async move {
                // a handshake opener carrying the all-zero X25519 point
                skein_wire::framed::write_msg(&mut client_raw, &[0u8; 32])
                    .await
                    .unwrap();
                client_raw
            };
            let server_up = NoiseUpgrader::new(server_key);
            let server_side = server_up.secure(server_raw, Role::Responder, None);
            let (_raw, server) = zip(attacker, server_side).await;
            assert!(matches!(server.unwrap_err(), SecureError::InvalidKey));
        })
    }
}
