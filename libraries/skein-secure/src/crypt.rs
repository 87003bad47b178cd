use async_task::Task;
use bipe::{BipeReader, BipeWriter};
use bytes::BytesMut;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, aead::Aead};
use cordage::RawConn;
use futures_util::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use pin_project::pin_project;
use skein_wire::{
    Multiaddr,
    framed::{LpReader, write_msg},
};

/// Plaintext chunk size per record.
const CHUNK: usize = 8192;
/// Records are chunk + AEAD tag; anything bigger on the wire is hostile.
const MAX_RECORD: usize = CHUNK + 16;

/// An encrypted connection: varint-length-prefixed ChaCha20-Poly1305 records
/// with independent keys and nonce counters per direction, so full-duplex
/// traffic never contends on shared crypto state.
#[pin_project]
pub struct CryptConn {
    #[pin]
    read_incoming: BipeReader,
    _read_task: Task<()>,
    #[pin]
    write_outgoing: BipeWriter,
    _write_task: Task<()>,
    local_addr: Option<Multiaddr>,
    remote_addr: Multiaddr,
}

fn nonce_bytes(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    nonce
}

impl CryptConn {
    /// Wraps an already-handshaken connection. `residue` is whatever
    /// ciphertext the handshake read past its own messages.
    pub fn new(
        conn: Box<dyn RawConn>,
        residue: BytesMut,
        read_key: [u8; 32],
        write_key: [u8; 32],
    ) -> Self {
        let local_addr = conn.local_addr();
        let remote_addr = conn.remote_addr();
        let (pipe_read, mut pipe_write) = conn.split();
        let (mut write_incoming, read_incoming) = bipe::bipe(CHUNK * 4);
        let (write_outgoing, mut read_outgoing) = bipe::bipe(CHUNK * 4);

        let _read_task = smolscale::spawn(async move {
            let read_aead = ChaCha20Poly1305::new_from_slice(&read_key).unwrap();
            let mut rdr = LpReader::with_residue(pipe_read, residue, MAX_RECORD);
            let fallible = async {
                for read_nonce in 0u64.. {
                    let record = rdr
                        .read_msg()
                        .await
                        .map_err(|e| std::io::Error::other(e.to_string()))?;
                    let plaintext = read_aead
                        .decrypt(&nonce_bytes(read_nonce).into(), record.as_ref())
                        .map_err(|_| {
                            std::io::Error::new(
                                std::io::ErrorKind::InvalidData,
                                "record failed to decrypt",
                            )
                        })?;
                    write_incoming.write_all(&plaintext).await?;
                }
                std::io::Result::Ok(())
            };
            if let Err(err) = fallible.await {
                tracing::debug!(err = debug(err), "encrypted read side shutting down");
            }
        });

        let _write_task = smolscale::spawn(async move {
            let write_aead = ChaCha20Poly1305::new_from_slice(&write_key).unwrap();
            let mut buf = [0u8; CHUNK];
            let fallible = async {
                for write_nonce in 0u64.. {
                    let n = read_outgoing.read(&mut buf).await?;
                    if n == 0 {
                        let _ = pipe_write.close().await;
                        break;
                    }
                    let ciphertext = write_aead
                        .encrypt(&nonce_bytes(write_nonce).into(), &buf[..n])
                        .expect("chacha20poly1305 encryption cannot fail");
                    write_msg(&mut pipe_write, &ciphertext).await?;
                }
                std::io::Result::Ok(())
            };
            if let Err(err) = fallible.await {
                tracing::debug!(err = debug(err), "encrypted write side shutting down");
            }
        });

        Self {
            read_incoming,
            _read_task,
            write_outgoing,
            _write_task,
            local_addr,
            remote_addr,
        }
    }
}

impl AsyncRead for CryptConn {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut [u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.project().read_incoming.poll_read(cx, buf)
    }
}

impl AsyncWrite for CryptConn {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.project().write_outgoing.poll_write(cx, buf)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().write_outgoing.poll_flush(cx)
    }

    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().write_outgoing.poll_close(cx)
    }
}

impl RawConn for CryptConn {
    fn local_addr(&self) -> Option<Multiaddr> {
        self.local_addr.clone()
    }

    fn remote_addr(&self) -> Multiaddr {
        self.remote_addr.clone()
    }
}
