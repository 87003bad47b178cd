use std::sync::{
    Arc, LazyLock,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_lite::{AsyncRead, AsyncWrite};
use pin_project::pin_project;
use skein_wire::{Component, Multiaddr};

use crate::{BoxListener, Listener, RawConn, Transport, TransportError};

/// The process-wide hub connecting memory dialers to memory listeners, keyed
/// by the `/memory/<id>` endpoint id. Each entry also counts dials, which is
/// how tests observe how many real dials a swarm performed.
static HUB: LazyLock<DashMap<u64, HubEntry>> = LazyLock::new(DashMap::new);

#[derive(Clone)]
struct HubEntry {
    send_conn: async_channel::Sender<MemoryConn>,
    dials: Arc<AtomicU64>,
}

/// How many dials ever reached the given memory endpoint. Zero for endpoints
/// that are not currently listening.
pub fn dial_count(id: u64) -> u64 {
    HUB.get(&id)
        .map(|entry| entry.dials.load(Ordering::Relaxed))
        .unwrap_or(0)
}

fn memory_id(addr: &Multiaddr) -> Option<u64> {
    match addr.components() {
        [Component::Memory(id), ..] => Some(*id),
        _ => None,
    }
}

fn memory_addr(id: u64) -> Multiaddr {
    vec![Component::Memory(id)].into()
}

/// An in-process transport: connections are byte pipes through a global hub.
pub struct MemoryTransport;

#[async_trait]
impl Transport for MemoryTransport {
    fn can_dial(&self, addr: &Multiaddr) -> bool {
        memory_id(addr).is_some()
    }

    fn can_listen(&self, addr: &Multiaddr) -> bool {
        memory_id(addr).is_some()
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<Box<dyn RawConn>, TransportError> {
        let id = memory_id(addr).ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;
        let entry = HUB
            .get(&id)
            .map(|e| e.clone())
            .ok_or_else(|| refused("nobody is listening on this memory endpoint"))?;
        entry.dials.fetch_add(1, Ordering::Relaxed);

        let dialer_id = rand::random::<u64>().max(1);
        let (dialer_write, listener_read) = bipe::bipe(65536);
        let (listener_write, dialer_read) = bipe::bipe(65536);
        let accepted = MemoryConn {
            read: listener_read,
            write: listener_write,
            local: Some(memory_addr(id)),
            remote: memory_addr(dialer_id),
        };
        entry
            .send_conn
            .send(accepted)
            .await
            .map_err(|_| refused("memory endpoint shut down mid-dial"))?;
        Ok(Box::new(MemoryConn {
            read: dialer_read,
            write: dialer_write,
            local: Some(memory_addr(dialer_id)),
            remote: memory_addr(id),
        }))
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<BoxListener, TransportError> {
        let mut id = memory_id(addr).ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;
        if id == 0 {
            id = rand::random::<u64>().max(1);
        }
        let (send_conn, recv_conn) = async_channel::bounded(16);
        let entry = HubEntry {
            send_conn,
            dials: Arc::new(AtomicU64::new(0)),
        };
        match HUB.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    "memory endpoint already taken",
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
        Ok(Box::new(MemoryListener {
            id,
            recv_conn,
            local: memory_addr(id),
        }))
    }
}

fn refused(msg: &str) -> TransportError {
    TransportError::DialFailed(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        msg.to_string(),
    ))
}

pub struct MemoryListener {
    id: u64,
    recv_conn: async_channel::Receiver<MemoryConn>,
    local: Multiaddr,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Result<Box<dyn RawConn>, TransportError> {
        let conn = self
            .recv_conn
            .recv()
            .await
            .map_err(|_| TransportError::ListenerClosed)?;
        Ok(Box::new(conn))
    }

    fn local_addr(&self) -> Multiaddr {
        self.local.clone()
    }

    fn close(&mut self) {
        if HUB.remove(&self.id).is_some() {
            self.recv_conn.close();
        }
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.close();
    }
}

#[pin_project]
pub struct MemoryConn {
    #[pin]
    read: bipe::BipeReader,
    #[pin]
    write: bipe::BipeWriter,
    local: Option<Multiaddr>,
    remote: Multiaddr,
}

impl AsyncRead for MemoryConn {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut [u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.project().read.poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryConn {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.project().write.poll_write(cx, buf)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().write.poll_flush(cx)
    }

    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().write.poll_close(cx)
    }
}

impl RawConn for MemoryConn {
    fn local_addr(&self) -> Option<Multiaddr> {
        self.local.clone()
    }

    fn remote_addr(&self) -> Multiaddr {
        self.remote.clone()
    }
}
