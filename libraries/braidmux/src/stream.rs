use std::{
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::Poll,
};

use futures_util::{AsyncRead, AsyncWrite};
use pin_project::pin_project;

use crate::{
    MuxError,
    frame::{FLAG_ACK, FLAG_RST, Frame, TYPE_WINDOW_UPDATE},
    outgoing::Outgoing,
    stream_table::StreamTable,
};

/// State a stream shares with its session: the reset latch, the
/// session-death latch, and the one-shot ACK obligation of a locally-accepted
/// stream. The movers and the session read loop flip these; the user-facing
/// stream only ever reads them.
pub(crate) struct StreamShared {
    reset: AtomicBool,
    remote_fin: AtomicBool,
    needs_ack: AtomicBool,
    session_dead: Arc<AtomicBool>,
    reset_evt: async_event::Event,
}

impl StreamShared {
    pub fn new(session_dead: Arc<AtomicBool>, needs_ack: bool) -> Self {
        Self {
            reset: AtomicBool::new(false),
            remote_fin: AtomicBool::new(false),
            needs_ack: AtomicBool::new(needs_ack),
            session_dead,
            reset_evt: async_event::Event::new(),
        }
    }

    /// The flag bits the next outbound frame on this stream should carry. The
    /// first frame an accepting side sends doubles as the positive ACK.
    pub fn take_ack(&self) -> u16 {
        if self.needs_ack.swap(false, Ordering::SeqCst) {
            FLAG_ACK
        } else {
            0
        }
    }

    pub fn trip_reset(&self) {
        self.reset.store(true, Ordering::SeqCst);
        self.reset_evt.notify_all();
    }

    pub fn mark_remote_fin(&self) {
        self.remote_fin.store(true, Ordering::SeqCst);
    }

    pub fn remote_fin(&self) -> bool {
        self.remote_fin.load(Ordering::SeqCst)
    }

    /// Waits until the stream is reset, for movers parked on other work.
    pub async fn wait_reset(&self) {
        self.reset_evt
            .wait_until(|| self.reset.load(Ordering::SeqCst).then_some(()))
            .await
    }

    /// The error current stream operations should fail with, if any.
    pub fn error(&self) -> Option<MuxError> {
        if self.session_dead.load(Ordering::SeqCst) {
            Some(MuxError::ConnectionClosed)
        } else if self.reset.load(Ordering::SeqCst) {
            Some(MuxError::StreamReset)
        } else {
            None
        }
    }

    pub fn is_reset(&self) -> bool {
        self.reset.load(Ordering::SeqCst)
    }
}

/// One multiplexed bidirectional byte stream. Closing the write half (via
/// `poll_close` or drop) sends FIN and half-closes; the read half keeps
/// delivering whatever the peer sends until its own FIN. `reset` tears both
/// directions down immediately.
#[pin_project]
pub struct MuxStream {
    id: u32,
    #[pin]
    read_incoming: bipe::BipeReader,
    #[pin]
    write_outgoing: bipe::BipeWriter,
    shared: Arc<StreamShared>,
    outgoing: Outgoing,
    table: StreamTable,
    credit_pending: u64,
    credit_threshold: u64,
}

impl MuxStream {
    pub(crate) fn new(
        id: u32,
        read_incoming: bipe::BipeReader,
        write_outgoing: bipe::BipeWriter,
        shared: Arc<StreamShared>,
        outgoing: Outgoing,
        table: StreamTable,
        initial_window: u32,
    ) -> Self {
        Self {
            id,
            read_incoming,
            write_outgoing,
            shared,
            outgoing,
            table,
            credit_pending: 0,
            credit_threshold: (initial_window / 2).max(1) as u64,
        }
    }

    /// The per-session stream id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Forcibly terminates both directions, telling the peer via RST. Any
    /// pending read or write fails with `StreamReset`.
    pub fn reset(&mut self) {
        if !self.shared.is_reset() {
            self.outgoing
                .enqueue(Frame::new(TYPE_WINDOW_UPDATE, FLAG_RST, self.id, 0));
            self.table.trip_reset(self.id);
        }
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MuxStream({})", self.id)
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();
        if let Some(err) = this.shared.error() {
            return Poll::Ready(Err(err.into()));
        }
        match this.read_incoming.poll_read(cx, buf) {
            Poll::Ready(Ok(0)) if buf.is_empty() => Poll::Ready(Ok(0)),
            Poll::Ready(Ok(0)) => {
                // EOF from the pipe: a clean remote FIN after draining, or
                // the session tearing down underneath us.
                if this.shared.remote_fin() {
                    Poll::Ready(Ok(0))
                } else if let Some(err) = this.shared.error() {
                    Poll::Ready(Err(err.into()))
                } else {
                    Poll::Ready(Ok(0))
                }
            }
            Poll::Ready(Ok(n)) => {
                // consumed bytes earn the peer credit; batch the grants so we
                // do not spray a WINDOW_UPDATE per read
                *this.credit_pending += n as u64;
                if *this.credit_pending >= *this.credit_threshold {
                    let delta = (*this.credit_pending).min(u32::MAX as u64) as u32;
                    this.table.credit_recv_window(*this.id, delta);
                    this.outgoing.enqueue(Frame::new(
                        TYPE_WINDOW_UPDATE,
                        this.shared.take_ack(),
                        *this.id,
                        delta,
                    ));
                    *this.credit_pending = 0;
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();
        if let Some(err) = this.shared.error() {
            return Poll::Ready(Err(err.into()));
        }
        this.write_outgoing
            .poll_write(cx, buf)
            .map_err(|_| MuxError::StreamClosed.into())
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.project()
            .write_outgoing
            .poll_flush(cx)
            .map_err(|_| MuxError::StreamClosed.into())
    }

    fn poll_close(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.project()
            .write_outgoing
            .poll_close(cx)
            .map_err(|_| MuxError::StreamClosed.into())
    }
}
