use std::sync::{Arc, OnceLock};

use crossbeam_queue::SegQueue;
use futures_lite::{AsyncWrite, AsyncWriteExt};

use crate::frame::Frame;

/// The write half of a session. Frames from every stream funnel through one
/// queue and one flush task, so the wire order is exactly the enqueue order.
#[derive(Clone)]
pub struct Outgoing {
    inner: Arc<Inner>,
    err: Arc<OnceLock<std::io::Error>>,
    _task: Arc<async_task::Task<()>>,
}

impl Outgoing {
    pub fn new(write: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        let inner = Arc::new(Inner::default());
        let err_cell: Arc<OnceLock<std::io::Error>> = Arc::new(OnceLock::new());
        Self {
            inner: inner.clone(),
            err: err_cell.clone(),
            _task: Arc::new(smolscale::spawn({
                let err_cell = err_cell.clone();
                async move {
                    if let Err(err) = outgoing_loop(write, inner).await {
                        let _ = err_cell.set(err);
                    }
                }
            })),
        }
    }

    /// Sends a frame, returning once it has been fully written to the wire.
    pub async fn send(&self, outgoing: Frame) -> std::io::Result<()> {
        self.enqueue(outgoing);
        self.inner
            .shrink_signal
            .wait_until(|| {
                if let Some(err) = self.err.get() {
                    return Some(Err(std::io::Error::new(err.kind(), err.to_string())));
                }
                if self.inner.queue.is_empty() {
                    Some(Ok(()))
                } else {
                    None
                }
            })
            .await
    }

    /// Infallibly, non-blockingly enqueues a frame to be written.
    pub fn enqueue(&self, outgoing: Frame) {
        tracing::trace!(
            frame_type = outgoing.header.frame_type,
            flags = outgoing.header.flags,
            stream_id = outgoing.header.stream_id,
            length = outgoing.header.length,
            "enqueueing outgoing frame"
        );
        self.inner.queue.push(outgoing);
        self.inner.grow_signal.notify_one();
    }
}

#[derive(Default)]
struct Inner {
    queue: SegQueue<Frame>,
    grow_signal: async_event::Event,
    shrink_signal: async_event::Event,
}

async fn outgoing_loop(
    mut write: impl AsyncWrite + Send + Unpin + 'static,
    inner: Arc<Inner>,
) -> std::io::Result<()> {
    scopeguard::defer!(inner.shrink_signal.notify_all());
    loop {
        let next = inner.grow_signal.wait_until(|| inner.queue.pop()).await;
        write.write_all(&next.bytes()).await?;
        // batch whatever accumulated while the last write was in flight
        while let Some(next) = inner.queue.pop() {
            write.write_all(&next.bytes()).await?;
        }
        write.flush().await?;
        inner.shrink_signal.notify_all();
    }
}
