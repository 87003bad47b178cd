mod error;
mod frame;
mod outgoing;
mod stream;
mod stream_table;
mod window;

use std::{
    convert::Infallible,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use async_io::Timer;
use async_task::Task;
use bytes::Bytes;
use futures_lite::{Future, FutureExt as LiteExt};
use futures_util::{AsyncRead, AsyncReadExt, AsyncWrite, FutureExt, future::Shared, io::BufReader};
use parking_lot::Mutex;
use smol_timeout2::TimeoutExt;
use smolscale::reaper::TaskReaper;
use tachyonix::{Receiver, Sender};

pub use error::MuxError;
pub use frame::{GOAWAY_INTERNAL_ERROR, GOAWAY_NORMAL, GOAWAY_PROTOCOL_ERROR};
pub use stream::MuxStream;
pub use window::{DEFAULT_WINDOW, MAX_WINDOW};

use frame::{
    FLAG_ACK, FLAG_FIN, FLAG_RST, FLAG_SYN, Frame, TYPE_DATA, TYPE_GOAWAY, TYPE_PING,
    TYPE_WINDOW_UPDATE,
};
use outgoing::Outgoing;
use stream_table::StreamTable;

/// The slack the per-stream write pipe adds on top of the flow-control
/// window. Kept small so writers actually park on the window rather than on
/// pipe capacity.
const MSS: usize = 8192;

/// Which end of the underlying connection we are. The initiator allocates odd
/// stream ids, the responder even ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MuxRole {
    Initiator,
    Responder,
}

#[derive(Clone, Copy, Debug)]
pub struct KeepaliveConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MuxConfig {
    pub max_concurrent_streams: usize,
    pub initial_window: u32,
    pub max_frame_size: usize,
    pub accept_backlog: usize,
    pub keepalive: Option<KeepaliveConfig>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 256,
            initial_window: DEFAULT_WINDOW,
            max_frame_size: 64 * 1024,
            accept_backlog: 128,
            keepalive: Some(KeepaliveConfig::default()),
        }
    }
}

/// A multiplexing session wrapping one ordered byte duplex. Streams opened on
/// either side share the connection under per-stream flow control; the
/// session dies as a unit when the underlying connection does.
pub struct BraidMux {
    task: Shared<Task<Arc<Result<Infallible, MuxError>>>>,
    send_open_req: Sender<oneshot::Sender<Result<MuxStream, MuxError>>>,
    recv_accepted: async_channel::Receiver<MuxStream>,
    send_accepted: async_channel::Sender<MuxStream>,
    outgoing: Outgoing,
    goaway_received: Arc<Mutex<Option<u32>>>,
    local_goaway: Arc<AtomicBool>,
    last_ping: Arc<Mutex<Option<Duration>>>,
}

impl BraidMux {
    /// Creates a new mux session over the given connection halves.
    pub fn new(
        read: impl AsyncRead + Send + Unpin + 'static,
        write: impl AsyncWrite + Send + Unpin + 'static,
        role: MuxRole,
        cfg: MuxConfig,
    ) -> Self {
        let (send_open_req, recv_open_req) = tachyonix::channel(1);
        let (send_accepted, recv_accepted) = async_channel::bounded(cfg.accept_backlog);
        let goaway_received = Arc::new(Mutex::new(None));
        let local_goaway = Arc::new(AtomicBool::new(false));
        let last_ping = Arc::new(Mutex::new(None));
        let session_dead = Arc::new(AtomicBool::new(false));
        let table = StreamTable::new(session_dead);
        let outgoing = Outgoing::new(write);

        let task = smolscale::spawn({
            let table = table.clone();
            let send_accepted = send_accepted.clone();
            let outgoing = outgoing.clone();
            let goaway_received = goaway_received.clone();
            let last_ping = last_ping.clone();
            async move {
                let res = mux_inner(
                    read,
                    outgoing,
                    role,
                    cfg,
                    table.clone(),
                    send_accepted.clone(),
                    recv_open_req,
                    goaway_received,
                    last_ping,
                )
                .await;
                // abrupt shutdown: capture-and-clear, then fail everything
                table.reset_all();
                send_accepted.close();
                res
            }
            .map(Arc::new)
        })
        .shared();

        Self {
            task,
            send_open_req,
            recv_accepted,
            send_accepted,
            outgoing,
            goaway_received,
            local_goaway,
            last_ping,
        }
    }

    /// Returns whether the session is alive.
    pub fn is_alive(&self) -> bool {
        self.task.peek().is_none()
    }

    /// Waits for the whole session to die of some error.
    pub async fn wait_until_dead(&self) -> MuxError {
        match self.wait_error::<Infallible>().await {
            Err(e) => e,
            Ok(never) => match never {},
        }
    }

    /// Reads the latency from the last successful keepalive round trip.
    pub fn last_latency(&self) -> Option<Duration> {
        *self.last_ping.lock()
    }

    /// Opens a new stream to the peer.
    pub async fn open(&self) -> Result<MuxStream, MuxError> {
        if self.local_goaway.load(Ordering::SeqCst) {
            return Err(MuxError::GoAway(GOAWAY_NORMAL));
        }
        if let Some(code) = *self.goaway_received.lock() {
            return Err(MuxError::GoAway(code));
        }
        let (send, recv) = oneshot::channel();
        let _ = self.send_open_req.send(send).await;
        async {
            match recv.await {
                Ok(result) => result,
                Err(_) => futures_util::future::pending().await,
            }
        }
        .race(self.wait_error())
        .await
    }

    /// Accepts a stream opened by the peer. Streams come out in exactly the
    /// order their SYN frames arrived.
    pub async fn accept(&self) -> Result<MuxStream, MuxError> {
        let err = self.wait_error();
        async {
            match self.recv_accepted.recv().await {
                Ok(stream) => Ok(stream),
                Err(_) => {
                    if self.local_goaway.load(Ordering::SeqCst) {
                        Err(MuxError::GoAway(GOAWAY_NORMAL))
                    } else if let Some(code) = *self.goaway_received.lock() {
                        Err(MuxError::GoAway(code))
                    } else {
                        futures_util::future::pending().await
                    }
                }
            }
        }
        .race(err)
        .await
    }

    /// Orderly shutdown: tells the peer no new streams will be accepted and
    /// stops handing out inbound streams. Existing streams drain naturally.
    /// Idempotent.
    pub async fn close(&self, code: u32) {
        if !self.local_goaway.swap(true, Ordering::SeqCst) {
            let _ = self
                .outgoing
                .send(Frame::new(TYPE_GOAWAY, 0, 0, code))
                .await;
            self.send_accepted.close();
        }
    }

    fn wait_error<T>(&self) -> impl Future<Output = Result<T, MuxError>> + 'static {
        let res = self.task.clone();
        async move {
            let res = res.await;
            match &*res {
                Err(err) => Err(err.clone()),
                Ok(never) => match *never {},
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn mux_inner(
    read: impl AsyncRead + Send + Unpin + 'static,
    outgoing: Outgoing,
    role: MuxRole,
    cfg: MuxConfig,
    table: StreamTable,
    send_accepted: async_channel::Sender<MuxStream>,
    mut recv_open_req: Receiver<oneshot::Sender<Result<MuxStream, MuxError>>>,
    goaway_received: Arc<Mutex<Option<u32>>>,
    last_ping: Arc<Mutex<Option<Duration>>>,
) -> Result<Infallible, MuxError> {
    let reaper = TaskReaper::new();
    let mut inner_read = BufReader::with_capacity(cfg.max_frame_size * 2, read);
    let (send_pong, recv_pong) = async_channel::unbounded();

    let create_stream = |stream_id: u32, needs_ack: bool| {
        let created = table.create_entry(stream_id, cfg.initial_window, needs_ack);
        let shared = created.entry.shared.clone();
        let send_window = created.entry.send_window.clone();
        let recv_incoming = created.recv_incoming;
        // the read pipe must absorb a full un-credited window so the session
        // never stalls on a slow stream consumer; the write pipe stays small
        // so writers park on the window, not on pipe slack
        let (mut write_incoming, read_incoming) =
            bipe::bipe(cfg.initial_window as usize + cfg.max_frame_size);
        let (write_outgoing, mut read_outgoing) = bipe::bipe(MSS);
        let stream = MuxStream::new(
            stream_id,
            read_incoming,
            write_outgoing,
            shared.clone(),
            outgoing.clone(),
            table.clone(),
            cfg.initial_window,
        );

        // moves inbound frame bodies into the stream's read pipe
        let incoming_task = {
            let shared = shared.clone();
            async move {
                use futures_util::AsyncWriteExt;
                loop {
                    let frame = match recv_incoming.recv().await {
                        Ok(frame) => frame,
                        Err(_) => break,
                    };
                    let fin = frame.header.has(FLAG_FIN);
                    if !frame.body.is_empty()
                        && write_incoming.write_all(&frame.body).await.is_err()
                    {
                        break;
                    }
                    if fin {
                        shared.mark_remote_fin();
                        break;
                    }
                }
            }
        };

        // moves application writes out as DATA frames, under the send window
        let outgoing_task = {
            let outgoing = outgoing.clone();
            let shared = shared.clone();
            let max_frame_size = cfg.max_frame_size;
            async move {
                let mut buf = vec![0u8; max_frame_size];
                loop {
                    let n = match read_outgoing.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    let mut data = Bytes::copy_from_slice(&buf[..n]);
                    while !data.is_empty() {
                        let quantum = send_window.take(data.len().min(max_frame_size)).await;
                        let chunk = data.split_to(quantum);
                        let flags = shared.take_ack();
                        if outgoing
                            .send(Frame::data(stream_id, flags, chunk))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                // local half-close: everything written has been framed
                let flags = FLAG_FIN | shared.take_ack();
                outgoing.enqueue(Frame::data(stream_id, flags, Bytes::new()));
            }
        };

        {
            let table = table.clone();
            let shared = shared.clone();
            reaper.attach(smolscale::spawn(async move {
                futures_util::future::join(incoming_task, outgoing_task)
                    .map(|_| ())
                    .race(shared.wait_reset())
                    .await;
                table.remove(stream_id);
            }));
        }
        stream
    };

    // serves local stream-open requests, allocating parity ids
    let open_req_loop = async {
        let mut next_id: u32 = match role {
            MuxRole::Initiator => 1,
            MuxRole::Responder => 2,
        };
        loop {
            let reply = recv_open_req
                .recv()
                .await
                .map_err(|_| MuxError::ConnectionClosed)?;
            if let Some(code) = *goaway_received.lock() {
                let _ = reply.send(Err(MuxError::GoAway(code)));
                continue;
            }
            if table.len() >= cfg.max_concurrent_streams {
                let _ = reply.send(Err(MuxError::MaxStreamsExceeded));
                continue;
            }
            let stream_id = next_id;
            next_id = match next_id.checked_add(2) {
                Some(id) => id,
                None => return Err(MuxError::ConnectionClosed),
            };
            // SYN goes on the wire before the caller can write any data
            outgoing.enqueue(Frame::new(TYPE_WINDOW_UPDATE, FLAG_SYN, stream_id, 0));
            let stream = create_stream(stream_id, false);
            let _ = reply.send(Ok(stream));
        }
    };

    // periodic keepalive with a monotonically increasing token
    let ping_loop = async {
        let Some(keepalive) = cfg.keepalive else {
            return futures_util::future::pending().await;
        };
        let mut token: u32 = 0;
        loop {
            Timer::after(keepalive.interval).await;
            token = token.wrapping_add(1);
            outgoing.enqueue(Frame::new(TYPE_PING, FLAG_SYN, 0, token));
            let start = Instant::now();
            let wait_match = async {
                loop {
                    match recv_pong.recv().await {
                        Ok(t) if t == token => break,
                        Ok(_) => continue,
                        Err(_) => futures_util::future::pending().await,
                    }
                }
            };
            if wait_match.timeout(keepalive.timeout).await.is_none() {
                tracing::warn!(token, "keepalive went unanswered, killing session");
                return Err(MuxError::KeepaliveTimeout);
            }
            last_ping.lock().replace(start.elapsed());
        }
    };

    // decodes frames off the wire, one at a time
    let read_loop = async {
        let mut last_inbound_id: u32 = 0;
        loop {
            let frame = Frame::read(&mut inner_read, cfg.max_frame_size).await?;
            let header = frame.header;
            tracing::trace!(
                frame_type = header.frame_type,
                flags = header.flags,
                stream_id = header.stream_id,
                length = header.length,
                "got incoming frame"
            );
            match header.frame_type {
                TYPE_DATA | TYPE_WINDOW_UPDATE => {
                    if header.stream_id == 0 {
                        return Err(MuxError::InvalidFrame("stream frame on the session id"));
                    }
                    if header.has(FLAG_RST) {
                        table.trip_reset(header.stream_id);
                        continue;
                    }
                    if header.has(FLAG_SYN) {
                        let stream_id = header.stream_id;
                        let ours = match role {
                            MuxRole::Initiator => stream_id % 2 == 1,
                            MuxRole::Responder => stream_id % 2 == 0,
                        };
                        if ours {
                            return Err(MuxError::InvalidFrame("peer used our id parity"));
                        }
                        if table.contains_id(stream_id) || stream_id <= last_inbound_id {
                            tracing::warn!(stream_id, "SYN reuses a stream id, resetting");
                            outgoing.enqueue(Frame::new(
                                TYPE_WINDOW_UPDATE,
                                FLAG_RST,
                                stream_id,
                                0,
                            ));
                            continue;
                        }
                        if table.len() >= cfg.max_concurrent_streams {
                            tracing::warn!(stream_id, "SYN over the stream limit, resetting");
                            outgoing.enqueue(Frame::new(
                                TYPE_WINDOW_UPDATE,
                                FLAG_RST,
                                stream_id,
                                0,
                            ));
                            continue;
                        }
                        last_inbound_id = stream_id;
                        let stream = create_stream(stream_id, true);
                        if let Err(err) = send_accepted.try_send(stream) {
                            match err {
                                async_channel::TrySendError::Full(_) => {
                                    tracing::warn!(
                                        stream_id,
                                        "accept queue is full, resetting inbound stream"
                                    );
                                    table.trip_reset(stream_id);
                                    outgoing.enqueue(Frame::new(
                                        TYPE_WINDOW_UPDATE,
                                        FLAG_RST,
                                        stream_id,
                                        0,
                                    ));
                                    continue;
                                }
                                async_channel::TrySendError::Closed(_) => {
                                    // we sent GoAway; refuse politely
                                    table.trip_reset(stream_id);
                                    outgoing.enqueue(Frame::new(
                                        TYPE_WINDOW_UPDATE,
                                        FLAG_RST,
                                        stream_id,
                                        0,
                                    ));
                                    continue;
                                }
                            }
                        }
                    }
                    if header.frame_type == TYPE_WINDOW_UPDATE {
                        if header.length > 0 {
                            table.grow_send_window(header.stream_id, header.length);
                        }
                        if header.has(FLAG_FIN) {
                            table.deliver(
                                header.stream_id,
                                Frame::data(header.stream_id, FLAG_FIN, Bytes::new()),
                            );
                        }
                    } else if !table.deliver(header.stream_id, frame) {
                        return Err(MuxError::WindowViolation);
                    }
                }
                TYPE_PING => {
                    if header.has(FLAG_SYN) {
                        outgoing.enqueue(Frame::new(TYPE_PING, FLAG_ACK, 0, header.length));
                    } else if header.has(FLAG_ACK) {
                        let _ = send_pong.send(header.length).await;
                    }
                }
                TYPE_GOAWAY => {
                    tracing::debug!(code = header.length, "peer sent GoAway");
                    goaway_received.lock().replace(header.length);
                    // no new inbound streams; existing ones drain naturally
                    send_accepted.close();
                }
                _ => unreachable!("Frame::read validated the type"),
            }
        }
    };

    open_req_loop.race(ping_loop).race(read_loop).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::{AsyncReadExt, AsyncWriteExt};
    use tracing_test::traced_test;

    fn setup_mux_pair(cfg: MuxConfig) -> (BraidMux, BraidMux) {
        let (a_write, b_read) = bipe::bipe(65536);
        let (b_write, a_read) = bipe::bipe(65536);
        let mux_a = BraidMux::new(a_read, a_write, MuxRole::Initiator, cfg);
        let mux_b = BraidMux::new(b_read, b_write, MuxRole::Responder, cfg);
        (mux_a, mux_b)
    }

    #[traced_test]
    #[test]
    fn test_basic_open_accept() {
        smolscale::block_on(async move {
            let (mux_a, mux_b) = setup_mux_pair(MuxConfig::default());

            let a_proc = async {
                let mut stream_a = mux_a.open().await.unwrap();
                assert_eq!(stream_a.id() % 2, 1);
                stream_a.write_all(b"Hello, world!").await.unwrap();
                stream_a.flush().await.unwrap();
                drop(stream_a);
                futures_util::future::pending().await
            };
            let b_proc = async {
                let mut stream_b = mux_b.accept().await.unwrap();
                let mut buf = vec![0u8; 13];
                stream_b.read_exact(&mut buf).await.unwrap();
                assert_eq!(buf, b"Hello, world!");
            };
            a_proc.race(b_proc).await
        })
    }

    #[test]
    fn test_accept_preserves_syn_order() {
        smolscale::block_on(async move {
            let (mux_a, mux_b) = setup_mux_pair(MuxConfig::default());
            let mut opened = vec![];
            for i in 0u8..5 {
                let mut stream = mux_a.open().await.unwrap();
                stream.write_all(&[i]).await.unwrap();
                stream.flush().await.unwrap();
                opened.push(stream);
            }
            for i in 0u8..5 {
                let mut stream = mux_b.accept().await.unwrap();
                let mut buf = [0u8; 1];
                stream.read_exact(&mut buf).await.unwrap();
                assert_eq!(buf[0], i);
            }
        })
    }

    #[test]
    fn test_half_close() {
        smolscale::block_on(async move {
            let (mux_a, mux_b) = setup_mux_pair(MuxConfig::default());

            let a_proc = async {
                let mut stream_a = mux_a.open().await.unwrap();
                stream_a.write_all(b"request").await.unwrap();
                stream_a.close().await.unwrap();
                // our write side is gone, but the read side still works
                let mut reply = vec![];
                stream_a.read_to_end(&mut reply).await.unwrap();
                assert_eq!(reply, b"response");
            };
            let b_proc = async {
                let mut stream_b = mux_b.accept().await.unwrap();
                let mut request = vec![];
                stream_b.read_to_end(&mut request).await.unwrap();
                assert_eq!(request, b"request");
                stream_b.write_all(b"response").await.unwrap();
                stream_b.close().await.unwrap();
                futures_util::future::pending().await
            };
            a_proc.race(b_proc).await
        })
    }

    #[test]
    fn test_reset_fails_peer_reads() {
        smolscale::block_on(async move {
            let (mux_a, mux_b) = setup_mux_pair(MuxConfig::default());
            let mut stream_a = mux_a.open().await.unwrap();
            stream_a.write_all(b"x").await.unwrap();
            stream_a.flush().await.unwrap();
            let mut stream_b = mux_b.accept().await.unwrap();
            stream_a.reset();
            // the reset lands after the data; pending reads fail
            let mut buf = [0u8; 16];
            let err = loop {
                match stream_b.read(&mut buf).await {
                    Ok(_) => continue,
                    Err(e) => break e,
                }
            };
            assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
        })
    }

    #[test]
    fn test_window_pauses_writer() {
        smolscale::block_on(async move {
            let cfg = MuxConfig {
                initial_window: 65536,
                keepalive: None,
                ..Default::default()
            };
            let (mux_a, mux_b) = setup_mux_pair(cfg);
            let mut stream_a = mux_a.open().await.unwrap();
            let stream_b = mux_b.accept().await;
            let mut stream_b = stream_b.unwrap();

            let payload = vec![7u8; 80000];
            let writer = {
                let payload = payload.clone();
                smolscale::spawn(async move {
                    stream_a.write_all(&payload).await.unwrap();
                    stream_a.close().await.unwrap();
                })
            };
            // without the receiver consuming, the first window's worth goes
            // out and the remainder stays parked
            async_io::Timer::after(Duration::from_millis(100)).await;
            assert!(!writer.is_finished());

            let mut got = vec![];
            stream_b.read_to_end(&mut got).await.unwrap();
            assert_eq!(got.len(), 80000);
            assert_eq!(got, payload);
            writer.await;
        })
    }

    #[test]
    fn test_max_streams() {
        smolscale::block_on(async move {
            let cfg = MuxConfig {
                max_concurrent_streams: 2,
                ..Default::default()
            };
            let (mux_a, _mux_b) = setup_mux_pair(cfg);
            let _s1 = mux_a.open().await.unwrap();
            let _s2 = mux_a.open().await.unwrap();
            assert_eq!(
                mux_a.open().await.unwrap_err(),
                MuxError::MaxStreamsExceeded
            );
        })
    }

    #[test]
    fn test_goaway_stops_new_streams() {
        smolscale::block_on(async move {
            let (mux_a, mux_b) = setup_mux_pair(MuxConfig::default());
            // one stream survives across the goaway
            let mut stream_a = mux_a.open().await.unwrap();
            let mut stream_b = mux_b.accept().await.unwrap();

            mux_b.close(GOAWAY_NORMAL).await;
            assert!(matches!(mux_b.open().await, Err(MuxError::GoAway(_))));
            assert!(matches!(mux_b.accept().await, Err(MuxError::GoAway(_))));

            // a eventually learns and refuses new opens too
            let learned = async {
                loop {
                    match mux_a.open().await {
                        Err(MuxError::GoAway(code)) => break code,
                        _ => {
                            Timer::after(Duration::from_millis(10)).await;
                        }
                    }
                }
            };
            // but the existing stream still moves bytes
            stream_a.write_all(b"still here").await.unwrap();
            stream_a.flush().await.unwrap();
            let mut buf = vec![0u8; 10];
            stream_b.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"still here");

            let code = learned.await;
            assert_eq!(code, GOAWAY_NORMAL);
        })
    }

    #[test]
    fn test_session_death_fails_streams() {
        smolscale::block_on(async move {
            let (a_write, b_read) = bipe::bipe(65536);
            let (b_write, a_read) = bipe::bipe(65536);
            let mux_a = BraidMux::new(a_read, a_write, MuxRole::Initiator, MuxConfig::default());
            let mut stream_a = mux_a.open().await.unwrap();
            // the peer vanishes without a GoAway
            drop(b_read);
            drop(b_write);
            assert!(matches!(
                mux_a.wait_until_dead().await,
                MuxError::ConnectionClosed
            ));
            let mut buf = [0u8; 1];
            let err = loop {
                match stream_a.read(&mut buf).await {
                    Ok(_) => continue,
                    Err(e) => break e,
                }
            };
            assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
        })
    }
}
