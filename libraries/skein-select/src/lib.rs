mod residue;

use bytes::BytesMut;
use futures_util::{AsyncRead, AsyncWrite, AsyncWriteExt};
use skein_wire::framed::{FramedError, LpReader, encode_msg};
use thiserror::Error;

pub use residue::ResidueConn;

/// The protocol header both sides announce before anything else.
pub const HEADER: &str = "/multistream/1.0.0";
/// The refusal line.
pub const NA: &str = "na";
/// The listing request.
pub const LS: &str = "ls";

/// Hard caps bounding adversarial stalls.
pub const MAX_PROPOSALS: usize = 100;
pub const MAX_ATTEMPTS: usize = 1000;

/// Negotiation lines are short protocol names; anything bigger is hostile.
const MAX_LINE: usize = 1024;

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("no protocol was proposed")]
    NoProposal,
    #[error("more than {MAX_PROPOSALS} protocols proposed")]
    TooManyProtocols,
    #[error("negotiation exceeded {MAX_ATTEMPTS} attempts")]
    TooManyAttempts,
    #[error("negotiation line is not valid utf-8")]
    InvalidUtf8,
    #[error("negotiation line is not newline-terminated")]
    MalformedLine,
    #[error("could not negotiate a protocol (last tried {0:?})")]
    ProtocolNegotiationFailed(String),
    #[error("message of {size} bytes exceeds the {max}-byte cap")]
    MessageTooLarge { size: u64, max: usize },
    #[error("malformed varint length prefix")]
    InvalidVarint,
    #[error("connection closed mid-negotiation")]
    ConnectionClosed,
    #[error(transparent)]
    Io(std::io::Error),
}

impl From<FramedError> for SelectError {
    fn from(err: FramedError) -> Self {
        match err {
            FramedError::StreamClosed => SelectError::ConnectionClosed,
            FramedError::MessageTooLarge { size, max } => {
                SelectError::MessageTooLarge { size, max }
            }
            FramedError::InvalidVarint => SelectError::InvalidVarint,
            FramedError::Io(e) => SelectError::Io(e),
        }
    }
}

impl From<std::io::Error> for SelectError {
    fn from(err: std::io::Error) -> Self {
        SelectError::Io(err)
    }
}

/// The outcome of a negotiation round: the agreed protocol plus whatever
/// bytes the peer pipelined behind its last negotiation line. Callers must
/// replay the residue (via `ResidueConn`) before reading the connection
/// again.
#[derive(Debug)]
pub struct Negotiated {
    pub protocol: String,
    pub residue: BytesMut,
}

fn encode_line(line: &str, out: &mut Vec<u8>) {
    let mut msg = Vec::with_capacity(line.len() + 1);
    msg.extend_from_slice(line.as_bytes());
    msg.push(b'\n');
    encode_msg(&msg, out);
}

/// Reads one negotiation line, carrying the coalescing residue across calls.
async fn read_line<C: AsyncRead + Unpin>(
    conn: &mut C,
    residue: &mut BytesMut,
) -> Result<String, SelectError> {
    let mut rdr = LpReader::with_residue(&mut *conn, std::mem::take(residue), MAX_LINE);
    let result = rdr.read_msg().await;
    let (_, rest) = rdr.into_parts();
    *residue = rest;
    let raw = result?;
    let line = std::str::from_utf8(&raw).map_err(|_| SelectError::InvalidUtf8)?;
    let line = line.strip_suffix('\n').ok_or(SelectError::MalformedLine)?;
    Ok(line.to_string())
}

/// Runs the initiator side: proposes each protocol in order until the peer
/// accepts one or everything is refused.
pub async fn negotiate_outbound<C: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut C,
    proposals: &[&str],
) -> Result<Negotiated, SelectError> {
    if proposals.is_empty() {
        return Err(SelectError::NoProposal);
    }
    if proposals.len() > MAX_PROPOSALS {
        return Err(SelectError::TooManyProtocols);
    }
    // header and the first proposal coalesce into one write
    let mut buf = vec![];
    encode_line(HEADER, &mut buf);
    encode_line(proposals[0], &mut buf);
    conn.write_all(&buf).await?;
    conn.flush().await?;

    let mut residue = BytesMut::new();
    let their_header = read_line(conn, &mut residue).await?;
    if their_header != HEADER {
        return Err(SelectError::ProtocolNegotiationFailed(their_header));
    }

    let mut proposed = 0usize;
    for attempt in 0..MAX_ATTEMPTS {
        let reply = read_line(conn, &mut residue).await?;
        if reply == proposals[proposed] {
            tracing::debug!(protocol = reply, attempt, "negotiated outbound protocol");
            return Ok(Negotiated {
                protocol: reply,
                residue,
            });
        }
        if reply != NA {
            return Err(SelectError::ProtocolNegotiationFailed(reply));
        }
        proposed += 1;
        if proposed >= proposals.len() {
            return Err(SelectError::ProtocolNegotiationFailed(
                proposals[proposals.len() - 1].to_string(),
            ));
        }
        let mut buf = vec![];
        encode_line(proposals[proposed], &mut buf);
        conn.write_all(&buf).await?;
        conn.flush().await?;
    }
    Err(SelectError::TooManyAttempts)
}

/// Runs the responder side: echoes a line the local offer set contains,
/// refuses everything else, and answers `ls` with the offer list.
pub async fn negotiate_inbound<C: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut C,
    offered: &[&str],
) -> Result<Negotiated, SelectError> {
    if offered.len() > MAX_PROPOSALS {
        return Err(SelectError::TooManyProtocols);
    }
    let mut buf = vec![];
    encode_line(HEADER, &mut buf);
    conn.write_all(&buf).await?;
    conn.flush().await?;

    let mut residue = BytesMut::new();
    let their_header = read_line(conn, &mut residue).await?;
    if their_header != HEADER {
        return Err(SelectError::ProtocolNegotiationFailed(their_header));
    }

    for _ in 0..MAX_ATTEMPTS {
        let line = read_line(conn, &mut residue).await?;
        let mut buf = vec![];
        if line == LS {
            for protocol in offered {
                encode_line(protocol, &mut buf);
            }
        } else if offered.contains(&line.as_str()) {
            encode_line(&line, &mut buf);
        } else {
            encode_line(NA, &mut buf);
        }
        conn.write_all(&buf).await?;
        conn.flush().await?;
        if offered.contains(&line.as_str()) {
            tracing::debug!(protocol = line, "negotiated inbound protocol");
            return Ok(Negotiated {
                protocol: line,
                residue,
            });
        }
    }
    Err(SelectError::TooManyAttempts)
}

/// The optimistic 0-RTT variant: with a single proposal, the header, the
/// proposal and the caller's first application bytes all leave in one write.
/// The reply is still verified; whatever trails it is the peer's early data
/// and comes back as residue.
pub async fn negotiate_outbound_lazy<C: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut C,
    proposal: &str,
    early_data: &[u8],
) -> Result<Negotiated, SelectError> {
    let mut buf = vec![];
    encode_line(HEADER, &mut buf);
    encode_line(proposal, &mut buf);
    buf.extend_from_slice(early_data);
    conn.write_all(&buf).await?;
    conn.flush().await?;

    let mut residue = BytesMut::new();
    let their_header = read_line(conn, &mut residue).await?;
    if their_header != HEADER {
        return Err(SelectError::ProtocolNegotiationFailed(their_header));
    }
    let reply = read_line(conn, &mut residue).await?;
    if reply != proposal {
        return Err(SelectError::ProtocolNegotiationFailed(reply));
    }
    Ok(Negotiated {
        protocol: reply,
        residue,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::{AsyncReadExt, AsyncWriteExt};
    use pin_project::pin_project;

    #[pin_project]
    struct Duplex {
        #[pin]
        read: bipe::BipeReader,
        #[pin]
        write: bipe::BipeWriter,
    }

    impl AsyncRead for Duplex {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut [u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            self.project().read.poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Duplex {
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

    fn duplex_pair() -> (Duplex, Duplex) {
        let (a_write, b_read) = bipe::bipe(4096);
        let (b_write, a_read) = bipe::bipe(4096);
        (
            Duplex {
                read: a_read,
                write: a_write,
            },
            Duplex {
                read: b_read,
                write: b_write,
            },
        )
    }

    #[test]
    fn direct_agreement() {
        smolscale::block_on(async {
            let (mut a, mut b) = duplex_pair();
            let (left, right) = futures_lite::future::zip(
                negotiate_outbound(&mut a, &["/echo/1.0.0"]),
                negotiate_inbound(&mut b, &["/echo/1.0.0", "/other/1.0.0"]),
            )
            .await;
            assert_eq!(left.unwrap().protocol, "/echo/1.0.0");
            assert_eq!(right.unwrap().protocol, "/echo/1.0.0");
        })
    }

    #[test]
    fn fallback_after_na() {
        smolscale::block_on(async {
            let (mut a, mut b) = duplex_pair();
            let (left, right) = futures_lite::future::zip(
                negotiate_outbound(&mut a, &["/a/1", "/b/2"]),
                negotiate_inbound(&mut b, &["/b/2"]),
            )
            .await;
            assert_eq!(left.unwrap().protocol, "/b/2");
            assert_eq!(right.unwrap().protocol, "/b/2");
        })
    }

    #[test]
    fn all_refused() {
        smolscale::block_on(async {
            let (a, b) = duplex_pair();
            let initiator = async move {
                let mut a = a;
                negotiate_outbound(&mut a, &["/a/1", "/b/2"]).await
                // dropping a hangs up on the responder
            };
            let responder = async move {
                let mut b = b;
                negotiate_inbound(&mut b, &["/c/3"]).await
            };
            let (left, right) = futures_lite::future::zip(initiator, responder).await;
            assert!(matches!(
                left.unwrap_err(),
                SelectError::ProtocolNegotiationFailed(p) if p == "/b/2"
            ));
            assert!(matches!(right.unwrap_err(), SelectError::ConnectionClosed));
        })
    }

    #[test]
    fn wire_is_length_prefixed_newline_lines() {
        smolscale::block_on(async {
            let (a, b) = duplex_pair();
            let write_task = async move {
                let mut a = a;
                let _ = negotiate_outbound(&mut a, &["/echo/1.0.0"]).await;
            };
            let read_task = async move {
                let mut raw = b;
                let mut first = vec![0u8; 20];
                raw.read_exact(&mut first).await.unwrap();
                // varint 19, then "/multistream/1.0.0\n"
                assert_eq!(first[0], 19);
                assert_eq!(&first[1..], b"/multistream/1.0.0\n");
                let mut second = vec![0u8; 13];
                raw.read_exact(&mut second).await.unwrap();
                assert_eq!(second[0], 12);
                assert_eq!(&second[1..], b"/echo/1.0.0\n");
            };
            futures_lite::future::zip(write_task, read_task).await;
        })
    }

    #[test]
    fn lazy_carries_early_data_both_ways() {
        smolscale::block_on(async {
            let (mut a, mut b) = duplex_pair();
            let initiator = async {
                let negotiated = negotiate_outbound_lazy(&mut a, "/sec/1", b"client-hello")
                    .await
                    .unwrap();
                assert_eq!(negotiated.protocol, "/sec/1");
                let mut conn = ResidueConn::new(&mut a, negotiated.residue);
                let mut reply = vec![0u8; 12];
                conn.read_exact(&mut reply).await.unwrap();
                assert_eq!(&reply, b"server-hello");
            };
            let responder = async {
                let negotiated = negotiate_inbound(&mut b, &["/sec/1"]).await.unwrap();
                let mut conn = ResidueConn::new(&mut b, negotiated.residue);
                let mut hello = vec![0u8; 12];
                conn.read_exact(&mut hello).await.unwrap();
                assert_eq!(&hello, b"client-hello");
                conn.write_all(b"server-hello").await.unwrap();
                conn.flush().await.unwrap();
            };
            futures_lite::future::zip(initiator, responder).await;
        })
    }

    #[test]
    fn ls_lists_offers() {
        smolscale::block_on(async {
            let (a, mut b) = duplex_pair();
            let asker = async move {
                let mut a = a;
                let mut buf = vec![];
                encode_line(HEADER, &mut buf);
                encode_line(LS, &mut buf);
                a.write_all(&buf).await.unwrap();
                a.flush().await.unwrap();
                let mut residue = BytesMut::new();
                assert_eq!(read_line(&mut a, &mut residue).await.unwrap(), HEADER);
                assert_eq!(read_line(&mut a, &mut residue).await.unwrap(), "/x/1");
                assert_eq!(read_line(&mut a, &mut residue).await.unwrap(), "/y/1");
            };
            let responder = async {
                let _ = negotiate_inbound(&mut b, &["/x/1", "/y/1"]).await;
            };
            futures_lite::future::zip(asker, responder).await;
        })
    }

    #[test]
    fn proposal_caps() {
        smolscale::block_on(async {
            let (mut a, _b) = duplex_pair();
            assert!(matches!(
                negotiate_outbound(&mut a, &[]).await,
                Err(SelectError::NoProposal)
            ));
            let too_many: Vec<&str> = std::iter::repeat_n("/p/1", 101).collect();
            assert!(matches!(
                negotiate_outbound(&mut a, &too_many).await,
                Err(SelectError::TooManyProtocols)
            ));
        })
    }
}
