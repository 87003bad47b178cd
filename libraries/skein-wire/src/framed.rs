use bytes::{Bytes, BytesMut};
use futures_util::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use thiserror::Error;

use crate::varint;

/// The default cap on a single length-prefixed message.
pub const DEFAULT_MAX_MSG_SIZE: usize = 64 * 1024;

const READ_CHUNK: usize = 8192;

#[derive(Debug, Error)]
pub enum FramedError {
    #[error("stream closed before a full message arrived")]
    StreamClosed,
    #[error("message of {size} bytes exceeds the {max}-byte cap")]
    MessageTooLarge { size: u64, max: usize },
    #[error("malformed varint length prefix")]
    InvalidVarint,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A reader of varint-length-prefixed messages. Multiple messages may arrive
/// coalesced in one underlying read, so the reader keeps whatever trails the
/// current message in a persistent residue buffer for the next call.
pub struct LpReader<R> {
    inner: R,
    residue: BytesMut,
    max_size: usize,
}

impl<R: AsyncRead + Unpin> LpReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_size(inner, DEFAULT_MAX_MSG_SIZE)
    }

    pub fn with_max_size(inner: R, max_size: usize) -> Self {
        Self {
            inner,
            residue: BytesMut::new(),
            max_size,
        }
    }

    /// Seeds the residue buffer, for callers that already consumed bytes past
    /// the end of whatever they were parsing.
    pub fn with_residue(inner: R, residue: impl Into<BytesMut>, max_size: usize) -> Self {
        Self {
            inner,
            residue: residue.into(),
            max_size,
        }
    }

    /// Reads the next length-prefixed message.
    pub async fn read_msg(&mut self) -> Result<Bytes, FramedError> {
        let (len, consumed) = loop {
            match varint::decode_usize(&self.residue) {
                Ok(Some(hit)) => break hit,
                Ok(None) => self.fill().await?,
                Err(_) => return Err(FramedError::InvalidVarint),
            }
        };
        if len > self.max_size {
            return Err(FramedError::MessageTooLarge {
                size: len as u64,
                max: self.max_size,
            });
        }
        let _ = self.residue.split_to(consumed);
        while self.residue.len() < len {
            self.fill().await?;
        }
        Ok(self.residue.split_to(len).freeze())
    }

    async fn fill(&mut self) -> Result<(), FramedError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.inner.read(&mut chunk).await?;
        if n == 0 {
            return Err(FramedError::StreamClosed);
        }
        self.residue.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Tears the reader apart, handing back the underlying reader and any
    /// bytes read past the last message.
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.residue)
    }
}

/// Writes one varint-length-prefixed message and flushes.
pub async fn write_msg<W: AsyncWrite + Unpin>(mut out: W, msg: &[u8]) -> std::io::Result<()> {
    let mut len_buf = [0u8; varint::MAX_VARINT_LEN];
    let len = varint::encode(msg.len() as u64, &mut len_buf);
    out.write_all(len).await?;
    out.write_all(msg).await?;
    out.flush().await
}

/// Encodes one length-prefixed message into a buffer without writing it, for
/// callers that coalesce several messages into a single write.
pub fn encode_msg(msg: &[u8], out: &mut Vec<u8>) {
    let mut len_buf = [0u8; varint::MAX_VARINT_LEN];
    out.extend_from_slice(varint::encode(msg.len() as u64, &mut len_buf));
    out.extend_from_slice(msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_coalesced_messages() {
        futures_lite::future::block_on(async {
            let mut wire = vec![];
            encode_msg(b"hello", &mut wire);
            encode_msg(b"world!", &mut wire);
            let mut rdr = LpReader::new(&wire[..]);
            assert_eq!(&rdr.read_msg().await.unwrap()[..], b"hello");
            assert_eq!(&rdr.read_msg().await.unwrap()[..], b"world!");
            assert!(matches!(
                rdr.read_msg().await,
                Err(FramedError::StreamClosed)
            ));
        })
    }

    #[test]
    fn rejects_oversized() {
        futures_lite::future::block_on(async {
            let mut wire = vec![];
            encode_msg(&vec![0u8; 100], &mut wire);
            let mut rdr = LpReader::with_max_size(&wire[..], 64);
            assert!(matches!(
                rdr.read_msg().await,
                Err(FramedError::MessageTooLarge { size: 100, max: 64 })
            ));
        })
    }

    #[test]
    fn eof_mid_varint_is_stream_closed() {
        futures_lite::future::block_on(async {
            let wire = [0x80u8];
            let mut rdr = LpReader::new(&wire[..]);
            assert!(matches!(
                rdr.read_msg().await,
                Err(FramedError::StreamClosed)
            ));
        })
    }

    #[test]
    fn residue_survives_into_parts() {
        futures_lite::future::block_on(async {
            let mut wire = vec![];
            encode_msg(b"first", &mut wire);
            wire.extend_from_slice(b"leftover");
            let mut rdr = LpReader::new(&wire[..]);
            assert_eq!(&rdr.read_msg().await.unwrap()[..], b"first");
            let (_inner, residue) = rdr.into_parts();
            assert_eq!(&residue[..], b"leftover");
        })
    }

    #[test]
    fn malformed_varint() {
        futures_lite::future::block_on(async {
            let wire = [0x81u8, 0x00, b'x'];
            let mut rdr = LpReader::new(&wire[..]);
            assert!(matches!(
                rdr.read_msg().await,
                Err(FramedError::InvalidVarint)
            ));
        })
    }
}
