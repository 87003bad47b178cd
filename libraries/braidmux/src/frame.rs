use bytes::Bytes;
use futures_util::{AsyncRead, AsyncReadExt};

use crate::MuxError;

pub const TYPE_DATA: u8 = 0;
pub const TYPE_WINDOW_UPDATE: u8 = 1;
pub const TYPE_PING: u8 = 2;
pub const TYPE_GOAWAY: u8 = 3;

pub const FLAG_SYN: u16 = 1;
pub const FLAG_ACK: u16 = 2;
pub const FLAG_FIN: u16 = 4;
pub const FLAG_RST: u16 = 8;

pub const GOAWAY_NORMAL: u32 = 0;
pub const GOAWAY_PROTOCOL_ERROR: u32 = 1;
pub const GOAWAY_INTERNAL_ERROR: u32 = 2;

pub const HEADER_LEN: usize = 12;

/// The fixed 12-byte frame header, big-endian on the wire. The meaning of
/// `length` depends on the type: payload size for DATA, window delta for
/// WINDOW_UPDATE, opaque token for PING, termination code for GOAWAY.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub frame_type: u8,
    pub flags: u16,
    pub stream_id: u32,
    pub length: u32,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.version;
        out[1] = self.frame_type;
        out[2..4].copy_from_slice(&self.flags.to_be_bytes());
        out[4..8].copy_from_slice(&self.stream_id.to_be_bytes());
        out[8..12].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    pub fn decode(raw: &[u8; HEADER_LEN]) -> Self {
        Self {
            version: raw[0],
            frame_type: raw[1],
            flags: u16::from_be_bytes([raw[2], raw[3]]),
            stream_id: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
            length: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
        }
    }

    pub fn has(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

impl std::fmt::Debug for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Header")
            .field("type", &self.frame_type)
            .field("flags", &self.flags)
            .field("stream_id", &self.stream_id)
            .field("length", &self.length)
            .finish()
    }
}

#[derive(Clone)]
pub struct Frame {
    pub header: Header,
    pub body: Bytes,
}

impl Frame {
    pub fn new(frame_type: u8, flags: u16, stream_id: u32, length: u32) -> Self {
        Self {
            header: Header {
                version: 0,
                frame_type,
                flags,
                stream_id,
                length,
            },
            body: Bytes::new(),
        }
    }

    pub fn data(stream_id: u32, flags: u16, body: Bytes) -> Self {
        Self {
            header: Header {
                version: 0,
                frame_type: TYPE_DATA,
                flags,
                stream_id,
                length: body.len() as u32,
            },
            body,
        }
    }

    /// Reads one frame. Only DATA frames carry a payload; everything else
    /// packs its meaning into the length field.
    pub async fn read(
        mut rdr: impl AsyncRead + Unpin,
        max_frame_size: usize,
    ) -> Result<Self, MuxError> {
        let mut header_buf = [0u8; HEADER_LEN];
        rdr.read_exact(&mut header_buf)
            .await
            .map_err(|_| MuxError::ConnectionClosed)?;
        let header = Header::decode(&header_buf);
        if header.version != 0 {
            return Err(MuxError::InvalidFrame("unknown version"));
        }
        if header.frame_type > TYPE_GOAWAY {
            return Err(MuxError::InvalidFrame("unknown frame type"));
        }
        let body = if header.frame_type == TYPE_DATA && header.length > 0 {
            let len = header.length as usize;
            if len > max_frame_size {
                return Err(MuxError::FrameTooLarge {
                    size: len,
                    max: max_frame_size,
                });
            }
            let mut body = vec![0; len];
            rdr.read_exact(&mut body)
                .await
                .map_err(|_| MuxError::ConnectionClosed)?;
            body.into()
        } else {
            Bytes::new()
        };
        Ok(Self { header, body })
    }

    /// The bytes representation of the frame.
    pub fn bytes(&self) -> Bytes {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.body.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.body);
        buf.into()
    }
}
