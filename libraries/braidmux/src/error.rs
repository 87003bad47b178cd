use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MuxError {
    #[error("too many concurrent streams")]
    MaxStreamsExceeded,
    #[error("peer reused stream id {0}")]
    StreamIdReused(u32),
    #[error("frame of {size} bytes exceeds the {max}-byte cap")]
    FrameTooLarge { size: usize, max: usize },
    #[error("peer overran the receive window")]
    WindowViolation,
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    #[error("stream closed")]
    StreamClosed,
    #[error("stream reset")]
    StreamReset,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("peer went away (code {0})")]
    GoAway(u32),
    #[error("keepalive timed out")]
    KeepaliveTimeout,
}

impl From<MuxError> for std::io::Error {
    fn from(err: MuxError) -> Self {
        use std::io::ErrorKind;
        let kind = match &err {
            MuxError::StreamReset => ErrorKind::ConnectionReset,
            MuxError::StreamClosed => ErrorKind::BrokenPipe,
            MuxError::ConnectionClosed => ErrorKind::NotConnected,
            MuxError::GoAway(_) => ErrorKind::ConnectionAborted,
            MuxError::MaxStreamsExceeded => ErrorKind::WouldBlock,
            _ => ErrorKind::InvalidData,
        };
        std::io::Error::new(kind, err.to_string())
    }
}
