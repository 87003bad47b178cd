use futures_util::{AsyncRead, AsyncReadExt};
use thiserror::Error;

/// The canonical u64 LEB128 bound: nothing we accept is longer than this,
/// and anything reaching a tenth byte is rejected as overflowing.
pub const MAX_VARINT_LEN: usize = 10;

/// The largest value we encode or decode.
pub const MAX_VARINT_VALUE: u64 = (1 << 63) - 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VarintError {
    #[error("malformed varint encoding")]
    Malformed,
    #[error("varint exceeds 2^63-1")]
    Overflow,
    #[error("varint does not fit a platform index")]
    TooBigForIndex,
}

/// Encodes an unsigned LEB128 varint into the given buffer, returning the
/// initialized prefix.
pub fn encode(mut value: u64, buf: &mut [u8; MAX_VARINT_LEN]) -> &[u8] {
    let mut i = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[i] = byte;
            i += 1;
            return &buf[..i];
        }
        buf[i] = byte | 0x80;
        i += 1;
    }
}

/// Decodes an unsigned LEB128 varint from the front of the buffer. Returns
/// `Ok(None)` when the buffer ends before the varint does, and
/// `Ok(Some((value, consumed)))` otherwise. Overlong encodings and values
/// above 2^63-1 are rejected.
pub fn decode(buf: &[u8]) -> Result<Option<(u64, usize)>, VarintError> {
    let mut value: u64 = 0;
    for (i, byte) in buf.iter().enumerate() {
        if i >= 9 {
            // nine groups of seven bits already cover 2^63-1, so a tenth
            // byte can only encode an overflowing value
            return Err(VarintError::Overflow);
        }
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            if *byte == 0 && i > 0 {
                // a terminal zero byte means the encoding was padded
                return Err(VarintError::Malformed);
            }
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}

/// The stricter variant: decodes a varint and fails unless the result fits a
/// platform index.
pub fn decode_usize(buf: &[u8]) -> Result<Option<(usize, usize)>, VarintError> {
    match decode(buf)? {
        Some((value, consumed)) => {
            let value = usize::try_from(value).map_err(|_| VarintError::TooBigForIndex)?;
            Ok(Some((value, consumed)))
        }
        None => Ok(None),
    }
}

/// Reads a varint from an AsyncRead, one byte at a time.
pub async fn read_varint<R: AsyncRead + Unpin>(mut rdr: R) -> std::io::Result<u64> {
    let mut buf = [0u8; MAX_VARINT_LEN];
    for i in 0..MAX_VARINT_LEN {
        rdr.read_exact(&mut buf[i..i + 1]).await?;
        match decode(&buf[..i + 1]) {
            Ok(Some((value, _))) => return Ok(value),
            Ok(None) => continue,
            Err(e) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    e.to_string(),
                ));
            }
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "varint longer than 10 bytes",
    ))
}
