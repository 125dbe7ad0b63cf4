//! Length-prefixed framing for QUIC streams.
//!
//! Layout on the wire: `[length: u32 big endian] + [payload: length bytes]`.
//! The payload is one JSON envelope (or the connect request on the first
//! frame of a client stream).
//!
//! # Invariants
//!
//! - A frame never carries more than [`MAX_FRAME_SIZE`] payload bytes. The
//!   limit is enforced on both encode and decode so a peer cannot make the
//!   reader allocate an arbitrary buffer from a forged prefix.

use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::{ProtocolError, Result};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest accepted frame payload (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Prepend the length prefix to `payload`.
///
/// # Errors
///
/// - `ProtocolError::FrameTooLarge` if `payload` exceeds [`MAX_FRAME_SIZE`]
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    let len = payload_len_u32(payload.len())?;

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Validate a length prefix read from a stream and return the payload size.
///
/// # Errors
///
/// - `ProtocolError::FrameTooLarge` if the declared size exceeds the limit
pub fn payload_len(prefix: [u8; LENGTH_PREFIX_SIZE]) -> Result<usize> {
    let size = u32::from_be_bytes(prefix) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge { size, max: MAX_FRAME_SIZE });
    }
    Ok(size)
}

/// Split the first complete frame off `buf`.
///
/// Returns the payload and the bytes following the frame.
///
/// # Errors
///
/// - `ProtocolError::Truncated` if `buf` ends inside the prefix or payload
/// - `ProtocolError::FrameTooLarge` if the prefix exceeds the limit
pub fn decode_frame(buf: &[u8]) -> Result<(&[u8], &[u8])> {
    let Some((prefix, rest)) = buf.split_first_chunk::<LENGTH_PREFIX_SIZE>() else {
        return Err(ProtocolError::Truncated { expected: LENGTH_PREFIX_SIZE, actual: buf.len() });
    };

    let size = payload_len(*prefix)?;
    if rest.len() < size {
        return Err(ProtocolError::Truncated { expected: size, actual: rest.len() });
    }

    Ok(rest.split_at(size))
}

fn payload_len_u32(len: usize) -> Result<u32> {
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge { size: len, max: MAX_FRAME_SIZE });
    }
    // MAX_FRAME_SIZE fits in u32
    u32::try_from(len).map_err(|_| ProtocolError::FrameTooLarge { size: len, max: MAX_FRAME_SIZE })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_big_endian_length() {
        let frame = encode_frame(b"abc").unwrap();
        assert_eq!(&frame[..], &[0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn decode_returns_remainder() {
        let mut wire = encode_frame(b"one").unwrap().to_vec();
        wire.extend_from_slice(&encode_frame(b"two").unwrap());

        let (first, rest) = decode_frame(&wire).unwrap();
        assert_eq!(first, b"one");
        let (second, rest) = decode_frame(rest).unwrap();
        assert_eq!(second, b"two");
        assert!(rest.is_empty());
    }

    #[test]
    fn empty_payload_is_valid() {
        let frame = encode_frame(&[]).unwrap();
        assert_eq!(decode_frame(&frame).unwrap(), (&[][..], &[][..]));
    }

    #[test]
    fn rejects_oversized_payload() {
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        assert_eq!(
            encode_frame(&payload),
            Err(ProtocolError::FrameTooLarge { size: MAX_FRAME_SIZE + 1, max: MAX_FRAME_SIZE })
        );
    }

    #[test]
    fn rejects_oversized_prefix() {
        let prefix = u32::try_from(MAX_FRAME_SIZE + 1).unwrap().to_be_bytes();
        assert!(matches!(payload_len(prefix), Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn truncated_prefix_and_payload() {
        assert_eq!(
            decode_frame(&[0, 0]),
            Err(ProtocolError::Truncated { expected: 4, actual: 2 })
        );
        assert_eq!(
            decode_frame(&[0, 0, 0, 5, 1, 2]),
            Err(ProtocolError::Truncated { expected: 5, actual: 2 })
        );
    }
}
