//! The gRPC length-delimited message envelope.
//!
//! Every message on the wire is prefixed with a fixed five byte header: one
//! compression flag byte followed by a big-endian `u32` payload length. The
//! same envelope applies to requests, unary responses, and each streamed
//! push.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Code, Status};

/// Size of the envelope header: compression flag + payload length.
pub const HEADER_SIZE: usize =
    // compression flag
    std::mem::size_of::<u8>() +
    // data length
    std::mem::size_of::<u32>();

/// Errors produced by [`encode`] and [`decode`] on malformed envelopes.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    /// The frame is shorter than the five byte header.
    #[error("frame of {0} bytes is shorter than the {HEADER_SIZE} byte header")]
    Truncated(usize),

    /// The compression flag was set. Compressed messages are not supported.
    #[error("compression flag {0:#04x} is set, compressed messages are not supported")]
    Compressed(u8),

    /// The declared payload length does not match the bytes that follow the
    /// header.
    #[error("length prefix declares {declared} bytes but {actual} follow the header")]
    LengthMismatch { declared: u32, actual: usize },

    /// The payload is too large for the `u32` length prefix.
    #[error("message of {0} bytes exceeds the u32 length prefix")]
    Oversize(usize),
}

impl From<FramingError> for Status {
    fn from(err: FramingError) -> Self {
        Status::new(Code::Internal, err.to_string())
    }
}

/// Wrap `payload` in the gRPC message envelope.
///
/// The compression flag is always zero.
pub fn encode(payload: &[u8]) -> Result<Bytes, FramingError> {
    if payload.len() > u32::MAX as usize {
        return Err(FramingError::Oversize(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(0);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Strip the envelope from `frame` and return the payload.
///
/// The declared length must match the actual payload size exactly; a mismatch
/// is a hard protocol error, never a truncated success.
pub fn decode(frame: impl Into<Bytes>) -> Result<Bytes, FramingError> {
    let mut frame = frame.into();

    if frame.len() < HEADER_SIZE {
        return Err(FramingError::Truncated(frame.len()));
    }

    let flag = frame.get_u8();
    if flag != 0 {
        return Err(FramingError::Compressed(flag));
    }

    let declared = frame.get_u32();
    if declared as usize != frame.len() {
        return Err(FramingError::LengthMismatch {
            declared,
            actual: frame.len(),
        });
    }

    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn roundtrip(payload: Vec<u8>) -> bool {
        let framed = encode(&payload).unwrap();
        decode(framed).unwrap() == payload.as_slice()
    }

    #[test]
    fn encode_header_layout() {
        let framed = encode(b"abc").unwrap();
        assert_eq!(&framed[..], &[0, 0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn encode_empty() {
        let framed = encode(b"").unwrap();
        assert_eq!(&framed[..], &[0, 0, 0, 0, 0]);
        assert!(decode(framed).unwrap().is_empty());
    }

    #[test]
    fn decode_truncated() {
        assert_eq!(decode(&b"\0\0\0"[..]), Err(FramingError::Truncated(3)));
    }

    #[test]
    fn decode_compressed_flag() {
        let frame = &[1u8, 0, 0, 0, 1, b'x'][..];
        assert_eq!(decode(frame), Err(FramingError::Compressed(1)));
    }

    #[test]
    fn decode_length_mismatch() {
        // declares 4 bytes, carries 2
        let frame = &[0u8, 0, 0, 0, 4, b'h', b'i'][..];
        assert_eq!(
            decode(frame),
            Err(FramingError::LengthMismatch {
                declared: 4,
                actual: 2
            })
        );
    }

    #[test]
    fn framing_error_maps_to_internal() {
        let status: Status = FramingError::Truncated(0).into();
        assert_eq!(status.code(), Code::Internal);
    }
}
