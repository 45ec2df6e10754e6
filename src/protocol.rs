//! Length-prefixed wire framing.
//!
//! Every message in both directions is a decimal ASCII byte count, a newline,
//! then exactly that many payload bytes:
//!
//! ```text
//! 5\nhello
//! ```
//!
//! There is no terminator after the payload. Bytes following a complete frame
//! are left in the buffer for the next one.

use bytes::{BufMut, Bytes, BytesMut};

/// Outcome of trying to decode a frame from the front of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decode<'a> {
    /// Need more bytes: no newline yet, or the payload is short.
    Incomplete,
    /// The length token is empty or not a decimal number.
    ///
    /// Callers keep buffering on this outcome just as they do for
    /// `Incomplete`; the frame will never complete on its own.
    Malformed,
    /// A full frame is buffered.
    Complete {
        /// Payload bytes (exactly the advertised length).
        payload: &'a [u8],
        /// Prefix + newline + payload.
        consumed: usize,
    },
}

/// Encode `payload` as a standalone frame.
pub fn encode(payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 21);
    encode_into(payload, &mut out);
    out.freeze()
}

/// Append the framed form of `payload` to `dst`.
pub fn encode_into(payload: &[u8], dst: &mut BytesMut) {
    let header = format!("{}\n", payload.len());
    dst.reserve(header.len() + payload.len());
    dst.put_slice(header.as_bytes());
    dst.put_slice(payload);
}

/// Try to decode one frame from the front of `input`.
pub fn try_decode(input: &[u8]) -> Decode<'_> {
    let line_end = match input.iter().position(|&b| b == b'\n') {
        Some(pos) => pos,
        None => return Decode::Incomplete,
    };

    let length = match parse_length(&input[..line_end]) {
        Some(len) => len,
        None => return Decode::Malformed,
    };

    let header_len = line_end + 1;
    if input.len() - header_len < length {
        return Decode::Incomplete;
    }

    Decode::Complete {
        payload: &input[header_len..header_len + length],
        consumed: header_len + length,
    }
}

/// Split a complete frame off the front of `buf`, returning its payload.
///
/// Leaves `buf` untouched unless a full frame is present.
pub fn take_frame(buf: &mut BytesMut) -> Option<Bytes> {
    let (header_len, consumed) = match try_decode(buf) {
        Decode::Complete { payload, consumed } => (consumed - payload.len(), consumed),
        _ => return None,
    };

    let mut frame = buf.split_to(consumed);
    Some(frame.split_off(header_len).freeze())
}

/// Parse a length token: non-empty, ASCII digits only, fits in `usize`.
fn parse_length(token: &[u8]) -> Option<usize> {
    if token.is_empty() || !token.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(token).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        assert_eq!(&encode(b"hello")[..], b"5\nhello");
        assert_eq!(&encode(b"")[..], b"0\n");

        let payload = vec![b'x'; 1234];
        let frame = encode(&payload);
        assert!(frame.starts_with(b"1234\n"));
        assert_eq!(frame.len(), 5 + 1234);
    }

    #[test]
    fn test_encode_into_appends() {
        let mut buf = BytesMut::from(&b"3\nabc"[..]);
        encode_into(b"de", &mut buf);
        assert_eq!(&buf[..], b"3\nabc2\nde");
    }

    #[test]
    fn test_decode_complete() {
        match try_decode(b"5\nhello") {
            Decode::Complete { payload, consumed } => {
                assert_eq!(payload, b"hello");
                assert_eq!(consumed, 7);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_empty_payload() {
        assert_eq!(
            try_decode(b"0\n"),
            Decode::Complete {
                payload: b"",
                consumed: 2
            }
        );
    }

    #[test]
    fn test_decode_roundtrip_binary() {
        let payload: Vec<u8> = (0..=255u8).chain(b"\n\n12\n".iter().copied()).collect();
        let frame = encode(&payload);
        match try_decode(&frame) {
            Decode::Complete { payload: p, consumed } => {
                assert_eq!(p, &payload[..]);
                assert_eq!(consumed, frame.len());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_every_proper_prefix_is_incomplete() {
        let frame = encode(b"length prefixed\npayload");
        for end in 0..frame.len() {
            assert_eq!(
                try_decode(&frame[..end]),
                Decode::Incomplete,
                "prefix of {end} bytes"
            );
        }
    }

    #[test]
    fn test_decode_malformed() {
        assert_eq!(try_decode(b"abc\nxyz"), Decode::Malformed);
        assert_eq!(try_decode(b"\nxyz"), Decode::Malformed);
        assert_eq!(try_decode(b"-5\nhello"), Decode::Malformed);
        assert_eq!(try_decode(b"5 \nhello"), Decode::Malformed);
        assert_eq!(try_decode(b"99999999999999999999999\n"), Decode::Malformed);
    }

    #[test]
    fn test_decode_no_newline_is_incomplete() {
        assert_eq!(try_decode(b""), Decode::Incomplete);
        assert_eq!(try_decode(b"12"), Decode::Incomplete);
        // Garbage without a newline cannot be judged yet
        assert_eq!(try_decode(b"abc"), Decode::Incomplete);
    }

    #[test]
    fn test_decode_leaves_trailing_bytes() {
        match try_decode(b"3\nabc4\nwxyz") {
            Decode::Complete { payload, consumed } => {
                assert_eq!(payload, b"abc");
                assert_eq!(consumed, 5);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_take_frame_splits_buffer() {
        let mut buf = BytesMut::from(&b"3\nabc4\nwx"[..]);

        let first = take_frame(&mut buf).unwrap();
        assert_eq!(&first[..], b"abc");
        assert_eq!(&buf[..], b"4\nwx");

        // Second frame not complete yet
        assert!(take_frame(&mut buf).is_none());
        assert_eq!(&buf[..], b"4\nwx");

        buf.extend_from_slice(b"yz");
        assert_eq!(&take_frame(&mut buf).unwrap()[..], b"wxyz");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_take_frame_ignores_malformed() {
        let mut buf = BytesMut::from(&b"abc\nxyz"[..]);
        assert!(take_frame(&mut buf).is_none());
        assert_eq!(&buf[..], b"abc\nxyz");
    }
}
