//! DBGP frame codec: `<decimal length> NUL <payload> NUL`.

use crate::error::ProtocolError;
use crate::packet::Packet;

/// Longest length prefix accepted before the header is declared garbage.
const MAX_LENGTH_DIGITS: usize = 10;

/// Largest payload the decoder will buffer. Engines cap property data with
/// `max_data`, so anything near this is not a real packet.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Outcome of one decode attempt over a growing buffer.
#[derive(Debug)]
pub enum Decoded {
    /// More bytes are needed; nothing was consumed.
    Incomplete,
    /// A complete packet and the number of bytes it occupied.
    Packet { packet: Packet, consumed: usize },
    /// A complete but unusable frame. Skip `consumed` bytes and keep reading.
    Malformed {
        error: ProtocolError,
        consumed: usize,
    },
}

/// Try to decode one frame from the front of `buf`.
pub fn decode_frame(buf: &[u8]) -> Decoded {
    let Some(header_end) = buf.iter().position(|b| *b == 0) else {
        if buf.len() > MAX_LENGTH_DIGITS || buf.iter().any(|b| !b.is_ascii_digit()) {
            // No NUL yet but the prefix is already invalid: drop it.
            return Decoded::Malformed {
                error: ProtocolError::InvalidLength(String::from_utf8_lossy(buf).into_owned()),
                consumed: buf.len(),
            };
        }
        return Decoded::Incomplete;
    };

    let header = &buf[..header_end];
    let length = match std::str::from_utf8(header)
        .ok()
        .filter(|h| {
            !h.is_empty() && h.len() <= MAX_LENGTH_DIGITS && h.bytes().all(|b| b.is_ascii_digit())
        })
        .and_then(|h| h.parse::<usize>().ok())
        .filter(|len| *len <= MAX_FRAME_SIZE)
    {
        Some(len) => len,
        None => {
            return Decoded::Malformed {
                error: ProtocolError::InvalidLength(String::from_utf8_lossy(header).into_owned()),
                consumed: header_end + 1,
            };
        }
    };

    let payload_start = header_end + 1;
    let Some(consumed) = payload_start
        .checked_add(length)
        .and_then(|end| end.checked_add(1))
    else {
        return Decoded::Malformed {
            error: ProtocolError::InvalidLength(String::from_utf8_lossy(header).into_owned()),
            consumed: payload_start,
        };
    };
    if buf.len() < consumed {
        return Decoded::Incomplete;
    }
    let payload_end = consumed - 1;
    if buf[payload_end] != 0 {
        return Decoded::Malformed {
            error: ProtocolError::MissingTerminator,
            consumed,
        };
    }

    let payload = match std::str::from_utf8(&buf[payload_start..payload_end]) {
        Ok(p) => p,
        Err(_) => {
            return Decoded::Malformed {
                error: ProtocolError::InvalidUtf8,
                consumed,
            };
        }
    };

    match Packet::parse(payload) {
        Ok(packet) => Decoded::Packet { packet, consumed },
        Err(error) => Decoded::Malformed { error, consumed },
    }
}

/// Frame a payload the way an engine does.
pub fn encode_frame(payload: &str) -> Vec<u8> {
    let mut bytes = payload.len().to_string().into_bytes();
    bytes.push(0);
    bytes.extend_from_slice(payload.as_bytes());
    bytes.push(0);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::StreamKind;

    const STATUS: &str =
        r#"<?xml version="1.0" encoding="UTF-8"?><response command="status" transaction_id="1" status="starting" reason="ok"/>"#;

    #[test]
    fn decode_complete_frame() {
        let frame = encode_frame(STATUS);
        match decode_frame(&frame) {
            Decoded::Packet { packet, consumed } => {
                assert_eq!(consumed, frame.len());
                assert!(matches!(packet, Packet::Response(_)));
            }
            other => panic!("expected packet, got {other:?}"),
        }
    }

    #[test]
    fn partial_reads_are_incomplete() {
        let frame = encode_frame(STATUS);
        for cut in [0, 1, 3, frame.len() / 2, frame.len() - 1] {
            assert!(
                matches!(decode_frame(&frame[..cut]), Decoded::Incomplete),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn two_frames_back_to_back() {
        let mut buf = encode_frame(r#"<stream type="stdout" encoding="base64">YQ==</stream>"#);
        let first_len = buf.len();
        buf.extend(encode_frame(STATUS));

        let consumed = match decode_frame(&buf) {
            Decoded::Packet {
                packet: Packet::Stream(s),
                consumed,
            } => {
                assert_eq!(s.kind, StreamKind::Stdout);
                assert_eq!(s.data, "a");
                consumed
            }
            other => panic!("expected stream, got {other:?}"),
        };
        assert_eq!(consumed, first_len);
        assert!(matches!(
            decode_frame(&buf[consumed..]),
            Decoded::Packet { .. }
        ));
    }

    #[test]
    fn non_decimal_length_is_malformed() {
        let buf = b"12x\0<init/>\0";
        match decode_frame(buf) {
            Decoded::Malformed { error, consumed } => {
                assert!(matches!(error, ProtocolError::InvalidLength(_)));
                assert_eq!(consumed, 4);
            }
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[test]
    fn oversized_length_prefix_is_malformed() {
        for buf in [
            &b"18446744073709551615\0x\0"[..],
            &b"99999999999999999999999\0x\0"[..],
            &b"4294967295\0x\0"[..],
        ] {
            match decode_frame(buf) {
                Decoded::Malformed { error, consumed } => {
                    assert!(matches!(error, ProtocolError::InvalidLength(_)));
                    assert_eq!(consumed, buf.iter().position(|b| *b == 0).unwrap() + 1);
                }
                other => panic!("expected malformed, got {other:?}"),
            }
        }
    }

    #[test]
    fn length_at_the_cap_still_waits_for_data() {
        let header = format!("{MAX_FRAME_SIZE}\0");
        assert!(matches!(decode_frame(header.as_bytes()), Decoded::Incomplete));
    }

    #[test]
    fn garbage_without_nul_is_dropped() {
        match decode_frame(b"<html>") {
            Decoded::Malformed { consumed, .. } => assert_eq!(consumed, 6),
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[test]
    fn missing_terminator_is_malformed() {
        let mut buf = b"7\0<init/>".to_vec();
        buf.push(b'X');
        match decode_frame(&buf) {
            Decoded::Malformed { error, consumed } => {
                assert_eq!(error, ProtocolError::MissingTerminator);
                assert_eq!(consumed, buf.len());
            }
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[test]
    fn bad_xml_is_malformed_but_consumed() {
        let frame = encode_frame("<response");
        match decode_frame(&frame) {
            Decoded::Malformed { consumed, .. } => assert_eq!(consumed, frame.len()),
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[test]
    fn length_counts_bytes_not_chars() {
        let payload = r#"<stream type="stdout">héllo</stream>"#;
        let frame = encode_frame(payload);
        match decode_frame(&frame) {
            Decoded::Packet {
                packet: Packet::Stream(s),
                ..
            } => assert_eq!(s.data, "héllo"),
            other => panic!("expected stream, got {other:?}"),
        }
    }
}
