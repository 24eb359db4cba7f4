//! Newline-delimited JSON framing.
//!
//! Each frame is one compact JSON object followed by a single `\n`. JSON
//! escapes raw newlines inside strings, so the delimiter never appears in a
//! payload.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use super::protocol::{Message, ProtocolError};

/// Default upper bound for a single frame (1 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

const DELIMITER: u8 = b'\n';

/// Result of decoding one delimited line.
#[derive(Debug)]
pub enum Frame {
    /// A well-formed message
    Message(Message),
    /// A line that could not be decoded; the bytes are already consumed
    Malformed { line: String, reason: String },
}

/// Codec for newline-delimited JSON messages
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_frame_length: usize,
    /// Bytes already scanned for a delimiter in the current buffer
    next_index: usize,
}

impl MessageCodec {
    /// Create a codec with the default frame limit
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Create a codec that rejects frames longer than `max_frame_length`
    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            max_frame_length,
            next_index: 0,
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a message into a complete frame, delimiter included
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    message.validate()?;
    let mut frame = serde_json::to_vec(message)?;
    frame.push(DELIMITER);
    Ok(frame)
}

/// Decode the body of one line (delimiter already stripped)
pub fn decode_line(line: &[u8]) -> Frame {
    let result = serde_json::from_slice::<Message>(line)
        .map_err(ProtocolError::from)
        .and_then(|message| message.validate().map(|_| message));

    match result {
        Ok(message) => Frame::Message(message),
        Err(e) => Frame::Malformed {
            line: String::from_utf8_lossy(line).into_owned(),
            reason: e.to_string(),
        },
    }
}

impl Decoder for MessageCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        loop {
            let start = self.next_index.min(src.len());
            let Some(offset) = src[start..].iter().position(|b| *b == DELIMITER) else {
                if src.len() > self.max_frame_length {
                    return Err(ProtocolError::FrameTooLong {
                        length: src.len(),
                        max: self.max_frame_length,
                    });
                }
                self.next_index = src.len();
                return Ok(None);
            };

            let end = start + offset;
            self.next_index = 0;
            let line = src.split_to(end + 1);
            let body = line[..end].trim_ascii();

            if body.is_empty() {
                continue;
            }
            if body.len() > self.max_frame_length {
                return Err(ProtocolError::FrameTooLong {
                    length: body.len(),
                    max: self.max_frame_length,
                });
            }

            return Ok(Some(decode_line(body)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        // An unterminated tail is not a frame
        if !src.is_empty() {
            debug!("Discarding {} unterminated bytes at end of stream", src.len());
            src.clear();
        }
        self.next_index = 0;
        Ok(None)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let frame = encode_frame(&message)?;
        if frame.len() - 1 > self.max_frame_length {
            return Err(ProtocolError::FrameTooLong {
                length: frame.len() - 1,
                max: self.max_frame_length,
            });
        }

        dst.reserve(frame.len());
        dst.put_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::MessageKind;
    use serde_json::json;

    fn message(kind: &str, data: serde_json::Value) -> Message {
        Message {
            kind: MessageKind::from(kind),
            timestamp: 1_700_000_000.0,
            data,
        }
    }

    fn expect_message(frame: Option<Frame>) -> Message {
        match frame {
            Some(Frame::Message(message)) => message,
            other => panic!("expected a message, got {:?}", other),
        }
    }

    #[test]
    fn test_roundtrip() {
        let mut codec = MessageCodec::new();
        let original = message("t", json!({"k": "v"}));

        let mut buf = BytesMut::new();
        codec.encode(original.clone(), &mut buf).unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));

        let decoded = expect_message(codec.decode(&mut buf).unwrap());
        assert_eq!(decoded.kind, original.kind);
        assert_eq!(decoded.data, original.data);
        assert!((decoded.timestamp - original.timestamp).abs() < 1e-6);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encoded_frame_is_single_line() {
        let frame = encode_frame(&message("post", json!({"body": "line one\nline two"}))).unwrap();
        let newlines = frame.iter().filter(|b| **b == b'\n').count();
        assert_eq!(newlines, 1);
        assert_eq!(frame.last(), Some(&b'\n'));
    }

    #[test]
    fn test_partial_frame_waits_for_delimiter() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&br#"{"type":"ping","timestamp":1.0,"#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\"data\":null}\n");
        let decoded = expect_message(codec.decode(&mut buf).unwrap());
        assert_eq!(decoded.kind, MessageKind::Ping);
    }

    #[test]
    fn test_multiple_frames_in_order() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        for n in 0..3 {
            codec.encode(message("ping", json!({"n": n})), &mut buf).unwrap();
        }

        for n in 0..3 {
            let decoded = expect_message(codec.decode(&mut buf).unwrap());
            assert_eq!(decoded.data, json!({"n": n}));
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_malformed_frame_is_consumed() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(message("a", json!(1)), &mut buf).unwrap();
        buf.extend_from_slice(b"{not json\n");
        codec.encode(message("b", json!(2)), &mut buf).unwrap();

        assert_eq!(expect_message(codec.decode(&mut buf).unwrap()).data, json!(1));
        match codec.decode(&mut buf).unwrap() {
            Some(Frame::Malformed { line, .. }) => assert_eq!(line, "{not json"),
            other => panic!("expected malformed frame, got {:?}", other),
        }
        assert_eq!(expect_message(codec.decode(&mut buf).unwrap()).data, json!(2));
    }

    #[test]
    fn test_empty_type_is_malformed() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"\",\"timestamp\":1.0,\"data\":{}}\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Malformed { .. })
        ));
    }

    #[test]
    fn test_blank_lines_and_carriage_returns() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(
            &b"\n  \r\n{\"type\":\"ping\",\"timestamp\":2.0,\"data\":[]}\r\n"[..],
        );

        let decoded = expect_message(codec.decode(&mut buf).unwrap());
        assert_eq!(decoded.kind, MessageKind::Ping);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_too_long() {
        let mut codec = MessageCodec::with_max_frame_length(16);
        let mut buf = BytesMut::from(&[b'x'; 32][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLong { length: 32, max: 16 })
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_message() {
        let mut codec = MessageCodec::with_max_frame_length(16);
        let mut buf = BytesMut::new();
        let result = codec.encode(message("post", json!({"body": "far too long for sixteen"})), &mut buf);
        assert!(matches!(result, Err(ProtocolError::FrameTooLong { .. })));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unterminated_tail_discarded_at_eof() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"ping\""[..]);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }
}
