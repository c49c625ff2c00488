//! Newline-delimited JSON framing.
//!
//! Each frame is exactly one JSON-RPC message followed by `\n`. The encoder
//! never emits a raw newline inside a frame (JSON string escaping guarantees
//! this), and the decoder:
//!
//! - buffers partial reads until a full line is available
//! - strips a trailing `\r` so CRLF peers are tolerated
//! - skips blank lines
//! - reports malformed lines as items, so one bad line never ends the stream
//! - discards lines longer than the configured limit and resynchronises at
//!   the next newline

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{self, JsonRpcError, Message};

/// Default maximum frame size (4 MiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// A line that could not be turned into a message.
#[derive(Debug, Clone, Error)]
pub enum FrameError {
    /// The line was not valid JSON, or not a valid JSON-RPC envelope.
    #[error("malformed message: {}", .0.error.message)]
    Malformed(JsonRpcError),

    /// The line exceeded the frame size limit and was discarded.
    #[error("frame of at least {len} bytes exceeds the {max} byte limit")]
    TooLong {
        /// Bytes seen before the line was abandoned.
        len: usize,
        /// Configured limit.
        max: usize,
    },

    /// The line was not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

impl FrameError {
    /// The error reply a server sends back for this frame.
    #[must_use]
    pub fn to_reply(&self) -> JsonRpcError {
        match self {
            Self::Malformed(reply) => reply.clone(),
            Self::TooLong { .. } => JsonRpcError::invalid_request(None, self.to_string()),
            Self::InvalidUtf8 => JsonRpcError::parse_error(),
        }
    }
}

/// Codec for newline-delimited JSON-RPC messages.
#[derive(Debug, Clone)]
pub struct JsonLineCodec {
    max_line_bytes: usize,
    next_index: usize,
    discarding: bool,
}

impl JsonLineCodec {
    /// Creates a codec with the default frame size limit.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    /// Creates a codec that rejects frames longer than `max_line_bytes`.
    #[must_use]
    pub const fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            next_index: 0,
            discarding: false,
        }
    }

    /// Returns the frame size limit.
    #[must_use]
    pub const fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }

    fn frame(line: &[u8]) -> Option<Result<Message, FrameError>> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }

        let Ok(text) = std::str::from_utf8(line) else {
            return Some(Err(FrameError::InvalidUtf8));
        };

        Some(protocol::parse_message(text).map_err(FrameError::Malformed))
    }
}

impl Default for JsonLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonLineCodec {
    type Item = Result<Message, FrameError>;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        loop {
            let read_to = if self.discarding {
                buf.len()
            } else {
                buf.len().min(self.max_line_bytes.saturating_add(1))
            };
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    buf.advance(self.next_index + offset + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    buf.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let line = buf.split_to(end + 1);
                    if let Some(frame) = Self::frame(&line[..end]) {
                        return Ok(Some(frame));
                    }
                }
                (false, None) if buf.len() > self.max_line_bytes => {
                    let len = buf.len();
                    // Drop the oversized line, keeping whatever follows it.
                    match buf.iter().position(|b| *b == b'\n') {
                        Some(end) => buf.advance(end + 1),
                        None => {
                            buf.clear();
                            self.discarding = true;
                        }
                    }
                    self.next_index = 0;
                    return Ok(Some(Err(FrameError::TooLong {
                        len,
                        max: self.max_line_bytes,
                    })));
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        self.next_index = 0;
        if self.discarding || buf.is_empty() {
            self.discarding = false;
            buf.clear();
            return Ok(None);
        }

        let line = buf.split_to(buf.len());
        Ok(Self::frame(&line))
    }
}

impl Encoder<Message> for JsonLineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> io::Result<()> {
        let line = encode_line(&item)?;
        dst.reserve(line.len());
        dst.put_slice(line.as_bytes());
        Ok(())
    }
}

/// Serialises a message as one newline-terminated frame.
///
/// # Errors
///
/// Returns an `InvalidData` error if the message cannot be serialised.
pub fn encode_line(message: &Message) -> io::Result<String> {
    let mut json =
        protocol::to_json(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    debug_assert!(
        !json.contains('\n'),
        "serialised message must not contain newlines"
    );

    json.push('\n');
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::{ErrorCode, JsonRpcNotification, JsonRpcRequest, RequestId};
    use serde_json::json;

    fn decode_all(codec: &mut JsonLineCodec, buf: &mut BytesMut) -> Vec<Result<Message, FrameError>> {
        let mut out = Vec::new();
        while let Some(item) = codec.decode(buf).unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn buffers_partial_lines() {
        let mut codec = JsonLineCodec::new();
        let mut buf = BytesMut::from(&br#"{"jsonrpc":"2.0","#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(br#""method":"ping","id":1}"#);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(msg.method(), Some("ping"));
        assert!(buf.is_empty());
    }

    #[test]
    fn malformed_line_does_not_end_stream() {
        let mut codec = JsonLineCodec::new();
        let mut buf = BytesMut::from(
            &b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\nthis is not json\n{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n"[..],
        );

        let items = decode_all(&mut codec, &mut buf);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap().id(), Some(&RequestId::Number(1)));

        let FrameError::Malformed(reply) = items[1].as_ref().unwrap_err() else {
            panic!("expected malformed frame");
        };
        assert_eq!(reply.error.code, ErrorCode::ParseError.code());
        assert!(reply.id.is_none());

        assert_eq!(items[2].as_ref().unwrap().id(), Some(&RequestId::Number(2)));
    }

    #[test]
    fn skips_blank_lines_and_strips_carriage_return() {
        let mut codec = JsonLineCodec::new();
        let mut buf =
            BytesMut::from(&b"\n\r\n   \n{\"jsonrpc\":\"2.0\",\"method\":\"initialized\"}\r\n"[..]);

        let items = decode_all(&mut codec, &mut buf);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().method(), Some("initialized"));
    }

    #[test]
    fn oversized_line_is_discarded_then_resyncs() {
        let mut codec = JsonLineCodec::with_max_line_bytes(64);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[b'x'; 100]);

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Err(FrameError::TooLong { max: 64, .. })));

        buf.extend_from_slice(&[b'y'; 30]);
        buf.extend_from_slice(b"\n{\"jsonrpc\":\"2.0\",\"method\":\"ok\"}\n");

        let items = decode_all(&mut codec, &mut buf);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().method(), Some("ok"));
    }

    #[test]
    fn oversized_line_keeps_following_frames_in_the_same_buffer() {
        let mut codec = JsonLineCodec::with_max_line_bytes(64);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[b'x'; 100]);
        buf.extend_from_slice(b"\n{\"jsonrpc\":\"2.0\",\"method\":\"ok\"}\n");

        let items = decode_all(&mut codec, &mut buf);
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Err(FrameError::TooLong { .. })));
        assert_eq!(items[1].as_ref().unwrap().method(), Some("ok"));
    }

    #[test]
    fn invalid_utf8_is_reported() {
        let mut codec = JsonLineCodec::new();
        let mut buf = BytesMut::from(&b"\xff\xfe\n"[..]);
        let item = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(item, Err(FrameError::InvalidUtf8)));
    }

    #[test]
    fn final_line_without_newline_is_decoded_at_eof() {
        let mut codec = JsonLineCodec::new();
        let mut buf = BytesMut::from(&b"{\"jsonrpc\":\"2.0\",\"method\":\"bye\"}"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        let item = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(item.unwrap().method(), Some("bye"));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn encoded_frame_has_single_trailing_newline() {
        let msg = Message::Request(JsonRpcRequest::new(
            1,
            "tools/call",
            Some(json!({"text": "line one\nline two\r\n"})),
        ));

        let line = encode_line(&msg).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let mut codec = JsonLineCodec::new();
        let mut buf = BytesMut::from(line.as_bytes());
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().unwrap(), msg);
    }

    #[test]
    fn encoder_writes_frames_back_to_back() {
        let mut codec = JsonLineCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Message::Notification(JsonRpcNotification::new("a", None)), &mut buf)
            .unwrap();
        codec
            .encode(Message::Notification(JsonRpcNotification::new("b", None)), &mut buf)
            .unwrap();

        let items = decode_all(&mut codec, &mut buf);
        let methods: Vec<_> = items
            .iter()
            .map(|i| i.as_ref().unwrap().method().unwrap().to_string())
            .collect();
        assert_eq!(methods, ["a", "b"]);
    }

    #[test]
    fn frame_error_replies() {
        let too_long = FrameError::TooLong { len: 10, max: 5 };
        assert_eq!(
            too_long.to_reply().error.code,
            ErrorCode::InvalidRequest.code()
        );
        assert_eq!(
            FrameError::InvalidUtf8.to_reply().error.code,
            ErrorCode::ParseError.code()
        );
    }
}
