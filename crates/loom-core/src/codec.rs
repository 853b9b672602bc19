//! Newline-delimited JSON codec for worker stdin/stdout.
//!
//! `LineCodec` plugs into `tokio_util::codec::{FramedRead, FramedWrite}`.
//! Incomplete trailing bytes stay buffered until their newline arrives, so a
//! frame split across pipe reads is never lost.

use bytes::{BufMut, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::wire::{Message, MESSAGE_TYPES};

/// Default upper bound on a single line (16 MiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Serialize one frame: `JSON(message) + "\n"`.
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let mut out =
        serde_json::to_vec(message).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
    out.push(b'\n');
    Ok(out)
}

/// Parse one line (without its terminator) into a frame.
///
/// Invalid JSON, a non-object, or a missing `type` is `MalformedFrame`;
/// a `type` outside the protocol is `UnknownType`.
pub fn decode_line(line: &[u8]) -> Result<Message, ProtocolError> {
    let value: Value =
        serde_json::from_slice(line).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::MalformedFrame("missing string `type` field".into()))?;
    if !MESSAGE_TYPES.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &line[start..end]
}

// ── LineCodec ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LineCodec {
    max_line_bytes: usize,
    /// Bytes already scanned for a newline; avoids rescanning long partial lines.
    next_index: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes: max_line_bytes.max(1),
            next_index: 0,
        }
    }

    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }

    fn too_long(&self) -> ProtocolError {
        ProtocolError::MalformedFrame(format!("line exceeds {} bytes", self.max_line_bytes))
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        loop {
            let from = self.next_index.min(buf.len());
            let Some(offset) = buf[from..].iter().position(|b| *b == b'\n') else {
                if buf.len() > self.max_line_bytes {
                    return Err(self.too_long());
                }
                self.next_index = buf.len();
                return Ok(None);
            };

            let raw = buf.split_to(from + offset + 1);
            self.next_index = 0;
            if raw.len() - 1 > self.max_line_bytes {
                return Err(self.too_long());
            }
            let line = trim_line(&raw[..raw.len() - 1]);
            if line.is_empty() {
                continue;
            }
            return decode_line(line).map(Some);
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        if let Some(msg) = self.decode(buf)? {
            return Ok(Some(msg));
        }
        self.next_index = 0;
        let rest = buf.split_to(buf.len());
        let line = trim_line(&rest);
        if line.is_empty() {
            Ok(None)
        } else {
            decode_line(line).map(Some)
        }
    }
}

impl Encoder<Message> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let json =
            serde_json::to_vec(&item).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        dst.reserve(json.len() + 1);
        dst.extend_from_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
