//! Framed JSON codec for the host and worker channels.
//!
//! Two framings share one codec type:
//! - [`Framing::LengthPrefixed`]: 4-byte little-endian length + JSON payload
//!   (the browser native-messaging wire format).
//! - [`Framing::Lines`]: one compact JSON value per `\n`-terminated line
//!   (the worker's stdin/stdout).
//!
//! Framing and payload decoding fail independently. A frame whose payload is
//! not valid JSON is consumed whole and surfaced as an `Err(DecodeError)`
//! item, so the reader stays aligned and can keep going. Framing failures are
//! returned as the stream error and end the channel.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LinesCodec, LinesCodecError};

/// Default ceiling for a single frame or line.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Browsers reject native host messages above this size.
pub const HOST_MESSAGE_LIMIT_BYTES: usize = 1024 * 1024;

/// How messages are delimited on a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    #[default]
    LengthPrefixed,
    Lines,
}

/// Channel-level failure. The byte stream can no longer be trusted.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("stream closed mid-frame with {0} bytes buffered")]
    Truncated(usize),

    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Payload-level failure. The frame was consumed; the channel is still usable.
#[derive(Debug, thiserror::Error)]
#[error("invalid message payload: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

enum Inner {
    Length {
        codec: LengthDelimitedCodec,
        // Set once the length prefix is consumed and cleared when the payload completes.
        mid_frame: bool,
    },
    Lines { codec: LinesCodec, max_length: usize },
}

/// Codec that frames messages and serializes them with JSON.
///
/// Decodes `T`; encodes any serializable message so one writer can carry both
/// typed replies and forwarded raw values.
pub struct JsonCodec<T> {
    inner: Inner,
    framing: Framing,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    /// Length-prefixed codec with the default size limit.
    pub fn new() -> Self {
        Self::with_framing(Framing::LengthPrefixed, DEFAULT_MAX_FRAME_BYTES)
    }

    /// Line-delimited codec with the default size limit.
    pub fn lines() -> Self {
        Self::with_framing(Framing::Lines, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_framing(framing: Framing, max_frame_bytes: usize) -> Self {
        let inner = match framing {
            Framing::LengthPrefixed => Inner::Length {
                codec: LengthDelimitedCodec::builder()
                    .length_field_length(4)
                    .little_endian()
                    .max_frame_length(max_frame_bytes)
                    .new_codec(),
                mid_frame: false,
            },
            Framing::Lines => Inner::Lines {
                codec: LinesCodec::new_with_max_length(max_frame_bytes),
                max_length: max_frame_bytes,
            },
        };
        Self {
            inner,
            framing,
            _phantom: PhantomData,
        }
    }

    fn mid_frame(&self) -> bool {
        matches!(self.inner, Inner::Length { mid_frame: true, .. })
    }

    fn next_payload(&mut self, src: &mut BytesMut, eof: bool) -> Result<Option<Bytes>, FramingError> {
        match &mut self.inner {
            Inner::Length { codec, mid_frame } => {
                let had_prefix = *mid_frame || src.len() >= 4;
                let frame = codec.decode(src)?;
                *mid_frame = frame.is_none() && had_prefix;
                Ok(frame.map(BytesMut::freeze))
            }
            Inner::Lines { codec, max_length } => {
                let line = if eof { codec.decode_eof(src) } else { codec.decode(src) };
                match line {
                    Ok(line) => Ok(line.map(Bytes::from)),
                    Err(LinesCodecError::MaxLineLengthExceeded) => {
                        Err(FramingError::LineTooLong(*max_length))
                    }
                    Err(LinesCodecError::Io(e)) => Err(FramingError::Io(e)),
                }
            }
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = Result<T, DecodeError>;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.next_payload(src, false)? {
            Some(payload) => Ok(Some(serde_json::from_slice(&payload).map_err(DecodeError))),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.next_payload(src, true)? {
            Some(payload) => Ok(Some(serde_json::from_slice(&payload).map_err(DecodeError))),
            None if src.is_empty() && !self.mid_frame() => Ok(None),
            None => Err(FramingError::Truncated(src.len())),
        }
    }
}

impl<T, M: Serialize> Encoder<M> for JsonCodec<T> {
    type Error = FramingError;

    fn encode(&mut self, item: M, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, framing = ?self.framing, "Encoding frame");

        match &mut self.inner {
            Inner::Length { codec, .. } => {
                if json_len > HOST_MESSAGE_LIMIT_BYTES {
                    tracing::warn!(
                        json_size_bytes = json_len,
                        json_size_kb = json_len / 1024,
                        "Frame exceeds the browser native-messaging limit"
                    );
                }
                codec.encode(Bytes::from(json), dst)?;
            }
            Inner::Lines { .. } => {
                // serde_json escapes control characters, so the payload never
                // contains a raw newline.
                dst.reserve(json_len + 1);
                dst.extend_from_slice(&json);
                dst.extend_from_slice(b"\n");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Reply;
    use futures::StreamExt;
    use serde_json::{Value, json};
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::FramedRead;

    #[test]
    fn length_prefix_is_little_endian() {
        let mut codec = JsonCodec::<Value>::new();
        let mut buf = BytesMut::new();
        codec.encode(json!({"type": "info"}), &mut buf).unwrap();

        let payload = br#"{"type":"info"}"#;
        assert_eq!(&buf[..4], &(payload.len() as u32).to_le_bytes());
        assert_eq!(&buf[4..], payload);
    }

    #[test]
    fn codec_roundtrip_request() {
        let mut codec = JsonCodec::<Value>::new();
        let mut buf = BytesMut::new();

        let msg = json!({"type": "query", "text": "what is this?", "context": "a page"});
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();

        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_roundtrip_reply_over_lines() {
        let mut codec = JsonCodec::<Reply>::lines();
        let mut buf = BytesMut::new();

        let reply = Reply::chunk("multi\nline", true);
        codec.encode(reply.clone(), &mut buf).unwrap();
        assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 1);

        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(decoded, reply);
    }

    fn roundtrip_cases() -> Vec<Value> {
        vec![
            json!({}),
            json!({"type": "compose", "text": ""}),
            json!({"type": "query", "text": "¿qué es esto? 日本語 🚀", "context": "naïve café"}),
            json!({"type": "compose", "text": "tab\tquote\" backslash\\ nul\u{0000} newline\n"}),
            json!({"type": "info", "nested": {"list": [1, 2.5, null, true, {"deep": []}]}}),
            json!({"type": "response", "text": "x", "isLast": false, "extra": {"z": 1, "a": 2}}),
        ]
    }

    #[test]
    fn roundtrip_preserves_messages_in_both_framings() {
        for framing in [Framing::LengthPrefixed, Framing::Lines] {
            let mut codec = JsonCodec::<Value>::with_framing(framing, DEFAULT_MAX_FRAME_BYTES);
            let mut buf = BytesMut::new();
            let cases = roundtrip_cases();

            for msg in &cases {
                codec.encode(msg, &mut buf).unwrap();
            }
            for msg in &cases {
                let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
                assert_eq!(&decoded, msg, "{framing:?}");
            }
            assert!(buf.is_empty(), "{framing:?} left bytes behind");
        }
    }

    #[test]
    fn encoding_keeps_key_order() {
        let mut codec = JsonCodec::<Value>::lines();
        let mut buf = BytesMut::new();
        let msg: Value = serde_json::from_str(r#"{"type":"summarize","context":"page"}"#).unwrap();
        codec.encode(msg, &mut buf).unwrap();
        assert_eq!(&buf[..], b"{\"type\":\"summarize\",\"context\":\"page\"}\n");
    }

    #[test]
    fn message_over_browser_limit_still_encodes() {
        let mut codec = JsonCodec::<Value>::new();
        let mut buf = BytesMut::new();
        let big = json!({"type": "response", "text": "a".repeat(HOST_MESSAGE_LIMIT_BYTES + 1), "isLast": true});

        codec.encode(&big, &mut buf).unwrap();
        let len = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
        assert!(len > HOST_MESSAGE_LIMIT_BYTES);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().unwrap(), big);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec::<Value>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&10u32.to_le_bytes());
        buf.extend_from_slice(b"{\"a\"");

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn truncated_payload_at_eof_is_framing_error() {
        let mut codec = JsonCodec::<Value>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&10u32.to_le_bytes());
        buf.extend_from_slice(b"{\"a\"");

        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, FramingError::Truncated(_)));
    }

    #[test]
    fn short_length_prefix_at_eof_is_framing_error() {
        let mut codec = JsonCodec::<Value>::new();
        let mut buf = BytesMut::from(&[0x05, 0x00][..]);

        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, FramingError::Truncated(_)));
    }

    #[test]
    fn length_prefix_without_payload_at_eof_is_framing_error() {
        let mut codec = JsonCodec::<Value>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&7u32.to_le_bytes());

        assert!(codec.decode(&mut buf).unwrap().is_none());
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, FramingError::Truncated(0)));
    }

    #[test]
    fn clean_eof_is_end_of_stream() {
        let mut codec = JsonCodec::<Value>::new();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = JsonCodec::<Value>::with_framing(Framing::LengthPrefixed, 16);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&1024u32.to_le_bytes());

        assert!(matches!(codec.decode(&mut buf), Err(FramingError::Io(_))));
    }

    #[tokio::test]
    async fn invalid_payload_keeps_channel_aligned() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let mut reader = FramedRead::new(rx, JsonCodec::<Value>::new());

        let garbage = b"not json";
        tx.write_all(&(garbage.len() as u32).to_le_bytes()).await.unwrap();
        tx.write_all(garbage).await.unwrap();
        let valid = br#"{"type":"compose","text":"hi"}"#;
        tx.write_all(&(valid.len() as u32).to_le_bytes()).await.unwrap();
        tx.write_all(valid).await.unwrap();
        drop(tx);

        assert!(matches!(reader.next().await, Some(Ok(Err(DecodeError(_))))));
        let second = reader.next().await.unwrap().unwrap().unwrap();
        assert_eq!(second, json!({"type": "compose", "text": "hi"}));
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn truncated_stream_yields_error_not_message() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let mut reader = FramedRead::new(rx, JsonCodec::<Value>::new());

        tx.write_all(&100u32.to_le_bytes()).await.unwrap();
        tx.write_all(br#"{"type":"compose""#).await.unwrap();
        drop(tx);

        assert!(matches!(reader.next().await, Some(Err(FramingError::Truncated(_)))));
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn final_line_without_newline_is_decoded() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let mut reader = FramedRead::new(rx, JsonCodec::<Value>::lines());

        tx.write_all(b"{\"type\":\"compose\",\"text\":\"a\"}\n{\"type\":\"info\"}")
            .await
            .unwrap();
        drop(tx);

        let first = reader.next().await.unwrap().unwrap().unwrap();
        assert_eq!(first["type"], "compose");
        let second = reader.next().await.unwrap().unwrap().unwrap();
        assert_eq!(second["type"], "info");
        assert!(reader.next().await.is_none());
    }
}
