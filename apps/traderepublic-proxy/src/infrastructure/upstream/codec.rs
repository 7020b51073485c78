//! Upstream Frame Codec
//!
//! Encodes control frames and decodes incoming frames of the Trade Republic
//! text protocol.
//!
//! # Wire Format
//!
//! Outbound frames are `"<verb> <id> <json>"`, with the JSON part omitted
//! when there is no payload:
//!
//! ```text
//! connect 22 {"locale":"en",...}
//! sub 25 {"type":"ticker","id":"US0378331005.LSX","exchange":"LSX"}
//! unsub 25
//! echo 1700000000
//! ```
//!
//! Inbound frames are either the literal handshake marker `connected` or a
//! data frame `"<id> A <json>"`. Anything else is unrecognized and dropped.

use serde::Serialize;

use crate::domain::subscription::SubscriptionId;

/// Literal the upstream sends once the connect handshake succeeded.
pub const CONNECTED_MARKER: &str = "connected";

/// Frame type tag of a data frame.
const DATA_TAG: &str = "A";

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Data frame without a payload.
    #[error("data frame {0} has no payload")]
    EmptyPayload(SubscriptionId),
}

/// Verb of an outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// Connect handshake.
    Connect,
    /// Subscribe.
    Sub,
    /// Unsubscribe.
    Unsub,
    /// Keep-alive.
    Echo,
}

impl Verb {
    /// Wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Sub => "sub",
            Self::Unsub => "unsub",
            Self::Echo => "echo",
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Handshake completed.
    Connected,
    /// Payload for the subscription registered under `id`.
    Data {
        /// Correlation id.
        id: SubscriptionId,
        /// Opaque payload.
        payload: serde_json::Value,
    },
    /// Not part of the protocol subset this client understands.
    Unrecognized,
}

/// Codec for the upstream text protocol.
#[derive(Debug, Default, Clone)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Encode an outbound frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn encode<T: Serialize>(
        &self,
        verb: Verb,
        id: u64,
        payload: Option<&T>,
    ) -> Result<String, CodecError> {
        let frame = match payload {
            Some(payload) => format!("{} {id} {}", verb.as_str(), serde_json::to_string(payload)?),
            None => format!("{} {id}", verb.as_str()),
        };
        Ok(frame.trim().to_string())
    }

    /// Encode an outbound frame without payload.
    #[must_use]
    pub fn encode_bare(&self, verb: Verb, id: u64) -> String {
        format!("{} {id}", verb.as_str())
    }

    /// Decode an inbound frame.
    ///
    /// Tokenizes instead of pattern matching: the leading token must be all
    /// digits, the second token must be `A`, and whatever follows is parsed
    /// as JSON on its own.
    ///
    /// # Errors
    ///
    /// Returns an error only for a well-formed data frame whose payload is
    /// missing or not valid JSON. Frames that are not data frames decode to
    /// [`Frame::Unrecognized`].
    pub fn decode(&self, text: &str) -> Result<Frame, CodecError> {
        if text == CONNECTED_MARKER {
            return Ok(Frame::Connected);
        }

        let Some((head, rest)) = text.split_once(' ') else {
            return Ok(Frame::Unrecognized);
        };

        if head.is_empty() || !head.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(Frame::Unrecognized);
        }
        let Ok(id) = head.parse::<SubscriptionId>() else {
            return Ok(Frame::Unrecognized);
        };

        let (tag, body) = rest.split_once(' ').unwrap_or((rest, ""));
        if tag != DATA_TAG {
            return Ok(Frame::Unrecognized);
        }

        let body = body.trim();
        if body.is_empty() {
            return Err(CodecError::EmptyPayload(id));
        }

        Ok(Frame::Data {
            id,
            payload: serde_json::from_str(body)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::domain::subscription::SubscriptionRequest;

    #[test]
    fn encode_with_payload() {
        let codec = FrameCodec::new();
        let request = SubscriptionRequest::Ticker {
            id: "US0378331005".to_string(),
            exchange: "LSX".to_string(),
        };

        let frame = codec.encode(Verb::Sub, 25, Some(&request)).unwrap();
        assert_eq!(
            frame,
            r#"sub 25 {"type":"ticker","id":"US0378331005.LSX","exchange":"LSX"}"#
        );
    }

    #[test]
    fn encode_without_payload_is_trimmed() {
        let codec = FrameCodec::new();
        let frame = codec.encode::<()>(Verb::Unsub, 25, None).unwrap();
        assert_eq!(frame, "unsub 25");
        assert_eq!(codec.encode_bare(Verb::Echo, 1_700_000_000), "echo 1700000000");
    }

    #[test]
    fn decode_connected_marker() {
        let codec = FrameCodec::new();
        assert_eq!(codec.decode("connected").unwrap(), Frame::Connected);
    }

    #[test]
    fn decode_data_frame() {
        let codec = FrameCodec::new();
        let frame = codec.decode(r#"17 A {"bid":{"price":1}}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Data {
                id: 17,
                payload: json!({"bid": {"price": 1}}),
            }
        );
    }

    #[test]
    fn decode_payload_containing_separator() {
        let codec = FrameCodec::new();
        let frame = codec.decode(r#"30 A {"name":"X A Y"}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Data {
                id: 30,
                payload: json!({"name": "X A Y"}),
            }
        );
    }

    #[test]
    fn decode_unrecognized() {
        let codec = FrameCodec::new();
        for text in ["", "hello", "17", "17 E {}", "x7 A {}", "17 C", " 17 A {}"] {
            assert_eq!(codec.decode(text).unwrap(), Frame::Unrecognized, "{text:?}");
        }
    }

    #[test]
    fn decode_bad_json_is_error() {
        let codec = FrameCodec::new();
        assert!(matches!(codec.decode("17 A {nope"), Err(CodecError::Json(_))));
    }

    #[test]
    fn decode_missing_payload_is_error() {
        let codec = FrameCodec::new();
        for text in ["17 A", "17 A ", "17 A   "] {
            assert!(
                matches!(codec.decode(text), Err(CodecError::EmptyPayload(17))),
                "{text:?}"
            );
        }
    }

    proptest! {
        #[test]
        fn decode_never_panics(text in ".*") {
            let _ = FrameCodec::new().decode(&text);
        }

        #[test]
        fn data_frames_keep_their_id(id in 0u64..1_000_000, price in 0u32..100_000) {
            let text = format!(r#"{id} A {{"bid":{{"price":{price}}}}}"#);
            let frame = FrameCodec::new().decode(&text).unwrap();
            prop_assert_eq!(frame, Frame::Data { id, payload: json!({"bid": {"price": price}}) });
        }
    }
}
