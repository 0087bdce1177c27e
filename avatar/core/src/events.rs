//! Client Events
//!
//! Messages sent from a connected client to the server. Every frame is a
//! JSON object tagged by `type`; the set is closed, so an unknown type is a
//! protocol error rather than something silently ignored.
//!
//! # Design Philosophy
//!
//! Clients report what happened (audio was captured, text was typed, a
//! generated reply arrived). The session coordinator decides what that
//! means for the pipeline.

use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum inbound frame size accepted by [`InboundMessage::parse`] (16 MiB)
///
/// Base64 audio is the largest payload; 10 MiB of audio encodes to ~13.4 MiB.
pub const MAX_INBOUND_BYTES: usize = 16 * 1024 * 1024;

/// An inbound frame could not be understood
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Frame exceeded [`MAX_INBOUND_BYTES`]
    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge {
        /// Actual size
        size: usize,
        /// Limit
        limit: usize,
    },

    /// Not valid JSON or not a known message shape
    #[error("invalid message: {0}")]
    Malformed(String),

    /// Audio payload was not valid base64
    #[error("invalid audio payload: {0}")]
    InvalidAudio(String),
}

/// Messages from client to server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Captured speech to recognize
    Audio {
        /// Base64-encoded audio (WAV or raw 16-bit PCM)
        audio: String,
        /// Caller's session id, echoed in replies
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Typed text; skips recognition
    Text {
        /// The text
        text: String,
        /// Correlation id for the generation request
        #[serde(default)]
        callback_id: Option<String>,
    },

    /// A generated reply delivered by the client
    LlmResponse {
        /// Reply text to speak
        text: String,
        /// Avatar to render with, overriding the session's selection
        #[serde(default)]
        avatar_id: Option<String>,
        /// Caller's session id, echoed in replies
        #[serde(default)]
        session_id: Option<String>,
        /// Correlation id of the `llm_request` being answered
        #[serde(default)]
        callback_id: Option<String>,
    },

    /// Choose the avatar for later replies
    SelectAvatar {
        /// Avatar model id, e.g. `professional/model_v1`
        avatar_id: String,
        /// Caller's session id, echoed in replies
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Liveness check
    Ping,

    /// Abandon the in-flight pipeline and anything queued
    Cancel {
        /// Caller's session id, echoed in replies
        #[serde(default)]
        session_id: Option<String>,
    },
}

impl InboundMessage {
    /// Parse one text frame
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for oversized or malformed frames.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        if raw.len() > MAX_INBOUND_BYTES {
            return Err(ProtocolError::TooLarge {
                size: raw.len(),
                limit: MAX_INBOUND_BYTES,
            });
        }
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Wire tag of this message
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Audio { .. } => "audio",
            Self::Text { .. } => "text",
            Self::LlmResponse { .. } => "llm_response",
            Self::SelectAvatar { .. } => "select_avatar",
            Self::Ping => "ping",
            Self::Cancel { .. } => "cancel",
        }
    }

    /// Whether this message is handled outside the pipeline state machine
    #[must_use]
    pub fn is_out_of_band(&self) -> bool {
        matches!(self, Self::Ping | Self::SelectAvatar { .. })
    }
}

/// Decode a base64 audio payload
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidAudio`] if `payload` is not standard
/// base64 or decodes to nothing.
pub fn decode_audio(payload: &str) -> Result<Vec<u8>, ProtocolError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| ProtocolError::InvalidAudio(e.to_string()))?;
    if bytes.is_empty() {
        return Err(ProtocolError::InvalidAudio("empty payload".into()));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_audio() {
        let msg = InboundMessage::parse(r#"{"type":"audio","audio":"AAAA","session_id":"s1"}"#)
            .unwrap();
        assert_eq!(
            msg,
            InboundMessage::Audio {
                audio: "AAAA".into(),
                session_id: Some("s1".into())
            }
        );
        assert_eq!(msg.kind(), "audio");
    }

    #[test]
    fn test_parse_optional_fields() {
        let msg = InboundMessage::parse(r#"{"type":"text","text":"hello"}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::Text {
                text: "hello".into(),
                callback_id: None
            }
        );

        let msg = InboundMessage::parse(r#"{"type":"llm_response","text":"hi","avatar_id":"casual/v2"}"#)
            .unwrap();
        assert_eq!(
            msg,
            InboundMessage::LlmResponse {
                text: "hi".into(),
                avatar_id: Some("casual/v2".into()),
                session_id: None,
                callback_id: None
            }
        );
    }

    #[test]
    fn test_parse_unit_variants() {
        assert_eq!(
            InboundMessage::parse(r#"{"type":"ping"}"#).unwrap(),
            InboundMessage::Ping
        );
        assert_eq!(
            InboundMessage::parse(r#"{"type":"cancel"}"#).unwrap(),
            InboundMessage::Cancel { session_id: None }
        );
    }

    #[test]
    fn test_unknown_type_is_error() {
        assert!(matches!(
            InboundMessage::parse(r#"{"type":"dance"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            InboundMessage::parse("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            InboundMessage::parse(r#"{"type":"text"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_audio() {
        assert_eq!(decode_audio("AQID").unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            decode_audio("!!not base64!!"),
            Err(ProtocolError::InvalidAudio(_))
        ));
        assert!(matches!(decode_audio(""), Err(ProtocolError::InvalidAudio(_))));
    }

    #[test]
    fn test_out_of_band() {
        assert!(InboundMessage::Ping.is_out_of_band());
        assert!(InboundMessage::SelectAvatar {
            avatar_id: "a".into(),
            session_id: None
        }
        .is_out_of_band());
        assert!(!InboundMessage::Cancel { session_id: None }.is_out_of_band());
    }
}
