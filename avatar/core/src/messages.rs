//! Server Messages
//!
//! Messages sent from the server to a connected client. Like
//! [`InboundMessage`](crate::events::InboundMessage), every message is a JSON
//! object tagged by `type`.
//!
//! Per-connection order is the order the coordinator sends them in; for one
//! pipeline run that is always:
//!
//! ```text
//! text_recognized | text_received → [llm_request] → video_ready → video_data
//! ```

use base64::Engine;
use serde::{Deserialize, Serialize};

/// Container format reported in `video_data`
pub const VIDEO_FORMAT: &str = "mp4";

/// Messages from server to client
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Sent once after the connection is registered
    Connected {
        /// Id assigned to (or chosen by) the client
        client_id: String,
        /// Greeting text
        message: String,
    },

    /// Speech was recognized from an `audio` message
    TextRecognized {
        /// Transcript
        text: String,
        /// Session the audio belonged to
        session_id: String,
    },

    /// A `text` message was accepted
    TextReceived {
        /// The accepted text
        text: String,
    },

    /// The client is asked to generate a reply
    LlmRequest {
        /// Prompt text
        text: String,
        /// Correlation id to return in `llm_response`
        callback_id: String,
    },

    /// A reply video was encoded
    VideoReady {
        /// Server-side path of the encoded file
        video_path: String,
        /// Session the video belongs to
        session_id: String,
    },

    /// The encoded reply video
    VideoData {
        /// Base64-encoded video bytes
        video: String,
        /// Container format
        format: String,
    },

    /// Avatar selection acknowledged
    AvatarSelected {
        /// Selected avatar
        avatar_id: String,
        /// Session the selection applies to
        session_id: String,
        /// Human-readable confirmation
        message: String,
    },

    /// Something went wrong; the connection stays open
    Error {
        /// Human-readable reason
        message: String,
    },

    /// Reply to `ping`
    Pong,

    /// The in-flight pipeline was abandoned on request
    Cancelled {
        /// Session that was cancelled
        session_id: String,
    },
}

impl OutboundMessage {
    /// Greeting for a freshly registered connection
    pub fn connected(client_id: impl Into<String>) -> Self {
        Self::Connected {
            client_id: client_id.into(),
            message: "Connected to avatar server".to_string(),
        }
    }

    /// Error report
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Video payload, base64-encoded
    #[must_use]
    pub fn video_data(bytes: &[u8]) -> Self {
        Self::VideoData {
            video: base64::engine::general_purpose::STANDARD.encode(bytes),
            format: VIDEO_FORMAT.to_string(),
        }
    }

    /// Avatar selection acknowledgement
    pub fn avatar_selected(avatar_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        let avatar_id = avatar_id.into();
        Self::AvatarSelected {
            message: format!("Avatar changed to {avatar_id}"),
            avatar_id,
            session_id: session_id.into(),
        }
    }

    /// Wire tag of this message
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::TextRecognized { .. } => "text_recognized",
            Self::TextReceived { .. } => "text_received",
            Self::LlmRequest { .. } => "llm_request",
            Self::VideoReady { .. } => "video_ready",
            Self::VideoData { .. } => "video_data",
            Self::AvatarSelected { .. } => "avatar_selected",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Serialize to a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns a serialization error (not expected for these types).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_wire_shape() {
        let json = OutboundMessage::connected("c1").to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "connected");
        assert_eq!(value["client_id"], "c1");

        let json = OutboundMessage::Pong.to_json().unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);

        let json = OutboundMessage::LlmRequest {
            text: "hello".into(),
            callback_id: "cb".into(),
        }
        .to_json()
        .unwrap();
        assert_eq!(json, r#"{"type":"llm_request","text":"hello","callback_id":"cb"}"#);
    }

    #[test]
    fn test_video_data_encoding() {
        match OutboundMessage::video_data(&[1, 2, 3]) {
            OutboundMessage::VideoData { video, format } => {
                assert_eq!(video, "AQID");
                assert_eq!(format, "mp4");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_avatar_selected() {
        let msg = OutboundMessage::avatar_selected("casual/model_v2", "s1");
        assert_eq!(msg.kind(), "avatar_selected");
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["avatar_id"], "casual/model_v2");
        assert_eq!(value["session_id"], "s1");
        assert_eq!(value["message"], "Avatar changed to casual/model_v2");
    }
}
