//! Collaborator Traits
//!
//! The pipeline talks to four external capabilities: speech recognition,
//! response generation, speech synthesis and video rendering. Each one is a
//! trait object injected into the coordinator at startup, so tests and
//! deployments can swap engines without touching the state machine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::animation::{PoseError, PoseFrame, WordTiming};

/// Failure reported by a collaborator
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    /// The call did not finish in time
    #[error("{operation} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// What was being attempted
        operation: &'static str,
        /// The limit that was exceeded
        timeout: Duration,
    },

    /// An external program could not be started
    #[error("failed to start `{program}`: {message}")]
    Spawn {
        /// Program path
        program: String,
        /// Underlying error
        message: String,
    },

    /// An external program exited unsuccessfully
    #[error("`{program}` exited with {status}: {stderr}")]
    ProcessFailed {
        /// Program path
        program: String,
        /// Exit status description
        status: String,
        /// Captured standard error (trimmed)
        stderr: String,
    },

    /// Transport-level HTTP failure
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The server answered with a non-success status
    #[error("HTTP {status}: {body}")]
    HttpStatus {
        /// Status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// The collaborator produced something unusable
    #[error("invalid output: {0}")]
    InvalidOutput(String),

    /// The request itself was unusable
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The request exceeded a size limit
    #[error("input of {size} bytes exceeds limit of {limit} bytes")]
    InputTooLarge {
        /// Actual size
        size: usize,
        /// Limit
        limit: usize,
    },
}

impl BackendError {
    /// Whether retrying the same call might succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::ProcessFailed { .. } | Self::Http(_) | Self::Io(_) => true,
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            Self::Spawn { .. }
            | Self::InvalidOutput(_)
            | Self::InvalidInput(_)
            | Self::InputTooLarge { .. } => false,
        }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<PoseError> for BackendError {
    fn from(e: PoseError) -> Self {
        Self::InvalidInput(e.to_string())
    }
}

/// Speech-to-text capability
#[async_trait]
pub trait SttEngine: Send + Sync {
    /// Engine name for logs
    fn name(&self) -> &str;

    /// Transcribe audio; `Ok(None)` means no speech was found
    async fn recognize(&self, audio: &[u8]) -> Result<Option<String>, BackendError>;
}

/// Synthesized speech with word timings
#[derive(Clone, Debug, PartialEq)]
pub struct Synthesis {
    /// Encoded audio (WAV or raw 16-bit PCM)
    pub audio: Arc<[u8]>,
    /// Word timings, ascending and non-overlapping
    pub word_timings: Vec<WordTiming>,
    /// Audio length in seconds
    pub duration_secs: f64,
    /// Sample rate of the audio
    pub sample_rate: u32,
}

/// Text-to-speech capability
#[async_trait]
pub trait TtsEngine: Send + Sync {
    /// Engine name for logs
    fn name(&self) -> &str;

    /// Voice identifier; part of the synthesis cache key
    fn voice(&self) -> &str;

    /// Synthesize `text`
    async fn synthesize(&self, text: &str) -> Result<Synthesis, BackendError>;
}

/// Request for a conversational reply
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationRequest {
    /// User text to respond to
    pub prompt: String,
    /// Correlation id echoed back with the reply
    pub callback_id: String,
    /// Avatar the reply will be rendered with
    pub avatar_id: String,
    /// Session the request belongs to
    pub session_id: String,
}

/// Outcome of a generation call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Generation {
    /// The reply text is available now
    Answered(String),
    /// The client will deliver the reply as an `llm_response` message
    Deferred,
}

/// Response-generation capability
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Generator name for logs
    fn name(&self) -> &str;

    /// Produce (or defer) the reply for `request`
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, BackendError>;
}

/// Everything needed to encode one reply video
#[derive(Clone, Debug)]
pub struct RenderRequest {
    /// Avatar model to animate
    pub avatar_id: String,
    /// Ordered pose track
    pub frames: Vec<PoseFrame>,
    /// Frame rate of the pose track
    pub fps: u32,
    /// Audio track
    pub audio: Arc<[u8]>,
}

impl RenderRequest {
    /// Reject pose tracks with non-finite or out-of-range values
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::InvalidInput`] naming the first bad frame.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.fps == 0 {
            return Err(BackendError::InvalidInput("fps must be positive".into()));
        }
        for frame in &self.frames {
            frame.pose.validate().map_err(|e| {
                BackendError::InvalidInput(format!("frame {}: {e}", frame.index))
            })?;
        }
        Ok(())
    }
}

/// Encoded video on disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedVideo {
    /// Path of the encoded file
    pub path: PathBuf,
    /// Number of frames encoded
    pub frame_count: usize,
}

/// Render-and-encode capability
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Renderer name for logs
    fn name(&self) -> &str;

    /// Encode `request` into a video file
    async fn render(&self, request: RenderRequest) -> Result<RenderedVideo, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::animation::{PoseVector, VisemeCategory};

    fn frame(index: usize, pose: PoseVector) -> PoseFrame {
        PoseFrame {
            index,
            timestamp: 0.0,
            category: VisemeCategory::Silence,
            weight: 1.0,
            pose,
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(BackendError::Timeout {
            operation: "synthesis",
            timeout: Duration::from_secs(1)
        }
        .is_transient());
        assert!(BackendError::Http("reset".into()).is_transient());
        assert!(BackendError::HttpStatus {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(!BackendError::HttpStatus {
            status: 400,
            body: String::new()
        }
        .is_transient());
        assert!(!BackendError::InputTooLarge { size: 2, limit: 1 }.is_transient());
        assert!(!BackendError::Spawn {
            program: "piper".into(),
            message: "not found".into()
        }
        .is_transient());
    }

    #[test]
    fn test_render_request_validation() {
        let good = VisemeCategory::Aa.pose();
        let mut bad = good;
        bad.mouth_height = 1.2;

        let mut request = RenderRequest {
            avatar_id: "professional/model_v1".into(),
            frames: vec![frame(0, good), frame(1, bad)],
            fps: 30,
            audio: Arc::from(Vec::new()),
        };
        let err = request.validate().unwrap_err();
        assert!(err.to_string().contains("frame 1"));

        request.frames.truncate(1);
        assert!(request.validate().is_ok());

        request.fps = 0;
        assert!(request.validate().is_err());
    }
}
