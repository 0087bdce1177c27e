//! Pipeline failure taxonomy

use thiserror::Error;

use crate::backend::BackendError;

/// Why a pipeline run (or a message for a session) failed
///
/// Stage failures are reported to the client as an `error` message and the
/// session returns to idle. `RecognitionFailed` is only logged.
/// [`PipelineError::TransportError`] destroys the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// No speech could be recognized
    #[error("speech recognition failed: {0}")]
    RecognitionFailed(String),

    /// No reply could be generated
    #[error("response generation failed: {0}")]
    GenerationFailed(String),

    /// The reply could not be synthesized
    #[error("speech synthesis failed: {0}")]
    SynthesisFailed(String),

    /// Animation or encoding failed
    #[error("rendering failed: {0}")]
    RenderFailed(String),

    /// The connection is gone; the session is destroyed
    #[error("transport error: {0}")]
    TransportError(String),
}

impl PipelineError {
    /// Short stage name for logs and session state
    #[must_use]
    pub fn stage(&self) -> &'static str {
        match self {
            Self::RecognitionFailed(_) => "recognition",
            Self::GenerationFailed(_) => "generation",
            Self::SynthesisFailed(_) => "synthesis",
            Self::RenderFailed(_) => "render",
            Self::TransportError(_) => "transport",
        }
    }

    /// Whether the client should hear about this failure
    #[must_use]
    pub fn is_reported(&self) -> bool {
        !matches!(self, Self::RecognitionFailed(_) | Self::TransportError(_))
    }

    pub(crate) fn recognition(e: &BackendError) -> Self {
        Self::RecognitionFailed(e.to_string())
    }

    pub(crate) fn generation(e: &BackendError) -> Self {
        Self::GenerationFailed(e.to_string())
    }

    pub(crate) fn synthesis(e: &BackendError) -> Self {
        Self::SynthesisFailed(e.to_string())
    }

    pub(crate) fn render(e: impl std::fmt::Display) -> Self {
        Self::RenderFailed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reporting() {
        assert!(!PipelineError::RecognitionFailed("silence".into()).is_reported());
        assert!(!PipelineError::TransportError("gone".into()).is_reported());
        assert!(PipelineError::SynthesisFailed("boom".into()).is_reported());
        assert!(PipelineError::render("bad pose").is_reported());
    }

    #[test]
    fn test_display_names_stage() {
        let err = PipelineError::synthesis(&BackendError::InvalidOutput("empty".into()));
        assert_eq!(err.stage(), "synthesis");
        assert_eq!(err.to_string(), "speech synthesis failed: invalid output: empty");
    }
}
