//! Session State
//!
//! One session per connection. The session records where its pipeline run
//! is, which generation request it is waiting on, the avatar it renders
//! with, and at most one queued input.
//!
//! # State Machine
//!
//! ```text
//!          audio|text                 text              response
//!   Idle ─────────────▶ AwaitingRecognition ─▶ AwaitingGeneration ─▶ Synthesizing
//!    ▲ │                                                                 │
//!    │ │ llm_response ───────────────────────────────────────────────────┘
//!    │                                                                   ▼
//!    └──────────── Delivering ◀──────────── Rendering ◀──────────────────┘
//!
//!   any stage ──failure──▶ Errored ──reported──▶ Idle
//!   any state ──disconnect──▶ Closed (terminal)
//! ```
//!
//! Smoothing state is not kept here: it belongs to the frame scheduler of
//! one utterance and starts fresh with every stream.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Where a session's pipeline is
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Ready for input
    Idle,
    /// Waiting for speech recognition (or passing typed text through)
    AwaitingRecognition,
    /// Waiting for a reply from the response generator
    AwaitingGeneration,
    /// Waiting for speech synthesis
    Synthesizing,
    /// Animating and encoding the reply video
    Rendering,
    /// Sending the video to the client
    Delivering,
    /// A stage failed; reported, then back to idle
    Errored(PipelineError),
    /// The connection is gone; terminal
    Closed,
}

impl SessionState {
    /// Whether a pipeline run is in progress
    #[must_use]
    pub fn is_busy(&self) -> bool {
        !matches!(self, Self::Idle | Self::Closed)
    }

    /// Whether the session can never run again
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Check a state change against the machine above
    ///
    /// Cancellation is the only way back to idle from the middle of a run.
    #[must_use]
    pub fn can_transition_to(&self, next: &Self) -> bool {
        use SessionState::{
            AwaitingGeneration, AwaitingRecognition, Closed, Delivering, Errored, Idle, Rendering,
            Synthesizing,
        };

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle, AwaitingRecognition | Synthesizing)
            | (AwaitingRecognition, AwaitingGeneration)
            | (AwaitingGeneration, Synthesizing)
            | (Synthesizing, Rendering)
            | (Rendering, Delivering)
            | (Errored(_), Idle)
            | (
                AwaitingRecognition | AwaitingGeneration | Synthesizing | Rendering | Delivering,
                Idle | Errored(_),
            ) => true,
            _ => false,
        }
    }

    /// Short name for logs
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingRecognition => "awaiting_recognition",
            Self::AwaitingGeneration => "awaiting_generation",
            Self::Synthesizing => "synthesizing",
            Self::Rendering => "rendering",
            Self::Delivering => "delivering",
            Self::Errored(_) => "errored",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// What to do with input that arrives while a run is in progress
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Hold one input and run it next; reject anything beyond that
    #[default]
    Queue,
    /// Reject every input until the session is idle
    Reject,
}

impl BusyPolicy {
    /// Config/CLI spelling
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Reject => "reject",
        }
    }
}

impl fmt::Display for BusyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BusyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown busy policy `{other}` (expected queue or reject)")),
        }
    }
}

/// Input that starts a pipeline run
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineInput {
    /// Decoded audio to recognize
    Audio {
        /// Audio bytes (WAV or raw PCM)
        audio: Vec<u8>,
        /// Caller's session id
        session_id: Option<String>,
    },
    /// Typed text
    Text {
        /// The text
        text: String,
        /// Caller's correlation id
        callback_id: Option<String>,
    },
    /// A reply delivered by the client, spoken without generation
    Response {
        /// Reply text
        text: String,
        /// Avatar override
        avatar_id: Option<String>,
        /// Caller's session id
        session_id: Option<String>,
        /// Correlation id of the request being answered
        callback_id: Option<String>,
    },
}

impl PipelineInput {
    /// Short name for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Audio { .. } => "audio",
            Self::Text { .. } => "text",
            Self::Response { .. } => "llm_response",
        }
    }
}

/// Input arrived while busy and could not be accepted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Busy;

/// One connection's conversation state
#[derive(Clone, Debug)]
pub struct Session {
    /// Session id (defaults to the connection id)
    pub id: String,
    /// Connection the session belongs to
    pub connection_id: String,
    /// Current state
    pub state: SessionState,
    /// Correlation id of the outstanding generation request
    pub pending_request_id: Option<String>,
    /// Avatar chosen with `select_avatar`
    pub selected_avatar: Option<String>,
    /// Input waiting for the current run to finish
    pub queued: Option<PipelineInput>,
    /// When the session was opened
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// New idle session for a connection
    pub fn new(connection_id: impl Into<String>) -> Self {
        let connection_id = connection_id.into();
        Self {
            id: connection_id.clone(),
            connection_id,
            state: SessionState::Idle,
            pending_request_id: None,
            selected_avatar: None,
            queued: None,
            created_at: Utc::now(),
        }
    }

    /// Move to `next` if the machine allows it
    ///
    /// Returns false (and leaves the state alone) for an illegal change.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(&next) {
            tracing::warn!(
                session_id = %self.id,
                from = %self.state,
                to = %next,
                "Rejected illegal session transition"
            );
            return false;
        }
        tracing::debug!(
            session_id = %self.id,
            from = %self.state,
            to = %next,
            "Session transition"
        );
        if matches!(next, SessionState::Idle | SessionState::Closed) {
            self.pending_request_id = None;
        }
        self.state = next;
        true
    }

    /// Hold `input` until the current run ends
    ///
    /// # Errors
    ///
    /// Returns [`Busy`] if the policy rejects it or the queue is full.
    pub fn enqueue(&mut self, input: PipelineInput, policy: BusyPolicy) -> Result<(), Busy> {
        match policy {
            BusyPolicy::Reject => Err(Busy),
            BusyPolicy::Queue if self.queued.is_some() => Err(Busy),
            BusyPolicy::Queue => {
                self.queued = Some(input);
                Ok(())
            }
        }
    }

    /// Session id to put in replies: the caller's if given, else ours
    #[must_use]
    pub fn echo_id(&self, caller: Option<&str>) -> String {
        caller.map_or_else(|| self.id.clone(), ToString::to_string)
    }
}
