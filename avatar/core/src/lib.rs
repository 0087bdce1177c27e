//! Avatar Core - Lip-Synced Talking Avatar Pipeline
//!
//! This crate turns a user's speech or text into a rendered video of an
//! avatar speaking a reply. It holds the animation math, the session state
//! machine and the coordinator that drives each connection's pipeline. It
//! knows nothing about WebSockets: the daemon owns the transport and talks
//! to this crate in parsed [`InboundMessage`]s and [`OutboundMessage`]s.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                         avatar-daemon                              │
//! │   WebSocket accept ─▶ InboundMessage ─┐   ┌─◀ OutboundMessage      │
//! └───────────────────────────────────────┼───┼────────────────────────┘
//!                                         │   │
//! ┌───────────────────────────────────────┼───┼────────────────────────┐
//! │                        AVATAR CORE    ▼   │                        │
//! │  ┌──────────────────────────────────────────────┐  ┌────────────┐  │
//! │  │ SessionCoordinator (one actor per session)   │─▶│ Connection │  │
//! │  └──┬──────────┬────────────┬──────────┬────────┘  │  Registry  │  │
//! │     │          │            │          │           └────────────┘  │
//! │  ┌──▼──┐  ┌────▼─────┐  ┌───▼───┐  ┌───▼──────────────────────┐    │
//! │  │ STT │  │ Generator│  │  TTS  │  │ animate ─▶ Renderer      │    │
//! │  └─────┘  └──────────┘  │(cache)│  │ phoneme ▸ viseme ▸ blend │    │
//! │                         └───────┘  └──────────────────────────┘    │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`SessionCoordinator`]: owns every session and routes messages to them
//! - [`ConnectionRegistry`]: live connections and their outbound channels
//! - [`Session`] / [`SessionState`]: per-connection pipeline state
//! - [`AnimationConfig`] / [`animate`]: word timings to pose frames
//! - [`CachedTts`]: content-addressed synthesis cache
//!
//! # Module Overview
//!
//! - [`animation`]: phoneme timeline, viseme mapping, blending and frame scheduling
//! - [`backend`]: recognition, generation, synthesis and rendering collaborators
//! - [`config`]: layered configuration (defaults, file, environment, CLI)
//! - [`connection_registry`]: connection bookkeeping and outbound delivery
//! - [`coordinator`]: per-session pipeline actors
//! - [`error`]: pipeline failure taxonomy
//! - [`events`]: messages from clients
//! - [`messages`]: messages to clients
//! - [`session`]: session state machine and busy policy
//! - [`synthesis_cache`]: on-disk cache in front of a speech synthesizer

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod animation;
pub mod backend;
pub mod config;
pub mod connection_registry;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod messages;
pub mod session;
pub mod synthesis_cache;

// Re-exports for convenience
pub use animation::{
    animate, AnimationConfig, PhonemeTimeline, PoseFrame, PoseVector, VisemeCategory, WordTiming,
};
pub use backend::{
    BackendError, ClientRelay, CommandRenderer, CommandSpec, CommandStt, CommandTts, Generation,
    HttpGenerator, RenderRequest, RenderedVideo, Renderer, ResponseGenerator, RetryConfig,
    SttEngine, Synthesis, TtsEngine,
};
pub use connection_registry::{
    BroadcastResult, CloseReason, CloseSignal, ConnectionHandle, ConnectionId, ConnectionRegistry,
    Registration,
};
pub use coordinator::{CoordinatorConfig, Services, SessionCoordinator, SessionHandle};
pub use error::PipelineError;
pub use events::{InboundMessage, ProtocolError};
pub use messages::OutboundMessage;
pub use session::{BusyPolicy, PipelineInput, Session, SessionState};
pub use synthesis_cache::{CacheConfig, CacheError, CachedTts};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, AvatarConfig, AvatarToml,
    ConfigError, ConfigOverrides, ConfigSource, GenerationMode,
};
