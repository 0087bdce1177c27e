//! External Collaborators
//!
//! Speech recognition, response generation, speech synthesis and video
//! rendering are reached through the traits in this module. The coordinator
//! only ever holds `Arc<dyn Trait>` handles, built once at startup.
//!
//! # Available Implementations
//!
//! - [`CommandStt`] / [`CommandTts`]: local speech programs over stdin/stdout
//! - [`ClientRelay`]: defers generation to the connected client (default)
//! - [`HttpGenerator`]: posts prompts to an HTTP endpoint
//! - [`CommandRenderer`]: external encoder producing MP4 files
//!
//! # Usage
//!
//! ```ignore
//! use avatar_core::backend::{CommandSpec, CommandTts, TtsEngine};
//!
//! let tts = CommandTts::new(CommandSpec::new("piper"), "hi-IN-SwaraNeural", 16_000, timeout);
//! let synthesis = tts.synthesize("namaste").await?;
//! ```

mod generation;
mod render;
mod retry;
mod subprocess;
mod traits;
pub mod wav;

pub use generation::{ClientRelay, HttpGenerator};
pub use render::CommandRenderer;
pub use retry::{with_retry, RetryConfig};
pub use subprocess::{
    even_word_timings, CommandSpec, CommandStt, CommandTts, MAX_STT_INPUT_BYTES,
    MAX_TTS_INPUT_BYTES,
};
pub use traits::{
    BackendError, Generation, GenerationRequest, RenderRequest, RenderedVideo, Renderer,
    ResponseGenerator, SttEngine, Synthesis, TtsEngine,
};
