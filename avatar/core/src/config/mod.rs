//! TOML Configuration File Support
//!
//! Configuration for the avatar server lives in
//! `$XDG_CONFIG_HOME/talking-avatar/avatar.toml` (typically
//! `~/.config/talking-avatar/avatar.toml`). Every field is optional and a
//! missing file is not an error.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments (applied by the caller through [`ConfigOverrides`])
//! 2. Environment variables (`AVATAR_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8765"
//! max_connections = 100
//!
//! [animation]
//! fps = 30
//! blend_window_secs = 0.1
//! smoothing_alpha = 0.3
//!
//! [session]
//! busy_policy = "queue"
//! default_avatar = "professional/model_v1"
//!
//! [speech]
//! sample_rate = 16000
//! voice = "hi-IN-SwaraNeural"
//! language = "hi-IN"
//! stt_program = "whisper"
//! tts_program = "piper"
//!
//! [generation]
//! mode = "relay"            # or "http"
//! endpoint = "http://localhost:8080/generate"
//!
//! [render]
//! program = "avatar-render"
//! output_dir = "outputs"
//!
//! [cache]
//! enabled = true
//! dir = "cache/tts"
//! ttl_secs = 3600
//!
//! [timeouts]
//! recognition_secs = 30
//! generation_secs = 60
//! synthesis_secs = 60
//! render_secs = 120
//!
//! [retry]
//! max_retries = 2
//! initial_backoff_ms = 200
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::animation::AnimationConfig;
use crate::backend::{CommandSpec, RetryConfig};
use crate::session::BusyPolicy;
use crate::synthesis_cache::CacheConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[server]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Listen address
    pub bind: Option<String>,

    /// Maximum concurrent connections
    pub max_connections: Option<usize>,

    /// Outbound messages buffered per connection
    pub outbound_buffer: Option<usize>,
}

/// `[animation]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnimationToml {
    /// Output frame rate
    pub fps: Option<u32>,

    /// Viseme ramp length in seconds
    pub blend_window_secs: Option<f64>,

    /// Smoothing factor in `(0, 1]`
    pub smoothing_alpha: Option<f32>,
}

/// `[session]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionToml {
    /// `queue` or `reject`
    pub busy_policy: Option<String>,

    /// Avatar used until the client selects one
    pub default_avatar: Option<String>,
}

/// `[speech]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechToml {
    /// Audio sample rate in Hz
    pub sample_rate: Option<u32>,

    /// Synthesis voice
    pub voice: Option<String>,

    /// Recognition language
    pub language: Option<String>,

    /// Speech recognition program
    pub stt_program: Option<String>,

    /// Extra arguments for the recognition program
    pub stt_args: Option<Vec<String>>,

    /// Speech synthesis program
    pub tts_program: Option<String>,

    /// Extra arguments for the synthesis program
    pub tts_args: Option<Vec<String>>,
}

/// `[generation]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationToml {
    /// `relay` or `http`
    pub mode: Option<String>,

    /// HTTP endpoint for `http` mode
    pub endpoint: Option<String>,

    /// Bearer token for `http` mode
    pub api_key: Option<String>,
}

/// `[render]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderToml {
    /// Encoder program
    pub program: Option<String>,

    /// Extra arguments for the encoder
    pub args: Option<Vec<String>>,

    /// Where encoded videos are written
    pub output_dir: Option<PathBuf>,
}

/// `[cache]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheToml {
    /// Whether synthesis results are cached
    pub enabled: Option<bool>,

    /// Cache directory
    pub dir: Option<PathBuf>,

    /// Entry lifetime in seconds
    pub ttl_secs: Option<u64>,
}

/// `[timeouts]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsToml {
    /// Speech recognition limit
    pub recognition_secs: Option<u64>,

    /// Response generation limit
    pub generation_secs: Option<u64>,

    /// Speech synthesis limit
    pub synthesis_secs: Option<u64>,

    /// Render and encode limit
    pub render_secs: Option<u64>,
}

/// `[retry]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryToml {
    /// Retries after the first attempt
    pub max_retries: Option<u32>,

    /// First backoff delay
    pub initial_backoff_ms: Option<u64>,

    /// Backoff cap
    pub max_backoff_ms: Option<u64>,

    /// Growth factor between delays
    pub backoff_multiplier: Option<f32>,

    /// Randomize delays
    pub use_jitter: Option<bool>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarToml {
    /// Server section
    pub server: ServerToml,
    /// Animation section
    pub animation: AnimationToml,
    /// Session section
    pub session: SessionToml,
    /// Speech section
    pub speech: SpeechToml,
    /// Generation section
    pub generation: GenerationToml,
    /// Render section
    pub render: RenderToml,
    /// Cache section
    pub cache: CacheToml,
    /// Timeouts section
    pub timeouts: TimeoutsToml,
    /// Retry section
    pub retry: RetryToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Network settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen address
    pub bind: String,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Outbound messages buffered per connection
    pub outbound_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8765".to_string(),
            max_connections: 100,
            outbound_buffer: 64,
        }
    }
}

/// Per-session behaviour
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// What happens to input while a run is in progress
    pub busy_policy: BusyPolicy,
    /// Avatar used until the client selects one
    pub default_avatar: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            busy_policy: BusyPolicy::Queue,
            default_avatar: "professional/model_v1".to_string(),
        }
    }
}

/// Speech recognition and synthesis engines
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpeechConfig {
    /// Audio sample rate in Hz
    pub sample_rate: u32,
    /// Synthesis voice
    pub voice: String,
    /// Recognition language, passed to the recognizer as `--language`
    pub language: String,
    /// Recognition program
    pub stt: CommandSpec,
    /// Synthesis program
    pub tts: CommandSpec,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            voice: "hi-IN-SwaraNeural".to_string(),
            language: "hi-IN".to_string(),
            stt: CommandSpec::new("whisper"),
            tts: CommandSpec::new("piper"),
        }
    }
}

/// How replies are generated
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    /// The client generates replies (`llm_request` / `llm_response`)
    #[default]
    Relay,
    /// The server calls an HTTP endpoint
    Http,
}

impl FromStr for GenerationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relay" => Ok(Self::Relay),
            "http" => Ok(Self::Http),
            other => Err(format!("unknown generation mode `{other}` (expected relay or http)")),
        }
    }
}

/// Response generation settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationConfig {
    /// Relay to the client or call an endpoint
    pub mode: GenerationMode,
    /// Endpoint for [`GenerationMode::Http`]
    pub endpoint: String,
    /// Bearer token for the endpoint
    pub api_key: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            mode: GenerationMode::Relay,
            endpoint: "http://localhost:8080/generate".to_string(),
            api_key: None,
        }
    }
}

/// Video encoder settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderConfig {
    /// Encoder program
    pub program: CommandSpec,
    /// Where encoded videos are written
    pub output_dir: PathBuf,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            program: CommandSpec::new("avatar-render"),
            output_dir: PathBuf::from("outputs"),
        }
    }
}

/// Bound on each external call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Speech recognition
    pub recognition: Duration,
    /// Response generation, including waiting for a relayed reply
    pub generation: Duration,
    /// Speech synthesis
    pub synthesis: Duration,
    /// Animation plus encoding
    pub render: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            recognition: Duration::from_secs(30),
            generation: Duration::from_secs(60),
            synthesis: Duration::from_secs(60),
            render: Duration::from_secs(120),
        }
    }
}

/// Resolved configuration for the avatar server
///
/// Use [`load_config`] to build one with proper priority handling.
#[derive(Clone, Debug)]
pub struct AvatarConfig {
    /// Network settings
    pub server: ServerConfig,
    /// Frame rate, blend window and smoothing
    pub animation: AnimationConfig,
    /// Busy policy and default avatar
    pub session: SessionConfig,
    /// Speech engines
    pub speech: SpeechConfig,
    /// Response generation
    pub generation: GenerationConfig,
    /// Video encoder
    pub render: RenderConfig,
    /// Synthesis cache
    pub cache: CacheConfig,
    /// Per-call timeouts
    pub timeouts: TimeoutConfig,
    /// Retry policy for recognition and synthesis
    pub retry: RetryConfig,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            animation: AnimationConfig::default(),
            session: SessionConfig::default(),
            speech: SpeechConfig::default(),
            generation: GenerationConfig::default(),
            render: RenderConfig::default(),
            cache: CacheConfig::default(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl AvatarConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Listen address as a socket address
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if `bind` does not parse.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server.bind.parse().map_err(|e| {
            ConfigError::ValidationError(format!("server.bind `{}`: {e}", self.server.bind))
        })
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        self.bind_addr()?;
        if self.server.max_connections == 0 {
            return invalid("server.max_connections must be positive".into());
        }
        if self.server.outbound_buffer == 0 {
            return invalid("server.outbound_buffer must be positive".into());
        }

        let animation = &self.animation;
        if animation.fps == 0 {
            return invalid("animation.fps must be positive".into());
        }
        if !animation.blend_window_secs.is_finite() || animation.blend_window_secs < 0.0 {
            return invalid(format!(
                "animation.blend_window_secs must be finite and >= 0, got {}",
                animation.blend_window_secs
            ));
        }
        if !(animation.smoothing_alpha > 0.0 && animation.smoothing_alpha <= 1.0) {
            return invalid(format!(
                "animation.smoothing_alpha must be in (0, 1], got {}",
                animation.smoothing_alpha
            ));
        }

        if self.speech.sample_rate == 0 {
            return invalid("speech.sample_rate must be positive".into());
        }
        if self.speech.voice.trim().is_empty() {
            return invalid("speech.voice must not be empty".into());
        }
        if self.session.default_avatar.trim().is_empty() {
            return invalid("session.default_avatar must not be empty".into());
        }

        for (name, timeout) in [
            ("recognition", self.timeouts.recognition),
            ("generation", self.timeouts.generation),
            ("synthesis", self.timeouts.synthesis),
            ("render", self.timeouts.render),
        ] {
            if timeout.is_zero() {
                return invalid(format!("timeouts.{name} must be non-zero"));
            }
        }

        if self.cache.enabled && self.cache.ttl.is_zero() {
            return invalid("cache.ttl_secs must be non-zero when the cache is enabled".into());
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return invalid(format!(
                "retry.backoff_multiplier must be >= 1, got {}",
                self.retry.backoff_multiplier
            ));
        }

        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/talking-avatar/avatar.toml` or
/// `~/.config/talking-avatar/avatar.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("talking-avatar").join("avatar.toml"))
}

/// Load configuration from the default path, the environment and defaults
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the result fails validation. A missing file is not an error.
pub fn load_config() -> Result<AvatarConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// If `path` is `None`, only defaults and environment variables are used.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or the result
/// fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<AvatarConfig, ConfigError> {
    load_with_env(path, |key| std::env::var(key).ok())
}

fn load_with_env<F>(path: Option<PathBuf>, env: F) -> Result<AvatarConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = AvatarConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: AvatarToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;
    Ok(config)
}

fn command(program: &str, args: Option<&Vec<String>>) -> CommandSpec {
    CommandSpec::new(program).with_args(args.cloned().unwrap_or_default())
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut AvatarConfig, toml: &AvatarToml) -> Result<(), ConfigError> {
    // Server
    if let Some(ref bind) = toml.server.bind {
        config.server.bind.clone_from(bind);
    }
    if let Some(max) = toml.server.max_connections {
        config.server.max_connections = max;
    }
    if let Some(buffer) = toml.server.outbound_buffer {
        config.server.outbound_buffer = buffer;
    }

    // Animation
    if let Some(fps) = toml.animation.fps {
        config.animation.fps = fps;
    }
    if let Some(window) = toml.animation.blend_window_secs {
        config.animation.blend_window_secs = window;
    }
    if let Some(alpha) = toml.animation.smoothing_alpha {
        config.animation.smoothing_alpha = alpha;
    }

    // Session
    if let Some(ref policy) = toml.session.busy_policy {
        config.session.busy_policy = policy
            .parse()
            .map_err(|e: String| ConfigError::ValidationError(format!("session.busy_policy: {e}")))?;
    }
    if let Some(ref avatar) = toml.session.default_avatar {
        config.session.default_avatar.clone_from(avatar);
    }

    // Speech
    if let Some(rate) = toml.speech.sample_rate {
        config.speech.sample_rate = rate;
    }
    if let Some(ref voice) = toml.speech.voice {
        config.speech.voice.clone_from(voice);
    }
    if let Some(ref language) = toml.speech.language {
        config.speech.language.clone_from(language);
    }
    if let Some(ref program) = toml.speech.stt_program {
        config.speech.stt = command(program, toml.speech.stt_args.as_ref());
    } else if let Some(ref args) = toml.speech.stt_args {
        config.speech.stt.args.clone_from(args);
    }
    if let Some(ref program) = toml.speech.tts_program {
        config.speech.tts = command(program, toml.speech.tts_args.as_ref());
    } else if let Some(ref args) = toml.speech.tts_args {
        config.speech.tts.args.clone_from(args);
    }

    // Generation
    if let Some(ref mode) = toml.generation.mode {
        config.generation.mode = mode
            .parse()
            .map_err(|e: String| ConfigError::ValidationError(format!("generation.mode: {e}")))?;
    }
    if let Some(ref endpoint) = toml.generation.endpoint {
        config.generation.endpoint.clone_from(endpoint);
    }
    if toml.generation.api_key.is_some() {
        config.generation.api_key.clone_from(&toml.generation.api_key);
    }

    // Render
    if let Some(ref program) = toml.render.program {
        config.render.program = command(program, toml.render.args.as_ref());
    } else if let Some(ref args) = toml.render.args {
        config.render.program.args.clone_from(args);
    }
    if let Some(ref dir) = toml.render.output_dir {
        config.render.output_dir.clone_from(dir);
    }

    // Cache
    if let Some(enabled) = toml.cache.enabled {
        config.cache.enabled = enabled;
    }
    if let Some(ref dir) = toml.cache.dir {
        config.cache.dir.clone_from(dir);
    }
    if let Some(ttl) = toml.cache.ttl_secs {
        config.cache.ttl = Duration::from_secs(ttl);
    }

    // Timeouts
    if let Some(secs) = toml.timeouts.recognition_secs {
        config.timeouts.recognition = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.timeouts.generation_secs {
        config.timeouts.generation = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.timeouts.synthesis_secs {
        config.timeouts.synthesis = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.timeouts.render_secs {
        config.timeouts.render = Duration::from_secs(secs);
    }

    // Retry
    if let Some(n) = toml.retry.max_retries {
        config.retry.max_retries = n;
    }
    if let Some(ms) = toml.retry.initial_backoff_ms {
        config.retry.initial_backoff_ms = ms;
    }
    if let Some(ms) = toml.retry.max_backoff_ms {
        config.retry.max_backoff_ms = ms;
    }
    if let Some(factor) = toml.retry.backoff_multiplier {
        config.retry.backoff_multiplier = factor;
    }
    if let Some(jitter) = toml.retry.use_jitter {
        config.retry.use_jitter = jitter;
    }

    Ok(())
}

/// Apply environment variable overrides to the config
///
/// Unparseable values are logged and ignored.
fn apply_env_config<F>(config: &mut AvatarConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    // Server settings from environment
    if let Some(bind) = env("AVATAR_BIND") {
        config.server.bind = bind;
        config.source = ConfigSource::Env;
    }
    if let Some(n) = parse_env(&env, "AVATAR_MAX_CONNECTIONS") {
        config.server.max_connections = n;
        config.source = ConfigSource::Env;
    }

    // Animation and session settings from environment
    if let Some(fps) = parse_env(&env, "AVATAR_FPS") {
        config.animation.fps = fps;
        config.source = ConfigSource::Env;
    }
    if let Some(policy) = parse_env(&env, "AVATAR_BUSY_POLICY") {
        config.session.busy_policy = policy;
        config.source = ConfigSource::Env;
    }
    if let Some(avatar) = env("AVATAR_DEFAULT_AVATAR") {
        config.session.default_avatar = avatar;
        config.source = ConfigSource::Env;
    }

    // Speech settings from environment
    if let Some(rate) = parse_env(&env, "AVATAR_SAMPLE_RATE") {
        config.speech.sample_rate = rate;
        config.source = ConfigSource::Env;
    }
    if let Some(voice) = env("AVATAR_VOICE") {
        config.speech.voice = voice;
        config.source = ConfigSource::Env;
    }
    if let Some(language) = env("AVATAR_LANGUAGE") {
        config.speech.language = language;
        config.source = ConfigSource::Env;
    }
    if let Some(program) = env("AVATAR_STT_PROGRAM") {
        config.speech.stt.program = PathBuf::from(program);
        config.source = ConfigSource::Env;
    }
    if let Some(program) = env("AVATAR_TTS_PROGRAM") {
        config.speech.tts.program = PathBuf::from(program);
        config.source = ConfigSource::Env;
    }

    // Generation settings from environment
    if let Some(mode) = parse_env(&env, "AVATAR_GENERATION_MODE") {
        config.generation.mode = mode;
        config.source = ConfigSource::Env;
    }
    if let Some(endpoint) = env("AVATAR_GENERATION_ENDPOINT") {
        config.generation.endpoint = endpoint;
        config.source = ConfigSource::Env;
    }
    if let Some(key) = env("AVATAR_API_KEY") {
        config.generation.api_key = Some(key);
        config.source = ConfigSource::Env;
    }

    // Render and cache settings from environment
    if let Some(program) = env("AVATAR_RENDER_PROGRAM") {
        config.render.program.program = PathBuf::from(program);
        config.source = ConfigSource::Env;
    }
    if let Some(dir) = env("AVATAR_OUTPUT_DIR") {
        config.render.output_dir = PathBuf::from(dir);
        config.source = ConfigSource::Env;
    }
    if let Some(enabled) = env("AVATAR_CACHE_ENABLED") {
        config.cache.enabled = enabled != "0" && !enabled.eq_ignore_ascii_case("false");
        config.source = ConfigSource::Env;
    }
    if let Some(dir) = env("AVATAR_CACHE_DIR") {
        config.cache.dir = PathBuf::from(dir);
        config.source = ConfigSource::Env;
    }
}

fn parse_env<T, F>(env: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let value = env(key)?;
    let parsed = value.trim().parse().ok();
    if parsed.is_none() {
        tracing::warn!(key, value = %value, "Ignoring unparseable environment override");
    }
    parsed
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen address override
    pub bind: Option<String>,

    /// Busy policy override
    pub busy_policy: Option<BusyPolicy>,

    /// Video output directory override
    pub output_dir: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listen address override
    #[must_use]
    pub fn with_bind(mut self, bind: String) -> Self {
        self.bind = Some(bind);
        self
    }

    /// Set busy policy override
    #[must_use]
    pub fn with_busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.busy_policy = Some(policy);
        self
    }

    /// Set output directory override
    #[must_use]
    pub fn with_output_dir(mut self, dir: PathBuf) -> Self {
        self.output_dir = Some(dir);
        self
    }

    /// Whether any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bind.is_none() && self.busy_policy.is_none() && self.output_dir.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut AvatarConfig) {
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref bind) = self.bind {
            config.server.bind.clone_from(bind);
        }
        if let Some(policy) = self.busy_policy {
            config.session.busy_policy = policy;
        }
        if let Some(ref dir) = self.output_dir {
            config.render.output_dir.clone_from(dir);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
