//! Avatar Daemon
//!
//! WebSocket server for the talking avatar. Clients connect to
//! `ws://{bind}/ws/{client_id}`, send speech or text, and receive a rendered
//! video of the avatar speaking the reply.
//!
//! # Usage
//!
//! ```bash
//! # Start with the default config ($XDG_CONFIG_HOME/talking-avatar/avatar.toml)
//! avatar-daemon
//!
//! # Listen elsewhere and refuse input while a reply is being produced
//! avatar-daemon --bind 127.0.0.1:9000 --busy-policy reject
//!
//! # With verbose logging
//! RUST_LOG=debug avatar-daemon
//! ```
//!
//! # Environment Variables
//!
//! - `AVATAR_CONFIG`: Config file path
//! - `AVATAR_BIND`, `AVATAR_BUSY_POLICY`, `AVATAR_OUTPUT_DIR`: same as the flags
//! - Any other `AVATAR_*` variable read by the config loader
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: Graceful shutdown (connections are closed first)

mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use avatar_core::backend::{
    ClientRelay, CommandRenderer, CommandStt, CommandTts, HttpGenerator, ResponseGenerator,
    TtsEngine,
};
use avatar_core::config::{load_config_from_path, AvatarConfig, ConfigOverrides, GenerationMode};
use avatar_core::{
    BusyPolicy, CachedTts, ConnectionRegistry, CoordinatorConfig, PhonemeTimeline, Services,
    SessionCoordinator,
};

use crate::server::AvatarServer;

/// Talking avatar WebSocket server
#[derive(Debug, Parser)]
#[command(name = "avatar-daemon", version, about)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/talking-avatar/avatar.toml)
    #[arg(long, env = "AVATAR_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:8765
    #[arg(long, env = "AVATAR_BIND")]
    bind: Option<String>,

    /// What to do with input while a reply is in progress (queue or reject)
    #[arg(long, env = "AVATAR_BUSY_POLICY")]
    busy_policy: Option<BusyPolicy>,

    /// Where rendered videos are written
    #[arg(long, env = "AVATAR_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref bind) = self.bind {
            overrides = overrides.with_bind(bind.clone());
        }
        if let Some(policy) = self.busy_policy {
            overrides = overrides.with_busy_policy(policy);
        }
        if let Some(ref dir) = self.output_dir {
            overrides = overrides.with_output_dir(dir.clone());
        }
        overrides
    }
}

/// Build the collaborators named by the config
fn build_services(config: &AvatarConfig) -> Result<Services> {
    let speech = &config.speech;

    let mut stt_spec = speech.stt.clone();
    stt_spec
        .args
        .extend(["--language".to_string(), speech.language.clone()]);
    let stt = CommandStt::new(stt_spec, speech.sample_rate, config.timeouts.recognition);

    let engine = CommandTts::new(
        speech.tts.clone(),
        speech.voice.clone(),
        speech.sample_rate,
        config.timeouts.synthesis,
    );
    let tts: Arc<dyn TtsEngine> = if config.cache.enabled {
        Arc::new(CachedTts::new(engine, config.cache.clone()))
    } else {
        Arc::new(engine)
    };

    let generator: Arc<dyn ResponseGenerator> = match config.generation.mode {
        GenerationMode::Relay => Arc::new(ClientRelay),
        GenerationMode::Http => Arc::new(
            HttpGenerator::new(
                config.generation.endpoint.clone(),
                config.generation.api_key.clone(),
                config.timeouts.generation,
            )
            .context("Failed to build HTTP generator")?,
        ),
    };

    let renderer = CommandRenderer::new(
        config.render.program.clone(),
        config.render.output_dir.clone(),
        config.timeouts.render,
    );

    Ok(Services {
        stt: Arc::new(stt),
        tts,
        generator,
        renderer: Arc::new(renderer),
        timeline: PhonemeTimeline::default(),
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("avatar_daemon=info".parse()?)
                .add_directive("avatar_core=info".parse()?),
        )
        .with_target(true)
        .init();

    let args = Args::parse();
    info!(pid = std::process::id(), "Starting avatar daemon");

    let mut config =
        load_config_from_path(args.config.clone()).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        source = ?config.source(),
        file = ?config.config_file_path,
        bind = %config.server.bind,
        busy_policy = %config.session.busy_policy,
        generation = ?config.generation.mode,
        cache = config.cache.enabled,
        "Configuration loaded"
    );

    let services = build_services(&config)?;
    let coordinator = SessionCoordinator::new(
        CoordinatorConfig::from(&config),
        services,
        ConnectionRegistry::new(),
    );

    let server = AvatarServer::bind(&config.server, coordinator).await?;
    server.run(shutdown_signal()).await?;

    info!("Avatar daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_to_overrides() {
        let args = Args::try_parse_from([
            "avatar-daemon",
            "--bind",
            "127.0.0.1:9000",
            "--busy-policy",
            "reject",
        ])
        .unwrap();

        let overrides = args.overrides();
        assert_eq!(overrides.bind.as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(overrides.busy_policy, Some(BusyPolicy::Reject));
        assert_eq!(overrides.output_dir, None);
    }

    #[test]
    fn test_bad_busy_policy_rejected() {
        assert!(Args::try_parse_from(["avatar-daemon", "--busy-policy", "drop"]).is_err());
    }

    #[test]
    fn test_services_follow_config() {
        let mut config = AvatarConfig::default();
        config.generation.mode = GenerationMode::Http;
        config.cache.enabled = false;

        let services = build_services(&config).unwrap();
        assert_eq!(services.generator.name(), "http");
        assert_eq!(services.tts.name(), "command-tts");
    }
}
