//! Session Coordinator - Per-Connection Pipeline Orchestration
//!
//! Every connection gets one session, and every session is driven by one
//! actor task. The actor owns the [`Session`] outright; other tasks talk to
//! it through a command channel and observe it through a watch channel.
//!
//! # Pipeline
//!
//! ```text
//! audio ─▶ recognize ─▶ text_recognized ─┐
//! text  ─▶ text_received ────────────────┴▶ generate ─▶ [llm_request … llm_response]
//!                                                           │
//! llm_response (idle) ──────────────────────────────────────┤
//!                                                           ▼
//!                      video_data ◀─ video_ready ◀─ render ◀─ animate ◀─ synthesize
//! ```
//!
//! At most one stage future is in flight per session. The actor `select!`s
//! over that future and its command channel, so cancel, disconnect and
//! out-of-band messages are handled while a collaborator call is suspended.
//! Dropping the stage future abandons the run; collaborators clean their
//! temporary files up on drop.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, watch, Notify};

use crate::animation::{animate, AnimationConfig, PhonemeTimeline};
use crate::backend::{
    with_retry, BackendError, Generation, GenerationRequest, RenderRequest, RenderedVideo,
    Renderer, ResponseGenerator, RetryConfig, SttEngine, Synthesis, TtsEngine,
};
use crate::config::{AvatarConfig, TimeoutConfig};
use crate::connection_registry::{ConnectionId, ConnectionRegistry, Registration};
use crate::error::PipelineError;
use crate::events::{decode_audio, InboundMessage};
use crate::messages::OutboundMessage;
use crate::session::{BusyPolicy, PipelineInput, Session, SessionState};

const COMMAND_BUFFER: usize = 32;

/// Coordinator settings
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Frame rate, blend window and smoothing
    pub animation: AnimationConfig,
    /// Input handling while busy
    pub busy_policy: BusyPolicy,
    /// Avatar used until the client selects one
    pub default_avatar: String,
    /// Per-call timeouts
    pub timeouts: TimeoutConfig,
    /// Retry policy for recognition and synthesis
    pub retry: RetryConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&AvatarConfig::default())
    }
}

impl From<&AvatarConfig> for CoordinatorConfig {
    fn from(config: &AvatarConfig) -> Self {
        Self {
            animation: config.animation,
            busy_policy: config.session.busy_policy,
            default_avatar: config.session.default_avatar.clone(),
            timeouts: config.timeouts,
            retry: config.retry.clone(),
        }
    }
}

/// Collaborators shared by every session
#[derive(Clone)]
pub struct Services {
    /// Speech recognition
    pub stt: Arc<dyn SttEngine>,
    /// Speech synthesis
    pub tts: Arc<dyn TtsEngine>,
    /// Reply generation
    pub generator: Arc<dyn ResponseGenerator>,
    /// Video rendering
    pub renderer: Arc<dyn Renderer>,
    /// Word timings to phonemes
    pub timeline: PhonemeTimeline,
}

struct Shared {
    config: CoordinatorConfig,
    services: Services,
    registry: ConnectionRegistry,
}

/// Handle to one session's actor
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: ConnectionId,
    generation: u64,
    commands: mpsc::Sender<InboundMessage>,
    close: Arc<Notify>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// Connection the session belongs to
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Watch the session's state
    #[must_use]
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Current state
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    fn close(&self) {
        self.close.notify_one();
    }
}

/// Owns every session and routes inbound messages to them
#[derive(Clone)]
pub struct SessionCoordinator {
    shared: Arc<Shared>,
    sessions: Arc<DashMap<ConnectionId, SessionHandle>>,
}

impl SessionCoordinator {
    /// Create a coordinator
    pub fn new(config: CoordinatorConfig, services: Services, registry: ConnectionRegistry) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                services,
                registry,
            }),
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Registry outbound messages are sent through
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.shared.registry
    }

    /// Coordinator settings
    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    /// Number of open sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Handle for an open session
    pub fn session(&self, id: &ConnectionId) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Start the session for a freshly registered connection
    ///
    /// A session left over from a replaced registration of the same id is
    /// closed first.
    pub fn open_session(&self, registration: &Registration) -> SessionHandle {
        let session = Session::new(registration.id.as_str());
        let (state_tx, state_rx) = watch::channel(session.state.clone());
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let close = Arc::new(Notify::new());

        let handle = SessionHandle {
            id: registration.id.clone(),
            generation: registration.generation,
            commands: commands_tx,
            close: Arc::clone(&close),
            state: state_rx,
        };

        if let Some(previous) = self.sessions.insert(registration.id.clone(), handle.clone()) {
            tracing::info!(
                session_id = %registration.id,
                previous_generation = previous.generation,
                "Closing session of replaced connection"
            );
            previous.close();
        }

        let actor = SessionActor {
            session,
            connection_id: registration.id.clone(),
            shared: Arc::clone(&self.shared),
            state_tx,
            stage: None,
            run: None,
        };
        tokio::spawn(actor.run(commands_rx, close));

        tracing::info!(session_id = %registration.id, "Session opened");
        handle
    }

    /// Deliver one inbound message to a session without waiting
    ///
    /// `ping` is answered here; everything else goes to the session actor.
    /// Nothing on this path waits for channel capacity, so a transport that
    /// both reads and writes on one task can call it freely. A full command
    /// queue is answered with `session busy`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::TransportError`] if the session does not
    /// exist or has closed. The message is not processed.
    pub fn submit(&self, id: &ConnectionId, message: InboundMessage) -> Result<(), PipelineError> {
        let Some(handle) = self.session(id) else {
            return Err(PipelineError::TransportError(format!("no open session for {id}")));
        };
        if handle.state.borrow().is_terminal() {
            return Err(PipelineError::TransportError(format!("session {id} is closed")));
        }

        if matches!(message, InboundMessage::Ping) {
            if !self.shared.registry.send_to(id, OutboundMessage::Pong) {
                tracing::debug!(session_id = %id, "Outbound queue full, pong dropped");
            }
            return Ok(());
        }

        let kind = message.kind();
        match handle.commands.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(session_id = %id, kind, "Command queue full, rejecting input");
                self.shared
                    .registry
                    .send_to(id, OutboundMessage::error("session busy"));
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PipelineError::TransportError(
                format!("session {id} stopped before `{kind}` was handled"),
            )),
        }
    }

    /// The single exit path for a connection
    ///
    /// Closes the session (abandoning any in-flight run) and then removes
    /// and closes the registry handle. A stale registration whose id has
    /// since been re-registered leaves the newer session alone.
    pub fn disconnect(&self, registration: &Registration) {
        let removed = self
            .sessions
            .remove_if(&registration.id, |_, handle| {
                handle.generation == registration.generation
            });

        if let Some((_, handle)) = removed {
            handle.close();
            tracing::info!(session_id = %registration.id, "Session closed on disconnect");
        }
        self.shared.registry.remove(registration);
    }

    /// Close every session
    pub fn close_all(&self) {
        let ids: Vec<ConnectionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, handle)) = self.sessions.remove(&id) {
                handle.close();
            }
        }
    }
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("sessions", &self.sessions.len())
            .field("busy_policy", &self.shared.config.busy_policy)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Session Actor
// =============================================================================

#[derive(Debug)]
enum StageOutcome {
    Recognized(Result<Option<String>, BackendError>),
    Generated(Result<Generation, BackendError>),
    ReplyTimedOut,
    Synthesized(Result<Synthesis, BackendError>),
    Rendered(Result<RenderedVideo, PipelineError>),
    Delivered(Result<(), PipelineError>),
}

/// Context of the run in progress
struct Run {
    session_id: String,
    callback_id: String,
    prompt: Option<String>,
    avatar_override: Option<String>,
    awaiting_reply: bool,
    started: Instant,
}

impl Run {
    fn new(session_id: String, callback_id: Option<String>) -> Self {
        Self {
            session_id,
            callback_id: callback_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            prompt: None,
            avatar_override: None,
            awaiting_reply: false,
            started: Instant::now(),
        }
    }
}

struct SessionActor {
    session: Session,
    connection_id: ConnectionId,
    shared: Arc<Shared>,
    state_tx: watch::Sender<SessionState>,
    stage: Option<BoxFuture<'static, StageOutcome>>,
    run: Option<Run>,
}

async fn next_outcome(stage: &mut Option<BoxFuture<'static, StageOutcome>>) -> StageOutcome {
    match stage {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn bounded<T, F>(operation: &'static str, limit: Duration, call: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or_else(|_| Err(BackendError::Timeout {
            operation,
            timeout: limit,
        }))
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<InboundMessage>, close: Arc<Notify>) {
        loop {
            tokio::select! {
                biased;

                () = close.notified() => break,

                command = commands.recv() => match command {
                    Some(message) => self.on_message(message).await,
                    None => break,
                },

                outcome = next_outcome(&mut self.stage) => {
                    self.stage = None;
                    self.on_outcome(outcome).await;
                }
            }

            if self.session.state.is_terminal() {
                break;
            }
        }

        self.close();
    }

    fn transition(&mut self, next: SessionState) -> bool {
        let changed = self.session.transition(next);
        if changed {
            self.state_tx.send_replace(self.session.state.clone());
        }
        changed
    }

    // `&mut self` keeps the actor future `Send`: the stage future is not `Sync`
    async fn send(&mut self, message: OutboundMessage) -> bool {
        self.shared
            .registry
            .send_to_async(&self.connection_id, message)
            .await
    }

    fn close(&mut self) {
        if self.session.state.is_terminal() {
            return;
        }
        let abandoned = self.stage.take().is_some();
        self.session.queued = None;
        self.run = None;
        self.transition(SessionState::Closed);
        tracing::info!(
            session_id = %self.session.id,
            abandoned_run = abandoned,
            "Session closed"
        );
    }

    // -------------------------------------------------------------------------
    // Inbound messages
    // -------------------------------------------------------------------------

    async fn on_message(&mut self, message: InboundMessage) {
        tracing::debug!(
            session_id = %self.session.id,
            kind = message.kind(),
            state = %self.session.state,
            "Inbound message"
        );

        let input = match message {
            InboundMessage::Ping => {
                self.send(OutboundMessage::Pong).await;
                return;
            }
            InboundMessage::SelectAvatar {
                avatar_id,
                session_id,
            } => {
                let echo = self.session.echo_id(session_id.as_deref());
                tracing::info!(session_id = %self.session.id, avatar_id = %avatar_id, "Avatar selected");
                self.session.selected_avatar = Some(avatar_id.clone());
                self.send(OutboundMessage::avatar_selected(avatar_id, echo))
                    .await;
                return;
            }
            InboundMessage::Cancel { session_id } => {
                self.cancel(session_id.as_deref()).await;
                return;
            }
            InboundMessage::Audio { audio, session_id } => match decode_audio(&audio) {
                Ok(audio) => PipelineInput::Audio { audio, session_id },
                Err(e) => {
                    tracing::warn!(session_id = %self.session.id, error = %e, "Rejected audio payload");
                    self.send(OutboundMessage::error(e.to_string())).await;
                    return;
                }
            },
            InboundMessage::Text { text, callback_id } => {
                if text.trim().is_empty() {
                    self.send(OutboundMessage::error("text must not be empty"))
                        .await;
                    return;
                }
                PipelineInput::Text { text, callback_id }
            }
            InboundMessage::LlmResponse {
                text,
                avatar_id,
                session_id,
                callback_id,
            } => {
                if self.awaiting_reply() {
                    self.on_reply(text, avatar_id, session_id, callback_id)
                        .await;
                    return;
                }
                PipelineInput::Response {
                    text,
                    avatar_id,
                    session_id,
                    callback_id,
                }
            }
        };

        if self.session.state == SessionState::Idle {
            self.start(input).await;
            return;
        }

        let kind = input.kind();
        match self.session.enqueue(input, self.shared.config.busy_policy) {
            Ok(()) => tracing::info!(
                session_id = %self.session.id,
                kind,
                state = %self.session.state,
                "Queued input behind running pipeline"
            ),
            Err(_) => {
                tracing::info!(
                    session_id = %self.session.id,
                    kind,
                    state = %self.session.state,
                    policy = %self.shared.config.busy_policy,
                    "Rejected input, session busy"
                );
                self.send(OutboundMessage::error("session busy")).await;
            }
        }
    }

    fn awaiting_reply(&self) -> bool {
        self.session.state == SessionState::AwaitingGeneration
            && self.run.as_ref().is_some_and(|run| run.awaiting_reply)
    }

    async fn cancel(&mut self, session_id: Option<&str>) {
        let echo = self.session.echo_id(session_id);
        let abandoned = self.stage.take().is_some();
        let dropped_queue = self.session.queued.take().is_some();
        self.run = None;
        if self.session.state.is_busy() {
            self.transition(SessionState::Idle);
        }
        tracing::info!(
            session_id = %self.session.id,
            abandoned_run = abandoned,
            dropped_queue,
            "Pipeline cancelled"
        );
        self.send(OutboundMessage::Cancelled { session_id: echo }).await;
    }

    // -------------------------------------------------------------------------
    // Stage dispatch
    // -------------------------------------------------------------------------

    async fn start(&mut self, input: PipelineInput) {
        match input {
            PipelineInput::Audio { audio, session_id } => {
                let run = Run::new(self.session.echo_id(session_id.as_deref()), None);
                self.run = Some(run);
                self.transition(SessionState::AwaitingRecognition);
                self.stage = Some(self.recognition_stage(Arc::from(audio)));
            }
            PipelineInput::Text { text, callback_id } => {
                self.run = Some(Run::new(self.session.id.clone(), callback_id));
                self.transition(SessionState::AwaitingRecognition);
                self.send(OutboundMessage::TextReceived { text: text.clone() })
                    .await;
                self.dispatch_generation(text);
            }
            PipelineInput::Response {
                text,
                avatar_id,
                session_id,
                callback_id,
            } => {
                let mut run = Run::new(self.session.echo_id(session_id.as_deref()), callback_id);
                run.avatar_override = avatar_id;
                self.run = Some(run);
                self.transition(SessionState::Synthesizing);
                self.stage = Some(self.synthesis_stage(text));
            }
        }
    }

    fn dispatch_generation(&mut self, prompt: String) {
        let avatar_id = self.avatar_for_run();
        let Some(run) = self.run.as_mut() else {
            return;
        };
        run.prompt = Some(prompt.clone());
        let request = GenerationRequest {
            prompt,
            callback_id: run.callback_id.clone(),
            avatar_id,
            session_id: run.session_id.clone(),
        };
        self.session.pending_request_id = Some(request.callback_id.clone());
        self.transition(SessionState::AwaitingGeneration);

        let generator = Arc::clone(&self.shared.services.generator);
        let limit = self.shared.config.timeouts.generation;
        self.stage = Some(
            async move {
                StageOutcome::Generated(
                    bounded("generation", limit, generator.generate(&request)).await,
                )
            }
            .boxed(),
        );
    }

    async fn on_reply(
        &mut self,
        text: String,
        avatar_id: Option<String>,
        session_id: Option<String>,
        callback_id: Option<String>,
    ) {
        if let (Some(got), Some(expected)) = (&callback_id, &self.session.pending_request_id) {
            if got != expected {
                tracing::warn!(
                    session_id = %self.session.id,
                    callback_id = %got,
                    expected = %expected,
                    "Ignoring reply for another request"
                );
                self.send(OutboundMessage::error(format!(
                    "unexpected callback_id {got}"
                )))
                .await;
                return;
            }
        }

        // the reply timer is the current stage
        self.stage = None;
        if let Some(run) = self.run.as_mut() {
            run.awaiting_reply = false;
            if avatar_id.is_some() {
                run.avatar_override = avatar_id;
            }
            if let Some(session_id) = session_id {
                run.session_id = session_id;
            }
        }
        self.transition(SessionState::Synthesizing);
        self.stage = Some(self.synthesis_stage(text));
    }

    fn recognition_stage(&self, audio: Arc<[u8]>) -> BoxFuture<'static, StageOutcome> {
        let stt = Arc::clone(&self.shared.services.stt);
        let retry = self.shared.config.retry.clone();
        let limit = self.shared.config.timeouts.recognition;
        async move {
            let result = with_retry(&retry, "recognition", || {
                bounded("recognition", limit, stt.recognize(&audio))
            })
            .await;
            StageOutcome::Recognized(result)
        }
        .boxed()
    }

    fn synthesis_stage(&self, text: String) -> BoxFuture<'static, StageOutcome> {
        let tts = Arc::clone(&self.shared.services.tts);
        let retry = self.shared.config.retry.clone();
        let limit = self.shared.config.timeouts.synthesis;
        async move {
            let result = with_retry(&retry, "synthesis", || {
                bounded("synthesis", limit, tts.synthesize(&text))
            })
            .await;
            StageOutcome::Synthesized(result)
        }
        .boxed()
    }

    fn render_stage(&self, synthesis: Synthesis, avatar_id: String) -> BoxFuture<'static, StageOutcome> {
        let timeline = self.shared.services.timeline.clone();
        let renderer = Arc::clone(&self.shared.services.renderer);
        let animation = self.shared.config.animation;
        let limit = self.shared.config.timeouts.render;

        async move {
            let render = async move {
                let Synthesis {
                    audio,
                    word_timings,
                    duration_secs,
                    ..
                } = synthesis;

                // smoothing state lives in the scheduler, so frames for one
                // stream are produced sequentially on a single thread
                let frames = tokio::task::spawn_blocking(move || {
                    animate(&timeline, &word_timings, duration_secs, &animation)
                })
                .await
                .map_err(PipelineError::render)?
                .map_err(PipelineError::render)?;

                let request = RenderRequest {
                    avatar_id,
                    frames,
                    fps: animation.fps,
                    audio,
                };
                renderer.render(request).await.map_err(PipelineError::render)
            };

            let result = tokio::time::timeout(limit, render).await.unwrap_or_else(|_| {
                Err(PipelineError::render(BackendError::Timeout {
                    operation: "render",
                    timeout: limit,
                }))
            });
            StageOutcome::Rendered(result)
        }
        .boxed()
    }

    fn delivery_stage(&self, video: RenderedVideo, session_id: String) -> BoxFuture<'static, StageOutcome> {
        let registry = self.shared.registry.clone();
        let connection_id = self.connection_id.clone();

        async move {
            let bytes = match tokio::fs::read(&video.path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    return StageOutcome::Delivered(Err(PipelineError::RenderFailed(format!(
                        "cannot read {}: {e}",
                        video.path.display()
                    ))))
                }
            };

            let ready = OutboundMessage::VideoReady {
                video_path: video.path.display().to_string(),
                session_id,
            };
            let delivered = registry.send_to_async(&connection_id, ready).await
                && registry
                    .send_to_async(&connection_id, OutboundMessage::video_data(&bytes))
                    .await;

            StageOutcome::Delivered(if delivered {
                Ok(())
            } else {
                Err(PipelineError::TransportError(
                    "connection closed during delivery".into(),
                ))
            })
        }
        .boxed()
    }

    fn avatar_for_run(&self) -> String {
        self.run
            .as_ref()
            .and_then(|run| run.avatar_override.clone())
            .or_else(|| self.session.selected_avatar.clone())
            .unwrap_or_else(|| self.shared.config.default_avatar.clone())
    }

    // -------------------------------------------------------------------------
    // Stage outcomes
    // -------------------------------------------------------------------------

    async fn on_outcome(&mut self, outcome: StageOutcome) {
        match outcome {
            StageOutcome::Recognized(Ok(Some(text))) if !text.trim().is_empty() => {
                let session_id = self.run_session_id();
                self.send(OutboundMessage::TextRecognized {
                    text: text.clone(),
                    session_id,
                })
                .await;
                self.dispatch_generation(text);
            }
            StageOutcome::Recognized(Ok(_)) => {
                self.fail(PipelineError::RecognitionFailed("no speech recognized".into()))
                    .await;
            }
            StageOutcome::Recognized(Err(e)) => self.fail(PipelineError::recognition(&e)).await,

            StageOutcome::Generated(Ok(Generation::Answered(reply))) => {
                self.transition(SessionState::Synthesizing);
                self.stage = Some(self.synthesis_stage(reply));
            }
            StageOutcome::Generated(Ok(Generation::Deferred)) => self.await_reply().await,
            StageOutcome::Generated(Err(e)) => self.fail(PipelineError::generation(&e)).await,
            StageOutcome::ReplyTimedOut => {
                let limit = self.shared.config.timeouts.generation;
                self.fail(PipelineError::GenerationFailed(format!(
                    "no llm_response within {}ms",
                    limit.as_millis()
                )))
                .await;
            }

            StageOutcome::Synthesized(Ok(synthesis)) => {
                tracing::debug!(
                    session_id = %self.session.id,
                    duration_secs = synthesis.duration_secs,
                    words = synthesis.word_timings.len(),
                    "Synthesis complete"
                );
                let avatar_id = self.avatar_for_run();
                self.transition(SessionState::Rendering);
                self.stage = Some(self.render_stage(synthesis, avatar_id));
            }
            StageOutcome::Synthesized(Err(e)) => self.fail(PipelineError::synthesis(&e)).await,

            StageOutcome::Rendered(Ok(video)) => {
                let session_id = self.run_session_id();
                self.transition(SessionState::Delivering);
                self.stage = Some(self.delivery_stage(video, session_id));
            }
            StageOutcome::Rendered(Err(e)) | StageOutcome::Delivered(Err(e)) => self.fail(e).await,

            StageOutcome::Delivered(Ok(())) => {
                let elapsed_ms = self
                    .run
                    .take()
                    .map_or(0, |run| run.started.elapsed().as_millis());
                tracing::info!(
                    session_id = %self.session.id,
                    elapsed_ms = u64::try_from(elapsed_ms).unwrap_or(u64::MAX),
                    "Pipeline complete"
                );
                self.transition(SessionState::Idle);
                self.start_queued().await;
            }
        }
    }

    async fn await_reply(&mut self) {
        let (text, callback_id) = match self.run.as_mut() {
            Some(run) => {
                run.awaiting_reply = true;
                (run.prompt.clone().unwrap_or_default(), run.callback_id.clone())
            }
            None => return,
        };

        self.send(OutboundMessage::LlmRequest { text, callback_id })
            .await;

        let limit = self.shared.config.timeouts.generation;
        self.stage = Some(
            async move {
                tokio::time::sleep(limit).await;
                StageOutcome::ReplyTimedOut
            }
            .boxed(),
        );
    }

    fn run_session_id(&self) -> String {
        self.run
            .as_ref()
            .map_or_else(|| self.session.id.clone(), |run| run.session_id.clone())
    }

    async fn fail(&mut self, error: PipelineError) {
        self.stage = None;
        self.run = None;

        if matches!(error, PipelineError::TransportError(_)) {
            tracing::warn!(session_id = %self.session.id, error = %error, "Transport lost");
            self.close();
            return;
        }

        if error.is_reported() {
            tracing::warn!(
                session_id = %self.session.id,
                stage = error.stage(),
                error = %error,
                "Pipeline stage failed"
            );
            self.transition(SessionState::Errored(error.clone()));
            self.send(OutboundMessage::error(error.to_string())).await;
        } else {
            tracing::info!(
                session_id = %self.session.id,
                stage = error.stage(),
                reason = %error,
                "Dropping input"
            );
        }

        self.transition(SessionState::Idle);
        self.start_queued().await;
    }

    async fn start_queued(&mut self) {
        if self.session.state != SessionState::Idle {
            return;
        }
        if let Some(next) = self.session.queued.take() {
            tracing::debug!(session_id = %self.session.id, kind = next.kind(), "Starting queued input");
            self.start(next).await;
        }
    }
}
