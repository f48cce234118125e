use super::audio_input_pipeline::AudioInputProcessor;
use super::connection::{LiveConnector, LiveSession, SessionEvent};
use super::hooks::{ErrorSink, StartAuthorization, UsageSink};
use super::prompt::ConversationContext;
use super::token::TokenProvider;
use crate::audio::input::MicrophoneStream;
use crate::audio::pcm::TransportFrame;
use crate::audio::playback::AudioPlaybackScheduler;
use crate::audio::AudioBackend;
use crate::config::ConversationConfig;
use crate::error::ConversationError;
use crate::types::{
    BidiGenerateContentSetup, Content, GenerationConfig, Part, PrebuiltVoiceConfig,
    ResponseModality, SpeechConfig, VoiceConfig,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, trace, warn};

const SESSION_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Recording,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    UserClose,
    SessionTimeout,
    RemoteError,
    RemoteClose,
    StartFailure,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::UserClose => "user_close",
            StopReason::SessionTimeout => "session_timeout",
            StopReason::RemoteError => "remote_error",
            StopReason::RemoteClose => "remote_close",
            StopReason::StartFailure => "start_failure",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a start request. Refusals are not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A conversation is already connecting or recording.
    AlreadyActive,
    /// The authorization check refused the start.
    Denied,
}

pub(crate) enum Command {
    Start {
        context: ConversationContext,
        reply: oneshot::Sender<StartOutcome>,
    },
    Stop {
        reason: StopReason,
        done: oneshot::Sender<()>,
    },
}

/// External collaborators the controller drives.
#[derive(Clone)]
pub(crate) struct Services {
    pub(crate) audio: Arc<dyn AudioBackend>,
    pub(crate) tokens: Arc<dyn TokenProvider>,
    pub(crate) connector: Arc<dyn LiveConnector>,
    pub(crate) authorization: Arc<dyn StartAuthorization>,
    pub(crate) usage: Arc<dyn UsageSink>,
    pub(crate) errors: Arc<dyn ErrorSink>,
}

/// Resources produced by the connect attempt, handed over one at a time.
enum ConnectProgress {
    Microphone(MicrophoneStream),
    Session(Box<dyn LiveSession>),
    Failed(ConversationError),
}

/// Everything owned by one conversation, from start request to teardown.
struct Attempt {
    context: ConversationContext,
    started_at: Instant,
    /// `None` when the limit is too far out to represent.
    session_deadline: Option<Instant>,
    connect_task: Option<JoinHandle<()>>,
    progress_rx: Option<mpsc::Receiver<ConnectProgress>>,
    events_rx: Option<mpsc::Receiver<SessionEvent>>,
    microphone: Option<MicrophoneStream>,
    session: Option<Box<dyn LiveSession>>,
    input: Option<AudioInputProcessor>,
    frames_rx: Option<mpsc::Receiver<TransportFrame>>,
    scheduler: Option<AudioPlaybackScheduler>,
    playing_deadline: Option<Instant>,
    /// Setup completed before the connect attempt handed the session over.
    open_pending: bool,
}

enum Event {
    Command(Command),
    Shutdown,
    Progress(Option<ConnectProgress>),
    Session(Option<SessionEvent>),
    Frame(Option<TransportFrame>),
    SessionTimeout,
    QuietPeriodElapsed,
}

/// Owns every piece of conversation state and serializes all transitions.
///
/// Runs as a single task fed by the handle's commands, the connect attempt,
/// the session's events, the capture pipeline's frames and two deadlines.
pub(crate) struct ConversationController {
    config: ConversationConfig,
    services: Services,
    state_tx: watch::Sender<SessionState>,
    playing_tx: watch::Sender<bool>,
    attempt: Option<Attempt>,
}

impl ConversationController {
    pub(crate) fn new(
        config: ConversationConfig,
        services: Services,
        state_tx: watch::Sender<SessionState>,
        playing_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            config,
            services,
            state_tx,
            playing_tx,
            attempt: None,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        info!("[Controller] Started.");
        loop {
            let event = {
                let (progress, events, frames, session_deadline, playing_deadline) =
                    match self.attempt.as_mut() {
                        Some(a) => (
                            a.progress_rx.as_mut(),
                            a.events_rx.as_mut(),
                            a.frames_rx.as_mut(),
                            a.session_deadline,
                            a.playing_deadline,
                        ),
                        None => (None, None, None, None, None),
                    };

                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => Event::Shutdown,
                    cmd = commands.recv() => match cmd {
                        Some(cmd) => Event::Command(cmd),
                        None => Event::Shutdown,
                    },
                    _ = sleep_until_opt(session_deadline) => Event::SessionTimeout,
                    p = recv_opt(progress) => Event::Progress(p),
                    e = recv_opt(events) => Event::Session(e),
                    f = recv_opt(frames) => Event::Frame(f),
                    _ = sleep_until_opt(playing_deadline) => Event::QuietPeriodElapsed,
                }
            };

            match event {
                Event::Shutdown => break,
                Event::Command(cmd) => self.handle_command(cmd).await,
                Event::Progress(p) => self.handle_progress(p).await,
                Event::Session(e) => self.handle_session_event(e).await,
                Event::Frame(f) => self.handle_frame(f),
                Event::SessionTimeout => {
                    info!("[Controller] Session limit reached.");
                    self.teardown(StopReason::SessionTimeout).await;
                }
                Event::QuietPeriodElapsed => self.clear_playing(),
            }
        }

        if self.attempt.is_some() {
            info!("[Controller] Handle closed during a conversation; tearing down.");
            self.teardown(StopReason::UserClose).await;
        }
        info!("[Controller] Stopped.");
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: SessionState) {
        debug!("[Controller] State -> {:?}", state);
        self.state_tx.send_replace(state);
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { context, reply } => {
                let outcome = self.start(context);
                let _ = reply.send(outcome);
            }
            Command::Stop { reason, done } => {
                if self.attempt.is_some() {
                    self.teardown(reason).await;
                } else {
                    debug!("[Controller] Stop ({}) while idle; nothing to do.", reason);
                }
                let _ = done.send(());
            }
        }
    }

    fn start(&mut self, context: ConversationContext) -> StartOutcome {
        if self.attempt.is_some() {
            info!(
                "[Controller] Start ignored: conversation already {:?}.",
                self.state()
            );
            return StartOutcome::AlreadyActive;
        }
        if !self.services.authorization.can_start() {
            info!("[Controller] Start refused by authorization check.");
            return StartOutcome::Denied;
        }

        let started_at = Instant::now();
        let (progress_tx, progress_rx) = mpsc::channel(4);
        let (events_tx, events_rx) = mpsc::channel(SESSION_EVENT_CAPACITY);
        let connect_task = tokio::spawn(run_connect_attempt(
            self.services.clone(),
            live_setup(&self.config),
            events_tx,
            progress_tx,
        ));

        self.attempt = Some(Attempt {
            context,
            started_at,
            session_deadline: started_at.checked_add(self.config.session_limit_duration()),
            connect_task: Some(connect_task),
            progress_rx: Some(progress_rx),
            events_rx: Some(events_rx),
            microphone: None,
            session: None,
            input: None,
            frames_rx: None,
            scheduler: None,
            playing_deadline: None,
            open_pending: false,
        });
        self.set_state(SessionState::Connecting);
        info!(
            "[Controller] Conversation starting (limit {}s).",
            self.config.session_limit_secs
        );
        StartOutcome::Started
    }

    async fn handle_progress(&mut self, progress: Option<ConnectProgress>) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        match progress {
            Some(ConnectProgress::Microphone(mic)) => {
                debug!("[Controller] Microphone granted.");
                attempt.microphone = Some(mic);
            }
            Some(ConnectProgress::Session(session)) => {
                attempt.session = Some(session);
                if attempt.open_pending {
                    self.on_open().await;
                } else {
                    debug!("[Controller] Session opened; waiting for setup to complete.");
                }
            }
            Some(ConnectProgress::Failed(e)) => {
                self.fail(e, StopReason::StartFailure).await;
            }
            None => {
                attempt.progress_rx = None;
                if let Some(task) = attempt.connect_task.take() {
                    log_connect_exit(task.await);
                }
                if attempt.session.is_none() {
                    let e = ConversationError::ServiceUnavailable(
                        "connect attempt ended without a session".to_string(),
                    );
                    self.fail(e, StopReason::StartFailure).await;
                }
            }
        }
    }

    async fn handle_session_event(&mut self, event: Option<SessionEvent>) {
        let state = self.state();
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        match event {
            Some(SessionEvent::Open) if state == SessionState::Connecting => {
                if attempt.session.is_none() {
                    attempt.open_pending = true;
                    return;
                }
                self.on_open().await;
            }
            Some(SessionEvent::Open) => debug!("[Controller] Ignoring open while {:?}.", state),
            Some(SessionEvent::Audio(frame)) => {
                let Some(scheduler) = attempt.scheduler.as_ref() else {
                    debug!("[Controller] Audio fragment before playback is ready; dropped.");
                    return;
                };
                match scheduler.add(&frame) {
                    Ok(()) => {
                        attempt.playing_deadline = Instant::now()
                            .checked_add(self.config.playing_indicator_quiet_duration());
                        self.playing_tx.send_replace(true);
                    }
                    Err(e) => debug!("[Controller] Fragment dropped: {}", e),
                }
            }
            Some(SessionEvent::Error(message)) => {
                self.fail(ConversationError::RemoteError(message), StopReason::RemoteError)
                    .await;
            }
            Some(SessionEvent::Close(reason)) => {
                self.fail(ConversationError::RemoteClose(reason), StopReason::RemoteClose)
                    .await;
            }
            None => {
                attempt.events_rx = None;
                if state == SessionState::Recording {
                    self.fail(
                        ConversationError::RemoteClose("event stream ended".to_string()),
                        StopReason::RemoteClose,
                    )
                    .await;
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: Option<TransportFrame>) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        match frame {
            Some(frame) => {
                if let Some(session) = attempt.session.as_ref() {
                    if let Err(e) = session.send_realtime_audio(frame) {
                        trace!("[Controller] Captured frame not sent: {}", e);
                    }
                }
            }
            None => attempt.frames_rx = None,
        }
    }

    async fn on_open(&mut self) {
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.open_pending = false;
        }
        if let Err(e) = self.begin_recording().await {
            self.fail(e, StopReason::StartFailure).await;
        }
    }

    /// Wires capture to the session and playback to the output graph, then
    /// sends the opening turn.
    async fn begin_recording(&mut self) -> Result<(), ConversationError> {
        let config = &self.config;
        let audio = self.services.audio.clone();
        let Some(attempt) = self.attempt.as_mut() else {
            return Ok(());
        };
        let mic = attempt.microphone.as_mut().ok_or_else(|| {
            ConversationError::NotReady("session opened before microphone".to_string())
        })?;
        let format = mic.format();
        let chunks = mic
            .take_chunks()
            .ok_or_else(|| ConversationError::NotReady("microphone already consumed".to_string()))?;

        let processor =
            config
                .processor
                .load(format.sample_rate, config.capture_sample_rate, config.block_size)?;
        let (frames_tx, frames_rx) = mpsc::channel(config.frame_sink_capacity);
        let mut input = AudioInputProcessor::new(config.block_size);
        input.start(chunks, format, processor, frames_tx)?;
        attempt.input = Some(input);
        attempt.frames_rx = Some(frames_rx);

        let graph = audio.open_output(config.playback_sample_rate).await?;
        attempt.scheduler = Some(AudioPlaybackScheduler::new(graph));
        let opening = attempt.context.opening_turn(config.max_context_chars);

        self.set_state(SessionState::Recording);
        info!("[Controller] Recording.");

        let session = self
            .attempt
            .as_ref()
            .and_then(|a| a.session.as_ref())
            .ok_or_else(|| ConversationError::NotReady("session handle missing".to_string()))?;
        session.send_client_content(opening).await?;
        Ok(())
    }

    async fn fail(&mut self, error: ConversationError, reason: StopReason) {
        warn!("[Controller] Conversation failed ({}): {}", reason, error);
        self.services.errors.report(&error.to_string());
        self.teardown(reason).await;
    }

    fn clear_playing(&mut self) {
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.playing_deadline = None;
        }
        self.playing_tx.send_replace(false);
    }

    /// Releases everything the current attempt holds. Runs its body at most
    /// once per attempt; the attempt is taken out of `self` first.
    async fn teardown(&mut self, reason: StopReason) {
        let Some(mut attempt) = self.attempt.take() else {
            return;
        };
        info!("[Controller] Stopping: {}", reason);
        self.set_state(SessionState::Stopping);

        if let Some(task) = attempt.connect_task.take() {
            task.abort();
            log_connect_exit(task.await);
        }
        if let Some(mut progress_rx) = attempt.progress_rx.take() {
            while let Ok(progress) = progress_rx.try_recv() {
                match progress {
                    ConnectProgress::Microphone(mic) => attempt.microphone = Some(mic),
                    ConnectProgress::Session(session) => attempt.session = Some(session),
                    ConnectProgress::Failed(_) => {}
                }
            }
        }

        if let Some(input) = attempt.input.as_mut() {
            input.disconnect().await;
        }
        if let Some(mut mic) = attempt.microphone.take() {
            mic.stop_tracks();
        }
        if let Some(mut input) = attempt.input.take() {
            input.close();
        }
        attempt.frames_rx = None;

        let elapsed = attempt.started_at.elapsed().as_secs_f64().round() as u64;
        info!("[Controller] Conversation lasted {}s.", elapsed);
        self.services.usage.record_usage(elapsed);

        if let Some(scheduler) = attempt.scheduler.take() {
            scheduler.stop();
        }
        if let Some(mut session) = attempt.session.take() {
            match session.close().await {
                Ok(()) | Err(ConversationError::AlreadyClosed) => {}
                Err(e) => warn!("[Controller] Error closing session: {}", e),
            }
        }
        attempt.events_rx = None;

        attempt.playing_deadline = None;
        self.playing_tx.send_replace(false);
        self.set_state(SessionState::Idle);
        info!("[Controller] Conversation stopped ({}).", reason);
    }
}

async fn run_connect_attempt(
    services: Services,
    setup: BidiGenerateContentSetup,
    events_tx: mpsc::Sender<SessionEvent>,
    progress_tx: mpsc::Sender<ConnectProgress>,
) {
    let token = match services.tokens.fetch_token().await {
        Ok(token) => token,
        Err(e) => {
            let _ = progress_tx.send(ConnectProgress::Failed(e)).await;
            return;
        }
    };
    debug!("[Controller] Session token acquired.");

    match services.audio.open_microphone().await {
        Ok(mic) => {
            if progress_tx.send(ConnectProgress::Microphone(mic)).await.is_err() {
                return;
            }
        }
        Err(e) => {
            let _ = progress_tx.send(ConnectProgress::Failed(e)).await;
            return;
        }
    }

    let progress = match services.connector.connect(&token, setup, events_tx).await {
        Ok(session) => ConnectProgress::Session(session),
        Err(e) => ConnectProgress::Failed(e),
    };
    let _ = progress_tx.send(progress).await;
}

fn log_connect_exit(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("[Controller] Connect attempt panicked: {}", e);
        }
    }
}

/// Session setup requesting spoken responses.
pub(crate) fn live_setup(config: &ConversationConfig) -> BidiGenerateContentSetup {
    let speech_config = if config.voice_name.is_some() || config.language_code.is_some() {
        Some(SpeechConfig {
            voice_config: config.voice_name.as_ref().map(|name| VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: name.clone(),
                },
            }),
            language_code: config.language_code.clone(),
        })
    } else {
        None
    };
    BidiGenerateContentSetup {
        model: config.model.clone(),
        generation_config: Some(GenerationConfig {
            response_modalities: Some(vec![ResponseModality::Audio]),
            speech_config,
            ..Default::default()
        }),
        system_instruction: config.system_instruction.as_ref().map(|text| Content {
            parts: vec![Part {
                text: Some(text.clone()),
                inline_data: None,
            }],
            role: None,
        }),
    }
}

async fn recv_opt<T>(rx: Option<&mut mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
