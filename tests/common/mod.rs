//! Test infrastructure for conversation integration tests.
//!
//! Fakes for every external collaborator of the controller (token endpoint,
//! microphone, output device, live session, host hooks) that record what the
//! controller does to them.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::Level;
use tracing_subscriber::EnvFilter;

pub use gemini_live_conversation::audio::{
    AudioBackend, MediaTrack, MicrophoneStream, OutputGraph, SoftwareOutputGraph, StreamFormat,
    TransportFrame,
};
pub use gemini_live_conversation::client::{
    AuthToken, LiveConnector, LiveSession, SessionEvent, TokenProvider,
};
pub use gemini_live_conversation::types::{
    BidiGenerateContentClientContent, BidiGenerateContentSetup,
};
pub use gemini_live_conversation::{
    ConversationBuilder, ConversationConfig, ConversationContext, ConversationError,
    ConversationHandle, SessionState, StartOutcome, StopReason,
};

pub fn init_test_logger() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(Level::INFO.into())
                    .from_env_lossy(),
            )
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Returns a session and immediately reports setup complete.
    OpenImmediately,
    /// Returns a session but never reports setup complete.
    OpenSilently,
    /// Never returns.
    Hang,
    Fail,
    /// Panics inside the connect attempt.
    Panic,
}

/// How the fake world responds to the controller.
#[derive(Debug, Clone, Copy)]
pub struct Scenario {
    pub allow_start: bool,
    pub token_fails: bool,
    pub mic_denied: bool,
    pub mic_format: StreamFormat,
    pub connect: ConnectBehavior,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            allow_start: true,
            token_fails: false,
            mic_denied: false,
            mic_format: StreamFormat {
                sample_rate: 48000,
                channels: 1,
            },
            connect: ConnectBehavior::OpenImmediately,
        }
    }
}

/// Everything the fakes observed.
#[derive(Clone, Default)]
pub struct Recorder {
    pub authorization_checks: Arc<AtomicUsize>,
    pub token_fetches: Arc<AtomicUsize>,
    pub mic_opens: Arc<AtomicUsize>,
    pub track_stops: Arc<AtomicUsize>,
    pub mic_tx: Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>,
    pub output_graphs: Arc<Mutex<Vec<Arc<SoftwareOutputGraph>>>>,
    pub connects: Arc<AtomicUsize>,
    pub setups: Arc<Mutex<Vec<BidiGenerateContentSetup>>>,
    pub events_tx: Arc<Mutex<Option<mpsc::Sender<SessionEvent>>>>,
    pub sent_audio: Arc<Mutex<Vec<TransportFrame>>>,
    pub sent_content: Arc<Mutex<Vec<BidiGenerateContentClientContent>>>,
    pub session_closes: Arc<AtomicUsize>,
    pub usage: Arc<Mutex<Vec<u64>>>,
    pub errors: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn output_graph(&self) -> Option<Arc<SoftwareOutputGraph>> {
        self.output_graphs.lock().unwrap().last().cloned()
    }

    pub async fn emit(&self, event: SessionEvent) {
        let tx = self
            .events_tx
            .lock()
            .unwrap()
            .clone()
            .expect("no session has been opened");
        tx.send(event).await.expect("controller dropped the session events");
    }

    pub async fn push_mic_chunk(&self, chunk: Vec<f32>) {
        let tx = self
            .mic_tx
            .lock()
            .unwrap()
            .clone()
            .expect("microphone not opened");
        tx.send(chunk).await.expect("capture pipeline dropped the microphone");
    }
}

struct FakeTokens {
    scenario: Scenario,
    seen: Recorder,
}

#[async_trait]
impl TokenProvider for FakeTokens {
    async fn fetch_token(&self) -> Result<AuthToken, ConversationError> {
        self.seen.token_fetches.fetch_add(1, Ordering::SeqCst);
        if self.scenario.token_fails {
            return Err(ConversationError::ServiceUnavailable(
                "token endpoint returned 503".to_string(),
            ));
        }
        Ok(AuthToken::new("test-token"))
    }
}

struct CountingTrack {
    stops: Arc<AtomicUsize>,
}

impl MediaTrack for CountingTrack {
    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn label(&self) -> &str {
        "fake-mic"
    }
}

struct FakeAudio {
    scenario: Scenario,
    seen: Recorder,
}

#[async_trait]
impl AudioBackend for FakeAudio {
    async fn open_microphone(&self) -> Result<MicrophoneStream, ConversationError> {
        if self.scenario.mic_denied {
            return Err(ConversationError::PermissionDenied(
                "user dismissed the prompt".to_string(),
            ));
        }
        self.seen.mic_opens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        *self.seen.mic_tx.lock().unwrap() = Some(tx);
        let track = CountingTrack {
            stops: self.seen.track_stops.clone(),
        };
        Ok(MicrophoneStream::new(
            self.scenario.mic_format,
            rx,
            vec![Box::new(track)],
        ))
    }

    async fn open_output(
        &self,
        sample_rate: u32,
    ) -> Result<Arc<dyn OutputGraph>, ConversationError> {
        let graph = Arc::new(SoftwareOutputGraph::headless(sample_rate));
        self.seen.output_graphs.lock().unwrap().push(graph.clone());
        Ok(graph)
    }
}

struct FakeSession {
    seen: Recorder,
    closed: bool,
}

#[async_trait]
impl LiveSession for FakeSession {
    fn send_realtime_audio(&self, frame: TransportFrame) -> Result<(), ConversationError> {
        self.seen.sent_audio.lock().unwrap().push(frame);
        Ok(())
    }

    async fn send_client_content(
        &self,
        content: BidiGenerateContentClientContent,
    ) -> Result<(), ConversationError> {
        self.seen.sent_content.lock().unwrap().push(content);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConversationError> {
        if self.closed {
            return Err(ConversationError::AlreadyClosed);
        }
        self.closed = true;
        self.seen.session_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeConnector {
    scenario: Scenario,
    seen: Recorder,
}

#[async_trait]
impl LiveConnector for FakeConnector {
    async fn connect(
        &self,
        _token: &AuthToken,
        setup: BidiGenerateContentSetup,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Box<dyn LiveSession>, ConversationError> {
        self.seen.connects.fetch_add(1, Ordering::SeqCst);
        self.seen.setups.lock().unwrap().push(setup);
        match self.scenario.connect {
            ConnectBehavior::Fail => {
                return Err(ConversationError::ServiceUnavailable(
                    "handshake refused".to_string(),
                ));
            }
            ConnectBehavior::Hang => std::future::pending::<()>().await,
            ConnectBehavior::Panic => panic!("connector bug"),
            ConnectBehavior::OpenImmediately => {
                events
                    .send(SessionEvent::Open)
                    .await
                    .map_err(|_| ConversationError::SendError)?;
            }
            ConnectBehavior::OpenSilently => {}
        }
        *self.seen.events_tx.lock().unwrap() = Some(events);
        Ok(Box::new(FakeSession {
            seen: self.seen.clone(),
            closed: false,
        }))
    }
}

/// Builder wired to fakes for `scenario`, plus the seen observing them.
pub fn fake_builder(scenario: Scenario, config: ConversationConfig) -> (ConversationBuilder, Recorder) {
    init_test_logger();
    let seen = Recorder::default();
    let auth_seen = seen.clone();
    let usage_seen = seen.clone();
    let error_seen = seen.clone();
    let builder = ConversationBuilder::new(config)
        .token_provider(FakeTokens {
            scenario,
            seen: seen.clone(),
        })
        .audio_backend(FakeAudio {
            scenario,
            seen: seen.clone(),
        })
        .connector(FakeConnector {
            scenario,
            seen: seen.clone(),
        })
        .authorize_with(move || {
            auth_seen.authorization_checks.fetch_add(1, Ordering::SeqCst);
            scenario.allow_start
        })
        .on_usage(move |secs: u64| usage_seen.usage.lock().unwrap().push(secs))
        .on_error(move |message: &str| error_seen.errors.lock().unwrap().push(message.to_string()));
    (builder, seen)
}

pub fn spawn_with(scenario: Scenario, config: ConversationConfig) -> (ConversationHandle, Recorder) {
    let (builder, seen) = fake_builder(scenario, config);
    let handle = builder.spawn().expect("controller should spawn");
    (handle, seen)
}

pub fn spawn(scenario: Scenario) -> (ConversationHandle, Recorder) {
    spawn_with(scenario, ConversationConfig::default())
}

pub fn question() -> ConversationContext {
    ConversationContext::new("How do I use the subjunctive here?")
        .video_title("Spanish in 10 minutes")
        .transcript("Espero que tengas un buen día.")
}

/// Waits for `state`, failing the test after `limit`.
pub async fn expect_state(handle: &ConversationHandle, state: SessionState, limit: Duration) {
    tokio::time::timeout(limit, handle.wait_for_state(state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}, still {:?}", state, handle.state()))
        .expect("controller gone");
}

/// Polls `condition` every few milliseconds until it holds or `limit` passes.
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(limit, poll).await.is_ok()
}

/// 24kHz PCM fragment of `len` samples, as the model would send it.
pub fn model_fragment(len: usize) -> SessionEvent {
    SessionEvent::Audio(TransportFrame::from_f32(&vec![0.25; len], 24000))
}
