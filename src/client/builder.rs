use super::connection::{LiveConnector, WebSocketConnector};
use super::controller::{ConversationController, Services, SessionState};
use super::handle::ConversationHandle;
use super::hooks::{AllowAll, ErrorSink, LogErrors, LogUsage, StartAuthorization, UsageSink};
use super::token::{HttpTokenProvider, TokenProvider};
use crate::audio::AudioBackend;
use crate::config::ConversationConfig;
use crate::error::ConversationError;
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::{mpsc, oneshot, watch};

const COMMAND_CAPACITY: usize = 16;

/// Assembles a conversation controller from its configuration and the
/// services it drives, then spawns it on the current tokio runtime.
pub struct ConversationBuilder {
    config: ConversationConfig,
    audio: Option<Arc<dyn AudioBackend>>,
    tokens: Option<Arc<dyn TokenProvider>>,
    connector: Arc<dyn LiveConnector>,
    authorization: Arc<dyn StartAuthorization>,
    usage: Arc<dyn UsageSink>,
    errors: Arc<dyn ErrorSink>,
}

impl Default for ConversationBuilder {
    fn default() -> Self {
        Self::new(ConversationConfig::default())
    }
}

impl ConversationBuilder {
    pub fn new(config: ConversationConfig) -> Self {
        Self {
            config,
            audio: None,
            tokens: None,
            connector: Arc::new(WebSocketConnector::default()),
            authorization: Arc::new(AllowAll),
            usage: Arc::new(LogUsage),
            errors: Arc::new(LogErrors),
        }
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    pub fn audio_backend(mut self, backend: impl AudioBackend + 'static) -> Self {
        self.audio = Some(Arc::new(backend));
        self
    }

    pub fn token_provider(mut self, provider: impl TokenProvider + 'static) -> Self {
        self.tokens = Some(Arc::new(provider));
        self
    }

    pub fn connector(mut self, connector: impl LiveConnector + 'static) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Check run before each start; a `false` refuses the start quietly.
    pub fn authorize_with(mut self, check: impl StartAuthorization + 'static) -> Self {
        self.authorization = Arc::new(check);
        self
    }

    pub fn on_usage(mut self, sink: impl UsageSink + 'static) -> Self {
        self.usage = Arc::new(sink);
        self
    }

    pub fn on_error(mut self, sink: impl ErrorSink + 'static) -> Self {
        self.errors = Arc::new(sink);
        self
    }

    /// Validates the configuration and spawns the controller task.
    ///
    /// Without an explicit token provider, `token_endpoint` from the config
    /// is used. Without an explicit audio backend, the `device-audio` feature
    /// supplies the default devices.
    pub fn spawn(self) -> Result<ConversationHandle, ConversationError> {
        self.config.validate()?;

        let tokens = match (self.tokens, self.config.token_endpoint.as_deref()) {
            (Some(tokens), _) => tokens,
            (None, Some(endpoint)) => Arc::new(HttpTokenProvider::new(endpoint)),
            (None, None) => {
                return Err(ConversationError::Config(
                    "no token provider or token endpoint configured".to_string(),
                ));
            }
        };
        let audio = match self.audio {
            Some(audio) => audio,
            None => default_audio_backend()?,
        };

        let services = Services {
            audio,
            tokens,
            connector: self.connector,
            authorization: self.authorization,
            usage: self.usage,
            errors: self.errors,
        };

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (playing_tx, playing_rx) = watch::channel(false);

        let controller = ConversationController::new(self.config, services, state_tx, playing_tx);
        let task = tokio::spawn(controller.run(command_rx, shutdown_rx));

        Ok(ConversationHandle {
            commands: command_tx,
            shutdown_tx: Arc::new(TokioMutex::new(Some(shutdown_tx))),
            controller_task: Arc::new(TokioMutex::new(Some(task))),
            state_rx,
            playing_rx,
        })
    }
}

#[cfg(feature = "device-audio")]
fn default_audio_backend() -> Result<Arc<dyn AudioBackend>, ConversationError> {
    Ok(Arc::new(crate::audio::device::CpalAudioBackend::new()))
}

#[cfg(not(feature = "device-audio"))]
fn default_audio_backend() -> Result<Arc<dyn AudioBackend>, ConversationError> {
    Err(ConversationError::Config(
        "no audio backend configured; enable the `device-audio` feature or call audio_backend()"
            .to_string(),
    ))
}
