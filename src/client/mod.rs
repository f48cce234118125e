pub mod audio_input_pipeline;
pub mod builder;
pub mod connection;
pub mod handle;
pub mod hooks;
pub mod prompt;
pub mod token;

mod controller;

pub use audio_input_pipeline::{AudioInputProcessor, NodeStats};
pub use builder::ConversationBuilder;
pub use connection::{LiveConnector, LiveSession, SessionEvent, WebSocketConnector};
pub use controller::{SessionState, StartOutcome, StopReason};
pub use handle::ConversationHandle;
pub use hooks::{ErrorSink, StartAuthorization, UsageSink};
pub use prompt::ConversationContext;
pub use token::{AuthToken, HttpTokenProvider, TokenProvider};

/// Sample rate (16kHz) Gemini accepts for audio sent to the Gemini API.
pub(crate) const GEMINI_AUDIO_SAMPLE_RATE_HZ_ACCEPTED_INPUT: u32 = 16000;
/// Sample rate (24kHz) of the audio Gemini sends back.
pub(crate) const GEMINI_AUDIO_SAMPLE_RATE_HZ_OUTPUT: u32 = 24000;
