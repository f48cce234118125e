use crate::audio::processor::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, ProcessorKind};
use crate::client::{
    GEMINI_AUDIO_SAMPLE_RATE_HZ_ACCEPTED_INPUT, GEMINI_AUDIO_SAMPLE_RATE_HZ_OUTPUT,
};
use crate::error::ConversationError;
use serde::Deserialize;
use std::env;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-preview-native-audio-dialog";
pub const DEFAULT_SESSION_LIMIT_SECS: u64 = 600;
pub const DEFAULT_PLAYING_INDICATOR_QUIET_MS: u64 = 1200;
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 4000;
pub const DEFAULT_FRAME_SINK_CAPACITY: usize = 32;

/// Tunables for a conversation controller.
///
/// Deserializes from any serde source with every field optional, and can be
/// read from `GEMINI_LIVE_*` environment variables with [`from_env`].
///
/// [`from_env`]: ConversationConfig::from_env
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ConversationConfig {
    pub model: String,
    /// URL answering `GET` with `{ "token": "..." }`.
    pub token_endpoint: Option<String>,
    pub session_limit_secs: u64,
    pub playing_indicator_quiet_ms: u64,
    pub block_size: usize,
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub processor: ProcessorKind,
    pub voice_name: Option<String>,
    pub language_code: Option<String>,
    pub system_instruction: Option<String>,
    pub max_context_chars: usize,
    pub frame_sink_capacity: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            token_endpoint: None,
            session_limit_secs: DEFAULT_SESSION_LIMIT_SECS,
            playing_indicator_quiet_ms: DEFAULT_PLAYING_INDICATOR_QUIET_MS,
            block_size: crate::client::audio_input_pipeline::DEFAULT_BLOCK_SIZE,
            capture_sample_rate: GEMINI_AUDIO_SAMPLE_RATE_HZ_ACCEPTED_INPUT,
            playback_sample_rate: GEMINI_AUDIO_SAMPLE_RATE_HZ_OUTPUT,
            processor: ProcessorKind::default(),
            voice_name: None,
            language_code: None,
            system_instruction: None,
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
            frame_sink_capacity: DEFAULT_FRAME_SINK_CAPACITY,
        }
    }
}

impl ConversationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by any `GEMINI_LIVE_*` variables that are set.
    pub fn from_env() -> Result<Self, ConversationError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConversationError> {
        let mut config = Self::default();
        if let Some(model) = lookup("GEMINI_LIVE_MODEL") {
            config.model = model;
        }
        if let Some(endpoint) = lookup("GEMINI_LIVE_TOKEN_ENDPOINT") {
            config.token_endpoint = Some(endpoint);
        }
        if let Some(v) = lookup("GEMINI_LIVE_SESSION_LIMIT_SECS") {
            config.session_limit_secs = parse_var("GEMINI_LIVE_SESSION_LIMIT_SECS", &v)?;
        }
        if let Some(v) = lookup("GEMINI_LIVE_PLAYING_QUIET_MS") {
            config.playing_indicator_quiet_ms = parse_var("GEMINI_LIVE_PLAYING_QUIET_MS", &v)?;
        }
        if let Some(v) = lookup("GEMINI_LIVE_BLOCK_SIZE") {
            config.block_size = parse_var("GEMINI_LIVE_BLOCK_SIZE", &v)?;
        }
        if let Some(v) = lookup("GEMINI_LIVE_PROCESSOR") {
            config.processor = match v.trim() {
                "script" => ProcessorKind::Script,
                "worklet" => ProcessorKind::Worklet,
                other => {
                    return Err(ConversationError::Config(format!(
                        "GEMINI_LIVE_PROCESSOR: unknown processor '{}'",
                        other
                    )));
                }
            };
        }
        if let Some(voice) = lookup("GEMINI_LIVE_VOICE") {
            config.voice_name = Some(voice);
        }
        if let Some(code) = lookup("GEMINI_LIVE_LANGUAGE") {
            config.language_code = Some(code);
        }
        if let Some(v) = lookup("GEMINI_LIVE_MAX_CONTEXT_CHARS") {
            config.max_context_chars = parse_var("GEMINI_LIVE_MAX_CONTEXT_CHARS", &v)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = Some(endpoint.into());
        self
    }

    pub fn session_limit(mut self, limit: Duration) -> Self {
        self.session_limit_secs = limit.as_secs();
        self
    }

    pub fn playing_indicator_quiet_period(mut self, period: Duration) -> Self {
        self.playing_indicator_quiet_ms = period.as_millis() as u64;
        self
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn processor(mut self, processor: ProcessorKind) -> Self {
        self.processor = processor;
        self
    }

    pub fn voice_name(mut self, voice: impl Into<String>) -> Self {
        self.voice_name = Some(voice.into());
        self
    }

    pub fn language_code(mut self, code: impl Into<String>) -> Self {
        self.language_code = Some(code.into());
        self
    }

    pub fn system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn max_context_chars(mut self, chars: usize) -> Self {
        self.max_context_chars = chars;
        self
    }

    pub fn frame_sink_capacity(mut self, capacity: usize) -> Self {
        self.frame_sink_capacity = capacity;
        self
    }

    pub fn session_limit_duration(&self) -> Duration {
        Duration::from_secs(self.session_limit_secs)
    }

    pub fn playing_indicator_quiet_duration(&self) -> Duration {
        Duration::from_millis(self.playing_indicator_quiet_ms)
    }

    /// Checks values that would otherwise only fail mid-conversation.
    ///
    /// The block size is left to the processing node, which reports a bad
    /// size as a module load failure when a conversation opens.
    pub fn validate(&self) -> Result<(), ConversationError> {
        if self.model.trim().is_empty() {
            return Err(ConversationError::Config("model must not be empty".into()));
        }
        if self.session_limit_secs == 0 {
            return Err(ConversationError::Config(
                "session limit must be at least one second".into(),
            ));
        }
        if self.capture_sample_rate == 0 || self.playback_sample_rate == 0 {
            return Err(ConversationError::Config(
                "sample rates must be non-zero".into(),
            ));
        }
        if self.frame_sink_capacity == 0 {
            return Err(ConversationError::Config(
                "frame sink capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn block_size_in_range(&self) -> bool {
        self.block_size.is_power_of_two()
            && (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConversationError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConversationError::Config(format!("{}: {}", key, e)))
}
