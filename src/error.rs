use thiserror::Error;

/// Errors produced by the conversation pipeline.
///
/// Block- and frame-level variants (`MalformedBlock`, `MalformedFrame`,
/// `InvalidSampleRate`) are absorbed where they occur. Lifecycle variants
/// end the current conversation attempt and are reported to the error sink.
#[derive(Error, Debug)]
pub enum ConversationError {
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Audio processing module failed to load: {0}")]
    ModuleLoadFailure(String),

    #[error("Malformed audio frame: {0}")]
    MalformedFrame(String),

    #[error("Malformed audio block: {0}")]
    MalformedBlock(String),

    #[error("Invalid sample rate conversion {from}Hz -> {to}Hz")]
    InvalidSampleRate { from: u32, to: u32 },

    #[error("Remote session error: {0}")]
    RemoteError(String),

    #[error("Remote session closed: {0}")]
    RemoteClose(String),

    #[error("Session already closed")]
    AlreadyClosed,

    #[error("Audio graph is closed")]
    GraphClosed,

    #[error("Failed to send message to connection task")]
    SendError,

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_human_readable() {
        let e = ConversationError::InvalidSampleRate { from: 1, to: 16000 };
        assert_eq!(e.to_string(), "Invalid sample rate conversion 1Hz -> 16000Hz");
        assert_eq!(
            ConversationError::ServiceUnavailable("token endpoint returned 503".into())
                .to_string(),
            "Service unavailable: token endpoint returned 503"
        );
    }
}
