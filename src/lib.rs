pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod types;

pub use client::{
    ConversationBuilder, ConversationContext, ConversationHandle, SessionState, StartOutcome,
    StopReason,
};
pub use config::ConversationConfig;
pub use error::ConversationError;
