//! Callbacks the controller makes into the host application.

use tracing::{error, info};

/// Quota or entitlement check run before anything is acquired.
pub trait StartAuthorization: Send + Sync {
    fn can_start(&self) -> bool;
}

impl<F> StartAuthorization for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn can_start(&self) -> bool {
        self()
    }
}

/// Receives the elapsed whole seconds of each completed conversation.
pub trait UsageSink: Send + Sync {
    fn record_usage(&self, elapsed_secs: u64);
}

impl<F> UsageSink for F
where
    F: Fn(u64) + Send + Sync,
{
    fn record_usage(&self, elapsed_secs: u64) {
        self(elapsed_secs)
    }
}

/// Receives a human-readable message for each failed attempt.
pub trait ErrorSink: Send + Sync {
    fn report(&self, message: &str);
}

impl<F> ErrorSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn report(&self, message: &str) {
        self(message)
    }
}

pub(crate) struct AllowAll;

impl StartAuthorization for AllowAll {
    fn can_start(&self) -> bool {
        true
    }
}

pub(crate) struct LogUsage;

impl UsageSink for LogUsage {
    fn record_usage(&self, elapsed_secs: u64) {
        info!("[Usage] Conversation lasted {}s.", elapsed_secs);
    }
}

pub(crate) struct LogErrors;

impl ErrorSink for LogErrors {
    fn report(&self, message: &str) {
        error!("[Conversation] {}", message);
    }
}
