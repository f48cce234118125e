use super::controller::{Command, SessionState, StartOutcome, StopReason};
use super::prompt::ConversationContext;
use crate::error::ConversationError;
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Cheap, cloneable handle to a running conversation controller.
///
/// All methods talk to the controller task; state is observed through watch
/// channels so reads never wait on a transition in progress.
#[derive(Clone)]
pub struct ConversationHandle {
    pub(crate) commands: mpsc::Sender<Command>,
    pub(crate) shutdown_tx: Arc<TokioMutex<Option<oneshot::Sender<()>>>>,
    pub(crate) controller_task: Arc<TokioMutex<Option<JoinHandle<()>>>>,
    pub(crate) state_rx: watch::Receiver<SessionState>,
    pub(crate) playing_rx: watch::Receiver<bool>,
}

impl ConversationHandle {
    /// Requests a new conversation about `context`.
    ///
    /// Returns once the request is accepted or refused; the connection
    /// continues in the background. Watch [`state`](Self::state) or
    /// [`wait_for_state`](Self::wait_for_state) for `Recording`.
    pub async fn start_conversation(
        &self,
        context: ConversationContext,
    ) -> Result<StartOutcome, ConversationError> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Start { context, reply })
            .await
            .map_err(|_| ConversationError::SendError)?;
        reply_rx.await.map_err(|_| ConversationError::SendError)
    }

    /// Stops the current conversation and resolves once teardown has
    /// finished. Stopping an idle controller is a no-op.
    pub async fn stop(&self, reason: StopReason) -> Result<(), ConversationError> {
        let (done, done_rx) = oneshot::channel();
        self.commands
            .send(Command::Stop { reason, done })
            .await
            .map_err(|_| ConversationError::SendError)?;
        done_rx.await.map_err(|_| ConversationError::SendError)
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn is_playing_audio(&self) -> bool {
        *self.playing_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn subscribe_playing(&self) -> watch::Receiver<bool> {
        self.playing_rx.clone()
    }

    pub async fn wait_for_state(&self, target: SessionState) -> Result<(), ConversationError> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| ConversationError::SendError)
    }

    /// Tears down any active conversation and shuts the controller down.
    /// Every clone of the handle is unusable afterwards.
    pub async fn close(&self) -> Result<(), ConversationError> {
        info!("[ConversationHandle] Close requested.");
        let mut shutdown_tx_guard = self.shutdown_tx.lock().await;
        if let Some(tx) = shutdown_tx_guard.take() {
            if tx.send(()).is_err() {
                info!("[ConversationHandle] Shutdown signal failed: controller already gone.");
            } else {
                info!("[ConversationHandle] Shutdown signal sent to controller.");
            }
        }
        drop(shutdown_tx_guard);

        if let Some(task) = self.controller_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("[ConversationHandle] Controller task ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}

impl Drop for ConversationHandle {
    fn drop(&mut self) {
        // Only the last clone signals; the controller outlives shared handles.
        if Arc::strong_count(&self.shutdown_tx) != 1 {
            return;
        }
        if let Ok(mut guard) = self.shutdown_tx.try_lock() {
            if let Some(tx) = guard.take() {
                warn!("[ConversationHandle] Dropped without explicit close(). Signalling shutdown.");
                if tx.send(()).is_err() {
                    info!("[ConversationHandle] Drop: controller already gone.");
                }
            }
        } else {
            warn!("[ConversationHandle] Dropped without explicit close(). Could not acquire shutdown lock.");
        }
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::sync::Once;
    use tracing::Level;
    use tracing_subscriber::EnvFilter;

    pub(crate) fn init_test_logger() {
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

    pub(crate) fn setup_test() {
        init_test_logger();
    }
}
