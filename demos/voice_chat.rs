// demos/voice_chat.rs
//
// Talks to the model through the default microphone and speakers until
// Ctrl-C or the session limit. Needs GEMINI_LIVE_TOKEN_ENDPOINT pointing at a
// service that mints ephemeral tokens.
use gemini_live_conversation::audio::device::CpalAudioBackend;
use gemini_live_conversation::{
    ConversationBuilder, ConversationConfig, ConversationContext, SessionState, StartOutcome,
    StopReason,
};
use std::env;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    info!("App start. Logger initialized.");

    dotenv::dotenv().ok();
    let config = ConversationConfig::from_env()?;
    if config.token_endpoint.is_none() {
        anyhow::bail!("GEMINI_LIVE_TOKEN_ENDPOINT not set");
    }
    let question = env::args()
        .nth(1)
        .unwrap_or_else(|| "Can you help me practise ordering food in Spanish?".to_string());

    let handle = ConversationBuilder::new(config)
        .audio_backend(CpalAudioBackend::new())
        .on_usage(|secs: u64| info!("[Main] Conversation used {}s.", secs))
        .on_error(|message: &str| error!("[Main] {}", message))
        .spawn()?;

    let mut context = ConversationContext::new(question);
    if let Ok(title) = env::var("GEMINI_LIVE_VIDEO_TITLE") {
        context = context.video_title(title);
    }
    match handle.start_conversation(context).await? {
        StartOutcome::Started => info!("[Main] Connecting... speak once recording starts."),
        other => {
            warn!("[Main] Conversation not started: {:?}", other);
            return Ok(());
        }
    }

    let mut state_rx = handle.subscribe_state();
    let mut playing_rx = handle.subscribe_playing();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("[Main] Ctrl-C received, stopping.");
                handle.stop(StopReason::UserClose).await?;
                break;
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                info!("[Main] State: {:?}", state);
                if state == SessionState::Idle {
                    break;
                }
            }
            changed = playing_rx.changed() => {
                if changed.is_ok() && *playing_rx.borrow_and_update() {
                    info!("[Main] Model speaking...");
                }
            }
        }
    }

    handle.close().await?;
    info!("[Main] Done.");
    Ok(())
}
