use std::env;

use anyhow::{Context, Result};
use edison_collab_client::{ChangeEvent, LifecycleEvent, SessionClient, SessionConfig, WebSocketTransport};

/// A minimal headless client: connects to a note, logs remote changes and
/// lifecycle events, and keeps the connection alive. Exercises the library
/// end to end; embedding applications are expected to depend on the
/// `edison_collab_client` library target directly rather than this binary.
#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let url = env::var("EDISON_NOTE_URL").context("EDISON_NOTE_URL must be set (e.g. wss://host/socket)")?;
    url::Url::parse(&url).context("EDISON_NOTE_URL is not a valid URL")?;
    let session_cookie = env::var("EDISON_SESSION_COOKIE").context("EDISON_SESSION_COOKIE must be set")?;

    let mut transport = WebSocketTransport::new(url.clone(), session_cookie);
    transport.connect().await.context("failed to connect")?;

    let session = SessionClient::new(Box::new(transport), SessionConfig::default());
    session.set_logged_in(true).await;

    let mut changes = session.subscribe_changes();
    let mut lifecycle = session.subscribe_lifecycle();

    tokio::spawn({
        let session = session.clone();
        async move {
            if let Err(err) = session.run().await {
                log::error!("session loop ended: {err}");
            }
        }
    });

    tokio::spawn(async move {
        while let Ok(event) = lifecycle.recv().await {
            match event {
                LifecycleEvent::Ready => log::info!("document ready"),
                LifecycleEvent::ReconnectAttemptFailed { attempt } => {
                    log::warn!("reconnect attempt {attempt} failed")
                }
                LifecycleEvent::ReconnectReplaying => log::info!("reconnected, replaying pending operations"),
                LifecycleEvent::ReconnectFailed { attempts } => {
                    log::error!("reconnect gave up after {attempts} attempts")
                }
                LifecycleEvent::Deleted => log::warn!("note was deleted"),
                LifecycleEvent::Error(message) => log::error!("session error: {message}"),
                LifecycleEvent::OperationTimeout { ms } => {
                    log::warn!("no ack received within {ms}ms for the outstanding operation")
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Ok(event) = changes.recv().await {
            if let ChangeEvent::Remote { operation, user_id } = event {
                log::debug!(
                    "remote edit from {}: {} atoms",
                    user_id.as_deref().unwrap_or("unknown"),
                    operation.atoms().len()
                );
            }
        }
    });

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    log::info!("shutting down");
    Ok(())
}
